//! Subprocess interpreter sandbox.
//!
//! The bundle entry runs under an external interpreter; parent and child speak
//! a length-prefixed JSON protocol over stdio (4-byte big-endian length, then
//! one JSON frame). Cancellation propagates SIGINT first and SIGKILL after a
//! grace period.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{LogBuffer, ResourceUsage, RunContext, SandboxExecutor, SandboxJob, Telemetry};
use crate::common::error::{CoreError, CoreResult};

/// Wire frames exchanged with the interpreter child.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolFrame {
    /// Parent → child: begin execution.
    Start {
        entry: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        export: Option<String>,
        parameters: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Child → parent: log line.
    Log {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        meta: Option<serde_json::Value>,
    },
    /// Child → parent: liveness signal.
    Heartbeat,
    /// Child → parent: run-row patch request.
    Update { patch: serde_json::Value },
    /// Child → parent: success.
    Result { value: serde_json::Value },
    /// Child → parent: failure.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        properties: Option<serde_json::Value>,
    },
}

const MAX_FRAME_BYTES: u32 = 8 * 1024 * 1024;

/// Write one frame: 4-byte big-endian length prefix, then the JSON body.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &ProtocolFrame,
) -> CoreResult<()> {
    let body = serde_json::to_vec(frame)?;
    let len = body.len() as u32;
    if len > MAX_FRAME_BYTES {
        return Err(CoreError::validation("protocol frame too large"));
    }
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| CoreError::execution(format!("frame write: {e}")))?;
    writer
        .write_all(&body)
        .await
        .map_err(|e| CoreError::execution(format!("frame write: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| CoreError::execution(format!("frame flush: {e}")))?;
    Ok(())
}

/// Read one frame; `Ok(None)` on clean EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> CoreResult<Option<ProtocolFrame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CoreError::execution(format!("frame read: {e}"))),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(CoreError::validation("protocol frame too large"));
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| CoreError::execution(format!("frame body: {e}")))?;
    let frame = serde_json::from_slice(&body)
        .map_err(|e| CoreError::execution(format!("malformed protocol frame: {e}")))?;
    Ok(Some(frame))
}

pub struct InterpreterSandbox {
    interpreter_bin: String,
    kill_grace: Duration,
}

impl InterpreterSandbox {
    pub fn new(interpreter_bin: impl Into<String>) -> Self {
        Self {
            interpreter_bin: interpreter_bin.into(),
            kill_grace: Duration::from_secs(5),
        }
    }

    /// Interrupt then kill the child after the grace period.
    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                warn!(pid, error = %e, "SIGINT delivery failed");
            }
            let graceful = tokio::time::timeout(self.kill_grace, child.wait()).await;
            if graceful.is_ok() {
                return;
            }
            debug!(pid, "grace expired, killing interpreter");
        }
        let _ = child.kill().await;
    }
}

#[async_trait]
impl SandboxExecutor for InterpreterSandbox {
    async fn execute(&self, job: SandboxJob, ctx: Arc<dyn RunContext>) -> CoreResult<Telemetry> {
        let bundle_dir = job
            .bundle_dir
            .clone()
            .ok_or_else(|| CoreError::validation("interpreter sandbox requires a bundle"))?;
        let entry = if job.manifest.entry.is_empty() {
            "main.py".to_string()
        } else {
            job.manifest.entry.clone()
        };
        let entry_path = bundle_dir.join(&entry);
        if !entry_path.exists() {
            return Err(
                CoreError::execution(format!("bundle entry missing: {entry}"))
                    .with_property("code", serde_json::json!("asset_missing")),
            );
        }

        let mut child = Command::new(&self.interpreter_bin)
            .arg(&entry_path)
            .current_dir(&bundle_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CoreError::unavailable(format!("spawn {}: {e}", self.interpreter_bin))
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            CoreError::execution("interpreter stdin unavailable")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            CoreError::execution("interpreter stdout unavailable")
        })?;
        let stderr = child.stderr.take();

        let logs = LogBuffer::default();

        // Mirror stderr into the log buffer.
        if let Some(stderr) = stderr {
            let stderr_logs = logs.clone();
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    stderr_logs.push(line, Some(serde_json::json!({"stream": "stderr"})));
                }
            });
        }

        write_frame(
            &mut stdin,
            &ProtocolFrame::Start {
                entry,
                export: job.export.clone(),
                parameters: job.parameters.clone(),
                timeout_ms: job.timeout.map(|t| t.as_millis() as u64),
            },
        )
        .await?;

        let started = Instant::now();
        let mut reader = BufReader::new(stdout);
        let deadline = job.timeout.map(|t| started + t);

        let outcome: CoreResult<Option<serde_json::Value>> = loop {
            let next_frame = read_frame(&mut reader);
            let frame = if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::select! {
                    frame = next_frame => frame,
                    _ = tokio::time::sleep(remaining) => {
                        self.terminate(&mut child).await;
                        break Err(CoreError::timeout(format!(
                            "interpreter exceeded {}ms wall clock",
                            job.timeout.map(|t| t.as_millis()).unwrap_or_default()
                        )));
                    }
                    _ = job.cancel.cancelled() => {
                        self.terminate(&mut child).await;
                        break Err(CoreError::cancelled("run canceled"));
                    }
                }
            } else {
                tokio::select! {
                    frame = next_frame => frame,
                    _ = job.cancel.cancelled() => {
                        self.terminate(&mut child).await;
                        break Err(CoreError::cancelled("run canceled"));
                    }
                }
            };

            match frame {
                Ok(Some(ProtocolFrame::Log { message, meta })) => {
                    logs.push(message, meta);
                }
                Ok(Some(ProtocolFrame::Heartbeat)) => {
                    let _ = ctx.heartbeat().await;
                }
                Ok(Some(ProtocolFrame::Update { patch })) => {
                    let _ = ctx.update(patch).await;
                }
                Ok(Some(ProtocolFrame::Result { value })) => break Ok(Some(value)),
                Ok(Some(ProtocolFrame::Error {
                    message,
                    properties,
                })) => {
                    let mut err = CoreError::execution(message);
                    if let Some(serde_json::Value::Object(map)) = properties {
                        for (k, v) in map {
                            err = err.with_property(k, v);
                        }
                    }
                    break Err(err);
                }
                Ok(Some(ProtocolFrame::Start { .. })) => {
                    break Err(CoreError::execution("unexpected start frame from child"));
                }
                Ok(None) => {
                    // Child exited without a result frame.
                    let status = child.wait().await.ok();
                    break Err(CoreError::execution(format!(
                        "interpreter exited without result ({})",
                        status
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "unknown status".to_string())
                    )));
                }
                Err(e) => {
                    self.terminate(&mut child).await;
                    break Err(e);
                }
            }
        };

        // Reap the child; ignore failures after a terminal outcome.
        let exit = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
        if exit.is_err() {
            self.terminate(&mut child).await;
        }

        let wall_ms = started.elapsed().as_millis() as u64;
        let (entries, truncated) = logs.drain();

        outcome.map(|value| Telemetry {
            task_id: job.run_id,
            duration_ms: wall_ms,
            logs: entries,
            truncated_log_count: truncated,
            resource_usage: ResourceUsage {
                wall_ms,
                cpu_ms: None,
                max_rss_bytes: None,
            },
            result: value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::ErrorKind;

    #[tokio::test]
    async fn frames_round_trip_with_length_prefix() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let frame = ProtocolFrame::Start {
            entry: "main.py".to_string(),
            export: Some("run".to_string()),
            parameters: serde_json::json!({"x": 1}),
            timeout_ms: Some(1000),
        };
        write_frame(&mut client, &frame).await.unwrap();
        let read = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(read, frame);
    }

    #[tokio::test]
    async fn eof_reads_as_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn result_and_error_frames_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_frame(
            &mut client,
            &ProtocolFrame::Result {
                value: serde_json::json!({"rows": 3}),
            },
        )
        .await
        .unwrap();
        write_frame(
            &mut client,
            &ProtocolFrame::Error {
                message: "boom".to_string(),
                properties: Some(serde_json::json!({"code": "asset_missing"})),
            },
        )
        .await
        .unwrap();

        assert!(matches!(
            read_frame(&mut server).await.unwrap().unwrap(),
            ProtocolFrame::Result { .. }
        ));
        match read_frame(&mut server).await.unwrap().unwrap() {
            ProtocolFrame::Error { message, properties } => {
                assert_eq!(message, "boom");
                assert_eq!(properties.unwrap()["code"], "asset_missing");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // Hand-write a bogus length prefix.
        client
            .write_all(&(MAX_FRAME_BYTES + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }
}
