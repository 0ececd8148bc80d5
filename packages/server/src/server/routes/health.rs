//! Liveness and readiness probes.

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    database: DatabaseHealth,
    connection_pool: ConnectionPoolHealth,
}

#[derive(Serialize)]
pub struct DatabaseHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
pub struct ConnectionPoolHealth {
    size: u32,
    idle_connections: usize,
}

/// Liveness: database connectivity plus pool utilization.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let database = match tokio::time::timeout(
        std::time::Duration::from_secs(5),
        sqlx::query("SELECT 1").execute(&state.pool),
    )
    .await
    {
        Ok(Ok(_)) => DatabaseHealth {
            status: "ok".to_string(),
            error: None,
        },
        Ok(Err(e)) => DatabaseHealth {
            status: "error".to_string(),
            error: Some(format!("query failed: {e}")),
        },
        Err(_) => DatabaseHealth {
            status: "error".to_string(),
            error: Some("query timeout (>5s)".to_string()),
        },
    };

    let connection_pool = ConnectionPoolHealth {
        size: state.pool.size(),
        idle_connections: state.pool.num_idle(),
    };

    let healthy = database.status == "ok";
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            database,
            connection_pool,
        }),
    )
}

#[derive(Serialize)]
pub struct ReadyResponse {
    ready: bool,
    queue: crate::kernel::queue::QueueHealth,
    lifecycle: crate::domains::lifecycle::LifecycleMetricsSnapshot,
    streaming: StreamingState,
}

#[derive(Serialize)]
pub struct StreamingState {
    enabled: bool,
}

/// Readiness: queue health feeds the verdict; lifecycle counters and the
/// streaming feature state ride along for operators.
pub async fn ready_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<ReadyResponse>) {
    let queue = state.queue.health();
    let ready = queue.ready;
    let response = ReadyResponse {
        ready,
        queue,
        lifecycle: state.lifecycle.metrics().snapshot(),
        streaming: StreamingState {
            enabled: state.streaming_enabled(),
        },
    };
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(response))
}
