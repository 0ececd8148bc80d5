//! SQL endpoints.
//!
//! The read endpoint accepts exactly one SELECT/WITH statement, rewrites
//! dataset-slug identifiers to backend-qualified table names (resolved
//! through an in-process cache invalidated on manifest publish), and streams
//! results as JSON, CSV, or plain text. The exec endpoint runs arbitrary
//! statements against the relational side under its own authorization.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use sqlparser::ast::{
    Ident, ObjectName, Query, SetExpr, Statement, TableFactor,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use crate::common::error::{CoreError, CoreResult};
use crate::domains::datasets::Dataset;
use crate::kernel::invalidation::InvalidationBus;

// ============================================================================
// Name cache
// ============================================================================

/// Backend-qualified table name for a dataset slug.
pub fn qualified_table(slug: &str) -> String {
    format!("timestore.ds_{}", slug.replace('-', "_"))
}

/// Slug → qualified-name cache, invalidated on manifest publish.
#[derive(Default)]
pub struct SqlNameCache {
    entries: Mutex<HashMap<String, (Uuid, String)>>,
}

impl SqlNameCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(self: &Arc<Self>, bus: &InvalidationBus) {
        let cache = self.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                cache
                    .entries
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|_, (dataset_id, _)| *dataset_id != event.dataset_id);
            }
        });
    }

    pub async fn resolve(&self, slug: &str, pool: &PgPool) -> CoreResult<Option<String>> {
        if let Some((_, name)) = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(slug)
        {
            return Ok(Some(name.clone()));
        }
        let Some(dataset) = Dataset::find_by_slug(slug, pool).await? else {
            return Ok(None);
        };
        let name = qualified_table(slug);
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(slug.to_string(), (dataset.id, name.clone()));
        Ok(Some(name))
    }
}

// ============================================================================
// Statement guard + rewrite
// ============================================================================

/// Parse and admit exactly one SELECT/WITH statement.
pub fn guard_read_statement(sql: &str) -> CoreResult<Statement> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| CoreError::validation(format!("SQL parse error: {e}")))?;
    match statements.len() {
        0 => Err(CoreError::validation("empty SQL statement")),
        1 => {
            let statement = statements.into_iter().next().unwrap_or_else(|| {
                unreachable!("length checked above")
            });
            match &statement {
                Statement::Query(_) => Ok(statement),
                _ => Err(CoreError::validation(
                    "only SELECT/WITH statements are accepted",
                )),
            }
        }
        _ => Err(CoreError::validation(
            "statement separators are not allowed",
        )),
    }
}

fn walk_query<F>(query: &mut Query, cte_names: &mut HashSet<String>, visit: &mut F)
where
    F: FnMut(&mut ObjectName, &HashSet<String>),
{
    if let Some(with) = &mut query.with {
        for cte in &mut with.cte_tables {
            cte_names.insert(cte.alias.name.value.clone());
            walk_query(&mut cte.query, cte_names, visit);
        }
    }
    walk_set_expr(&mut query.body, cte_names, visit);
}

fn walk_set_expr<F>(body: &mut SetExpr, cte_names: &mut HashSet<String>, visit: &mut F)
where
    F: FnMut(&mut ObjectName, &HashSet<String>),
{
    match body {
        SetExpr::Select(select) => {
            for table in &mut select.from {
                walk_table_factor(&mut table.relation, cte_names, visit);
                for join in &mut table.joins {
                    walk_table_factor(&mut join.relation, cte_names, visit);
                }
            }
        }
        SetExpr::Query(query) => walk_query(query, cte_names, visit),
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr(left, cte_names, visit);
            walk_set_expr(right, cte_names, visit);
        }
        _ => {}
    }
}

fn walk_table_factor<F>(factor: &mut TableFactor, cte_names: &mut HashSet<String>, visit: &mut F)
where
    F: FnMut(&mut ObjectName, &HashSet<String>),
{
    match factor {
        TableFactor::Table { name, .. } => visit(name, cte_names),
        TableFactor::Derived { subquery, .. } => walk_query(subquery, cte_names, visit),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            walk_table_factor(&mut table_with_joins.relation, cte_names, visit);
            for join in &mut table_with_joins.joins {
                walk_table_factor(&mut join.relation, cte_names, visit);
            }
        }
        _ => {}
    }
}

/// Bare single-part table identifiers referenced by the statement, minus CTE
/// names. These are the dataset-slug candidates.
pub fn collect_table_candidates(statement: &Statement) -> Vec<String> {
    let mut statement = statement.clone();
    let mut candidates = Vec::new();
    if let Statement::Query(query) = &mut statement {
        let mut cte_names = HashSet::new();
        walk_query(query, &mut cte_names, &mut |name, ctes| {
            if name.0.len() == 1 {
                let ident = name.0[0].value.clone();
                if !ctes.contains(&ident) && !candidates.contains(&ident) {
                    candidates.push(ident);
                }
            }
        });
    }
    candidates
}

/// Rewrite resolved dataset identifiers in place and return the SQL text.
pub fn rewrite_statement(
    statement: &Statement,
    resolved: &HashMap<String, String>,
) -> CoreResult<String> {
    let mut statement = statement.clone();
    if let Statement::Query(query) = &mut statement {
        let mut cte_names = HashSet::new();
        walk_query(query, &mut cte_names, &mut |name, ctes| {
            if name.0.len() == 1 {
                let ident = name.0[0].value.clone();
                if ctes.contains(&ident) {
                    return;
                }
                if let Some(qualified) = resolved.get(&ident) {
                    name.0 = qualified
                        .split('.')
                        .map(Ident::new)
                        .collect();
                }
            }
        });
    }
    Ok(statement.to_string())
}

// ============================================================================
// Result rendering
// ============================================================================

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn cell_text(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Render rows as CSV with a header line.
pub fn render_csv(columns: &[String], rows: &[serde_json::Value]) -> String {
    let mut out = String::new();
    out.push_str(
        &columns
            .iter()
            .map(|c| csv_escape(c))
            .collect::<Vec<_>>()
            .join(","),
    );
    out.push('\n');
    for row in rows {
        let line = columns
            .iter()
            .map(|c| csv_escape(&cell_text(row.get(c))))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Render rows as aligned plain text.
pub fn render_text(columns: &[String], rows: &[serde_json::Value]) -> String {
    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let text = cell_text(row.get(c));
                    widths[i] = widths[i].max(text.len());
                    text
                })
                .collect()
        })
        .collect();

    let mut out = String::new();
    for (i, column) in columns.iter().enumerate() {
        out.push_str(&format!("{:width$}  ", column, width = widths[i]));
    }
    out.push('\n');
    for row in cells {
        for (i, cell) in row.iter().enumerate() {
            out.push_str(&format!("{:width$}  ", cell, width = widths[i]));
        }
        out.push('\n');
    }
    out
}

// ============================================================================
// Exec
// ============================================================================

/// Outcome of an exec statement.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecOutcome {
    Rows {
        rows: Vec<serde_json::Value>,
        truncated: bool,
    },
    Command {
        rows_affected: u64,
    },
}

pub const EXEC_ROW_CAP: i64 = 5_000;

/// Run a read statement against the relational side inside a transaction,
/// honoring the caller's statement timeout.
pub async fn relational_read(
    pool: &PgPool,
    sql: &str,
    timeout_seconds: Option<u32>,
) -> CoreResult<(Vec<serde_json::Value>, bool)> {
    let wrapped = format!(
        "SELECT COALESCE(json_agg(row_to_json(q)), '[]'::json) AS rows \
         FROM (SELECT * FROM ({sql}) inner_q LIMIT {cap}) q",
        cap = EXEC_ROW_CAP + 1
    );
    let mut tx = pool.begin().await?;
    if let Some(seconds) = timeout_seconds {
        sqlx::query(&format!("SET LOCAL statement_timeout = '{seconds}s'"))
            .execute(&mut *tx)
            .await?;
    }
    let payload: serde_json::Value = sqlx::query_scalar(&wrapped).fetch_one(&mut *tx).await?;
    tx.commit().await?;

    let mut rows = payload.as_array().cloned().unwrap_or_default();
    let truncated = rows.len() as i64 > EXEC_ROW_CAP;
    rows.truncate(EXEC_ROW_CAP as usize);
    Ok((rows, truncated))
}

/// Run an arbitrary statement against the relational side. SELECTs come back
/// as JSON rows (capped); everything else reports rows affected.
pub async fn exec_statement(pool: &PgPool, sql: &str) -> CoreResult<ExecOutcome> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| CoreError::validation(format!("SQL parse error: {e}")))?;
    if statements.len() != 1 {
        return Err(CoreError::validation("exactly one statement required"));
    }

    if matches!(statements[0], Statement::Query(_)) {
        let wrapped = format!(
            "SELECT COALESCE(json_agg(row_to_json(q)), '[]'::json) AS rows \
             FROM (SELECT * FROM ({sql}) inner_q LIMIT {cap}) q",
            cap = EXEC_ROW_CAP + 1
        );
        let payload: serde_json::Value = sqlx::query_scalar(&wrapped).fetch_one(pool).await?;
        let mut rows = payload.as_array().cloned().unwrap_or_default();
        let truncated = rows.len() as i64 > EXEC_ROW_CAP;
        rows.truncate(EXEC_ROW_CAP as usize);
        return Ok(ExecOutcome::Rows { rows, truncated });
    }

    let result = sqlx::query(sql).execute(pool).await?;
    Ok(ExecOutcome::Command {
        rows_affected: result.rows_affected(),
    })
}

// ============================================================================
// Saved queries
// ============================================================================

#[derive(Debug, Clone, FromRow, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSqlQuery {
    pub id: String,
    pub label: Option<String>,
    pub statement: String,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SavedSqlQuery {
    pub async fn upsert(
        id: &str,
        label: Option<&str>,
        statement: &str,
        created_by: Option<&str>,
        pool: &PgPool,
    ) -> CoreResult<Self> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO saved_sql_queries (id, label, statement, created_by)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                label = EXCLUDED.label,
                statement = EXCLUDED.statement,
                updated_at = NOW()
            RETURNING id, label, statement, created_by, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(label)
        .bind(statement)
        .bind(created_by)
        .fetch_one(pool)
        .await?;
        Ok(row)
    }

    pub async fn find(id: &str, pool: &PgPool) -> CoreResult<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, label, statement, created_by, created_at, updated_at
            FROM saved_sql_queries
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    pub async fn list(pool: &PgPool, limit: i64) -> CoreResult<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, label, statement, created_by, created_at, updated_at
            FROM saved_sql_queries
            ORDER BY updated_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete(id: &str, pool: &PgPool) -> CoreResult<bool> {
        let result = sqlx::query("DELETE FROM saved_sql_queries WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_accepts_single_select_and_with() {
        assert!(guard_read_statement("SELECT 1").is_ok());
        assert!(guard_read_statement("WITH x AS (SELECT 1) SELECT * FROM x").is_ok());
    }

    #[test]
    fn guard_rejects_non_queries_and_separators() {
        assert!(guard_read_statement("DELETE FROM demo").is_err());
        assert!(guard_read_statement("SELECT 1; SELECT 2").is_err());
        assert!(guard_read_statement("").is_err());
        assert!(guard_read_statement("not sql at all (").is_err());
    }

    #[test]
    fn collects_bare_table_candidates_but_not_ctes() {
        let statement = guard_read_statement(
            "WITH recent AS (SELECT * FROM demo) \
             SELECT r.*, o.x FROM recent r JOIN other o ON o.id = r.id",
        )
        .unwrap();
        let candidates = collect_table_candidates(&statement);
        assert!(candidates.contains(&"demo".to_string()));
        assert!(candidates.contains(&"other".to_string()));
        assert!(!candidates.contains(&"recent".to_string()));
    }

    #[test]
    fn rewrites_resolved_identifiers_only() {
        let statement =
            guard_read_statement("SELECT count(*) FROM demo JOIN lookup ON true").unwrap();
        let mut resolved = HashMap::new();
        resolved.insert("demo".to_string(), qualified_table("demo"));
        let sql = rewrite_statement(&statement, &resolved).unwrap();
        assert!(sql.contains("timestore.ds_demo"), "got: {sql}");
        assert!(sql.contains("lookup"));
    }

    #[test]
    fn rewrites_inside_subqueries_and_set_ops() {
        let statement = guard_read_statement(
            "SELECT * FROM (SELECT * FROM demo) d UNION ALL SELECT * FROM demo",
        )
        .unwrap();
        let mut resolved = HashMap::new();
        resolved.insert("demo".to_string(), qualified_table("demo"));
        let sql = rewrite_statement(&statement, &resolved).unwrap();
        assert_eq!(sql.matches("timestore.ds_demo").count(), 2);
    }

    #[test]
    fn qualified_names_sanitize_dashes() {
        assert_eq!(qualified_table("node-events"), "timestore.ds_node_events");
    }

    #[test]
    fn csv_rendering_escapes() {
        let columns = vec!["a".to_string(), "b".to_string()];
        let rows = vec![serde_json::json!({"a": "plain", "b": "has,comma \"quoted\""})];
        let csv = render_csv(&columns, &rows);
        assert_eq!(
            csv,
            "a,b\nplain,\"has,comma \"\"quoted\"\"\"\n"
        );
    }

    #[test]
    fn text_rendering_aligns_columns() {
        let columns = vec!["name".to_string(), "v".to_string()];
        let rows = vec![
            serde_json::json!({"name": "alpha", "v": 1}),
            serde_json::json!({"name": "b", "v": 22}),
        ];
        let text = render_text(&columns, &rows);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("name "));
        assert!(lines[1].starts_with("alpha"));
    }
}
