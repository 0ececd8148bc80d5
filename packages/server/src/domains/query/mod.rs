// Query planner, executor, and SQL endpoints.

pub mod downsample;
pub mod executor;
pub mod planner;
pub mod sql;

pub use downsample::{AggFn, Aggregation, Downsample};
pub use executor::{QueryExecutor, QueryRequest, QueryResponse, DEFAULT_ROW_LIMIT};
pub use planner::{Filter, FilterOp};
pub use sql::{
    collect_table_candidates, exec_statement, guard_read_statement, qualified_table,
    render_csv, render_text, rewrite_statement, ExecOutcome, SavedSqlQuery, SqlNameCache,
};
