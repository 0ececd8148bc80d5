// Common types and utilities shared across the platform.

pub mod auth;
pub mod error;
pub mod ids;
pub mod pagination;

pub use auth::{AuthContext, DatasetIamPolicy, ScopeSet};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use ids::db_id;
pub use pagination::{clamp_limit, trim_results, Cursor, Page};
