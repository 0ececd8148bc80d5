// HTTP application.

pub mod app;
pub mod error;
pub mod middleware;
pub mod routes;

pub use app::{build_router, AppState};
pub use error::{ApiError, ApiResult};
