// Request middleware.

mod iam;

pub use iam::{iam_context_middleware, require_dataset_read, require_dataset_write};
