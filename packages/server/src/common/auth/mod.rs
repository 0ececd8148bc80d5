// IAM scope model shared by the HTTP layer and domain services.

mod scopes;

pub use scopes::{AuthContext, DatasetIamPolicy, ScopeSet};
