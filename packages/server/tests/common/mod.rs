// Common test utilities.

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Connect to the test database named by DATABASE_URL and apply migrations.
/// Tests calling this are `#[ignore]`d by default so the suite passes
/// without infrastructure.
pub async fn test_pool() -> PgPool {
    let url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for database-backed tests");
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect to test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("apply migrations");
    pool
}

/// Unique slug per test run so suites are rerunnable against one database.
pub fn unique_slug(prefix: &str) -> String {
    format!("{prefix}-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}
