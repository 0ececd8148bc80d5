// Standalone migration runner.

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;

#[derive(Parser, Debug)]
#[command(name = "migrate_cli", about = "Apply strata database migrations")]
struct Args {
    /// Database URL; falls back to TIMESTORE_DATABASE_URL / DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let database_url = match args.database_url {
        Some(url) => url,
        None => std::env::var("TIMESTORE_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .context("TIMESTORE_DATABASE_URL or DATABASE_URL must be set")?,
    };

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    tracing::info!("migrations applied");
    Ok(())
}
