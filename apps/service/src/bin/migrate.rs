//! Apply schema migrations and exit. `wordclaw-migrate --database-url ...`
//! (or WC_DATABASE_URL) is run before the service in fresh deployments.

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use wordclaw_service::db::Db;

#[derive(Debug, Parser)]
#[command(name = "wordclaw-migrate", about = "Apply wordclaw schema migrations")]
struct Args {
    /// Postgres connection string; falls back to WC_DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new("info").unwrap_or_default())
        .init();

    let args = Args::parse();
    let database_url = args
        .database_url
        .or_else(|| std::env::var("WC_DATABASE_URL").ok())
        .filter(|url| !url.trim().is_empty());
    let Some(database_url) = database_url else {
        bail!("no database url; pass --database-url or set WC_DATABASE_URL");
    };

    let db = Db::connect(&database_url).await.context("connect")?;
    let applied = db.migrate().await.context("migrate")?;
    tracing::info!(applied, "migrations complete");
    Ok(())
}
