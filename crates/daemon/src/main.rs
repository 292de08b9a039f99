// gitsyncd: keeps a local mirror of the configured remote fresh.

use anyhow::Context;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("starting gitsync daemon");
    gitsync_daemon::runtime::run_standalone()
        .await
        .context("gitsync daemon terminated unexpectedly")
}
