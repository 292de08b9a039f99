// Standalone runtime: keep one mirror fresh until Ctrl-C.

use anyhow::{Context as _, Result};
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::git::runner::redact_url;
use crate::git::{Context, Repo};

pub async fn run_standalone() -> Result<()> {
    let config = DaemonConfig::load().context("failed to load ~/.gitsync/config.toml")?;
    run_with_config(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Run the sync loop for `config` until `shutdown` resolves, then stop the
/// loop and remove the mirror.
pub async fn run_with_config(
    config: DaemonConfig,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    config.validate().context("invalid daemon configuration")?;
    let options = config.repo_options()?;
    let origin = config.remote_url.clone().unwrap_or_default();

    let repo = Repo::new(origin, options);
    let loop_handle = repo.start();
    info!(
        repo = %redact_url(repo.origin()),
        mirror = %repo.dir().display(),
        "gitsync daemon started"
    );

    let watcher = {
        let repo = repo.clone();
        tokio::spawn(async move { log_progress(repo).await })
    };

    let ctx = Context::background();
    tokio::pin!(shutdown);
    let ready = tokio::select! {
        ready = repo.ready(&ctx) => Some(ready),
        _ = &mut shutdown => None,
    };
    if let Some(ready) = ready {
        match ready {
            Ok(()) => {
                let branch = config.checkout.as_ref().map(|checkout| checkout.branch.as_str());
                info!(branch = ?branch, "mirror ready for checkouts");
            }
            Err(e) => warn!(error = %e, "mirror never became ready"),
        }
        shutdown.await;
    }

    info!("shutting down");
    loop_handle.shutdown().await;
    watcher.abort();
    repo.clean();
    Ok(())
}

async fn log_progress(repo: Repo) {
    let mut status = repo.subscribe_status();
    let mut refreshes = repo.subscribe_refreshes();
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                info!(status = %current, "repository status");
            }
            changed = refreshes.changed() => {
                if changed.is_err() {
                    break;
                }
                let generation = *refreshes.borrow_and_update();
                info!(generation, last_refreshed = ?repo.last_refreshed(), "mirror refreshed");
            }
        }
    }
}
