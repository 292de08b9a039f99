// Background loop keeping a repository mirror fresh.
//
// Clones the mirror (retrying while the remote is unreachable), then fetches
// every poll interval or as soon as `Repo::notify` is called. Shutdown stops
// the loop and kills any git command it has in flight.

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::context::Context;
use super::repo::Repo;
use super::runner::{redact_url, CommandExecutor};

/// Handle for the sync loop task. Dropping it leaves the loop running;
/// call [`SyncLoopHandle::shutdown`] to stop it.
pub struct SyncLoopHandle {
    task: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    ctx: Context,
}

impl SyncLoopHandle {
    /// Stop the loop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.ctx.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "sync loop task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub(crate) fn start<E: CommandExecutor + 'static>(repo: Repo<E>) -> SyncLoopHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = Context::background();
    let loop_ctx = ctx.child();
    let task = tokio::spawn(async move {
        sync_loop(repo, loop_ctx, shutdown_rx).await;
    });
    SyncLoopHandle { task, shutdown_tx, ctx }
}

async fn sync_loop<E: CommandExecutor>(
    repo: Repo<E>,
    ctx: Context,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let origin = redact_url(repo.origin());
    info!(repo = %origin, "sync loop started");

    loop {
        let interval = if repo.status().is_ready() {
            match repo.refresh(&ctx).await {
                Ok(()) => debug!(repo = %origin, "refreshed"),
                Err(e) if e.is_cancelled() => {
                    debug!(repo = %origin, error = %e, "refresh interrupted")
                }
                Err(e) => warn!(repo = %origin, error = %e, "refresh failed"),
            }
            repo.options().poll_interval
        } else {
            match repo.ensure_cloned(&ctx).await {
                Ok(()) => repo.options().poll_interval,
                Err(e) => {
                    warn!(repo = %origin, error = %e, "mirror clone failed, will retry");
                    repo.options().retry_interval
                }
            }
        };

        // Sleep, refresh on request, or shut down.
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = repo.refresh_requested() => {
                debug!(repo = %origin, "refresh requested");
            },
            _ = shutdown_rx.changed() => {
                debug!(repo = %origin, "sync loop shutting down");
                break;
            }
        }
    }
}
