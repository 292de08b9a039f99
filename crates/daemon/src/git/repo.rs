// Repository handle: the shared local mirror of one remote.
//
// The mirror is the only state shared between checkouts. Mutations (the
// initial `clone --mirror` and every fetch) hold the write half of an
// RwLock; cloning checkouts and history queries hold the read half.
// Readiness and refresh generations are published on watch channels.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gitsync_common::types::{CheckoutConfig, Commit, RepoStatus};
use tokio::sync::{watch, Notify, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::checkout::Checkout;
use super::context::{Context, Done};
use super::error::{GitError, ProcessError};
use super::runner::{redact_url, CommandExecutor, GitRunner, ProcessCommandExecutor};
use super::sync_loop::{self, SyncLoopHandle};

/// `git log` format: hash, signing key, author name, author email, committer
/// date and raw body, separated by unit separators, one record per commit.
const LOG_FORMAT: &str = "--format=%H%x1f%GK%x1f%an%x1f%ae%x1f%cI%x1f%B%x1e";
const FIELD_SEP: char = '\x1f';
const RECORD_SEP: char = '\x1e';

// ── Options ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RepoOptions {
    /// Where the mirror clone lives.
    pub cache_dir: PathBuf,
    /// Parent directory for working checkouts.
    pub checkout_dir: PathBuf,
    /// Time between background refreshes.
    pub poll_interval: Duration,
    /// Wait before retrying a failed initial clone.
    pub retry_interval: Duration,
    /// Upper bound for any single git command.
    pub command_timeout: Option<Duration>,
    /// GnuPG home used to read signatures in history queries.
    pub gpg_home: Option<PathBuf>,
}

impl RepoOptions {
    /// Mirror and checkouts side by side under `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            cache_dir: base.join("mirror"),
            checkout_dir: base.join("checkouts"),
            poll_interval: Duration::from_secs(300),
            retry_interval: Duration::from_secs(10),
            command_timeout: Some(Duration::from_secs(20)),
            gpg_home: None,
        }
    }
}

// ── Handle ──────────────────────────────────────────────────────────

/// Cheap to clone; all clones share one mirror.
pub struct Repo<E = ProcessCommandExecutor> {
    inner: Arc<RepoInner<E>>,
}

impl<E> Clone for Repo<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct RepoInner<E> {
    origin: String,
    options: RepoOptions,
    runner: GitRunner<E>,
    lock: RwLock<()>,
    status_tx: watch::Sender<RepoStatus>,
    refreshed_tx: watch::Sender<u64>,
    last_refreshed: Mutex<Option<DateTime<Utc>>>,
    refresh_requested: Notify,
}

impl Repo<ProcessCommandExecutor> {
    pub fn new(origin: impl Into<String>, options: RepoOptions) -> Self {
        Self::with_executor(origin, options, ProcessCommandExecutor)
    }
}

impl<E: CommandExecutor> Repo<E> {
    pub fn with_executor(origin: impl Into<String>, options: RepoOptions, executor: E) -> Self {
        let runner = GitRunner::with_executor(executor).with_timeout(options.command_timeout);
        let (status_tx, _) = watch::channel(RepoStatus::New);
        let (refreshed_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(RepoInner {
                origin: origin.into(),
                options,
                runner,
                lock: RwLock::new(()),
                status_tx,
                refreshed_tx,
                last_refreshed: Mutex::new(None),
                refresh_requested: Notify::new(),
            }),
        }
    }

    /// The remote URL this handle mirrors.
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// The mirror directory.
    pub fn dir(&self) -> &Path {
        &self.inner.options.cache_dir
    }

    pub fn options(&self) -> &RepoOptions {
        &self.inner.options
    }

    pub fn status(&self) -> RepoStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RepoStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Generation counter, bumped after every successful clone or fetch.
    pub fn subscribe_refreshes(&self) -> watch::Receiver<u64> {
        self.inner.refreshed_tx.subscribe()
    }

    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.inner.last_refreshed.lock().ok().and_then(|at| *at)
    }

    /// Ask the sync loop to refresh now instead of at the next poll.
    pub fn notify(&self) {
        self.inner.refresh_requested.notify_one();
    }

    pub(crate) async fn refresh_requested(&self) {
        self.inner.refresh_requested.notified().await;
    }

    /// Spawn the background loop that clones and then keeps refreshing.
    pub fn start(&self) -> SyncLoopHandle
    where
        E: 'static,
    {
        sync_loop::start(self.clone())
    }

    fn origin_for_logs(&self) -> String {
        redact_url(&self.inner.origin)
    }

    fn not_ready(&self, cause: Option<Done>) -> GitError {
        GitError::NotReady { origin: self.origin_for_logs(), status: self.status(), cause }
    }

    fn set_status(&self, status: RepoStatus) {
        self.inner.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            info!(
                repo = %self.origin_for_logs(),
                from = %current,
                to = %status,
                "repository status changed"
            );
            *current = status;
            true
        });
    }

    fn mark_refreshed(&self) {
        if let Ok(mut at) = self.inner.last_refreshed.lock() {
            *at = Some(Utc::now());
        }
        self.set_status(RepoStatus::Ready);
        self.inner.refreshed_tx.send_modify(|generation| *generation += 1);
    }

    async fn write_lock(&self, ctx: &Context) -> Result<RwLockWriteGuard<'_, ()>, Done> {
        tokio::select! {
            biased;
            done = ctx.done() => Err(done),
            guard = self.inner.lock.write() => Ok(guard),
        }
    }

    async fn read_lock(&self, ctx: &Context) -> Result<RwLockReadGuard<'_, ()>, Done> {
        tokio::select! {
            biased;
            done = ctx.done() => Err(done),
            guard = self.inner.lock.read() => Ok(guard),
        }
    }

    fn history_env(&self) -> Vec<(String, String)> {
        self.inner
            .options
            .gpg_home
            .as_ref()
            .map(|home| vec![("GNUPGHOME".to_string(), home.display().to_string())])
            .unwrap_or_default()
    }

    // ── Readiness ───────────────────────────────────────────────────

    /// Wait until the mirror exists and has been fetched at least once.
    pub async fn ready(&self, ctx: &Context) -> Result<(), GitError> {
        let mut status = self.inner.status_tx.subscribe();
        loop {
            if status.borrow_and_update().is_ready() {
                return Ok(());
            }
            if let Some(done) = ctx.done_reason() {
                return Err(self.not_ready(Some(done)));
            }
            tokio::select! {
                done = ctx.done() => return Err(self.not_ready(Some(done))),
                changed = status.changed() => {
                    if changed.is_err() {
                        return Err(self.not_ready(None));
                    }
                }
            }
        }
    }

    /// Create the mirror if it does not exist yet. A mirror left on disk by
    /// an earlier run is fetched instead of re-cloned.
    pub async fn ensure_cloned(&self, ctx: &Context) -> Result<(), GitError> {
        if self.status().is_ready() {
            return Ok(());
        }
        let fetch_err =
            |source: ProcessError| GitError::Fetch { origin: self.origin_for_logs(), source };
        let _guard = self
            .write_lock(ctx)
            .await
            .map_err(|done| {
                fetch_err(ProcessError::interrupted("git clone --mirror".into(), done))
            })?;
        if self.status().is_ready() {
            return Ok(());
        }

        let dir = self.dir();
        if dir.join("HEAD").is_file() {
            debug!(repo = %self.origin_for_logs(), dir = %dir.display(), "reusing mirror on disk");
            return self
                .fetch_locked(ctx)
                .await
                .inspect_err(|error| self.record_clone_failure(error));
        }

        self.set_status(RepoStatus::Cloning);
        remove_dir(dir);
        let parent = dir.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| GitError::io(format!("create {}", parent.display()), e))?;

        let target = dir.to_string_lossy().into_owned();
        let args = ["clone", "--mirror", "--", self.inner.origin.as_str(), target.as_str()];
        match self.inner.runner.run(ctx, parent, &args).await {
            Ok(_) => {
                info!(repo = %self.origin_for_logs(), dir = %dir.display(), "mirror cloned");
                self.mark_refreshed();
                Ok(())
            }
            Err(source) => {
                remove_dir(dir);
                let error = fetch_err(source);
                self.record_clone_failure(&error);
                Err(error)
            }
        }
    }

    fn record_clone_failure(&self, error: &GitError) {
        if error.is_cancelled() {
            self.set_status(RepoStatus::New);
        } else {
            self.set_status(RepoStatus::Unreachable(error.to_string()));
        }
    }

    /// Fetch every ref (branches, tags, notes) from the remote into the
    /// mirror. Concurrent calls are serialized.
    pub async fn refresh(&self, ctx: &Context) -> Result<(), GitError> {
        if !self.status().is_ready() {
            return Err(self.not_ready(None));
        }
        let _guard = self.write_lock(ctx).await.map_err(|done| GitError::Fetch {
            origin: self.origin_for_logs(),
            source: ProcessError::interrupted("git fetch".into(), done),
        })?;
        self.fetch_locked(ctx).await
    }

    async fn fetch_locked(&self, ctx: &Context) -> Result<(), GitError> {
        self.inner
            .runner
            .run(ctx, self.dir(), &["fetch", "--prune", "--tags", "origin"])
            .await
            .map_err(|source| GitError::Fetch { origin: self.origin_for_logs(), source })?;
        debug!(repo = %self.origin_for_logs(), "mirror refreshed");
        self.mark_refreshed();
        Ok(())
    }

    // ── Checkouts ───────────────────────────────────────────────────

    /// Clone a new, independent working checkout from the mirror at its
    /// current state.
    pub async fn checkout(
        &self,
        ctx: &Context,
        config: CheckoutConfig,
    ) -> Result<Checkout<E>, GitError>
    where
        E: Clone,
    {
        if !self.status().is_ready() {
            return Err(self.not_ready(ctx.done_reason()));
        }
        let _guard = self.read_lock(ctx).await.map_err(|done| GitError::Clone {
            branch: config.branch.clone(),
            source: ProcessError::interrupted("git clone".into(), done),
        })?;

        let dir = self.inner.options.checkout_dir.join(format!("checkout-{}", Uuid::new_v4()));
        let runner = self.inner.runner.clone();
        Checkout::clone_from(ctx, runner, self.dir(), &self.inner.origin, dir, config).await
    }

    // ── History ─────────────────────────────────────────────────────

    pub async fn revision(&self, ctx: &Context, reference: &str) -> Result<String, GitError> {
        let resolve_err =
            |source: ProcessError| GitError::Resolve { revision: reference.to_string(), source };
        let _guard = self
            .read_lock(ctx)
            .await
            .map_err(|done| resolve_err(ProcessError::interrupted("git rev-parse".into(), done)))?;
        self.inner
            .runner
            .run(ctx, self.dir(), &["rev-parse", "--verify", reference])
            .await
            .map(|out| out.trim().to_string())
            .map_err(resolve_err)
    }

    /// Commits reachable from `revision`, most recent first. A repository
    /// without commits yields an empty list.
    pub async fn commits_before(
        &self,
        ctx: &Context,
        revision: &str,
    ) -> Result<Vec<Commit>, GitError> {
        self.log(ctx, revision, revision, &[]).await
    }

    /// Commits in `from..to`, most recent first, optionally limited to
    /// commits touching `paths`.
    pub async fn commits_between(
        &self,
        ctx: &Context,
        from: &str,
        to: &str,
        paths: &[String],
    ) -> Result<Vec<Commit>, GitError> {
        let range = format!("{from}..{to}");
        self.log(ctx, to, &range, paths).await
    }

    async fn log(
        &self,
        ctx: &Context,
        revision: &str,
        range: &str,
        paths: &[String],
    ) -> Result<Vec<Commit>, GitError> {
        let history_err =
            |source: ProcessError| GitError::History { revision: revision.to_string(), source };
        let _guard = self
            .read_lock(ctx)
            .await
            .map_err(|done| history_err(ProcessError::interrupted("git log".into(), done)))?;

        let any = self
            .inner
            .runner
            .run(ctx, self.dir(), &["rev-list", "-n", "1", "--all"])
            .await
            .map_err(history_err)?;
        if any.trim().is_empty() {
            debug!(repo = %self.origin_for_logs(), "history query on empty repository");
            return Ok(Vec::new());
        }

        let mut args = vec!["log", LOG_FORMAT, range, "--"];
        args.extend(paths.iter().map(String::as_str));
        let out = self
            .inner
            .runner
            .run_with_env(ctx, self.dir(), &args, &self.history_env())
            .await
            .map_err(history_err)?;
        parse_log(revision, &out)
    }

    /// Remove the mirror from disk. Used at process shutdown.
    pub fn clean(&self) {
        remove_dir(self.dir());
        self.set_status(RepoStatus::New);
    }
}

fn remove_dir(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => debug!(dir = %dir.display(), "removed directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove directory"),
    }
}

fn parse_log(revision: &str, out: &str) -> Result<Vec<Commit>, GitError> {
    let format_err =
        |reason: String| GitError::HistoryFormat { revision: revision.to_string(), reason };

    let mut commits = Vec::new();
    for record in out.split(RECORD_SEP) {
        let record = record.trim_start_matches(['\n', '\r']);
        if record.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = record.splitn(6, FIELD_SEP).collect();
        let [hash, key, name, email, date, body] = fields.as_slice() else {
            return Err(format_err(format!("expected 6 fields, got {}", fields.len())));
        };
        let committed_at = DateTime::parse_from_rfc3339(date.trim())
            .map_err(|e| format_err(format!("bad commit date {date:?}: {e}")))?
            .with_timezone(&Utc);

        commits.push(Commit {
            revision: hash.trim().to_string(),
            signing_key: Some(key.trim()).filter(|key| !key.is_empty()).map(str::to_string),
            author_name: name.to_string(),
            author_email: email.to_string(),
            committed_at,
            message: body.trim_end().to_string(),
        });
    }
    Ok(commits)
}

// ── Tests ───────────────────────────────────────────────────────────
