// Working checkouts: exclusively owned clones bound to one branch.
//
// A checkout is cloned from the repository's local mirror and keeps two
// remotes: `origin` (the mirror, fast and local) and `upstream` (the real
// remote, where pushes go). Pushes that lose a race are rebased onto the
// advanced upstream branch and retried a bounded number of times; the note
// and sync tag are re-attached to whichever commit finally lands.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use gitsync_common::note::encode_note;
use gitsync_common::types::{CheckoutConfig, CommitAction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::commit::{gpg_env, CommitBuilder};
use super::context::Context;
use super::error::{FailureKind, GitError, ProcessError};
use super::notes::NoteStore;
use super::runner::{redact_url, CommandExecutor, GitRunner, ProcessCommandExecutor};

const UPSTREAM: &str = "upstream";
const SYNC_TAG_MESSAGE: &str = "Sync pointer";

pub struct Checkout<E = ProcessCommandExecutor> {
    runner: GitRunner<E>,
    dir: PathBuf,
    upstream: String,
    config: CheckoutConfig,
}

impl<E: CommandExecutor> Checkout<E> {
    /// Clone `mirror` into `dir` on `config.branch`. `dir` must not exist
    /// yet; it is removed again if any step fails.
    pub(crate) async fn clone_from(
        ctx: &Context,
        runner: GitRunner<E>,
        mirror: &Path,
        upstream: &str,
        dir: PathBuf,
        config: CheckoutConfig,
    ) -> Result<Self, GitError> {
        config.validate()?;
        let checkout = Self { runner, dir, upstream: upstream.to_string(), config };

        match checkout.init(ctx, mirror).await {
            Ok(()) => {
                info!(
                    dir = %checkout.dir.display(),
                    branch = %checkout.config.branch,
                    "working checkout ready"
                );
                Ok(checkout)
            }
            Err(error) => {
                checkout.clean();
                Err(error)
            }
        }
    }

    async fn init(&self, ctx: &Context, mirror: &Path) -> Result<(), GitError> {
        let branch = self.config.branch.as_str();
        let clone_err =
            |source: ProcessError| GitError::Clone { branch: branch.to_string(), source };

        let parent = self.dir.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| GitError::io(format!("create {}", parent.display()), e))?;

        let mirror = mirror.to_string_lossy();
        let target = self.dir.to_string_lossy();
        self.runner
            .run(ctx, parent, &["clone", "--branch", branch, "--", &mirror, &target])
            .await
            .map_err(clone_err)?;

        self.git(ctx, &["config", "user.name", &self.config.user_name]).await.map_err(clone_err)?;
        self.git(ctx, &["config", "user.email", &self.config.user_email]).await.map_err(clone_err)?;
        self.git(ctx, &["remote", "add", UPSTREAM, &self.upstream]).await.map_err(clone_err)?;

        // Notes are not part of a plain clone.
        let notes_ref = self.config.notes_ref_full();
        let refspec = format!("+{notes_ref}:{notes_ref}");
        match self.git(ctx, &["fetch", "origin", &refspec]).await {
            Err(error) if error.is(FailureKind::MissingRemoteRef) => {
                debug!(notes_ref = %notes_ref, "mirror has no notes yet");
                Ok(())
            }
            other => other.map(|_| ()).map_err(clone_err),
        }
    }

    async fn git(&self, ctx: &Context, args: &[&str]) -> Result<String, ProcessError> {
        self.runner.run(ctx, &self.dir, args).await
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &CheckoutConfig {
        &self.config
    }

    /// Directories holding managed content, in configuration order. The
    /// checkout root when no paths are configured.
    pub fn manifest_dirs(&self) -> Vec<PathBuf> {
        if self.config.paths.is_empty() {
            return vec![self.dir.clone()];
        }
        self.config.paths.iter().map(|path| self.dir.join(path)).collect()
    }

    pub async fn head_revision(&self, ctx: &Context) -> Result<String, GitError> {
        self.resolve(ctx, "HEAD").await
    }

    /// The commit the sync tag points at, or `None` when no tag is
    /// configured.
    pub async fn sync_revision(&self, ctx: &Context) -> Result<Option<String>, GitError> {
        let Some(tag) = self.config.sync_tag() else {
            return Ok(None);
        };
        self.resolve(ctx, &format!("refs/tags/{tag}^{{commit}}")).await.map(Some)
    }

    async fn resolve(&self, ctx: &Context, revision: &str) -> Result<String, GitError> {
        self.git(ctx, &["rev-parse", "--verify", revision])
            .await
            .map(|out| out.trim().to_string())
            .map_err(|source| GitError::Resolve { revision: revision.to_string(), source })
    }

    fn notes(&self) -> NoteStore<'_, E> {
        NoteStore::new(&self.runner, &self.dir, self.config.notes_ref_full())
    }

    fn builder(&self) -> CommitBuilder<'_, E> {
        CommitBuilder::new(&self.runner, &self.dir, &self.config)
    }

    pub async fn get_note<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        revision: &str,
    ) -> Result<Option<T>, GitError> {
        self.notes().get(ctx, revision).await
    }

    /// Attach a note locally. It reaches the remote with the next
    /// [`Checkout::commit_and_push`].
    pub async fn set_note<T: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        revision: &str,
        note: &T,
    ) -> Result<(), GitError> {
        self.notes().set(ctx, revision, note).await
    }

    pub async fn note_revisions(&self, ctx: &Context) -> Result<HashSet<String>, GitError> {
        self.notes().list(ctx).await
    }

    /// Files under the manifest paths that changed between `since` and HEAD,
    /// relative to the checkout root.
    pub async fn changed_files(&self, ctx: &Context, since: &str) -> Result<Vec<String>, GitError> {
        let range = format!("{since}..HEAD");
        let pathspecs = self.config.pathspecs();
        let mut args = vec!["diff", "--name-only", range.as_str(), "--"];
        args.extend(pathspecs.iter().map(String::as_str));

        let out = self
            .git(ctx, &args)
            .await
            .map_err(|source| GitError::History { revision: since.to_string(), source })?;
        Ok(out.lines().filter(|line| !line.is_empty()).map(str::to_string).collect())
    }

    /// Commit everything under the manifest paths and push it upstream,
    /// attaching `note` to the commit that lands. Returns that commit.
    ///
    /// The local notes ref is pushed along with the branch, so notes added
    /// with [`Checkout::set_note`] land too. The local sync tag only moves
    /// when the push succeeds.
    pub async fn commit_and_push<N: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        action: &CommitAction,
        note: Option<&N>,
    ) -> Result<String, GitError> {
        // Encode first so an unencodable note never leaves a local commit.
        let note = note
            .map(encode_note)
            .transpose()
            .map_err(|source| GitError::EncodeNote { revision: "HEAD".into(), source })?;

        let revision = self.builder().commit(ctx, action).await?;

        let tag_ref = self.config.sync_tag().map(|tag| format!("refs/tags/{tag}"));
        let previous_tag = match &tag_ref {
            Some(name) => {
                self.ref_target(ctx, name).await.map_err(|source| self.push_error(1, source))?
            }
            None => None,
        };

        let pushed = self.push_with_retries(ctx, action, note.as_deref(), revision).await;
        if let (Err(_), Some(name)) = (&pushed, &tag_ref) {
            self.restore_ref(name, previous_tag.as_deref()).await;
        }
        pushed
    }

    async fn push_with_retries(
        &self,
        ctx: &Context,
        action: &CommitAction,
        note: Option<&str>,
        mut revision: String,
    ) -> Result<String, GitError> {
        let attempts = self.config.push_attempts.max(1);
        let mut attempt = 1;

        loop {
            if let Some(raw) = note {
                self.notes().set_raw(ctx, &revision, raw).await?;
            }
            if let Some(tag) = self.config.sync_tag() {
                self.tag(ctx, tag, &revision, SYNC_TAG_MESSAGE)
                    .await
                    .map_err(|source| self.push_error(attempt, source))?;
            }

            match self.push(ctx).await {
                Ok(()) => {
                    info!(
                        revision = %revision,
                        branch = %self.config.branch,
                        attempt,
                        "pushed commit"
                    );
                    return Ok(revision);
                }
                Err(error) if error.is(FailureKind::NonFastForward) && attempt < attempts => {
                    warn!(
                        branch = %self.config.branch,
                        attempt,
                        attempts,
                        "push rejected, rebasing onto upstream"
                    );
                    revision = self.rebase_onto_upstream(ctx, action, attempt).await?;
                    attempt += 1;
                }
                Err(source) => return Err(self.push_error(attempt, source)),
            }
        }
    }

    /// Point the sync tag at `revision` and force-push it. The local tag is
    /// put back if the push fails.
    pub async fn move_sync_tag_and_push(
        &self,
        ctx: &Context,
        revision: &str,
        message: &str,
    ) -> Result<(), GitError> {
        let Some(tag) = self.config.sync_tag() else {
            debug!("no sync tag configured");
            return Ok(());
        };
        let name = format!("refs/tags/{tag}");
        let previous =
            self.ref_target(ctx, &name).await.map_err(|source| self.push_error(1, source))?;
        self.tag(ctx, tag, revision, message)
            .await
            .map_err(|source| self.push_error(1, source))?;

        let refspec = format!("+{name}:{name}");
        if let Err(source) = self.git(ctx, &["push", UPSTREAM, &refspec]).await {
            self.restore_ref(&name, previous.as_deref()).await;
            return Err(self.push_error(1, source));
        }
        info!(tag, revision, "moved sync tag");
        Ok(())
    }

    async fn tag(
        &self,
        ctx: &Context,
        tag: &str,
        revision: &str,
        message: &str,
    ) -> Result<(), ProcessError> {
        let args = ["tag", "--force", "--annotate", tag, "-m", message, revision];
        self.git(ctx, &args).await.map(|_| ())
    }

    /// The object a local ref points at, `None` when the ref does not exist.
    async fn ref_target(
        &self,
        ctx: &Context,
        name: &str,
    ) -> Result<Option<String>, ProcessError> {
        let args = ["for-each-ref", "--format=%(refname) %(objectname)", name];
        let out = self.git(ctx, &args).await?;
        Ok(out
            .lines()
            .filter_map(|line| line.split_once(' '))
            .find(|(refname, _)| *refname == name)
            .map(|(_, target)| target.to_string()))
    }

    /// Point `name` back at `previous`, or delete it when there was nothing.
    /// Runs on a fresh context so a cancelled push is still rolled back.
    async fn restore_ref(&self, name: &str, previous: Option<&str>) {
        let ctx = Context::background();
        let restored = match previous {
            Some(target) => self.git(&ctx, &["update-ref", name, target]).await,
            None => self.git(&ctx, &["update-ref", "-d", name]).await,
        };
        match restored {
            Ok(_) => debug!(reference = name, previous = ?previous, "restored ref"),
            Err(error) => warn!(reference = name, error = %error, "failed to restore ref"),
        }
    }

    async fn push(&self, ctx: &Context) -> Result<(), ProcessError> {
        let branch = &self.config.branch;
        let mut refspecs = vec![format!("refs/heads/{branch}:refs/heads/{branch}")];
        let notes_ref = self.config.notes_ref_full();
        if self.ref_target(ctx, &notes_ref).await?.is_some() {
            refspecs.push(format!("{notes_ref}:{notes_ref}"));
        }
        if let Some(tag) = self.config.sync_tag() {
            refspecs.push(format!("+refs/tags/{tag}:refs/tags/{tag}"));
        }

        let mut args = vec!["push", "--atomic", UPSTREAM];
        args.extend(refspecs.iter().map(String::as_str));
        self.git(ctx, &args).await.map(|_| ())
    }

    /// Bring in what upstream gained since our view was taken and replay the
    /// local commit on top. Returns the rewritten head, re-verified when the
    /// commit is signed.
    async fn rebase_onto_upstream(
        &self,
        ctx: &Context,
        action: &CommitAction,
        attempt: u32,
    ) -> Result<String, GitError> {
        let branch = &self.config.branch;
        let tracking = format!("refs/remotes/{UPSTREAM}/{branch}");
        let refspec = format!("+refs/heads/{branch}:{tracking}");
        self.git(ctx, &["fetch", UPSTREAM, &refspec])
            .await
            .map_err(|source| self.fetch_error(source))?;
        self.merge_upstream_notes(ctx).await?;

        let builder = self.builder();
        let key = builder.signing_key(action);
        let env = gpg_env(action);
        let mut args = vec!["rebase".to_string(), "--autostash".to_string()];
        if let Some(key) = key {
            args.push(format!("--gpg-sign={key}"));
        }
        args.push(tracking);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        if let Err(source) = self.runner.run_with_env(ctx, &self.dir, &args, &env).await {
            if let Err(abort) = self.git(ctx, &["rebase", "--abort"]).await {
                warn!(error = %abort, "rebase --abort failed");
            }
            return Err(self.push_error(attempt, source));
        }

        let revision = self.head_revision(ctx).await?;
        if let Some(key) = key {
            builder.verify_signature(ctx, &revision, key, &env).await?;
        }
        Ok(revision)
    }

    /// Fold upstream's notes into the local notes ref. Where both sides
    /// annotate the same commit the local note wins.
    async fn merge_upstream_notes(&self, ctx: &Context) -> Result<(), GitError> {
        let notes_ref = self.config.notes_ref_full();
        let scratch = format!("{notes_ref}-upstream");
        let refspec = format!("+{notes_ref}:{scratch}");
        match self.git(ctx, &["fetch", UPSTREAM, &refspec]).await {
            Ok(_) => {}
            Err(error) if error.is(FailureKind::MissingRemoteRef) => {
                debug!(notes_ref = %notes_ref, "upstream has no notes");
                return Ok(());
            }
            Err(source) => return Err(self.fetch_error(source)),
        }

        let note_err =
            |source: ProcessError| GitError::Note { revision: notes_ref.clone(), source };
        let merged = match self.ref_target(ctx, &notes_ref).await.map_err(note_err)? {
            Some(_) => {
                let args = [
                    "notes",
                    "--ref",
                    notes_ref.as_str(),
                    "merge",
                    "--strategy=ours",
                    "--quiet",
                    scratch.as_str(),
                ];
                self.git(ctx, &args).await
            }
            None => self.git(ctx, &["update-ref", &notes_ref, &scratch]).await,
        };
        if let Err(error) = self.git(ctx, &["update-ref", "-d", &scratch]).await {
            warn!(reference = %scratch, error = %error, "failed to remove scratch notes ref");
        }
        merged.map(|_| ()).map_err(note_err)
    }

    fn fetch_error(&self, source: ProcessError) -> GitError {
        GitError::Fetch { origin: redact_url(&self.upstream), source }
    }

    fn push_error(&self, attempts: u32, source: ProcessError) -> GitError {
        GitError::Push { branch: self.config.branch.clone(), attempts, source }
    }

    /// Remove the checkout directory. Owners call this on every exit path.
    pub fn clean(&self) {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!(dir = %self.dir.display(), "removed working checkout"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "failed to remove working checkout")
            }
        }
    }
}
