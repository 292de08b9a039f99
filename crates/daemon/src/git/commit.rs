// Commit creation inside a working checkout.
//
// Stages the manifest paths, commits with the action's message and author,
// and signs when a key is in play. The GnuPG home travels with the command
// as an env overlay, so checkouts signing with different keys never share
// process state.

use std::path::Path;

use gitsync_common::types::{signing_keys_match, CheckoutConfig, CommitAction};
use tracing::{debug, info};

use super::context::Context;
use super::error::GitError;
use super::runner::{CommandExecutor, GitRunner};

pub struct CommitBuilder<'a, E> {
    runner: &'a GitRunner<E>,
    dir: &'a Path,
    config: &'a CheckoutConfig,
}

impl<'a, E: CommandExecutor> CommitBuilder<'a, E> {
    pub fn new(runner: &'a GitRunner<E>, dir: &'a Path, config: &'a CheckoutConfig) -> Self {
        Self { runner, dir, config }
    }

    /// The caller's message with the configured skip marker appended once.
    pub fn message_for(&self, action: &CommitAction) -> String {
        match self.config.skip_message.as_deref() {
            Some(marker) if !marker.is_empty() => format!("{}{marker}", action.message),
            _ => action.message.clone(),
        }
    }

    /// The key to sign with: the action's, else the checkout default.
    pub fn signing_key<'b>(&'b self, action: &'b CommitAction) -> Option<&'b str> {
        action
            .signing_key
            .as_deref()
            .or(self.config.signing_key.as_deref())
            .filter(|key| !key.trim().is_empty())
    }

    /// Stage every change under the manifest paths, including deletions.
    pub async fn stage(&self, ctx: &Context) -> Result<(), GitError> {
        let pathspecs = self.config.pathspecs();
        let mut args = vec!["add", "--all", "--"];
        args.extend(pathspecs.iter().map(String::as_str));
        self.runner
            .run(ctx, self.dir, &args)
            .await
            .map(|_| ())
            .map_err(|source| GitError::Commit { source })
    }

    /// Stage and commit. Returns the new head revision.
    ///
    /// A tree with nothing staged fails with a `Commit` error for which
    /// [`GitError::is_nothing_to_commit`] holds; the working tree is left
    /// untouched in every failure case.
    pub async fn commit(&self, ctx: &Context, action: &CommitAction) -> Result<String, GitError> {
        self.stage(ctx).await?;

        let message = self.message_for(action);
        let key = self.signing_key(action);
        let args = commit_args(&message, action.author(), key);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let env = gpg_env(action);

        self.runner
            .run_with_env(ctx, self.dir, &args, &env)
            .await
            .map_err(|source| GitError::Commit { source })?;

        let revision = self.head(ctx).await?;
        if let Some(key) = key {
            self.verify_signature(ctx, &revision, key, &env).await?;
        }

        info!(
            revision = %revision,
            branch = %self.config.branch,
            signed = key.is_some(),
            "created commit"
        );
        Ok(revision)
    }

    async fn head(&self, ctx: &Context) -> Result<String, GitError> {
        self.runner
            .run(ctx, self.dir, &["rev-parse", "HEAD"])
            .await
            .map(|out| out.trim().to_string())
            .map_err(|source| GitError::Resolve { revision: "HEAD".into(), source })
    }

    /// Check that `revision` is signed by a key whose id ends like `expected`.
    pub(crate) async fn verify_signature(
        &self,
        ctx: &Context,
        revision: &str,
        expected: &str,
        env: &[(String, String)],
    ) -> Result<(), GitError> {
        let out = self
            .runner
            .run_with_env(ctx, self.dir, &["log", "-1", "--format=%GK", revision], env)
            .await
            .map_err(|source| GitError::Commit { source })?;

        let found = Some(out.trim()).filter(|key| !key.is_empty());
        debug!(revision, found = ?found, "read back commit signature");
        match found {
            Some(found) if signing_keys_match(found, expected) => Ok(()),
            found => Err(GitError::SigningKeyMismatch {
                revision: revision.to_string(),
                expected: key_tail(expected),
                found: found.map(str::to_string),
            }),
        }
    }
}

pub(crate) fn commit_args(
    message: &str,
    author: Option<&str>,
    signing_key: Option<&str>,
) -> Vec<String> {
    let mut args = vec![
        "commit".to_string(),
        "--no-verify".to_string(),
        "-m".to_string(),
        message.to_string(),
    ];
    if let Some(author) = author {
        args.push(format!("--author={author}"));
    }
    if let Some(key) = signing_key {
        args.push(format!("--gpg-sign={key}"));
    }
    args
}

/// Env overlay pointing gpg at the action's key store.
pub(crate) fn gpg_env(action: &CommitAction) -> Vec<(String, String)> {
    action
        .gpg_home
        .as_ref()
        .map(|home| vec![("GNUPGHOME".to_string(), home.display().to_string())])
        .unwrap_or_default()
}

// Only the tail of a key goes into errors.
fn key_tail(key: &str) -> String {
    let key = key.trim();
    let start = key.len().saturating_sub(8);
    if start == 0 {
        return key.to_string();
    }
    format!("…{}", key.get(start..).unwrap_or_default())
}
