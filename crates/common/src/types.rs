// Core value types shared by the gitsync crates.

use std::fmt::{Display, Formatter};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of push attempts a checkout makes before giving up on a
/// non-fast-forward rejection.
pub const DEFAULT_PUSH_ATTEMPTS: u32 = 3;

/// Signing keys are compared on this many trailing characters, since
/// history output abbreviates fingerprints to long key ids.
pub const SIGNING_KEY_SUFFIX_LEN: usize = 16;

// ── Commits ─────────────────────────────────────────────────────────

/// A commit as reported by history queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub revision: String,
    /// Key id recorded in the commit signature, if the commit is signed.
    pub signing_key: Option<String>,
    pub author_name: String,
    pub author_email: String,
    pub committed_at: DateTime<Utc>,
    pub message: String,
}

impl Commit {
    /// Whether this commit carries a signature made with `key`.
    pub fn is_signed_by(&self, key: &str) -> bool {
        self.signing_key.as_deref().is_some_and(|recorded| signing_keys_match(recorded, key))
    }
}

/// Compare two signing keys by their trailing [`SIGNING_KEY_SUFFIX_LEN`]
/// characters, ignoring case.
pub fn signing_keys_match(recorded: &str, requested: &str) -> bool {
    let recorded = key_suffix(recorded);
    let requested = key_suffix(requested);
    !recorded.is_empty() && recorded.eq_ignore_ascii_case(requested)
}

fn key_suffix(key: &str) -> &str {
    let key = key.trim();
    match key.char_indices().rev().nth(SIGNING_KEY_SUFFIX_LEN - 1) {
        Some((start, _)) => &key[start..],
        None => key,
    }
}

/// Input for exactly one commit creation. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitAction {
    pub message: String,
    /// `Name <email>` override; the checkout identity is used when unset.
    pub author: Option<String>,
    /// Key to sign with; falls back to the checkout's default key.
    pub signing_key: Option<String>,
    /// GnuPG home directory holding `signing_key`.
    pub gpg_home: Option<PathBuf>,
}

impl CommitAction {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), ..Self::default() }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_signing_key(mut self, key: impl Into<String>, gpg_home: Option<PathBuf>) -> Self {
        self.signing_key = Some(key.into());
        self.gpg_home = gpg_home;
        self
    }

    /// The author override, treating an empty string as "not set".
    pub fn author(&self) -> Option<&str> {
        self.author.as_deref().map(str::trim).filter(|author| !author.is_empty())
    }
}

// ── Checkout configuration ──────────────────────────────────────────

/// Configuration fixed when a working checkout is cloned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutConfig {
    pub branch: String,
    pub user_name: String,
    pub user_email: String,
    /// Tag advanced to every pushed commit. Empty disables the tag.
    pub sync_tag: String,
    /// Notes ref, either short (`flux`) or full (`refs/notes/flux`).
    pub notes_ref: String,
    /// Manifest subdirectories relative to the checkout root. Empty means
    /// the root itself.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Marker appended verbatim to every commit message.
    #[serde(default)]
    pub skip_message: Option<String>,
    /// Key used when a commit action does not name one.
    #[serde(default)]
    pub signing_key: Option<String>,
    #[serde(default = "default_push_attempts")]
    pub push_attempts: u32,
}

fn default_push_attempts() -> u32 {
    DEFAULT_PUSH_ATTEMPTS
}

impl CheckoutConfig {
    pub fn new(
        branch: impl Into<String>,
        user_name: impl Into<String>,
        user_email: impl Into<String>,
        sync_tag: impl Into<String>,
        notes_ref: impl Into<String>,
    ) -> Self {
        Self {
            branch: branch.into(),
            user_name: user_name.into(),
            user_email: user_email.into(),
            sync_tag: sync_tag.into(),
            notes_ref: notes_ref.into(),
            paths: Vec::new(),
            skip_message: None,
            signing_key: None,
            push_attempts: DEFAULT_PUSH_ATTEMPTS,
        }
    }

    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_skip_message(mut self, marker: impl Into<String>) -> Self {
        self.skip_message = Some(marker.into());
        self
    }

    pub fn with_signing_key(mut self, key: impl Into<String>) -> Self {
        self.signing_key = Some(key.into());
        self
    }

    pub fn with_push_attempts(mut self, attempts: u32) -> Self {
        self.push_attempts = attempts;
        self
    }

    /// Fully qualified notes ref, e.g. `refs/notes/flux`.
    pub fn notes_ref_full(&self) -> String {
        if self.notes_ref.starts_with("refs/") {
            self.notes_ref.clone()
        } else {
            format!("refs/notes/{}", self.notes_ref)
        }
    }

    pub fn sync_tag(&self) -> Option<&str> {
        Some(self.sync_tag.as_str()).filter(|tag| !tag.is_empty())
    }

    /// Pathspecs for staging and diffing; `.` when no paths are configured.
    pub fn pathspecs(&self) -> Vec<String> {
        if self.paths.is_empty() {
            vec![".".to_string()]
        } else {
            self.paths.clone()
        }
    }

    pub fn validate(&self) -> Result<(), InvalidCheckoutConfig> {
        for (field, value) in [
            ("branch", &self.branch),
            ("user_name", &self.user_name),
            ("user_email", &self.user_email),
            ("notes_ref", &self.notes_ref),
        ] {
            if value.trim().is_empty() {
                return Err(InvalidCheckoutConfig::Missing(field));
            }
        }

        if self.push_attempts == 0 {
            return Err(InvalidCheckoutConfig::ZeroPushAttempts);
        }

        for path in &self.paths {
            let escapes = Path::new(path)
                .components()
                .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
            if path.is_empty() || escapes {
                return Err(InvalidCheckoutConfig::Path(path.clone()));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidCheckoutConfig {
    #[error("checkout config field `{0}` must not be empty")]
    Missing(&'static str),
    #[error("checkout config needs at least one push attempt")]
    ZeroPushAttempts,
    #[error("manifest path '{0}' must be relative and stay inside the checkout")]
    Path(String),
}

// ── Repository status ───────────────────────────────────────────────

/// Lifecycle of the local mirror of a remote repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum RepoStatus {
    /// Nothing has been attempted yet.
    New,
    /// The initial mirror clone is in progress.
    Cloning,
    /// The mirror exists and has been fetched at least once.
    Ready,
    /// The last clone attempt failed; carries the failure message.
    Unreachable(String),
}

impl RepoStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Cloning => "cloning",
            Self::Ready => "ready",
            Self::Unreachable(_) => "unreachable",
        }
    }
}

impl Display for RepoStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable(reason) => write!(f, "unreachable: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}
