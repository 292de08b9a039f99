// Error taxonomy for git operations.
//
// `ProcessError` describes one failed invocation of the git binary.
// `GitError` is what public repository and checkout operations return; every
// variant names the operation that failed and keeps the process error as its
// source.

use gitsync_common::note::NoteError;
use gitsync_common::types::{InvalidCheckoutConfig, RepoStatus};
use thiserror::Error;

use super::context::Done;

/// Classification of a non-zero git exit, derived from stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The remote rejected a push because it has moved on.
    NonFastForward,
    /// The remote could not be reached.
    Network,
    /// The remote refused our credentials.
    Auth,
    /// Commit attempted with nothing staged.
    NothingToCommit,
    /// `git notes show` on a commit without a note.
    NoNote,
    /// A revision or ref could not be resolved locally.
    UnknownRevision,
    /// A refspec named a ref the remote does not have.
    MissingRemoteRef,
    /// A rebase stopped on conflicting changes.
    RebaseConflict,
    Other,
}

const NON_FAST_FORWARD: &[&str] = &[
    "non-fast-forward",
    "[rejected]",
    "fetch first",
    "cannot lock ref",
    "failed to update ref",
    "stale info",
];
const NOTHING_TO_COMMIT: &[&str] =
    &["nothing to commit", "nothing added to commit", "no changes added to commit"];
const NO_NOTE: &[&str] = &["no note found"];
const MISSING_REMOTE_REF: &[&str] = &["couldn't find remote ref"];
const REBASE_CONFLICT: &[&str] = &["could not apply", "resolve all conflicts", "conflict ("];
const UNKNOWN_REVISION: &[&str] = &[
    "unknown revision",
    "bad revision",
    "needed a single revision",
    "does not have any commits yet",
    "not a valid object name",
    "ambiguous argument",
];
const AUTH: &[&str] = &[
    "authentication failed",
    "permission denied",
    "could not read username",
    "terminal prompts disabled",
];
const NETWORK: &[&str] = &[
    "could not resolve host",
    "connection refused",
    "connection timed out",
    "network is unreachable",
    "unable to access",
    "could not read from remote repository",
    "does not appear to be a git repository",
];

impl FailureKind {
    /// Classify a failed command from its diagnostic output. This is the only
    /// place stderr text is interpreted.
    pub fn classify(stderr: &str) -> Self {
        let text = stderr.to_ascii_lowercase();
        let matches = |patterns: &[&str]| patterns.iter().any(|pattern| text.contains(pattern));

        if matches(NON_FAST_FORWARD) {
            FailureKind::NonFastForward
        } else if matches(NOTHING_TO_COMMIT) {
            FailureKind::NothingToCommit
        } else if matches(NO_NOTE) {
            FailureKind::NoNote
        } else if matches(MISSING_REMOTE_REF) {
            FailureKind::MissingRemoteRef
        } else if matches(REBASE_CONFLICT) {
            FailureKind::RebaseConflict
        } else if matches(UNKNOWN_REVISION) {
            FailureKind::UnknownRevision
        } else if matches(AUTH) {
            FailureKind::Auth
        } else if matches(NETWORK) {
            FailureKind::Network
        } else {
            FailureKind::Other
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed with code {code:?}: {}", .stderr.trim())]
    Exit { command: String, code: Option<i32>, stderr: String, kind: FailureKind },
    #[error("`{command}` was cancelled")]
    Cancelled { command: String },
    #[error("`{command}` exceeded its deadline")]
    TimedOut { command: String },
}

impl ProcessError {
    pub(crate) fn interrupted(command: String, done: Done) -> Self {
        match done {
            Done::Cancelled => ProcessError::Cancelled { command },
            Done::DeadlineExceeded => ProcessError::TimedOut { command },
        }
    }

    pub fn command(&self) -> &str {
        match self {
            ProcessError::Spawn { command, .. }
            | ProcessError::Exit { command, .. }
            | ProcessError::Cancelled { command }
            | ProcessError::TimedOut { command } => command,
        }
    }

    /// Failure class for non-zero exits; `None` for spawn failures and
    /// interruptions.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            ProcessError::Exit { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is(&self, kind: FailureKind) -> bool {
        self.kind() == Some(kind)
    }

    /// True when the command was stopped by its context rather than
    /// rejected by git.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProcessError::Cancelled { .. } | ProcessError::TimedOut { .. })
    }
}

#[derive(Debug, Error)]
pub enum GitError {
    #[error("repository {origin} is not ready ({status}){}", cause_suffix(.cause))]
    NotReady { origin: String, status: RepoStatus, cause: Option<Done> },

    #[error("fetch from {origin} failed: {source}")]
    Fetch {
        origin: String,
        #[source]
        source: ProcessError,
    },

    #[error("clone of branch '{branch}' failed: {source}")]
    Clone {
        branch: String,
        #[source]
        source: ProcessError,
    },

    #[error("commit failed: {source}")]
    Commit {
        #[source]
        source: ProcessError,
    },

    #[error("commit {revision} is signed with {found:?}, expected a key ending in {expected}")]
    SigningKeyMismatch { revision: String, expected: String, found: Option<String> },

    #[error("push of branch '{branch}' failed after {attempts} attempt(s): {source}")]
    Push {
        branch: String,
        attempts: u32,
        #[source]
        source: ProcessError,
    },

    #[error("cannot resolve revision '{revision}': {source}")]
    Resolve {
        revision: String,
        #[source]
        source: ProcessError,
    },

    #[error("history query for '{revision}' failed: {source}")]
    History {
        revision: String,
        #[source]
        source: ProcessError,
    },

    #[error("unexpected history output for '{revision}': {reason}")]
    HistoryFormat { revision: String, reason: String },

    #[error("note operation on '{revision}' failed: {source}")]
    Note {
        revision: String,
        #[source]
        source: ProcessError,
    },

    #[error("note on '{revision}' is malformed: {source}")]
    DecodeNote {
        revision: String,
        #[source]
        source: NoteError,
    },

    #[error("note for '{revision}' cannot be encoded: {source}")]
    EncodeNote {
        revision: String,
        #[source]
        source: NoteError,
    },

    #[error(transparent)]
    Config(#[from] InvalidCheckoutConfig),

    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl GitError {
    pub(crate) fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        GitError::Io { operation: operation.into(), source }
    }

    /// The underlying process failure, when there is one.
    pub fn process_error(&self) -> Option<&ProcessError> {
        match self {
            GitError::Fetch { source, .. }
            | GitError::Clone { source, .. }
            | GitError::Commit { source }
            | GitError::Push { source, .. }
            | GitError::Resolve { source, .. }
            | GitError::History { source, .. }
            | GitError::Note { source, .. } => Some(source),
            _ => None,
        }
    }

    /// True when the operation stopped because its context was cancelled or
    /// timed out, as opposed to git rejecting it.
    pub fn is_cancelled(&self) -> bool {
        match self {
            GitError::NotReady { cause, .. } => cause.is_some(),
            other => other.process_error().is_some_and(ProcessError::is_cancelled),
        }
    }

    pub fn is_nothing_to_commit(&self) -> bool {
        matches!(self, GitError::Commit { source } if source.is(FailureKind::NothingToCommit))
    }
}

fn cause_suffix(cause: &Option<Done>) -> String {
    cause.map(|done| format!(": {done}")).unwrap_or_default()
}
