// Git plumbing: command runner, mirror handle, working checkouts, commits
// and notes.

pub mod checkout;
pub mod commit;
pub mod context;
pub mod error;
pub mod notes;
pub mod repo;
pub mod runner;
pub mod sync_loop;

#[cfg(test)]
pub(crate) mod mock;

pub use checkout::Checkout;
pub use context::{Context, Done};
pub use error::{FailureKind, GitError, ProcessError};
pub use repo::{Repo, RepoOptions};
pub use sync_loop::SyncLoopHandle;
