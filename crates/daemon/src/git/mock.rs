// Scripted executor for unit tests: records every invocation and replays
// queued results in order.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::error::FailureKind;
use super::runner::{CommandExecutor, CommandResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    /// The arguments joined with spaces, for compact assertions.
    pub fn line(&self) -> String {
        self.args.join(" ")
    }
}

#[derive(Clone)]
pub(crate) struct MockExecutor {
    calls: Arc<Mutex<Vec<Invocation>>>,
    responses: Arc<Mutex<VecDeque<Result<CommandResult, std::io::Error>>>>,
}

impl MockExecutor {
    pub fn new(responses: Vec<Result<CommandResult, std::io::Error>>) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
        }
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().expect("mock calls lock poisoned").clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(Invocation::line).collect()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().expect("mock responses lock poisoned").len()
    }
}

impl CommandExecutor for MockExecutor {
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        env: &[(String, String)],
    ) -> Result<CommandResult, std::io::Error> {
        self.calls.lock().expect("mock calls lock poisoned").push(Invocation {
            program: program.to_string(),
            args: args.to_vec(),
            cwd: cwd.to_path_buf(),
            env: env.to_vec(),
        });

        self.responses
            .lock()
            .expect("mock responses lock poisoned")
            .pop_front()
            .unwrap_or_else(|| panic!("missing mock response for `git {}`", args.join(" ")))
    }
}

pub(crate) fn ok(stdout: &str) -> Result<CommandResult, std::io::Error> {
    Ok(CommandResult { success: true, code: Some(0), stdout: stdout.into(), stderr: String::new() })
}

/// A failed command whose stderr classifies as `kind`.
pub(crate) fn fail(kind: FailureKind) -> Result<CommandResult, std::io::Error> {
    let stderr = match kind {
        FailureKind::NonFastForward => " ! [rejected]        master -> master (fetch first)",
        FailureKind::Network => "fatal: unable to access 'https://example.invalid/'",
        FailureKind::Auth => "fatal: Authentication failed",
        FailureKind::NothingToCommit => "nothing to commit, working tree clean",
        FailureKind::NoNote => "error: no note found for object 3c4d5e.",
        FailureKind::UnknownRevision => "fatal: bad revision 'nope'",
        FailureKind::MissingRemoteRef => "fatal: couldn't find remote ref refs/notes/fluxtest",
        FailureKind::RebaseConflict => "error: could not apply 1a2b3c... Changed file",
        FailureKind::Other => "fatal: something went wrong",
    };
    Ok(CommandResult {
        success: false,
        code: Some(1),
        stdout: String::new(),
        stderr: stderr.into(),
    })
}
