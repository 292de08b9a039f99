// The single chokepoint through which every git invocation flows.
//
// `CommandExecutor` spawns a process and captures its output. `GitRunner`
// adds the policy on top: context cancellation and deadlines, a default
// per-command timeout, redacted command strings and failure classification.

use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;
use url::Url;

use super::context::Context;
use super::error::{FailureKind, ProcessError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Spawns a program and waits for it. Dropping the returned future must stop
/// the process.
pub trait CommandExecutor: Send + Sync {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        env: &[(String, String)],
    ) -> impl Future<Output = Result<CommandResult, std::io::Error>> + Send;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessCommandExecutor;

impl CommandExecutor for ProcessCommandExecutor {
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        env: &[(String, String)],
    ) -> Result<CommandResult, std::io::Error> {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            command.env(key, value);
        }

        let output = command.output().await?;
        Ok(CommandResult {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GitRunner<E = ProcessCommandExecutor> {
    executor: E,
    timeout: Option<Duration>,
}

impl GitRunner<ProcessCommandExecutor> {
    pub fn new() -> Self {
        Self { executor: ProcessCommandExecutor, timeout: None }
    }
}

impl Default for GitRunner<ProcessCommandExecutor> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: CommandExecutor> GitRunner<E> {
    pub fn with_executor(executor: E) -> Self {
        Self { executor, timeout: None }
    }

    /// Bound every command by `timeout` in addition to the caller's context.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub async fn run(
        &self,
        ctx: &Context,
        cwd: &Path,
        args: &[&str],
    ) -> Result<String, ProcessError> {
        self.run_with_env(ctx, cwd, args, &[]).await
    }

    /// Run `git <args>` in `cwd` with `env` layered over the inherited
    /// environment. Returns stdout on success.
    pub async fn run_with_env(
        &self,
        ctx: &Context,
        cwd: &Path,
        args: &[&str],
        env: &[(String, String)],
    ) -> Result<String, ProcessError> {
        let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        let command = display_command(&args);

        let ctx = match self.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };
        if let Some(done) = ctx.done_reason() {
            return Err(ProcessError::interrupted(command, done));
        }

        debug!(command = %command, cwd = %cwd.display(), "running git");
        let result = tokio::select! {
            biased;
            done = ctx.done() => {
                debug!(command = %command, reason = %done, "git command interrupted");
                return Err(ProcessError::interrupted(command, done));
            }
            result = self.executor.execute("git", &args, cwd, env) => result,
        };

        let result =
            result.map_err(|source| ProcessError::Spawn { command: command.clone(), source })?;
        if result.success {
            return Ok(result.stdout);
        }

        let stderr = if result.stderr.trim().is_empty() { result.stdout } else { result.stderr };
        let kind = FailureKind::classify(&stderr);
        debug!(command = %command, code = ?result.code, ?kind, "git command failed");

        Err(ProcessError::Exit { command, code: result.code, stderr, kind })
    }
}

/// Render a command line for logs and errors: signing keys are hidden and
/// credentials are stripped from URLs.
fn display_command(args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push("git".to_string());
    for arg in args {
        let part = if arg.starts_with("--gpg-sign=") {
            "--gpg-sign=<redacted>".to_string()
        } else {
            redact_url(arg)
        };
        parts.push(part);
    }
    parts.join(" ")
}

/// Strip a password or token from a URL; other strings pass through.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("redacted"));
            url.to_string()
        }
        _ => raw.to_string(),
    }
}
