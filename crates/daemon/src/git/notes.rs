// Commit notes stored under a dedicated ref namespace.
//
// A missing note is a normal state (`Ok(None)`), distinct from a note that
// exists but does not decode.

use std::collections::HashSet;
use std::path::Path;

use gitsync_common::note::{decode_note, encode_note};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::context::Context;
use super::error::{FailureKind, GitError};
use super::runner::{CommandExecutor, GitRunner};

/// Note access for one repository directory and one notes ref.
pub struct NoteStore<'a, E> {
    runner: &'a GitRunner<E>,
    dir: &'a Path,
    notes_ref: String,
}

impl<'a, E: CommandExecutor> NoteStore<'a, E> {
    /// `notes_ref` must be fully qualified (`refs/notes/...`).
    pub fn new(runner: &'a GitRunner<E>, dir: &'a Path, notes_ref: impl Into<String>) -> Self {
        Self { runner, dir, notes_ref: notes_ref.into() }
    }

    pub fn notes_ref(&self) -> &str {
        &self.notes_ref
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        revision: &str,
    ) -> Result<Option<T>, GitError> {
        let Some(raw) = self.get_raw(ctx, revision).await? else {
            return Ok(None);
        };
        decode_note(&raw)
            .map(Some)
            .map_err(|source| GitError::DecodeNote { revision: revision.to_string(), source })
    }

    /// Attach `note` to `revision`, replacing any existing note.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        revision: &str,
        note: &T,
    ) -> Result<(), GitError> {
        let raw = encode_note(note)
            .map_err(|source| GitError::EncodeNote { revision: revision.to_string(), source })?;
        self.set_raw(ctx, revision, &raw).await
    }

    // `show` output and `add -m` input both pass through git's whitespace
    // cleanup, so raw text only round-trips for single-line payloads.
    pub(crate) async fn get_raw(
        &self,
        ctx: &Context,
        revision: &str,
    ) -> Result<Option<String>, GitError> {
        let args = ["notes", "--ref", self.notes_ref.as_str(), "show", revision];
        match self.runner.run(ctx, self.dir, &args).await {
            Ok(raw) => Ok(Some(raw)),
            Err(error) if error.is(FailureKind::NoNote) => {
                debug!(revision, notes_ref = %self.notes_ref, "no note on revision");
                Ok(None)
            }
            Err(source) => Err(GitError::Note { revision: revision.to_string(), source }),
        }
    }

    pub(crate) async fn set_raw(
        &self,
        ctx: &Context,
        revision: &str,
        raw: &str,
    ) -> Result<(), GitError> {
        let notes_ref = self.notes_ref.as_str();
        let args = ["notes", "--ref", notes_ref, "add", "-f", "-m", raw, revision];
        self.runner
            .run(ctx, self.dir, &args)
            .await
            .map(|_| ())
            .map_err(|source| GitError::Note { revision: revision.to_string(), source })
    }

    /// Commit ids that carry a note under this ref.
    pub async fn list(&self, ctx: &Context) -> Result<HashSet<String>, GitError> {
        let args = ["notes", "--ref", self.notes_ref.as_str(), "list"];
        let out = self
            .runner
            .run(ctx, self.dir, &args)
            .await
            .map_err(|source| GitError::Note { revision: self.notes_ref.clone(), source })?;
        Ok(parse_note_list(&out))
    }
}

/// `git notes list` prints `<note blob> <annotated object>` per line.
fn parse_note_list(out: &str) -> HashSet<String> {
    out.lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}
