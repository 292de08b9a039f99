// JSON codec for commit notes.
//
// The note store treats payloads as opaque: callers pick the type, the codec
// only guarantees that an encoded value decodes back to an equal value.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NoteError {
    #[error("note could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("note could not be decoded: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode a note as single-line JSON so git's message cleanup leaves it alone.
pub fn encode_note<T: Serialize + ?Sized>(note: &T) -> Result<String, NoteError> {
    serde_json::to_string(note).map_err(NoteError::Encode)
}

pub fn decode_note<T: DeserializeOwned>(raw: &str) -> Result<T, NoteError> {
    serde_json::from_str(raw.trim_end()).map_err(NoteError::Decode)
}
