// gitsync-common: value types and the note codec shared by gitsync crates

pub mod note;
pub mod types;
