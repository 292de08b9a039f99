// gitsync-daemon library: git-backed working copies for a delivery
// controller.

pub mod config;
pub mod git;
pub mod runtime;
