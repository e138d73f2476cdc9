//! # steward-vcs
//!
//! Git-backed checkpointing for the Steward pipeline. All git access goes
//! through the [`GitExecutor`] trait so checkpoint logic is testable with a
//! mock executor.

mod checkpoint;
mod command;

pub use checkpoint::CheckpointManager;
pub use command::{GitCommand, GitExecutor, GitOutput, MockGitExecutor};
