//! # steward-agent
//!
//! Session manager for the external coding agent. The agent is a black box:
//! `(prompt, resumable-session-id?, budget) → (text, structured fields,
//! cost, turns, error?)`. This crate owns the subprocess plumbing, the
//! typed event-stream fold, budget enforcement, and pairings.

mod pairing;
mod progress;
mod session;
mod types;

pub use pairing::{run_pairing, PairingResult};
pub use progress::ProgressGate;
pub use session::{ProgressFn, SessionManager};
pub use types::{SessionBudget, SessionFailure, SessionResult, StreamEvent};
