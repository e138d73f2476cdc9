//! # steward-runtime
//!
//! Process-level coordination for Steward: the per-project lock file, the
//! machine-wide instance registry with single-writer bot-ownership
//! election, the file-based signal channel between instances, and the
//! stall-detection heartbeat.

mod heartbeat;
mod lock;
mod registry;
mod signal;

pub use heartbeat::HeartbeatWriter;
pub use lock::{pid_alive, LockFile, LockManager};
pub use registry::{InstanceRegistry, InstanceStatus, RegistryFile, RegistryInstance};
pub use signal::{Signal, SignalAction, SignalChannel};
