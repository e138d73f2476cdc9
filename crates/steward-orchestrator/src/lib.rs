//! # steward-orchestrator
//!
//! The decision-making half of Steward: a pure next-action state machine
//! over the manifest, adaptive session budgets, plan-vs-actual fidelity
//! checking, cross-phase drift detection, failure classification and
//! recovery, and the top-level phase loop that ties them together.

pub mod budget;
pub mod drift;
pub mod failure;
pub mod fidelity;
pub mod runner;
pub mod state_machine;

pub use budget::{BudgetCalculator, RepoSignals};
pub use drift::{DriftReport, DriftRunner, TestRunner};
pub use failure::{FailureHandler, FailureOutcome};
pub use fidelity::FidelityReport;
pub use runner::{PhaseRunner, RunOutcome};
pub use state_machine::{next_action, NextAction};
