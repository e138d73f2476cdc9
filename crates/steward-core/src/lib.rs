//! # steward-core
//!
//! Core types for the Steward autonomous delivery-pipeline orchestrator.
//!
//! Steward drives a plan → execute → validate → commit pipeline by
//! repeatedly invoking an external coding agent through short-lived
//! sessions. Everything the pipeline knows lives in one manifest document;
//! this crate owns that manifest, the failure taxonomy that decides how the
//! pipeline recovers, and the structured-field protocol spoken with the
//! agent.

pub mod config;
pub mod hooks;
pub mod manifest;
pub mod taxonomy;

mod error;

pub use error::{Result, StewardError};
