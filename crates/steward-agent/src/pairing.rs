//! Command pairings
//!
//! A pairing is a short ordered list of prompts where the first creates a
//! session and the rest resume it, sharing one context window. Several
//! pipeline steps are cheaper this way ("load context", then "do the work").

use crate::session::SessionManager;
use crate::types::{SessionBudget, SessionResult};
use steward_core::Result;
use tracing::info;

/// Outcome of running a pairing to completion or first failure
#[derive(Debug)]
pub struct PairingResult {
    pub session_id: String,
    pub results: Vec<SessionResult>,
}

impl PairingResult {
    /// The final step's result; a pairing always has at least one step
    pub fn last(&self) -> &SessionResult {
        self.results
            .last()
            .unwrap_or_else(|| unreachable!("pairing produced no results"))
    }

    pub fn succeeded(&self) -> bool {
        self.results.iter().all(SessionResult::succeeded)
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.results.iter().map(|r| r.cost_usd).sum()
    }

    pub fn total_turns(&self) -> u32 {
        self.results.iter().map(|r| r.turns).sum()
    }
}

/// Run a pairing: create on the first prompt, resume on the rest
///
/// Stops at the first step whose result carries an error; later steps would
/// build on broken context.
pub async fn run_pairing(
    manager: &SessionManager,
    prompts: &[String],
    budget: &SessionBudget,
) -> Result<PairingResult> {
    assert!(!prompts.is_empty(), "pairing requires at least one prompt");

    info!("Running pairing of {} prompt(s)", prompts.len());

    let first = manager.create_session(&prompts[0], budget).await?;
    let session_id = first.session_id.clone();
    let failed = !first.succeeded();
    let mut results = vec![first];

    if !failed {
        for prompt in &prompts[1..] {
            let result = manager.resume_session(&session_id, prompt, budget).await?;
            let stop = !result.succeeded();
            results.push(result);
            if stop {
                break;
            }
        }
    }

    Ok(PairingResult {
        session_id,
        results,
    })
}
