//! Pending approvals
//!
//! An approval is a question the pipeline cannot answer on its own (use a
//! real integration, a fixture, or skip?). Each pending approval holds a
//! oneshot responder and a reminder timer; resolution happens exactly once,
//! and resolving aborts the reminder.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// What the human chose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    UseFixture,
    Skip,
}

impl ApprovalDecision {
    /// Callback payloads carried by the inline keyboard
    pub fn parse(data: &str) -> Option<Self> {
        match data {
            "approve" => Some(ApprovalDecision::Approve),
            "use-fixture" => Some(ApprovalDecision::UseFixture),
            "skip" => Some(ApprovalDecision::Skip),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalDecision::Approve => "approve",
            ApprovalDecision::UseFixture => "use-fixture",
            ApprovalDecision::Skip => "skip",
        }
    }

    /// `(label, callback_data)` rows for the inline keyboard; payloads carry
    /// the resource so the callback handler can route the decision back
    pub fn keyboard_for(resource: &str) -> [(String, String); 3] {
        [
            ("Approve".to_string(), format!("{}:approve", resource)),
            ("Use fixture".to_string(), format!("{}:use-fixture", resource)),
            ("Skip".to_string(), format!("{}:skip", resource)),
        ]
    }
}

struct PendingApproval {
    responder: oneshot::Sender<ApprovalDecision>,
    reminder: JoinHandle<()>,
}

/// Tracks approvals keyed by resource name
#[derive(Clone)]
pub struct ApprovalManager {
    pending: Arc<Mutex<HashMap<String, PendingApproval>>>,
    reminder_after: Duration,
}

impl ApprovalManager {
    pub fn new(reminder_after: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            reminder_after,
        }
    }

    /// Register a pending approval; the returned receiver resolves when a
    /// decision arrives. `remind` fires once if nobody answers in time.
    pub fn request<F>(&self, resource: &str, remind: F) -> oneshot::Receiver<ApprovalDecision>
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let delay = self.reminder_after;
        let reminder = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            remind();
        });

        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(stale) = pending.insert(
            resource.to_string(),
            PendingApproval {
                responder: tx,
                reminder,
            },
        ) {
            // Re-asking supersedes the earlier question
            warn!("Replacing stale approval for '{}'", resource);
            stale.reminder.abort();
        }
        rx
    }

    /// Deliver a decision; returns false when nothing was pending (already
    /// resolved, or an unknown resource)
    pub fn resolve(&self, resource: &str, decision: ApprovalDecision) -> bool {
        let entry = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            pending.remove(resource)
        };
        match entry {
            Some(approval) => {
                approval.reminder.abort();
                info!("Approval '{}' resolved: {:?}", resource, decision);
                approval.responder.send(decision).is_ok()
            }
            None => false,
        }
    }

    pub fn pending_resources(&self) -> Vec<String> {
        let pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.keys().cloned().collect()
    }
}
