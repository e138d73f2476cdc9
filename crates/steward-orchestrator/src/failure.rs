//! Failure recording and recovery
//!
//! Every stage failure flows through one handler: classify the error text,
//! record (or re-record) the failure in the manifest, then pick a recovery
//! path. Categories that need a human escalate immediately; a first
//! partial-execution rolls the worktree back to the phase checkpoint and
//! retries; exhausted retry budgets roll back and escalate.

use chrono::Utc;
use steward_core::manifest::{
    CheckpointStatus, FailureEntry, Manifest, ManifestStore, NotificationEntry, PipelineCommand,
    Resolution,
};
use steward_core::taxonomy::{can_retry, classify, ErrorCategory};
use steward_core::Result;
use steward_vcs::CheckpointManager;
use steward_vcs::GitExecutor;
use tracing::{error, info, warn};

/// Recovery path chosen for a recorded failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Retry budget remains; re-run the stage in the same process
    Retry { retries_remaining: u32 },
    /// Worktree was reset to the phase checkpoint; re-run the stage fresh
    RolledBackForRetry { checkpoint: String },
    /// A human must step in; the pipeline stops advancing this phase
    Escalated { rolled_back: bool },
}

/// Classifies failures, records them in the manifest, and applies recovery
pub struct FailureHandler<'a, E: GitExecutor> {
    store: &'a ManifestStore,
    checkpoints: &'a CheckpointManager<E>,
}

impl<'a, E: GitExecutor> FailureHandler<'a, E> {
    pub fn new(store: &'a ManifestStore, checkpoints: &'a CheckpointManager<E>) -> Self {
        Self { store, checkpoints }
    }

    /// Record a stage failure and decide how to recover
    pub async fn handle(
        &self,
        command: PipelineCommand,
        phase: u32,
        details: &str,
    ) -> Result<FailureOutcome> {
        let category = classify(details);
        let spec = category.spec();
        warn!(
            "Stage {} failed in phase {} (category: {})",
            command, phase, category
        );

        let manifest = self.store.update(|m| {
            upsert_failure(m, command, phase, category, details);
        })?;

        let entry = pending_for(&manifest, phase, command)
            .cloned()
            .unwrap_or_else(|| FailureEntry {
                command,
                phase,
                error_category: category,
                timestamp: Utc::now(),
                retry_count: 0,
                max_retries: spec.max_retries,
                checkpoint: None,
                resolution: Resolution::Pending,
                details: details.to_string(),
            });

        if spec.needs_human {
            self.escalate(&entry, false)?;
            return Ok(FailureOutcome::Escalated { rolled_back: false });
        }

        // First partial-execution with a checkpoint gets an automatic
        // rollback-and-retry before spending the ordinary retry budget.
        // Once that rollback has been spent, the next incomplete run for
        // the same stage rolls back again and escalates.
        if category == ErrorCategory::PartialExecution {
            if let Some(tag) = entry.checkpoint.clone() {
                if rollback_spent(&manifest, phase, command) {
                    self.checkpoints.rollback(&tag).await?;
                    self.escalate(&entry, true)?;
                    return Ok(FailureOutcome::Escalated { rolled_back: true });
                }
                if entry.retry_count == 0 {
                    return self.rollback_for_retry(&entry, &tag).await;
                }
            }
        }

        if !can_retry(entry.retry_count, entry.max_retries) {
            let rolled_back = match entry.checkpoint.clone() {
                Some(tag) => {
                    self.checkpoints.rollback(&tag).await?;
                    true
                }
                None => false,
            };
            self.escalate(&entry, rolled_back)?;
            return Ok(FailureOutcome::Escalated { rolled_back });
        }

        let retries_remaining = entry.max_retries - entry.retry_count;
        info!(
            "Retrying {} in phase {} ({} attempts left)",
            command, phase, retries_remaining
        );
        Ok(FailureOutcome::Retry { retries_remaining })
    }

    async fn rollback_for_retry(
        &self,
        entry: &FailureEntry,
        tag: &str,
    ) -> Result<FailureOutcome> {
        info!("Partial execution detected, rolling back to {}", tag);
        self.checkpoints.rollback(tag).await?;

        self.store.update(|m| {
            if let Some(pending) = m.pending_failure_mut(entry.phase, entry.command) {
                pending.resolution = Resolution::AutoRollbackRetry;
            }
            m.notifications.push(NotificationEntry {
                message: format!(
                    "Phase {} {} was incomplete; rolled back to {} and retrying",
                    entry.phase, entry.command, tag
                ),
                blocking: false,
                timestamp: Utc::now(),
                acknowledged: false,
                resource: None,
            });
        })?;

        Ok(FailureOutcome::RolledBackForRetry {
            checkpoint: tag.to_string(),
        })
    }

    fn escalate(&self, entry: &FailureEntry, rolled_back: bool) -> Result<()> {
        error!(
            "Escalating {} failure in phase {} (category: {})",
            entry.command, entry.phase, entry.error_category
        );

        self.store.update(|m| {
            if let Some(pending) = m.pending_failure_mut(entry.phase, entry.command) {
                pending.resolution = if rolled_back {
                    Resolution::RolledBack
                } else {
                    Resolution::EscalatedBlocking
                };
            }
            if rolled_back {
                if let Some(checkpoint) = m
                    .checkpoints
                    .iter_mut()
                    .rev()
                    .find(|c| c.phase == entry.phase && c.status == CheckpointStatus::Active)
                {
                    checkpoint.status = CheckpointStatus::Resolved;
                }
            }
            m.notifications.push(NotificationEntry {
                message: format!(
                    "Phase {} {} needs attention ({}): {}",
                    entry.phase,
                    entry.command,
                    entry.error_category,
                    first_line(&entry.details)
                ),
                blocking: true,
                timestamp: Utc::now(),
                acknowledged: false,
                resource: Some(format!("phase-{}-{}", entry.phase, entry.command)),
            });
        })?;
        Ok(())
    }
}

/// Record a new pending failure for (phase, command), or bump the retry
/// count of the existing one
fn upsert_failure(
    manifest: &mut Manifest,
    command: PipelineCommand,
    phase: u32,
    category: ErrorCategory,
    details: &str,
) {
    if let Some(existing) = manifest.pending_failure_mut(phase, command) {
        existing.retry_count += 1;
        existing.timestamp = Utc::now();
        existing.error_category = category;
        existing.details = details.to_string();
        return;
    }

    let checkpoint = manifest.active_checkpoint(phase).map(|c| c.tag.clone());
    manifest.failures.push(FailureEntry {
        command,
        phase,
        error_category: category,
        timestamp: Utc::now(),
        retry_count: 0,
        max_retries: category.spec().max_retries,
        checkpoint,
        resolution: Resolution::Pending,
        details: details.to_string(),
    });
}

/// True when an earlier failure for (phase, command) already consumed the
/// automatic rollback-and-retry
fn rollback_spent(manifest: &Manifest, phase: u32, command: PipelineCommand) -> bool {
    manifest.failures.iter().any(|f| {
        f.phase == phase
            && f.command == command
            && f.resolution == Resolution::AutoRollbackRetry
    })
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

fn pending_for(
    manifest: &Manifest,
    phase: u32,
    command: PipelineCommand,
) -> Option<&FailureEntry> {
    manifest
        .failures
        .iter()
        .rev()
        .find(|f| f.resolution == Resolution::Pending && f.phase == phase && f.command == command)
}
