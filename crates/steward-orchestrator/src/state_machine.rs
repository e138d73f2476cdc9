//! Pure next-action decision for the pipeline
//!
//! This module implements a pure function from manifest to recommendation
//! with NO I/O. Rules are evaluated in strict priority order so exactly one
//! fires; the function is deterministic, total, and never panics.

use chrono::{DateTime, Utc};
use std::fmt;
use steward_core::manifest::{
    Freshness, Manifest, PhaseStatus, PipelineCommand, StageStatus, ValidationStatus,
};
use steward_core::taxonomy;

/// What the orchestrator should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    /// Credential preflight required but not passed
    RunPreflight,
    /// Retry the command behind a pending failure with budget remaining
    Retry { command: PipelineCommand, phase: u32 },
    /// Pending failure out of retries: roll back and escalate
    RollbackAndEscalate {
        command: PipelineCommand,
        phase: u32,
        checkpoint: Option<String>,
    },
    /// Run a pipeline stage for a phase (also the resume path after a crash
    /// left a checkpoint active)
    RunStage { phase: u32, command: PipelineCommand },
    /// Research technology profiles; a topic means queued new-tech research
    Research { topic: Option<String> },
    /// Refresh a stale profile
    RefreshResearch { profile: String },
    /// No requirements document exists yet
    CreateRequirements,
    /// Every phase is complete
    Done,
}

impl fmt::Display for NextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextAction::RunPreflight => write!(f, "run-preflight"),
            NextAction::Retry { command, phase } => {
                write!(f, "retry-{}-phase-{}", command, phase)
            }
            NextAction::RollbackAndEscalate { command, phase, .. } => {
                write!(f, "rollback-and-escalate-{}-phase-{}", command, phase)
            }
            NextAction::RunStage { phase, command } => {
                write!(f, "{}-phase-{}", command, phase)
            }
            NextAction::Research { topic: Some(topic) } => write!(f, "research-{}", topic),
            NextAction::Research { topic: None } => write!(f, "research"),
            NextAction::RefreshResearch { profile } => write!(f, "refresh-research-{}", profile),
            NextAction::CreateRequirements => write!(f, "create-requirements"),
            NextAction::Done => write!(f, "done"),
        }
    }
}

/// Next missing stage for a phase, in pipeline order
fn stage_for(status: &PhaseStatus) -> PipelineCommand {
    if status.plan != StageStatus::Complete {
        PipelineCommand::Plan
    } else if status.execution != StageStatus::Complete {
        PipelineCommand::Execute
    } else if status.validation != ValidationStatus::Pass {
        PipelineCommand::Validate
    } else {
        PipelineCommand::Commit
    }
}

/// Compute the next action for a manifest
///
/// Priority order (exactly one rule fires):
/// 1. preflight required but not passed
/// 2. pending failure with retries remaining
/// 3. pending failure with no retries remaining
/// 4. active checkpoint with no pending failure (resume interrupted phase)
/// 5. no technology profiles
/// 6. any stale profile
/// 7. queued new-technology research
/// 8. no requirements document
/// 9. first incomplete phase's next missing stage
/// 10. done
pub fn next_action(manifest: &Manifest, freshness_window_days: i64, now: DateTime<Utc>) -> NextAction {
    // 1. Preflight gate
    if manifest.preflight_required {
        let passed = manifest.preflight.as_ref().map(|p| p.passed).unwrap_or(false);
        if !passed {
            return NextAction::RunPreflight;
        }
    }

    // 2/3. Pending failure handling beats all pipeline progress
    if let Some(failure) = manifest.pending_failure() {
        if taxonomy::can_retry(failure.retry_count, failure.max_retries)
            && !failure.error_category.spec().needs_human
        {
            return NextAction::Retry {
                command: failure.command,
                phase: failure.phase,
            };
        }
        return NextAction::RollbackAndEscalate {
            command: failure.command,
            phase: failure.phase,
            checkpoint: failure.checkpoint.clone(),
        };
    }

    // 4. Active checkpoint with no pending failure: a previous run was
    // interrupted mid-phase; resume at that phase's next missing stage
    if let Some(checkpoint) = manifest.any_active_checkpoint() {
        let command = manifest
            .phases
            .get(&checkpoint.phase)
            .map(stage_for)
            .unwrap_or(PipelineCommand::Execute);
        return NextAction::RunStage {
            phase: checkpoint.phase,
            command,
        };
    }

    // 5. No profiles at all
    if manifest.profiles.is_empty() {
        return NextAction::Research { topic: None };
    }

    // 6. Stale profile
    if let Some((name, _)) = manifest
        .profiles
        .iter()
        .find(|(_, p)| p.freshness(freshness_window_days, now) == Freshness::Stale)
    {
        return NextAction::RefreshResearch {
            profile: name.clone(),
        };
    }

    // 7. Queued research
    if let Some(topic) = manifest.pending_research.first() {
        return NextAction::Research {
            topic: Some(topic.clone()),
        };
    }

    // 8. Requirements document
    if manifest.requirements_doc.is_none() {
        return NextAction::CreateRequirements;
    }

    // 9. Advance the first incomplete phase
    if manifest.phases.is_empty() {
        return NextAction::RunStage {
            phase: 1,
            command: PipelineCommand::Plan,
        };
    }
    if let Some(phase) = manifest.first_incomplete_phase() {
        let command = manifest
            .phases
            .get(&phase)
            .map(stage_for)
            .unwrap_or(PipelineCommand::Plan);
        return NextAction::RunStage { phase, command };
    }

    // 10. Nothing left
    NextAction::Done
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::Map;
    use steward_core::manifest::{
        CheckpointEntry, CheckpointStatus, FailureEntry, PreflightStatus, ProfileEntry, Resolution,
    };
    use steward_core::taxonomy::ErrorCategory;

    fn base_manifest() -> Manifest {
        let mut manifest = Manifest::default();
        manifest.profiles.insert(
            "rust".to_string(),
            ProfileEntry {
                generated_at: Utc::now(),
                path: None,
                extra: Map::new(),
            },
        );
        manifest.requirements_doc = Some("docs/requirements.md".to_string());
        manifest.phases.insert(1, PhaseStatus::default());
        manifest
    }

    fn failure(
        command: PipelineCommand,
        phase: u32,
        category: ErrorCategory,
        retry_count: u32,
        max_retries: u32,
    ) -> FailureEntry {
        FailureEntry {
            command,
            phase,
            error_category: category,
            timestamp: Utc::now(),
            retry_count,
            max_retries,
            checkpoint: Some("checkpoint/phase-1-1".to_string()),
            resolution: Resolution::Pending,
            details: "details".to_string(),
        }
    }

    #[test]
    fn test_preflight_beats_everything() {
        let mut manifest = base_manifest();
        manifest.preflight_required = true;
        manifest
            .failures
            .push(failure(PipelineCommand::Execute, 1, ErrorCategory::TestFailure, 0, 3));
        assert_eq!(next_action(&manifest, 7, Utc::now()), NextAction::RunPreflight);

        manifest.preflight = Some(PreflightStatus {
            passed: true,
            checked_at: Utc::now(),
            details: None,
        });
        assert_ne!(next_action(&manifest, 7, Utc::now()), NextAction::RunPreflight);
    }

    #[test]
    fn test_pending_retryable_failure_beats_missing_plan() {
        let mut manifest = base_manifest();
        // Phase 2 has no plan; phase 1 execute failed with retries left
        manifest.phases.insert(2, PhaseStatus::default());
        manifest
            .failures
            .push(failure(PipelineCommand::Execute, 1, ErrorCategory::TestFailure, 1, 3));

        assert_eq!(
            next_action(&manifest, 7, Utc::now()),
            NextAction::Retry {
                command: PipelineCommand::Execute,
                phase: 1
            }
        );
    }

    #[test]
    fn test_exhausted_failure_escalates() {
        let mut manifest = base_manifest();
        manifest
            .failures
            .push(failure(PipelineCommand::Validate, 1, ErrorCategory::TestFailure, 3, 3));

        match next_action(&manifest, 7, Utc::now()) {
            NextAction::RollbackAndEscalate { command, phase, checkpoint } => {
                assert_eq!(command, PipelineCommand::Validate);
                assert_eq!(phase, 1);
                assert_eq!(checkpoint.as_deref(), Some("checkpoint/phase-1-1"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_needs_human_failure_escalates_despite_retries() {
        let mut manifest = base_manifest();
        manifest
            .failures
            .push(failure(PipelineCommand::Execute, 1, ErrorCategory::IntegrationAuth, 0, 3));
        assert!(matches!(
            next_action(&manifest, 7, Utc::now()),
            NextAction::RollbackAndEscalate { .. }
        ));
    }

    #[test]
    fn test_active_checkpoint_resumes_phase_stage() {
        let mut manifest = base_manifest();
        manifest.phases.insert(
            1,
            PhaseStatus {
                plan: StageStatus::Complete,
                execution: StageStatus::NotStarted,
                validation: ValidationStatus::NotStarted,
            },
        );
        manifest.checkpoints.push(CheckpointEntry {
            tag: "checkpoint/phase-1-1".to_string(),
            phase: 1,
            status: CheckpointStatus::Active,
            created_at: Utc::now(),
        });

        assert_eq!(
            next_action(&manifest, 7, Utc::now()),
            NextAction::RunStage {
                phase: 1,
                command: PipelineCommand::Execute
            }
        );
    }

    #[test]
    fn test_resolved_checkpoint_does_not_resume() {
        let mut manifest = base_manifest();
        manifest.checkpoints.push(CheckpointEntry {
            tag: "checkpoint/phase-1-1".to_string(),
            phase: 1,
            status: CheckpointStatus::Resolved,
            created_at: Utc::now(),
        });
        assert_eq!(
            next_action(&manifest, 7, Utc::now()),
            NextAction::RunStage {
                phase: 1,
                command: PipelineCommand::Plan
            }
        );
    }

    #[test]
    fn test_no_profiles_means_research() {
        let mut manifest = base_manifest();
        manifest.profiles.clear();
        assert_eq!(
            next_action(&manifest, 7, Utc::now()),
            NextAction::Research { topic: None }
        );
    }

    #[test]
    fn test_stale_profile_refreshes() {
        let mut manifest = base_manifest();
        manifest.profiles.insert(
            "postgres".to_string(),
            ProfileEntry {
                generated_at: Utc::now() - Duration::days(30),
                path: None,
                extra: Map::new(),
            },
        );
        assert_eq!(
            next_action(&manifest, 7, Utc::now()),
            NextAction::RefreshResearch {
                profile: "postgres".to_string()
            }
        );
    }

    #[test]
    fn test_queued_research_after_freshness() {
        let mut manifest = base_manifest();
        manifest.pending_research.push("grpc".to_string());
        assert_eq!(
            next_action(&manifest, 7, Utc::now()),
            NextAction::Research {
                topic: Some("grpc".to_string())
            }
        );
    }

    #[test]
    fn test_missing_requirements_doc() {
        let mut manifest = base_manifest();
        manifest.requirements_doc = None;
        assert_eq!(next_action(&manifest, 7, Utc::now()), NextAction::CreateRequirements);
    }

    #[test]
    fn test_stage_progression_within_phase() {
        let mut manifest = base_manifest();
        assert_eq!(
            next_action(&manifest, 7, Utc::now()),
            NextAction::RunStage {
                phase: 1,
                command: PipelineCommand::Plan
            }
        );

        manifest.phases.get_mut(&1).unwrap().plan = StageStatus::Complete;
        assert_eq!(
            next_action(&manifest, 7, Utc::now()),
            NextAction::RunStage {
                phase: 1,
                command: PipelineCommand::Execute
            }
        );

        manifest.phases.get_mut(&1).unwrap().execution = StageStatus::Complete;
        assert_eq!(
            next_action(&manifest, 7, Utc::now()),
            NextAction::RunStage {
                phase: 1,
                command: PipelineCommand::Validate
            }
        );
    }

    #[test]
    fn test_all_phases_complete_is_done() {
        let mut manifest = base_manifest();
        manifest.phases.insert(
            1,
            PhaseStatus {
                plan: StageStatus::Complete,
                execution: StageStatus::Complete,
                validation: ValidationStatus::Pass,
            },
        );
        assert_eq!(next_action(&manifest, 7, Utc::now()), NextAction::Done);
    }

    #[test]
    fn test_auto_rollback_retry_resolution_recommends_fresh_execute() {
        // End-to-end recovery scenario: an execute failure was classified
        // partial_execution, rolled back, and marked auto_rollback_retry.
        // The entry is no longer pending, but the checkpoint stays active,
        // so the next recommendation is a fresh execute, not a rollback.
        let mut manifest = base_manifest();
        manifest.phases.insert(
            1,
            PhaseStatus {
                plan: StageStatus::Complete,
                execution: StageStatus::NotStarted,
                validation: ValidationStatus::NotStarted,
            },
        );
        manifest.failures.push(FailureEntry {
            command: PipelineCommand::Execute,
            phase: 1,
            error_category: ErrorCategory::PartialExecution,
            timestamp: Utc::now(),
            retry_count: 0,
            max_retries: 2,
            checkpoint: Some("checkpoint/phase-1-9".to_string()),
            resolution: Resolution::AutoRollbackRetry,
            details: "half-finished".to_string(),
        });
        manifest.checkpoints.push(CheckpointEntry {
            tag: "checkpoint/phase-1-9".to_string(),
            phase: 1,
            status: CheckpointStatus::Active,
            created_at: Utc::now(),
        });

        assert_eq!(
            next_action(&manifest, 7, Utc::now()),
            NextAction::RunStage {
                phase: 1,
                command: PipelineCommand::Execute
            }
        );
    }

    #[test]
    fn test_action_display_for_observability() {
        assert_eq!(NextAction::RunPreflight.to_string(), "run-preflight");
        assert_eq!(
            NextAction::RunStage {
                phase: 2,
                command: PipelineCommand::Plan
            }
            .to_string(),
            "plan-phase-2"
        );
        assert_eq!(NextAction::Done.to_string(), "done");
    }
}
