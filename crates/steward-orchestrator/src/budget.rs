//! Adaptive session budgets
//!
//! A 3-task phase and a 40-task phase should not share one turn allowance.
//! Static commands get fixed budgets; code-mutating and validating commands
//! scale a base allowance by an observed unit count, optionally refined by
//! the turns-per-task ratio measured on the previous phase, then clamp to a
//! hard per-command cap so a parsing anomaly cannot produce an unbounded
//! budget. Timeout derives proportionally from the turn budget, also capped.

use regex::Regex;
use std::sync::OnceLock;
use steward_agent::SessionBudget;
use steward_core::config::BudgetConfig;
use steward_core::manifest::{Manifest, PipelineCommand};

/// Observed repo signals feeding the scaling formulas
#[derive(Debug, Clone, Default)]
pub struct RepoSignals {
    /// Staged file count (commit-like work)
    pub staged_files: usize,
    /// Task count parsed from the current phase's plan
    pub plan_tasks: usize,
    /// Source files in the tree (validate-like work)
    pub source_files: usize,
    /// Validation scenarios declared for the phase
    pub scenarios: usize,
    /// Turns-per-task ratio measured on the previous phase, if any
    pub prev_turns_per_task: Option<f64>,
}

impl RepoSignals {
    /// Pull the cross-phase learning signal out of the execution history
    pub fn with_learning_from(mut self, manifest: &Manifest, phase: u32) -> Self {
        if phase > 0 {
            self.prev_turns_per_task = manifest
                .executions
                .iter()
                .rev()
                .find(|e| e.phase == phase - 1)
                .and_then(|e| e.turns_per_task());
        }
        self
    }
}

// Baselines for the scaling formulas
const EXECUTE_TURNS_PER_TASK: f64 = 6.0;
const EXECUTE_MIN_TURNS: u32 = 20;
const VALIDATE_BASE_TURNS: u32 = 10;
const COMMIT_BASE_TURNS: u32 = 5;

// A learned ratio outside this band is a measurement artifact, not a signal
const MIN_LEARNED_RATIO: f64 = 2.0;
const MAX_LEARNED_RATIO: f64 = 15.0;

/// Computes per-invocation budgets from repo signals
pub struct BudgetCalculator {
    config: BudgetConfig,
}

impl BudgetCalculator {
    pub fn new(config: BudgetConfig) -> Self {
        Self { config }
    }

    /// Budget for one command invocation
    pub fn budget_for(&self, command: PipelineCommand, signals: &RepoSignals) -> SessionBudget {
        let (turns, reasoning) = match command {
            PipelineCommand::Preflight => (5, "static preflight budget".to_string()),
            PipelineCommand::Research => (30, "static research budget".to_string()),
            PipelineCommand::CreatePrd => (40, "static requirements budget".to_string()),
            PipelineCommand::Plan => (50, "static planning budget".to_string()),
            PipelineCommand::Execute => {
                let ratio = match signals.prev_turns_per_task {
                    Some(learned) if (MIN_LEARNED_RATIO..=MAX_LEARNED_RATIO).contains(&learned) => {
                        learned
                    }
                    _ => EXECUTE_TURNS_PER_TASK,
                };
                let tasks = signals.plan_tasks.max(1);
                let turns = ((tasks as f64 * ratio).ceil() as u32).max(EXECUTE_MIN_TURNS);
                (
                    turns,
                    format!("{} tasks x {:.1} turns/task", tasks, ratio),
                )
            }
            PipelineCommand::Validate => {
                let turns = VALIDATE_BASE_TURNS
                    + (signals.source_files / 5) as u32
                    + (signals.scenarios * 2) as u32;
                (
                    turns,
                    format!(
                        "{} source files, {} scenarios",
                        signals.source_files, signals.scenarios
                    ),
                )
            }
            PipelineCommand::Commit => {
                let turns = COMMIT_BASE_TURNS + (signals.staged_files / 10) as u32;
                (turns, format!("{} staged files", signals.staged_files))
            }
        };

        let capped_turns = turns.min(self.config.max_turns_cap);
        let timeout_ms =
            (u64::from(capped_turns) * self.config.ms_per_turn).min(self.config.timeout_cap_ms);

        let reasoning = if capped_turns < turns {
            format!("{} (capped from {} turns)", reasoning, turns)
        } else {
            reasoning
        };

        SessionBudget::new(capped_turns, timeout_ms, reasoning)
    }
}

static TASK_LINE: OnceLock<Regex> = OnceLock::new();

/// Count tasks in a plan document: checkbox items and numbered steps
pub fn parse_task_count(plan_text: &str) -> usize {
    let re = TASK_LINE.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:[-*] \[[ xX]\]|\d+\.)\s+\S").unwrap_or_else(|_| unreachable!())
    });
    re.find_iter(plan_text).count()
}
