//! Error taxonomy and failure classifier
//!
//! A fixed table of failure categories drives retry bookkeeping and
//! escalation. Classification is keyword matching against free-form error
//! text in a fixed precedence order (most specific first) with a guaranteed
//! fallback, so it can never fail or panic.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Closed set of failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    SyntaxError,
    TestFailure,
    ScenarioMismatch,
    IntegrationAuth,
    IntegrationRateLimit,
    StaleArtifact,
    PrdGap,
    PartialExecution,
    LineBudgetExceeded,
    OrchestratorCrash,
    ManifestCorruption,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::SyntaxError => "syntax_error",
            ErrorCategory::TestFailure => "test_failure",
            ErrorCategory::ScenarioMismatch => "scenario_mismatch",
            ErrorCategory::IntegrationAuth => "integration_auth",
            ErrorCategory::IntegrationRateLimit => "integration_rate_limit",
            ErrorCategory::StaleArtifact => "stale_artifact",
            ErrorCategory::PrdGap => "prd_gap",
            ErrorCategory::PartialExecution => "partial_execution",
            ErrorCategory::LineBudgetExceeded => "line_budget_exceeded",
            ErrorCategory::OrchestratorCrash => "orchestrator_crash",
            ErrorCategory::ManifestCorruption => "manifest_corruption",
        };
        write!(f, "{}", name)
    }
}

/// Severity tier of a category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Stop the pipeline and escalate to a human
    Blocking,
    /// Retry inline, typically with a larger budget
    Degraded,
    /// Log and continue
    Advisory,
}

/// Recovery action recommended for a category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    RetryLargerBudget,
    Rollback,
    RefreshArtifact,
    Escalate,
}

/// Fixed per-category policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategorySpec {
    pub max_retries: u32,
    pub needs_human: bool,
    pub recovery: RecoveryAction,
    pub severity: Severity,
}

impl ErrorCategory {
    /// Policy table; exhaustive so adding a category is compile-checked
    pub fn spec(&self) -> CategorySpec {
        match self {
            ErrorCategory::SyntaxError => CategorySpec {
                max_retries: 3,
                needs_human: false,
                recovery: RecoveryAction::Retry,
                severity: Severity::Degraded,
            },
            ErrorCategory::TestFailure => CategorySpec {
                max_retries: 3,
                needs_human: false,
                recovery: RecoveryAction::Retry,
                severity: Severity::Degraded,
            },
            ErrorCategory::ScenarioMismatch => CategorySpec {
                max_retries: 2,
                needs_human: false,
                recovery: RecoveryAction::Retry,
                severity: Severity::Degraded,
            },
            ErrorCategory::IntegrationAuth => CategorySpec {
                max_retries: 0,
                needs_human: true,
                recovery: RecoveryAction::Escalate,
                severity: Severity::Blocking,
            },
            ErrorCategory::IntegrationRateLimit => CategorySpec {
                max_retries: 5,
                needs_human: false,
                recovery: RecoveryAction::Retry,
                severity: Severity::Degraded,
            },
            ErrorCategory::StaleArtifact => CategorySpec {
                max_retries: 1,
                needs_human: false,
                recovery: RecoveryAction::RefreshArtifact,
                severity: Severity::Advisory,
            },
            ErrorCategory::PrdGap => CategorySpec {
                max_retries: 0,
                needs_human: true,
                recovery: RecoveryAction::Escalate,
                severity: Severity::Blocking,
            },
            ErrorCategory::PartialExecution => CategorySpec {
                max_retries: 2,
                needs_human: false,
                recovery: RecoveryAction::Rollback,
                severity: Severity::Degraded,
            },
            ErrorCategory::LineBudgetExceeded => CategorySpec {
                max_retries: 1,
                needs_human: false,
                recovery: RecoveryAction::RetryLargerBudget,
                severity: Severity::Degraded,
            },
            ErrorCategory::OrchestratorCrash => CategorySpec {
                max_retries: 1,
                needs_human: false,
                recovery: RecoveryAction::Rollback,
                severity: Severity::Degraded,
            },
            ErrorCategory::ManifestCorruption => CategorySpec {
                max_retries: 0,
                needs_human: true,
                recovery: RecoveryAction::Escalate,
                severity: Severity::Blocking,
            },
        }
    }
}

// Precedence-ordered keyword table. Most specific categories first:
// crash/corruption before auth, auth/rate-limit before generic syntax.
static PATTERNS: OnceLock<Vec<(Regex, ErrorCategory)>> = OnceLock::new();

fn patterns() -> &'static [(Regex, ErrorCategory)] {
    PATTERNS.get_or_init(|| {
        // Patterns are fixed strings; compilation cannot fail at runtime
        // for anything a caller passes in.
        let table: &[(&str, ErrorCategory)] = &[
            (
                r"(?i)manifest.*(corrupt|invalid|parse error|malformed)",
                ErrorCategory::ManifestCorruption,
            ),
            (
                r"(?i)(orchestrator|process).*(crash|panic|killed)|\bpanicked at\b|\bSIGKILL\b|\bSIGSEGV\b",
                ErrorCategory::OrchestratorCrash,
            ),
            (
                r"(?i)\b(unauthorized|forbidden|credential|authentication|invalid[ _]api[ _]key|token expired)\b|\b401\b|\b403\b",
                ErrorCategory::IntegrationAuth,
            ),
            (
                r"(?i)rate.?limit|too many requests|quota exceeded|\b429\b",
                ErrorCategory::IntegrationRateLimit,
            ),
            (
                r"(?i)stale (profile|artifact|plan)|out.of.date (profile|reference)|regenerate (profile|research)",
                ErrorCategory::StaleArtifact,
            ),
            (
                r"(?i)(prd|requirements?).*(gap|missing|ambiguous|unclear|contradict)",
                ErrorCategory::PrdGap,
            ),
            (
                r"(?i)line.?budget|exceeds? .{0,20}line limit|file too (long|large)",
                ErrorCategory::LineBudgetExceeded,
            ),
            (
                r"(?i)scenario.?mismatch|unexpected scenario|fixture.*(mismatch|missing)",
                ErrorCategory::ScenarioMismatch,
            ),
            (
                r"(?i)test(s)? fail|assertion (fail|error)|\bFAILED\b|expected .* got",
                ErrorCategory::TestFailure,
            ),
            (
                r"(?i)syntax error|parse error|compil(e|ation) (error|fail)|unexpected token|\bE0[0-9]{3}\b",
                ErrorCategory::SyntaxError,
            ),
        ];
        table
            .iter()
            .filter_map(|(pattern, category)| Regex::new(pattern).ok().map(|re| (re, *category)))
            .collect()
    })
}

/// Classify free-form error text into a category
///
/// Evaluated in precedence order; anything unrecognized falls back to
/// `partial_execution`. Never fails.
pub fn classify(error_text: &str) -> ErrorCategory {
    for (re, category) in patterns() {
        if re.is_match(error_text) {
            return *category;
        }
    }
    ErrorCategory::PartialExecution
}

/// True while the failure has retry budget left
pub fn can_retry(retry_count: u32, max_retries: u32) -> bool {
    retry_count < max_retries
}

/// True when a human must step in: the category demands it, or retries ran out
pub fn needs_escalation(category: ErrorCategory, retry_count: u32, max_retries: u32) -> bool {
    category.spec().needs_human || retry_count >= max_retries
}
