//! Type definitions for coding-agent sessions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Turn and wall-clock budget for one agent invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBudget {
    pub max_turns: u32,
    pub timeout_ms: u64,
    /// Human-readable account of how the budget was derived
    pub reasoning: String,
}

impl SessionBudget {
    pub fn new(max_turns: u32, timeout_ms: u64, reasoning: impl Into<String>) -> Self {
        Self {
            max_turns,
            timeout_ms,
            reasoning: reasoning.into(),
        }
    }
}

/// Typed events streamed by the agent subprocess, one JSON object per line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// First event; announces the session identifier
    Init { session_id: String },
    /// Incremental response text
    TextDelta { text: String },
    /// The agent invoked a tool (observed, not interpreted)
    ToolCall { name: String },
    /// Terminal event with accounting
    Result {
        #[serde(default)]
        cost_usd: f64,
        #[serde(default)]
        turns: u32,
        #[serde(default)]
        is_error: bool,
    },
}

/// Why a session ended without a usable result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionFailure {
    /// The budget's cancellation token fired before the agent finished
    AbortTimeout { after_ms: u64 },
    /// The subprocess exited non-zero without a result event
    NonZeroExit { code: Option<i32>, stderr: String },
    /// The agent reported an error through its result event
    AgentError { details: String },
}

impl SessionFailure {
    /// Error text fed to the failure classifier
    pub fn details(&self) -> String {
        match self {
            SessionFailure::AbortTimeout { after_ms } => {
                format!("abort_timeout: session aborted after {}ms", after_ms)
            }
            SessionFailure::NonZeroExit { code, stderr } => {
                format!("agent exited with code {:?}: {}", code, stderr)
            }
            SessionFailure::AgentError { details } => details.clone(),
        }
    }
}

/// One coding-agent invocation, immutable once produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    pub session_id: String,
    /// Full response text, folded from the delta stream
    pub text: String,
    /// Ordered structured fields extracted from the final status block
    pub fields: Vec<(String, String)>,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub turns: u32,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SessionFailure>,
}

impl SessionResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Look up a structured field by key
    pub fn field(&self, key: &str) -> Option<&str> {
        steward_core::hooks::field(&self.fields, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_event_wire_format() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"type":"init","session_id":"sess-1"}"#).unwrap();
        assert!(matches!(event, StreamEvent::Init { ref session_id } if session_id == "sess-1"));

        let event: StreamEvent =
            serde_json::from_str(r#"{"type":"result","cost_usd":0.37,"turns":12,"is_error":false}"#)
                .unwrap();
        match event {
            StreamEvent::Result { cost_usd, turns, is_error } => {
                assert!((cost_usd - 0.37).abs() < f64::EPSILON);
                assert_eq!(turns, 12);
                assert!(!is_error);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_result_event_defaults() {
        let event: StreamEvent = serde_json::from_str(r#"{"type":"result"}"#).unwrap();
        assert!(matches!(event, StreamEvent::Result { turns: 0, is_error: false, .. }));
    }

    #[test]
    fn test_failure_details_include_timeout_marker() {
        let failure = SessionFailure::AbortTimeout { after_ms: 120_000 };
        assert!(failure.details().contains("abort_timeout"));
    }
}
