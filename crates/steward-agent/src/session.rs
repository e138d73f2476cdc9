//! Agent session manager
//!
//! Invokes the coding-agent subprocess, folds its JSON-lines event stream
//! into a single [`SessionResult`], and enforces the turn/time budget. A
//! timeout is delivered through a cancellation token armed for the budget;
//! it surfaces as a typed `abort_timeout` failure on the result, never as a
//! transport error.

use crate::progress::ProgressGate;
use crate::types::{SessionBudget, SessionFailure, SessionResult, StreamEvent};
use chrono::Utc;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use steward_core::hooks::{self, STATUS_SENTINEL};
use steward_core::{Result, StewardError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback invoked on throttled progress ticks (event count so far)
pub type ProgressFn = Box<dyn Fn(u64) + Send + Sync>;

/// Manager for creating and resuming coding-agent sessions
pub struct SessionManager {
    binary: String,
    model: Option<String>,
    project_dir: PathBuf,
    on_progress: Option<ProgressFn>,
}

impl SessionManager {
    pub fn new(binary: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            model: None,
            project_dir: project_dir.into(),
            on_progress: None,
        }
    }

    /// Set the model flag passed to the agent binary
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Register a throttled progress callback
    pub fn with_progress(mut self, on_progress: ProgressFn) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    /// Start a fresh session with the given prompt
    pub async fn create_session(
        &self,
        prompt: &str,
        budget: &SessionBudget,
    ) -> Result<SessionResult> {
        self.run(prompt, None, budget).await
    }

    /// Resume an existing session, sharing its context window
    pub async fn resume_session(
        &self,
        session_id: &str,
        prompt: &str,
        budget: &SessionBudget,
    ) -> Result<SessionResult> {
        self.run(prompt, Some(session_id), budget).await
    }

    async fn run(
        &self,
        prompt: &str,
        resume: Option<&str>,
        budget: &SessionBudget,
    ) -> Result<SessionResult> {
        let started = Instant::now();
        let max_turns = budget.max_turns.to_string();

        let mut args: Vec<&str> = vec![
            "-p",
            prompt,
            "--output-format",
            "stream-json",
            "--max-turns",
            &max_turns,
        ];
        if let Some(model) = &self.model {
            args.push("--model");
            args.push(model);
        }
        if let Some(session_id) = resume {
            args.push("--resume");
            args.push(session_id);
        }

        info!(
            resume = resume.is_some(),
            max_turns = budget.max_turns,
            timeout_ms = budget.timeout_ms,
            "Invoking agent ({})",
            budget.reasoning
        );

        let mut child = Command::new(&self.binary)
            .args(&args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StewardError::Session(format!("failed to spawn {}: {}", self.binary, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StewardError::Session("agent stdout was not piped".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| StewardError::Session("agent stderr was not piped".to_string()))?;

        // Drain stderr alongside stdout so a chatty agent cannot fill the
        // pipe and stall the event loop
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        // Arm the cancellation token for the computed budget
        let cancel = CancellationToken::new();
        let timer = cancel.clone();
        let timeout_ms = budget.timeout_ms;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            timer.cancel();
        });

        // Bounded fold over the typed event stream
        let mut lines = BufReader::new(stdout).lines();
        let mut session_id = resume.map(String::from).unwrap_or_default();
        let mut text = String::new();
        let mut cost_usd = 0.0;
        let mut turns = 0;
        let mut saw_result = false;
        let mut agent_errored = false;
        let mut timed_out = false;
        let mut gate = ProgressGate::default();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("Budget exhausted after {}ms, killing agent", timeout_ms);
                    let _ = child.kill().await;
                    timed_out = true;
                    break;
                }
                line = lines.next_line() => {
                    let Some(line) = line.map_err(StewardError::Io)? else {
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let event: StreamEvent = match serde_json::from_str(&line) {
                        Ok(event) => event,
                        Err(e) => {
                            debug!("Skipping unparseable stream line: {}", e);
                            continue;
                        }
                    };
                    if gate.record() {
                        if let Some(on_progress) = &self.on_progress {
                            on_progress(gate.events());
                        }
                    }
                    match event {
                        StreamEvent::Init { session_id: id } => session_id = id,
                        StreamEvent::TextDelta { text: delta } => text.push_str(&delta),
                        StreamEvent::ToolCall { name } => debug!("Agent tool call: {}", name),
                        StreamEvent::Result { cost_usd: cost, turns: t, is_error } => {
                            cost_usd = cost;
                            turns = t;
                            saw_result = true;
                            agent_errored = is_error;
                        }
                    }
                }
            }
        }

        let stderr_text = stderr_task.await.unwrap_or_default();

        let error = if timed_out {
            // kill() already reaped the child
            Some(SessionFailure::AbortTimeout { after_ms: timeout_ms })
        } else {
            let status = child
                .wait()
                .await
                .map_err(|e| StewardError::Session(format!("failed to reap agent: {}", e)))?;
            if agent_errored {
                Some(SessionFailure::AgentError {
                    details: tail(&text, 500),
                })
            } else if !saw_result && !status.success() {
                Some(SessionFailure::NonZeroExit {
                    code: status.code(),
                    stderr: tail(&stderr_text, 500),
                })
            } else {
                None
            }
        };

        if session_id.is_empty() {
            // No init event arrived; synthesize an id so histories stay keyed
            session_id = format!("local-{}", uuid::Uuid::new_v4());
        }

        let fields = hooks::extract_fields(&text, STATUS_SENTINEL);
        let duration_ms = started.elapsed().as_millis() as u64;

        info!(
            session_id = %session_id,
            turns,
            cost_usd,
            duration_ms,
            ok = error.is_none(),
            "Agent session finished"
        );

        Ok(SessionResult {
            session_id,
            text,
            fields,
            cost_usd,
            duration_ms,
            turns,
            finished_at: Utc::now(),
            error,
        })
    }
}

/// Last `limit` characters of a string, on a char boundary
fn tail(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    if count <= limit {
        text.to_string()
    } else {
        text.chars().skip(count - limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_for(script: &str) -> (SessionManager, tempfile::TempDir) {
        // Fake agent: a shell script that speaks the JSON-lines protocol
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fake-agent.sh");
        std::fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let manager = SessionManager::new(path.to_string_lossy().to_string(), dir.path());
        (manager, dir)
    }

    fn budget() -> SessionBudget {
        SessionBudget::new(10, 10_000, "test budget")
    }

    #[tokio::test]
    async fn test_fold_of_full_event_stream() {
        // printf keeps the embedded \n escapes for the JSON parser
        let script = r####"#!/bin/sh
printf '%s\n' '{"type":"init","session_id":"sess-42"}'
printf '%s\n' '{"type":"text_delta","text":"work done\n"}'
printf '%s\n' '{"type":"text_delta","text":"## STEWARD_STATUS\nstatus: complete\n"}'
printf '%s\n' '{"type":"result","cost_usd":0.12,"turns":4,"is_error":false}'
"####;
        let (manager, _dir) = manager_for(script);
        let result = manager.create_session("do the work", &budget()).await.unwrap();

        assert_eq!(result.session_id, "sess-42");
        assert!(result.succeeded());
        assert_eq!(result.turns, 4);
        assert!((result.cost_usd - 0.12).abs() < f64::EPSILON);
        assert_eq!(result.field("status"), Some("complete"));
    }

    #[tokio::test]
    async fn test_unparseable_lines_skipped() {
        let script = r##"#!/bin/sh
echo 'warning: some non-json noise'
echo '{"type":"init","session_id":"s1"}'
echo '{"type":"result","cost_usd":0.01,"turns":1,"is_error":false}'
"##;
        let (manager, _dir) = manager_for(script);
        let result = manager.create_session("p", &budget()).await.unwrap();
        assert!(result.succeeded());
        assert_eq!(result.session_id, "s1");
    }

    #[tokio::test]
    async fn test_timeout_is_typed_not_an_error() {
        let script = r##"#!/bin/sh
echo '{"type":"init","session_id":"slow"}'
sleep 30
"##;
        let (manager, _dir) = manager_for(script);
        let tight = SessionBudget::new(10, 200, "tight");
        let result = manager.create_session("p", &tight).await.unwrap();
        assert!(matches!(result.error, Some(SessionFailure::AbortTimeout { .. })));
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_result() {
        let script = r##"#!/bin/sh
echo '{"type":"init","session_id":"crashy"}'
echo 'agent blew up' >&2
exit 3
"##;
        let (manager, _dir) = manager_for(script);
        let result = manager.create_session("p", &budget()).await.unwrap();
        match result.error {
            Some(SessionFailure::NonZeroExit { code, ref stderr }) => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("agent blew up"));
            }
            ref other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_agent_reported_error() {
        let script = r##"#!/bin/sh
echo '{"type":"text_delta","text":"tests failed badly"}'
echo '{"type":"result","cost_usd":0.05,"turns":2,"is_error":true}'
"##;
        let (manager, _dir) = manager_for(script);
        let result = manager.create_session("p", &budget()).await.unwrap();
        match result.error {
            Some(SessionFailure::AgentError { ref details }) => {
                assert!(details.contains("tests failed"));
            }
            ref other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_noisy_stderr_does_not_stall_the_stream() {
        // Writes well past the pipe buffer on stderr before touching stdout;
        // the session only finishes if stderr is drained concurrently
        let script = r##"#!/bin/sh
i=0
while [ $i -lt 5000 ]; do
  echo 'stderr noise line that pads the pipe buffer well past its capacity' >&2
  i=$((i+1))
done
echo '{"type":"init","session_id":"noisy"}'
echo '{"type":"result","cost_usd":0.01,"turns":1,"is_error":false}'
"##;
        let (manager, _dir) = manager_for(script);
        let result = manager.create_session("p", &budget()).await.unwrap();
        assert!(result.succeeded());
        assert_eq!(result.session_id, "noisy");
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello", 3), "llo");
        assert_eq!(tail("héllo", 4), "éllo");
    }
}
