//! Remote control loop
//!
//! The bot-owning instance long-polls for updates and dispatches owner
//! commands: lifecycle signals (/start /pause /resume), status reporting,
//! a credential preflight, and a relay mode that forwards chat text to a
//! dedicated agent session. Messages from any chat other than the
//! configured one are ignored.

use std::sync::Arc;
use std::time::Duration;
use steward_agent::{SessionBudget, SessionManager};
use steward_core::config;
use steward_core::manifest::{Manifest, ManifestStore};
use steward_core::Result;
use steward_runtime::{Signal, SignalAction, SignalChannel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::approval::{ApprovalDecision, ApprovalManager};
use crate::client::{BotClient, CallbackQuery, Update};

const POLL_TIMEOUT: Duration = Duration::from_secs(30);
const RELAY_MAX_TURNS: u32 = 15;
const RELAY_TIMEOUT_MS: u64 = 300_000;

/// Owner commands the bridge understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Pause,
    Resume,
    Status,
    Preflight,
    Relay,
    EndRelay,
    /// Plain text; only meaningful while relay mode is active
    Text(String),
}

/// Parse one incoming message into a command
pub fn parse_command(text: &str) -> Command {
    // "/status@steward_bot" arrives in group chats
    let word = text.split_whitespace().next().unwrap_or("");
    let word = word.split('@').next().unwrap_or(word);
    match word {
        "/start" => Command::Start,
        "/pause" => Command::Pause,
        "/resume" => Command::Resume,
        "/status" => Command::Status,
        "/preflight" => Command::Preflight,
        "/relay" => Command::Relay,
        "/endrelay" => Command::EndRelay,
        _ => Command::Text(text.to_string()),
    }
}

/// Split an inline-button payload `<resource>:<decision>` into its parts
pub fn parse_approval_payload(data: &str) -> Option<(&str, ApprovalDecision)> {
    let (resource, decision) = data.rsplit_once(':')?;
    Some((resource, ApprovalDecision::parse(decision)?))
}

/// Human-readable pipeline summary for /status
pub fn format_status(manifest: &Manifest) -> String {
    let mut lines = Vec::new();
    if manifest.phases.is_empty() {
        lines.push("No phases declared yet".to_string());
    }
    for (number, status) in &manifest.phases {
        let marker = if status.is_complete() { "done" } else { "in progress" };
        lines.push(format!(
            "Phase {}: plan={:?} execution={:?} validation={:?} ({})",
            number, status.plan, status.execution, status.validation, marker
        ));
    }
    if let Some(failure) = manifest.pending_failure() {
        lines.push(format!(
            "Pending failure: {} in phase {} ({}, retry {}/{})",
            failure.command,
            failure.phase,
            failure.error_category,
            failure.retry_count,
            failure.max_retries
        ));
    }
    if let Some(action) = &manifest.next_action {
        lines.push(format!("Next action: {}", action));
    }
    lines.join("\n")
}

/// Long-polling control bridge for the bot-owning instance
pub struct ControlBridge {
    client: BotClient,
    chat_id: i64,
    signals: SignalChannel,
    store: Arc<ManifestStore>,
    approvals: ApprovalManager,
    sessions: SessionManager,
    relay_session: Option<String>,
}

impl ControlBridge {
    pub fn new(
        client: BotClient,
        chat_id: i64,
        signals: SignalChannel,
        store: Arc<ManifestStore>,
        approvals: ApprovalManager,
        sessions: SessionManager,
    ) -> Self {
        Self {
            client,
            chat_id,
            signals,
            store,
            approvals,
            sessions,
            relay_session: None,
        }
    }

    /// Poll and dispatch until cancelled
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let mut offset = 0i64;
        info!("Control bridge polling for chat {}", self.chat_id);
        loop {
            let updates = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                updates = self.client.get_updates(offset, POLL_TIMEOUT) => updates,
            };
            let updates = match updates {
                Ok(updates) => updates,
                Err(e) => {
                    // Transient network trouble must not kill the bridge
                    warn!("getUpdates failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };
            for update in updates {
                offset = offset.max(update.update_id + 1);
                if let Err(e) = self.dispatch(update).await {
                    warn!("Update handling failed: {}", e);
                }
            }
        }
    }

    async fn dispatch(&mut self, update: Update) -> Result<()> {
        if let Some(callback) = update.callback_query {
            return self.handle_callback(callback).await;
        }
        let Some(message) = update.message else {
            return Ok(());
        };
        if message.chat.id != self.chat_id {
            debug!("Ignoring message from foreign chat {}", message.chat.id);
            return Ok(());
        }
        let Some(text) = message.text else {
            return Ok(());
        };
        self.handle_command(parse_command(&text)).await
    }

    async fn handle_callback(&self, callback: CallbackQuery) -> Result<()> {
        self.client.answer_callback(&callback.id).await?;
        if callback.message.map(|m| m.chat.id) != Some(self.chat_id) {
            return Ok(());
        }
        let Some(data) = callback.data else {
            return Ok(());
        };
        let Some((resource, decision)) = parse_approval_payload(&data) else {
            warn!("Unknown approval payload: {}", data);
            return Ok(());
        };
        if self.approvals.resolve(resource, decision) {
            self.client
                .send_message(self.chat_id, &format!("{}: {:?} recorded", resource, decision))
                .await?;
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Start => {
                self.signals
                    .write_signal(&Signal::now(SignalAction::Go, "bridge"))?;
                self.client.send_message(self.chat_id, "Starting").await
            }
            Command::Pause => {
                self.signals
                    .write_signal(&Signal::now(SignalAction::Pause, "bridge"))?;
                self.client
                    .send_message(self.chat_id, "Pausing after the current phase")
                    .await
            }
            Command::Resume => {
                self.signals
                    .write_signal(&Signal::now(SignalAction::Resume, "bridge"))?;
                self.client.send_message(self.chat_id, "Resuming").await
            }
            Command::Status => {
                let manifest = self.store.read()?;
                self.client
                    .send_message(self.chat_id, &format_status(&manifest))
                    .await
            }
            Command::Preflight => {
                let report = match config::verify_agent_auth() {
                    Ok(mode) => format!("Preflight OK ({:?})", mode),
                    Err(e) => format!("Preflight failed: {}", e),
                };
                self.client.send_message(self.chat_id, &report).await
            }
            Command::Relay => {
                self.relay_session = None;
                self.client
                    .send_message(
                        self.chat_id,
                        "Relay open; messages go straight to the agent. /endrelay to close.",
                    )
                    .await
            }
            Command::EndRelay => {
                let was_open = self.relay_session.take().is_some();
                let reply = if was_open { "Relay closed" } else { "No relay was open" };
                self.client.send_message(self.chat_id, reply).await
            }
            Command::Text(text) => self.relay(&text).await,
        }
    }

    /// Forward chat text into the dedicated relay session
    async fn relay(&mut self, text: &str) -> Result<()> {
        let budget = SessionBudget::new(RELAY_MAX_TURNS, RELAY_TIMEOUT_MS, "relay message");
        let result = match &self.relay_session {
            Some(session_id) => self.sessions.resume_session(session_id, text, &budget).await?,
            None => self.sessions.create_session(text, &budget).await?,
        };
        self.relay_session = Some(result.session_id.clone());
        let reply = if result.text.trim().is_empty() {
            "(no reply)".to_string()
        } else {
            result.text
        };
        self.client.send_message(self.chat_id, &reply).await
    }
}
