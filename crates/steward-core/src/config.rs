//! Configuration for Steward
//!
//! Project-level settings load from `.steward/config.toml` in the project
//! root; a handful of environment variables override or supplement them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StewardError};

/// Environment variable naming the project root (overrides cwd)
pub const PROJECT_ROOT_ENV: &str = "STEWARD_PROJECT_ROOT";

/// Environment variable overriding the agent model
pub const MODEL_ENV: &str = "STEWARD_MODEL";

/// Subscription-style agent auth token
pub const OAUTH_TOKEN_ENV: &str = "CODING_AGENT_OAUTH_TOKEN";

/// Pay-per-use agent API key
pub const API_KEY_ENV: &str = "CODING_AGENT_API_KEY";

/// How the coding agent authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    OauthToken,
    ApiKey,
}

/// Verify that agent credentials are present; either variable suffices
pub fn verify_agent_auth() -> Result<AuthMode> {
    if std::env::var(OAUTH_TOKEN_ENV).map(|v| !v.is_empty()).unwrap_or(false) {
        return Ok(AuthMode::OauthToken);
    }
    if std::env::var(API_KEY_ENV).map(|v| !v.is_empty()).unwrap_or(false) {
        return Ok(AuthMode::ApiKey);
    }
    Err(StewardError::MissingCredentials(format!(
        "set {} or {} before starting",
        OAUTH_TOKEN_ENV, API_KEY_ENV
    )))
}

/// Resolve the project root: CLI flag, then env override, then cwd
pub fn resolve_project_root(cli_project: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = cli_project {
        return Ok(dir);
    }
    if let Ok(dir) = std::env::var(PROJECT_ROOT_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    Ok(std::env::current_dir()?)
}

/// Project-level Steward configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StewardConfig {
    /// Days before a technology profile counts as stale
    #[serde(default = "default_freshness_window_days")]
    pub freshness_window_days: i64,

    /// Seconds between signal-file polls on non-owner instances
    #[serde(default = "default_signal_poll_secs")]
    pub signal_poll_secs: u64,

    /// Seconds between registry heartbeats
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Agent invocation settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Budget scaling and caps
    #[serde(default)]
    pub budgets: BudgetConfig,

    /// Notification bridge settings
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl Default for StewardConfig {
    fn default() -> Self {
        Self {
            freshness_window_days: default_freshness_window_days(),
            signal_poll_secs: default_signal_poll_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            agent: AgentConfig::default(),
            budgets: BudgetConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

/// Coding-agent subprocess settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent binary on PATH
    #[serde(default = "default_agent_binary")]
    pub binary: String,

    /// Model override; `STEWARD_MODEL` takes precedence
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            model: None,
        }
    }
}

impl AgentConfig {
    /// Effective model after applying the env override
    pub fn effective_model(&self) -> Option<String> {
        match std::env::var(MODEL_ENV) {
            Ok(model) if !model.is_empty() => Some(model),
            _ => self.model.clone(),
        }
    }
}

/// Turn/timeout budget scaling parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Hard cap on turns for any single command
    #[serde(default = "default_max_turns_cap")]
    pub max_turns_cap: u32,

    /// Milliseconds of timeout granted per turn
    #[serde(default = "default_ms_per_turn")]
    pub ms_per_turn: u64,

    /// Hard cap on a single command's timeout in milliseconds
    #[serde(default = "default_timeout_cap_ms")]
    pub timeout_cap_ms: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_turns_cap: default_max_turns_cap(),
            ms_per_turn: default_ms_per_turn(),
            timeout_cap_ms: default_timeout_cap_ms(),
        }
    }
}

/// Messaging-channel settings for the notification bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Environment variable holding the bot token
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,

    /// Chat the bridge reports to
    #[serde(default)]
    pub chat_id: Option<i64>,

    /// Outbound message size limit (split at paragraph boundaries above this)
    #[serde(default = "default_message_limit")]
    pub message_limit: usize,

    /// Minutes of silence before a pending approval reminder fires
    #[serde(default = "default_approval_reminder_minutes")]
    pub approval_reminder_minutes: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bot_token_env: default_bot_token_env(),
            chat_id: None,
            message_limit: default_message_limit(),
            approval_reminder_minutes: default_approval_reminder_minutes(),
        }
    }
}

impl StewardConfig {
    /// Load configuration from `.steward/config.toml`, falling back to
    /// defaults when the file does not exist
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = project_root.join(".steward").join("config.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        toml::from_str(&raw)
            .map_err(|e| StewardError::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Well-known file locations for a project
#[derive(Debug, Clone)]
pub struct StewardPaths {
    pub project_root: PathBuf,
    pub steward_dir: PathBuf,
}

impl StewardPaths {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        let steward_dir = project_root.join(".steward");
        Self {
            project_root,
            steward_dir,
        }
    }

    pub fn manifest(&self) -> PathBuf {
        self.steward_dir.join("manifest.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.steward_dir.join("steward.lock")
    }

    pub fn signal_file(&self) -> PathBuf {
        self.steward_dir.join("signal.json")
    }

    /// Machine-wide registry shared by every project's orchestrator
    pub fn registry_file() -> PathBuf {
        let home = std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."));
        home.join(".steward").join("registry.json")
    }
}

// Default value providers

fn default_freshness_window_days() -> i64 {
    7
}

fn default_signal_poll_secs() -> u64 {
    2
}

fn default_heartbeat_interval_secs() -> u64 {
    120
}

fn default_agent_binary() -> String {
    "claude".to_string()
}

fn default_max_turns_cap() -> u32 {
    200
}

fn default_ms_per_turn() -> u64 {
    60_000
}

fn default_timeout_cap_ms() -> u64 {
    3_600_000
}

fn default_bot_token_env() -> String {
    "STEWARD_BOT_TOKEN".to_string()
}

fn default_message_limit() -> usize {
    4096
}

fn default_approval_reminder_minutes() -> u64 {
    30
}
