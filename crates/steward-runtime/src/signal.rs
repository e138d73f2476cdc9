//! Cross-process signal channel
//!
//! A per-project file used as a one-shot mailbox. The bot-owner instance
//! writes a command addressed to another project's orchestrator; that
//! orchestrator polls every couple of seconds and consumes the file on
//! read. No network RPC, just a shared filesystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use steward_core::Result;
use tracing::{debug, info};

/// Commands relayed between orchestrator instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    Go,
    Pause,
    Resume,
    Shutdown,
}

/// One relayed command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    pub timestamp: DateTime<Utc>,
    /// Who sent it (project prefix or "bridge")
    pub from: String,
}

impl Signal {
    pub fn now(action: SignalAction, from: impl Into<String>) -> Self {
        Self {
            action,
            timestamp: Utc::now(),
            from: from.into(),
        }
    }
}

/// File-backed one-shot mailbox
pub struct SignalChannel {
    path: PathBuf,
    poll_interval: Duration,
}

impl SignalChannel {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }

    /// Write a signal, replacing any unconsumed one
    pub fn write_signal(&self, signal: &Signal) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(signal)?)?;
        info!("Wrote {:?} signal from {}", signal.action, signal.from);
        Ok(())
    }

    /// Consume the pending signal if one exists; the file is deleted on read
    pub fn try_consume(&self) -> Result<Option<Signal>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        // Consume even when unreadable so a corrupt mailbox cannot wedge
        // the poll loop forever
        let _ = std::fs::remove_file(&self.path);
        match serde_json::from_str::<Signal>(&raw) {
            Ok(signal) => {
                debug!("Consumed {:?} signal", signal.action);
                Ok(Some(signal))
            }
            Err(e) => {
                debug!("Discarded unreadable signal: {}", e);
                Ok(None)
            }
        }
    }

    /// Block until a signal arrives, polling at the configured interval
    pub async fn wait_for_signal(&self) -> Result<Signal> {
        loop {
            if let Some(signal) = self.try_consume()? {
                return Ok(signal);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn channel_in(dir: &TempDir) -> SignalChannel {
        SignalChannel::new(dir.path().join("signal.json"), Duration::from_millis(10))
    }

    #[test]
    fn test_consume_deletes_file() {
        let dir = TempDir::new().unwrap();
        let channel = channel_in(&dir);

        channel
            .write_signal(&Signal::now(SignalAction::Pause, "bridge"))
            .unwrap();
        let signal = channel.try_consume().unwrap().unwrap();
        assert_eq!(signal.action, SignalAction::Pause);
        assert_eq!(signal.from, "bridge");

        // One-shot semantics
        assert!(channel.try_consume().unwrap().is_none());
    }

    #[test]
    fn test_empty_mailbox_reads_none() {
        let dir = TempDir::new().unwrap();
        assert!(channel_in(&dir).try_consume().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_signal_discarded_not_fatal() {
        let dir = TempDir::new().unwrap();
        let channel = channel_in(&dir);
        std::fs::write(dir.path().join("signal.json"), "oops").unwrap();
        assert!(channel.try_consume().unwrap().is_none());
        assert!(!dir.path().join("signal.json").exists());
    }

    #[test]
    fn test_rewrite_replaces_pending_signal() {
        let dir = TempDir::new().unwrap();
        let channel = channel_in(&dir);
        channel.write_signal(&Signal::now(SignalAction::Pause, "a")).unwrap();
        channel.write_signal(&Signal::now(SignalAction::Resume, "b")).unwrap();
        let signal = channel.try_consume().unwrap().unwrap();
        assert_eq!(signal.action, SignalAction::Resume);
    }

    #[tokio::test]
    async fn test_wait_for_signal_picks_up_late_write() {
        let dir = TempDir::new().unwrap();
        let channel = channel_in(&dir);
        let path = dir.path().join("signal.json");

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let signal = Signal::now(SignalAction::Shutdown, "test");
            std::fs::write(&path, serde_json::to_string(&signal).unwrap()).unwrap();
        });

        let signal = channel.wait_for_signal().await.unwrap();
        assert_eq!(signal.action, SignalAction::Shutdown);
        writer.await.unwrap();
    }
}
