//! Registry heartbeat writer
//!
//! Every couple of minutes (and once immediately on start and stop) the
//! orchestrator upserts its registry entry with a status, the phase it is
//! working, and a timestamp. An external supervisor watches staleness of
//! that timestamp to detect stalls. Heartbeat failures are swallowed, never
//! propagated; a broken registry must not take the pipeline down.

use crate::registry::{InstanceRegistry, InstanceStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use steward_core::manifest::ManifestStore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Periodic heartbeat task handle
pub struct HeartbeatWriter {
    registry: Arc<InstanceRegistry>,
    manifest: Arc<ManifestStore>,
    project_dir: PathBuf,
    interval: Duration,
}

impl HeartbeatWriter {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        manifest: Arc<ManifestStore>,
        project_dir: impl Into<PathBuf>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            manifest,
            project_dir: project_dir.into(),
            interval,
        }
    }

    /// Write one heartbeat now; never fails
    pub fn beat(&self, status: InstanceStatus) {
        let current_phase = match self.manifest.read() {
            Ok(manifest) => manifest.current_phase(),
            Err(e) => {
                warn!("Heartbeat could not read manifest: {}", e);
                None
            }
        };
        if let Err(e) = self
            .registry
            .update_heartbeat(&self.project_dir, status, current_phase)
        {
            warn!("Heartbeat write failed: {}", e);
        }
    }

    /// Spawn the periodic heartbeat loop; cancel the returned token to stop.
    /// A final heartbeat is written on shutdown.
    pub fn spawn(self) -> (tokio::task::JoinHandle<()>, CancellationToken) {
        let token = CancellationToken::new();
        let stop = token.clone();
        let handle = tokio::spawn(async move {
            self.beat(InstanceStatus::Running);
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await; // first tick fires immediately; already beaten
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        self.beat(InstanceStatus::Idle);
                        break;
                    }
                    _ = ticker.tick() => {
                        self.beat(InstanceStatus::Running);
                    }
                }
            }
        });
        (handle, token)
    }
}
