//! Cross-project instance registry and bot-ownership election
//!
//! A single file in the user's home directory lists every live orchestrator
//! on the machine. Mutation follows read-prune-merge-write with no file
//! lock: entries are self-healing (dead pids are pruned on the next read),
//! and the write-write race between two processes claiming ownership in the
//! same instant is an accepted, documented limitation rather than something
//! this layer pretends to serialize.

use crate::lock::pid_alive;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use steward_core::{Result, StewardError};
use tracing::{debug, info};

/// Coarse health state reported through heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Idle,
    Error,
}

/// One live orchestrator process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryInstance {
    /// Short label derived from the project directory name
    pub project_prefix: String,
    pub project_dir: PathBuf,
    pub pid: i32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub is_bot_owner: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InstanceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<DateTime<Utc>>,
}

impl RegistryInstance {
    pub fn for_current_process(project_dir: &Path) -> Self {
        let project_prefix = project_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string());
        Self {
            project_prefix,
            project_dir: project_dir.to_path_buf(),
            pid: std::process::id() as i32,
            started_at: Utc::now(),
            is_bot_owner: false,
            status: Some(InstanceStatus::Running),
            current_phase: None,
            heartbeat: Some(Utc::now()),
        }
    }
}

/// On-disk registry document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub instances: Vec<RegistryInstance>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Read/prune/upsert/write access to the shared registry file
pub struct InstanceRegistry {
    path: PathBuf,
    is_alive: fn(i32) -> bool,
}

impl InstanceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            is_alive: pid_alive,
        }
    }

    /// Test constructor with an injected liveness probe
    pub fn with_liveness(path: impl Into<PathBuf>, is_alive: fn(i32) -> bool) -> Self {
        Self {
            path: path.into(),
            is_alive,
        }
    }

    /// Read the registry; missing or unreadable file yields an empty one
    pub fn read(&self) -> RegistryFile {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return RegistryFile::default();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    /// Drop entries whose pid is no longer alive; idempotent
    pub fn prune(&self, mut file: RegistryFile) -> RegistryFile {
        let before = file.instances.len();
        file.instances.retain(|i| (self.is_alive)(i.pid));
        if file.instances.len() < before {
            debug!("Pruned {} dead registry entries", before - file.instances.len());
        }
        file
    }

    /// Register or refresh this process's entry, pruning dead pids first
    pub fn register_instance(&self, instance: RegistryInstance) -> Result<()> {
        let mut file = self.prune(self.read());
        match file
            .instances
            .iter_mut()
            .find(|i| i.project_dir == instance.project_dir)
        {
            Some(existing) => {
                // Preserve ownership across re-registration of the same project
                let was_owner = existing.is_bot_owner;
                *existing = instance;
                existing.is_bot_owner = was_owner;
            }
            None => file.instances.push(instance),
        }
        self.write(file)
    }

    /// Remove this project's entry (best-effort shutdown path)
    pub fn deregister(&self, project_dir: &Path) -> Result<()> {
        let mut file = self.prune(self.read());
        file.instances.retain(|i| i.project_dir != project_dir);
        self.write(file)
    }

    /// Try to claim the single bot-ownership slot for a project
    ///
    /// Succeeds when this project already owns it, no live instance owns it,
    /// or the recorded owner's pid is dead (revoke-and-reclaim). The
    /// read-then-write window between two processes started in the same
    /// instant is not serialized.
    pub fn claim_bot_ownership(&self, project_dir: &Path) -> Result<bool> {
        let mut file = self.prune(self.read());

        let owner = file.instances.iter().find(|i| i.is_bot_owner);
        if let Some(owner) = owner {
            if owner.project_dir != project_dir {
                debug!(
                    "Bot ownership held by {} (pid {})",
                    owner.project_prefix, owner.pid
                );
                return Ok(false);
            }
        }

        for instance in &mut file.instances {
            instance.is_bot_owner = instance.project_dir == project_dir;
        }
        let claimed = file.instances.iter().any(|i| i.is_bot_owner);
        if claimed {
            info!("Claimed bot ownership for {}", project_dir.display());
            self.write(file)?;
        }
        Ok(claimed)
    }

    /// Upsert heartbeat fields on this project's entry
    pub fn update_heartbeat(
        &self,
        project_dir: &Path,
        status: InstanceStatus,
        current_phase: Option<u32>,
    ) -> Result<()> {
        let mut file = self.prune(self.read());
        match file
            .instances
            .iter_mut()
            .find(|i| i.project_dir == project_dir)
        {
            Some(instance) => {
                instance.status = Some(status);
                instance.current_phase = current_phase;
                instance.heartbeat = Some(Utc::now());
            }
            None => {
                let mut instance = RegistryInstance::for_current_process(project_dir);
                instance.status = Some(status);
                instance.current_phase = current_phase;
                file.instances.push(instance);
            }
        }
        self.write(file)
    }

    fn write(&self, mut file: RegistryFile) -> Result<()> {
        file.last_updated = Some(Utc::now());
        let parent = self
            .path
            .parent()
            .ok_or_else(|| StewardError::Registry("registry path has no parent".to_string()))?;
        std::fs::create_dir_all(parent)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn always_alive(_: i32) -> bool {
        true
    }

    fn even_pids_alive(pid: i32) -> bool {
        pid % 2 == 0
    }

    fn registry_in(dir: &TempDir) -> InstanceRegistry {
        InstanceRegistry::with_liveness(dir.path().join("registry.json"), always_alive)
    }

    fn instance(dir: &str, pid: i32) -> RegistryInstance {
        RegistryInstance {
            project_prefix: dir.trim_start_matches('/').to_string(),
            project_dir: PathBuf::from(dir),
            pid,
            started_at: Utc::now(),
            is_bot_owner: false,
            status: Some(InstanceStatus::Running),
            current_phase: None,
            heartbeat: None,
        }
    }

    #[test]
    fn test_register_upserts_by_project_dir() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);

        registry.register_instance(instance("/p/alpha", 100)).unwrap();
        registry.register_instance(instance("/p/beta", 200)).unwrap();
        registry.register_instance(instance("/p/alpha", 102)).unwrap();

        let file = registry.read();
        assert_eq!(file.instances.len(), 2);
        let alpha = file
            .instances
            .iter()
            .find(|i| i.project_dir == PathBuf::from("/p/alpha"))
            .unwrap();
        assert_eq!(alpha.pid, 102);
    }

    #[test]
    fn test_prune_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry =
            InstanceRegistry::with_liveness(dir.path().join("registry.json"), even_pids_alive);

        let file = RegistryFile {
            instances: vec![instance("/a", 2), instance("/b", 3), instance("/c", 4)],
            last_updated: None,
        };
        let once = registry.prune(file);
        assert_eq!(once.instances.len(), 2);

        let twice = registry.prune(once.clone());
        assert_eq!(twice.instances.len(), once.instances.len());
        assert!(twice
            .instances
            .iter()
            .zip(&once.instances)
            .all(|(a, b)| a.pid == b.pid));
    }

    #[test]
    fn test_claim_is_exclusive_across_projects() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);

        registry.register_instance(instance("/p/one", 10)).unwrap();
        registry.register_instance(instance("/p/two", 20)).unwrap();

        assert!(registry.claim_bot_ownership(Path::new("/p/one")).unwrap());
        assert!(!registry.claim_bot_ownership(Path::new("/p/two")).unwrap());

        let owners: Vec<_> = registry
            .read()
            .instances
            .into_iter()
            .filter(|i| i.is_bot_owner)
            .collect();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].project_dir, PathBuf::from("/p/one"));
    }

    #[test]
    fn test_claim_is_reentrant_for_owner() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        registry.register_instance(instance("/p/one", 10)).unwrap();
        assert!(registry.claim_bot_ownership(Path::new("/p/one")).unwrap());
        assert!(registry.claim_bot_ownership(Path::new("/p/one")).unwrap());
    }

    #[test]
    fn test_dead_owner_is_revoked_and_reclaimed() {
        let dir = TempDir::new().unwrap();
        let registry =
            InstanceRegistry::with_liveness(dir.path().join("registry.json"), even_pids_alive);

        // Odd pid owner is dead; even pid challenger is alive
        let mut dead_owner = instance("/p/dead", 31);
        dead_owner.is_bot_owner = true;
        let file = RegistryFile {
            instances: vec![dead_owner, instance("/p/live", 42)],
            last_updated: None,
        };
        let tmp_path = dir.path().join("registry.json");
        std::fs::write(&tmp_path, serde_json::to_string(&file).unwrap()).unwrap();

        assert!(registry.claim_bot_ownership(Path::new("/p/live")).unwrap());
        let owners: Vec<_> = registry
            .read()
            .instances
            .into_iter()
            .filter(|i| i.is_bot_owner)
            .collect();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].project_dir, PathBuf::from("/p/live"));
    }

    #[test]
    fn test_deregister_removes_entry() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        registry.register_instance(instance("/p/one", 10)).unwrap();
        registry.deregister(Path::new("/p/one")).unwrap();
        assert!(registry.read().instances.is_empty());
    }

    #[test]
    fn test_heartbeat_upserts_missing_entry() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        registry
            .update_heartbeat(Path::new("/p/fresh"), InstanceStatus::Idle, Some(3))
            .unwrap();
        let file = registry.read();
        assert_eq!(file.instances.len(), 1);
        assert_eq!(file.instances[0].status, Some(InstanceStatus::Idle));
        assert_eq!(file.instances[0].current_phase, Some(3));
        assert!(file.instances[0].heartbeat.is_some());
    }

    #[test]
    fn test_corrupt_registry_reads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "garbage").unwrap();
        let registry = InstanceRegistry::with_liveness(&path, always_alive);
        assert!(registry.read().instances.is_empty());
    }
}
