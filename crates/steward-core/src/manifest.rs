//! Manifest: the single persisted state document for a project
//!
//! Every pipeline command reads the manifest fully before acting and writes
//! back a deep merge, never an overwrite. Array fields are append-only from
//! the producer's perspective; only the notification bridge and the
//! checkpoint-resolution step flip a flag on an existing entry.

use crate::error::{Result, StewardError};
use crate::taxonomy::ErrorCategory;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// One unit of pipeline work, as recorded in failure and budget entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineCommand {
    Preflight,
    Research,
    CreatePrd,
    Plan,
    Execute,
    Validate,
    Commit,
}

impl fmt::Display for PipelineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineCommand::Preflight => "preflight",
            PipelineCommand::Research => "research",
            PipelineCommand::CreatePrd => "create_prd",
            PipelineCommand::Plan => "plan",
            PipelineCommand::Execute => "execute",
            PipelineCommand::Validate => "validate",
            PipelineCommand::Commit => "commit",
        };
        write!(f, "{}", name)
    }
}

/// Status of the plan/execution stages of a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    NotStarted,
    InProgress,
    Complete,
}

/// Status of the validation stage of a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    #[default]
    NotStarted,
    Pass,
    Fail,
}

/// Per-phase pipeline progress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStatus {
    #[serde(default)]
    pub plan: StageStatus,
    #[serde(default)]
    pub execution: StageStatus,
    #[serde(default)]
    pub validation: ValidationStatus,
}

impl PhaseStatus {
    /// A phase is done when all three stages have reached their terminal state
    pub fn is_complete(&self) -> bool {
        self.plan == StageStatus::Complete
            && self.execution == StageStatus::Complete
            && self.validation == ValidationStatus::Pass
    }
}

/// Freshness of a technology profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    Stale,
}

/// Technology reference metadata written by the research stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub generated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProfileEntry {
    /// Compute freshness against a configurable window
    pub fn freshness(&self, window_days: i64, now: DateTime<Utc>) -> Freshness {
        if now - self.generated_at > Duration::days(window_days) {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }
}

/// One planning attempt (append-only history)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    pub phase: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_count: Option<usize>,
}

/// One execution attempt (append-only history)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEntry {
    pub phase: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turns_used: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks_total: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl ExecutionEntry {
    /// Observed turns-per-task ratio, if both signals were recorded
    pub fn turns_per_task(&self) -> Option<f64> {
        match (self.turns_used, self.tasks_total) {
            (Some(turns), Some(tasks)) if tasks > 0 => Some(f64::from(turns) / tasks as f64),
            _ => None,
        }
    }
}

/// One validation attempt (append-only history)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationEntry {
    pub phase: u32,
    pub timestamp: DateTime<Utc>,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Lifecycle of a version-control checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Active,
    Resolved,
}

/// A named version-control marker created before a code-mutating phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub tag: String,
    pub phase: u32,
    pub status: CheckpointStatus,
    pub created_at: DateTime<Utc>,
}

/// Resolution state of a recorded failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    #[default]
    Pending,
    AutoFixed,
    RolledBack,
    EscalatedBlocking,
    AutoRollbackRetry,
}

/// One recorded pipeline failure; at most one `pending` entry per
/// (phase, command) is in flight at a time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEntry {
    pub command: PipelineCommand,
    pub phase: u32,
    pub error_category: ErrorCategory,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    #[serde(default)]
    pub resolution: Resolution,
    pub details: String,
}

/// Notification produced by the pipeline; `acknowledged` is set only by the
/// notification bridge after delivery, never by the producer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEntry {
    pub message: String,
    pub blocking: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
    /// Approval key a blocking notification asks a decision for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

/// Credential-verification result gating autonomous execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightStatus {
    pub passed: bool,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// The single source of truth for a project's pipeline state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub phases: BTreeMap<u32, PhaseStatus>,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileEntry>,
    #[serde(default)]
    pub plans: Vec<PlanEntry>,
    #[serde(default)]
    pub executions: Vec<ExecutionEntry>,
    #[serde(default)]
    pub validations: Vec<ValidationEntry>,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointEntry>,
    #[serde(default)]
    pub failures: Vec<FailureEntry>,
    #[serde(default)]
    pub notifications: Vec<NotificationEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preflight: Option<PreflightStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,
    /// Queued new-technology research topics
    #[serde(default)]
    pub pending_research: Vec<String>,
    /// Path to the requirements document, once created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements_doc: Option<String>,
    /// Whether credential preflight is required before autonomous execution
    #[serde(default)]
    pub preflight_required: bool,
    /// Unknown fields round-trip untouched through read-merge-write cycles
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Manifest {
    /// Latest pending failure, if any
    pub fn pending_failure(&self) -> Option<&FailureEntry> {
        self.failures
            .iter()
            .rev()
            .find(|f| f.resolution == Resolution::Pending)
    }

    /// Mutable handle to the pending failure for a (phase, command) pair
    pub fn pending_failure_mut(
        &mut self,
        phase: u32,
        command: PipelineCommand,
    ) -> Option<&mut FailureEntry> {
        self.failures
            .iter_mut()
            .rev()
            .find(|f| f.resolution == Resolution::Pending && f.phase == phase && f.command == command)
    }

    /// Active checkpoint for a phase, if one exists
    pub fn active_checkpoint(&self, phase: u32) -> Option<&CheckpointEntry> {
        self.checkpoints
            .iter()
            .rev()
            .find(|c| c.phase == phase && c.status == CheckpointStatus::Active)
    }

    /// Any active checkpoint across phases (most recent first)
    pub fn any_active_checkpoint(&self) -> Option<&CheckpointEntry> {
        self.checkpoints
            .iter()
            .rev()
            .find(|c| c.status == CheckpointStatus::Active)
    }

    /// First phase number whose pipeline is not fully complete
    pub fn first_incomplete_phase(&self) -> Option<u32> {
        self.phases
            .iter()
            .find(|(_, status)| !status.is_complete())
            .map(|(n, _)| *n)
    }

    /// True when every declared phase is fully complete
    pub fn all_phases_complete(&self) -> bool {
        !self.phases.is_empty() && self.phases.values().all(PhaseStatus::is_complete)
    }

    /// Phase the orchestrator is currently working, inferred for heartbeats
    pub fn current_phase(&self) -> Option<u32> {
        self.first_incomplete_phase()
    }
}

/// Read/merge/write access to the manifest file
///
/// Writes go through a temp-file-then-rename so a crash mid-write never
/// leaves a truncated manifest on disk. In-process read-modify-write cycles
/// are serialized through an internal lock; tasks sharing one store (behind
/// an `Arc`) cannot clobber each other's appends. Cross-process writers are
/// not serialized.
pub struct ManifestStore {
    path: PathBuf,
    write_lock: std::sync::Mutex<()>,
}

impl ManifestStore {
    /// Create a store for the manifest at the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: std::sync::Mutex::new(()),
        }
    }

    /// Conventional store location under a project root
    pub fn for_project(project_root: &Path) -> Self {
        Self::new(project_root.join(".steward").join("manifest.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the manifest; a missing file yields the default (empty) manifest
    pub fn read(&self) -> Result<Manifest> {
        if !self.path.exists() {
            return Ok(Manifest::default());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&raw)
            .map_err(|e| StewardError::ManifestCorruption(format!("{}: {}", self.path.display(), e)))
    }

    /// Deep-merge `updated` over the manifest currently on disk, then write
    /// atomically. Objects merge recursively; arrays and scalars take the
    /// updated value (producers always read fully before mutating).
    pub fn merge_write(&self, updated: &Manifest) -> Result<()> {
        let mut base = match self.read_raw()? {
            Some(value) => value,
            None => Value::Object(Map::new()),
        };
        let update = serde_json::to_value(updated)?;
        deep_merge(&mut base, update);
        if let Value::Object(obj) = &mut base {
            obj.insert("last_updated".to_string(), serde_json::to_value(Utc::now())?);
        }
        self.write_atomic(&base)
    }

    /// Read, apply `mutate`, merge the result back, atomically with respect
    /// to other holders of this store
    pub fn update<F>(&self, mutate: F) -> Result<Manifest>
    where
        F: FnOnce(&mut Manifest),
    {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut manifest = self.read()?;
        mutate(&mut manifest);
        self.merge_write(&manifest)?;
        Ok(manifest)
    }

    fn read_raw(&self) -> Result<Option<Value>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let value = serde_json::from_str(&raw)
            .map_err(|e| StewardError::ManifestCorruption(format!("{}: {}", self.path.display(), e)))?;
        Ok(Some(value))
    }

    fn write_atomic(&self, value: &Value) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| StewardError::Manifest("manifest path has no parent".to_string()))?;
        std::fs::create_dir_all(parent)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!("Wrote manifest to {}", self.path.display());
        Ok(())
    }
}

/// Recursive JSON merge: objects merge key-by-key, everything else is
/// replaced by the update
fn deep_merge(base: &mut Value, update: Value) {
    match (base, update) {
        (Value::Object(base_obj), Value::Object(update_obj)) => {
            for (key, value) in update_obj {
                match base_obj.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_obj.insert(key, value);
                    }
                }
            }
        }
        (base_slot, update) => *base_slot = update,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> ManifestStore {
        ManifestStore::new(dir.path().join("manifest.json"))
    }

    #[test]
    fn test_missing_file_reads_default() {
        let dir = TempDir::new().unwrap();
        let manifest = store_in(&dir).read().unwrap();
        assert!(manifest.phases.is_empty());
        assert!(manifest.failures.is_empty());
    }

    #[test]
    fn test_round_trip_preserves_unknown_fields() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(
            store.path(),
            r#"{"phases":{},"last_updated":null,"custom_tool":{"enabled":true}}"#,
        )
        .unwrap();

        let mut manifest = store.read().unwrap();
        assert!(manifest.extra.contains_key("custom_tool"));

        manifest.phases.insert(1, PhaseStatus::default());
        store.merge_write(&manifest).unwrap();

        let reread = store.read().unwrap();
        assert!(reread.extra.contains_key("custom_tool"));
        assert!(reread.phases.contains_key(&1));
    }

    #[test]
    fn test_merge_write_sets_last_updated() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.merge_write(&Manifest::default()).unwrap();
        let manifest = store.read().unwrap();
        assert!(manifest.last_updated.is_some());
    }

    #[test]
    fn test_deep_merge_nested_objects() {
        let mut base = serde_json::json!({"a": {"x": 1, "y": 2}, "b": 3});
        deep_merge(&mut base, serde_json::json!({"a": {"y": 9, "z": 10}}));
        assert_eq!(base, serde_json::json!({"a": {"x": 1, "y": 9, "z": 10}, "b": 3}));
    }

    #[test]
    fn test_concurrent_updates_do_not_lose_appends() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(store_in(&dir));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .update(|m| {
                            m.notifications.push(NotificationEntry {
                                message: format!("note {}", i),
                                blocking: false,
                                timestamp: Utc::now(),
                                acknowledged: false,
                                resource: None,
                            });
                        })
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.read().unwrap().notifications.len(), 8);
    }

    #[test]
    fn test_corrupt_manifest_is_a_typed_error() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "{not json").unwrap();
        let err = store.read().unwrap_err();
        assert!(matches!(err, StewardError::ManifestCorruption(_)));
    }

    #[test]
    fn test_phase_completion() {
        let mut status = PhaseStatus::default();
        assert!(!status.is_complete());
        status.plan = StageStatus::Complete;
        status.execution = StageStatus::Complete;
        assert!(!status.is_complete());
        status.validation = ValidationStatus::Pass;
        assert!(status.is_complete());
    }

    #[test]
    fn test_profile_freshness_window() {
        let now = Utc::now();
        let fresh = ProfileEntry {
            generated_at: now - Duration::days(3),
            path: None,
            extra: Map::new(),
        };
        let stale = ProfileEntry {
            generated_at: now - Duration::days(10),
            path: None,
            extra: Map::new(),
        };
        assert_eq!(fresh.freshness(7, now), Freshness::Fresh);
        assert_eq!(stale.freshness(7, now), Freshness::Stale);
    }

    #[test]
    fn test_pending_failure_lookup() {
        let mut manifest = Manifest::default();
        manifest.failures.push(FailureEntry {
            command: PipelineCommand::Execute,
            phase: 2,
            error_category: ErrorCategory::TestFailure,
            timestamp: Utc::now(),
            retry_count: 0,
            max_retries: 3,
            checkpoint: None,
            resolution: Resolution::AutoFixed,
            details: "resolved earlier".to_string(),
        });
        assert!(manifest.pending_failure().is_none());

        manifest.failures.push(FailureEntry {
            command: PipelineCommand::Validate,
            phase: 2,
            error_category: ErrorCategory::TestFailure,
            timestamp: Utc::now(),
            retry_count: 1,
            max_retries: 3,
            checkpoint: None,
            resolution: Resolution::Pending,
            details: "still open".to_string(),
        });
        let pending = manifest.pending_failure().unwrap();
        assert_eq!(pending.command, PipelineCommand::Validate);
        assert!(manifest
            .pending_failure_mut(2, PipelineCommand::Validate)
            .is_some());
        assert!(manifest
            .pending_failure_mut(2, PipelineCommand::Execute)
            .is_none());
    }

    #[test]
    fn test_first_incomplete_phase_ordering() {
        let mut manifest = Manifest::default();
        let complete = PhaseStatus {
            plan: StageStatus::Complete,
            execution: StageStatus::Complete,
            validation: ValidationStatus::Pass,
        };
        manifest.phases.insert(1, complete.clone());
        manifest.phases.insert(2, PhaseStatus::default());
        manifest.phases.insert(3, PhaseStatus::default());
        assert_eq!(manifest.first_incomplete_phase(), Some(2));
        manifest.phases.insert(2, complete);
        assert_eq!(manifest.first_incomplete_phase(), Some(3));
    }
}
