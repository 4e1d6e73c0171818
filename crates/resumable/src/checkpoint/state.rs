//! Snapshot definitions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::provenance::Provenance;
use crate::run::{BestTracker, Progress, StateDict};

/// Current on-disk snapshot layout.
///
/// Version 1 snapshots predate the explicit `best_update` / `num_updates`
/// counters and carry no version tag at all.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 2;

fn legacy_schema() -> u32 {
    1
}

/// Best-result bookkeeping at save time.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct BestMarker {
    pub best_iteration: u64,
    pub best_update: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_epoch: Option<u64>,
    /// Absent until a finite metric value has been recorded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_metric_value: Option<f64>,
}

impl BestMarker {
    /// Read the tracker's current best.
    pub fn from_tracker(tracker: &dyn BestTracker) -> Self {
        Self {
            best_iteration: tracker.best_monitored_iteration(),
            best_update: tracker.best_monitored_update(),
            best_epoch: tracker.best_monitored_epoch(),
            best_metric_value: tracker.best_monitored_value().filter(|v| v.is_finite()),
        }
    }
}

/// Complete, point-in-time training checkpoint.
///
/// Keys are flat at the top level of the encoded object so that older
/// snapshots (which only carried `best_iteration`) decode through the same
/// codec.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Snapshot {
    #[serde(default = "legacy_schema")]
    pub schema_version: u32,
    #[serde(default)]
    pub library_version: String,
    /// Unix seconds
    #[serde(default)]
    pub created_at: u64,
    #[serde(with = "crate::codec::state_dict")]
    pub model: StateDict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<Value>,
    #[serde(flatten)]
    pub progress: Progress,
    #[serde(flatten)]
    pub best: BestMarker,
    /// Fully-resolved run configuration
    #[serde(default)]
    pub config: Value,
    #[serde(flatten)]
    pub provenance: Option<Provenance>,
}

impl Snapshot {
    /// Create a new snapshot at the current schema version.
    pub fn new(model: StateDict, progress: Progress, best: BestMarker, config: Value) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            library_version: crate::VERSION.to_string(),
            created_at: unix_timestamp(),
            model,
            optimizer: None,
            progress,
            best,
            config,
            provenance: None,
        }
    }

    /// Set optimizer state.
    pub fn with_optimizer_state(mut self, state: Value) -> Self {
        self.optimizer = Some(state);
        self
    }

    /// Attach provenance.
    pub fn with_provenance(mut self, provenance: Option<Provenance>) -> Self {
        self.provenance = provenance;
        self
    }

    /// Validate a decoded value against the snapshot layout.
    ///
    /// Bare parameter mappings (no `model` key) are accepted and wrapped.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(crate::checkpoint::normalize(value))
    }
}

fn unix_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
