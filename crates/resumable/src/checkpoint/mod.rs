//! Checkpointing system for resumable training.
//!
//! Provides:
//! - `CheckpointManager` for the save / load / restore / finalize lifecycle
//! - `plan_resume` deciding which snapshots to load at startup
//! - `upgrade` and `transplant` for parameter-name reconciliation
//! - `Snapshot` for the complete persisted training state
//! - `load_pretrained_model` for zoo artifacts

mod manager;
mod paths;
pub mod policy;
pub mod reconcile;
pub mod state;
pub mod zoo;

use serde_json::{Map, Value};

pub use manager::{CheckpointManager, CheckpointManagerBuilder, RunPhase};
pub use paths::CheckpointPaths;
pub use policy::{plan_resume, LoadRequest, MissingArtifact, ResumePlan, ResumeSource};
pub use reconcile::{transplant, upgrade, KeyMapping, TransplantReport, PARALLEL_PREFIX};
pub use state::{BestMarker, Snapshot, SNAPSHOT_SCHEMA_VERSION};
pub use zoo::{load_pretrained_model, DirectoryZoo, PretrainedArtifact, ZooResolver};

/// Ensure a decoded checkpoint has a `model` key.
///
/// Bare parameter mappings (final artifacts, some zoo checkpoints) are
/// wrapped as `{"model": <mapping>}`.
pub fn normalize(value: Value) -> Value {
    match value {
        Value::Object(map) if map.contains_key("model") => Value::Object(map),
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("model".into(), other);
            Value::Object(wrapped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_wraps_bare_mapping() {
        let bare = json!({"fc.weight": {"v": 1, "dim": [1], "data": [0.5]}});

        let wrapped = normalize(bare.clone());

        assert_eq!(wrapped, json!({ "model": bare }));
    }

    #[test]
    fn test_normalize_keeps_full_snapshot() {
        let full = json!({"model": {}, "best_iteration": 3});
        assert_eq!(normalize(full.clone()), full);
    }
}
