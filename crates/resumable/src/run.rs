//! Collaborator interfaces the checkpoint manager reads from and writes to.
//!
//! The training loop owns the model, optimizer, best-result tracker and
//! progress counters. The manager only sees them through these traits,
//! bundled per call in a [`RunState`].

use std::collections::BTreeMap;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

/// A named parameter value.
pub type Tensor = ArrayD<f32>;

/// Parameter name to tensor, iterated in name order.
pub type StateDict = BTreeMap<String, Tensor>;

/// Training progress counters, mutated by the training loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Progress {
    pub current_iteration: u64,
    pub current_epoch: u64,
    pub num_updates: u64,
}

/// How the live model is executed.
///
/// Replicated execution wraps every parameter name in the
/// [`PARALLEL_PREFIX`](crate::checkpoint::PARALLEL_PREFIX) namespace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMode {
    /// Single-process, multi-device replication
    pub data_parallel: bool,
    /// Multi-process data parallelism
    pub distributed: bool,
}

impl ExecutionMode {
    pub fn single() -> Self {
        Self::default()
    }

    pub fn data_parallel() -> Self {
        Self {
            data_parallel: true,
            distributed: false,
        }
    }

    pub fn distributed() -> Self {
        Self {
            data_parallel: false,
            distributed: true,
        }
    }

    /// Whether parameter names carry the parallel-wrapper prefix.
    pub fn is_parallel(&self) -> bool {
        self.data_parallel || self.distributed
    }
}

/// Outcome of a non-strict state load.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Live parameters the loaded state did not provide
    pub missing_keys: Vec<String>,
    /// Loaded entries with no live counterpart
    pub unexpected_keys: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.missing_keys.is_empty() && self.unexpected_keys.is_empty()
    }
}

/// Trait for models whose parameters can be checkpointed.
pub trait Model {
    /// Snapshot of every parameter.
    fn state_dict(&self) -> StateDict;

    /// Write `state` into the live parameters.
    ///
    /// With `strict == false`, missing and unexpected keys are reported
    /// rather than rejected.
    fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<LoadReport>;

    /// Filename prefix for this model's checkpoints.
    fn ckpt_name(&self) -> Option<String> {
        None
    }

    /// Canonical form of a snapshot key, used when matching pretrained weights.
    fn format_state_key(&self, key: &str) -> String {
        key.to_string()
    }

    /// Optional capability: rebuild the model from a named pretrained artifact.
    fn as_from_pretrained(&mut self) -> Option<&mut dyn FromPretrained> {
        None
    }
}

/// Models that can reload themselves from a zoo identifier.
pub trait FromPretrained {
    fn from_pretrained(&mut self, identifier: &str) -> Result<()>;
}

/// Optimizer state rejected by the optimizer (usually a shape mismatch).
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StateMismatch(pub String);

/// Trait for optimizers with serializable state.
pub trait Optimizer {
    fn state_dict(&self) -> Value;

    fn load_state_dict(&mut self, state: &Value) -> core::result::Result<(), StateMismatch>;
}

/// Tracks the best validation result seen so far.
pub trait BestTracker {
    fn best_monitored_iteration(&self) -> u64;

    fn best_monitored_update(&self) -> u64;

    /// `None` until a finite metric has been observed.
    fn best_monitored_value(&self) -> Option<f64>;

    fn best_monitored_epoch(&self) -> Option<u64> {
        None
    }

    /// Re-seed the tracker from a decoded snapshot.
    fn init_from_checkpoint(&mut self, snapshot: &Value);
}

/// Mutable view of a training run, handed to the manager per call.
pub struct RunState<'a> {
    pub model: &'a mut dyn Model,
    pub optimizer: &'a mut dyn Optimizer,
    pub tracker: &'a mut dyn BestTracker,
    pub progress: &'a mut Progress,
}

impl<'a> RunState<'a> {
    pub fn new(
        model: &'a mut dyn Model,
        optimizer: &'a mut dyn Optimizer,
        tracker: &'a mut dyn BestTracker,
        progress: &'a mut Progress,
    ) -> Self {
        Self {
            model,
            optimizer,
            tracker,
            progress,
        }
    }
}

/// Plain named-parameter model.
///
/// Useful as a holder for exported weights and as a stand-in model in tests.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterMap {
    pub params: StateDict,
    pub name: Option<String>,
}

impl ParameterMap {
    pub fn new(params: StateDict) -> Self {
        Self { params, name: None }
    }

    /// Set the checkpoint filename prefix.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl Model for ParameterMap {
    fn state_dict(&self) -> StateDict {
        self.params.clone()
    }

    fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<LoadReport> {
        let report = LoadReport {
            missing_keys: self
                .params
                .keys()
                .filter(|k| !state.contains_key(*k))
                .cloned()
                .collect(),
            unexpected_keys: state
                .keys()
                .filter(|k| !self.params.contains_key(*k))
                .cloned()
                .collect(),
        };

        if strict && !report.is_clean() {
            return Err(crate::CheckpointError::SchemaMismatch(format!(
                "missing keys {:?}, unexpected keys {:?}",
                report.missing_keys, report.unexpected_keys
            )));
        }

        // Validate every shape before touching any parameter
        for (name, value) in state {
            if let Some(param) = self.params.get(name) {
                if param.shape() != value.shape() {
                    return Err(crate::CheckpointError::SchemaMismatch(format!(
                        "size mismatch for {}: expected {:?}, got {:?}",
                        name,
                        param.shape(),
                        value.shape()
                    )));
                }
            }
        }

        for (name, value) in state {
            if let Some(param) = self.params.get_mut(name) {
                param.assign(value);
            }
        }

        Ok(report)
    }

    fn ckpt_name(&self) -> Option<String> {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn params(names: &[&str]) -> StateDict {
        names
            .iter()
            .map(|n| (n.to_string(), ArrayD::zeros(IxDyn(&[2]))))
            .collect()
    }

    #[test]
    fn test_execution_mode_parallel() {
        assert!(!ExecutionMode::single().is_parallel());
        assert!(ExecutionMode::data_parallel().is_parallel());
        assert!(ExecutionMode::distributed().is_parallel());
    }

    #[test]
    fn test_non_strict_load_reports_keys() {
        let mut model = ParameterMap::new(params(&["a", "b"]));
        let mut incoming = params(&["b", "c"]);
        incoming.insert("b".into(), ArrayD::from_elem(IxDyn(&[2]), 3.0));

        let report = model.load_state_dict(&incoming, false).unwrap();

        assert_eq!(report.missing_keys, vec!["a".to_string()]);
        assert_eq!(report.unexpected_keys, vec!["c".to_string()]);
        assert_eq!(model.params["b"], ArrayD::from_elem(IxDyn(&[2]), 3.0));
    }

    #[test]
    fn test_strict_load_rejects_mismatch() {
        let mut model = ParameterMap::new(params(&["a"]));
        assert!(model.load_state_dict(&params(&["b"]), true).is_err());
    }

    #[test]
    fn test_load_rejects_shape_mismatch() {
        let mut model = ParameterMap::new(params(&["a"]));
        let mut incoming = StateDict::new();
        incoming.insert("a".into(), ArrayD::zeros(IxDyn(&[3])));
        assert!(model.load_state_dict(&incoming, false).is_err());
    }

    #[test]
    fn test_shape_mismatch_leaves_model_untouched() {
        let mut model = ParameterMap::new(params(&["a", "b"]));
        let before = model.clone();
        let mut incoming = StateDict::new();
        // "a" sorts first and fits; "b" does not
        incoming.insert("a".into(), ArrayD::from_elem(IxDyn(&[2]), 5.0));
        incoming.insert("b".into(), ArrayD::zeros(IxDyn(&[3])));

        assert!(model.load_state_dict(&incoming, false).is_err());
        assert_eq!(model, before);
    }
}
