//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use ndarray::{ArrayD, IxDyn};
use resumable::prelude::*;
use serde_json::Value;

/// Optimizer whose state is an opaque value.
#[derive(Debug, Default, PartialEq)]
pub struct StubOptimizer {
    pub state: Value,
}

impl Optimizer for StubOptimizer {
    fn state_dict(&self) -> Value {
        self.state.clone()
    }

    fn load_state_dict(&mut self, state: &Value) -> Result<(), StateMismatch> {
        self.state = state.clone();
        Ok(())
    }
}

/// Two-layer model with every parameter set to `value`.
pub fn mlp(value: f32) -> ParameterMap {
    let mut params = StateDict::new();
    params.insert("encoder.weight".into(), ArrayD::from_elem(IxDyn(&[4, 2]), value));
    params.insert("encoder.bias".into(), ArrayD::from_elem(IxDyn(&[4]), value));
    params.insert("classifier.weight".into(), ArrayD::from_elem(IxDyn(&[2, 4]), value));
    ParameterMap::new(params)
}

/// Everything a training loop owns.
pub struct Trainer {
    pub model: ParameterMap,
    pub optimizer: StubOptimizer,
    pub tracker: EarlyStopping,
    pub progress: Progress,
}

impl Trainer {
    pub fn new(value: f32) -> Self {
        Self {
            model: mlp(value),
            optimizer: StubOptimizer::default(),
            tracker: EarlyStopping::new(false),
            progress: Progress::default(),
        }
    }

    pub fn run(&mut self) -> RunState<'_> {
        RunState::new(
            &mut self.model,
            &mut self.optimizer,
            &mut self.tracker,
            &mut self.progress,
        )
    }

    /// Advance `updates` steps, nudging parameters each step.
    pub fn train(&mut self, updates: u64) {
        for _ in 0..updates {
            for param in self.model.params.values_mut() {
                param.mapv_inplace(|v| v + 0.5);
            }
            self.progress.current_iteration += 1;
            self.progress.num_updates += 1;
        }
        self.optimizer.state = serde_json::json!({ "step": self.progress.num_updates });
    }
}

/// Run configuration saving under `save_dir`, without git capture.
pub fn run_config(save_dir: &std::path::Path, checkpoint: CheckpointConfig) -> RunConfig {
    RunConfig::default()
        .with_model("mlp")
        .with_save_dir(save_dir)
        .with_checkpoint(checkpoint.save_git_details(false))
}
