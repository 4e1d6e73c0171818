//! Best-result tracking with optional early stopping.

use serde_json::Value;

use crate::run::{BestTracker, Progress};

/// Tracks the best monitored metric and when it was reached.
#[derive(Clone, Debug, PartialEq)]
pub struct EarlyStopping {
    /// Lower metric values are better
    pub minimize: bool,
    /// Stop after this many updates without improvement
    pub patience: Option<u64>,
    best_iteration: u64,
    best_update: u64,
    best_epoch: Option<u64>,
    best_value: Option<f64>,
}

impl Default for EarlyStopping {
    fn default() -> Self {
        Self::new(false)
    }
}

impl EarlyStopping {
    pub fn new(minimize: bool) -> Self {
        Self {
            minimize,
            patience: None,
            best_iteration: 0,
            best_update: 0,
            best_epoch: None,
            best_value: None,
        }
    }

    /// Set patience in updates.
    pub fn patience(mut self, updates: u64) -> Self {
        self.patience = Some(updates);
        self
    }

    /// Record a metric value; returns true when it is a new best.
    pub fn observe(&mut self, value: f64, progress: &Progress) -> bool {
        if !value.is_finite() {
            return false;
        }

        let improved = match self.best_value {
            None => true,
            Some(best) if self.minimize => value < best,
            Some(best) => value > best,
        };

        if improved {
            self.best_value = Some(value);
            self.best_iteration = progress.current_iteration;
            self.best_update = progress.num_updates;
            self.best_epoch = Some(progress.current_epoch);
        }
        improved
    }

    /// Whether patience ran out at `num_updates`.
    pub fn should_stop(&self, num_updates: u64) -> bool {
        match self.patience {
            Some(patience) => num_updates.saturating_sub(self.best_update) > patience,
            None => false,
        }
    }
}

impl BestTracker for EarlyStopping {
    fn best_monitored_iteration(&self) -> u64 {
        self.best_iteration
    }

    fn best_monitored_update(&self) -> u64 {
        self.best_update
    }

    fn best_monitored_value(&self) -> Option<f64> {
        self.best_value
    }

    fn best_monitored_epoch(&self) -> Option<u64> {
        self.best_epoch
    }

    fn init_from_checkpoint(&mut self, snapshot: &Value) {
        let get = |key: &str| snapshot.get(key).and_then(Value::as_u64);

        if let Some(iteration) = get("best_iteration") {
            self.best_iteration = iteration;
            // Legacy snapshots only tracked iterations
            self.best_update = get("best_update").unwrap_or(iteration);
        }
        if let Some(epoch) = get("best_epoch") {
            self.best_epoch = Some(epoch);
        }
        if let Some(value) = snapshot.get("best_metric_value").and_then(Value::as_f64) {
            self.best_value = Some(value);
        }
    }
}
