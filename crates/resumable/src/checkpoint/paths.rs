//! Conventional checkpoint file layout.
//!
//! ```text
//! <save_dir>/config.yaml
//! <save_dir>/<prefix><model>_final.pth
//! <save_dir>/<prefix>best.ckpt
//! <save_dir>/<prefix>current.ckpt
//! <save_dir>/models/model_<update>.ckpt
//! ```

use std::path::{Path, PathBuf};

/// Paths of every artifact a run writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointPaths {
    save_dir: PathBuf,
    prefix: String,
    model_name: String,
}

impl CheckpointPaths {
    /// `ckpt_name` is the model's optional filename prefix.
    pub fn new(save_dir: impl Into<PathBuf>, model_name: &str, ckpt_name: Option<&str>) -> Self {
        Self {
            save_dir: save_dir.into(),
            prefix: ckpt_name.map(|n| format!("{}_", n)).unwrap_or_default(),
            model_name: model_name.to_string(),
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn models_dir(&self) -> PathBuf {
        self.save_dir.join("models")
    }

    pub fn config(&self) -> PathBuf {
        self.save_dir.join("config.yaml")
    }

    /// Parameters-only deployment artifact.
    pub fn final_model(&self) -> PathBuf {
        let name = if self.model_name.is_empty() {
            format!("{}final.pth", self.prefix)
        } else {
            format!("{}{}_final.pth", self.prefix, self.model_name)
        };
        self.save_dir.join(name)
    }

    pub fn best(&self) -> PathBuf {
        self.save_dir.join(format!("{}best.ckpt", self.prefix))
    }

    pub fn current(&self) -> PathBuf {
        self.save_dir.join(format!("{}current.ckpt", self.prefix))
    }

    /// Per-update archival snapshot.
    pub fn archival(&self, update: u64) -> PathBuf {
        self.models_dir().join(format!("model_{}.ckpt", update))
    }
}
