//! Run and checkpoint configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checkpoint::reconcile::deserialize_mappings;
use crate::checkpoint::KeyMapping;
use crate::{CheckpointError, Result};

/// Environment variable overriding `env.save_dir`.
pub const SAVE_DIR_ENV: &str = "RESUMABLE_SAVE_DIR";

/// Save directory used when the configuration names none.
pub const DEFAULT_SAVE_DIR: &str = "./save";

/// Which parts of a resumed snapshot to ignore.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetConfig {
    /// Ignore optimizer state and counters
    pub all: bool,
    /// Ignore optimizer state
    pub optimizer: bool,
    /// Ignore progress counters
    pub counts: bool,
}

/// The `checkpoint` section of a run configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Resume from the conventional local checkpoint
    pub resume: bool,
    /// Prefer `best.ckpt` over `current.ckpt` when resuming
    pub resume_best: bool,
    /// Explicit snapshot to start from
    pub resume_file: Option<PathBuf>,
    /// Pretrained artifact identifier (or local artifact directory)
    pub resume_zoo: Option<String>,
    /// Load `resume_file` / `resume_zoo` through the pretrained mapping
    pub resume_pretrained: bool,
    /// Ordered `(source, target)` prefixes for partial loads
    #[serde(deserialize_with = "deserialize_mappings")]
    pub pretrained_state_mapping: Vec<KeyMapping>,
    pub reset: ResetConfig,
    /// Let the model rebuild itself from the zoo artifact
    pub zoo_override: bool,
    /// Capture git provenance into each snapshot
    pub save_git_details: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            resume: false,
            resume_best: false,
            resume_file: None,
            resume_zoo: None,
            resume_pretrained: false,
            pretrained_state_mapping: Vec::new(),
            reset: ResetConfig::default(),
            zoo_override: false,
            save_git_details: true,
        }
    }
}

impl CheckpointConfig {
    /// Enable local auto-resume.
    pub fn resume(mut self, best: bool) -> Self {
        self.resume = true;
        self.resume_best = best;
        self
    }

    /// Start from an explicit snapshot file.
    pub fn with_resume_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.resume_file = Some(path.into());
        self
    }

    /// Start from a zoo artifact.
    pub fn with_resume_zoo(mut self, identifier: impl Into<String>) -> Self {
        self.resume_zoo = Some(identifier.into());
        self
    }

    /// Load explicit sources through `mapping` instead of a full load.
    pub fn with_pretrained_mapping(mut self, mapping: Vec<KeyMapping>) -> Self {
        self.resume_pretrained = true;
        self.pretrained_state_mapping = mapping;
        self
    }

    /// Set reset flags.
    pub fn with_reset(mut self, reset: ResetConfig) -> Self {
        self.reset = reset;
        self
    }

    /// Enable/disable git provenance capture.
    pub fn save_git_details(mut self, enabled: bool) -> Self {
        self.save_git_details = enabled;
        self
    }

    pub fn reset_optimizer(&self) -> bool {
        self.reset.optimizer || self.reset.all
    }

    pub fn reset_counts(&self) -> bool {
        self.reset.counts || self.reset.all
    }
}

/// Fully-resolved run configuration.
///
/// Kept as a plain value tree so it can be stored inside snapshots and read
/// back without any of this crate's types.
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    value: Value,
    checkpoint: CheckpointConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            value: Value::Object(Default::default()),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl RunConfig {
    /// Build from a value tree, parsing the `checkpoint` section.
    pub fn from_value(value: Value) -> Result<Self> {
        let checkpoint = match value.get("checkpoint") {
            Some(section) => CheckpointConfig::deserialize(section).map_err(|e| {
                CheckpointError::Configuration(format!("invalid checkpoint section: {}", e))
            })?,
            None => CheckpointConfig::default(),
        };
        Ok(Self { value, checkpoint })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(text)?;
        Self::from_value(value)?.with_env_overrides()
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|e| CheckpointError::storage(path, e))?;
        Self::from_yaml_str(&text)
    }

    /// Apply environment overrides on top of file values.
    pub fn with_env_overrides(self) -> Result<Self> {
        match std::env::var(SAVE_DIR_ENV) {
            Ok(dir) if !dir.is_empty() => Ok(self.with_save_dir(dir)),
            _ => Ok(self),
        }
    }

    /// Replace the checkpoint section.
    pub fn with_checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        if let (Value::Object(map), Ok(section)) =
            (&mut self.value, serde_json::to_value(&checkpoint))
        {
            map.insert("checkpoint".into(), section);
        }
        self.checkpoint = checkpoint;
        self
    }

    /// Set `env.save_dir`.
    pub fn with_save_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = Value::String(dir.as_ref().to_string_lossy().into_owned());
        if let Value::Object(map) = &mut self.value {
            let env = map
                .entry("env")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Value::Object(env) = env {
                env.insert("save_dir".into(), dir);
            }
        }
        self
    }

    /// Set the `model` name.
    pub fn with_model(mut self, name: &str) -> Self {
        if let Value::Object(map) = &mut self.value {
            map.insert("model".into(), Value::String(name.to_string()));
        }
        self
    }

    pub fn checkpoint(&self) -> &CheckpointConfig {
        &self.checkpoint
    }

    /// Model name, empty when unset.
    pub fn model_name(&self) -> &str {
        self.value
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn save_dir(&self) -> PathBuf {
        self.value
            .get("env")
            .and_then(|env| env.get("save_dir"))
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SAVE_DIR))
    }

    /// Replace `model_config` (used when a zoo artifact overrides the model).
    pub fn set_model_config(&mut self, model_config: Value) {
        if let Value::Object(map) = &mut self.value {
            map.insert("model_config".into(), model_config);
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }

    /// Configuration as persisted, without the `config_override` clutter.
    pub fn persistable(&self) -> Value {
        let mut value = self.value.clone();
        if let Value::Object(map) = &mut value {
            map.remove("config_override");
        }
        value
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.persistable())?)
    }
}
