//! Pretrained ("zoo") artifact resolution.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::codec;
use crate::store::ArtifactStore;
use crate::{CheckpointError, Result};

/// Checkpoint file extensions recognised inside an artifact directory.
pub const CHECKPOINT_EXTENSIONS: &[&str] = &["ckpt", "pth", "pt"];

/// Trait for remote artifact resolvers.
///
/// Download and caching are the resolver's business; the manager only needs
/// a local directory back.
pub trait ZooResolver: Send + Sync {
    fn fetch(&self, identifier: &str) -> Result<PathBuf>;
}

/// Resolver that maps identifiers to subdirectories of a local root.
#[derive(Clone, Debug)]
pub struct DirectoryZoo {
    root: PathBuf,
}

impl DirectoryZoo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ZooResolver for DirectoryZoo {
    fn fetch(&self, identifier: &str) -> Result<PathBuf> {
        let path = self.root.join(identifier);
        if !path.is_dir() {
            return Err(CheckpointError::Configuration(format!(
                "zoo artifact {} not found under {}",
                identifier,
                self.root.display()
            )));
        }
        Ok(path)
    }
}

/// A resolved pretrained artifact.
#[derive(Clone, Debug, PartialEq)]
pub struct PretrainedArtifact {
    /// Sub-config for this model, if the config names one
    pub config: Value,
    /// Checkpoint contents, unwrapped from its `model` key when present
    pub checkpoint: Value,
    /// Full configuration shipped with the artifact
    pub full_config: Value,
}

/// Resolve `name_or_path` to a pretrained artifact.
///
/// Existing local paths are used directly; anything else goes through
/// `resolver`. The artifact directory must hold at most one `*.yaml` config
/// and exactly one checkpoint file.
pub fn load_pretrained_model(
    store: &dyn ArtifactStore,
    resolver: Option<&dyn ZooResolver>,
    name_or_path: &str,
) -> Result<PretrainedArtifact> {
    let local = Path::new(name_or_path);
    let download_path = if store.exists(local) {
        local.to_path_buf()
    } else {
        match resolver {
            Some(resolver) => resolver.fetch(name_or_path)?,
            None => {
                return Err(CheckpointError::Configuration(format!(
                    "{} is not a local path and no zoo resolver is configured",
                    name_or_path
                )))
            }
        }
    };

    let files = store.list(&download_path)?;
    let configs: Vec<&PathBuf> = files.iter().filter(|p| has_extension(p, &["yaml"])).collect();
    let ckpts: Vec<&PathBuf> = files
        .iter()
        .filter(|p| has_extension(p, CHECKPOINT_EXTENSIONS))
        .collect();

    if configs.len() > 1 {
        return Err(CheckpointError::AmbiguousZooArtifact {
            path: download_path,
            reason: format!("{} yaml configs found, expected at most one", configs.len()),
        });
    }
    if ckpts.len() != 1 {
        return Err(CheckpointError::AmbiguousZooArtifact {
            path: download_path,
            reason: format!("{} checkpoint files found, expected exactly one", ckpts.len()),
        });
    }

    let ckpt = codec::read_value(store, ckpts[0])?;

    let full_config = match configs.first() {
        Some(path) => {
            let text = store.read(path)?;
            serde_yaml::from_slice::<Value>(&text)?
        }
        None => match ckpt.get("config") {
            Some(config) => config.clone(),
            None => {
                return Err(CheckpointError::AmbiguousZooArtifact {
                    path: download_path,
                    reason: "no yaml config and the checkpoint carries no config".into(),
                })
            }
        },
    };

    let model_config = full_config.get("model_config").unwrap_or(&full_config);
    let config = model_config
        .get(model_key(name_or_path))
        .cloned()
        .unwrap_or(Value::Null);

    let checkpoint = match ckpt {
        Value::Object(mut map) if map.contains_key("model") => {
            map.remove("model").unwrap_or(Value::Null)
        }
        other => other,
    };

    Ok(PretrainedArtifact {
        config,
        checkpoint,
        full_config,
    })
}

/// Final path component with its extension removed.
fn model_key(name_or_path: &str) -> &str {
    let last = name_or_path
        .rsplit(std::path::MAIN_SEPARATOR)
        .next()
        .unwrap_or(name_or_path);
    last.split('.').next().unwrap_or(last)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.contains(&e))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;
    use serde_json::json;
    use tempfile::tempdir;

    fn write(path: &Path, data: &str) {
        LocalStore.write_atomic(path, data.as_bytes()).unwrap();
    }

    #[test]
    fn test_model_key() {
        assert_eq!(model_key("visual_bert.pretrained.coco"), "visual_bert");
        let path = format!("zoo{}mmbt.defaults", std::path::MAIN_SEPARATOR);
        assert_eq!(model_key(&path), "mmbt");
    }

    #[test]
    fn test_local_artifact_with_yaml() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("mmbt");
        write(&artifact.join("config.yaml"), "model_config:\n  mmbt:\n    hidden: 8\n");
        write(
            &artifact.join("model.pth"),
            r#"{"model": {"fc.weight": {"v": 1, "dim": [1], "data": [1.0]}}}"#,
        );

        let loaded =
            load_pretrained_model(&LocalStore, None, artifact.to_str().unwrap()).unwrap();

        assert_eq!(loaded.config, json!({"hidden": 8}));
        assert!(loaded.checkpoint.get("fc.weight").is_some());
        assert!(loaded.full_config.get("model_config").is_some());
    }

    #[test]
    fn test_config_falls_back_to_checkpoint() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("clf");
        write(
            &artifact.join("best.ckpt"),
            r#"{"model": {}, "config": {"model_config": {"clf": {"layers": 2}}}}"#,
        );

        let loaded =
            load_pretrained_model(&LocalStore, None, artifact.to_str().unwrap()).unwrap();

        assert_eq!(loaded.config, json!({"layers": 2}));
    }

    #[test]
    fn test_multiple_checkpoints_rejected() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("a.ckpt"), "{}");
        write(&dir.path().join("b.pt"), "{}");

        let err = load_pretrained_model(&LocalStore, None, dir.path().to_str().unwrap());
        assert!(matches!(err, Err(CheckpointError::AmbiguousZooArtifact { .. })));
    }

    #[test]
    fn test_multiple_configs_rejected() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("a.yaml"), "{}");
        write(&dir.path().join("b.yaml"), "{}");
        write(&dir.path().join("model.ckpt"), "{}");

        let err = load_pretrained_model(&LocalStore, None, dir.path().to_str().unwrap());
        assert!(matches!(err, Err(CheckpointError::AmbiguousZooArtifact { .. })));
    }

    #[test]
    fn test_missing_config_rejected() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("model.ckpt"), r#"{"model": {}}"#);

        let err = load_pretrained_model(&LocalStore, None, dir.path().to_str().unwrap());
        assert!(matches!(err, Err(CheckpointError::AmbiguousZooArtifact { .. })));
    }

    #[test]
    fn test_resolver_used_for_identifiers() {
        let dir = tempdir().unwrap();
        write(
            &dir.path().join("mmbt.hateful_memes").join("model.ckpt"),
            r#"{"model": {}, "config": {"mmbt": {"k": 1}}}"#,
        );
        let zoo = DirectoryZoo::new(dir.path());

        let loaded = load_pretrained_model(&LocalStore, Some(&zoo), "mmbt.hateful_memes").unwrap();

        assert_eq!(loaded.config, json!({"k": 1}));
        assert_eq!(loaded.checkpoint, json!({}));
    }
}
