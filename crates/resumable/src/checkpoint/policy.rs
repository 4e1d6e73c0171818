//! Resume policy: which snapshots to load at startup, and in what order.

use std::fmt;
use std::path::PathBuf;

use super::paths::CheckpointPaths;
use crate::config::CheckpointConfig;
use crate::store::ArtifactStore;
use crate::{CheckpointError, Result};

/// Where a snapshot comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResumeSource {
    /// `<prefix>current.ckpt` in the save directory
    LocalCurrent(PathBuf),
    /// `<prefix>best.ckpt` in the save directory
    LocalBest(PathBuf),
    /// `checkpoint.resume_file`
    ExplicitFile(PathBuf),
    /// `checkpoint.resume_zoo`
    RemoteZoo(String),
}

impl fmt::Display for ResumeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalCurrent(p) | Self::LocalBest(p) | Self::ExplicitFile(p) => {
                write!(f, "{}", p.display())
            }
            Self::RemoteZoo(id) => write!(f, "zoo:{}", id),
        }
    }
}

/// One snapshot load to perform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadRequest {
    pub source: ResumeSource,
    /// Load through the pretrained key mapping rather than in full
    pub load_pretrained: bool,
}

/// A requested local checkpoint was absent. Not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingArtifact {
    pub requested: PathBuf,
    pub fallback: PathBuf,
}

impl fmt::Display for MissingArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tried to resume but checkpoint filepath {} is not present. Trying {}, otherwise skipping.",
            self.requested.display(),
            self.fallback.display()
        )
    }
}

/// Ordered loads plus the warnings raised while planning them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResumePlan {
    pub loads: Vec<LoadRequest>,
    pub warnings: Vec<MissingArtifact>,
}

impl ResumePlan {
    /// No snapshot will be loaded: the run starts fresh.
    pub fn is_fresh(&self) -> bool {
        self.loads.is_empty()
    }
}

/// Decide which snapshots to load.
///
/// 1. An explicit `resume_file` / `resume_zoo` applies when local resume is
///    off or the conventional checkpoint is absent. An existing
///    `resume_file` wins and ends planning. Otherwise the zoo artifact is
///    queued and planning continues. A missing `resume_file` without a zoo
///    fallback is a configuration error.
/// 2. With `resume`, the conventional checkpoint (`best` if `resume_best`,
///    else `current`) is queued, falling back to the other one with a
///    warning. If neither exists the run starts fresh.
///
/// Step 2 can follow a zoo load from step 1; the later load wins for
/// whatever state both touch.
pub fn plan_resume(
    config: &CheckpointConfig,
    paths: &CheckpointPaths,
    store: &dyn ArtifactStore,
) -> Result<ResumePlan> {
    let mut plan = ResumePlan::default();

    let (preferred, fallback) = if config.resume_best {
        (
            ResumeSource::LocalBest(paths.best()),
            ResumeSource::LocalCurrent(paths.current()),
        )
    } else {
        (
            ResumeSource::LocalCurrent(paths.current()),
            ResumeSource::LocalBest(paths.best()),
        )
    };
    let preferred_path = local_path(&preferred);
    let fallback_path = local_path(&fallback);

    let explicit = config.resume_file.is_some() || config.resume_zoo.is_some();
    if explicit && (!config.resume || !store.exists(&preferred_path)) {
        match (&config.resume_file, &config.resume_zoo) {
            (Some(file), _) if store.exists(file) => {
                plan.loads.push(LoadRequest {
                    source: ResumeSource::ExplicitFile(file.clone()),
                    load_pretrained: config.resume_pretrained,
                });
                return Ok(plan);
            }
            (_, Some(zoo)) => {
                plan.loads.push(LoadRequest {
                    source: ResumeSource::RemoteZoo(zoo.clone()),
                    load_pretrained: config.resume_pretrained,
                });
            }
            (Some(file), None) => {
                return Err(CheckpointError::Configuration(format!(
                    "resume_file {} doesn't exist",
                    file.display()
                )));
            }
            (None, None) => {}
        }
    }

    if config.resume {
        if store.exists(&preferred_path) {
            plan.loads.push(LoadRequest {
                source: preferred,
                load_pretrained: false,
            });
        } else {
            plan.warnings.push(MissingArtifact {
                requested: preferred_path,
                fallback: fallback_path.clone(),
            });
            if store.exists(&fallback_path) {
                plan.loads.push(LoadRequest {
                    source: fallback,
                    load_pretrained: false,
                });
            }
        }
    }

    Ok(plan)
}

fn local_path(source: &ResumeSource) -> PathBuf {
    match source {
        ResumeSource::LocalCurrent(p) | ResumeSource::LocalBest(p) | ResumeSource::ExplicitFile(p) => {
            p.clone()
        }
        ResumeSource::RemoteZoo(id) => PathBuf::from(id),
    }
}
