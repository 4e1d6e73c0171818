//! # resumable
//!
//! Checkpoint and resume for long-running iterative training.
//!
//! ## Overview
//!
//! resumable provides:
//! - `CheckpointManager` owning the save / load / restore / finalize lifecycle
//! - A resume planner choosing between the local "current" and "best"
//!   snapshots, an explicit resume file and a pretrained zoo artifact
//! - Key reconciliation between single-device and data-parallel parameter
//!   names, and partial transplant of pretrained weights
//! - A self-describing JSON snapshot codec over a pluggable `ArtifactStore`
//! - Optional git provenance capture for reproducibility
//!
//! ## Features
//!
//! - `git` (default) - capture branch/commit/diff provenance via libgit2
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use resumable::prelude::*;
//!
//! let config = RunConfig::from_yaml_file("run.yaml")?;
//! let mut manager = CheckpointManager::builder(config)
//!     .backend(Arc::new(SingleProcess))
//!     .build(&model)?;
//!
//! let mut run = RunState::new(&mut model, &mut optimizer, &mut tracker, &mut progress);
//! manager.load_state_dict(&mut run)?;
//!
//! // In the training loop:
//! manager.save(&run, update, is_best)?;
//! ```

use std::path::PathBuf;

pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod distributed;
pub mod log;
pub mod provenance;
pub mod run;
pub mod store;
pub mod tracker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::checkpoint::{
        load_pretrained_model, plan_resume, transplant, upgrade, CheckpointManager,
        CheckpointPaths, DirectoryZoo, KeyMapping, LoadRequest, ResumePlan, ResumeSource,
        RunPhase, Snapshot, ZooResolver,
    };
    pub use crate::config::{CheckpointConfig, ResetConfig, RunConfig};
    pub use crate::distributed::{DistributedBackend, SingleProcess, ThreadGroup};
    pub use crate::log::{LogSink, MemorySink, NoOpSink, TracingSink};
    pub use crate::provenance::{Provenance, ProvenanceProvider, StaticProvenance};
    pub use crate::run::{
        BestTracker, ExecutionMode, FromPretrained, LoadReport, Model, Optimizer, ParameterMap,
        Progress, RunState, StateDict, StateMismatch, Tensor,
    };
    pub use crate::store::{ArtifactStore, LocalStore, MemoryStore};
    pub use crate::tracker::EarlyStopping;

    pub use std::sync::Arc;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not decode snapshot at {}: {source}", path.display())]
    Codec {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Snapshot does not match the live run: {0}")]
    SchemaMismatch(String),

    #[error("Optimizer failed to load ({0}). Try with checkpoint.reset.optimizer=true")]
    OptimizerLoad(String),

    #[error("Ambiguous zoo artifact at {}: {reason}", path.display())]
    AmbiguousZooArtifact { path: PathBuf, reason: String },

    #[error("Invalid YAML configuration: {0}")]
    ConfigFormat(#[from] serde_yaml::Error),

    #[error("Checkpoint manager was finalized; no further {0} allowed")]
    Finalized(&'static str),
}

impl CheckpointError {
    /// Wrap an I/O error with the path it happened on.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = core::result::Result<T, CheckpointError>;
