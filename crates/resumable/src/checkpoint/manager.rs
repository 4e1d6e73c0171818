//! Checkpoint manager: save, resume, restore and finalize.

use std::sync::Arc;

use serde_json::Value;

use super::paths::CheckpointPaths;
use super::policy::{plan_resume, ResumePlan, ResumeSource};
use super::reconcile::{transplant, upgrade, KeyMapping};
use super::state::{BestMarker, Snapshot};
use super::zoo::{load_pretrained_model, ZooResolver};
use crate::codec;
use crate::config::RunConfig;
use crate::distributed::{DistributedBackend, SingleProcess};
use crate::log::{LogSink, TracingSink};
use crate::provenance::ProvenanceProvider;
use crate::run::{ExecutionMode, Model, Optimizer, Progress, RunState, StateDict};
use crate::store::{ArtifactStore, LocalStore};
use crate::{CheckpointError, Result};

/// Lifecycle of a run as seen by the manager.
///
/// `Fresh` and `Resuming` are decided once at startup by
/// [`CheckpointManager::load_state_dict`]. Saves and restores happen while
/// `Active`. `Finalized` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunPhase {
    Fresh,
    Resuming,
    Active,
    Finalized,
}

/// Builder for [`CheckpointManager`].
pub struct CheckpointManagerBuilder {
    config: RunConfig,
    mode: ExecutionMode,
    store: Arc<dyn ArtifactStore>,
    backend: Arc<dyn DistributedBackend>,
    provenance: Option<Box<dyn ProvenanceProvider>>,
    zoo: Option<Box<dyn ZooResolver>>,
    sink: Box<dyn LogSink>,
}

impl CheckpointManagerBuilder {
    /// Set how the live model executes (defaults to single device).
    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the artifact store (defaults to the local filesystem).
    pub fn store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = store;
        self
    }

    /// Set the distributed backend (defaults to a single process).
    pub fn backend(mut self, backend: Arc<dyn DistributedBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Set the provenance source used when `save_git_details` is on.
    pub fn provenance(mut self, provider: impl ProvenanceProvider + 'static) -> Self {
        self.provenance = Some(Box::new(provider));
        self
    }

    /// Set the resolver for `resume_zoo` identifiers.
    pub fn zoo(mut self, resolver: impl ZooResolver + 'static) -> Self {
        self.zoo = Some(Box::new(resolver));
        self
    }

    /// Set the message sink (defaults to `tracing`).
    pub fn sink(mut self, sink: impl LogSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Create the manager for `model`.
    ///
    /// On the primary role this creates `<save_dir>/models` and writes
    /// `<save_dir>/config.yaml`. Other roles touch nothing.
    pub fn build(self, model: &dyn Model) -> Result<CheckpointManager> {
        let paths = CheckpointPaths::new(
            self.config.save_dir(),
            self.config.model_name(),
            model.ckpt_name().as_deref(),
        );

        let provenance = match self.provenance {
            Some(provider) => Some(provider),
            None => default_provenance(),
        };

        let manager = CheckpointManager {
            config: self.config,
            mode: self.mode,
            paths,
            store: self.store,
            backend: self.backend,
            provenance,
            zoo: self.zoo,
            sink: self.sink,
            phase: RunPhase::Fresh,
            resumed_from: Vec::new(),
        };

        if manager.backend.is_primary() {
            manager.store.mkdirs(&manager.paths.models_dir())?;
            manager.save_config()?;
        }

        Ok(manager)
    }
}

#[cfg(feature = "git")]
fn default_provenance() -> Option<Box<dyn ProvenanceProvider>> {
    match crate::provenance::GitProvenance::current_dir() {
        Ok(provider) => Some(Box::new(provider)),
        Err(e) => {
            tracing::warn!("Git provenance disabled: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "git"))]
fn default_provenance() -> Option<Box<dyn ProvenanceProvider>> {
    None
}

/// Owns the checkpoint lifecycle of one training run.
///
/// Handles saving (primary role only), startup resume, best-snapshot
/// restore and the final parameters-only artifact.
///
/// # Example
///
/// ```ignore
/// let mut manager = CheckpointManager::builder(config)
///     .backend(backend)
///     .build(&model)?;
///
/// let mut run = RunState::new(&mut model, &mut optimizer, &mut tracker, &mut progress);
/// manager.load_state_dict(&mut run)?;
///
/// // In the training loop:
/// let is_best = tracker.observe(metric, &progress);
/// manager.save(&run, progress.num_updates, is_best)?;
///
/// // Before the final evaluation:
/// manager.restore(&mut run)?;
/// manager.finalize(&*run.model)?;
/// ```
pub struct CheckpointManager {
    config: RunConfig,
    mode: ExecutionMode,
    paths: CheckpointPaths,
    store: Arc<dyn ArtifactStore>,
    backend: Arc<dyn DistributedBackend>,
    provenance: Option<Box<dyn ProvenanceProvider>>,
    zoo: Option<Box<dyn ZooResolver>>,
    sink: Box<dyn LogSink>,
    phase: RunPhase,
    resumed_from: Vec<ResumeSource>,
}

impl CheckpointManager {
    /// Start building a manager with local storage and a single process.
    pub fn builder(config: RunConfig) -> CheckpointManagerBuilder {
        CheckpointManagerBuilder {
            config,
            mode: ExecutionMode::default(),
            store: Arc::new(LocalStore),
            backend: Arc::new(SingleProcess),
            provenance: None,
            zoo: None,
            sink: Box::new(TracingSink),
        }
    }

    pub fn paths(&self) -> &CheckpointPaths {
        &self.paths
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Sources loaded at startup, in load order. Empty for a fresh run.
    pub fn resumed_from(&self) -> &[ResumeSource] {
        &self.resumed_from
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Write `<save_dir>/config.yaml`.
    pub fn save_config(&self) -> Result<()> {
        let yaml = self.config.to_yaml()?;
        self.store.write_atomic(&self.paths.config(), yaml.as_bytes())
    }

    /// Save a snapshot of `run`.
    ///
    /// Writes `models/model_<update>.ckpt`, `best.ckpt` when `is_best`, and
    /// always `current.ckpt`. No-op on every role except the primary.
    pub fn save(&self, run: &RunState<'_>, update: u64, is_best: bool) -> Result<()> {
        self.ensure_open("save")?;

        if !self.backend.is_primary() {
            return Ok(());
        }

        let provenance = if self.config.checkpoint().save_git_details {
            self.provenance.as_ref().and_then(|p| p.capture())
        } else {
            None
        };

        let snapshot = Snapshot::new(
            self.canonical_state(&*run.model),
            *run.progress,
            BestMarker::from_tracker(&*run.tracker),
            self.config.persistable(),
        )
        .with_optimizer_state(run.optimizer.state_dict())
        .with_provenance(provenance);

        let mut targets = vec![self.paths.archival(update)];
        if is_best {
            targets.push(self.paths.best());
        }
        targets.push(self.paths.current());

        codec::write_snapshot(&*self.store, &snapshot, &targets)?;

        tracing::info!(
            update,
            is_best,
            path = %self.paths.current().display(),
            "Saved checkpoint"
        );
        Ok(())
    }

    /// Resume at startup according to the configured policy.
    ///
    /// Returns the plan that was executed; an empty plan means a fresh run.
    pub fn load_state_dict(&mut self, run: &mut RunState<'_>) -> Result<ResumePlan> {
        self.ensure_open("load")?;

        let plan = plan_resume(self.config.checkpoint(), &self.paths, &*self.store)?;
        for warning in &plan.warnings {
            tracing::warn!("{}", warning);
            self.sink.write(&warning.to_string());
        }

        if !plan.is_fresh() {
            self.phase = RunPhase::Resuming;
        }

        for request in &plan.loads {
            self.load(run, &request.source, false, request.load_pretrained)?;
            self.resumed_from.push(request.source.clone());
        }

        self.phase = RunPhase::Active;
        Ok(plan)
    }

    /// Reload the best snapshot in full, if one exists.
    ///
    /// Waits on the distributed barrier first so no rank reads `best.ckpt`
    /// while the primary may still be writing it. Returns whether a
    /// snapshot was loaded.
    pub fn restore(&mut self, run: &mut RunState<'_>) -> Result<bool> {
        self.ensure_open("restore")?;

        self.backend.barrier();
        self.sink.write("Restoring checkpoint");

        let best = self.paths.best();
        if !self.store.exists(&best) {
            tracing::debug!(path = %best.display(), "No best checkpoint to restore");
            return Ok(false);
        }

        self.load(run, &ResumeSource::LocalBest(best), true, false)?;
        Ok(true)
    }

    /// Write the parameters-only deployment artifact and close the run.
    pub fn finalize(&mut self, model: &dyn Model) -> Result<()> {
        self.ensure_open("finalize")?;

        if self.backend.is_primary() {
            let path = self.paths.final_model();
            let bytes = codec::encode_state_dict(&self.canonical_state(model)).map_err(|source| {
                CheckpointError::Codec {
                    path: path.clone(),
                    source,
                }
            })?;
            self.store.write_atomic(&path, &bytes)?;
            tracing::info!(path = %path.display(), "Saved final model");
        }

        self.phase = RunPhase::Finalized;
        Ok(())
    }

    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        if self.phase == RunPhase::Finalized {
            return Err(CheckpointError::Finalized(operation));
        }
        Ok(())
    }

    /// Model parameters without the parallel-wrapper prefix.
    fn canonical_state(&self, model: &dyn Model) -> StateDict {
        let state = model.state_dict();
        if self.mode.is_parallel() {
            upgrade(state, false)
        } else {
            state
        }
    }

    fn load(
        &mut self,
        run: &mut RunState<'_>,
        source: &ResumeSource,
        force: bool,
        load_pretrained: bool,
    ) -> Result<()> {
        self.sink.write("Loading checkpoint");
        tracing::info!(%source, force, load_pretrained, "Loading checkpoint");

        let ckpt = match source {
            ResumeSource::RemoteZoo(identifier) => match self.load_from_zoo(run, identifier)? {
                Some(ckpt) => ckpt,
                None => return Ok(()),
            },
            ResumeSource::LocalCurrent(path)
            | ResumeSource::LocalBest(path)
            | ResumeSource::ExplicitFile(path) => codec::read_value(&*self.store, path)?,
        };

        let mut ckpt = super::normalize(ckpt);
        let model_value = ckpt
            .as_object_mut()
            .and_then(|map| map.remove("model"))
            .unwrap_or(Value::Null);
        let model_state = codec::state_dict_from_value(model_value).map_err(|e| {
            CheckpointError::SchemaMismatch(format!("model state in {} is malformed: {}", source, e))
        })?;

        let mapping: &[KeyMapping] = if load_pretrained && !force {
            &self.config.checkpoint().pretrained_state_mapping
        } else {
            &[]
        };

        let new_dict = upgrade(model_state, self.mode.is_parallel());

        if !mapping.is_empty() {
            let mapping = mapping.to_vec();
            return self.load_pretrained(run.model, &new_dict, &mapping);
        }

        let report = run.model.load_state_dict(&new_dict, false)?;
        if !report.missing_keys.is_empty() {
            tracing::warn!(keys = ?report.missing_keys, "Parameters missing from checkpoint");
        }
        if !report.unexpected_keys.is_empty() {
            tracing::warn!(keys = ?report.unexpected_keys, "Unexpected parameters in checkpoint");
        }

        if !self.config.checkpoint().reset_optimizer() {
            self.load_optimizer(run.optimizer, &ckpt)?;
        }

        run.tracker.init_from_checkpoint(&ckpt);

        self.sink.write("Checkpoint loaded");

        if !self.config.checkpoint().reset_counts() {
            self.load_counts(&ckpt, run.progress);
        }

        Ok(())
    }

    /// Resolve a zoo artifact. `None` means the model rebuilt itself and
    /// nothing is left to load.
    fn load_from_zoo(&mut self, run: &mut RunState<'_>, identifier: &str) -> Result<Option<Value>> {
        let artifact = load_pretrained_model(&*self.store, self.zoo.as_deref(), identifier)?;

        if !self.config.checkpoint().zoo_override {
            return Ok(Some(artifact.checkpoint));
        }

        let Some(model) = run.model.as_from_pretrained() else {
            return Err(CheckpointError::Configuration(format!(
                "zoo_override is set but the model cannot be built from pretrained {}",
                identifier
            )));
        };
        model.from_pretrained(identifier)?;

        let model_config = artifact
            .full_config
            .get("model_config")
            .cloned()
            .unwrap_or(Value::Null);
        self.config.set_model_config(model_config);

        tracing::info!(identifier, "Model loaded from pretrained zoo artifact");
        Ok(None)
    }

    fn load_optimizer(&self, optimizer: &mut dyn Optimizer, ckpt: &Value) -> Result<()> {
        match ckpt.get("optimizer") {
            Some(state) => optimizer.load_state_dict(state).map_err(|e| {
                self.sink
                    .write("Optimizer failed to load. Try with checkpoint.reset.optimizer=true");
                CheckpointError::OptimizerLoad(e.to_string())
            }),
            None => {
                tracing::warn!(
                    "'optimizer' key is not present in the checkpoint asked to be loaded. Skipping."
                );
                Ok(())
            }
        }
    }

    /// Restore progress counters.
    ///
    /// Snapshots with `best_update` carry every counter explicitly. Older
    /// ones only have `best_iteration`; for those `num_updates` follows the
    /// restored iteration.
    fn load_counts(&self, ckpt: &Value, progress: &mut Progress) {
        let get = |key: &str| ckpt.get(key).and_then(Value::as_u64);
        let resume_best = self.config.checkpoint().resume_best;

        if ckpt.get("best_update").is_some() {
            if resume_best {
                progress.num_updates = get("best_update").unwrap_or(progress.num_updates);
                progress.current_iteration =
                    get("best_iteration").unwrap_or(progress.current_iteration);
                progress.current_epoch = get("best_epoch")
                    .or_else(|| get("current_epoch"))
                    .unwrap_or(progress.current_epoch);
            } else {
                progress.num_updates = get("num_updates").unwrap_or(progress.num_updates);
                progress.current_iteration =
                    get("current_iteration").unwrap_or(progress.current_iteration);
                progress.current_epoch = get("current_epoch").unwrap_or(progress.current_epoch);
            }
        } else if ckpt.get("best_iteration").is_some() {
            progress.current_iteration = match get("current_iteration") {
                Some(iteration) if resume_best => iteration,
                _ => get("best_iteration").unwrap_or(progress.current_iteration),
            };
            progress.num_updates = progress.current_iteration;
            progress.current_epoch = get("best_epoch").unwrap_or(progress.current_epoch);
        }

        tracing::info!(
            current_iteration = progress.current_iteration,
            num_updates = progress.num_updates,
            current_epoch = progress.current_epoch,
            "Progress counters restored"
        );
    }

    fn load_pretrained(
        &self,
        model: &mut dyn Model,
        pretrained: &StateDict,
        mapping: &[KeyMapping],
    ) -> Result<()> {
        let mut own_state = model.state_dict();
        let report = {
            let model: &dyn Model = &*model;
            transplant(pretrained, &mut own_state, mapping, |k| model.format_state_key(k))
        };

        for (from, to) in &report.copied {
            self.sink.write(&format!("Copying {} {}", from, to));
        }
        for (from, to) in &report.skipped {
            self.sink
                .write(&format!("Skipping {} {}: shape mismatch", from, to));
        }

        model.load_state_dict(&own_state, false)?;
        self.sink.write("Pretrained model loaded");
        Ok(())
    }
}
