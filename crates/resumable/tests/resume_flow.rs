mod common;

use std::thread;

use common::{mlp, run_config, Trainer};
use resumable::checkpoint::PARALLEL_PREFIX;
use resumable::codec;
use resumable::prelude::*;
use tempfile::tempdir;

#[test]
fn test_save_then_restore_on_fresh_manager() {
    let dir = tempdir().unwrap();
    let config = run_config(dir.path(), CheckpointConfig::default());

    let mut trainer = Trainer::new(0.0);
    trainer.train(100);
    trainer.tracker.observe(0.83, &trainer.progress);
    let manager = CheckpointManager::builder(config.clone())
        .build(&trainer.model)
        .unwrap();
    manager.save(&trainer.run(), 100, true).unwrap();

    let paths = manager.paths();
    assert!(paths.current().exists());
    assert!(paths.best().exists());
    assert!(paths.archival(100).exists());
    assert!(paths.config().exists());

    let mut restored = Trainer::new(0.0);
    let mut manager = CheckpointManager::builder(config)
        .build(&restored.model)
        .unwrap();
    assert!(manager.restore(&mut restored.run()).unwrap());

    assert_eq!(restored.model, trainer.model);
    assert_eq!(restored.progress.current_iteration, 100);
    assert_eq!(restored.tracker.best_monitored_value(), Some(0.83));
    assert_eq!(restored.optimizer, trainer.optimizer);
}

#[test]
fn test_interrupted_run_resumes_from_current() {
    let dir = tempdir().unwrap();
    let config = run_config(dir.path(), CheckpointConfig::default().resume(false));

    let mut trainer = Trainer::new(0.0);
    let manager = CheckpointManager::builder(config.clone())
        .build(&trainer.model)
        .unwrap();
    trainer.train(10);
    trainer.tracker.observe(0.9, &trainer.progress);
    manager.save(&trainer.run(), 10, true).unwrap();
    trainer.train(10);
    trainer.tracker.observe(0.5, &trainer.progress);
    manager.save(&trainer.run(), 20, false).unwrap();

    let mut resumed = Trainer::new(0.0);
    let mut manager = CheckpointManager::builder(config).build(&resumed.model).unwrap();
    let plan = manager.load_state_dict(&mut resumed.run()).unwrap();

    assert_eq!(
        manager.resumed_from(),
        &[ResumeSource::LocalCurrent(manager.paths().current())]
    );
    assert!(plan.warnings.is_empty());
    assert_eq!(manager.phase(), RunPhase::Active);
    assert_eq!(resumed.model, trainer.model);
    assert_eq!(resumed.progress.num_updates, 20);
    assert_eq!(resumed.tracker.best_monitored_update(), 10);
}

#[test]
fn test_resume_best_counts() {
    let dir = tempdir().unwrap();

    let mut trainer = Trainer::new(0.0);
    let manager = CheckpointManager::builder(run_config(dir.path(), CheckpointConfig::default()))
        .build(&trainer.model)
        .unwrap();
    trainer.train(30);
    trainer.tracker.observe(0.9, &trainer.progress);
    manager.save(&trainer.run(), 30, true).unwrap();
    trainer.train(30);
    manager.save(&trainer.run(), 60, false).unwrap();

    let mut resumed = Trainer::new(0.0);
    let mut manager =
        CheckpointManager::builder(run_config(dir.path(), CheckpointConfig::default().resume(true)))
            .build(&resumed.model)
            .unwrap();
    manager.load_state_dict(&mut resumed.run()).unwrap();

    assert_eq!(resumed.progress.num_updates, 30);
    assert_eq!(resumed.progress.current_iteration, 30);
    assert_eq!(resumed.model, {
        let mut at_best = Trainer::new(0.0);
        at_best.train(30);
        at_best.model
    });
}

#[test]
fn test_fresh_directory_starts_fresh() {
    let dir = tempdir().unwrap();
    let mut trainer = Trainer::new(1.0);
    let mut manager = CheckpointManager::builder(run_config(
        dir.path(),
        CheckpointConfig::default().resume(false),
    ))
    .build(&trainer.model)
    .unwrap();

    let plan = manager.load_state_dict(&mut trainer.run()).unwrap();

    assert!(plan.is_fresh());
    assert_eq!(plan.warnings.len(), 1);
    assert!(manager.resumed_from().is_empty());
    assert_eq!(trainer.model, mlp(1.0));
}

#[test]
fn test_parallel_snapshot_loads_into_single_device_model() {
    let dir = tempdir().unwrap();
    let config = run_config(dir.path(), CheckpointConfig::default().resume(false));

    let mut parallel = Trainer::new(0.0);
    parallel.train(5);
    parallel.model.params = upgrade(parallel.model.params.clone(), true);
    CheckpointManager::builder(config.clone())
        .execution_mode(ExecutionMode::distributed())
        .build(&parallel.model)
        .unwrap()
        .save(&parallel.run(), 5, false)
        .unwrap();

    let mut single = Trainer::new(0.0);
    let mut manager = CheckpointManager::builder(config).build(&single.model).unwrap();
    manager.load_state_dict(&mut single.run()).unwrap();

    assert_eq!(single.model.params, upgrade(parallel.model.params, false));
}

#[test]
fn test_single_snapshot_loads_into_parallel_model() {
    let dir = tempdir().unwrap();
    let config = run_config(dir.path(), CheckpointConfig::default().resume(false));

    let mut single = Trainer::new(0.0);
    single.train(5);
    CheckpointManager::builder(config.clone())
        .build(&single.model)
        .unwrap()
        .save(&single.run(), 5, false)
        .unwrap();

    let mut parallel = Trainer::new(0.0);
    parallel.model.params = upgrade(parallel.model.params.clone(), true);
    let mut manager = CheckpointManager::builder(config)
        .execution_mode(ExecutionMode::data_parallel())
        .build(&parallel.model)
        .unwrap();
    manager.load_state_dict(&mut parallel.run()).unwrap();

    assert!(parallel
        .model
        .params
        .keys()
        .all(|k| k.starts_with(PARALLEL_PREFIX)));
    assert_eq!(parallel.model.params, upgrade(single.model.params, true));
}

#[test]
fn test_only_primary_writes() {
    let store = Arc::new(MemoryStore::new());
    let group = ThreadGroup::new(2);
    let mut trainer = Trainer::new(0.0);

    let manager = CheckpointManager::builder(run_config(
        std::path::Path::new("/save"),
        CheckpointConfig::default(),
    ))
    .store(Arc::clone(&store) as Arc<dyn ArtifactStore>)
    .backend(Arc::new(group[1].clone()))
    .build(&trainer.model)
    .unwrap();
    manager.save(&trainer.run(), 1, true).unwrap();

    assert_eq!(store.write_count(), 0);
}

#[test]
fn test_ranks_restore_after_primary_saves() {
    let dir = tempdir().unwrap();
    let config = run_config(dir.path(), CheckpointConfig::default());

    let handles: Vec<_> = ThreadGroup::new(3)
        .into_iter()
        .map(|backend| {
            let config = config.clone();
            thread::spawn(move || {
                let primary = backend.is_primary();
                let mut trainer = Trainer::new(0.0);
                trainer.train(3);
                trainer.tracker.observe(1.0, &trainer.progress);

                let mut manager = CheckpointManager::builder(config)
                    .backend(Arc::new(backend))
                    .build(&trainer.model)
                    .unwrap();
                if primary {
                    manager.save(&trainer.run(), 3, true).unwrap();
                }

                let mut restored = Trainer::new(0.0);
                let loaded = manager.restore(&mut restored.run()).unwrap();
                (loaded, restored.model == trainer.model)
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), (true, true));
    }
}

#[test]
fn test_final_artifact_is_parameters_only() {
    let dir = tempdir().unwrap();
    let mut trainer = Trainer::new(0.0);
    trainer.train(2);
    let mut manager = CheckpointManager::builder(run_config(dir.path(), CheckpointConfig::default()))
        .build(&trainer.model)
        .unwrap();

    manager.finalize(&trainer.model).unwrap();

    let final_path = dir.path().join("mlp_final.pth");
    assert_eq!(manager.paths().final_model(), final_path);
    let value = codec::read_value(&LocalStore, &final_path).unwrap();
    assert!(value.get("encoder.weight").is_some());
    assert!(value.get("model").is_none());

    // A final artifact can seed a new run as a resume file
    let mut seeded = Trainer::new(0.0);
    let other = tempdir().unwrap();
    let mut manager = CheckpointManager::builder(run_config(
        other.path(),
        CheckpointConfig::default().with_resume_file(&final_path),
    ))
    .build(&seeded.model)
    .unwrap();
    manager.load_state_dict(&mut seeded.run()).unwrap();
    assert_eq!(seeded.model, trainer.model);
    assert_eq!(seeded.progress, Progress::default());
}

#[test]
fn test_zoo_artifact_transplant() {
    let zoo = tempdir().unwrap();
    let artifact = zoo.path().join("mlp.pretrained");
    std::fs::create_dir_all(&artifact).unwrap();
    std::fs::write(artifact.join("config.yaml"), "model_config:\n  mlp:\n    hidden: 4\n").unwrap();

    let mut pretrained = StateDict::new();
    pretrained.insert(
        "backbone.weight".into(),
        ndarray::ArrayD::from_elem(ndarray::IxDyn(&[4, 2]), 7.0),
    );
    pretrained.insert(
        "backbone.bias".into(),
        ndarray::ArrayD::from_elem(ndarray::IxDyn(&[3]), 7.0),
    );
    std::fs::write(
        artifact.join("model.pth"),
        codec::encode_state_dict(&pretrained).unwrap(),
    )
    .unwrap();

    let dir = tempdir().unwrap();
    let mut trainer = Trainer::new(0.0);
    let sink = Arc::new(MemorySink::new());
    let mut manager = CheckpointManager::builder(run_config(
        dir.path(),
        CheckpointConfig::default()
            .with_resume_zoo("mlp.pretrained")
            .with_pretrained_mapping(vec![KeyMapping::new("backbone", "encoder")]),
    ))
    .zoo(DirectoryZoo::new(zoo.path()))
    .sink(Arc::clone(&sink))
    .build(&trainer.model)
    .unwrap();

    manager.load_state_dict(&mut trainer.run()).unwrap();

    assert!(trainer.model.params["encoder.weight"].iter().all(|&v| v == 7.0));
    // Shape mismatch: left as initialised
    assert!(trainer.model.params["encoder.bias"].iter().all(|&v| v == 0.0));
    assert!(trainer.model.params["classifier.weight"].iter().all(|&v| v == 0.0));
    assert!(sink.contains("Copying backbone.weight encoder.weight"));
    assert!(sink.contains("Pretrained model loaded"));
}

#[test]
fn test_operations_after_finalize_fail() {
    let dir = tempdir().unwrap();
    let mut trainer = Trainer::new(0.0);
    let mut manager = CheckpointManager::builder(run_config(dir.path(), CheckpointConfig::default()))
        .build(&trainer.model)
        .unwrap();
    manager.finalize(&trainer.model).unwrap();

    assert!(manager.restore(&mut trainer.run()).is_err());
    assert!(manager.load_state_dict(&mut trainer.run()).is_err());
    assert!(manager.finalize(&trainer.model).is_err());
}

#[test]
fn test_diverged_parameters_restore() {
    let dir = tempdir().unwrap();
    let config = run_config(dir.path(), CheckpointConfig::default());

    let mut trainer = Trainer::new(0.0);
    trainer.train(1);
    if let Some(bias) = trainer.model.params.get_mut("encoder.bias") {
        bias.mapv_inplace(|_| f32::INFINITY);
    }
    let manager = CheckpointManager::builder(config.clone())
        .build(&trainer.model)
        .unwrap();
    manager.save(&trainer.run(), 1, true).unwrap();

    let mut restored = Trainer::new(0.0);
    let mut manager = CheckpointManager::builder(config)
        .build(&restored.model)
        .unwrap();
    assert!(manager.restore(&mut restored.run()).unwrap());

    assert!(restored.model.params["encoder.bias"]
        .iter()
        .all(|&v| v == f32::INFINITY));
    assert_eq!(restored.model, trainer.model);
}
