mod common;

use std::fs;

use tempfile::tempdir;
use training::{
    checkpoint::{CheckpointId, CheckpointStore, DirectoryCheckpointStore},
    Trainer, TrainingError,
};

use common::{lines_with_prefix, tiny_config, write_dataset};

#[test]
fn main_phase_checkpoints_and_validates_on_schedule() -> anyhow::Result<()> {
    let dir = tempdir()?;
    write_dataset(&dir.path().join("train.safetensors"), 8, 2)?;
    write_dataset(&dir.path().join("val.safetensors"), 8, 2)?;
    let config = tiny_config(dir.path(), 2, 4);

    let mut trainer = Trainer::new(config.clone())?;
    assert_eq!(trainer.resume_or_init()?, 0);
    let report = trainer.run_main_phase()?;

    assert_eq!(report.final_iteration, 4);
    assert_eq!(trainer.iteration(), 4);
    assert_eq!(report.validations.len(), 1);
    assert_eq!(report.validations[0].iteration, 4);
    let saved: Vec<u64> = report
        .checkpoints
        .iter()
        .map(|descriptor| descriptor.manifest.iteration)
        .collect();
    assert_eq!(saved, vec![2, 4]);

    let store = DirectoryCheckpointStore::new(&config.runtime.checkpoint.directory, None);
    assert_eq!(
        store.list()?,
        vec![CheckpointId::untagged(2), CheckpointId::untagged(4)]
    );
    for descriptor in &report.checkpoints {
        assert!(descriptor.directory.join("model.safetensors").is_file());
        assert!(descriptor.directory.join("optimizer.json").is_file());
        assert!(descriptor.directory.join("manifest.json").is_file());
    }

    let log = fs::read_to_string(dir.path().join("train.log"))?;
    let tests = lines_with_prefix(&log, "TEST ");
    assert_eq!(tests.len(), 1);
    assert!(tests[0].starts_with("TEST Iter 4: loss = "));
    let trains = lines_with_prefix(&log, "TRAIN ");
    assert_eq!(trains.len(), 2);
    assert!(trains[0].starts_with("TRAIN Iter 2: lr = 0.037500,"));
    assert!(trains[1].starts_with("TRAIN Iter 4: lr = 0.012500,"));
    Ok(())
}

#[test]
fn full_run_ends_with_stabilized_checkpoint() -> anyhow::Result<()> {
    let dir = tempdir()?;
    write_dataset(&dir.path().join("train.safetensors"), 8, 2)?;
    write_dataset(&dir.path().join("val.safetensors"), 8, 2)?;
    let mut config = tiny_config(dir.path(), 2, 4);
    config.schedule.stabilization_iters = Some(3);

    let mut trainer = Trainer::new(config)?;
    let report = trainer.run()?;

    assert_eq!(report.start_iteration, 0);
    assert_eq!(report.main.final_iteration, 4);
    assert_eq!(report.final_iteration, 7);
    assert_eq!(report.stabilized.id(), CheckpointId::tagged(4, "bnps"));
    assert!(report
        .stabilized
        .directory
        .ends_with("bnps-checkpoint-00000004"));
    assert_eq!(report.final_validation.iteration, 7);
    assert!(trainer
        .model()
        .norm_momenta()
        .iter()
        .all(|&momentum| momentum == 0.1));

    let log = fs::read_to_string(dir.path().join("train.log"))?;
    assert_eq!(lines_with_prefix(&log, "TEST ").len(), 2);
    // Stabilization keeps logging on the global counter; lr is zero past the budget.
    assert!(lines_with_prefix(&log, "TRAIN Iter 6: lr = 0.000000,").len() == 1);

    let summary = Trainer::new(tiny_config(dir.path(), 2, 4))?
        .evaluate_checkpoint(&report.stabilized.directory)?;
    assert_eq!(summary.iteration, 4);
    assert!((0.0..=1.0).contains(&summary.top1_err));
    assert!((0.0..=1.0).contains(&summary.top5_err));
    assert_eq!(summary.top5_err, 0.0);
    Ok(())
}

#[test]
fn startup_rejects_missing_data_and_unknown_models() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = tiny_config(dir.path(), 2, 4);
    assert!(matches!(
        Trainer::new(config.clone()),
        Err(TrainingError::Configuration(_))
    ));

    write_dataset(&dir.path().join("train.safetensors"), 8, 2)?;
    write_dataset(&dir.path().join("val.safetensors"), 8, 2)?;
    let mut config = config;
    config.model.name = "lite9".to_string();
    assert!(matches!(
        Trainer::new(config),
        Err(TrainingError::Configuration(_))
    ));
    Ok(())
}
