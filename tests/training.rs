use anyhow::Result;
use policyforge::data::synthetic::{write_dataset, SyntheticConfig};
use policyforge::data::InterleavedDataset;
use policyforge::model::checkpoint::load_checkpoint;
use policyforge::model::{ContinuousHeadConfig, HeadConfig, Parameterized, PolicyModel};
use policyforge::train::trainer::FINAL_CHECKPOINT;
use policyforge::train::{LearningRateSchedule, TrainConfig, Trainer};
use std::path::{Path, PathBuf};

fn shipped_config(data_dir: &Path) -> Result<TrainConfig> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("configs/synthetic.toml");
    let mut config = TrainConfig::from_file(path)?;
    config.data.data_dir = data_dir.to_path_buf();
    config.save_dir = None;
    config.eval_batches = 2;
    config.optimizer.learning_rate = LearningRateSchedule::Constant { value: 3e-3 };
    Ok(config)
}

fn synthesize(dir: &Path) -> Result<()> {
    let config = SyntheticConfig {
        min_len: 6,
        max_len: 10,
        ..SyntheticConfig::default()
    };
    let mut rng = fastrand::Rng::with_seed(11);
    write_dataset(dir, "synthetic", 24, 4, &config, &mut rng)?;
    Ok(())
}

#[test]
fn training_on_synthetic_data_reduces_validation_loss() -> Result<()> {
    let data = tempfile::tempdir()?;
    synthesize(data.path())?;
    let mut config = shipped_config(data.path())?;
    config.num_steps = 40;
    config.eval_interval = 40;

    let mut trainer = Trainer::new(config)?;
    let before = trainer.evaluate()?.expect("validation split is present");
    let summary = trainer.run()?;
    let after = summary.final_val.expect("evaluated at the last step");

    assert_eq!(summary.steps, 40);
    assert!(
        after.loss < before.loss,
        "validation loss did not improve: {} -> {}",
        before.loss,
        after.loss
    );
    assert!(summary.final_train.loss < summary.first_train_loss);
    Ok(())
}

#[test]
fn final_checkpoint_reproduces_predictions() -> Result<()> {
    let data = tempfile::tempdir()?;
    let runs = tempfile::tempdir()?;
    synthesize(data.path())?;
    let mut config = shipped_config(data.path())?;
    config.num_steps = 3;
    config.eval_interval = 0;
    config.save_interval = 0;
    config.save_dir = Some(runs.path().to_path_buf());

    let mut trainer = Trainer::new(config.clone())?;
    let summary = trainer.run()?;
    let checkpoint = summary.checkpoint.expect("final checkpoint written");
    assert_eq!(checkpoint, runs.path().join(FINAL_CHECKPOINT));

    let (restored, meta) = load_checkpoint(&checkpoint, &mut fastrand::Rng::with_seed(7))?;
    assert_eq!(meta.step, 3);

    let val = InterleavedDataset::from_config(&config.data, &config.data.val_split)?;
    let batch = val.sample_batch(4, &mut fastrand::Rng::with_seed(3))?;
    let inputs = batch.policy_inputs();
    let mut rng = fastrand::Rng::with_seed(0);
    let expected = trainer.model.predict_actions(&inputs, &mut rng)?;
    let actual = restored.predict_actions(&inputs, &mut rng)?;
    assert_eq!(expected.keys().collect::<Vec<_>>(), vec!["action"]);
    for (name, actions) in &expected {
        assert_eq!(actions.dim(), (4, 2, 2, 7));
        let diff = (actions - &actual[name]).mapv(f32::abs).fold(0.0f32, |m, &v| m.max(v));
        assert!(diff < 1e-6, "head {name} differs by {diff}");
    }
    Ok(())
}

#[test]
fn finetuning_swaps_the_head_and_freezes_the_backbone() -> Result<()> {
    let data = tempfile::tempdir()?;
    let runs = tempfile::tempdir()?;
    synthesize(data.path())?;
    let mut config = shipped_config(data.path())?;
    config.num_steps = 2;
    config.eval_interval = 0;
    config.save_dir = Some(runs.path().to_path_buf());
    Trainer::new(config.clone())?.run()?;

    config.save_dir = None;
    config.pretrained = Some(runs.path().join(FINAL_CHECKPOINT));
    config.frozen_keys = vec!["transformer.*".to_string()];
    config.model.heads.insert(
        "action".to_string(),
        HeadConfig::Continuous(ContinuousHeadConfig {
            readout_key: "action".to_string(),
            pred_horizon: 2,
            action_dim: 7,
        }),
    );
    let mut finetune = Trainer::new(config)?;
    let (mut base, _) = load_checkpoint(runs.path().join(FINAL_CHECKPOINT), &mut fastrand::Rng::with_seed(0))?;

    let transformer_values = |model: &mut PolicyModel| {
        let mut values = Vec::new();
        model.visit_params("", &mut |name, param| {
            if name.starts_with("transformer.") {
                values.extend(param.value.iter().copied());
            }
        });
        values
    };
    let pretrained = transformer_values(&mut base);
    assert_eq!(transformer_values(&mut finetune.model), pretrained);

    let (metrics, _) = finetune.train_step()?;
    assert!(metrics.loss.is_finite());
    assert_eq!(transformer_values(&mut finetune.model), pretrained);
    Ok(())
}
