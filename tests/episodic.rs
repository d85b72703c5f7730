//! End-to-end runs: train every method on a small synthetic benchmark, then
//! reload the best checkpoint and test it on unseen classes.

use rusty_fewshot::config::{ClassifierKind, Config};
use rusty_fewshot::data::{DataConfig, SyntheticConfig};
use rusty_fewshot::optimizers::OptimizerConfig;
use rusty_fewshot::runner::{Test, Trainer, BEST_CHECKPOINT, CONFIG_FILE, LAST_CHECKPOINT};
use rusty_fewshot::serialization::Checkpoint;
use std::path::Path;

/// 5-way 1-shot over well separated Gaussian classes.
fn small_config(kind: ClassifierKind, root: &Path) -> Config {
    let mut config = Config::new(kind);
    config.way_num = 5;
    config.shot_num = 1;
    config.query_num = 4;
    config.episode_size = 2;
    config.train_episode = 15;
    config.test_episode = 10;
    config.epoch = 2;
    config.test_epoch = 2;
    config.batch_size = 16;
    config.seed = 42;
    config.result_root = root.to_path_buf();
    config.optimizer = OptimizerConfig::adam(0.01);
    config.data = DataConfig::Synthetic(SyntheticConfig {
        train_classes: 8,
        val_classes: 6,
        test_classes: 6,
        samples_per_class: 12,
        dim: 16,
        separation: 8.0,
        noise: 0.5,
    });

    let kwargs = &mut config.classifier.kwargs;
    kwargs.inner_optim = OptimizerConfig::sgd(0.1);
    match kind {
        ClassifierKind::Anil => kwargs.hid_dim = 16,
        ClassifierKind::R2d2 => kwargs.gamma = 1.0,
        ClassifierKind::Baseline | ClassifierKind::BaselinePlus => kwargs.num_classes = Some(8),
    }
    config
}

fn train_and_test(kind: ClassifierKind) {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(kind, dir.path());

    let mut trainer = Trainer::new(config.clone()).unwrap();
    let result_dir = trainer.result_dir().to_path_buf();
    let report = trainer.train_loop().unwrap();

    assert_eq!(report.history.len(), 2);
    assert!(report.best_epoch < 2);
    assert!(report.history.iter().all(|e| e.train_loss.is_finite()));
    assert!(result_dir.join(CONFIG_FILE).exists());

    let last = Checkpoint::load(result_dir.join(LAST_CHECKPOINT)).unwrap();
    assert_eq!(last.meta.epoch, 1);
    assert!(last.optimizer_state.is_some());
    let best = Checkpoint::load(result_dir.join(BEST_CHECKPOINT)).unwrap();
    assert_eq!(best.meta.epoch, report.best_epoch);
    assert_eq!(best.meta.model_name, config.model_name());

    // Reload the saved config the way the `test` command does.
    let saved = Config::load(result_dir.join(CONFIG_FILE), &[]).unwrap();
    assert_eq!(saved.model_name(), config.model_name());
    let mut test = Test::new(saved, &result_dir).unwrap();
    let result = test.test_loop().unwrap();

    assert_eq!(result.epoch_results.len(), 2);
    assert!(result.mean_h >= 0.0);
    // Chance level is 20%.
    assert!(
        result.mean_acc > 40.0,
        "{} reached only {:.2}%",
        kind.name(),
        result.mean_acc
    );
}

#[test]
fn test_anil_end_to_end() {
    train_and_test(ClassifierKind::Anil);
}

#[test]
fn test_r2d2_end_to_end() {
    train_and_test(ClassifierKind::R2d2);
}

#[test]
fn test_baseline_end_to_end() {
    train_and_test(ClassifierKind::Baseline);
}

#[test]
fn test_baseline_plus_end_to_end() {
    train_and_test(ClassifierKind::BaselinePlus);
}

#[test]
fn test_checkpoint_of_another_model_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(ClassifierKind::R2d2, dir.path());
    let mut trainer = Trainer::new(config.clone()).unwrap();
    trainer.train_loop().unwrap();
    let result_dir = trainer.result_dir().to_path_buf();

    let other = small_config(ClassifierKind::Anil, dir.path());
    assert!(Test::new(other, &result_dir).is_err());
}

#[test]
fn test_too_few_pretrain_classes_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = small_config(ClassifierKind::Baseline, dir.path());
    config.classifier.kwargs.num_classes = Some(4);
    assert!(Trainer::new(config).is_err());
}

#[test]
fn test_shot_and_query_can_change_at_test_time() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(ClassifierKind::R2d2, dir.path());
    let mut trainer = Trainer::new(config.clone()).unwrap();
    trainer.train_loop().unwrap();

    let mut five_shot = config;
    five_shot.test_shot = Some(5);
    five_shot.test_query = Some(3);
    let mut test = Test::new(five_shot, trainer.result_dir()).unwrap();
    let report = test.test_loop().unwrap();
    assert!(report.mean_acc > 40.0);
}
