//! # RustyFewShot: Episodic Few-Shot Learning in Rust
//!
//! **RustyFewShot** trains and evaluates few-shot classifiers that share one
//! episodic protocol: every batch holds `episode_size` episodes of
//! `way_num` classes, each with `shot_num` support and `query_num` query
//! samples, and every model predicts the query labels from the support set.
//!
//! Four methods are provided:
//!
//! - **ANIL**: fine-tunes only the classifier head per episode
//! - **R2D2**: closed-form ridge regression on the support features
//! - **Baseline** / **Baseline++**: pretrain on all training classes, then fit
//!   a fresh linear / cosine head per test episode
//!
//! ## Usage Example
//!
//! ```no_run
//! use rusty_fewshot::config::{ClassifierKind, Config};
//! use rusty_fewshot::runner::{Test, Trainer};
//!
//! # fn main() -> Result<(), rusty_fewshot::error::FewShotError> {
//! // 1. Describe the experiment
//! let mut config = Config::new(ClassifierKind::R2d2);
//! config.epoch = 2;
//!
//! // 2. Train, keeping the best checkpoint by validation accuracy
//! let mut trainer = Trainer::new(config.clone())?;
//! trainer.train_loop()?;
//!
//! // 3. Evaluate the best checkpoint on unseen classes
//! let mut test = Test::new(config, trainer.result_dir())?;
//! let report = test.test_loop()?;
//! println!("{:.2} +- {:.2}", report.mean_acc, report.mean_h);
//! # Ok(())
//! # }
//! ```

pub mod backbone;
pub mod config;
pub mod data;
pub mod episode;
pub mod error;
pub mod linalg;
pub mod logging;
pub mod losses;
pub mod metrics;
pub mod model;
pub mod nn;
pub mod optimizers;
pub mod runner;
pub mod serialization;

pub use config::{ClassifierKind, Config};
pub use episode::{EpisodeLayout, SplitMode};
pub use error::{FewShotError, Result};
pub use model::{build_model, FewShotModel, ModelKind};
pub use runner::{Test, TestReport, TrainReport, Trainer};
