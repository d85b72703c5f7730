// --- File: src/metrics/mod.rs ---

//! Metrics reported by the episodic train and test loops.
//!
//! - **Classification**: top-k accuracy in percent
//! - **Running statistics**: weighted averages, Welford mean/std and the 95%
//!   confidence interval used to report few-shot accuracy
//!
//! # Example
//!
//! ```rust,ignore
//! use rusty_fewshot::metrics::{accuracy, mean_confidence_interval};
//!
//! let acc = accuracy(&logits, &query_targets, &[1, 3])?;
//! let (mean, h) = mean_confidence_interval(&episode_accs);
//! println!("{:.3} +- {:.3}", mean, h);
//! ```

pub mod classification;
pub mod running;

pub use classification::{accuracy, predictions, top1};
pub use running::{mean_confidence_interval, AverageMeter, RunningStd};
