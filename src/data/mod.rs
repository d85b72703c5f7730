// --- File: src/data/mod.rs ---

//! # Data
//!
//! In-memory datasets of flattened samples and the samplers that turn them
//! into episodic or plain batches.
//!
//! ## Sources
//!
//! - **Synthetic**: Gaussian clusters with class-disjoint train / val / test
//!   splits ([`SyntheticConfig`])
//! - **SafeTensors**: pre-extracted features stored as `{split}.features`
//!   (`[n, dim]`) and `{split}.labels` (`[n]`)
//!
//! ## Example
//!
//! ```ignore
//! use rusty_fewshot::data::{load_splits, DataConfig, EpisodeSampler};
//!
//! let splits = load_splits(&DataConfig::default(), 0)?;
//! let mut sampler = EpisodeSampler::new(splits.train.labels(), layout, 1, 100, 0)?;
//! for indices in sampler.by_ref() {
//!     let batch = splits.train.batch(&indices)?;
//! }
//! ```

pub mod dataset;
pub mod sampler;
pub mod synthetic;

pub use dataset::{Batch, Dataset, InMemoryDataset};
pub use sampler::{BatchSampler, EpisodeSampler, RandomSampler, Sampler};
pub use synthetic::SyntheticConfig;

use crate::error::{FewShotError, Result};
use crate::serialization::{load_safetensors, take_tensor};
use ndarray::{Ix1, Ix2};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// `data: {name, kwargs}` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "kwargs")]
pub enum DataConfig {
    #[serde(alias = "synthetic")]
    Synthetic(SyntheticConfig),
    #[serde(alias = "safetensors")]
    SafeTensors { path: PathBuf },
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig::Synthetic(SyntheticConfig::default())
    }
}

impl DataConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            DataConfig::Synthetic(config) => config.validate(),
            DataConfig::SafeTensors { path } if path.as_os_str().is_empty() => {
                Err("safetensors path is empty".into())
            }
            DataConfig::SafeTensors { .. } => Ok(()),
        }
    }
}

/// Train, validation and test datasets.
#[derive(Debug, Clone)]
pub struct Splits {
    pub train: InMemoryDataset,
    pub val: InMemoryDataset,
    pub test: InMemoryDataset,
}

impl Splits {
    /// Flattened sample dimension, shared by every split.
    pub fn sample_dim(&self) -> usize {
        self.train.sample_dim()
    }
}

/// Builds the three splits described by `config`.
pub fn load_splits(config: &DataConfig, seed: u64) -> Result<Splits> {
    let splits = match config {
        DataConfig::Synthetic(synthetic) => synthetic.generate(seed)?,
        DataConfig::SafeTensors { path } => load_feature_file(path)?,
    };
    for (name, split) in [("train", &splits.train), ("val", &splits.val), ("test", &splits.test)] {
        if split.sample_dim() != splits.sample_dim() {
            return Err(FewShotError::shape(
                name,
                &[split.len(), splits.sample_dim()],
                &[split.len(), split.sample_dim()],
            ));
        }
        info!(
            split = name,
            samples = split.len(),
            classes = split.num_classes(),
            dim = split.sample_dim(),
            "Loaded split"
        );
    }
    Ok(splits)
}

fn load_feature_file(path: &Path) -> Result<Splits> {
    let mut tensors = load_safetensors(path).map_err(crate::serialization::SerializationError::from)?;
    let mut take_split = |split: &str| -> Result<Option<InMemoryDataset>> {
        let features_key = format!("{}.features", split);
        if !tensors.contains_key(&features_key) {
            return Ok(None);
        }
        let features = take_tensor(&mut tensors, &features_key)
            .map_err(crate::serialization::SerializationError::from)?
            .into_dimensionality::<Ix2>()
            .map_err(|_| FewShotError::InvalidEpisode(format!("{} must be 2-D", features_key)))?;
        let labels_key = format!("{}.labels", split);
        let raw = take_tensor(&mut tensors, &labels_key)
            .map_err(crate::serialization::SerializationError::from)?
            .into_dimensionality::<Ix1>()
            .map_err(|_| FewShotError::InvalidEpisode(format!("{} must be 1-D", labels_key)))?;
        let labels = raw
            .iter()
            .map(|&l| {
                if l >= 0.0 && l.fract() == 0.0 {
                    Ok(l as usize)
                } else {
                    Err(FewShotError::InvalidEpisode(format!(
                        "{} holds a non-integer label {}",
                        labels_key, l
                    )))
                }
            })
            .collect::<Result<Vec<usize>>>()?;
        InMemoryDataset::new(features, labels).map(Some)
    };

    let train = take_split("train")?
        .ok_or_else(|| FewShotError::NotEnoughData(format!("{} has no train split", path.display())))?;
    let test = take_split("test")?
        .ok_or_else(|| FewShotError::NotEnoughData(format!("{} has no test split", path.display())))?;
    let val = match take_split("val")? {
        Some(val) => val,
        None => {
            warn!("No val split in {}, validating on the test split", path.display());
            test.clone()
        }
    };
    Ok(Splits { train, val, test })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::ParamStore;
    use crate::serialization::save_safetensors;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_load_feature_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.safetensors");

        let mut store = ParamStore::new();
        store.insert("train.features".into(), arr2(&[[0.0, 1.0], [1.0, 0.0]]).into_dyn());
        store.insert("train.labels".into(), arr1(&[0.0, 1.0]).into_dyn());
        store.insert("test.features".into(), arr2(&[[2.0, 2.0]]).into_dyn());
        store.insert("test.labels".into(), arr1(&[5.0]).into_dyn());
        save_safetensors(&path, &store).unwrap();

        let splits = load_splits(&DataConfig::SafeTensors { path }, 0).unwrap();
        assert_eq!(splits.train.labels(), &[0, 1]);
        assert_eq!(splits.val.labels(), &[5]);
        assert_eq!(splits.sample_dim(), 2);
    }

    #[test]
    fn test_non_integer_labels_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.safetensors");

        let mut store = ParamStore::new();
        store.insert("train.features".into(), arr2(&[[0.0]]).into_dyn());
        store.insert("train.labels".into(), arr1(&[0.5]).into_dyn());
        save_safetensors(&path, &store).unwrap();

        assert!(load_splits(&DataConfig::SafeTensors { path }, 0).is_err());
    }

    #[test]
    fn test_data_config_yaml() {
        let config: DataConfig =
            serde_yaml::from_str("name: Synthetic\nkwargs:\n  dim: 8\n  train_classes: 10\n").unwrap();
        match &config {
            DataConfig::Synthetic(s) => {
                assert_eq!(s.dim, 8);
                assert_eq!(s.val_classes, 16);
            }
            other => panic!("unexpected config {:?}", other),
        }
        assert!(config.validate().is_ok());
    }
}
