// --- File: src/serialization/checkpoint.rs ---

//! Checkpoint directories written by the trainer and read by the tester.
//!
//! ```text
//! model_best/
//! ├── meta.json          # epoch, accuracy, model description
//! ├── model.safetensors  # every entry of the model's ParamStore
//! └── optimizer.json     # outer optimizer state (optional)
//! ```

use super::safetensors_io::{load_safetensors, save_safetensors, SafeTensorsError};
use crate::nn::ParamStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const META_FILE: &str = "meta.json";
const WEIGHTS_FILE: &str = "model.safetensors";
const OPTIMIZER_FILE: &str = "optimizer.json";

/// Errors raised while saving or loading checkpoints.
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    SafeTensors(#[from] SafeTensorsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Checkpoint directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Checkpoint was written for '{found}', expected '{expected}'")]
    ModelMismatch { expected: String, found: String },
}

type Result<T> = std::result::Result<T, SerializationError>;

/// Metadata stored next to the weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub version: String,
    /// `{classifier}-{backbone}` of the model that produced the weights.
    pub model_name: String,
    pub epoch: usize,
    pub learning_rate: f32,
    /// Validation accuracy (percent) at this epoch.
    pub val_acc: Option<f64>,
    /// Best validation accuracy (percent) seen so far.
    pub best_val_acc: Option<f64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Default for CheckpointMeta {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            model_name: String::new(),
            epoch: 0,
            learning_rate: 0.0,
            val_acc: None,
            best_val_acc: None,
            metadata: HashMap::new(),
        }
    }
}

impl CheckpointMeta {
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_epoch(mut self, epoch: usize) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn with_learning_rate(mut self, lr: f32) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_val_acc(mut self, acc: f64) -> Self {
        self.val_acc = Some(acc);
        self
    }

    pub fn with_best_val_acc(mut self, acc: f64) -> Self {
        self.best_val_acc = Some(acc);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Exported optimizer state: hyper-parameters plus flattened buffers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OptimizerState {
    pub optimizer_type: String,
    pub params: HashMap<String, f64>,
    pub state: HashMap<String, Vec<f64>>,
}

impl OptimizerState {
    pub fn new(optimizer_type: &str) -> Self {
        Self {
            optimizer_type: optimizer_type.to_string(),
            ..Default::default()
        }
    }
}

/// A full snapshot of a model.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub meta: CheckpointMeta,
    pub weights: ParamStore,
    pub optimizer_state: Option<OptimizerState>,
}

impl Checkpoint {
    pub fn new(weights: ParamStore, meta: CheckpointMeta) -> Self {
        Self {
            meta,
            weights,
            optimizer_state: None,
        }
    }

    pub fn with_optimizer_state(mut self, state: OptimizerState) -> Self {
        self.optimizer_state = Some(state);
        self
    }

    /// Writes the checkpoint into `dir`, creating it if needed.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        fs::write(dir.join(META_FILE), serde_json::to_string_pretty(&self.meta)?)?;
        save_safetensors(dir.join(WEIGHTS_FILE), &self.weights)?;

        let opt_path = dir.join(OPTIMIZER_FILE);
        match &self.optimizer_state {
            Some(state) => fs::write(opt_path, serde_json::to_string_pretty(state)?)?,
            // A stale optimizer file from an earlier save must not survive.
            None if opt_path.exists() => fs::remove_file(opt_path)?,
            None => {}
        }
        Ok(())
    }

    /// Reads a checkpoint directory written by [`Checkpoint::save`].
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(SerializationError::DirectoryNotFound(dir.to_path_buf()));
        }

        let meta_path = dir.join(META_FILE);
        if !meta_path.exists() {
            return Err(SerializationError::FileNotFound(meta_path));
        }
        let meta: CheckpointMeta = serde_json::from_str(&fs::read_to_string(&meta_path)?)?;

        let weights_path = dir.join(WEIGHTS_FILE);
        if !weights_path.exists() {
            return Err(SerializationError::FileNotFound(weights_path));
        }
        let weights = load_safetensors(&weights_path)?;

        let opt_path = dir.join(OPTIMIZER_FILE);
        let optimizer_state = if opt_path.exists() {
            Some(serde_json::from_str(&fs::read_to_string(&opt_path)?)?)
        } else {
            None
        };

        Ok(Self {
            meta,
            weights,
            optimizer_state,
        })
    }

    /// Like [`Checkpoint::load`], but refuses weights of another model.
    pub fn load_for<P: AsRef<Path>>(dir: P, model_name: &str) -> Result<Self> {
        let checkpoint = Self::load(dir)?;
        if checkpoint.meta.model_name != model_name {
            return Err(SerializationError::ModelMismatch {
                expected: model_name.to_string(),
                found: checkpoint.meta.model_name,
            });
        }
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    fn sample_weights() -> ParamStore {
        let mut weights = ParamStore::new();
        weights.insert("classifier.weights".into(), arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn());
        weights.insert("classifier.bias".into(), arr1(&[0.5, -0.5]).into_dyn());
        weights
    }

    #[test]
    fn test_checkpoint_meta_builder() {
        let meta = CheckpointMeta::new("R2D2-Identity")
            .with_epoch(10)
            .with_learning_rate(0.001)
            .with_val_acc(61.5)
            .with_best_val_acc(63.0)
            .with_metadata("way_num", "5");

        assert_eq!(meta.model_name, "R2D2-Identity");
        assert_eq!(meta.epoch, 10);
        assert_abs_diff_eq!(meta.learning_rate, 0.001, epsilon = 1e-9);
        assert_eq!(meta.best_val_acc, Some(63.0));
        assert_eq!(meta.metadata.get("way_num"), Some(&"5".to_string()));
    }

    #[test]
    fn test_save_load_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_best");

        let mut opt = OptimizerState::new("Adam");
        opt.params.insert("lr".into(), 0.001);
        opt.state.insert("classifier.bias_m".into(), vec![0.0, 0.1]);

        let checkpoint = Checkpoint::new(sample_weights(), CheckpointMeta::new("ANIL-Identity").with_epoch(3))
            .with_optimizer_state(opt.clone());
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.meta.epoch, 3);
        assert_eq!(loaded.weights, sample_weights());
        assert_eq!(loaded.optimizer_state, Some(opt));

        // Re-saving without optimizer state drops the old file.
        Checkpoint::new(sample_weights(), CheckpointMeta::new("ANIL-Identity"))
            .save(&path)
            .unwrap();
        assert!(Checkpoint::load(&path).unwrap().optimizer_state.is_none());
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Checkpoint::load(dir.path().join("missing")),
            Err(SerializationError::DirectoryNotFound(_))
        ));
        assert!(matches!(
            Checkpoint::load(dir.path()),
            Err(SerializationError::FileNotFound(_))
        ));

        let path = dir.path().join("ckpt");
        Checkpoint::new(sample_weights(), CheckpointMeta::new("R2D2-Identity"))
            .save(&path)
            .unwrap();
        assert!(matches!(
            Checkpoint::load_for(&path, "ANIL-Identity"),
            Err(SerializationError::ModelMismatch { .. })
        ));
        assert!(Checkpoint::load_for(&path, "R2D2-Identity").is_ok());
    }
}
