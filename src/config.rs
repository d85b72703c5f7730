// --- File: src/config.rs ---

//! Experiment configuration.
//!
//! A run is described by one YAML file (`way_num`, `shot_num`, `classifier`,
//! `backbone`, `optimizer`, ...). The tester re-reads the `config.yaml` that
//! training left in the result directory and applies a dictionary of dotted
//! overrides on top of it:
//!
//! ```rust,ignore
//! let overrides = vec![("test_episode".to_string(), "600".to_string())];
//! let config = Config::load(result_dir.join("config.yaml"), &overrides)?;
//! ```

use crate::backbone::BackboneConfig;
use crate::data::DataConfig;
use crate::episode::EpisodeLayout;
use crate::optimizers::{LrSchedulerConfig, OptimizerConfig};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading, overriding or validating a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid override '{0}': expected key=value")]
    InvalidOverride(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

type Result<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Classifier
// ============================================================================

/// Few-shot method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassifierKind {
    #[serde(rename = "ANIL", alias = "anil")]
    Anil,
    #[serde(rename = "R2D2", alias = "r2d2")]
    R2d2,
    #[serde(rename = "Baseline", alias = "baseline")]
    Baseline,
    #[serde(rename = "BaselinePlus", alias = "Baseline++", alias = "baseline_plus")]
    BaselinePlus,
}

impl ClassifierKind {
    pub fn name(&self) -> &'static str {
        match self {
            ClassifierKind::Anil => "ANIL",
            ClassifierKind::R2d2 => "R2D2",
            ClassifierKind::Baseline => "Baseline",
            ClassifierKind::BaselinePlus => "BaselinePlus",
        }
    }

    /// Meta models train on episodic batches, pretrain models on plain ones.
    pub fn is_meta(&self) -> bool {
        matches!(self, ClassifierKind::Anil | ClassifierKind::R2d2)
    }
}

fn default_hid_dim() -> usize {
    800
}

fn default_alpha() -> f32 {
    1.0
}

fn default_gamma() -> f32 {
    50.0
}

/// Keyword arguments of the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierKwargs {
    /// Hidden width of the ANIL head.
    #[serde(default = "default_hid_dim")]
    pub hid_dim: usize,
    /// Number of training classes (Baseline / Baseline++).
    #[serde(default)]
    pub num_classes: Option<usize>,
    /// Optimizer of the inner loop, rebuilt for every episode.
    #[serde(default)]
    pub inner_optim: OptimizerConfig,
    /// Inner steps; 10 for ANIL, 20 for the pretrain family when unset.
    #[serde(default)]
    pub inner_train_iter: Option<usize>,
    /// Initial R2D2 scale, bias and ridge penalty.
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    #[serde(default)]
    pub beta: f32,
    #[serde(default = "default_gamma")]
    pub gamma: f32,
}

impl Default for ClassifierKwargs {
    fn default() -> Self {
        Self {
            hid_dim: default_hid_dim(),
            num_classes: None,
            inner_optim: OptimizerConfig::default(),
            inner_train_iter: None,
            alpha: default_alpha(),
            beta: 0.0,
            gamma: default_gamma(),
        }
    }
}

/// `classifier: {name, kwargs}` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub name: ClassifierKind,
    #[serde(default)]
    pub kwargs: ClassifierKwargs,
}

impl ClassifierConfig {
    pub fn new(name: ClassifierKind) -> Self {
        Self {
            name,
            kwargs: ClassifierKwargs::default(),
        }
    }

    pub fn inner_train_iter(&self) -> usize {
        self.kwargs.inner_train_iter.unwrap_or(if self.name.is_meta() { 10 } else { 20 })
    }
}

// ============================================================================
// Config
// ============================================================================

fn default_way() -> usize {
    5
}
fn default_shot() -> usize {
    1
}
fn default_query() -> usize {
    15
}
fn default_one() -> usize {
    1
}
fn default_episodes() -> usize {
    100
}
fn default_epoch() -> usize {
    10
}
fn default_batch_size() -> usize {
    64
}
fn default_result_root() -> PathBuf {
    PathBuf::from("./results")
}
fn default_log_level() -> String {
    "info".to_string()
}

/// A complete experiment description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_way")]
    pub way_num: usize,
    #[serde(default = "default_shot")]
    pub shot_num: usize,
    #[serde(default = "default_query")]
    pub query_num: usize,
    /// Test-time layout, defaulting to the training one.
    #[serde(default)]
    pub test_way: Option<usize>,
    #[serde(default)]
    pub test_shot: Option<usize>,
    #[serde(default)]
    pub test_query: Option<usize>,

    /// Episodes per batch.
    #[serde(default = "default_one")]
    pub episode_size: usize,
    /// Batches per training epoch.
    #[serde(default = "default_episodes")]
    pub train_episode: usize,
    /// Batches per validation / test epoch.
    #[serde(default = "default_episodes")]
    pub test_episode: usize,
    #[serde(default = "default_epoch")]
    pub epoch: usize,
    #[serde(default = "default_one")]
    pub test_epoch: usize,
    /// Plain batch size of the pretrain family.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_result_root")]
    pub result_root: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub backbone: BackboneConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub lr_scheduler: Option<LrSchedulerConfig>,
    #[serde(default)]
    pub data: DataConfig,

    /// Keys this crate does not interpret (`n_gpu`, `device_ids`, ...).
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Config {
    /// A configuration with every default and the given classifier.
    pub fn new(classifier: ClassifierKind) -> Self {
        Self {
            way_num: default_way(),
            shot_num: default_shot(),
            query_num: default_query(),
            test_way: None,
            test_shot: None,
            test_query: None,
            episode_size: default_one(),
            train_episode: default_episodes(),
            test_episode: default_episodes(),
            epoch: default_epoch(),
            test_epoch: default_one(),
            batch_size: default_batch_size(),
            seed: 0,
            result_root: default_result_root(),
            log_level: default_log_level(),
            classifier: ClassifierConfig::new(classifier),
            backbone: BackboneConfig::default(),
            optimizer: OptimizerConfig::default(),
            lr_scheduler: None,
            data: DataConfig::default(),
            extra: BTreeMap::new(),
        }
    }

    /// Reads `path`, applies `overrides` and validates the result.
    pub fn load<P: AsRef<Path>>(path: P, overrides: &[(String, String)]) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content, overrides)
    }

    /// Parses YAML text, applies `overrides` and validates the result.
    pub fn from_yaml_str(content: &str, overrides: &[(String, String)]) -> Result<Self> {
        let mut value: Value = serde_yaml::from_str(content)?;
        if value.is_null() {
            value = Value::Mapping(Mapping::new());
        }
        for (key, raw) in overrides {
            apply_override(&mut value, key, raw)?;
        }
        let config: Config = serde_yaml::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the resolved configuration as YAML.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("way_num", self.way_num),
            ("shot_num", self.shot_num),
            ("query_num", self.query_num),
            ("episode_size", self.episode_size),
            ("train_episode", self.train_episode),
            ("test_episode", self.test_episode),
            ("test_epoch", self.test_epoch),
            ("batch_size", self.batch_size),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", key)));
            }
        }
        let test = self.test_layout();
        if test.way_num == 0 || test.shot_num == 0 || test.query_num == 0 {
            return Err(ConfigError::Invalid("test way/shot/query must be positive".into()));
        }
        if self.way_num < 2 || test.way_num < 2 {
            return Err(ConfigError::Invalid("an episode needs at least two classes".into()));
        }

        let kwargs = &self.classifier.kwargs;
        match self.classifier.name {
            ClassifierKind::Baseline | ClassifierKind::BaselinePlus => match kwargs.num_classes {
                Some(n) if n >= 2 => {}
                Some(n) => {
                    return Err(ConfigError::Invalid(format!(
                        "classifier.kwargs.num_classes must be at least 2, got {}",
                        n
                    )))
                }
                None => {
                    return Err(ConfigError::Invalid(format!(
                        "{} requires classifier.kwargs.num_classes",
                        self.classifier.name.name()
                    )))
                }
            },
            ClassifierKind::Anil => {
                if kwargs.hid_dim == 0 {
                    return Err(ConfigError::Invalid("classifier.kwargs.hid_dim must be positive".into()));
                }
                // The head is sized by way_num and reused at test time.
                if test.way_num != self.way_num {
                    return Err(ConfigError::Invalid(format!(
                        "ANIL needs test_way == way_num, got {} and {}",
                        test.way_num, self.way_num
                    )));
                }
            }
            ClassifierKind::R2d2 => {
                if !(kwargs.gamma.is_finite() && kwargs.gamma > 0.0) {
                    return Err(ConfigError::Invalid("classifier.kwargs.gamma must be positive".into()));
                }
            }
        }
        if !self.classifier.name.is_meta() || self.classifier.name == ClassifierKind::Anil {
            kwargs
                .inner_optim
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("classifier.kwargs.inner_optim: {}", e)))?;
        }

        self.optimizer
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("optimizer: {}", e)))?;
        if let Some(scheduler) = &self.lr_scheduler {
            scheduler
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("lr_scheduler: {}", e)))?;
        }
        self.backbone
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("backbone: {}", e)))?;
        self.data
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("data: {}", e)))?;
        Ok(())
    }

    pub fn train_layout(&self) -> EpisodeLayout {
        EpisodeLayout::new(self.way_num, self.shot_num, self.query_num)
    }

    pub fn test_layout(&self) -> EpisodeLayout {
        EpisodeLayout::new(
            self.test_way.unwrap_or(self.way_num),
            self.test_shot.unwrap_or(self.shot_num),
            self.test_query.unwrap_or(self.query_num),
        )
    }

    /// `{classifier}-{backbone}`, stored in checkpoints.
    pub fn model_name(&self) -> String {
        format!("{}-{}", self.classifier.name.name(), self.backbone.name.name())
    }

    /// `{result_root}/{classifier}-{backbone}-{way}-{shot}`.
    pub fn result_dir(&self) -> PathBuf {
        self.result_root
            .join(format!("{}-{}-{}", self.model_name(), self.way_num, self.shot_num))
    }
}

/// Parses `key=value` strings from the command line.
pub fn parse_overrides<S: AsRef<str>>(raw: &[S]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|item| {
            let item = item.as_ref();
            match item.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    Ok((key.trim().to_string(), value.trim().to_string()))
                }
                _ => Err(ConfigError::InvalidOverride(item.to_string())),
            }
        })
        .collect()
}

/// Sets the dotted `key` of a YAML tree, parsing `raw` as a YAML scalar.
fn apply_override(root: &mut Value, key: &str, raw: &str) -> Result<()> {
    let parsed: Value = serde_yaml::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));

    let parts: Vec<&str> = key.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(ConfigError::InvalidOverride(key.to_string()));
    }

    let mut node = root;
    for part in &parts[..parts.len() - 1] {
        let map = node
            .as_mapping_mut()
            .ok_or_else(|| ConfigError::InvalidOverride(key.to_string()))?;
        let entry = map
            .entry(Value::String(part.to_string()))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if entry.is_null() {
            *entry = Value::Mapping(Mapping::new());
        }
        node = entry;
    }
    let map = node
        .as_mapping_mut()
        .ok_or_else(|| ConfigError::InvalidOverride(key.to_string()))?;
    map.insert(Value::String(parts[parts.len() - 1].to_string()), parsed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizers::OptimizerKind;

    const ANIL_YAML: &str = r#"
way_num: 5
shot_num: 1
query_num: 15
episode_size: 2
classifier:
  name: ANIL
  kwargs:
    hid_dim: 32
    inner_optim:
      name: SGD
      kwargs:
        lr: 0.1
    inner_train_iter: 5
optimizer:
  name: Adam
  kwargs:
    lr: 0.001
n_gpu: 1
device_ids: "0"
"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = Config::from_yaml_str(ANIL_YAML, &[]).unwrap();
        assert_eq!(config.classifier.name, ClassifierKind::Anil);
        assert_eq!(config.classifier.kwargs.hid_dim, 32);
        assert_eq!(config.classifier.inner_train_iter(), 5);
        assert_eq!(config.optimizer.name, OptimizerKind::Adam);
        assert_eq!(config.test_layout(), config.train_layout());
        assert_eq!(config.test_epoch, 1);
        assert!(config.extra.contains_key("n_gpu"));
    }

    #[test]
    fn test_dotted_overrides() {
        let overrides = parse_overrides(&[
            "test_episode=600",
            "episode_size=4",
            "classifier.kwargs.inner_optim.kwargs.lr=0.5",
            "test_shot=5",
        ])
        .unwrap();
        let config = Config::from_yaml_str(ANIL_YAML, &overrides).unwrap();
        assert_eq!(config.test_episode, 600);
        assert_eq!(config.episode_size, 4);
        assert_eq!(config.classifier.kwargs.inner_optim.lr(), 0.5);
        assert_eq!(config.test_layout().shot_num, 5);
        assert_eq!(config.train_layout().shot_num, 1);
    }

    #[test]
    fn test_invalid_overrides() {
        assert!(parse_overrides(&["no_equals_sign"]).is_err());
        assert!(parse_overrides(&["=5"]).is_err());
        let bad = vec![("way_num.inner".to_string(), "1".to_string())];
        assert!(matches!(
            Config::from_yaml_str(ANIL_YAML, &bad),
            Err(ConfigError::InvalidOverride(_))
        ));
    }

    #[test]
    fn test_validation() {
        let zero_way = vec![("way_num".to_string(), "0".to_string())];
        assert!(matches!(
            Config::from_yaml_str(ANIL_YAML, &zero_way),
            Err(ConfigError::Invalid(_))
        ));

        let baseline = "classifier:\n  name: Baseline\n";
        assert!(matches!(
            Config::from_yaml_str(baseline, &[]),
            Err(ConfigError::Invalid(_))
        ));
        let with_classes = vec![("classifier.kwargs.num_classes".to_string(), "20".to_string())];
        let config = Config::from_yaml_str(baseline, &with_classes).unwrap();
        assert_eq!(config.classifier.inner_train_iter(), 20);

        let anil_test_way = vec![("test_way".to_string(), "10".to_string())];
        assert!(matches!(
            Config::from_yaml_str(ANIL_YAML, &anil_test_way),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let config = Config::from_yaml_str(ANIL_YAML, &[]).unwrap();
        config.save(&path).unwrap();

        let reloaded = Config::load(&path, &[]).unwrap();
        assert_eq!(reloaded.classifier, config.classifier);
        assert_eq!(reloaded.episode_size, 2);
        assert_eq!(reloaded.result_dir(), config.result_dir());
        assert!(reloaded.result_dir().ends_with("ANIL-Identity-5-1"));
    }
}
