//! Learning-rate schedules for the outer optimizer, stepped once per epoch.

use serde::{Deserialize, Serialize};

/// Schedule family and its arguments, `{name, kwargs}` in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "kwargs")]
pub enum LrSchedulerConfig {
    /// Multiply by `gamma` every `step_size` epochs.
    StepLR { step_size: usize, gamma: f32 },
    /// Multiply by `gamma` at every epoch listed in `milestones`.
    MultiStepLR { milestones: Vec<usize>, gamma: f32 },
    /// Cosine decay from the base rate to `eta_min` over `t_max` epochs.
    CosineAnnealingLR {
        t_max: usize,
        #[serde(default)]
        eta_min: f32,
    },
}

impl LrSchedulerConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::StepLR { step_size, gamma } => {
                if *step_size == 0 {
                    return Err("StepLR.step_size must be positive".into());
                }
                check_gamma(*gamma)
            }
            Self::MultiStepLR { gamma, .. } => check_gamma(*gamma),
            Self::CosineAnnealingLR { t_max, eta_min } => {
                if *t_max == 0 {
                    return Err("CosineAnnealingLR.t_max must be positive".into());
                }
                if *eta_min < 0.0 {
                    return Err("CosineAnnealingLR.eta_min must be non-negative".into());
                }
                Ok(())
            }
        }
    }
}

fn check_gamma(gamma: f32) -> Result<(), String> {
    if gamma > 0.0 && gamma.is_finite() {
        Ok(())
    } else {
        Err(format!("scheduler gamma must be positive, got {}", gamma))
    }
}

/// Closed-form schedule: the rate depends only on the base rate and the
/// epoch index, so resuming from a checkpoint needs no scheduler state.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    base_lr: f32,
    config: Option<LrSchedulerConfig>,
}

impl LrScheduler {
    pub fn new(base_lr: f32, config: Option<LrSchedulerConfig>) -> Self {
        Self { base_lr, config }
    }

    /// Learning rate to use during `epoch` (0-based).
    pub fn learning_rate(&self, epoch: usize) -> f32 {
        match &self.config {
            None => self.base_lr,
            Some(LrSchedulerConfig::StepLR { step_size, gamma }) => {
                self.base_lr * gamma.powi((epoch / step_size) as i32)
            }
            Some(LrSchedulerConfig::MultiStepLR { milestones, gamma }) => {
                let passed = milestones.iter().filter(|&&m| m <= epoch).count();
                self.base_lr * gamma.powi(passed as i32)
            }
            Some(LrSchedulerConfig::CosineAnnealingLR { t_max, eta_min }) => {
                let progress = (epoch.min(*t_max)) as f32 / *t_max as f32;
                eta_min + (self.base_lr - eta_min) * 0.5 * (1.0 + (std::f32::consts::PI * progress).cos())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_step_lr() {
        let s = LrScheduler::new(
            0.1,
            Some(LrSchedulerConfig::StepLR {
                step_size: 10,
                gamma: 0.5,
            }),
        );
        assert_abs_diff_eq!(s.learning_rate(0), 0.1, epsilon = 1e-7);
        assert_abs_diff_eq!(s.learning_rate(9), 0.1, epsilon = 1e-7);
        assert_abs_diff_eq!(s.learning_rate(10), 0.05, epsilon = 1e-7);
        assert_abs_diff_eq!(s.learning_rate(25), 0.025, epsilon = 1e-7);
    }

    #[test]
    fn test_multistep_and_cosine() {
        let multi = LrScheduler::new(
            1.0,
            Some(LrSchedulerConfig::MultiStepLR {
                milestones: vec![2, 4],
                gamma: 0.1,
            }),
        );
        assert_abs_diff_eq!(multi.learning_rate(3), 0.1, epsilon = 1e-6);
        assert_abs_diff_eq!(multi.learning_rate(4), 0.01, epsilon = 1e-6);

        let cos = LrScheduler::new(
            1.0,
            Some(LrSchedulerConfig::CosineAnnealingLR {
                t_max: 10,
                eta_min: 0.0,
            }),
        );
        assert_abs_diff_eq!(cos.learning_rate(0), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(cos.learning_rate(5), 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(cos.learning_rate(10), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_yaml_shape() {
        let cfg: LrSchedulerConfig =
            serde_yaml::from_str("name: StepLR\nkwargs:\n  step_size: 5\n  gamma: 0.5\n").unwrap();
        assert_eq!(
            cfg,
            LrSchedulerConfig::StepLR {
                step_size: 5,
                gamma: 0.5
            }
        );
        assert!(cfg.validate().is_ok());
    }
}
