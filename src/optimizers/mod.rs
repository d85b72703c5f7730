//! Optimizers that update a [`ParamStore`] from a gradient store.
//!
//! The same optimizers serve both loops: the outer loop steps the model's
//! meta-parameters once per batch, and the inner loop of ANIL / Baseline
//! builds a fresh optimizer per episode (the `sub_optimizer` of the
//! experiment files) over a copied classifier head.

pub mod scheduler;

pub use scheduler::{LrScheduler, LrSchedulerConfig};

use crate::error::{FewShotError, Result};
use crate::nn::ParamStore;
use crate::serialization::OptimizerState;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Trait defining the common interface for all optimizers.
pub trait Optimizer {
    /// Performs one optimisation step.
    ///
    /// # Arguments
    ///
    /// * `parameters` - Current values, updated in place.
    /// * `gradients` - Gradients keyed by the same names. Parameters without
    ///   a gradient are left untouched.
    fn step(&mut self, parameters: &mut ParamStore, gradients: &ParamStore) -> Result<()>;

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);

    /// Snapshot of hyper-parameters and per-parameter buffers.
    fn state(&self) -> OptimizerState;
}

fn check_same_shape(name: &str, param: &ArrayD<f32>, grad: &ArrayD<f32>) -> Result<()> {
    if param.shape() != grad.shape() {
        return Err(FewShotError::shape(name, param.shape(), grad.shape()));
    }
    Ok(())
}

fn export_buffers(suffix: &str, buffers: &HashMap<String, ArrayD<f32>>, into: &mut HashMap<String, Vec<f64>>) {
    for (name, buf) in buffers {
        into.insert(
            format!("{}{}", name, suffix),
            buf.iter().map(|&v| f64::from(v)).collect(),
        );
    }
}

// ============================================================================
// SGD
// ============================================================================

/// Stochastic gradient descent with momentum, dampening, Nesterov momentum
/// and L2 weight decay.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    dampening: f32,
    nesterov: bool,
    weight_decay: f32,
    momentum_buffers: HashMap<String, ArrayD<f32>>,
}

impl Sgd {
    /// Plain SGD, `param = param - lr * grad`.
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            momentum: 0.0,
            dampening: 0.0,
            nesterov: false,
            weight_decay: 0.0,
            momentum_buffers: HashMap::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f32, dampening: f32, nesterov: bool) -> Self {
        self.momentum = momentum;
        self.dampening = dampening;
        self.nesterov = nesterov;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, parameters: &mut ParamStore, gradients: &ParamStore) -> Result<()> {
        for (name, grad) in gradients {
            let Some(param) = parameters.get_mut(name) else {
                continue;
            };
            check_same_shape(name, param, grad)?;

            let mut d_p = grad.clone();
            if self.weight_decay != 0.0 {
                d_p.scaled_add(self.weight_decay, param);
            }
            if self.momentum != 0.0 {
                let (momentum, dampening) = (self.momentum, self.dampening);
                let buf = match self.momentum_buffers.entry(name.clone()) {
                    Entry::Occupied(entry) => {
                        let buf = entry.into_mut();
                        buf.mapv_inplace(|b| b * momentum);
                        buf.scaled_add(1.0 - dampening, &d_p);
                        buf
                    }
                    Entry::Vacant(entry) => entry.insert(d_p.clone()),
                };
                if self.nesterov {
                    d_p.scaled_add(momentum, buf);
                } else {
                    d_p.assign(buf);
                }
            }
            param.scaled_add(-self.lr, &d_p);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn state(&self) -> OptimizerState {
        let mut state = OptimizerState::new("SGD");
        state.params.insert("lr".into(), f64::from(self.lr));
        state.params.insert("momentum".into(), f64::from(self.momentum));
        state.params.insert("dampening".into(), f64::from(self.dampening));
        state.params.insert("weight_decay".into(), f64::from(self.weight_decay));
        export_buffers("_momentum", &self.momentum_buffers, &mut state.state);
        state
    }
}

// ============================================================================
// Adam
// ============================================================================

/// Adam with bias correction and L2 weight decay.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    steps: HashMap<String, i32>,
    exp_avg: HashMap<String, ArrayD<f32>>,
    exp_avg_sq: HashMap<String, ArrayD<f32>>,
}

impl Adam {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            steps: HashMap::new(),
            exp_avg: HashMap::new(),
            exp_avg_sq: HashMap::new(),
        }
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for Adam {
    fn step(&mut self, parameters: &mut ParamStore, gradients: &ParamStore) -> Result<()> {
        for (name, grad) in gradients {
            let Some(param) = parameters.get_mut(name) else {
                continue;
            };
            check_same_shape(name, param, grad)?;

            let mut g = grad.clone();
            if self.weight_decay != 0.0 {
                g.scaled_add(self.weight_decay, param);
            }

            let t = self.steps.entry(name.clone()).or_insert(0);
            *t += 1;
            let bias1 = 1.0 - self.beta1.powi(*t);
            let bias2 = 1.0 - self.beta2.powi(*t);

            let m = self
                .exp_avg
                .entry(name.clone())
                .or_insert_with(|| ArrayD::zeros(g.raw_dim()));
            m.mapv_inplace(|v| v * self.beta1);
            m.scaled_add(1.0 - self.beta1, &g);

            let v = self
                .exp_avg_sq
                .entry(name.clone())
                .or_insert_with(|| ArrayD::zeros(g.raw_dim()));
            v.mapv_inplace(|x| x * self.beta2);
            v.scaled_add(1.0 - self.beta2, &g.mapv(|x| x * x));

            let (lr, eps) = (self.lr, self.eps);
            ndarray::azip!((p in param, &m in &*m, &v in &*v) {
                let m_hat = m / bias1;
                let v_hat = v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn state(&self) -> OptimizerState {
        let mut state = OptimizerState::new("Adam");
        state.params.insert("lr".into(), f64::from(self.lr));
        state.params.insert("beta1".into(), f64::from(self.beta1));
        state.params.insert("beta2".into(), f64::from(self.beta2));
        state.params.insert("eps".into(), f64::from(self.eps));
        state.params.insert("weight_decay".into(), f64::from(self.weight_decay));
        export_buffers("_m", &self.exp_avg, &mut state.state);
        export_buffers("_v", &self.exp_avg_sq, &mut state.state);
        state
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Optimizer family, spelled as in the experiment files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    #[serde(rename = "SGD", alias = "sgd", alias = "Sgd")]
    Sgd,
    #[serde(rename = "Adam", alias = "adam")]
    Adam,
}

/// Keyword arguments of an optimizer. Unset values take the usual defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerKwargs {
    #[serde(default)]
    pub lr: Option<f32>,
    #[serde(default)]
    pub momentum: f32,
    #[serde(default)]
    pub dampening: f32,
    #[serde(default)]
    pub nesterov: bool,
    #[serde(default)]
    pub weight_decay: f32,
    #[serde(default)]
    pub betas: Option<(f32, f32)>,
    #[serde(default)]
    pub eps: Option<f32>,
}

/// `{name, kwargs}` block describing an optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub name: OptimizerKind,
    #[serde(default)]
    pub kwargs: OptimizerKwargs,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::sgd(0.01)
    }
}

impl OptimizerConfig {
    pub fn sgd(lr: f32) -> Self {
        Self {
            name: OptimizerKind::Sgd,
            kwargs: OptimizerKwargs {
                lr: Some(lr),
                ..Default::default()
            },
        }
    }

    pub fn adam(lr: f32) -> Self {
        Self {
            name: OptimizerKind::Adam,
            kwargs: OptimizerKwargs {
                lr: Some(lr),
                ..Default::default()
            },
        }
    }

    /// Learning rate after defaults: 1e-2 for SGD, 1e-3 for Adam.
    pub fn lr(&self) -> f32 {
        self.kwargs.lr.unwrap_or(match self.name {
            OptimizerKind::Sgd => 1e-2,
            OptimizerKind::Adam => 1e-3,
        })
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        let lr = self.lr();
        if !(lr.is_finite() && lr > 0.0) {
            return Err(format!("learning rate must be positive, got {}", lr));
        }
        if self.kwargs.weight_decay < 0.0 {
            return Err("weight_decay must be non-negative".to_string());
        }
        if self.kwargs.nesterov && (self.kwargs.momentum <= 0.0 || self.kwargs.dampening != 0.0) {
            return Err("nesterov momentum requires momentum > 0 and zero dampening".to_string());
        }
        Ok(())
    }

    /// Builds a fresh optimizer with empty state.
    pub fn build(&self) -> Box<dyn Optimizer> {
        let kw = &self.kwargs;
        match self.name {
            OptimizerKind::Sgd => Box::new(
                Sgd::new(self.lr())
                    .with_momentum(kw.momentum, kw.dampening, kw.nesterov)
                    .with_weight_decay(kw.weight_decay),
            ),
            OptimizerKind::Adam => {
                let (b1, b2) = kw.betas.unwrap_or((0.9, 0.999));
                Box::new(
                    Adam::new(self.lr())
                        .with_betas(b1, b2)
                        .with_eps(kw.eps.unwrap_or(1e-8))
                        .with_weight_decay(kw.weight_decay),
                )
            }
        }
    }
}
