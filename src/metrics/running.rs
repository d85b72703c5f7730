// --- File: src/metrics/running.rs ---

//! Running statistics for per-episode and per-batch values.
//!
//! `RunningStd` uses Welford's online update, so the test loop can report a
//! mean and a confidence interval over thousands of episodes without
//! keeping them all.

/// Averages values weighted by sample count (loss and accuracy per batch).
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    name: String,
    last: f64,
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Records `value` observed over `n` samples.
    pub fn update(&mut self, value: f64, n: usize) {
        self.last = value;
        self.sum += value * n as f64;
        self.count += n;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn last(&self) -> f64 {
        self.last
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reset(&mut self) {
        self.last = 0.0;
        self.sum = 0.0;
        self.count = 0;
    }
}

/// Online mean / standard deviation (Welford's algorithm).
#[derive(Debug, Clone, Default)]
pub struct RunningStd {
    count: usize,
    mean: f64,
    m2: f64, // Sum of squares of differences from mean
}

impl RunningStd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn update_batch(&mut self, values: &[f64]) {
        for &v in values {
            self.update(v);
        }
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance (`n - 1` in the denominator).
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Half-width of the 95% confidence interval of the mean.
    pub fn confidence_interval_95(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            Z_95 * self.std() / (self.count as f64).sqrt()
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.mean = 0.0;
        self.m2 = 0.0;
    }
}

/// Two-sided 95% quantile of the standard normal.
const Z_95: f64 = 1.96;

/// Mean and 95% confidence half-width `h` of `values`.
pub fn mean_confidence_interval(values: &[f64]) -> (f64, f64) {
    let mut stats = RunningStd::new();
    stats.update_batch(values);
    (stats.mean(), stats.confidence_interval_95())
}
