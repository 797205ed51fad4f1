/// Z-score reported when the baseline has zero variance but the current
/// count sits above the mean. A previously error-free service would
/// otherwise divide by zero and stay blind to its first burst.
pub const SIGMA_ZERO_SENTINEL: f64 = 999.0;

/// Per-minute baseline counts for one detection pass.
#[derive(Debug)]
pub struct BaselineStats {
    values: Vec<f64>,
}

impl BaselineStats {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq_diff: f64 = self.values.iter().map(|&x| (x - mean).powi(2)).sum();
        sum_sq_diff / self.values.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Z-score of `current` against this baseline.
    /// Z = (current - mean) / std_dev, with the sentinel on zero variance.
    pub fn z_score(&self, current: f64) -> f64 {
        let sigma = self.std_dev();
        if sigma == 0.0 {
            if current > self.mean() {
                return SIGMA_ZERO_SENTINEL;
            }
            return 0.0;
        }
        (current - self.mean()) / sigma
    }
}
