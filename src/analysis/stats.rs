/// A simple series of latency samples for statistical summaries.
pub struct TimeSeries {
    values: Vec<f64>,
}

impl TimeSeries {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    pub fn max(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::max)
    }

    /// Population variance.
    pub fn variance(&self) -> Option<f64> {
        let mean = self.mean()?;
        let sum_sq_diff: f64 = self.values.iter().map(|&x| (x - mean).powi(2)).sum();
        Some(sum_sq_diff / self.values.len() as f64)
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    /// Mean absolute difference between consecutive samples.
    /// Zero for a single sample, `None` for an empty series.
    pub fn jitter(&self) -> Option<f64> {
        match self.values.len() {
            0 => None,
            1 => Some(0.0),
            n => {
                let total: f64 = self
                    .values
                    .windows(2)
                    .map(|w| (w[1] - w[0]).abs())
                    .sum();
                Some(total / (n - 1) as f64)
            }
        }
    }
}

/// Z-score of `value` against a mean and standard deviation.
///
/// A constant baseline makes any deviation infinitely unusual.
pub fn z_score(value: f64, mean: f64, std_dev: f64) -> f64 {
    if std_dev <= f64::EPSILON {
        if (value - mean).abs() > f64::EPSILON {
            return f64::INFINITY;
        }
        return 0.0;
    }
    (value - mean) / std_dev
}
