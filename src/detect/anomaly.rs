use crate::detect::DetectError;

/// Summary statistics over a borrowed window of bucket values.
pub struct TimeSeries<'a> {
    values: &'a [f64],
}

impl<'a> TimeSeries<'a> {
    pub fn new(values: &'a [f64]) -> Self {
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

    /// Z = (value - mean) / std_dev.
    ///
    /// A constant baseline gives 0 for an equal value and a signed infinity
    /// for anything else.
    pub fn z_score(&self, value: f64, min_samples: usize) -> Result<f64, DetectError> {
        if self.values.len() < min_samples {
            return Err(DetectError::InsufficientBaseline {
                needed: min_samples,
                have: self.values.len(),
            });
        }
        let mean = self.mean();
        let std = self.std_dev();
        if std == 0.0 {
            let diff = value - mean;
            if diff.abs() > f64::EPSILON * mean.abs().max(1.0) {
                return Ok(f64::INFINITY.copysign(diff));
            }
            return Ok(0.0);
        }
        Ok((value - mean) / std)
    }
}
