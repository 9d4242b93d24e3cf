use tracing::{debug, info};

use crate::config::DetectionConfig;
use crate::detect::anomaly::TimeSeries;
use crate::detect::{Anomaly, DetectError, Severity};
use crate::series::{BucketSeries, Granularity, ValidationError};

/// Flags buckets that stray too far from their trailing baseline.
pub struct AnomalyDetector<'a> {
    config: &'a DetectionConfig,
}

impl<'a> AnomalyDetector<'a> {
    pub fn new(config: &'a DetectionConfig) -> Self {
        Self { config }
    }

    /// Scan `series` for anomalies, oldest first.
    ///
    /// The whole series is validated before the scan, so an invalid series
    /// yields an error and no anomalies at all.
    pub fn detect(
        &self,
        series: &BucketSeries,
        granularity: Granularity,
    ) -> Result<Vec<Anomaly>, DetectError> {
        validate(series, granularity)?;

        let window = self.config.window_for(granularity);
        let values: Vec<f64> = series.buckets.iter().map(|b| b.aggregate_value).collect();
        let mut anomalies = Vec::new();
        let mut skipped = 0usize;

        for (i, bucket) in series.buckets.iter().enumerate() {
            let baseline = TimeSeries::new(&values[i.saturating_sub(window)..i]);
            let value = bucket.aggregate_value;

            let z = match baseline.z_score(value, self.config.min_samples) {
                Ok(z) => z,
                Err(DetectError::InsufficientBaseline { .. }) => {
                    skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mean = baseline.mean();
            let std = baseline.std_dev();
            let flagged = if std == 0.0 {
                z.is_infinite()
            } else {
                (value - mean).abs() > self.config.z_threshold * std
            };
            if !flagged {
                continue;
            }

            let severity = Severity::from_z(z, &self.config.severity);
            debug!(
                product = %series.product_id,
                date = %bucket.period_start,
                value,
                mean,
                z,
                %severity,
                "anomaly flagged"
            );
            anomalies.push(Anomaly {
                date: bucket.period_start,
                product_id: series.product_id.clone(),
                actual_value: value,
                expected_value: mean,
                baseline_std_dev: std,
                baseline_samples: baseline.len(),
                z_score: z,
                severity,
                granularity,
            });
        }

        if skipped > 0 {
            debug!(
                product = %series.product_id,
                skipped,
                min_samples = self.config.min_samples,
                "buckets skipped for insufficient baseline"
            );
        }
        info!(
            product = %series.product_id,
            %granularity,
            buckets = series.buckets.len(),
            anomalies = anomalies.len(),
            "detection complete"
        );
        Ok(anomalies)
    }
}

fn validate(series: &BucketSeries, granularity: Granularity) -> Result<(), ValidationError> {
    for bucket in &series.buckets {
        if bucket.granularity != granularity {
            return Err(ValidationError::GranularityMismatch {
                expected: granularity,
                found: bucket.granularity,
                date: bucket.period_start,
            });
        }
        if bucket.period_end < bucket.period_start {
            return Err(ValidationError::InvertedPeriod {
                date: bucket.period_start,
            });
        }
        if !bucket.aggregate_value.is_finite() {
            return Err(ValidationError::NonFinite {
                product: series.product_id.clone(),
                date: bucket.period_start,
            });
        }
    }
    for pair in series.buckets.windows(2) {
        if pair[1].period_start <= pair[0].period_start {
            return Err(ValidationError::NonMonotonic {
                product: series.product_id.clone(),
                previous: pair[0].period_start,
                next: pair[1].period_start,
            });
        }
    }
    Ok(())
}
