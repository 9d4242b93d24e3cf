//! Rolling-baseline anomaly detection over bucketed sales.

pub mod anomaly;
pub mod engine;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SeverityBands;
use crate::series::{Granularity, ValidationError};

pub use self::engine::AnomalyDetector;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("insufficient baseline data: need {needed} samples, have {have}")]
    InsufficientBaseline { needed: usize, have: usize },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Severity of a flagged point, banded on |z|.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Mild,
    Moderate,
    Severe,
}

impl Severity {
    /// Band `|z|`. Values under the mild band still map to Mild; the caller
    /// decides whether they are anomalous at all.
    pub fn from_z(z_score: f64, bands: &SeverityBands) -> Self {
        let z = z_score.abs();
        if z >= bands.severe {
            Severity::Severe
        } else if z >= bands.moderate {
            Severity::Moderate
        } else {
            Severity::Mild
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Mild => write!(f, "mild"),
            Severity::Moderate => write!(f, "moderate"),
            Severity::Severe => write!(f, "severe"),
        }
    }
}

/// Composite key every downstream record hangs off.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnomalyKey {
    pub date: NaiveDate,
    pub product_id: String,
}

impl std::fmt::Display for AnomalyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.product_id, self.date)
    }
}

/// A bucket whose value strays from its trailing baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    /// Start of the anomalous period.
    pub date: NaiveDate,
    pub product_id: String,
    pub actual_value: f64,
    /// Baseline mean.
    pub expected_value: f64,
    pub baseline_std_dev: f64,
    pub baseline_samples: usize,
    /// Infinite when the baseline had zero variance.
    #[serde(with = "signed_float")]
    pub z_score: f64,
    pub severity: Severity,
    pub granularity: Granularity,
}

impl Anomaly {
    pub fn key(&self) -> AnomalyKey {
        AnomalyKey {
            date: self.date,
            product_id: self.product_id.clone(),
        }
    }

    pub fn is_spike(&self) -> bool {
        self.actual_value >= self.expected_value
    }

    /// Relative deviation from the baseline, e.g. `0.45` for +45%.
    pub fn relative_change(&self) -> Option<f64> {
        if self.expected_value.abs() < f64::EPSILON {
            return None;
        }
        Some((self.actual_value - self.expected_value) / self.expected_value)
    }

    /// One-line description used in prompts and stored summaries.
    pub fn summary(&self) -> String {
        let direction = if self.is_spike() { "above" } else { "below" };
        let change = self
            .relative_change()
            .map(|c| format!(" ({:+.0}%)", c * 100.0))
            .unwrap_or_default();
        format!(
            "{} {} sales for {} were {:.1}, {} the expected {:.1}{} (z={:.1}, {})",
            self.granularity,
            self.date,
            self.product_id,
            self.actual_value,
            direction,
            self.expected_value,
            change,
            self.z_score,
            self.severity
        )
    }
}

/// JSON has no infinity; non-finite scores travel as `"inf"` / `"-inf"`.
mod signed_float {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("nan")
        } else if *value > 0.0 {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(s) => match s.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                "nan" => Ok(f64::NAN),
                other => Err(serde::de::Error::custom(format!("invalid score '{other}'"))),
            },
        }
    }
}
