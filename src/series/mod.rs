//! Sales records, exogenous signals and their bucketed form.

pub mod aggregator;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::aggregator::TimeSeriesAggregator;

/// Input rejected before any state was touched.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("series for {product} goes backwards: {next} follows {previous}")]
    NonMonotonic {
        product: String,
        previous: NaiveDate,
        next: NaiveDate,
    },
    #[error("series for {product} has a non-finite value on {date}")]
    NonFinite { product: String, date: NaiveDate },
    #[error("expected {expected} buckets, found {found} bucket at {date}")]
    GranularityMismatch {
        expected: Granularity,
        found: Granularity,
        date: NaiveDate,
    },
    #[error("bucket at {date} ends before it starts")]
    InvertedPeriod { date: NaiveDate },
    #[error("exogenous series {series_id} is not ordered by date at {date}")]
    UnorderedExogenous { series_id: String, date: NaiveDate },
}

/// A single sales observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesPoint {
    pub date: NaiveDate,
    pub product_id: String,
    pub quantity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Granularity::Day => write!(f, "day"),
            Granularity::Week => write!(f, "week"),
            Granularity::Month => write!(f, "month"),
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(Granularity::Day),
            "week" | "weekly" => Ok(Granularity::Week),
            "month" | "monthly" => Ok(Granularity::Month),
            other => Err(format!("unknown granularity '{other}'")),
        }
    }
}

/// One resampled period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedBucket {
    pub period_start: NaiveDate,
    /// Inclusive.
    pub period_end: NaiveDate,
    pub granularity: Granularity,
    pub aggregate_value: f64,
}

/// All buckets of one product at one granularity, ascending by period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSeries {
    pub product_id: String,
    pub granularity: Granularity,
    pub buckets: Vec<AggregatedBucket>,
}

impl BucketSeries {
    /// Index of the bucket starting at `date`.
    pub fn position(&self, date: NaiveDate) -> Option<usize> {
        self.buckets
            .binary_search_by(|b| b.period_start.cmp(&date))
            .ok()
    }
}

/// Where an exogenous signal comes from; selects the hypothesis template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    Weather,
    Economic,
    Promotion,
    Event,
    #[default]
    Other,
}

/// A daily external signal such as temperature or a price index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExogenousSeries {
    pub series_id: String,
    #[serde(default)]
    pub kind: FactorKind,
    pub points: Vec<ExogenousPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExogenousPoint {
    pub date: NaiveDate,
    pub value: f64,
}

impl ExogenousSeries {
    pub fn new(series_id: impl Into<String>, kind: FactorKind, points: Vec<ExogenousPoint>) -> Self {
        Self {
            series_id: series_id.into(),
            kind,
            points,
        }
    }

    /// Points must be strictly ascending by date with finite values.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for pair in self.points.windows(2) {
            if pair[1].date <= pair[0].date {
                return Err(ValidationError::UnorderedExogenous {
                    series_id: self.series_id.clone(),
                    date: pair[1].date,
                });
            }
        }
        if let Some(p) = self.points.iter().find(|p| !p.value.is_finite()) {
            return Err(ValidationError::NonFinite {
                product: self.series_id.clone(),
                date: p.date,
            });
        }
        Ok(())
    }

    /// Mean of the values dated within `[start, end]`, or `None` on a gap.
    pub fn mean_between(&self, start: NaiveDate, end: NaiveDate) -> Option<f64> {
        let lo = self.points.partition_point(|p| p.date < start);
        let hi = self.points.partition_point(|p| p.date <= end);
        if lo >= hi {
            return None;
        }
        let slice = &self.points[lo..hi];
        Some(slice.iter().map(|p| p.value).sum::<f64>() / slice.len() as f64)
    }
}
