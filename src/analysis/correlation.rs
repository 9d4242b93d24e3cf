use std::cmp::Ordering;
use std::ops::RangeInclusive;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::analysis::stats::{correlation_p_value, pearson};
use crate::config::CorrelationConfig;
use crate::detect::Anomaly;
use crate::series::{BucketSeries, ExogenousSeries, FactorKind};

/// Best lagged correlation between an anomaly's sales window and one factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationResult {
    pub factor_id: String,
    pub factor_kind: FactorKind,
    /// Positive when the factor leads sales.
    pub lag_days: i64,
    pub correlation_coefficient: f64,
    pub p_value: f64,
    pub sample_size: usize,
    /// 1-based position after ranking.
    pub rank: usize,
    pub significant: bool,
    pub interpretation: String,
}

impl CorrelationResult {
    pub fn strength(&self) -> f64 {
        self.correlation_coefficient.abs()
    }
}

/// Ranked results plus the per-factor winners that fell beyond top-K.
#[derive(Debug, Clone, Default)]
pub struct RankingAudit {
    pub top: Vec<CorrelationResult>,
    pub discarded: Vec<CorrelationResult>,
}

/// Searches a lag window against every exogenous series for one anomaly.
pub struct CorrelationRanker<'a> {
    config: &'a CorrelationConfig,
}

impl<'a> CorrelationRanker<'a> {
    pub fn new(config: &'a CorrelationConfig) -> Self {
        Self { config }
    }

    pub fn default_lags(&self) -> RangeInclusive<i64> {
        self.config.lag_min_days..=self.config.lag_max_days
    }

    /// Top-K correlations for `anomaly` using the configured lag range.
    pub fn rank(
        &self,
        anomaly: &Anomaly,
        sales: &BucketSeries,
        exogenous: &[ExogenousSeries],
    ) -> Vec<CorrelationResult> {
        self.rank_with_lags(anomaly, sales, exogenous, self.default_lags())
            .top
    }

    /// Rank with an explicit lag range and keep what top-K cut off.
    pub fn rank_with_lags(
        &self,
        anomaly: &Anomaly,
        sales: &BucketSeries,
        exogenous: &[ExogenousSeries],
        lags: RangeInclusive<i64>,
    ) -> RankingAudit {
        let Some(center) = sales.position(anomaly.date) else {
            warn!(anomaly = %anomaly.key(), "anomaly date not present in sales series");
            return RankingAudit::default();
        };
        let ctx = self.config.context_buckets;
        let lo = center.saturating_sub(ctx);
        let hi = (center + ctx + 1).min(sales.buckets.len());
        let window = &sales.buckets[lo..hi];

        let mut winners: Vec<CorrelationResult> = exogenous
            .iter()
            .filter_map(|series| self.best_lag(anomaly, window, series, lags.clone()))
            .collect();

        winners.sort_by(compare_results);
        let k = self.config.top_k;
        let mut discarded = if winners.len() > k {
            winners.split_off(k)
        } else {
            Vec::new()
        };
        // Ranks continue past K so the audit trail keeps its order.
        for (i, r) in winners.iter_mut().chain(discarded.iter_mut()).enumerate() {
            r.rank = i + 1;
        }
        for r in &discarded {
            debug!(
                anomaly = %anomaly.key(),
                factor = %r.factor_id,
                r = r.correlation_coefficient,
                p = r.p_value,
                rank = r.rank,
                "correlation beyond top-k"
            );
        }
        debug!(
            anomaly = %anomaly.key(),
            kept = winners.len(),
            discarded = discarded.len(),
            "correlation ranking complete"
        );
        RankingAudit {
            top: winners,
            discarded,
        }
    }

    fn best_lag(
        &self,
        anomaly: &Anomaly,
        window: &[crate::series::AggregatedBucket],
        series: &ExogenousSeries,
        lags: RangeInclusive<i64>,
    ) -> Option<CorrelationResult> {
        let mut best: Option<(i64, f64, f64, usize)> = None;

        for lag in lags {
            let mut deltas = Vec::with_capacity(window.len());
            let mut factor = Vec::with_capacity(window.len());
            for bucket in window {
                let (Some(start), Some(end)) = (
                    shift(bucket.period_start, lag),
                    shift(bucket.period_end, lag),
                ) else {
                    continue;
                };
                if let Some(v) = series.mean_between(start, end) {
                    deltas.push(bucket.aggregate_value - anomaly.expected_value);
                    factor.push(v);
                }
            }

            if deltas.len() < self.config.min_overlap {
                continue;
            }
            let Some(r) = pearson(&deltas, &factor) else {
                continue;
            };
            let p = correlation_p_value(r, deltas.len());
            let candidate = (lag, r, p, deltas.len());
            best = match best {
                Some(current) if !beats(&candidate, &current) => Some(current),
                _ => Some(candidate),
            };
        }

        let Some((lag, r, p, n)) = best else {
            debug!(
                anomaly = %anomaly.key(),
                factor = %series.series_id,
                min_overlap = self.config.min_overlap,
                "factor skipped: insufficient overlap"
            );
            return None;
        };
        let significant = p <= self.config.significance;
        Some(CorrelationResult {
            factor_id: series.series_id.clone(),
            factor_kind: series.kind,
            lag_days: lag,
            correlation_coefficient: r,
            p_value: p,
            sample_size: n,
            rank: 0,
            significant,
            interpretation: interpret(r, lag, p, significant),
        })
    }
}

/// Strongest |r|, then smallest |lag|, then smallest p.
fn beats(a: &(i64, f64, f64, usize), b: &(i64, f64, f64, usize)) -> bool {
    let (lag_a, r_a, p_a, _) = *a;
    let (lag_b, r_b, p_b, _) = *b;
    match r_a.abs().partial_cmp(&r_b.abs()) {
        Some(Ordering::Greater) => true,
        Some(Ordering::Less) => false,
        _ => match lag_a.abs().cmp(&lag_b.abs()) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => p_a < p_b,
        },
    }
}

fn compare_results(a: &CorrelationResult, b: &CorrelationResult) -> Ordering {
    b.strength()
        .partial_cmp(&a.strength())
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.p_value.partial_cmp(&b.p_value).unwrap_or(Ordering::Equal))
        .then_with(|| a.factor_id.cmp(&b.factor_id))
}

/// The factor date aligned with a sales date at `lag`.
fn shift(date: NaiveDate, lag: i64) -> Option<NaiveDate> {
    date.checked_sub_signed(Duration::days(lag))
}

fn interpret(r: f64, lag: i64, p: f64, significant: bool) -> String {
    let strength = match r.abs() {
        a if a >= 0.7 => "strong",
        a if a >= 0.4 => "moderate",
        _ => "weak",
    };
    let direction = if r >= 0.0 { "positive" } else { "negative" };
    let timing = match lag {
        0 => "on the same day".to_string(),
        l if l > 0 => format!("leading sales by {l} day(s)"),
        l => format!("trailing sales by {} day(s)", -l),
    };
    let mut text = format!("{strength} {direction} correlation {timing} (r={r:.2}, p={p:.3})");
    if !significant {
        text.push_str(", not significant");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Severity;
    use crate::series::{AggregatedBucket, ExogenousPoint, Granularity};
    use chrono::Days;

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, 14).unwrap()
    }

    fn noise(i: u64) -> f64 {
        ((i * i * 31 + i * 17 + 7) % 97) as f64
    }

    fn sales(n: u64) -> BucketSeries {
        BucketSeries {
            product_id: "SKU-1".into(),
            granularity: Granularity::Day,
            buckets: (0..n)
                .map(|i| {
                    let day = start() + Days::new(i);
                    AggregatedBucket {
                        period_start: day,
                        period_end: day,
                        granularity: Granularity::Day,
                        aggregate_value: 1000.0 + noise(i),
                    }
                })
                .collect(),
        }
    }

    fn anomaly_at(series: &BucketSeries, idx: usize) -> Anomaly {
        Anomaly {
            date: series.buckets[idx].period_start,
            product_id: series.product_id.clone(),
            actual_value: series.buckets[idx].aggregate_value,
            expected_value: 1050.0,
            baseline_std_dev: 29.0,
            baseline_samples: 30,
            z_score: 4.1,
            severity: Severity::Severe,
            granularity: Granularity::Day,
        }
    }

    fn factor(id: &str, kind: FactorKind, days: u64, f: impl Fn(u64) -> f64) -> ExogenousSeries {
        ExogenousSeries::new(
            id,
            kind,
            (0..days)
                .map(|i| ExogenousPoint {
                    date: start() + Days::new(i),
                    value: f(i),
                })
                .collect(),
        )
    }

    #[test]
    fn test_perfect_correlation_outranks_weak_in_any_order() {
        let cfg = CorrelationConfig::default();
        let s = sales(61);
        let a = anomaly_at(&s, 30);
        let perfect = factor("temperature", FactorKind::Weather, 61, |i| 2.0 * noise(i) + 5.0);
        let weak = factor("cpi", FactorKind::Economic, 61, |i| ((i * 13) % 7) as f64);

        for set in [vec![perfect.clone(), weak.clone()], vec![weak, perfect]] {
            let ranked = CorrelationRanker::new(&cfg).rank(&a, &s, &set);
            assert_eq!(ranked.len(), 2);
            assert_eq!(ranked[0].factor_id, "temperature");
            assert_eq!(ranked[0].rank, 1);
            assert_eq!(ranked[0].lag_days, 0);
            assert!((ranked[0].correlation_coefficient - 1.0).abs() < 1e-9);
            assert!(ranked[0].significant);
            assert!(ranked[0].strength() >= ranked[1].strength());
        }
    }

    #[test]
    fn test_never_more_than_k() {
        let cfg = CorrelationConfig::default();
        let s = sales(61);
        let a = anomaly_at(&s, 30);
        let set: Vec<ExogenousSeries> = (0..6u64)
            .map(|k| {
                factor(&format!("f{k}"), FactorKind::Other, 61, move |i| {
                    noise(i) * (k as f64 + 1.0) + noise(i + k * 11) * 5.0
                })
            })
            .collect();

        let ranker = CorrelationRanker::new(&cfg);
        let audit = ranker.rank_with_lags(&a, &s, &set, ranker.default_lags());
        assert_eq!(audit.top.len(), 3);
        assert_eq!(audit.discarded.len(), 3);
        for pair in audit.top.windows(2) {
            assert!(pair[0].strength() >= pair[1].strength());
        }
        assert!(audit.top[2].strength() >= audit.discarded[0].strength());
        assert_eq!(audit.discarded[0].rank, 4);
    }

    #[test]
    fn test_leading_factor_found_at_its_lag() {
        let cfg = CorrelationConfig::default();
        let s = sales(61);
        let a = anomaly_at(&s, 30);
        // The factor on day d equals sales on day d + 3: it leads by three days.
        let leading = factor("footfall", FactorKind::Event, 61, |i| noise(i + 3));
        let ranked = CorrelationRanker::new(&cfg).rank(&a, &s, &[leading]);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].lag_days, 3);
        assert!(ranked[0].correlation_coefficient > 0.99);
        assert!(ranked[0].interpretation.contains("leading sales by 3"));
    }

    #[test]
    fn test_sparse_factor_is_excluded() {
        let cfg = CorrelationConfig::default();
        let s = sales(61);
        let a = anomaly_at(&s, 30);
        let mut sparse = factor("holiday", FactorKind::Event, 61, noise);
        sparse.points.retain(|p| (p.date - start()).num_days() % 10 == 0);
        assert!(CorrelationRanker::new(&cfg).rank(&a, &s, &[sparse]).is_empty());
    }

    #[test]
    fn test_non_significant_results_are_kept_and_flagged() {
        let cfg = CorrelationConfig {
            significance: 1e-12,
            ..CorrelationConfig::default()
        };
        let s = sales(61);
        let a = anomaly_at(&s, 30);
        let weak = factor("cpi", FactorKind::Economic, 61, |i| ((i * 13) % 7) as f64);
        let ranked = CorrelationRanker::new(&cfg).rank(&a, &s, &[weak]);
        assert_eq!(ranked.len(), 1);
        assert!(!ranked[0].significant);
        assert!(ranked[0].interpretation.ends_with("not significant"));
    }

    #[test]
    fn test_unknown_anomaly_date_yields_nothing() {
        let cfg = CorrelationConfig::default();
        let s = sales(20);
        let mut a = anomaly_at(&s, 5);
        a.date = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();
        let f = factor("t", FactorKind::Weather, 20, noise);
        assert!(CorrelationRanker::new(&cfg).rank(&a, &s, &[f]).is_empty());
    }

    #[test]
    fn test_tie_prefers_smaller_lag() {
        let a = (2, 0.8, 0.01, 20);
        let b = (-1, -0.8, 0.02, 20);
        assert!(beats(&b, &a));
        assert!(!beats(&a, &b));
    }
}
