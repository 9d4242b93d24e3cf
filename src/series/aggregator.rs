use std::collections::BTreeMap;

use chrono::{Datelike, Days, Months, NaiveDate};
use tracing::debug;

use super::{AggregatedBucket, BucketSeries, Granularity, SalesPoint, ValidationError};

/// Resamples raw sales points into per-product bucket series.
pub struct TimeSeriesAggregator;

impl TimeSeriesAggregator {
    /// Group `points` by product and sum quantities per period.
    ///
    /// Each product's points must be non-decreasing by date. Periods between
    /// the first and last observation with no sales become zero buckets.
    pub fn aggregate(
        points: &[SalesPoint],
        granularity: Granularity,
    ) -> Result<Vec<BucketSeries>, ValidationError> {
        let mut per_product: BTreeMap<&str, Vec<&SalesPoint>> = BTreeMap::new();
        for p in points {
            per_product.entry(p.product_id.as_str()).or_default().push(p);
        }

        // Validate everything before building anything.
        for (product, pts) in &per_product {
            for pair in pts.windows(2) {
                if pair[1].date < pair[0].date {
                    return Err(ValidationError::NonMonotonic {
                        product: product.to_string(),
                        previous: pair[0].date,
                        next: pair[1].date,
                    });
                }
            }
            if let Some(p) = pts.iter().find(|p| !p.quantity.is_finite()) {
                return Err(ValidationError::NonFinite {
                    product: product.to_string(),
                    date: p.date,
                });
            }
        }

        let mut out = Vec::with_capacity(per_product.len());
        for (product, pts) in per_product {
            out.push(Self::aggregate_product(product, &pts, granularity));
        }
        Ok(out)
    }

    fn aggregate_product(
        product: &str,
        points: &[&SalesPoint],
        granularity: Granularity,
    ) -> BucketSeries {
        let mut sums: BTreeMap<NaiveDate, f64> = BTreeMap::new();
        for p in points {
            *sums.entry(period_start(p.date, granularity)).or_default() += p.quantity;
        }

        let mut buckets = Vec::new();
        if let (Some(&first), Some(&last)) = (sums.keys().next(), sums.keys().next_back()) {
            let mut start = first;
            while start <= last {
                let end = period_end(start, granularity);
                buckets.push(AggregatedBucket {
                    period_start: start,
                    period_end: end,
                    granularity,
                    aggregate_value: sums.get(&start).copied().unwrap_or(0.0),
                });
                match end.succ_opt() {
                    Some(next) => start = next,
                    None => break,
                }
            }
        }

        debug!(product, %granularity, buckets = buckets.len(), "aggregated series");
        BucketSeries {
            product_id: product.to_string(),
            granularity,
            buckets,
        }
    }
}

/// First day of the period containing `date`.
pub fn period_start(date: NaiveDate, granularity: Granularity) -> NaiveDate {
    match granularity {
        Granularity::Day => date,
        Granularity::Week => date - Days::new(u64::from(date.weekday().num_days_from_monday())),
        Granularity::Month => date.with_day(1).unwrap_or(date),
    }
}

/// Last day (inclusive) of the period starting at `start`.
pub fn period_end(start: NaiveDate, granularity: Granularity) -> NaiveDate {
    let next = match granularity {
        Granularity::Day => start.checked_add_days(Days::new(1)),
        Granularity::Week => start.checked_add_days(Days::new(7)),
        Granularity::Month => start.checked_add_months(Months::new(1)),
    };
    next.and_then(|n| n.pred_opt()).unwrap_or(start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn sp(date: NaiveDate, product: &str, quantity: f64) -> SalesPoint {
        SalesPoint {
            date,
            product_id: product.to_string(),
            quantity,
        }
    }

    #[test]
    fn test_daily_sums_and_fills_gaps() {
        let points = vec![
            sp(d(2024, 3, 1), "A", 5.0),
            sp(d(2024, 3, 1), "A", 2.0),
            sp(d(2024, 3, 3), "A", 4.0),
        ];
        let series = TimeSeriesAggregator::aggregate(&points, Granularity::Day).unwrap();
        assert_eq!(series.len(), 1);
        let values: Vec<f64> = series[0].buckets.iter().map(|b| b.aggregate_value).collect();
        assert_eq!(values, vec![7.0, 0.0, 4.0]);
    }

    #[test]
    fn test_weekly_periods_start_on_monday() {
        // 2024-03-13 is a Wednesday.
        assert_eq!(period_start(d(2024, 3, 13), Granularity::Week), d(2024, 3, 11));
        assert_eq!(period_end(d(2024, 3, 11), Granularity::Week), d(2024, 3, 17));

        let points = vec![sp(d(2024, 3, 11), "A", 1.0), sp(d(2024, 3, 17), "A", 2.0)];
        let series = TimeSeriesAggregator::aggregate(&points, Granularity::Week).unwrap();
        assert_eq!(series[0].buckets.len(), 1);
        assert_eq!(series[0].buckets[0].aggregate_value, 3.0);
    }

    #[test]
    fn test_monthly_handles_leap_february() {
        assert_eq!(period_end(d(2024, 2, 1), Granularity::Month), d(2024, 2, 29));
        let points = vec![sp(d(2024, 1, 31), "A", 1.0), sp(d(2024, 3, 2), "A", 1.0)];
        let series = TimeSeriesAggregator::aggregate(&points, Granularity::Month).unwrap();
        let starts: Vec<NaiveDate> = series[0].buckets.iter().map(|b| b.period_start).collect();
        assert_eq!(starts, vec![d(2024, 1, 1), d(2024, 2, 1), d(2024, 3, 1)]);
    }

    #[test]
    fn test_products_are_kept_apart() {
        let points = vec![
            sp(d(2024, 3, 2), "B", 1.0),
            sp(d(2024, 3, 1), "A", 1.0),
            sp(d(2024, 3, 3), "B", 1.0),
        ];
        let series = TimeSeriesAggregator::aggregate(&points, Granularity::Day).unwrap();
        let ids: Vec<&str> = series.iter().map(|s| s.product_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[test]
    fn test_backwards_dates_are_rejected() {
        let points = vec![sp(d(2024, 3, 2), "A", 1.0), sp(d(2024, 3, 1), "A", 1.0)];
        let err = TimeSeriesAggregator::aggregate(&points, Granularity::Day).unwrap_err();
        assert!(matches!(err, ValidationError::NonMonotonic { .. }));
    }

    #[test]
    fn test_nan_quantity_is_rejected() {
        let points = vec![sp(d(2024, 3, 1), "A", f64::NAN)];
        assert!(TimeSeriesAggregator::aggregate(&points, Granularity::Day).is_err());
    }
}
