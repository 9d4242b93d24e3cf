use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::analysis::correlation::{CorrelationRanker, CorrelationResult};
use crate::config::Config;
use crate::detect::{Anomaly, AnomalyDetector, AnomalyKey, DetectError};
use crate::hypothesis::{Hypothesis, HypothesisGenerator, TemplateTable};
use crate::series::{
    BucketSeries, ExogenousSeries, Granularity, SalesPoint, TimeSeriesAggregator,
};

/// Everything the pipeline learned about one anomaly.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyAnalysis {
    pub anomaly: Anomaly,
    pub correlations: Vec<CorrelationResult>,
    /// Per-series winners cut by top-K, kept for audit.
    pub discarded: Vec<CorrelationResult>,
    pub hypotheses: Vec<Hypothesis>,
}

/// A product or anomaly the pipeline could not process.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineFailure {
    pub product_id: String,
    pub anomaly: Option<AnomalyKey>,
    pub stage: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub granularity: Granularity,
    pub products_scanned: usize,
    pub analyses: Vec<AnomalyAnalysis>,
    pub failures: Vec<PipelineFailure>,
}

/// Run the full pipeline over a batch of sales points:
/// 1. Validate the exogenous series (the whole call fails on bad input)
/// 2. Aggregate and detect per product, in parallel
/// 3. Rank correlations and generate hypotheses per anomaly, in parallel
///
/// A failing product or anomaly is reported in `failures` and does not
/// affect the others.
pub async fn analyze(
    config: Arc<Config>,
    templates: Arc<TemplateTable>,
    points: Vec<SalesPoint>,
    exogenous: Arc<Vec<ExogenousSeries>>,
    granularity: Granularity,
) -> Result<AnalysisReport> {
    for series in exogenous.iter() {
        series
            .validate()
            .with_context(|| format!("Invalid exogenous series '{}'", series.series_id))?;
    }

    let mut per_product: BTreeMap<String, Vec<SalesPoint>> = BTreeMap::new();
    for p in points {
        per_product.entry(p.product_id.clone()).or_default().push(p);
    }
    let products_scanned = per_product.len();
    info!(products = products_scanned, %granularity, "Starting analysis");

    // Stage 1: aggregate + detect.
    let detections = join_all(per_product.into_iter().map(|(product, pts)| {
        let config = config.clone();
        async move {
            let outcome = tokio::task::spawn_blocking(move || detect_product(&config, &pts, granularity))
                .await;
            (product, outcome)
        }
    }))
    .await;

    let mut failures = Vec::new();
    let mut work: Vec<(Arc<BucketSeries>, Anomaly)> = Vec::new();
    for (product, outcome) in detections {
        match outcome {
            Ok(Ok(Some((series, anomalies)))) => {
                let series = Arc::new(series);
                work.extend(anomalies.into_iter().map(|a| (series.clone(), a)));
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                warn!(product = %product, error = %e, "detection failed");
                failures.push(PipelineFailure {
                    product_id: product,
                    anomaly: None,
                    stage: "detect",
                    error: e.to_string(),
                });
            }
            Err(e) => failures.push(PipelineFailure {
                product_id: product,
                anomaly: None,
                stage: "detect",
                error: e.to_string(),
            }),
        }
    }

    // Stage 2: rank + hypothesize.
    let explained = join_all(work.into_iter().map(|(series, anomaly)| {
        let config = config.clone();
        let templates = templates.clone();
        let exogenous = exogenous.clone();
        let key = anomaly.key();
        async move {
            let outcome = tokio::task::spawn_blocking(move || {
                explain(&config, &templates, &series, &exogenous, anomaly)
            })
            .await;
            (key, outcome)
        }
    }))
    .await;

    let mut analyses = Vec::new();
    for (key, outcome) in explained {
        match outcome {
            Ok(a) => analyses.push(a),
            Err(e) => {
                warn!(anomaly = %key, error = %e, "ranking failed");
                failures.push(PipelineFailure {
                    product_id: key.product_id.clone(),
                    anomaly: Some(key),
                    stage: "rank",
                    error: e.to_string(),
                });
            }
        }
    }

    info!(
        anomalies = analyses.len(),
        failures = failures.len(),
        "Analysis complete"
    );
    Ok(AnalysisReport {
        granularity,
        products_scanned,
        analyses,
        failures,
    })
}

/// `None` when the product has too little history to judge.
fn detect_product(
    config: &Config,
    points: &[SalesPoint],
    granularity: Granularity,
) -> Result<Option<(BucketSeries, Vec<Anomaly>)>, DetectError> {
    let Some(series) = TimeSeriesAggregator::aggregate(points, granularity)?
        .into_iter()
        .next()
    else {
        return Ok(None);
    };
    match AnomalyDetector::new(&config.detection).detect(&series, granularity) {
        Ok(anomalies) => Ok(Some((series, anomalies))),
        Err(DetectError::InsufficientBaseline { needed, have }) => {
            info!(product = %series.product_id, needed, have, "skipping product: insufficient baseline");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn explain(
    config: &Config,
    templates: &TemplateTable,
    series: &BucketSeries,
    exogenous: &[ExogenousSeries],
    anomaly: Anomaly,
) -> AnomalyAnalysis {
    let ranker = CorrelationRanker::new(&config.correlation);
    let audit = ranker.rank_with_lags(&anomaly, series, exogenous, ranker.default_lags());
    let hypotheses = HypothesisGenerator::new(&config.hypothesis, templates).generate(&anomaly, &audit.top);
    AnomalyAnalysis {
        anomaly,
        correlations: audit.top,
        discarded: audit.discarded,
        hypotheses,
    }
}
