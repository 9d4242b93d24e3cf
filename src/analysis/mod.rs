//! Lagged correlation ranking and the batch pipeline that ties detection,
//! ranking and hypothesis generation together.

pub mod correlation;
pub mod runner;
pub mod stats;

pub use self::correlation::{CorrelationRanker, CorrelationResult, RankingAudit};
pub use self::runner::{analyze, AnalysisReport, AnomalyAnalysis, PipelineFailure};
