//! Answer parsing, scoring and evaluation

pub mod evaluator;
pub mod metrics;
pub mod parser;
pub mod scoring;

pub use evaluator::{EvalError, EvalOptions, Evaluator};
pub use metrics::{FileMetrics, MetricReport, TypeSummary};
pub use parser::{parse_response, Answer, ParseKind, ParsedAnswer};
pub use scoring::{metric_name, normalize_name, score, Score, UnusableGold};
