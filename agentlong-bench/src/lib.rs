//! AgentLong long-context benchmark harness
//!
//! Runs question-answering records built from long guess-the-entity agent
//! interactions against an inference backend, extracts answers from the
//! model replies and scores them against gold answers.
//!
//! # Features
//!
//! - Eight question types over tool responses, environment feedback and
//!   final guesses, on knowledge-intensive and knowledge-free datasets
//! - OpenAI-compatible and Anthropic services, plus a local vLLM engine
//! - Bounded concurrency, retry with backoff, resumable ordered output
//! - Per-file, per-type and overall accuracy / F1 reports
//!
//! # Example
//!
//! ```no_run
//! use std::path::{Path, PathBuf};
//! use agentlong_bench::{
//!     analysis::{EvalOptions, Evaluator},
//!     config::Config,
//!     dataset::load_dataset,
//!     providers::create_backend,
//!     runner::{Executor, ExecutorConfig, RunOptions},
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?.with_env_services(std::env::vars());
//!     let (name, service) = config.select_service(None)?;
//!     let backend = create_backend(name, service)?;
//!
//!     let dataset = load_dataset("data/kf-c/count_frequency_tool.jsonl")?;
//!     let executor = Executor::new(backend, ExecutorConfig::from_settings(&config.runner));
//!     let output = Path::new("results/count_frequency_tool.jsonl");
//!     executor.run(&dataset, output, &RunOptions::default()).await?;
//!
//!     let report = Evaluator::new(EvalOptions::default())
//!         .evaluate_pairs(&[(PathBuf::from(&dataset.source), output.to_path_buf())])?;
//!     println!("overall: {:.4}", report.overall);
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod config;
pub mod dataset;
pub mod prompt;
pub mod providers;
pub mod reporting;
pub mod runner;

pub use config::Config;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::analysis::{
        parse_response, score, Answer, EvalOptions, Evaluator, MetricReport, ParseKind, Score,
    };
    pub use crate::config::{Config, ServiceConfig};
    pub use crate::dataset::{
        load_dataset, load_predictions, DatasetRecord, HistoryType, KnowledgeType,
        PredictionRecord, QuestionType,
    };
    pub use crate::prompt::{build_prompt, Prompt};
    pub use crate::providers::{
        create_backend, BackendError, CompletionRequest, CompletionResponse, InferenceBackend,
        Message,
    };
    pub use crate::reporting::{print_console_report, JsonSummary};
    pub use crate::runner::{Executor, ExecutorConfig, RunOptions, RunSummary};
}
