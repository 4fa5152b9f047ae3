//! Inference runner: worker pool, retries and ordered output

pub mod executor;
pub mod rate_limiter;
pub mod writer;

pub use executor::{
    select_records, ConsoleProgress, Executor, ExecutorConfig, GenerationParams, NoOpProgress,
    ProgressCallback, RunError, RunOptions, RunSummary,
};
pub use rate_limiter::RateLimiter;
pub use writer::{spawn_writer, write_predictions_atomic, PredictionWriter};
