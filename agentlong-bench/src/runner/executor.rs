//! Async inference runner over a dataset file

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::sleep;

use super::writer::{spawn_writer, write_predictions_atomic};
use crate::analysis::parse_response;
use crate::config::RunnerSettings;
use crate::dataset::{load_predictions, DatasetRecord, LoadError, LoadedDataset, PredictionRecord};
use crate::prompt::build_prompt;
use crate::providers::{BackendError, CompletionRequest, CompletionResponse, InferenceBackend};

/// Sampling parameters sent with every request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stream: bool,
    pub extra_params: Map<String, Value>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: Some(0.7),
            top_p: None,
            stream: true,
            extra_params: Map::new(),
        }
    }
}

/// Configuration for the executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum in-flight backend calls
    pub workers: usize,
    /// Number of retries on transient failure
    pub retry_count: u32,
    /// Initial retry delay in milliseconds
    pub retry_delay_ms: u64,
    /// Maximum retry delay in milliseconds
    pub max_retry_delay_ms: u64,
    /// Per-call timeout in milliseconds
    pub timeout_ms: u64,
    pub params: GenerationParams,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_settings(&RunnerSettings::default())
    }
}

impl ExecutorConfig {
    pub fn from_settings(settings: &RunnerSettings) -> Self {
        Self {
            workers: settings.workers.max(1),
            retry_count: settings.retry_count,
            retry_delay_ms: settings.retry_delay_ms,
            max_retry_delay_ms: settings.max_retry_delay_ms,
            timeout_ms: settings.timeout_ms,
            params: GenerationParams {
                max_tokens: settings.max_tokens,
                temperature: Some(settings.temperature),
                top_p: settings.top_p,
                stream: settings.stream,
                extra_params: settings.extra_params.clone(),
            },
        }
    }
}

/// Which records to run and whether to keep earlier output
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub offset: usize,
    pub limit: Option<usize>,
    pub resume: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: None,
            resume: true,
        }
    }
}

/// Outcome counts of one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub output: PathBuf,
    /// Records in the offset/limit window
    pub selected: usize,
    /// Already completed in the existing output
    pub skipped: usize,
    pub attempted: usize,
    /// Backend returned text
    pub answered: usize,
    /// Failed after all retries
    pub failed: usize,
    /// Answered, but no answer could be extracted
    pub unparseable: usize,
}

/// Error type for a run as a whole
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot read existing predictions: {0}")]
    Resume(#[from] LoadError),

    #[error("Writer task failed: {0}")]
    Writer(String),
}

/// Slice of `records` starting at `offset`, at most `limit` long
pub fn select_records(
    records: &[DatasetRecord],
    offset: usize,
    limit: Option<usize>,
) -> &[DatasetRecord] {
    let start = offset.min(records.len());
    let end = match limit {
        Some(limit) => start.saturating_add(limit).min(records.len()),
        None => records.len(),
    };
    &records[start..end]
}

/// Doubled backoff delay, capped at `max_ms`
fn next_delay(delay_ms: u64, max_ms: u64) -> u64 {
    delay_ms.saturating_mul(2).min(max_ms)
}

/// Executor for running a dataset against one backend
pub struct Executor {
    config: ExecutorConfig,
    backend: Arc<dyn InferenceBackend>,
    semaphore: Arc<Semaphore>,
    progress: Arc<dyn ProgressCallback>,
}

impl Executor {
    /// Create a new executor
    pub fn new(backend: Arc<dyn InferenceBackend>, config: ExecutorConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            config,
            backend,
            semaphore,
            progress: Arc::new(NoOpProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Run the selected records and write one prediction per record to `output`
    ///
    /// With `resume`, records that already have a response in `output` are
    /// skipped and the merged file is rewritten in dataset order at the end.
    pub async fn run(
        &self,
        dataset: &LoadedDataset,
        output: &Path,
        options: &RunOptions,
    ) -> Result<RunSummary, RunError> {
        let selected = select_records(&dataset.records, options.offset, options.limit);

        let existing = if options.resume && output.exists() {
            load_predictions(output)?.records
        } else {
            Vec::new()
        };
        let completed: HashSet<String> = existing
            .iter()
            .filter(|p| p.is_completed())
            .filter_map(|p| p.key())
            .collect();

        let pending: Vec<DatasetRecord> = selected
            .iter()
            .filter(|r| r.key().map_or(true, |k| !completed.contains(&k)))
            .cloned()
            .collect();

        let mut summary = RunSummary {
            output: output.to_path_buf(),
            selected: selected.len(),
            skipped: selected.len() - pending.len(),
            attempted: pending.len(),
            ..RunSummary::default()
        };
        tracing::info!(
            "{}: {} selected, {} already completed, {} to run on {} with {} workers",
            dataset.source,
            summary.selected,
            summary.skipped,
            summary.attempted,
            self.backend.name(),
            self.config.workers
        );

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| RunError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(!existing.is_empty())
            .truncate(existing.is_empty())
            .open(output)
            .map_err(|source| RunError::Io {
                path: output.to_path_buf(),
                source,
            })?;

        let (tx, rx) = mpsc::channel(self.config.workers.max(1) * 2);
        let writer = spawn_writer(file, rx);
        let finished = Arc::new(AtomicUsize::new(0));
        let total = pending.len();

        let mut handles = Vec::with_capacity(total);
        for (seq, record) in pending.into_iter().enumerate() {
            let worker = self.clone_for_task();
            let tx = tx.clone();
            let finished = finished.clone();

            handles.push(tokio::spawn(async move {
                let prediction = worker.predict(&record).await;
                let outcome = (prediction.is_completed(), prediction.pred_answer.is_unparseable());
                worker.progress.on_record_complete(&prediction.id, outcome.0);
                worker
                    .progress
                    .on_progress(finished.fetch_add(1, Ordering::SeqCst) + 1, total);
                if tx.send((seq, prediction)).await.is_err() {
                    tracing::error!("Writer closed before record {} was written", record.id);
                }
                outcome
            }));
        }
        drop(tx);

        for handle in handles {
            match handle.await {
                Ok((true, unparseable)) => {
                    summary.answered += 1;
                    if unparseable {
                        summary.unparseable += 1;
                    }
                }
                Ok((false, _)) => summary.failed += 1,
                Err(e) => {
                    tracing::error!("Record task panicked: {}", e);
                    summary.failed += 1;
                }
            }
        }

        let written = writer
            .await
            .map_err(|e| RunError::Writer(e.to_string()))?
            .map_err(|source| RunError::Io {
                path: output.to_path_buf(),
                source,
            })?;
        tracing::debug!("Wrote {} predictions to {}", written, output.display());

        if !existing.is_empty() {
            self.rewrite_in_dataset_order(dataset, output)?;
        }

        tracing::info!(
            "{}: {} answered ({} unparseable), {} failed, {} skipped",
            output.display(),
            summary.answered,
            summary.unparseable,
            summary.failed,
            summary.skipped
        );
        Ok(summary)
    }

    /// Put a resumed output back into dataset order, keeping one line per record
    fn rewrite_in_dataset_order(&self, dataset: &LoadedDataset, output: &Path) -> Result<(), RunError> {
        let mut by_key: HashMap<String, PredictionRecord> = HashMap::new();
        let mut unkeyed = Vec::new();
        for prediction in load_predictions(output)?.records {
            match prediction.key() {
                Some(key) => {
                    // A completed line wins over a failed one for the same record
                    let keep_old = by_key
                        .get(&key)
                        .is_some_and(|old| old.is_completed() && !prediction.is_completed());
                    if !keep_old {
                        by_key.insert(key, prediction);
                    }
                }
                None => unkeyed.push(prediction),
            }
        }

        let mut ordered = Vec::with_capacity(by_key.len() + unkeyed.len());
        for record in &dataset.records {
            if let Some(prediction) = record.key().and_then(|k| by_key.remove(&k)) {
                ordered.push(prediction);
            }
        }
        let mut leftovers: Vec<PredictionRecord> = by_key.into_values().collect();
        leftovers.sort_by(|a, b| a.id.cmp(&b.id));
        ordered.extend(leftovers);
        ordered.extend(unkeyed);

        write_predictions_atomic(output, &ordered).map_err(|source| RunError::Io {
            path: output.to_path_buf(),
            source,
        })
    }

    /// Build the prompt, call the backend and parse the reply for one record
    ///
    /// Never fails: errors end up in the prediction's `error` field.
    pub async fn predict(&self, record: &DatasetRecord) -> PredictionRecord {
        let prompt = match build_prompt(record) {
            Ok(prompt) => prompt,
            Err(e) => {
                tracing::warn!("Skipping record {}: {}", record.id, e);
                return PredictionRecord::failed(record, e.to_string());
            }
        };

        let params = &self.config.params;
        let request = CompletionRequest::new(prompt.messages)
            .with_max_tokens(params.max_tokens)
            .with_temperature(params.temperature)
            .with_top_p(params.top_p)
            .with_stream(params.stream)
            .with_extra_params(params.extra_params.clone());

        match self.complete_with_retry(&request, &record.id).await {
            Ok(response) => {
                let parsed = parse_response(record.question_type, record.history_type, &response.content);
                tracing::debug!(
                    "Record {}: {} output tokens in {}ms, parsed as {}",
                    record.id,
                    response.output_tokens,
                    response.latency_ms,
                    parsed.kind.as_str()
                );
                PredictionRecord::answered(record, parsed, response.content)
            }
            Err(e) => PredictionRecord::failed(record, e.to_string()),
        }
    }

    /// Call the backend, retrying transient failures with exponential backoff
    async fn complete_with_retry(
        &self,
        request: &CompletionRequest,
        record_id: &str,
    ) -> Result<CompletionResponse, BackendError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| BackendError::Config("worker pool closed".to_string()))?;

        let mut last_error = None;
        let mut delay = self.config.retry_delay_ms;

        for attempt in 0..=self.config.retry_count {
            if attempt > 0 {
                tracing::info!(
                    "Retry {} for record {} on {}",
                    attempt,
                    record_id,
                    self.backend.name()
                );
                sleep(Duration::from_millis(delay)).await;
                delay = next_delay(delay, self.config.max_retry_delay_ms);
            }

            match self.try_complete(request).await {
                Ok(response) => return Ok(response),
                Err(BackendError::RateLimited { retry_after_ms }) => {
                    let wait = retry_after_ms.min(self.config.max_retry_delay_ms);
                    tracing::warn!(
                        "Rate limited on {}, waiting {}ms",
                        self.backend.name(),
                        wait
                    );
                    sleep(Duration::from_millis(wait)).await;
                    last_error = Some(BackendError::RateLimited { retry_after_ms });
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        "Transient error on {} for record {}: {}",
                        self.backend.name(),
                        record_id,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    tracing::error!(
                        "Error on {} for record {}: {}",
                        self.backend.name(),
                        record_id,
                        e
                    );
                    return Err(e);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| BackendError::Config("no attempts made".to_string()));
        tracing::error!(
            "Giving up on record {} after {} attempts: {}",
            record_id,
            self.config.retry_count + 1,
            error
        );
        Err(error)
    }

    /// Single attempt, bounded by the per-call timeout
    async fn try_complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, BackendError> {
        let timeout = Duration::from_millis(self.config.timeout_ms);

        match tokio::time::timeout(timeout, self.backend.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                timeout_ms: self.config.timeout_ms,
            }),
        }
    }

    /// Clone the executor for spawning tasks
    fn clone_for_task(&self) -> Self {
        Self {
            config: self.config.clone(),
            backend: self.backend.clone(),
            semaphore: self.semaphore.clone(),
            progress: self.progress.clone(),
        }
    }
}

/// Progress callback for tracking execution
pub trait ProgressCallback: Send + Sync {
    fn on_record_complete(&self, record_id: &str, answered: bool);
    fn on_progress(&self, completed: usize, total: usize);
}

/// Default no-op progress callback
pub struct NoOpProgress;

impl ProgressCallback for NoOpProgress {
    fn on_record_complete(&self, _record_id: &str, _answered: bool) {}
    fn on_progress(&self, _completed: usize, _total: usize) {}
}

/// Console progress callback, one line every `every` records
pub struct ConsoleProgress {
    pub every: usize,
}

impl ProgressCallback for ConsoleProgress {
    fn on_record_complete(&self, record_id: &str, answered: bool) {
        if !answered {
            println!("  FAILED {}", record_id);
        }
    }

    fn on_progress(&self, completed: usize, total: usize) {
        if completed == total || completed % self.every.max(1) == 0 {
            println!("Progress: {}/{} records complete", completed, total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{HistoryType, KnowledgeType, QuestionType};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn records(n: usize) -> Vec<DatasetRecord> {
        (0..n)
            .map(|i| {
                DatasetRecord::new(
                    format!("r{}", i),
                    QuestionType::CountFrequencyTool,
                    KnowledgeType::Free,
                    HistoryType::Concise,
                    "How many?",
                )
            })
            .collect()
    }

    /// Fails with the queued errors first, then answers
    struct FlakyBackend {
        errors: Mutex<Vec<BackendError>>,
        calls: AtomicUsize,
    }

    impl FlakyBackend {
        fn new(errors: Vec<BackendError>) -> Self {
            Self {
                errors: Mutex::new(errors),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl InferenceBackend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        fn default_model(&self) -> &str {
            "test"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.errors.lock().unwrap().pop() {
                return Err(error);
            }
            Ok(CompletionResponse {
                content: "<answer>4</answer>".to_string(),
                ..CompletionResponse::default()
            })
        }
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            retry_delay_ms: 1,
            max_retry_delay_ms: 5,
            ..ExecutorConfig::default()
        }
    }

    #[test]
    fn test_backoff_doubles_and_saturates() {
        assert_eq!(next_delay(1_000, 60_000), 2_000);
        assert_eq!(next_delay(40_000, 60_000), 60_000);
        assert_eq!(next_delay(u64::MAX / 2 + 1, u64::MAX), u64::MAX);
    }

    #[test]
    fn test_select_records_window() {
        let all = records(20);
        assert_eq!(select_records(&all, 0, Some(5)).len(), 5);
        assert_eq!(select_records(&all, 18, Some(5)).len(), 2);
        assert_eq!(select_records(&all, 25, None).len(), 0);
        assert_eq!(select_records(&all, 3, None)[0].id, "r3");
    }

    #[test]
    fn test_config_from_settings() {
        let settings = RunnerSettings {
            workers: 0,
            max_tokens: Some(256),
            ..RunnerSettings::default()
        };
        let config = ExecutorConfig::from_settings(&settings);
        assert_eq!(config.workers, 1);
        assert_eq!(config.params.max_tokens, Some(256));
        assert_eq!(config.params.temperature, Some(0.7));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let backend = Arc::new(FlakyBackend::new(vec![
            BackendError::Api { status: 503, message: "overloaded".to_string() },
            BackendError::Stream("reset".to_string()),
        ]));
        let executor = Executor::new(backend.clone(), config());
        let prediction = executor.predict(&records(1)[0]).await;
        assert!(prediction.is_completed());
        assert!(prediction.error.is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let backend = Arc::new(FlakyBackend::new(vec![BackendError::Api {
            status: 400,
            message: "context length exceeded".to_string(),
        }]));
        let executor = Executor::new(backend.clone(), config());
        let prediction = executor.predict(&records(1)[0]).await;
        assert!(!prediction.is_completed());
        assert!(prediction.error.unwrap().contains("context length"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_wait_is_capped() {
        let backend = Arc::new(FlakyBackend::new(vec![BackendError::RateLimited {
            retry_after_ms: 60_000,
        }]));
        let executor = Executor::new(backend.clone(), config());
        let prediction =
            tokio::time::timeout(Duration::from_secs(5), executor.predict(&records(1)[0]))
                .await
                .unwrap();
        assert!(prediction.is_completed());
    }
}
