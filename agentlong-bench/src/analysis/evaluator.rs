//! Prediction evaluation against dataset gold answers

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use super::metrics::{FileMetrics, MetricReport};
use super::parser::{parse_response, Answer};
use super::scoring::{score, Score};
use crate::dataset::{
    load_dataset, load_predictions, HistoryType, LoadError, LoadedDataset, LoadedPredictions,
    PredictionRecord, QuestionType,
};

/// Error type for evaluation
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("Dataset {path}: {source}")]
    Dataset {
        path: String,
        #[source]
        source: LoadError,
    },

    #[error("Predictions {path}: {source}")]
    Predictions {
        path: String,
        #[source]
        source: LoadError,
    },

    #[error("No dataset/prediction pairs given")]
    NoInputs,
}

/// Evaluation switches
#[derive(Debug, Clone, Default)]
pub struct EvalOptions {
    /// Parse `raw_response` again even when the prediction carries a parsed answer
    pub reparse: bool,
}

/// Scores prediction files against their datasets
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    options: EvalOptions,
}

impl Evaluator {
    pub fn new(options: EvalOptions) -> Self {
        Self { options }
    }

    /// Evaluate several dataset/prediction pairs into one report
    pub fn evaluate_pairs(&self, pairs: &[(PathBuf, PathBuf)]) -> Result<MetricReport, EvalError> {
        if pairs.is_empty() {
            return Err(EvalError::NoInputs);
        }

        let mut files = Vec::with_capacity(pairs.len());
        for (dataset, predictions) in pairs {
            files.push(self.evaluate_file(dataset, predictions)?);
        }
        Ok(MetricReport::from_files(files))
    }

    /// Evaluate one prediction file
    pub fn evaluate_file(
        &self,
        dataset_path: &Path,
        predictions_path: &Path,
    ) -> Result<FileMetrics, EvalError> {
        let dataset = load_dataset(dataset_path).map_err(|source| EvalError::Dataset {
            path: dataset_path.display().to_string(),
            source,
        })?;
        let predictions = load_predictions(predictions_path).map_err(|source| EvalError::Predictions {
            path: predictions_path.display().to_string(),
            source,
        })?;

        tracing::info!(
            "Evaluating {} ({} records) against {} ({} predictions)",
            dataset.source,
            dataset.len(),
            predictions_path.display(),
            predictions.records.len()
        );

        Ok(self.score_predictions(
            &dataset,
            &predictions,
            &predictions_path.display().to_string(),
        ))
    }

    /// Score already-loaded predictions; never fails
    pub fn score_predictions(
        &self,
        dataset: &LoadedDataset,
        predictions: &LoadedPredictions,
        predictions_source: &str,
    ) -> FileMetrics {
        let mut metrics = FileMetrics::new(
            dataset.source.clone(),
            predictions_source,
            dataset.question_type,
            dataset.knowledge_type,
            dataset.history_type,
        );
        metrics.malformed = predictions.malformed;

        let mut by_key: HashMap<String, &PredictionRecord> = HashMap::new();
        for pred in &predictions.records {
            match pred.key() {
                Some(key) => {
                    if by_key.insert(key.clone(), pred).is_some() {
                        tracing::warn!("Duplicate prediction for '{}', keeping the last one", key);
                    }
                }
                None => metrics.unmatched += 1,
            }
        }

        let mut used = HashSet::new();
        for record in &dataset.records {
            let found = record
                .key()
                .and_then(|key| by_key.get(&key).map(|p| (key, *p)))
                .or_else(|| {
                    record
                        .round_key()
                        .and_then(|key| by_key.get(&key).map(|p| (key, *p)))
                });

            let Some((key, pred)) = found else {
                tracing::warn!("Missing prediction for '{}', scored as incorrect", record.id);
                metrics.missing += 1;
                metrics.record(Score::zero());
                continue;
            };
            used.insert(key);
            metrics.matched += 1;

            let answer = self.answer_for(pred, record.question_type, record.history_type);
            if answer.is_unparseable() {
                metrics.unparseable += 1;
            }

            let result = score(
                record.question_type,
                record.knowledge_type,
                record.history_type,
                &answer,
                &record.gold_answer,
            );
            match result {
                Ok(s) => metrics.record(s),
                Err(e) => {
                    tracing::warn!("Record '{}': {}", record.id, e);
                    metrics.unusable_gold += 1;
                    metrics.record(Score::zero());
                }
            }
        }

        metrics.unmatched += by_key.keys().filter(|k| !used.contains(*k)).count();
        if metrics.unmatched > 0 {
            tracing::warn!(
                "{} predictions in {} match no dataset record",
                metrics.unmatched,
                predictions_source
            );
        }

        metrics
    }

    fn answer_for(
        &self,
        pred: &PredictionRecord,
        question_type: QuestionType,
        history: HistoryType,
    ) -> Answer {
        if pred.parse_kind.is_some() && !self.options.reparse {
            return pred.pred_answer.clone();
        }
        parse_response(question_type, history, &pred.raw_response).answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ParseKind;
    use crate::dataset::{parse_dataset_str, parse_predictions_str};

    const DATASET: &str = r#"{"id": "a", "question_type": "CountFrequency_Tool", "knowledge_type": "ki", "history_type": "c", "question": "q", "gold_answer": 3}
{"id": "b", "question_type": "CountFrequency_Tool", "knowledge_type": "ki", "history_type": "c", "question": "q", "gold_answer": 5}
{"id": "c", "question_type": "CountFrequency_Tool", "knowledge_type": "ki", "history_type": "c", "question": "q", "gold_answer": 7}"#;

    fn dataset() -> LoadedDataset {
        parse_dataset_str(DATASET, None).unwrap()
    }

    #[test]
    fn test_missing_and_malformed_predictions() {
        let preds = parse_predictions_str(
            r#"{"id": "a", "question_type": "CountFrequency_Tool", "pred_answer": 3, "parse_kind": "boxed", "raw_response": "\\boxed{3}"}
garbage line
{"id": "zz", "question_type": "CountFrequency_Tool", "pred_answer": 1, "parse_kind": "boxed", "raw_response": "1"}"#,
            "p.jsonl",
        );
        let m = Evaluator::default().score_predictions(&dataset(), &preds, "p.jsonl");
        assert_eq!(m.total, 3);
        assert_eq!(m.matched, 1);
        assert_eq!(m.missing, 2);
        assert_eq!(m.unmatched, 1);
        assert_eq!(m.malformed, 1);
        assert!((m.score - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_unparsed_predictions_are_parsed() {
        let preds = parse_predictions_str(
            r#"{"id": "b", "question_type": "CountFrequency_Tool", "raw_response": "It appears <answer>5</answer> times"}"#,
            "p.jsonl",
        );
        let m = Evaluator::default().score_predictions(&dataset(), &preds, "p.jsonl");
        assert_eq!(m.correct, 1.0);
        assert_eq!(m.unparseable, 0);
    }

    #[test]
    fn test_reparse_overrides_stored_answer() {
        let mut pred = PredictionRecord {
            id: "c".to_string(),
            sample_id: None,
            question_type: QuestionType::CountFrequencyTool,
            pred_answer: Answer::Integer(1),
            parse_kind: Some(ParseKind::LastInteger),
            raw_response: "<answer>7</answer>".to_string(),
            round: None,
            i_round: None,
            j_round: None,
            error: None,
        };
        let preds = LoadedPredictions {
            records: vec![pred.clone()],
            malformed: 0,
        };
        let stored = Evaluator::default().score_predictions(&dataset(), &preds, "p");
        assert_eq!(stored.correct, 0.0);

        let reparsed = Evaluator::new(EvalOptions { reparse: true }).score_predictions(&dataset(), &preds, "p");
        assert_eq!(reparsed.correct, 1.0);

        pred.raw_response.clear();
        pred.pred_answer = Answer::Unparseable;
        let preds = LoadedPredictions { records: vec![pred], malformed: 0 };
        let m = Evaluator::default().score_predictions(&dataset(), &preds, "p");
        assert_eq!(m.unparseable, 1);
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data.jsonl");
        let preds = dir.path().join("preds.jsonl");
        std::fs::write(&data, DATASET).unwrap();
        std::fs::write(
            &preds,
            "{\"id\": \"a\", \"question_type\": \"CountFrequency_Tool\", \"raw_response\": \"3\"}\n",
        )
        .unwrap();

        let evaluator = Evaluator::default();
        let pairs = vec![(data, preds)];
        let first = evaluator.evaluate_pairs(&pairs).unwrap();
        let second = evaluator.evaluate_pairs(&pairs).unwrap();
        assert_eq!(first, second);
        assert!(matches!(evaluator.evaluate_pairs(&[]), Err(EvalError::NoInputs)));
    }
}
