//! Metric report aggregation

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::scoring::{metric_name, Score};
use crate::dataset::{HistoryType, KnowledgeType, QuestionType};

/// Metrics for one evaluated dataset/prediction pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetrics {
    pub dataset: String,
    pub predictions: String,
    pub question_type: QuestionType,
    pub knowledge_type: KnowledgeType,
    pub history_type: HistoryType,
    /// `accuracy` or `f1`
    pub metric: String,
    pub score: f64,
    /// Sum of credit; fractional for partial-credit types
    pub correct: f64,
    pub total: usize,
    pub matched: usize,
    pub missing: usize,
    pub unmatched: usize,
    pub unparseable: usize,
    pub malformed: usize,
    pub unusable_gold: usize,
}

impl FileMetrics {
    pub fn new(
        dataset: impl Into<String>,
        predictions: impl Into<String>,
        question_type: QuestionType,
        knowledge_type: KnowledgeType,
        history_type: HistoryType,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            predictions: predictions.into(),
            question_type,
            knowledge_type,
            history_type,
            metric: metric_name(question_type, history_type).to_string(),
            score: 0.0,
            correct: 0.0,
            total: 0,
            matched: 0,
            missing: 0,
            unmatched: 0,
            unparseable: 0,
            malformed: 0,
            unusable_gold: 0,
        }
    }

    /// Count one scored record
    pub fn record(&mut self, score: Score) {
        self.total += 1;
        self.correct += score.credit;
        self.score = self.correct / self.total as f64;
    }
}

/// Aggregate over all files of one question type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeSummary {
    pub metric: String,
    pub files: usize,
    pub total: usize,
    pub correct: f64,
    pub score: f64,
}

/// Evaluation result for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    pub files: Vec<FileMetrics>,
    /// Keyed by question type label, in first-seen order
    pub by_question_type: IndexMap<String, TypeSummary>,
    pub total: usize,
    pub correct: f64,
    /// Unweighted mean credit across every record of every file
    pub overall: f64,
}

impl MetricReport {
    pub fn from_files(files: Vec<FileMetrics>) -> Self {
        let mut by_question_type: IndexMap<String, TypeSummary> = IndexMap::new();
        for file in &files {
            let entry = by_question_type
                .entry(file.question_type.label().to_string())
                .or_insert_with(|| TypeSummary {
                    metric: file.metric.clone(),
                    files: 0,
                    total: 0,
                    correct: 0.0,
                    score: 0.0,
                });
            entry.files += 1;
            entry.total += file.total;
            entry.correct += file.correct;
            entry.score = mean(entry.correct, entry.total);
        }

        let total = files.iter().map(|f| f.total).sum();
        let correct = files.iter().map(|f| f.correct).sum();

        Self {
            files,
            by_question_type,
            total,
            correct,
            overall: mean(correct, total),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

fn mean(sum: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(qt: QuestionType, credits: &[f64]) -> FileMetrics {
        let mut m = FileMetrics::new(
            "d.jsonl",
            "p.jsonl",
            qt,
            KnowledgeType::Intensive,
            HistoryType::Verbose,
        );
        for c in credits {
            m.record(Score::new(*c));
        }
        m
    }

    #[test]
    fn test_file_score_is_mean_credit() {
        let m = file(QuestionType::FindTargetOffsetsTool, &[1.0, 0.5, 0.0, 0.5]);
        assert_eq!(m.total, 4);
        assert!((m.score - 0.5).abs() < 1e-9);
        assert_eq!(m.metric, "accuracy");
    }

    #[test]
    fn test_overall_is_unweighted_record_mean() {
        let report = MetricReport::from_files(vec![
            file(QuestionType::CountFrequencyTool, &[1.0]),
            file(QuestionType::Intersection, &[0.0, 0.0, 0.0]),
        ]);
        assert_eq!(report.total, 4);
        assert!((report.overall - 0.25).abs() < 1e-9);
        assert_eq!(report.by_question_type["Intersection"].metric, "f1");
        assert_eq!(
            report.by_question_type.keys().next().map(String::as_str),
            Some("Count Frequency(Tool)")
        );
    }

    #[test]
    fn test_empty_report() {
        let report = MetricReport::from_files(Vec::new());
        assert!(report.is_empty());
        assert_eq!(report.overall, 0.0);
    }
}
