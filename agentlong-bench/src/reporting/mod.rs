//! Results reporting

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::analysis::MetricReport;
use crate::runner::RunSummary;

/// JSON report export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonSummary {
    pub generated_at: String,
    #[serde(flatten)]
    pub report: MetricReport,
}

impl JsonSummary {
    pub fn new(report: MetricReport) -> Self {
        Self {
            generated_at: chrono::Utc::now().to_rfc3339(),
            report,
        }
    }

    /// Write to JSON file
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }
}

/// Print the metric report as console tables
pub fn print_console_report(report: &MetricReport) {
    println!("\n=== AgentLong Evaluation Results ===\n");
    println!("Records: {}\n", report.total);

    println!("Per File:");
    println!("{:-<50}", "");
    for file in &report.files {
        println!(
            "  {} [{}]",
            file.dataset,
            file.question_type
        );
        println!(
            "    {}: {:.4} ({:.1}/{}) {}-{}",
            file.metric,
            file.score,
            file.correct,
            file.total,
            file.knowledge_type.as_str(),
            file.history_type.as_str()
        );
        let problems = [
            ("missing", file.missing),
            ("unparseable", file.unparseable),
            ("unmatched", file.unmatched),
            ("malformed", file.malformed),
            ("unusable gold", file.unusable_gold),
        ];
        let notes: Vec<String> = problems
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(label, n)| format!("{} {}", n, label))
            .collect();
        if !notes.is_empty() {
            println!("    ({})", notes.join(", "));
        }
    }

    if !report.by_question_type.is_empty() {
        println!("\nBy Question Type:");
        println!("{:-<50}", "");
        for (label, summary) in &report.by_question_type {
            println!(
                "  {:<36} {} {:.4} over {} records",
                label, summary.metric, summary.score, summary.total
            );
        }
    }

    println!("\nOverall: {:.4}", report.overall);
    println!("\n{:=<50}", "");
}

/// Print the outcome of an inference run
pub fn print_run_summary(summary: &RunSummary) {
    println!("\n=== Run Complete ===\n");
    println!("Output: {}", summary.output.display());
    println!("{:-<50}", "");
    println!("  Selected:    {}", summary.selected);
    println!("  Skipped:     {}", summary.skipped);
    println!("  Answered:    {}", summary.answered);
    println!("  Unparseable: {}", summary.unparseable);
    println!("  Failed:      {}", summary.failed);
    println!("\n{:=<50}", "");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::FileMetrics;
    use crate::dataset::{HistoryType, KnowledgeType, QuestionType};

    #[test]
    fn test_summary_file_carries_report_fields() {
        let mut file = FileMetrics::new(
            "kf-c/intersection.jsonl",
            "preds.jsonl",
            QuestionType::Intersection,
            KnowledgeType::Free,
            HistoryType::Concise,
        );
        file.record(crate::analysis::Score::new(1.0));
        let summary = JsonSummary::new(MetricReport::from_files(vec![file]));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        summary.write_to_file(&path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(json["generated_at"].is_string());
        assert_eq!(json["overall"], 1.0);
        assert_eq!(json["by_question_type"]["Intersection"]["total"], 1);

        let back: JsonSummary = serde_json::from_value(json).unwrap();
        assert_eq!(back.report, summary.report);
    }
}
