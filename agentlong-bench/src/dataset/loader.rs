//! JSONL loading for dataset and prediction files

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde_json::Value;

use super::categories::{HistoryType, KnowledgeType, QuestionType, UnsupportedQuestionType};
use super::{DatasetRecord, PredictionRecord};

/// Error type for dataset loading
///
/// `MalformedRecord` is only ever logged; the loader skips the line and
/// continues. The other variants abort loading of the file.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed record at line {line}: {message}")]
    MalformedRecord { line: usize, message: String },

    #[error(transparent)]
    UnsupportedQuestionType(#[from] UnsupportedQuestionType),

    #[error("Mixed question types: file starts with '{first}' but line {line} has '{found}'")]
    MixedQuestionTypes {
        first: QuestionType,
        found: QuestionType,
        line: usize,
    },

    #[error("Line {line} has no {field} and the path has no ki-c style directory to supply one")]
    MissingAxis { line: usize, field: &'static str },

    #[error("Duplicate id '{id}' at line {line}")]
    DuplicateId { id: String, line: usize },

    #[error("No valid records in {0}")]
    EmptyDataset(String),
}

/// A dataset file after validation
#[derive(Debug, Clone)]
pub struct LoadedDataset {
    pub source: String,
    pub question_type: QuestionType,
    /// Knowledge type of the first record
    pub knowledge_type: KnowledgeType,
    /// History type of the first record
    pub history_type: HistoryType,
    pub records: Vec<DatasetRecord>,
    /// Lines skipped as malformed
    pub malformed: usize,
}

impl LoadedDataset {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Prediction lines that parsed, plus the count of lines that did not
#[derive(Debug, Clone, Default)]
pub struct LoadedPredictions {
    pub records: Vec<PredictionRecord>,
    pub malformed: usize,
}

/// Load a dataset JSONL file
pub fn load_dataset(path: impl AsRef<Path>) -> Result<LoadedDataset, LoadError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    parse_dataset_str(&content, Some(path))
}

/// Parse dataset JSONL content
///
/// `path` names the source in errors and supplies knowledge/history types for
/// records that omit them.
pub fn parse_dataset_str(content: &str, path: Option<&Path>) -> Result<LoadedDataset, LoadError> {
    let source = path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<memory>".to_string());
    let axes = path.and_then(infer_axes_from_path);

    let mut question_type: Option<QuestionType> = None;
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut malformed = 0;

    for (idx, raw) in content.lines().enumerate() {
        let line = idx + 1;
        if raw.trim().is_empty() {
            continue;
        }

        let value = match parse_record_value(raw, line, axes) {
            Ok(value) => value,
            Err(RecordIssue::Skip(e)) => {
                tracing::warn!("{}: {}", source, e);
                malformed += 1;
                continue;
            }
            Err(RecordIssue::Fatal(e)) => return Err(e),
        };

        let record: DatasetRecord = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                let err = LoadError::MalformedRecord { line, message: e.to_string() };
                tracing::warn!("{}: {}", source, err);
                malformed += 1;
                continue;
            }
        };

        match question_type {
            None => question_type = Some(record.question_type),
            Some(first) if first != record.question_type => {
                return Err(LoadError::MixedQuestionTypes {
                    first,
                    found: record.question_type,
                    line,
                });
            }
            Some(_) => {}
        }

        let Some(key) = record.key() else {
            let err = LoadError::MalformedRecord {
                line,
                message: "record has neither id nor sample_id and round".to_string(),
            };
            tracing::warn!("{}: {}", source, err);
            malformed += 1;
            continue;
        };
        if !seen.insert(key.clone()) {
            return Err(LoadError::DuplicateId { id: key, line });
        }

        records.push(record);
    }

    let (Some(question_type), Some(first)) = (question_type, records.first()) else {
        return Err(LoadError::EmptyDataset(source));
    };
    tracing::debug!("Loaded {} records from {}", records.len(), source);
    Ok(LoadedDataset {
        source,
        question_type,
        knowledge_type: first.knowledge_type,
        history_type: first.history_type,
        records,
        malformed,
    })
}

enum RecordIssue {
    Skip(LoadError),
    Fatal(LoadError),
}

/// Validate the raw JSON of one line and fill in path-derived axes
fn parse_record_value(
    raw: &str,
    line: usize,
    axes: Option<(KnowledgeType, HistoryType)>,
) -> Result<Value, RecordIssue> {
    let malformed = |message: String| RecordIssue::Skip(LoadError::MalformedRecord { line, message });

    let mut value: Value = serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| malformed("expected a JSON object".to_string()))?;

    let label = obj
        .get("question_type")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing question_type".to_string()))?;
    label
        .parse::<QuestionType>()
        .map_err(|e| RecordIssue::Fatal(e.into()))?;

    if let Some((knowledge, history)) = axes {
        obj.entry("knowledge_type")
            .or_insert_with(|| Value::String(knowledge.as_str().to_string()));
        obj.entry("history_type")
            .or_insert_with(|| Value::String(history.as_str().to_string()));
    }
    for field in ["knowledge_type", "history_type"] {
        if !obj.contains_key(field) {
            return Err(RecordIssue::Fatal(LoadError::MissingAxis { line, field }));
        }
    }

    Ok(value)
}

/// Knowledge/history types from a `ki-c` style directory in the path
pub fn infer_axes_from_path(path: &Path) -> Option<(KnowledgeType, HistoryType)> {
    path.components().rev().find_map(|component| {
        let Component::Normal(part) = component else {
            return None;
        };
        let part = part.to_str()?.to_ascii_lowercase();
        let (knowledge, history) = part.split_once('-')?;
        let knowledge = match knowledge {
            "ki" => KnowledgeType::Intensive,
            "kf" => KnowledgeType::Free,
            _ => return None,
        };
        let history = match history {
            "c" => HistoryType::Concise,
            "v" => HistoryType::Verbose,
            _ => return None,
        };
        Some((knowledge, history))
    })
}

/// Load a prediction JSONL file
pub fn load_predictions(path: impl AsRef<Path>) -> Result<LoadedPredictions, LoadError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    Ok(parse_predictions_str(&content, &path.display().to_string()))
}

/// Parse prediction JSONL content; bad lines are skipped and counted
pub fn parse_predictions_str(content: &str, source: &str) -> LoadedPredictions {
    let mut loaded = LoadedPredictions::default();

    for (idx, raw) in content.lines().enumerate() {
        if raw.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<PredictionRecord>(raw) {
            Ok(record) => loaded.records.push(record),
            Err(e) => {
                let err = LoadError::MalformedRecord { line: idx + 1, message: e.to_string() };
                tracing::warn!("{}: {}", source, err);
                loaded.malformed += 1;
            }
        }
    }

    loaded
}

/// All `.jsonl` files under `dir`, sorted by path
pub fn find_dataset_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, LoadError> {
    let mut files = Vec::new();
    let mut pending = vec![dir.as_ref().to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn line(id: &str, qt: &str) -> String {
        format!(
            r#"{{"id": "{}", "question_type": "{}", "knowledge_type": "ki", "history_type": "c", "context": [], "question": "q", "gold_answer": 1}}"#,
            id, qt
        )
    }

    #[test]
    fn test_load_skips_malformed_lines() {
        let content = [
            line("a", "CountFrequency_Tool"),
            "{not json".to_string(),
            r#"{"id": "b"}"#.to_string(),
            String::new(),
            line("c", "Count Frequency(Tool)"),
        ]
        .join("\n");

        let dataset = parse_dataset_str(&content, None).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.malformed, 2);
        assert_eq!(dataset.question_type, QuestionType::CountFrequencyTool);
        assert_eq!(dataset.records[1].id, "c");
    }

    #[test]
    fn test_unsupported_question_type_is_fatal() {
        let content = line("a", "Summarize(Tool)");
        let err = parse_dataset_str(&content, None).unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedQuestionType(_)));
    }

    #[test]
    fn test_mixed_question_types_rejected() {
        let content = [line("a", "Intersection"), line("b", "Count Frequency(Env)")].join("\n");
        let err = parse_dataset_str(&content, None).unwrap_err();
        assert!(matches!(err, LoadError::MixedQuestionTypes { line: 2, .. }));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let content = [line("a", "Intersection"), line("a", "Intersection")].join("\n");
        let err = parse_dataset_str(&content, None).unwrap_err();
        assert!(matches!(err, LoadError::DuplicateId { ref id, line: 2 } if id == "a"));
    }

    #[test]
    fn test_empty_dataset() {
        let err = parse_dataset_str("\n{broken\n", None).unwrap_err();
        assert!(matches!(err, LoadError::EmptyDataset(_)));
    }

    #[test]
    fn test_axes_from_path() {
        let path = Path::new("data/kf-v/128k/final_guess/intersection.jsonl");
        assert_eq!(
            infer_axes_from_path(path),
            Some((KnowledgeType::Free, HistoryType::Verbose))
        );
        assert_eq!(infer_axes_from_path(Path::new("data/128k/x.jsonl")), None);

        let content = r#"{"id": 1, "question_type": "Intersection", "question": "Who?", "answer": "Item_3"}"#;
        let dataset = parse_dataset_str(content, Some(path)).unwrap();
        assert_eq!(dataset.knowledge_type, KnowledgeType::Free);
        assert_eq!(dataset.history_type, HistoryType::Verbose);
    }

    #[test]
    fn test_minimal_record_without_question() {
        let content = r#"{"id": "a", "question_type": "Intersection", "gold_answer": "Item_3"}"#;
        let dataset = parse_dataset_str(content, Some(Path::new("data/ki-c/intersection.jsonl"))).unwrap();
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.records[0].question.text(), "");
        assert_eq!(dataset.knowledge_type, KnowledgeType::Intensive);
    }

    #[test]
    fn test_missing_axis_names_the_field() {
        let content = r#"{"id": "a", "question_type": "Intersection", "gold_answer": "Item_3"}"#;
        let err = parse_dataset_str(content, Some(Path::new("data/128k/intersection.jsonl"))).unwrap_err();
        assert!(matches!(err, LoadError::MissingAxis { line: 1, field: "knowledge_type" }));
        assert!(err.to_string().contains("knowledge_type"));

        let content = r#"{"id": "a", "question_type": "Intersection", "knowledge_type": "kf", "gold_answer": "Item_3"}"#;
        let err = parse_dataset_str(content, None).unwrap_err();
        assert!(matches!(err, LoadError::MissingAxis { field: "history_type", .. }));
    }

    #[test]
    fn test_record_fields_win_over_path() {
        let path = Path::new("data/kf-v/x.jsonl");
        let content = line("a", "Intersection");
        let dataset = parse_dataset_str(&content, Some(path)).unwrap();
        assert_eq!(dataset.knowledge_type, KnowledgeType::Intensive);
        assert_eq!(dataset.history_type, HistoryType::Concise);
    }

    #[test]
    fn test_load_from_file_and_discover() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("ki-c").join("tool_response");
        std::fs::create_dir_all(&nested).unwrap();
        let file = nested.join("count_frequency_tool.jsonl");
        let mut f = std::fs::File::create(&file).unwrap();
        writeln!(f, "{}", line("a", "CountFrequency_Tool")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore").unwrap();

        let found = find_dataset_files(dir.path()).unwrap();
        assert_eq!(found, vec![file.clone()]);
        assert_eq!(load_dataset(&file).unwrap().len(), 1);
    }

    #[test]
    fn test_predictions_count_malformed() {
        let content = "{\"id\": \"a\", \"question_type\": \"Intersection\", \"pred_answer\": \"Item_1\"}\nnope\n";
        let loaded = parse_predictions_str(content, "preds.jsonl");
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.malformed, 1);
    }
}
