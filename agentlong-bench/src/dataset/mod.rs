//! Dataset and prediction records

pub mod categories;
pub mod loader;

pub use categories::{
    AnswerKind, HistoryType, KnowledgeType, QuestionType, TaskCategory, UnsupportedQuestionType,
};
pub use loader::{
    find_dataset_files, infer_axes_from_path, load_dataset, load_predictions, parse_dataset_str,
    parse_predictions_str, LoadError, LoadedDataset, LoadedPredictions,
};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::analysis::{Answer, ParseKind, ParsedAnswer};

/// One chat message of a recorded interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    /// Tool calls, tool call ids, names and anything else the log carried
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A context turn: a chat message or a plain log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Turn {
    Message(ChatTurn),
    Line(String),
}

impl Turn {
    pub fn is_system(&self) -> bool {
        matches!(self, Turn::Message(m) if m.role == "system")
    }
}

/// Question payload: plain text or task-specific fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Question {
    Text(String),
    Fields(Map<String, Value>),
}

impl Default for Question {
    fn default() -> Self {
        Question::Text(String::new())
    }
}

impl Question {
    /// Text shown to the model
    ///
    /// Object questions contribute their `text` (or `question`) field first,
    /// followed by the remaining fields as `key: value` lines in file order.
    pub fn text(&self) -> String {
        match self {
            Question::Text(s) => s.clone(),
            Question::Fields(fields) => {
                let primary = ["text", "question"]
                    .iter()
                    .find_map(|k| fields.get(*k).and_then(Value::as_str).map(|s| (*k, s)));

                let mut lines = Vec::new();
                if let Some((_, text)) = primary {
                    lines.push(text.to_string());
                }
                for (key, value) in fields {
                    if primary.map(|(k, _)| k == key.as_str()).unwrap_or(false) {
                        continue;
                    }
                    let rendered = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    lines.push(format!("{}: {}", key, rendered));
                }
                lines.join("\n")
            }
        }
    }
}

/// One benchmark item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    #[serde(default, deserialize_with = "scalar_string")]
    pub id: String,
    #[serde(default, deserialize_with = "opt_scalar_string", skip_serializing_if = "Option::is_none")]
    pub sample_id: Option<String>,
    pub question_type: QuestionType,
    pub knowledge_type: KnowledgeType,
    pub history_type: HistoryType,
    #[serde(alias = "messages", default)]
    pub context: Vec<Turn>,
    #[serde(default)]
    pub question: Question,
    #[serde(alias = "answer", default)]
    pub gold_answer: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i_round: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub j_round: Option<i64>,
}

impl DatasetRecord {
    pub fn new(
        id: impl Into<String>,
        question_type: QuestionType,
        knowledge_type: KnowledgeType,
        history_type: HistoryType,
        question: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            sample_id: None,
            question_type,
            knowledge_type,
            history_type,
            context: Vec::new(),
            question: Question::Text(question.into()),
            gold_answer: Value::Null,
            round: None,
            i_round: None,
            j_round: None,
        }
    }

    pub fn with_context(mut self, context: Vec<Turn>) -> Self {
        self.context = context;
        self
    }

    pub fn with_gold(mut self, gold: Value) -> Self {
        self.gold_answer = gold;
        self
    }

    pub fn with_sample_id(mut self, sample_id: impl Into<String>) -> Self {
        self.sample_id = Some(sample_id.into());
        self
    }

    pub fn with_round(mut self, round: i64) -> Self {
        self.round = Some(round);
        self
    }

    pub fn answer_kind(&self) -> AnswerKind {
        self.question_type.answer_kind(self.history_type)
    }

    /// Matching key: `id`, or `{sample_id}_r{round}` when the file carries no ids
    pub fn key(&self) -> Option<String> {
        if !self.id.is_empty() {
            return Some(self.id.clone());
        }
        round_key(self.sample_id.as_deref(), self.round)
    }

    pub fn round_key(&self) -> Option<String> {
        round_key(self.sample_id.as_deref(), self.round)
    }
}

/// Model output for one dataset record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    #[serde(default, deserialize_with = "scalar_string")]
    pub id: String,
    #[serde(default, deserialize_with = "opt_scalar_string", skip_serializing_if = "Option::is_none")]
    pub sample_id: Option<String>,
    pub question_type: QuestionType,
    #[serde(default)]
    pub pred_answer: Answer,
    /// Absent on predictions produced by other tools; those get parsed at evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_kind: Option<ParseKind>,
    #[serde(default)]
    pub raw_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i_round: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub j_round: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PredictionRecord {
    /// Record for a response that came back from the backend
    pub fn answered(record: &DatasetRecord, parsed: ParsedAnswer, raw_response: String) -> Self {
        Self {
            pred_answer: parsed.answer,
            parse_kind: Some(parsed.kind),
            raw_response,
            ..Self::blank(record)
        }
    }

    /// Record for a request that failed after all retries
    pub fn failed(record: &DatasetRecord, error: impl Into<String>) -> Self {
        Self {
            parse_kind: Some(ParseKind::FallbackNone),
            error: Some(error.into()),
            ..Self::blank(record)
        }
    }

    fn blank(record: &DatasetRecord) -> Self {
        Self {
            id: record.id.clone(),
            sample_id: record.sample_id.clone(),
            question_type: record.question_type,
            pred_answer: Answer::Unparseable,
            parse_kind: None,
            raw_response: String::new(),
            round: record.round,
            i_round: record.i_round,
            j_round: record.j_round,
            error: None,
        }
    }

    /// Matching key: `id`, or `{sample_id}_r{round}` for files written without ids
    pub fn key(&self) -> Option<String> {
        if !self.id.is_empty() {
            return Some(self.id.clone());
        }
        round_key(self.sample_id.as_deref(), self.round)
    }

    /// A record counts as done once the backend returned text for it
    pub fn is_completed(&self) -> bool {
        !self.raw_response.is_empty()
    }
}

fn round_key(sample_id: Option<&str>, round: Option<i64>) -> Option<String> {
    match (sample_id, round) {
        (Some(sample), Some(round)) => Some(format!("{}_r{}", sample, round)),
        _ => None,
    }
}

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(String::new()),
        other => scalar_to_string(other)
            .ok_or_else(|| serde::de::Error::custom("expected a string or number id")),
    }
}

fn opt_scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(scalar_to_string(value))
}
