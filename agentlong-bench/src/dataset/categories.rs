//! Question types and dataset axis definitions

use serde::{Deserialize, Serialize};

/// Knowledge axis of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeType {
    /// Real-world entities; the model may lean on pretrained knowledge
    #[serde(alias = "ki", alias = "knowledge_intensive")]
    Intensive,
    /// Masked entities; only in-context reasoning helps
    #[serde(alias = "kf", alias = "knowledge_free")]
    Free,
}

impl KnowledgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeType::Intensive => "intensive",
            KnowledgeType::Free => "free",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            KnowledgeType::Intensive => "knowledge_intensive",
            KnowledgeType::Free => "knowledge_free",
        }
    }
}

impl std::str::FromStr for KnowledgeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "intensive" | "ki" | "knowledge_intensive" => Ok(KnowledgeType::Intensive),
            "free" | "kf" | "knowledge_free" => Ok(KnowledgeType::Free),
            _ => Err(format!("Unknown knowledge type: {}", s)),
        }
    }
}

/// History axis of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryType {
    /// Tool outputs filtered down to the essentials
    #[serde(alias = "c", alias = "Concise-Response")]
    Concise,
    /// Raw, noisy tool outputs
    #[serde(alias = "v", alias = "Verbose-Response")]
    Verbose,
}

impl HistoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryType::Concise => "concise",
            HistoryType::Verbose => "verbose",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            HistoryType::Concise => "Concise-Response",
            HistoryType::Verbose => "Verbose-Response",
        }
    }
}

impl std::str::FromStr for HistoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "concise" | "c" | "concise-response" => Ok(HistoryType::Concise),
            "verbose" | "v" | "verbose-response" => Ok(HistoryType::Verbose),
            _ => Err(format!("Unknown history type: {}", s)),
        }
    }
}

/// Task category, which is also the dataset directory name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    ToolResponse,
    EnvResponse,
    FinalGuess,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::ToolResponse => "tool_response",
            TaskCategory::EnvResponse => "env_response",
            TaskCategory::FinalGuess => "final_guess",
        }
    }
}

/// Shape of the answer a question type expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerKind {
    Integer,
    Boolean,
    /// Two names, order significant
    NamePair,
    /// Any number of names, order irrelevant
    NameSet,
    /// A single deduced name
    Name,
}

/// Returned when a question type label is not one of the eight known types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported question type: {0}")]
pub struct UnsupportedQuestionType(pub String);

/// The eight benchmark question types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum QuestionType {
    CountFrequencyTool,
    FindDuplicatesTool,
    FindTargetOffsetsTool,
    CountCorrectnessEnv,
    CountFrequencyEnv,
    FindRoundLargestValueEnv,
    WeightedSummationEnv,
    Intersection,
}

impl QuestionType {
    pub fn all() -> Vec<QuestionType> {
        vec![
            QuestionType::CountFrequencyTool,
            QuestionType::FindDuplicatesTool,
            QuestionType::FindTargetOffsetsTool,
            QuestionType::CountCorrectnessEnv,
            QuestionType::CountFrequencyEnv,
            QuestionType::FindRoundLargestValueEnv,
            QuestionType::WeightedSummationEnv,
            QuestionType::Intersection,
        ]
    }

    /// Label used in dataset and prediction files
    pub fn label(&self) -> &'static str {
        match self {
            QuestionType::CountFrequencyTool => "Count Frequency(Tool)",
            QuestionType::FindDuplicatesTool => "Find Duplicates(Tool)",
            QuestionType::FindTargetOffsetsTool => "Find Target Offsets(Tool)",
            QuestionType::CountCorrectnessEnv => "Count Correctness(Env)",
            QuestionType::CountFrequencyEnv => "Count Frequency(Env)",
            QuestionType::FindRoundLargestValueEnv => "Find Round with Largest Value(Env)",
            QuestionType::WeightedSummationEnv => "Weighted Summation(Env)",
            QuestionType::Intersection => "Intersection",
        }
    }

    /// File-name slug
    pub fn slug(&self) -> &'static str {
        match self {
            QuestionType::CountFrequencyTool => "count_frequency_tool",
            QuestionType::FindDuplicatesTool => "find_duplicates_tool",
            QuestionType::FindTargetOffsetsTool => "find_target_offsets_tool",
            QuestionType::CountCorrectnessEnv => "count_correctness_env",
            QuestionType::CountFrequencyEnv => "count_frequency_env",
            QuestionType::FindRoundLargestValueEnv => "find_round_largest_value_env",
            QuestionType::WeightedSummationEnv => "weighted_summation_env",
            QuestionType::Intersection => "intersection",
        }
    }

    pub fn category(&self) -> TaskCategory {
        match self {
            QuestionType::CountFrequencyTool
            | QuestionType::FindDuplicatesTool
            | QuestionType::FindTargetOffsetsTool => TaskCategory::ToolResponse,
            QuestionType::CountCorrectnessEnv
            | QuestionType::CountFrequencyEnv
            | QuestionType::FindRoundLargestValueEnv
            | QuestionType::WeightedSummationEnv => TaskCategory::EnvResponse,
            QuestionType::Intersection => TaskCategory::FinalGuess,
        }
    }

    /// Intersection is the only type whose answer shape depends on the history axis:
    /// verbose histories ask for the intersection list, concise ones for the final guess.
    pub fn answer_kind(&self, history: HistoryType) -> AnswerKind {
        match self {
            QuestionType::CountFrequencyTool
            | QuestionType::CountCorrectnessEnv
            | QuestionType::CountFrequencyEnv
            | QuestionType::FindRoundLargestValueEnv
            | QuestionType::WeightedSummationEnv => AnswerKind::Integer,
            QuestionType::FindDuplicatesTool => AnswerKind::Boolean,
            QuestionType::FindTargetOffsetsTool => AnswerKind::NamePair,
            QuestionType::Intersection => match history {
                HistoryType::Verbose => AnswerKind::NameSet,
                HistoryType::Concise => AnswerKind::Name,
            },
        }
    }
}

impl std::fmt::Display for QuestionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl std::str::FromStr for QuestionType {
    type Err = UnsupportedQuestionType;

    /// Accepts the paper label, the slug, or the compact `CountFrequency_Tool`
    /// spelling; case and punctuation are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();

        match key.as_str() {
            "countfrequencytool" => Ok(QuestionType::CountFrequencyTool),
            "findduplicatestool" => Ok(QuestionType::FindDuplicatesTool),
            "findtargetoffsetstool" => Ok(QuestionType::FindTargetOffsetsTool),
            "countcorrectnessenv" => Ok(QuestionType::CountCorrectnessEnv),
            "countfrequencyenv" => Ok(QuestionType::CountFrequencyEnv),
            "findroundwithlargestvalueenv" | "findroundlargestvalueenv" => {
                Ok(QuestionType::FindRoundLargestValueEnv)
            }
            "weightedsummationenv" => Ok(QuestionType::WeightedSummationEnv),
            "intersection" => Ok(QuestionType::Intersection),
            _ => Err(UnsupportedQuestionType(s.to_string())),
        }
    }
}

impl TryFrom<String> for QuestionType {
    type Error = UnsupportedQuestionType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<QuestionType> for String {
    fn from(qt: QuestionType) -> Self {
        qt.label().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_question_type_spellings() {
        for spelling in ["Count Frequency(Tool)", "CountFrequency_Tool", "count_frequency_tool"] {
            assert_eq!(
                spelling.parse::<QuestionType>().unwrap(),
                QuestionType::CountFrequencyTool
            );
        }
        assert_eq!(
            "Find Round with Largest Value(Env)".parse::<QuestionType>().unwrap(),
            QuestionType::FindRoundLargestValueEnv
        );
        assert!("Summarize(Tool)".parse::<QuestionType>().is_err());
    }

    #[test]
    fn test_label_and_slug_resolve_back() {
        for qt in QuestionType::all() {
            assert_eq!(qt.label().parse::<QuestionType>().unwrap(), qt);
            assert_eq!(qt.slug().parse::<QuestionType>().unwrap(), qt);
        }
    }

    #[test]
    fn test_categories() {
        assert_eq!(QuestionType::FindDuplicatesTool.category(), TaskCategory::ToolResponse);
        assert_eq!(QuestionType::WeightedSummationEnv.category(), TaskCategory::EnvResponse);
        assert_eq!(QuestionType::Intersection.category(), TaskCategory::FinalGuess);
    }

    #[test]
    fn test_intersection_answer_kind_follows_history() {
        assert_eq!(
            QuestionType::Intersection.answer_kind(HistoryType::Verbose),
            AnswerKind::NameSet
        );
        assert_eq!(
            QuestionType::Intersection.answer_kind(HistoryType::Concise),
            AnswerKind::Name
        );
    }

    #[test]
    fn test_axis_aliases() {
        let ki: KnowledgeType = serde_json::from_str("\"ki\"").unwrap();
        let free: KnowledgeType = serde_json::from_str("\"knowledge_free\"").unwrap();
        let verbose: HistoryType = serde_json::from_str("\"Verbose-Response\"").unwrap();
        assert_eq!(ki, KnowledgeType::Intensive);
        assert_eq!(free, KnowledgeType::Free);
        assert_eq!(verbose, HistoryType::Verbose);
        assert_eq!("C".parse::<HistoryType>().unwrap(), HistoryType::Concise);
    }

    #[test]
    fn test_serialize_writes_label() {
        let json = serde_json::to_string(&QuestionType::CountFrequencyEnv).unwrap();
        assert_eq!(json, "\"Count Frequency(Env)\"");
    }
}
