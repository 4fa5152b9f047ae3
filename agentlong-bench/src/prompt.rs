//! Prompt construction for dataset records
//!
//! A prompt is a system message describing the game and the task, the
//! recorded interaction minus its own system turns, and a final user turn
//! with the question and the answer-format instruction. Building is pure:
//! the same record always yields the same prompt.

use serde::Serialize;

use crate::dataset::{
    AnswerKind, DatasetRecord, HistoryType, KnowledgeType, QuestionType, Turn,
};
use crate::providers::Message;

/// Error type for prompt construction
///
/// Question types are checked when a record is read, so an unsupported
/// type never reaches the builder.
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("Record '{0}' has an empty question")]
    EmptyQuestion(String),
}

/// Message list sent to a backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prompt {
    pub messages: Vec<Message>,
}

impl Prompt {
    pub fn system(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.as_str())
    }

    /// The final user turn
    pub fn question(&self) -> Option<&str> {
        self.messages.last().map(|m| m.content.as_str())
    }

    /// Single-string rendering for engines without a chat template
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for message in &self.messages {
            out.push_str(&format!("### {}\n", message.role));
            out.push_str(&message.content);
            if let Some(calls) = message.extra.get("tool_calls") {
                if !message.content.is_empty() {
                    out.push('\n');
                }
                out.push_str(&format!("[tool_calls] {}", calls));
            }
            out.push_str("\n\n");
        }
        out.push_str("### assistant\n");
        out
    }
}

/// Vocabulary that differs between real and masked entities
struct Vocabulary {
    dialogue: &'static str,
    entity: &'static str,
    answer_noun: &'static str,
    pair_example: &'static str,
    largest_field: &'static str,
    /// Weighted-summation categories, highest weight first (6 down to 1)
    weighted_fields: [&'static str; 6],
}

const INTENSIVE: Vocabulary = Vocabulary {
    dialogue: "a guess-the-Pokemon dialogue",
    entity: "Pokemon",
    answer_noun: "Pokemon name",
    pair_example: "Pokemon1 and Pokemon2",
    largest_field: "total base stats",
    weighted_fields: ["Type", "Ability", "Base Stats", "Evolution", "Generation", "Other sections"],
};

const FREE: Vocabulary = Vocabulary {
    dialogue: "a masked guess-the-entity dialogue",
    entity: "entity id",
    answer_noun: "masked id",
    pair_example: "id1 and id2",
    largest_field: "attr_2 total (a numeric field)",
    weighted_fields: ["attr_1", "attr_4", "attr_2", "attr_5", "attr_3", "attr_6"],
};

fn vocabulary(knowledge: KnowledgeType) -> &'static Vocabulary {
    match knowledge {
        KnowledgeType::Intensive => &INTENSIVE,
        KnowledgeType::Free => &FREE,
    }
}

/// Build the prompt for one record
pub fn build_prompt(record: &DatasetRecord) -> Result<Prompt, PromptError> {
    let question = record.question.text();
    if question.trim().is_empty() {
        return Err(PromptError::EmptyQuestion(record.id.clone()));
    }

    let mut messages = vec![Message::system(system_prompt(
        record.question_type,
        record.knowledge_type,
        record.history_type,
    ))];

    let mut log_lines: Vec<&str> = Vec::new();
    for turn in &record.context {
        match turn {
            Turn::Line(line) => log_lines.push(line),
            Turn::Message(chat) => {
                flush_log_lines(&mut messages, &mut log_lines);
                if chat.role == "system" {
                    continue;
                }
                messages.push(
                    Message::new(&chat.role, chat.content.clone().unwrap_or_default())
                        .with_extra(chat.extra.clone()),
                );
            }
        }
    }
    flush_log_lines(&mut messages, &mut log_lines);

    let instruction = answer_instruction(
        record.question_type,
        record.knowledge_type,
        record.history_type,
    );
    messages.push(Message::user(format!("{}\n\n{}", question, instruction)));

    Ok(Prompt { messages })
}

/// Consecutive plain log lines become one user turn
fn flush_log_lines(messages: &mut Vec<Message>, lines: &mut Vec<&str>) {
    if lines.is_empty() {
        return;
    }
    messages.push(Message::user(lines.join("\n")));
    lines.clear();
}

/// System message for a question type
pub fn system_prompt(
    question_type: QuestionType,
    knowledge: KnowledgeType,
    history: HistoryType,
) -> String {
    let vocab = vocabulary(knowledge);

    let task = match question_type {
        QuestionType::CountFrequencyTool | QuestionType::CountCorrectnessEnv => {
            "Answer the question from the tool return values or the environment feedback.".to_string()
        }
        QuestionType::CountFrequencyEnv => {
            "Count how often a property value occurs in the feedback across all rounds.".to_string()
        }
        QuestionType::FindRoundLargestValueEnv => {
            format!("Identify the round with the highest {}.", vocab.largest_field)
        }
        QuestionType::WeightedSummationEnv => weighted_rule(vocab),
        QuestionType::FindDuplicatesTool => format!(
            "Decide whether a {} appears in both tool results.",
            vocab.entity
        ),
        QuestionType::FindTargetOffsetsTool => {
            format!("Identify the two {}s, in order.", vocab.answer_noun)
        }
        QuestionType::Intersection => {
            return match history {
                HistoryType::Verbose => format!(
                    "You are reviewing {}. The full message history, tool results included, is provided.\n\
                     Infer the intersection list returned by the tool call of the target round.\n\
                     A round is: user guess, then an optional tool call, then feedback. The first round \
                     has no tool call; the first tool call follows the user's second guess and belongs \
                     to round 2, and so on.\n\
                     Do not call any tools.",
                    vocab.dialogue
                ),
                HistoryType::Concise => format!(
                    "You are an expert analyst of {}, a deductive reasoning game. The full history \
                     with system feedback is provided.\n\
                     Work through the constraints revealed across the dialogue and deduce the hidden \
                     target. The answer must agree with every piece of feedback.\n\
                     Do not call any tools.",
                    vocab.dialogue
                ),
            };
        }
    };

    format!(
        "You are analyzing {}. The full conversation history, tool results and feedback included, is provided.\n{}",
        vocab.dialogue, task
    )
}

fn weighted_rule(vocab: &Vocabulary) -> String {
    let mut rule = String::from("Score two rounds with this weighted rule:\n");
    for (field, points) in vocab.weighted_fields.iter().zip((1..=6).rev()) {
        let unit = if points == 1 { "point" } else { "points" };
        rule.push_str(&format!("- {}: {} {} per correct item\n", field, points, unit));
    }
    let [first, second, _, fourth, _, _] = vocab.weighted_fields;
    rule.push_str(&format!(
        "Example: a round with {} correct (6), two {} items correct (5+5) and one {} correct (3) \
         scores 6+5+5+3 = 19.\n",
        first, second, fourth
    ));
    rule.push_str("Then compute the absolute difference between the two rounds' scores.");
    rule
}

/// Answer-format instruction appended to the question
pub fn answer_instruction(
    question_type: QuestionType,
    knowledge: KnowledgeType,
    history: HistoryType,
) -> String {
    let vocab = vocabulary(knowledge);

    match question_type.answer_kind(history) {
        AnswerKind::Integer => {
            let what = match question_type {
                QuestionType::FindRoundLargestValueEnv => "the round number",
                QuestionType::WeightedSummationEnv => "the difference",
                _ => "a single number",
            };
            format!(
                "Give {} in arabic numerals (3, not three), wrapped in <answer></answer>.",
                what
            )
        }
        AnswerKind::Boolean => {
            "Answer yes or no, wrapped in <answer></answer>.".to_string()
        }
        AnswerKind::NamePair => format!(
            "Format your answer as: <answer>{}</answer>",
            vocab.pair_example
        ),
        AnswerKind::NameSet => {
            "Return only the intersection as a comma-separated list or JSON array, wrapped in <answer></answer>.".to_string()
        }
        AnswerKind::Name => format!(
            "Return only the {}, wrapped in <answer></answer>.",
            vocab.answer_noun
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ChatTurn;
    use serde_json::Map;

    fn record(qt: QuestionType, knowledge: KnowledgeType, history: HistoryType) -> DatasetRecord {
        DatasetRecord::new("r1", qt, knowledge, history, "How many times did attr_3 show value 7?")
    }

    fn chat(role: &str, content: &str) -> Turn {
        Turn::Message(ChatTurn {
            role: role.to_string(),
            content: Some(content.to_string()),
            extra: Map::new(),
        })
    }

    #[test]
    fn test_layout_system_context_question() {
        let rec = record(QuestionType::CountFrequencyEnv, KnowledgeType::Free, HistoryType::Concise)
            .with_context(vec![
                chat("system", "recorded game rules"),
                chat("user", "Is it Item_3?"),
                Turn::Line("feedback: attr_3 = 7".to_string()),
                Turn::Line("feedback: attr_1 wrong".to_string()),
                chat("assistant", "Trying again"),
            ]);
        let prompt = build_prompt(&rec).unwrap();
        let roles: Vec<&str> = prompt.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "user", "assistant", "user"]);
        assert!(prompt.system().unwrap().contains("masked guess-the-entity"));
        assert!(!prompt.messages.iter().any(|m| m.content == "recorded game rules"));
        assert_eq!(prompt.messages[2].content, "feedback: attr_3 = 7\nfeedback: attr_1 wrong");

        let question = prompt.question().unwrap();
        assert!(question.starts_with("How many times did attr_3 show value 7?"));
        assert!(question.contains("<answer></answer>"));
    }

    #[test]
    fn test_build_is_deterministic() {
        for qt in QuestionType::all() {
            for k in [KnowledgeType::Intensive, KnowledgeType::Free] {
                for h in [HistoryType::Concise, HistoryType::Verbose] {
                    let rec = record(qt, k, h);
                    assert_eq!(build_prompt(&rec).unwrap(), build_prompt(&rec).unwrap());
                }
            }
        }
    }

    #[test]
    fn test_weighted_rule_lists_all_weights() {
        let ki = system_prompt(
            QuestionType::WeightedSummationEnv,
            KnowledgeType::Intensive,
            HistoryType::Verbose,
        );
        assert!(ki.contains("- Type: 6 points per correct item"));
        assert!(ki.contains("- Other sections: 1 point per correct item"));
        assert!(ki.contains("guess-the-Pokemon"));

        let kf = system_prompt(
            QuestionType::WeightedSummationEnv,
            KnowledgeType::Free,
            HistoryType::Verbose,
        );
        assert!(kf.contains("- attr_4: 5 points per correct item"));
        assert!(kf.contains("- attr_3: 2 points per correct item"));
    }

    #[test]
    fn test_intersection_prompt_depends_on_history() {
        let verbose = system_prompt(QuestionType::Intersection, KnowledgeType::Intensive, HistoryType::Verbose);
        let concise = system_prompt(QuestionType::Intersection, KnowledgeType::Intensive, HistoryType::Concise);
        assert!(verbose.contains("intersection list"));
        assert!(concise.contains("deduce the hidden target"));

        let list = answer_instruction(QuestionType::Intersection, KnowledgeType::Free, HistoryType::Verbose);
        let single = answer_instruction(QuestionType::Intersection, KnowledgeType::Free, HistoryType::Concise);
        assert!(list.contains("JSON array"));
        assert!(single.contains("masked id"));
    }

    #[test]
    fn test_tool_call_fields_survive() {
        let mut extra = Map::new();
        extra.insert("tool_calls".to_string(), serde_json::json!([{"id": "call_1"}]));
        let rec = record(QuestionType::FindDuplicatesTool, KnowledgeType::Intensive, HistoryType::Verbose)
            .with_context(vec![Turn::Message(ChatTurn {
                role: "assistant".to_string(),
                content: None,
                extra,
            })]);
        let prompt = build_prompt(&rec).unwrap();
        assert!(prompt.messages[1].extra.contains_key("tool_calls"));
        assert!(prompt.render_text().contains("[tool_calls]"));
        assert!(prompt.render_text().ends_with("### assistant\n"));
    }

    #[test]
    fn test_errors() {
        let rec = DatasetRecord::new(
            "empty",
            QuestionType::Intersection,
            KnowledgeType::Free,
            HistoryType::Concise,
            "  ",
        );
        assert!(matches!(build_prompt(&rec), Err(PromptError::EmptyQuestion(_))));

        let raw = r#"{"id": "x", "question_type": "Summarize(Tool)", "knowledge_type": "kf",
            "history_type": "c", "question": "q"}"#;
        assert!(serde_json::from_str::<DatasetRecord>(raw).is_err());
    }
}
