//! Scoring a parsed answer against the gold answer

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::parser::{last_integer, Answer};
use crate::dataset::{AnswerKind, HistoryType, KnowledgeType, QuestionType};

/// Credit for one record, in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub credit: f64,
    pub correct: bool,
}

impl Score {
    pub fn new(credit: f64) -> Self {
        let credit = credit.clamp(0.0, 1.0);
        Self {
            credit,
            correct: credit >= 1.0,
        }
    }

    pub fn zero() -> Self {
        Self::new(0.0)
    }
}

/// Returned when the gold answer cannot be read as the expected shape
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Unusable gold answer for {question_type}: {gold}")]
pub struct UnusableGold {
    pub question_type: QuestionType,
    pub gold: String,
}

/// Metric name reported for a question type
pub fn metric_name(question_type: QuestionType, history: HistoryType) -> &'static str {
    match question_type.answer_kind(history) {
        AnswerKind::NameSet => "f1",
        _ => "accuracy",
    }
}

/// Score `pred` against `gold`
///
/// The unparseable sentinel always scores zero. A gold answer that cannot be
/// normalized is an error so the caller can report it; the caller decides the
/// credit (zero, in the evaluator).
pub fn score(
    question_type: QuestionType,
    knowledge: KnowledgeType,
    history: HistoryType,
    pred: &Answer,
    gold: &Value,
) -> Result<Score, UnusableGold> {
    let unusable = || UnusableGold {
        question_type,
        gold: gold.to_string(),
    };

    let kind = question_type.answer_kind(history);
    let pred_value = pred.to_value();

    let credit = match kind {
        AnswerKind::Integer => {
            let gold = normalize_integer(gold).ok_or_else(unusable)?;
            if pred.is_unparseable() {
                return Ok(Score::zero());
            }
            binary(normalize_integer(&pred_value) == Some(gold))
        }
        AnswerKind::Boolean => {
            let gold = normalize_boolean(gold).ok_or_else(unusable)?;
            if pred.is_unparseable() {
                return Ok(Score::zero());
            }
            binary(normalize_boolean(&pred_value) == Some(gold))
        }
        AnswerKind::NamePair => {
            let gold = normalize_names(gold, knowledge)
                .filter(|g| g.len() == 2)
                .ok_or_else(unusable)?;
            if pred.is_unparseable() {
                return Ok(Score::zero());
            }
            let pred = normalize_names(&pred_value, knowledge).unwrap_or_default();
            pair_credit(&pred, &gold)
        }
        AnswerKind::NameSet => {
            let gold = normalize_names(gold, knowledge).ok_or_else(unusable)?;
            if pred.is_unparseable() {
                return Ok(Score::zero());
            }
            let pred = normalize_names(&pred_value, knowledge).unwrap_or_default();
            set_f1(&pred, &gold)
        }
        AnswerKind::Name => {
            let gold = single_name(gold, knowledge)
                .filter(|g| !g.is_empty())
                .ok_or_else(unusable)?;
            if pred.is_unparseable() {
                return Ok(Score::zero());
            }
            binary(single_name(&pred_value, knowledge).as_deref() == Some(gold.as_str()))
        }
    };

    Ok(Score::new(credit))
}

fn binary(hit: bool) -> f64 {
    if hit {
        1.0
    } else {
        0.0
    }
}

/// Integer from an int, a float, or the first number in a string
pub fn normalize_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .replace(',', "")
                .parse::<f64>()
                .ok()
                .map(|f| f.trunc() as i64)
                .or_else(|| first_integer(trimmed))
        }
        _ => None,
    }
}

fn first_integer(text: &str) -> Option<i64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"-?\d[\d,]*(?:\.\d+)?").expect("integer regex"));
    re.find(text).and_then(|m| last_integer(m.as_str()))
}

/// Boolean from a bool, a number (`> 0` is true), or yes/no style text
pub fn normalize_boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f > 0.0),
        Value::String(s) => {
            let lower = s.trim().trim_end_matches('.').to_lowercase();
            match lower.as_str() {
                "yes" | "true" | "1" => Some(true),
                "no" | "false" | "0" => Some(false),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Canonical form used for all name comparisons
///
/// Lowercase, with spaces, hyphens, quotes and dots removed; masked
/// (knowledge-free) ids also drop underscores so `Item_12` equals `item12`.
pub fn normalize_name(name: &str, knowledge: KnowledgeType) -> String {
    name.chars()
        .filter(|c| !matches!(c, ' ' | '-' | '\'' | '"' | '.'))
        .filter(|c| knowledge == KnowledgeType::Intensive || *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Normalized names from a JSON list or a delimited string
pub fn normalize_names(value: &Value, knowledge: KnowledgeType) -> Option<Vec<String>> {
    let raw: Vec<String> = match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Value::String(s) => {
            static RE: OnceLock<Regex> = OnceLock::new();
            let re = RE.get_or_init(|| {
                Regex::new(r"(?i)\s*(?:[,;|\n]|\band\b)\s*").expect("name separator regex")
            });
            let stripped = s
                .trim()
                .trim_matches(|c: char| matches!(c, '[' | ']' | '(' | ')' | '{' | '}'));
            re.split(stripped).map(str::to_string).collect()
        }
        _ => return None,
    };

    Some(
        raw.iter()
            .map(|name| normalize_name(name, knowledge))
            .filter(|name| !name.is_empty())
            .collect(),
    )
}

fn single_name(value: &Value, knowledge: KnowledgeType) -> Option<String> {
    match value {
        Value::String(s) => Some(normalize_name(s, knowledge)),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) if items.len() == 1 => single_name(&items[0], knowledge),
        _ => None,
    }
}

/// 1.0 for the exact ordered pair, 0.5 when only the first name is given
/// and it is right, 0.0 otherwise
fn pair_credit(pred: &[String], gold: &[String]) -> f64 {
    match (pred, gold) {
        ([p0, p1], [g0, g1]) if p0 == g0 && p1 == g1 => 1.0,
        ([p0], [g0, _]) if p0 == g0 => 0.5,
        _ => 0.0,
    }
}

/// F1 between the predicted and gold sets; two empty sets agree perfectly
fn set_f1(pred: &[String], gold: &[String]) -> f64 {
    let pred: BTreeSet<&String> = pred.iter().collect();
    let gold: BTreeSet<&String> = gold.iter().collect();

    if pred.is_empty() && gold.is_empty() {
        return 1.0;
    }
    if pred.is_empty() || gold.is_empty() {
        return 0.0;
    }

    let hits = pred.intersection(&gold).count() as f64;
    if hits == 0.0 {
        return 0.0;
    }
    let precision = hits / pred.len() as f64;
    let recall = hits / gold.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KI: KnowledgeType = KnowledgeType::Intensive;
    const KF: KnowledgeType = KnowledgeType::Free;
    const C: HistoryType = HistoryType::Concise;
    const V: HistoryType = HistoryType::Verbose;

    fn names(items: &[&str]) -> Answer {
        Answer::List(items.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_integer_exact_match() {
        let qt = QuestionType::CountFrequencyTool;
        assert!(score(qt, KI, C, &Answer::Integer(3), &json!(3)).unwrap().correct);
        assert!(score(qt, KI, C, &Answer::Integer(3), &json!("3")).unwrap().correct);
        assert!(score(qt, KI, C, &Answer::Integer(3), &json!(3.0)).unwrap().correct);
        assert!(!score(qt, KI, C, &Answer::Integer(4), &json!(3)).unwrap().correct);
        assert!(score(qt, KI, C, &Answer::Text("3 times".into()), &json!(3)).unwrap().correct);
    }

    #[test]
    fn test_unparseable_scores_zero() {
        for qt in QuestionType::all() {
            let gold = match qt.answer_kind(V) {
                AnswerKind::Integer => json!(2),
                AnswerKind::Boolean => json!(true),
                AnswerKind::NamePair => json!(["a", "b"]),
                AnswerKind::NameSet | AnswerKind::Name => json!(["a"]),
            };
            let s = score(qt, KI, V, &Answer::Unparseable, &gold).unwrap();
            assert_eq!(s, Score::zero());
        }
    }

    #[test]
    fn test_boolean_gold_spellings() {
        let qt = QuestionType::FindDuplicatesTool;
        for gold in [json!(true), json!(1), json!("Yes"), json!("true")] {
            assert!(score(qt, KI, C, &Answer::Boolean(true), &gold).unwrap().correct);
        }
        for gold in [json!(false), json!(0), json!("no")] {
            assert!(score(qt, KI, C, &Answer::Boolean(false), &gold).unwrap().correct);
        }
        assert!(score(qt, KI, C, &Answer::Boolean(true), &json!("maybe")).is_err());
        assert!(score(qt, KI, C, &Answer::Boolean(false), &json!("nothing")).is_err());
        assert!(score(qt, KI, C, &Answer::Boolean(true), &json!("10")).is_err());
    }

    #[test]
    fn test_pair_is_ordered() {
        let qt = QuestionType::FindTargetOffsetsTool;
        let gold = json!(["Mr. Mime", "Pikachu"]);
        assert_eq!(score(qt, KI, C, &names(&["mr mime", "PIKACHU"]), &gold).unwrap().credit, 1.0);
        assert_eq!(score(qt, KI, C, &names(&["Pikachu", "Mr. Mime"]), &gold).unwrap().credit, 0.0);
        assert_eq!(score(qt, KI, C, &names(&["Mr. Mime", "Eevee"]), &gold).unwrap().credit, 0.0);
        let half = score(qt, KI, C, &names(&["Mr. Mime"]), &gold).unwrap();
        assert_eq!(half.credit, 0.5);
        assert!(!half.correct);
        assert_eq!(score(qt, KI, C, &names(&["Pikachu"]), &gold).unwrap().credit, 0.0);
        assert_eq!(
            score(qt, KI, C, &names(&["Mr. Mime", "Pikachu", "Eevee"]), &gold).unwrap().credit,
            0.0
        );
    }

    #[test]
    fn test_pair_with_wrong_second_name_earns_nothing() {
        let qt = QuestionType::FindTargetOffsetsTool;
        let s = score(qt, KF, C, &names(&["Item_3", "Item_9"]), &json!(["Item_3", "Item_7"])).unwrap();
        assert_eq!(s, Score::zero());
    }

    #[test]
    fn test_intersection_set_f1() {
        let qt = QuestionType::Intersection;
        let gold = json!(["Item_1", "Item_2"]);
        assert_eq!(score(qt, KF, V, &names(&["item2", "Item_1"]), &gold).unwrap().credit, 1.0);
        let partial = score(qt, KF, V, &names(&["Item_1", "Item_3"]), &gold).unwrap();
        assert!((partial.credit - 0.5).abs() < 1e-9);
        assert_eq!(score(qt, KF, V, &names(&[]), &json!([])).unwrap().credit, 1.0);
    }

    #[test]
    fn test_intersection_concise_identity() {
        let qt = QuestionType::Intersection;
        let s = score(qt, KF, C, &Answer::Text("Item_12".into()), &json!("Item_84")).unwrap();
        assert!(!s.correct);
        let s = score(qt, KF, C, &Answer::Text("item 84".into()), &json!("Item_84")).unwrap();
        assert!(s.correct);
        let s = score(qt, KI, C, &Answer::Text("Farfetch'd".into()), &json!(["farfetchd"])).unwrap();
        assert!(s.correct);
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Mr. Mime", KI), "mrmime");
        assert_eq!(normalize_name("Item_12", KF), "item12");
        assert_eq!(normalize_name("Item_12", KI), "item_12");
    }

    #[test]
    fn test_metric_name() {
        assert_eq!(metric_name(QuestionType::Intersection, V), "f1");
        assert_eq!(metric_name(QuestionType::Intersection, C), "accuracy");
        assert_eq!(metric_name(QuestionType::WeightedSummationEnv, V), "accuracy");
    }
}
