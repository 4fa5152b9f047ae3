//! Answer extraction from raw model text
//!
//! Extraction is tried in a fixed order: a structured marker the prompt asks
//! for (`<answer>…</answer>`, then `\boxed{…}`), then a pattern suited to the
//! expected answer shape over the whole response, then the unparseable
//! sentinel. Nothing in here returns an error; unreadable output is data.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::dataset::{AnswerKind, HistoryType, QuestionType};

/// A parsed answer, typed by question shape
///
/// Serialized untagged, so the sentinel is written as JSON `null`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Answer {
    Integer(i64),
    Boolean(bool),
    List(Vec<String>),
    Text(String),
    #[default]
    Unparseable,
}

impl Answer {
    pub fn is_unparseable(&self) -> bool {
        matches!(self, Answer::Unparseable)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl std::fmt::Display for Answer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Answer::Integer(n) => write!(f, "{}", n),
            Answer::Boolean(b) => write!(f, "{}", b),
            Answer::List(items) => write!(f, "[{}]", items.join(", ")),
            Answer::Text(s) => write!(f, "{}", s),
            Answer::Unparseable => write!(f, "<unparseable>"),
        }
    }
}

/// Which extraction rule produced an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParseKind {
    AnswerTag,
    Boxed,
    LastInteger,
    YesNo,
    NamePair,
    JsonList,
    DelimitedList,
    FinalGuess,
    FallbackNone,
}

impl ParseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseKind::AnswerTag => "answer-tag",
            ParseKind::Boxed => "boxed",
            ParseKind::LastInteger => "last-integer",
            ParseKind::YesNo => "yes-no",
            ParseKind::NamePair => "name-pair",
            ParseKind::JsonList => "json-list",
            ParseKind::DelimitedList => "delimited-list",
            ParseKind::FinalGuess => "final-guess",
            ParseKind::FallbackNone => "fallback-none",
        }
    }
}

/// Parser output: the answer plus the rule that matched
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAnswer {
    pub answer: Answer,
    pub kind: ParseKind,
}

impl ParsedAnswer {
    pub fn unparseable() -> Self {
        Self {
            answer: Answer::Unparseable,
            kind: ParseKind::FallbackNone,
        }
    }
}

fn answer_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<answer>(.*?)</answer>").expect("answer tag regex"))
}

fn boxed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\\boxed\{((?:[^{}]|\{[^{}]*\})*)\}").expect("boxed regex")
    })
}

fn latex_wrapper_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\\(?:text|mathrm|textbf|mathbf)\{([^{}]*)\}").expect("latex wrapper regex")
    })
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d[\d,]*(?:\.\d+)?").expect("number regex"))
}

fn negative_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(no|false|not|doesn't|does not|none|neither)\b").expect("negative regex")
    })
}

fn positive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(yes|true|contain|contains|appear|appears|does|both)\b")
            .expect("positive regex")
    })
}

fn final_guess_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:final\s+(?:guess|answer)|the\s+(?:answer|target)|answer)\s*(?:is|:|=)\s*([^\n]+)",
        )
        .expect("final guess regex")
    })
}

fn masked_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Za-z]+_\d+\b").expect("masked id regex"))
}

fn json_array_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\[\]]*\]").expect("json array regex"))
}

fn and_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\band\b").expect("and regex"))
}

fn enumeration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:\d+[.)]?\s+|[-*•]\s+)").expect("enumeration regex"))
}

fn lead_in_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:\**\s*(?:final\s+)?answer\s*\**\s*[:：]\s*|the\s+answer\s+is\s+)")
            .expect("lead-in regex")
    })
}

/// Parse a raw model response for the given question type
///
/// `history` only matters for Intersection, whose verbose variant expects a
/// list and whose concise variant expects a single name.
pub fn parse_response(
    question_type: QuestionType,
    history: HistoryType,
    raw: &str,
) -> ParsedAnswer {
    let kind = question_type.answer_kind(history);

    if let Some((marker, body)) = extract_marker(raw) {
        if let Some(answer) = interpret_marker_body(kind, &body) {
            return ParsedAnswer { answer, kind: marker };
        }
    }

    match scan_free_text(kind, raw) {
        Some((answer, kind)) => ParsedAnswer { answer, kind },
        None => ParsedAnswer::unparseable(),
    }
}

/// The last `<answer>` body, else the last `\boxed{}` body
fn extract_marker(raw: &str) -> Option<(ParseKind, String)> {
    if let Some(caps) = answer_tag_re().captures_iter(raw).last() {
        return Some((ParseKind::AnswerTag, caps[1].trim().to_string()));
    }
    if let Some(caps) = boxed_re().captures_iter(raw).last() {
        let inner = latex_wrapper_re().replace_all(&caps[1], "$1");
        return Some((ParseKind::Boxed, inner.trim().to_string()));
    }
    None
}

fn interpret_marker_body(kind: AnswerKind, body: &str) -> Option<Answer> {
    if body.is_empty() {
        return None;
    }
    match kind {
        AnswerKind::Integer => last_integer(body).map(Answer::Integer),
        AnswerKind::Boolean => marker_boolean(body).map(Answer::Boolean),
        AnswerKind::NamePair => {
            let items = split_names(body);
            (!items.is_empty()).then_some(Answer::List(items))
        }
        AnswerKind::NameSet => {
            let items = json_list(body).unwrap_or_else(|| split_names(body));
            let items = dedup(items);
            (!items.is_empty()).then_some(Answer::List(items))
        }
        AnswerKind::Name => {
            let name = clean_name(body);
            (!name.is_empty()).then_some(Answer::Text(name))
        }
    }
}

fn scan_free_text(kind: AnswerKind, raw: &str) -> Option<(Answer, ParseKind)> {
    match kind {
        AnswerKind::Integer => last_integer(raw).map(|n| (Answer::Integer(n), ParseKind::LastInteger)),
        AnswerKind::Boolean => {
            marker_boolean(raw).map(|b| (Answer::Boolean(b), ParseKind::YesNo))
        }
        AnswerKind::NamePair => {
            let line = last_line(raw)?;
            let items = split_names(&line);
            (items.len() == 2).then(|| (Answer::List(items), ParseKind::NamePair))
        }
        AnswerKind::NameSet => {
            if let Some(list) = json_array_re()
                .find_iter(raw)
                .filter_map(|m| json_list(m.as_str()))
                .last()
            {
                let list = dedup(list);
                if !list.is_empty() {
                    return Some((Answer::List(list), ParseKind::JsonList));
                }
            }
            let items = dedup(split_names(&last_line(raw)?));
            (!items.is_empty()).then(|| (Answer::List(items), ParseKind::DelimitedList))
        }
        AnswerKind::Name => {
            let captures: Vec<_> = final_guess_re().captures_iter(raw).collect();
            if let Some(name) = captures.iter().rev().find_map(|caps| guessed_name(&caps[1])) {
                return Some((Answer::Text(name), ParseKind::FinalGuess));
            }
            masked_id_re()
                .find_iter(raw)
                .last()
                .map(|m| (Answer::Text(m.as_str().to_string()), ParseKind::FinalGuess))
        }
    }
}

/// Last integer in `text`; thousands separators allowed, decimals truncated
pub fn last_integer(text: &str) -> Option<i64> {
    number_re()
        .find_iter(text)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .find_map(|m| {
            let clean = m.as_str().replace(',', "");
            clean.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)
        })
}

/// Longest sentence-bounded prefix of `text` shaped like an entity name
///
/// "Mr. Mime." keeps its inner period, while "Item_12. I am sure." stops
/// at the first sentence.
fn guessed_name(text: &str) -> Option<String> {
    let text = text.trim();
    let mut cuts: Vec<usize> = text
        .char_indices()
        .filter(|&(i, c)| {
            matches!(c, '.' | ',' | ';' | '!' | '?')
                && text[i + c.len_utf8()..].starts_with(char::is_whitespace)
        })
        .map(|(i, _)| i)
        .collect();
    cuts.push(text.len());

    cuts.into_iter()
        .rev()
        .map(|end| clean_name(&text[..end]))
        .find(|candidate| looks_like_name(candidate))
}

/// A masked id, or up to four words that each open with a capital or digit
fn looks_like_name(candidate: &str) -> bool {
    let words: Vec<&str> = candidate.split_whitespace().collect();
    if words.is_empty() || words.len() > 4 {
        return false;
    }
    words.iter().all(|word| {
        masked_id_re().is_match(word)
            || word
                .chars()
                .next()
                .map_or(false, |c| c.is_uppercase() || c.is_ascii_digit())
    })
}

fn marker_boolean(body: &str) -> Option<bool> {
    if negative_re().is_match(body) {
        return Some(false);
    }
    if positive_re().is_match(body) {
        return Some(true);
    }
    number_re()
        .find(body)
        .and_then(|m| m.as_str().replace(',', "").parse::<f64>().ok())
        .map(|n| n > 0.0)
}

fn json_list(text: &str) -> Option<Vec<String>> {
    let trimmed = text.trim();
    if !(trimmed.starts_with('[') && trimmed.ends_with(']')) {
        return None;
    }
    let values: Vec<serde_json::Value> = serde_json::from_str(trimmed).ok()?;
    Some(
        values
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s.trim().to_string()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
    )
}

/// Split on commas, semicolons, pipes, newlines and the word "and"
fn split_names(text: &str) -> Vec<String> {
    let stripped = text.trim().trim_start_matches('[').trim_end_matches(']');
    let normalized = and_re().replace_all(stripped, ",");
    normalized
        .split([',', ';', '|', '\n'])
        .map(|chunk| clean_name(&enumeration_re().replace(chunk.trim(), "")))
        .filter(|item| !item.is_empty())
        .collect()
}

fn clean_name(text: &str) -> String {
    let text = lead_in_re().replace(text.trim(), "");
    text.trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '*' | '[' | ']' | '(' | ')'))
        .trim_end_matches(['.', '!', '?'])
        .trim()
        .to_string()
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(|l| lead_in_re().replace(l, "").to_string())
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|i| seen.insert(i.clone())).collect()
}
