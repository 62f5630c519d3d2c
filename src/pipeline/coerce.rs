//! Response coercion: untrusted model text → validated [`Flashcard`]s.
//!
//! Models are unreliable at following output-format instructions: they wrap
//! JSON in markdown fences, rename fields, emit numbers where strings were
//! asked for. All of that is absorbed here, with two failure tiers:
//!
//! * the text is not a JSON array at all → [`AnkiDexError::ResponseFormat`]
//!   (hard failure, nothing is returned);
//! * individual entries are malformed → recorded as [`EntryRejection`]s and
//!   dropped (soft failure, the rest survive).
//!
//! An empty array is a valid result here; whether zero cards fails the
//! request is the orchestrator's decision.

use crate::error::{AnkiDexError, EntryRejection, RejectReason};
use crate::output::Flashcard;
use serde_json::{Map, Value};
use tracing::debug;

/// Outcome of coercing one model response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoercionReport {
    /// Valid cards in original order.
    pub cards: Vec<Flashcard>,
    /// Dropped entries, in original order.
    pub rejected: Vec<EntryRejection>,
}

/// Coerce a raw completion into flashcards.
///
/// Steps:
/// 1. Trim surrounding whitespace
/// 2. If the text opens with a ```` ``` ```` fence, drop its first and last line
/// 3. Parse as JSON; anything other than an array is a hard error
/// 4. Keep objects carrying both `question` and `answer` as non-empty scalars
pub fn coerce_flashcards(raw: &str) -> Result<CoercionReport, AnkiDexError> {
    let body = strip_code_fence(raw.trim());

    let value: Value = serde_json::from_str(&body).map_err(|e| AnkiDexError::ResponseFormat {
        detail: e.to_string(),
    })?;

    let entries = match value {
        Value::Array(entries) => entries,
        other => {
            return Err(AnkiDexError::ResponseFormat {
                detail: format!("expected a JSON array, found {}", json_kind(&other)),
            })
        }
    };

    let mut report = CoercionReport::default();
    for (index, entry) in entries.iter().enumerate() {
        match validate_entry(entry) {
            Ok(card) => report.cards.push(card),
            Err(reason) => {
                debug!("Dropping model entry {}: {}", index, reason);
                report.rejected.push(EntryRejection { index, reason });
            }
        }
    }

    Ok(report)
}

/// Remove a surrounding markdown code fence.
///
/// Only applies when the text starts with ```` ``` ````; the first and last
/// lines are then discarded whatever they contain.
fn strip_code_fence(text: &str) -> String {
    if !text.starts_with("```") {
        return text.to_string();
    }
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= 2 {
        return String::new();
    }
    lines[1..lines.len() - 1].join("\n")
}

fn validate_entry(entry: &Value) -> Result<Flashcard, RejectReason> {
    let obj = entry.as_object().ok_or(RejectReason::NotAnObject)?;
    let question = scalar_field(obj, "question")?;
    let answer = scalar_field(obj, "answer")?;
    Ok(Flashcard { question, answer })
}

fn scalar_field(obj: &Map<String, Value>, key: &str) -> Result<String, RejectReason> {
    let text = match obj.get(key) {
        None => return Err(RejectReason::MissingField(key.to_string())),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Null | Value::Array(_) | Value::Object(_)) => {
            return Err(RejectReason::UnsupportedValue(key.to_string()))
        }
    };
    if text.trim().is_empty() {
        return Err(RejectReason::EmptyField(key.to_string()));
    }
    Ok(text)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
