//! Result types produced by a generation run.

use crate::error::EntryRejection;
use serde::{Deserialize, Serialize};

/// One question/answer flashcard.
///
/// Both fields are guaranteed non-empty once constructed by the coercer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Flashcard {
    pub question: String,
    pub answer: String,
}

impl Flashcard {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

/// Everything a successful generation produced.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutput {
    /// Validated cards, in the order the model returned them.
    pub flashcards: Vec<Flashcard>,
    /// Model entries that were dropped during coercion.
    pub rejected: Vec<EntryRejection>,
    pub deck_name: String,
    /// The `.apkg` archive bytes.
    #[serde(skip)]
    pub deck: Vec<u8>,
    pub stats: GenerationStats,
}

/// Counters and timings for one generation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationStats {
    /// Characters of source text sent to the model.
    pub source_chars: usize,
    pub requested_cards: usize,
    pub produced_cards: usize,
    pub rejected_entries: usize,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    /// Model attempts beyond the first.
    pub retries: u32,
    pub extract_duration_ms: u64,
    pub llm_duration_ms: u64,
    pub deck_duration_ms: u64,
    pub total_duration_ms: u64,
}
