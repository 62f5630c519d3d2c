//! Prompt construction for flashcard generation.
//!
//! Every instruction the model sees lives here, so a prompt change is a
//! one-file edit and unit tests can inspect the exact text without calling
//! the model.

use crate::error::AnkiDexError;

/// Output-format example embedded in every prompt.
pub const JSON_EXAMPLE: &str = r#"[
  {"question": "What is...?", "answer": "The answer is..."},
  {"question": "How does...?", "answer": "It works by..."}
]"#;

/// Build the instruction prompt for `count` flashcards about `source_text`.
///
/// The source text is embedded verbatim. Pure and deterministic: the same
/// inputs always produce the same prompt.
///
/// # Errors
/// [`AnkiDexError::InvalidCardCount`] when `count` is zero.
pub fn build_prompt(source_text: &str, count: usize) -> Result<String, AnkiDexError> {
    if count == 0 {
        return Err(AnkiDexError::InvalidCardCount { count, max: None });
    }

    Ok(format!(
        "You are an expert educator creating flashcards for students.

Analyze the following text and create exactly {count} high-quality flashcards for studying.

Rules:
1. Each flashcard should have a clear, specific, testable question
2. Answers should be concise but complete
3. Focus on key concepts, definitions, and important facts
4. Questions should test understanding, not just recall
5. Avoid yes/no questions

Return your response as a valid JSON array with this exact format:
{JSON_EXAMPLE}

Every element must be an object with a \"question\" string and an \"answer\" string.

Text to analyze:
{source_text}

Return ONLY the JSON array, no other text."
    ))
}
