//! Error types for the ankidex library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`AnkiDexError`] — **Fatal**: the generation request cannot produce a
//!   deck (no input, unreadable PDF, missing API key, model unreachable, model
//!   output not parseable at all). Returned as `Err(AnkiDexError)` from the
//!   top-level `generate*` functions and mapped to an HTTP status by the server.
//!
//! * [`EntryRejection`] — **Non-fatal**: one entry of an otherwise parseable
//!   model response was malformed and has been dropped. Collected in
//!   [`crate::pipeline::coerce::CoercionReport`] so callers can inspect partial
//!   success instead of losing the whole response to one bad entry.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the ankidex library.
#[derive(Debug, Error)]
pub enum AnkiDexError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Neither PDF text nor pasted text produced any content.
    #[error("Please provide a PDF file or text input")]
    EmptyInput,

    /// The requested number of flashcards is outside the accepted range.
    #[error("Invalid card count {count}: {}", card_range(.max))]
    InvalidCardCount { count: usize, max: Option<usize> },

    /// The uploaded bytes are not a PDF.
    #[error("Uploaded file is not a valid PDF (first bytes: {magic:?})")]
    NotAPdf { magic: Vec<u8> },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// pdfium could not open or parse the document.
    #[error("Failed to extract text from PDF: {detail}")]
    DocumentUnreadable { detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or place the library in the working directory."
    )]
    PdfiumBindingFailed(String),

    // ── LLM errors ────────────────────────────────────────────────────────
    /// No API key in the request, the configuration or the environment.
    #[error(
        "Gemini API key is required. Set the GEMINI_API_KEY environment variable or pass api_key."
    )]
    MissingCredential,

    /// The model API returned an error status, or the network failed.
    ///
    /// `status` is `None` for transport failures that never got a response.
    #[error("LLM API error: {message}")]
    LlmApiError {
        status: Option<u16>,
        message: String,
    },

    /// Model API returned HTTP 429.
    #[error("Rate limit exceeded for provider '{provider}'")]
    RateLimitExceeded {
        provider: String,
        retry_after_secs: Option<u64>,
    },

    /// Model API call did not finish within the configured timeout.
    #[error("API call timed out after {secs}s")]
    ApiTimeout { secs: u64 },

    /// Model API rejected the credential (401/403).
    #[error("Authentication error from provider '{provider}': {detail}")]
    AuthError { provider: String, detail: String },

    // ── Response errors ───────────────────────────────────────────────────
    /// The model output could not be parsed as a JSON array at all.
    #[error("Failed to parse AI response as JSON: {detail}")]
    ResponseFormat { detail: String },

    /// The response parsed but contained no usable flashcard.
    #[error("Failed to generate flashcards from the content ({rejected} malformed entries dropped)")]
    NoFlashcards { rejected: usize },

    // ── Output errors ─────────────────────────────────────────────────────
    /// Writing the collection database or the zip archive failed.
    #[error("Failed to build Anki deck: {0}")]
    DeckBuildFailed(String),

    /// Could not create or write the output deck file.
    #[error("Failed to write deck file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn card_range(max: &Option<usize>) -> String {
    match max {
        Some(max) => format!("must be between 1 and {max}"),
        None => "must be at least 1".to_string(),
    }
}

impl AnkiDexError {
    /// True when the request itself was at fault (HTTP 400 territory).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AnkiDexError::EmptyInput | AnkiDexError::InvalidCardCount { .. }
        )
    }

    /// True when repeating the same model call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AnkiDexError::ApiTimeout { .. } | AnkiDexError::RateLimitExceeded { .. } => true,
            AnkiDexError::LlmApiError { status, .. } => status.is_some_and(|s| s >= 500),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for AnkiDexError {
    fn from(e: rusqlite::Error) -> Self {
        AnkiDexError::DeckBuildFailed(format!("sqlite: {e}"))
    }
}

impl From<zip::result::ZipError> for AnkiDexError {
    fn from(e: zip::result::ZipError) -> Self {
        AnkiDexError::DeckBuildFailed(format!("zip: {e}"))
    }
}

/// Why a single model entry was dropped.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RejectReason {
    /// The entry is not a JSON object.
    NotAnObject,
    /// A required key is absent.
    MissingField(String),
    /// The value is `null`, an array or an object.
    UnsupportedValue(String),
    /// The value is empty or whitespace only.
    EmptyField(String),
}

/// A non-fatal error for one entry of the model's array.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[error("Entry {index}: {reason}")]
pub struct EntryRejection {
    /// 0-based position in the model's array.
    pub index: usize,
    pub reason: RejectReason,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::NotAnObject => write!(f, "not an object"),
            RejectReason::MissingField(k) => write!(f, "missing field '{k}'"),
            RejectReason::UnsupportedValue(k) => write!(f, "field '{k}' is not a scalar"),
            RejectReason::EmptyField(k) => write!(f, "field '{k}' is empty"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_message_matches_form_hint() {
        let msg = AnkiDexError::EmptyInput.to_string();
        assert_eq!(msg, "Please provide a PDF file or text input");
    }

    #[test]
    fn no_flashcards_display() {
        let e = AnkiDexError::NoFlashcards { rejected: 3 };
        let msg = e.to_string();
        assert!(msg.starts_with("Failed to generate flashcards from the content"));
        assert!(msg.contains('3'), "got: {msg}");
    }

    #[test]
    fn client_errors() {
        assert!(AnkiDexError::EmptyInput.is_client_error());
        assert!(AnkiDexError::InvalidCardCount { count: 0, max: Some(100) }.is_client_error());
        assert!(!AnkiDexError::MissingCredential.is_client_error());
        assert!(!AnkiDexError::ResponseFormat { detail: "x".into() }.is_client_error());
    }

    #[test]
    fn transient_errors() {
        assert!(AnkiDexError::ApiTimeout { secs: 5 }.is_transient());
        assert!(AnkiDexError::RateLimitExceeded {
            provider: "gemini".into(),
            retry_after_secs: None,
        }
        .is_transient());
        assert!(AnkiDexError::LlmApiError {
            status: Some(503),
            message: "HTTP 503 Service Unavailable".into(),
        }
        .is_transient());
        assert!(!AnkiDexError::LlmApiError {
            status: Some(400),
            message: "HTTP 400 Bad Request".into(),
        }
        .is_transient());
        assert!(!AnkiDexError::LlmApiError {
            status: None,
            message: "connection refused".into(),
        }
        .is_transient());
        assert!(!AnkiDexError::AuthError {
            provider: "gemini".into(),
            detail: "bad key".into(),
        }
        .is_transient());
    }

    #[test]
    fn entry_rejection_display() {
        let r = EntryRejection {
            index: 2,
            reason: RejectReason::MissingField("answer".into()),
        };
        assert_eq!(r.to_string(), "Entry 2: missing field 'answer'");
    }

    #[test]
    fn api_timeout_display() {
        let e = AnkiDexError::ApiTimeout { secs: 60 };
        assert!(e.to_string().contains("60s"));
    }
}
