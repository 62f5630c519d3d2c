//! # ankidex
//!
//! Turn PDFs and study notes into Anki flashcard decks with Google Gemini.
//!
//! ## Why this crate?
//!
//! Writing flashcards by hand is the slow part of spaced repetition. This
//! crate pulls the text out of a PDF (or takes pasted notes), asks a model for
//! question/answer pairs, checks every pair it gets back, and packages the
//! survivors as an `.apkg` file that Anki imports directly.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF bytes / text
//!  │
//!  ├─ 1. Extract  page text via pdfium (spawn_blocking)
//!  ├─ 2. Prompt   fixed instruction block + source text
//!  ├─ 3. Model    one Gemini generateContent call (timeout, optional retry)
//!  ├─ 4. Coerce   JSON array → validated flashcards + rejected entries
//!  └─ 5. Package  collection.anki2 + media map → .apkg zip
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ankidex::{generate, GeminiProvider, GenerationConfig, GenerationRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // API key read from GEMINI_API_KEY unless set on the config or request
//!     let config = GenerationConfig::default();
//!     let provider = GeminiProvider::new(&config)?;
//!     let request = GenerationRequest::builder()
//!         .text("The mitochondrion is the powerhouse of the cell.")
//!         .num_cards(5)
//!         .deck_name("Biology")
//!         .build();
//!
//!     let output = generate(request, &provider, &config).await?;
//!     std::fs::write("biology.apkg", &output.deck)?;
//!     eprintln!("{} cards", output.flashcards.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `ankidex` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! The HTTP server ([`server`]) is part of the library so it can be embedded
//! or tested without the binary.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod generate;
pub mod output;
pub mod pipeline;
pub mod prompts;
pub mod server;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{GenerationConfig, GenerationConfigBuilder, ServerConfig};
pub use error::{AnkiDexError, EntryRejection, RejectReason};
pub use generate::{generate, generate_to_file, GenerationRequest, GenerationRequestBuilder, SavedDeck};
pub use output::{Flashcard, GenerationOutput, GenerationStats};
pub use pipeline::coerce::{coerce_flashcards, CoercionReport};
pub use pipeline::deck::{read_apkg, write_apkg, ApkgContents, DeckBuilder, DeckIds};
pub use pipeline::llm::{Completion, CompletionProvider, GeminiProvider};
