//! Request orchestration: one generation request in, one deck out.
//!
//! [`generate`] runs the whole pipeline and keeps the deck in memory;
//! [`generate_to_file`] additionally writes it under an output directory with
//! a collision-free name, which is what the HTTP server needs.
//!
//! Nothing here holds state between calls. The provider is borrowed, so one
//! [`GeminiProvider`](crate::pipeline::llm::GeminiProvider) behind an `Arc`
//! serves any number of concurrent requests.

use crate::config::{GenerationConfig, DEFAULT_DECK_NAME};
use crate::error::AnkiDexError;
use crate::output::{GenerationOutput, GenerationStats};
use crate::pipeline::coerce;
use crate::pipeline::deck::{self, DeckBuilder};
use crate::pipeline::extract::{self, PAGE_SEPARATOR};
use crate::pipeline::llm::{self, CompletionProvider};
use crate::prompts;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Inputs for one generation run.
///
/// At least one of `text` or `pdf` must yield non-blank content.
#[derive(Clone, Default)]
pub struct GenerationRequest {
    /// Pasted source text, appended after any PDF text.
    pub text: Option<String>,
    /// Raw bytes of an uploaded PDF.
    pub pdf: Option<Vec<u8>>,
    /// Requested card count. `None` uses `GenerationConfig::default_cards`.
    pub num_cards: Option<usize>,
    /// Deck title. `None` or blank uses [`DEFAULT_DECK_NAME`].
    pub deck_name: Option<String>,
    /// Per-request API key, taking precedence over config and environment.
    pub api_key: Option<String>,
}

impl fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("text_chars", &self.text.as_ref().map(|t| t.chars().count()))
            .field("pdf_bytes", &self.pdf.as_ref().map(Vec::len))
            .field("num_cards", &self.num_cards)
            .field("deck_name", &self.deck_name)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl GenerationRequest {
    pub fn builder() -> GenerationRequestBuilder {
        GenerationRequestBuilder::default()
    }
}

/// Builder for [`GenerationRequest`].
#[derive(Debug, Default)]
pub struct GenerationRequestBuilder {
    request: GenerationRequest,
}

impl GenerationRequestBuilder {
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.request.text = Some(text.into());
        self
    }

    pub fn pdf(mut self, bytes: Vec<u8>) -> Self {
        self.request.pdf = Some(bytes);
        self
    }

    pub fn num_cards(mut self, n: usize) -> Self {
        self.request.num_cards = Some(n);
        self
    }

    pub fn deck_name(mut self, name: impl Into<String>) -> Self {
        self.request.deck_name = Some(name.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.request.api_key = Some(key.into());
        self
    }

    pub fn build(self) -> GenerationRequest {
        self.request
    }
}

/// A generated deck that has been written to disk.
#[derive(Debug, Clone)]
pub struct SavedDeck {
    pub path: PathBuf,
    pub output: GenerationOutput,
}

/// Run the full pipeline for one request.
///
/// # Errors
/// - [`AnkiDexError::InvalidCardCount`] / [`AnkiDexError::EmptyInput`] for bad
///   requests, before any network call
/// - [`AnkiDexError::MissingCredential`] when no API key can be found
/// - PDF, model and response errors from the pipeline stages
/// - [`AnkiDexError::NoFlashcards`] when the response held no valid entry
pub async fn generate(
    request: GenerationRequest,
    provider: &dyn CompletionProvider,
    config: &GenerationConfig,
) -> Result<GenerationOutput, AnkiDexError> {
    let total_start = Instant::now();
    debug!("Generation request: {:?}", request);

    let requested = config.check_card_count(request.num_cards.unwrap_or(config.default_cards))?;

    // ── Step 1: Source text ──────────────────────────────────────────────
    let extract_start = Instant::now();
    let pdf_text = match request.pdf {
        Some(bytes) => Some(extract::extract_text(bytes).await?),
        None => None,
    };
    let extract_duration_ms = extract_start.elapsed().as_millis() as u64;

    let source = combine_sources(pdf_text.as_deref(), request.text.as_deref());
    if source.trim().is_empty() {
        return Err(AnkiDexError::EmptyInput);
    }
    let source_chars = source.chars().count();

    // ── Step 2: Credential ───────────────────────────────────────────────
    let api_key = config.resolve_api_key(request.api_key.as_deref())?;

    // ── Step 3: Model call ───────────────────────────────────────────────
    info!(
        "Generating {} cards from {} chars with {}",
        requested,
        source_chars,
        provider.name()
    );
    let prompt = prompts::build_prompt(&source, requested)?;
    let llm_start = Instant::now();
    let (completion, retries) = llm::complete_with_retry(provider, &prompt, &api_key, config).await?;
    let llm_duration_ms = llm_start.elapsed().as_millis() as u64;

    // ── Step 4: Coerce ───────────────────────────────────────────────────
    let report = coerce::coerce_flashcards(&completion.text)?;
    if !report.rejected.is_empty() {
        warn!("Dropped {} malformed model entries", report.rejected.len());
    }
    if report.cards.is_empty() {
        return Err(AnkiDexError::NoFlashcards {
            rejected: report.rejected.len(),
        });
    }
    if report.cards.len() != requested {
        warn!(
            "Model returned {} cards, {} were requested",
            report.cards.len(),
            requested
        );
    }

    // ── Step 5: Package ──────────────────────────────────────────────────
    let builder = DeckBuilder::new(request.deck_name.unwrap_or_else(|| DEFAULT_DECK_NAME.to_string()));
    let deck_name = builder.name().to_string();
    let cards = report.cards.clone();
    let deck_start = Instant::now();
    let deck = tokio::task::spawn_blocking(move || builder.build_apkg(&cards))
        .await
        .map_err(|e| AnkiDexError::Internal(format!("Deck task panicked: {}", e)))??;
    let deck_duration_ms = deck_start.elapsed().as_millis() as u64;

    let stats = GenerationStats {
        source_chars,
        requested_cards: requested,
        produced_cards: report.cards.len(),
        rejected_entries: report.rejected.len(),
        prompt_tokens: completion.prompt_tokens,
        output_tokens: completion.output_tokens,
        retries,
        extract_duration_ms,
        llm_duration_ms,
        deck_duration_ms,
        total_duration_ms: total_start.elapsed().as_millis() as u64,
    };

    info!(
        "Generation complete: {} cards in '{}', {}ms total",
        stats.produced_cards, deck_name, stats.total_duration_ms
    );

    Ok(GenerationOutput {
        flashcards: report.cards,
        rejected: report.rejected,
        deck_name,
        deck,
        stats,
    })
}

/// Run [`generate`] and write the deck to `<output_dir>/<uuid>.apkg`.
pub async fn generate_to_file(
    request: GenerationRequest,
    provider: &dyn CompletionProvider,
    config: &GenerationConfig,
    output_dir: impl AsRef<Path>,
) -> Result<SavedDeck, AnkiDexError> {
    let output = generate(request, provider, config).await?;
    let path = output_dir.as_ref().join(format!("{}.apkg", Uuid::new_v4()));
    deck::write_apkg(&output.deck, &path).await?;
    debug!("Deck written to {}", path.display());
    Ok(SavedDeck { path, output })
}

/// PDF text first, then pasted text, separated like pages are.
fn combine_sources(pdf_text: Option<&str>, text: Option<&str>) -> String {
    [pdf_text, text.map(str::trim)]
        .into_iter()
        .flatten()
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join(PAGE_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::deck::read_apkg;
    use crate::pipeline::llm::Completion;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays one canned reply and records every prompt it is sent.
    struct Scripted {
        reply: Result<String, fn() -> AnkiDexError>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn ok(text: &str) -> Self {
            Self {
                reply: Ok(text.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn failing(error: fn() -> AnkiDexError) -> Self {
            Self {
                reply: Err(error),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CompletionProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, prompt: &str, _api_key: &str) -> Result<Completion, AnkiDexError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            match &self.reply {
                Ok(text) => Ok(Completion {
                    text: text.clone(),
                    prompt_tokens: 120,
                    output_tokens: 40,
                }),
                Err(make) => Err(make()),
            }
        }
    }

    const TWO_CARDS: &str = r#"[
        {"question": "What is osmosis?", "answer": "Diffusion of water across a membrane."},
        {"question": "What is a solute?", "answer": "A dissolved substance."}
    ]"#;

    fn config() -> GenerationConfig {
        GenerationConfig::builder().api_key("test-key").build().unwrap()
    }

    #[tokio::test]
    async fn text_request_produces_deck() {
        let provider = Scripted::ok(TWO_CARDS);
        let request = GenerationRequest::builder()
            .text("Osmosis moves water across membranes.")
            .num_cards(2)
            .deck_name("Biology")
            .build();

        let output = generate(request, &provider, &config()).await.unwrap();

        assert_eq!(output.flashcards.len(), 2);
        assert_eq!(output.deck_name, "Biology");
        assert_eq!(output.stats.requested_cards, 2);
        assert_eq!(output.stats.produced_cards, 2);
        assert_eq!(output.stats.prompt_tokens, 120);
        assert_eq!(output.stats.retries, 0);

        let contents = read_apkg(&output.deck).unwrap();
        assert_eq!(contents.cards, output.flashcards);
        assert_eq!(contents.deck_names, vec!["Biology".to_string()]);
    }

    #[tokio::test]
    async fn prompt_carries_text_and_count() {
        let provider = Scripted::ok(TWO_CARDS);
        let request = GenerationRequest::builder()
            .text("  Mitochondria make ATP.  ")
            .num_cards(7)
            .build();

        generate(request, &provider, &config()).await.unwrap();

        let prompts = provider.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("exactly 7"));
        assert!(prompts[0].contains("Mitochondria make ATP."));
    }

    #[tokio::test]
    async fn blank_input_is_rejected_before_model_call() {
        let provider = Scripted::ok(TWO_CARDS);
        for request in [
            GenerationRequest::default(),
            GenerationRequest::builder().text(" \n\t ").build(),
        ] {
            let err = generate(request, &provider, &config()).await.unwrap_err();
            assert!(matches!(err, AnkiDexError::EmptyInput));
            assert!(err.is_client_error());
        }
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn zero_cards_is_a_client_error() {
        let provider = Scripted::ok(TWO_CARDS);
        let request = GenerationRequest::builder().text("text").num_cards(0).build();
        let err = generate(request, &provider, &config()).await.unwrap_err();
        assert!(matches!(err, AnkiDexError::InvalidCardCount { count: 0, .. }));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn non_pdf_upload_is_rejected() {
        let provider = Scripted::ok(TWO_CARDS);
        let request = GenerationRequest::builder().pdf(b"GIF89a".to_vec()).build();
        let result = generate(request, &provider, &config()).await;
        assert!(matches!(result, Err(AnkiDexError::NotAPdf { .. })));
    }

    #[tokio::test]
    async fn missing_credential_skips_model_call() {
        if std::env::var(crate::config::API_KEY_ENV).is_ok() {
            return;
        }
        let provider = Scripted::ok(TWO_CARDS);
        let request = GenerationRequest::builder().text("text").build();
        let result = generate(request, &provider, &GenerationConfig::default()).await;
        assert!(matches!(result, Err(AnkiDexError::MissingCredential)));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn all_entries_malformed_is_no_flashcards() {
        let provider = Scripted::ok(r#"[{"question": "Q"}, "nope"]"#);
        let request = GenerationRequest::builder().text("text").build();
        let err = generate(request, &provider, &config()).await.unwrap_err();
        assert!(matches!(err, AnkiDexError::NoFlashcards { rejected: 2 }));
    }

    #[tokio::test]
    async fn partial_response_keeps_valid_cards() {
        let provider = Scripted::ok(r#"[{"question": "Q1", "answer": "A1"}, {"answer": "A2"}]"#);
        let request = GenerationRequest::builder().text("text").num_cards(2).build();
        let output = generate(request, &provider, &config()).await.unwrap();
        assert_eq!(output.flashcards.len(), 1);
        assert_eq!(output.rejected.len(), 1);
        assert_eq!(output.stats.rejected_entries, 1);
    }

    #[tokio::test]
    async fn prose_response_is_format_error() {
        let provider = Scripted::ok("I cannot help with that.");
        let request = GenerationRequest::builder().text("text").build();
        let result = generate(request, &provider, &config()).await;
        assert!(matches!(result, Err(AnkiDexError::ResponseFormat { .. })));
    }

    #[tokio::test]
    async fn provider_error_propagates() {
        let provider = Scripted::failing(|| AnkiDexError::AuthError {
            provider: "scripted".into(),
            detail: "bad key".into(),
        });
        let request = GenerationRequest::builder().text("text").build();
        let err = generate(request, &provider, &config()).await.unwrap_err();
        assert!(matches!(err, AnkiDexError::AuthError { .. }));
        assert!(!err.is_client_error());
    }

    #[tokio::test]
    async fn blank_deck_name_uses_default() {
        let provider = Scripted::ok(TWO_CARDS);
        let request = GenerationRequest::builder().text("text").deck_name("  ").build();
        let output = generate(request, &provider, &config()).await.unwrap();
        assert_eq!(output.deck_name, DEFAULT_DECK_NAME);
    }

    #[tokio::test]
    async fn generate_to_file_writes_unique_apkg() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Scripted::ok(TWO_CARDS);
        let request = || GenerationRequest::builder().text("text").build();

        let first = generate_to_file(request(), &provider, &config(), dir.path())
            .await
            .unwrap();
        let second = generate_to_file(request(), &provider, &config(), dir.path())
            .await
            .unwrap();

        assert_ne!(first.path, second.path);
        assert_eq!(first.path.extension().and_then(|e| e.to_str()), Some("apkg"));
        assert_eq!(std::fs::read(&first.path).unwrap(), first.output.deck);
    }

    #[test]
    fn sources_join_with_blank_line() {
        assert_eq!(combine_sources(Some("pdf"), Some("  typed ")), "pdf\n\ntyped");
        assert_eq!(combine_sources(None, Some("typed")), "typed");
        assert_eq!(combine_sources(Some(""), Some("typed")), "typed");
        assert_eq!(combine_sources(Some("pdf"), None), "pdf");
        assert_eq!(combine_sources(None, None), "");
    }
}
