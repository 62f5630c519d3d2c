//! Model interaction: send the prompt to Gemini and return the raw completion.
//!
//! This module is intentionally thin. Prompt text lives in [`crate::prompts`]
//! and output validation in [`crate::pipeline::coerce`], so neither changes
//! when the transport does.
//!
//! ## Retry Strategy
//!
//! By default a failed call is not retried: the error goes straight back to
//! the caller. With `max_retries > 0`, transient failures (timeouts, 429,
//! 5xx) are retried with exponential backoff
//! (`retry_backoff_ms * 2^(attempt-1)`); auth and 4xx errors never are.

use crate::config::GenerationConfig;
use crate::error::AnkiDexError;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Raw model output plus token accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
}

/// The single external call the pipeline makes.
///
/// Implementations must be shareable across concurrent requests; the API key
/// is passed per call so one instance serves every caller.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Short provider name for logs and error messages.
    fn name(&self) -> &str;

    /// Send `prompt` and return the model's text.
    async fn complete(&self, prompt: &str, api_key: &str) -> Result<Completion, AnkiDexError>;
}

/// Google Gemini `generateContent` client.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    http: reqwest::Client,
    api_base: String,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
    json_mode: bool,
    timeout_secs: u64,
}

impl GeminiProvider {
    /// Build a client from the generation config.
    pub fn new(config: &GenerationConfig) -> Result<Self, AnkiDexError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api_timeout_secs))
            .build()
            .map_err(|e| AnkiDexError::Internal(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_base: config.api_base.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            json_mode: config.json_mode,
            timeout_secs: config.api_timeout_secs,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.api_base, self.model
        )
    }

    fn request_body<'a>(&self, prompt: &'a str) -> GenerateRequest<'a> {
        GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationSettings {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
                response_mime_type: self.json_mode.then_some("application/json"),
            },
        }
    }

    fn status_error(&self, status: StatusCode, retry_after: Option<u64>, body: &str) -> AnkiDexError {
        let detail = truncate(body, 300);
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AnkiDexError::AuthError {
                provider: self.name().to_string(),
                detail,
            },
            StatusCode::TOO_MANY_REQUESTS => AnkiDexError::RateLimitExceeded {
                provider: self.name().to_string(),
                retry_after_secs: retry_after,
            },
            // Gemini answers 400 API_KEY_INVALID for bad keys.
            StatusCode::BAD_REQUEST if body.contains("API_KEY_INVALID") => {
                AnkiDexError::AuthError {
                    provider: self.name().to_string(),
                    detail,
                }
            }
            _ => AnkiDexError::LlmApiError {
                status: Some(status.as_u16()),
                message: format!("HTTP {status}: {detail}"),
            },
        }
    }
}

#[async_trait]
impl CompletionProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, prompt: &str, api_key: &str) -> Result<Completion, AnkiDexError> {
        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", api_key)
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnkiDexError::ApiTimeout {
                        secs: self.timeout_secs,
                    }
                } else {
                    AnkiDexError::LlmApiError {
                        status: None,
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(self.status_error(status, retry_after, &body));
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| AnkiDexError::LlmApiError {
            status: Some(status.as_u16()),
            message: format!("Malformed Gemini response: {e}"),
        })?;

        parsed.into_completion()
    }
}

/// Call the provider with a hard timeout and the configured retry policy.
///
/// Returns the completion and how many retries it took.
pub async fn complete_with_retry(
    provider: &dyn CompletionProvider,
    prompt: &str,
    api_key: &str,
    config: &GenerationConfig,
) -> Result<(Completion, u32), AnkiDexError> {
    let limit = Duration::from_secs(config.api_timeout_secs);
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            let backoff = config.retry_backoff_ms * 2u64.pow(attempt - 1);
            warn!(
                "{}: retry {}/{} after {}ms",
                provider.name(),
                attempt,
                config.max_retries,
                backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        let result = match timeout(limit, provider.complete(prompt, api_key)).await {
            Ok(result) => result,
            Err(_) => Err(AnkiDexError::ApiTimeout {
                secs: config.api_timeout_secs,
            }),
        };

        match result {
            Ok(completion) => {
                debug!(
                    "{}: {} prompt tokens, {} output tokens",
                    provider.name(),
                    completion.prompt_tokens,
                    completion.output_tokens
                );
                return Ok((completion, attempt));
            }
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                warn!("{}: attempt {} failed — {}", provider.name(), attempt + 1, e);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    let trimmed = s.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}\u{2026}", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationSettings,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationSettings {
    temperature: f32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl GenerateResponse {
    fn into_completion(self) -> Result<Completion, AnkiDexError> {
        let usage = self.usage_metadata.unwrap_or_default();
        let candidate = self.candidates.into_iter().next();

        let text: String = candidate
            .as_ref()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.iter().filter_map(|p| p.text.as_deref()).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            let reason = self
                .prompt_feedback
                .and_then(|f| f.block_reason)
                .or_else(|| candidate.and_then(|c| c.finish_reason))
                .unwrap_or_else(|| "no candidates".to_string());
            return Err(AnkiDexError::LlmApiError {
                status: None,
                message: format!("Gemini returned no text ({reason})"),
            });
        }

        Ok(Completion {
            text,
            prompt_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn provider() -> GeminiProvider {
        GeminiProvider::new(&GenerationConfig::default()).unwrap()
    }

    #[test]
    fn endpoint_includes_model() {
        let p = provider();
        assert_eq!(
            p.endpoint(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn request_body_shape() {
        let p = provider();
        let body = serde_json::to_value(p.request_body("hello")).unwrap();
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 8192);
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
    }

    #[test]
    fn request_body_without_json_mode() {
        let config = GenerationConfig::builder().json_mode(false).build().unwrap();
        let p = GeminiProvider::new(&config).unwrap();
        let body = serde_json::to_value(p.request_body("hello")).unwrap();
        assert!(body["generationConfig"].get("responseMimeType").is_none());
    }

    #[test]
    fn response_parts_are_concatenated() {
        let raw = r#"{
            "candidates": [{"content": {"parts": [{"text": "[{\"question\":"}, {"text": " \"Q\", \"answer\": \"A\"}]"}]}}],
            "usageMetadata": {"promptTokenCount": 120, "candidatesTokenCount": 30, "totalTokenCount": 150}
        }"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        let completion = parsed.into_completion().unwrap();
        assert_eq!(completion.text, r#"[{"question": "Q", "answer": "A"}]"#);
        assert_eq!(completion.prompt_tokens, 120);
        assert_eq!(completion.output_tokens, 30);
    }

    #[test]
    fn blocked_prompt_is_an_api_error() {
        let raw = r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        let err = parsed.into_completion().unwrap_err();
        assert!(err.to_string().contains("SAFETY"), "got: {err}");
    }

    #[test]
    fn status_mapping() {
        let p = provider();
        assert!(matches!(
            p.status_error(StatusCode::FORBIDDEN, None, "denied"),
            AnkiDexError::AuthError { .. }
        ));
        assert!(matches!(
            p.status_error(StatusCode::BAD_REQUEST, None, r#"{"reason": "API_KEY_INVALID"}"#),
            AnkiDexError::AuthError { .. }
        ));
        assert!(matches!(
            p.status_error(StatusCode::TOO_MANY_REQUESTS, Some(7), ""),
            AnkiDexError::RateLimitExceeded {
                retry_after_secs: Some(7),
                ..
            }
        ));
        let err = p.status_error(StatusCode::SERVICE_UNAVAILABLE, None, "overloaded");
        assert!(err.is_transient());
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn truncate_long_bodies() {
        assert_eq!(truncate("  short  ", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc\u{2026}");
    }

    /// Fails `failures` times with `error()`, then succeeds.
    struct Flaky {
        failures: u32,
        error: fn() -> AnkiDexError,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32, error: fn() -> AnkiDexError) -> Self {
            Self {
                failures,
                error,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CompletionProvider for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn complete(&self, _prompt: &str, _key: &str) -> Result<Completion, AnkiDexError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err((self.error)());
            }
            Ok(Completion {
                text: "[]".into(),
                ..Default::default()
            })
        }
    }

    fn unavailable() -> AnkiDexError {
        AnkiDexError::LlmApiError {
            status: Some(503),
            message: "HTTP 503".into(),
        }
    }

    fn bad_request() -> AnkiDexError {
        AnkiDexError::LlmApiError {
            status: Some(400),
            message: "HTTP 400".into(),
        }
    }

    #[tokio::test]
    async fn no_retry_by_default() {
        let flaky = Flaky::new(1, unavailable);
        let config = GenerationConfig::default();
        let result = complete_with_retry(&flaky, "p", "k", &config).await;
        assert!(result.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let flaky = Flaky::new(2, unavailable);
        let config = GenerationConfig::builder()
            .max_retries(3)
            .retry_backoff_ms(1)
            .build()
            .unwrap();
        let (completion, retries) = complete_with_retry(&flaky, "p", "k", &config).await.unwrap();
        assert_eq!(completion.text, "[]");
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn does_not_retry_client_errors() {
        let flaky = Flaky::new(1, bad_request);
        let config = GenerationConfig::builder()
            .max_retries(3)
            .retry_backoff_ms(1)
            .build()
            .unwrap();
        tokio_test::assert_err!(complete_with_retry(&flaky, "p", "k", &config).await);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    struct Stalled;

    #[async_trait]
    impl CompletionProvider for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn complete(&self, _prompt: &str, _key: &str) -> Result<Completion, AnkiDexError> {
            sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hard_timeout_wraps_slow_providers() {
        let config = GenerationConfig::builder().api_timeout_secs(2).build().unwrap();
        let err = complete_with_retry(&Stalled, "p", "k", &config).await.unwrap_err();
        assert!(matches!(err, AnkiDexError::ApiTimeout { secs: 2 }));
    }
}
