//! Configuration types for flashcard generation and the web server.
//!
//! All generation behaviour is controlled through [`GenerationConfig`], built
//! via its [`GenerationConfigBuilder`]. The config is immutable once built and
//! is shared read-only between concurrent requests (it is cheap to clone, and
//! the server keeps one copy behind an `Arc`).
//!
//! Server-only knobs (bind address, output directory, body limit) live in
//! [`ServerConfig`] so the library can be used without the HTTP layer.

use crate::error::AnkiDexError;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable consulted when neither the request nor the config
/// carries an API key.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Deck title used when the caller does not supply one.
pub const DEFAULT_DECK_NAME: &str = "AnkiDex Deck";

/// Default Gemini endpoint.
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";

/// Configuration for a generation request.
///
/// Built via [`GenerationConfig::builder()`] or using
/// [`GenerationConfig::default()`].
///
/// # Example
/// ```rust
/// use ankidex::GenerationConfig;
///
/// let config = GenerationConfig::builder()
///     .model("gemini-2.0-flash")
///     .api_timeout_secs(30)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct GenerationConfig {
    /// Gemini model identifier. Default: `gemini-2.0-flash`.
    pub model: String,

    /// Base URL of the Gemini REST API. Default: [`DEFAULT_API_BASE`].
    ///
    /// Overridable so tests and proxies can point the client elsewhere.
    pub api_base: String,

    /// Server-side fallback API key. If None, [`API_KEY_ENV`] is read at call time.
    pub api_key: Option<String>,

    /// Sampling temperature. Default: 0.4.
    ///
    /// Flashcards benefit from some variety in phrasing, but high values make
    /// the model drift from the requested JSON shape.
    pub temperature: f32,

    /// Maximum tokens the model may generate. Default: 8192.
    ///
    /// Fifty cards with complete answers fit comfortably; too low a value
    /// truncates the JSON array mid-entry, which is a hard parse failure.
    pub max_output_tokens: u32,

    /// Ask Gemini for `application/json` output. Default: true.
    ///
    /// The coercer still tolerates fences and prose-free JSON either way.
    pub json_mode: bool,

    /// Per-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Retries on a transient model failure (timeout, 429, 5xx). Default: 0.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    pub retry_backoff_ms: u64,

    /// Card count used when the request does not specify one. Default: 10.
    pub default_cards: usize,

    /// Optional upper bound on the requested card count. Default: none.
    pub max_cards: Option<usize>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            temperature: 0.4,
            max_output_tokens: 8192,
            json_mode: true,
            api_timeout_secs: 60,
            max_retries: 0,
            retry_backoff_ms: 500,
            default_cards: 10,
            max_cards: None,
        }
    }
}

impl fmt::Debug for GenerationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationConfig")
            .field("model", &self.model)
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("json_mode", &self.json_mode)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("default_cards", &self.default_cards)
            .field("max_cards", &self.max_cards)
            .finish()
    }
}

impl GenerationConfig {
    /// Create a new builder for `GenerationConfig`.
    pub fn builder() -> GenerationConfigBuilder {
        GenerationConfigBuilder {
            config: Self::default(),
        }
    }

    /// Pick the API key for one call: request override, then config, then env.
    ///
    /// Blank strings count as absent, so an empty form field falls through.
    pub fn resolve_api_key(&self, request_key: Option<&str>) -> Result<String, AnkiDexError> {
        let env_key = std::env::var(API_KEY_ENV).ok();
        pick_api_key(request_key, self.api_key.as_deref(), env_key.as_deref())
    }

    /// Reject a zero card count, or one above `max_cards` when a cap is set.
    pub fn check_card_count(&self, count: usize) -> Result<usize, AnkiDexError> {
        if count == 0 || self.max_cards.is_some_and(|max| count > max) {
            return Err(AnkiDexError::InvalidCardCount {
                count,
                max: self.max_cards,
            });
        }
        Ok(count)
    }
}

fn pick_api_key(
    request: Option<&str>,
    configured: Option<&str>,
    env: Option<&str>,
) -> Result<String, AnkiDexError> {
    [request, configured, env]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|k| !k.is_empty())
        .map(str::to_string)
        .ok_or(AnkiDexError::MissingCredential)
}

/// Builder for [`GenerationConfig`].
#[derive(Debug)]
pub struct GenerationConfigBuilder {
    config: GenerationConfig,
}

impl GenerationConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn api_base(mut self, base: impl Into<String>) -> Self {
        self.config.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_output_tokens(mut self, n: u32) -> Self {
        self.config.max_output_tokens = n;
        self
    }

    pub fn json_mode(mut self, v: bool) -> Self {
        self.config.json_mode = v;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn default_cards(mut self, n: usize) -> Self {
        self.config.default_cards = n;
        self
    }

    pub fn max_cards(mut self, n: usize) -> Self {
        self.config.max_cards = Some(n);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<GenerationConfig, AnkiDexError> {
        let c = &self.config;
        if c.model.trim().is_empty() {
            return Err(AnkiDexError::InvalidConfig("Model must not be empty".into()));
        }
        if c.api_timeout_secs == 0 {
            return Err(AnkiDexError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        if c.max_output_tokens == 0 {
            return Err(AnkiDexError::InvalidConfig(
                "Max output tokens must be ≥ 1".into(),
            ));
        }
        if c.max_cards == Some(0) {
            return Err(AnkiDexError::InvalidConfig("Max cards must be ≥ 1".into()));
        }
        if c.default_cards == 0 {
            return Err(AnkiDexError::InvalidConfig(
                "Default card count must be ≥ 1".into(),
            ));
        }
        if let Some(max) = c.max_cards.filter(|&max| c.default_cards > max) {
            return Err(AnkiDexError::InvalidConfig(format!(
                "Default card count must be 1–{max}, got {}",
                c.default_cards
            )));
        }
        Ok(self.config)
    }
}

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind. Default: `127.0.0.1:5000`.
    pub bind: SocketAddr,

    /// Directory generated decks are written to and served from.
    /// Default: `$TMPDIR/ankidex`.
    pub output_dir: PathBuf,

    /// Maximum request body size in bytes. Default: 16 MiB.
    pub max_body_bytes: usize,

    /// Decks older than this are deleted from `output_dir` at startup and
    /// then hourly. `None` keeps them forever. Default: 24 hours.
    pub deck_ttl: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 5000)),
            output_dir: std::env::temp_dir().join("ankidex"),
            max_body_bytes: 16 * 1024 * 1024,
            deck_ttl: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}
