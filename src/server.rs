//! HTTP front end: upload form, deck generation and deck download.
//!
//! ## Routes
//!
//! | Method | Path        | Purpose |
//! |--------|-------------|---------|
//! | GET    | `/`         | Embedded HTML upload form |
//! | POST   | `/generate` | Multipart or urlencoded form → JSON preview + artifact path |
//! | GET    | `/download` | Stream a generated `.apkg` as an attachment |
//!
//! Every error leaves as `{"error": "..."}` JSON. Client mistakes map to 400,
//! missing artifacts to 404 and everything else to 500; the process never
//! exits on a request failure.
//!
//! Downloads are confined to [`ServerConfig::output_dir`]: a `file_path` that
//! resolves anywhere else is reported as not found. Decks older than
//! [`ServerConfig::deck_ttl`] are swept from that directory while serving.

use crate::config::{GenerationConfig, ServerConfig};
use crate::error::AnkiDexError;
use crate::generate::{generate_to_file, GenerationRequest};
use crate::output::{Flashcard, GenerationStats};
use crate::pipeline::llm::{CompletionProvider, GeminiProvider};
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Attachment stem used when the requested deck name sanitises to nothing.
pub const FALLBACK_FILENAME: &str = "AnkiDex_Deck";

/// Shared, read-only server state.
pub struct AppState {
    pub config: GenerationConfig,
    pub server: ServerConfig,
    pub provider: Arc<dyn CompletionProvider>,
}

impl AppState {
    pub fn new(
        config: GenerationConfig,
        server: ServerConfig,
        provider: Arc<dyn CompletionProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            server,
            provider,
        })
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.server.max_body_bytes;
    Router::new()
        .route("/", get(index))
        .route("/generate", post(generate_deck))
        .route("/download", get(download))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Bind, serve until Ctrl-C, then drain in-flight requests.
pub async fn serve(config: GenerationConfig, server: ServerConfig) -> Result<(), AnkiDexError> {
    tokio::fs::create_dir_all(&server.output_dir)
        .await
        .map_err(|source| AnkiDexError::OutputWriteFailed {
            path: server.output_dir.clone(),
            source,
        })?;

    let provider: Arc<dyn CompletionProvider> = Arc::new(GeminiProvider::new(&config)?);
    if let Some(ttl) = server.deck_ttl {
        tokio::spawn(sweep_loop(server.output_dir.clone(), ttl));
    }
    let bind = server.bind;
    let output_dir = server.output_dir.clone();
    let state = AppState::new(config, server, provider);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| AnkiDexError::Internal(format!("Failed to bind {}: {}", bind, e)))?;
    info!(
        "Listening on http://{} (decks in {})",
        bind,
        output_dir.display()
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .map_err(|e| AnkiDexError::Internal(format!("Server error: {}", e)))
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

async fn sweep_loop(dir: PathBuf, ttl: Duration) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let removed = sweep_stale_decks(&dir, ttl).await;
        if removed > 0 {
            info!("Removed {} deck(s) older than {:?}", removed, ttl);
        }
    }
}

/// Delete `.apkg` files in `dir` last modified more than `max_age` ago.
///
/// Returns the number removed. Other files are left alone and I/O errors
/// are logged, never fatal.
pub async fn sweep_stale_decks(dir: &Path, max_age: Duration) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot scan {} for stale decks: {}", dir.display(), e);
            return 0;
        }
    };
    let now = SystemTime::now();
    let mut removed = 0;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("apkg") {
            continue;
        }
        let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
            continue;
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age < max_age {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed stale deck {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
    removed
}

// ── Handlers ─────────────────────────────────────────────────────────────

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    success: bool,
    flashcards: Vec<Flashcard>,
    file_path: String,
    deck_name: String,
    stats: GenerationStats,
}

async fn generate_deck(
    State(state): State<Arc<AppState>>,
    form: GenerateForm,
) -> Result<Json<GenerateResponse>, ApiError> {
    let request = form.into_request()?;
    let saved = generate_to_file(
        request,
        state.provider.as_ref(),
        &state.config,
        &state.server.output_dir,
    )
    .await?;

    Ok(Json(GenerateResponse {
        success: true,
        flashcards: saved.output.flashcards,
        file_path: saved.path.to_string_lossy().into_owned(),
        deck_name: saved.output.deck_name,
        stats: saved.output.stats,
    }))
}

#[derive(Debug, Deserialize)]
struct DownloadParams {
    file_path: Option<String>,
    deck_name: Option<String>,
}

async fn download(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DownloadParams>,
) -> Result<Response, ApiError> {
    let path = params
        .file_path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(ApiError::file_not_found)?;
    let path = confine_to(&state.server.output_dir, PathBuf::from(path))
        .await
        .ok_or_else(ApiError::file_not_found)?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::file_not_found())?;

    let stem = sanitize_filename(params.deck_name.as_deref().unwrap_or(FALLBACK_FILENAME));
    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.apkg\"", stem),
        ),
    ];
    Ok((headers, bytes).into_response())
}

/// Canonical `candidate` if it is a file inside `root`, else `None`.
async fn confine_to(root: &std::path::Path, candidate: PathBuf) -> Option<PathBuf> {
    let root = tokio::fs::canonicalize(root).await.ok()?;
    let resolved = tokio::fs::canonicalize(&candidate).await.ok()?;
    let is_file = tokio::fs::metadata(&resolved).await.ok()?.is_file();
    if resolved.starts_with(&root) && is_file {
        Some(resolved)
    } else {
        warn!("Refused download outside output dir: {}", candidate.display());
        None
    }
}

/// Keep alphanumerics, spaces, `-` and `_`, trim trailing whitespace, and
/// fall back to [`FALLBACK_FILENAME`] when nothing is left.
pub fn sanitize_filename(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let kept = kept.trim_end();
    if kept.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        kept.to_string()
    }
}

// ── Form extraction ──────────────────────────────────────────────────────

/// Fields of a `/generate` submission, from either encoding.
#[derive(Debug, Default)]
struct GenerateForm {
    fields: HashMap<String, String>,
    pdf: Option<Vec<u8>>,
}

impl GenerateForm {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    fn into_request(self) -> Result<GenerationRequest, ApiError> {
        let mut builder = GenerationRequest::builder();

        match self.field("num_cards").map(str::trim) {
            None | Some("") => {}
            Some(raw) => {
                let n = raw.parse::<usize>().map_err(|_| {
                    ApiError::bad_request(format!("num_cards must be a positive integer, got '{raw}'"))
                })?;
                builder = builder.num_cards(n);
            }
        }
        if let Some(text) = self.field("text_input") {
            builder = builder.text(text);
        }
        if let Some(name) = self.field("deck_name") {
            builder = builder.deck_name(name);
        }
        if let Some(key) = self.field("api_key") {
            builder = builder.api_key(key);
        }
        if let Some(pdf) = self.pdf {
            builder = builder.pdf(pdf);
        }
        Ok(builder.build())
    }
}

impl<S> FromRequest<S> for GenerateForm
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_multipart = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("multipart/form-data"));

        if !is_multipart {
            let Form(fields) = Form::<HashMap<String, String>>::from_request(req, state)
                .await
                .map_err(|e| ApiError::new(e.status(), e.body_text()))?;
            return Ok(Self { fields, pdf: None });
        }

        let mut multipart = Multipart::from_request(req, state)
            .await
            .map_err(|e| ApiError::new(e.status(), e.body_text()))?;
        let mut form = Self::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::new(e.status(), e.body_text()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "pdf_file" {
                let is_pdf = field
                    .file_name()
                    .is_some_and(|f| f.to_ascii_lowercase().ends_with(".pdf"));
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::new(e.status(), e.body_text()))?;
                if is_pdf && !bytes.is_empty() {
                    form.pdf = Some(bytes.to_vec());
                }
            } else {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::new(e.status(), e.body_text()))?;
                form.fields.insert(name, value);
            }
        }
        Ok(form)
    }
}

// ── Errors ───────────────────────────────────────────────────────────────

/// A JSON error response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn file_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "File not found")
    }
}

impl From<AnkiDexError> for ApiError {
    fn from(e: AnkiDexError) -> Self {
        if e.is_client_error() {
            warn!("Rejected request: {}", e);
            Self::bad_request(e.to_string())
        } else {
            error!("Generation failed: {}", e);
            Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}
