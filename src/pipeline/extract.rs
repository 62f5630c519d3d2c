//! PDF text extraction via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with global state; `pdfium-render` serialises
//! access to it and every call blocks. [`extract_text`] moves the work onto
//! Tokio's blocking pool so request handlers keep their worker threads.
//!
//! Uploads never touch the file system: the document is loaded straight from
//! the request bytes. The `%PDF` magic check runs first so obviously wrong
//! uploads get a clear error without binding pdfium at all.

use crate::error::AnkiDexError;
use pdfium_render::prelude::*;
use tracing::{debug, info};

/// Overrides the pdfium library location.
pub const PDFIUM_LIB_PATH_ENV: &str = "PDFIUM_LIB_PATH";

/// Separator placed between the text of consecutive pages.
pub const PAGE_SEPARATOR: &str = "\n\n";

/// Extract the text of every page of an in-memory PDF.
///
/// Pages whose text is only whitespace are skipped; the rest are joined with
/// [`PAGE_SEPARATOR`].
pub async fn extract_text(bytes: Vec<u8>) -> Result<String, AnkiDexError> {
    tokio::task::spawn_blocking(move || extract_text_blocking(&bytes))
        .await
        .map_err(|e| AnkiDexError::Internal(format!("Extraction task panicked: {}", e)))?
}

/// Blocking implementation of [`extract_text`].
pub fn extract_text_blocking(bytes: &[u8]) -> Result<String, AnkiDexError> {
    check_pdf_magic(bytes)?;

    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| AnkiDexError::DocumentUnreadable {
            detail: match e {
                PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::PasswordError) => {
                    "document is password protected".to_string()
                }
                other => format!("{:?}", other),
            },
        })?;

    let pages = document.pages();
    info!("PDF loaded: {} pages, {} bytes", pages.len(), bytes.len());

    let mut texts = Vec::with_capacity(pages.len() as usize);
    for (idx, page) in pages.iter().enumerate() {
        let text = page
            .text()
            .map_err(|e| AnkiDexError::DocumentUnreadable {
                detail: format!("page {}: {:?}", idx + 1, e),
            })?
            .all();
        debug!("Page {} → {} chars", idx + 1, text.len());
        texts.push(text);
    }

    Ok(join_pages(texts))
}

/// Join page texts, dropping pages that are blank.
pub fn join_pages<I>(pages: I) -> String
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    pages
        .into_iter()
        .filter(|p| !p.as_ref().trim().is_empty())
        .map(|p| p.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(PAGE_SEPARATOR)
}

fn check_pdf_magic(bytes: &[u8]) -> Result<(), AnkiDexError> {
    if bytes.len() < 4 || &bytes[..4] != b"%PDF" {
        return Err(AnkiDexError::NotAPdf {
            magic: bytes.iter().take(4).copied().collect(),
        });
    }
    Ok(())
}

/// Bind pdfium: `PDFIUM_LIB_PATH`, then the working directory, then the system.
fn bind_pdfium() -> Result<Pdfium, AnkiDexError> {
    let bindings = match std::env::var(PDFIUM_LIB_PATH_ENV) {
        Ok(path) if !path.is_empty() => {
            debug!("Binding pdfium from {}", path);
            Pdfium::bind_to_library(path)
        }
        _ => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| AnkiDexError::PdfiumBindingFailed(format!("{:?}", e)))?;

    Ok(Pdfium::new(bindings))
}
