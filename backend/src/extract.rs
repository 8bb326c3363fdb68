use pdfium_render::prelude::*;
use thiserror::Error;
use tokio::task;
use tracing::debug;

use crate::render::{is_mergeable, is_pdf, RenderError, RenderService};
use crate::storage::ObjectStorage;

/// Upper bound on stored text per document, in characters.
pub const MAX_CONTENT_CHARS: usize = 500_000;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to read {key}: {reason}")]
    Fetch { key: String, reason: anyhow::Error },
    #[error("failed to convert for extraction: {0}")]
    Render(#[from] RenderError),
    #[error("pdf extraction failed: {0}")]
    Pdf(String),
}

pub fn extract_pdf_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let bindings = Pdfium::bind_to_system_library()
        .map_err(|err| ExtractError::Pdf(format!("pdfium unavailable: {err}")))?;
    let pdfium = Pdfium::new(bindings);
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|err| ExtractError::Pdf(format!("load pdf: {err}")))?;

    let mut combined = String::new();
    let pages = document.pages();
    for page_index in 0..pages.len() {
        let page = pages
            .get(page_index)
            .map_err(|err| ExtractError::Pdf(format!("load page {page_index}: {err}")))?;
        if let Ok(page_text) = page.text() {
            combined.push_str(&page_text.all());
            combined.push('\n');
        };
    }
    Ok(combined)
}

/// Collapses runs of whitespace and truncates to `MAX_CONTENT_CHARS`.
pub fn normalize_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_CONTENT_CHARS));
    let mut chars = 0;
    for word in raw.split_whitespace() {
        let needed = word.chars().count() + usize::from(chars > 0);
        if chars + needed > MAX_CONTENT_CHARS {
            break;
        }
        if chars > 0 {
            out.push(' ');
        }
        out.push_str(word);
        chars += needed;
    }
    out
}

fn is_text(mime_type: &str) -> bool {
    mime_type.trim().to_ascii_lowercase().starts_with("text/")
}

/// Pulls searchable text out of a stored file. Returns `None` for formats
/// that carry no extractable text (images, archives).
pub async fn extract_document_text(
    storage: &dyn ObjectStorage,
    renderer: &dyn RenderService,
    key: &str,
    file_name: &str,
    mime_type: &str,
) -> Result<Option<String>, ExtractError> {
    let is_image = mime_type.trim().to_ascii_lowercase().starts_with("image/");
    if is_image || !(is_pdf(mime_type) || is_text(mime_type) || is_mergeable(mime_type)) {
        debug!(%key, %mime_type, "no text extraction for format");
        return Ok(None);
    }

    let bytes = storage
        .get_object(key)
        .await
        .map_err(|reason| ExtractError::Fetch {
            key: key.to_string(),
            reason,
        })?;

    if is_text(mime_type) {
        return Ok(Some(normalize_text(&String::from_utf8_lossy(&bytes))));
    }

    let pdf = if is_pdf(mime_type) {
        bytes
    } else {
        renderer.convert_to_pdf(file_name, mime_type, bytes).await?
    };

    let text = task::spawn_blocking(move || extract_pdf_text(&pdf))
        .await
        .map_err(|err| ExtractError::Pdf(format!("extraction task panicked: {err}")))??;
    Ok(Some(normalize_text(&text)))
}
