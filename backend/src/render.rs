use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client};
use thiserror::Error;
use tracing::{debug, warn};

pub const PDF_MIME: &str = "application/pdf";

/// Formats the render service can turn into PDF pages.
pub const CONVERTIBLE_MIME_TYPES: &[&str] = &[
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.oasis.opendocument.text",
    "application/rtf",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "text/plain",
    "image/png",
    "image/jpeg",
];

pub fn is_pdf(mime_type: &str) -> bool {
    mime_type.trim().eq_ignore_ascii_case(PDF_MIME)
}

/// True when a file of this type can take part in a merged PDF.
pub fn is_mergeable(mime_type: &str) -> bool {
    let mime = mime_type.trim();
    is_pdf(mime)
        || CONVERTIBLE_MIME_TYPES
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(mime))
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render service is not configured")]
    NotConfigured,
    #[error("unsupported conversion from {0}")]
    Unsupported(String),
    #[error("render request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("render service returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait RenderService: Send + Sync + 'static {
    async fn convert_to_pdf(
        &self,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Vec<u8>, RenderError>;

    /// Concatenates `pdfs` in the order given.
    async fn merge_pdfs(&self, pdfs: Vec<Vec<u8>>) -> Result<Vec<u8>, RenderError>;
}

/// Client for a Gotenberg-compatible conversion endpoint.
pub struct HttpRenderService {
    client: Client,
    base_url: String,
}

impl HttpRenderService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RenderError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post_form(&self, path: &str, form: multipart::Form) -> Result<Vec<u8>, RenderError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "sending render request");
        let response = self.client.post(&url).multipart(form).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%url, %status, %body, "render request failed");
            return Err(RenderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl RenderService for HttpRenderService {
    async fn convert_to_pdf(
        &self,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Vec<u8>, RenderError> {
        if is_pdf(mime_type) {
            return Ok(bytes);
        }
        if !is_mergeable(mime_type) {
            return Err(RenderError::Unsupported(mime_type.to_string()));
        }

        let upload_name = conversion_file_name(file_name, mime_type);
        let part = multipart::Part::bytes(bytes)
            .file_name(upload_name)
            .mime_str(mime_type)?;
        let form = multipart::Form::new().part("files", part);
        self.post_form("/forms/libreoffice/convert", form).await
    }

    async fn merge_pdfs(&self, pdfs: Vec<Vec<u8>>) -> Result<Vec<u8>, RenderError> {
        let mut form = multipart::Form::new();
        // The engine merges in lexical file-name order.
        for (index, pdf) in pdfs.into_iter().enumerate() {
            let part = multipart::Part::bytes(pdf)
                .file_name(format!("{index:05}.pdf"))
                .mime_str(PDF_MIME)?;
            form = form.part("files", part);
        }
        self.post_form("/forms/pdfengines/merge", form).await
    }
}

/// Stand-in used when no render endpoint is configured; every call fails.
pub struct UnconfiguredRenderService;

#[async_trait]
impl RenderService for UnconfiguredRenderService {
    async fn convert_to_pdf(
        &self,
        _file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Vec<u8>, RenderError> {
        if is_pdf(mime_type) {
            Ok(bytes)
        } else {
            Err(RenderError::NotConfigured)
        }
    }

    async fn merge_pdfs(&self, _pdfs: Vec<Vec<u8>>) -> Result<Vec<u8>, RenderError> {
        Err(RenderError::NotConfigured)
    }
}

/// The converter picks its filter from the extension, so make sure there is one.
fn conversion_file_name(file_name: &str, mime_type: &str) -> String {
    let has_extension = file_name
        .rsplit_once('.')
        .map(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
        .unwrap_or(false);
    if has_extension {
        return file_name.to_string();
    }

    let extension = mime_guess::get_mime_extensions_str(mime_type)
        .and_then(|extensions| extensions.first().copied())
        .unwrap_or("bin");
    let stem = if file_name.is_empty() { "document" } else { file_name };
    format!("{stem}.{extension}")
}
