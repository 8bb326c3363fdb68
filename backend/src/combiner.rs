use std::sync::Arc;

use futures_util::future::try_join_all;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    render::{is_pdf, RenderError, RenderService, PDF_MIME},
    storage::ObjectStorage,
};

#[derive(Debug, Clone)]
pub struct CombineAttachment {
    pub path: String,
    pub file_name: String,
    pub mime_type: String,
    pub order: i32,
}

#[derive(Debug, Clone)]
pub struct CombineRequest {
    pub document_id: Uuid,
    pub main_document_path: String,
    pub main_document_name: String,
    pub main_document_mime_type: String,
    pub attachments: Vec<CombineAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedPdf {
    pub converted_id: Uuid,
    pub key: String,
    pub file_size: i64,
    pub part_count: usize,
}

#[derive(Debug, Error)]
pub enum CombineError {
    #[error("failed to fetch {key}: {reason}")]
    Fetch { key: String, reason: anyhow::Error },
    #[error("failed to convert {name}: {source}")]
    Convert {
        name: String,
        #[source]
        source: RenderError,
    },
    #[error("failed to merge PDFs: {0}")]
    Merge(#[source] RenderError),
    #[error("failed to store merged PDF: {0}")]
    Store(anyhow::Error),
}

pub fn converted_pdf_key(document_id: Uuid, converted_id: Uuid) -> String {
    format!("documents/{document_id}/converted/{converted_id}.pdf")
}

/// Builds the merged PDF view of a document: the main file first, then the
/// attachments by ascending `order`. Any single failure fails the whole call.
#[derive(Clone)]
pub struct PdfCombiner {
    storage: Arc<dyn ObjectStorage>,
    renderer: Arc<dyn RenderService>,
}

struct Part {
    key: String,
    name: String,
    mime_type: String,
}

impl PdfCombiner {
    pub fn new(storage: Arc<dyn ObjectStorage>, renderer: Arc<dyn RenderService>) -> Self {
        Self { storage, renderer }
    }

    pub async fn combine(&self, request: CombineRequest) -> Result<CombinedPdf, CombineError> {
        let CombineRequest {
            document_id,
            main_document_path,
            main_document_name,
            main_document_mime_type,
            mut attachments,
        } = request;

        attachments.sort_by_key(|attachment| attachment.order);

        let mut parts = Vec::with_capacity(attachments.len() + 1);
        parts.push(Part {
            key: main_document_path,
            name: main_document_name,
            mime_type: main_document_mime_type,
        });
        parts.extend(attachments.into_iter().map(|attachment| Part {
            key: attachment.path,
            name: attachment.file_name,
            mime_type: attachment.mime_type,
        }));

        let part_count = parts.len();
        let pdfs = try_join_all(parts.iter().map(|part| self.render_part(part))).await?;

        let merged = if pdfs.len() == 1 {
            pdfs.into_iter().next().unwrap_or_default()
        } else {
            self.renderer
                .merge_pdfs(pdfs)
                .await
                .map_err(CombineError::Merge)?
        };

        let converted_id = Uuid::new_v4();
        let key = converted_pdf_key(document_id, converted_id);
        let file_size = merged.len() as i64;
        self.storage
            .put_object(&key, merged, Some(PDF_MIME.to_string()), None)
            .await
            .map_err(CombineError::Store)?;

        info!(
            document_id = %document_id,
            parts = part_count,
            size_bytes = file_size,
            key = %key,
            "merged PDF written"
        );

        Ok(CombinedPdf {
            converted_id,
            key,
            file_size,
            part_count,
        })
    }

    async fn render_part(&self, part: &Part) -> Result<Vec<u8>, CombineError> {
        let bytes = self
            .storage
            .get_object(&part.key)
            .await
            .map_err(|reason| CombineError::Fetch {
                key: part.key.clone(),
                reason,
            })?;

        if is_pdf(&part.mime_type) {
            return Ok(bytes);
        }

        debug!(name = %part.name, mime_type = %part.mime_type, "converting part to PDF");
        self.renderer
            .convert_to_pdf(&part.name, &part.mime_type, bytes)
            .await
            .map_err(|source| CombineError::Convert {
                name: part.name.clone(),
                source,
            })
    }
}
