use std::time::Duration;

use chrono::NaiveDateTime;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::models::{Attachment, Category, ConvertedDocument, Document};
use crate::schema::{attachments, categories, converted_documents, document_categories, documents};
use crate::storage::ObjectStorage;

const PRESIGNED_URL_EXPIRY_SECONDS: u64 = 300;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryView {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentView {
    pub id: Uuid,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: i64,
    pub order: i32,
    pub attachment_type: String,
    pub created_at: NaiveDateTime,
}

impl From<Attachment> for AttachmentView {
    fn from(row: Attachment) -> Self {
        Self {
            id: row.id,
            file_name: row.file_name,
            mime_type: row.mime_type,
            file_size: row.file_size,
            order: row.sort_order,
            attachment_type: row.attachment_type,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MainPdfView {
    pub id: Uuid,
    pub file_size: i64,
    pub created_at: NaiveDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip)]
    pub key: String,
}

/// Read model of a document as returned by the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentProjection {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: i64,
    pub author_id: Uuid,
    pub categories: Vec<CategoryView>,
    pub attachments: Vec<AttachmentView>,
    pub main_pdf: Option<MainPdfView>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

pub fn load_attachments(
    conn: &mut PgConnection,
    document_id: Uuid,
) -> QueryResult<Vec<Attachment>> {
    attachments::table
        .filter(attachments::document_id.eq(document_id))
        .order((attachments::sort_order.asc(), attachments::created_at.asc()))
        .load(conn)
}

pub fn load_projection(
    conn: &mut PgConnection,
    document_id: Uuid,
) -> QueryResult<Option<DocumentProjection>> {
    let Some(document) = documents::table
        .find(document_id)
        .first::<Document>(conn)
        .optional()?
    else {
        return Ok(None);
    };

    let categories: Vec<Category> = categories::table
        .inner_join(document_categories::table)
        .filter(document_categories::document_id.eq(document_id))
        .select(categories::all_columns)
        .order(categories::name.asc())
        .load(conn)?;

    let attachments = load_attachments(conn, document_id)?;

    let main_pdf = match document.main_pdf_id {
        Some(main_pdf_id) => converted_documents::table
            .find(main_pdf_id)
            .first::<ConvertedDocument>(conn)
            .optional()?,
        None => None,
    };

    Ok(Some(DocumentProjection {
        id: document.id,
        title: document.title,
        description: document.description,
        keywords: document.keywords,
        file_name: document.file_name,
        mime_type: document.mime_type,
        file_size: document.file_size,
        author_id: document.author_id,
        categories: categories
            .into_iter()
            .map(|category| CategoryView {
                id: category.id,
                name: category.name,
            })
            .collect(),
        attachments: attachments.into_iter().map(AttachmentView::from).collect(),
        main_pdf: main_pdf.map(|converted| MainPdfView {
            id: converted.id,
            file_size: converted.file_size,
            created_at: converted.created_at,
            url: None,
            key: converted.file_path,
        }),
        created_at: document.created_at,
        updated_at: document.updated_at,
        deleted_at: document.deleted_at,
    }))
}

/// Fills in a short-lived download link for the merged PDF. A signing
/// failure leaves the link out rather than failing the read.
pub async fn with_download_url(
    storage: &dyn ObjectStorage,
    mut projection: DocumentProjection,
) -> DocumentProjection {
    if let Some(main_pdf) = projection.main_pdf.as_mut() {
        match storage
            .presign_get_object(
                &main_pdf.key,
                Duration::from_secs(PRESIGNED_URL_EXPIRY_SECONDS),
            )
            .await
        {
            Ok(url) => main_pdf.url = Some(url),
            Err(err) => warn!(
                document_id = %projection.id,
                error = %err,
                "failed to presign merged PDF"
            ),
        }
    }
    projection
}
