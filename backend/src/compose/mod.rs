//! Applies a change set to a document as one saga: promote staged blobs,
//! commit the relational changes, rebuild the merged PDF, then compensate or
//! clean up depending on how the merge went.

mod changeset;
mod ordering;
mod projection;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::combiner::{CombineAttachment, CombineRequest, PdfCombiner};
use crate::db::{lock_document, set_transaction_timeout, PgPool};
use crate::error::AppError;
use crate::jobs::{self, IndexJob};
use crate::models::{
    Attachment, Document, NewAttachment, NewComposeOperation, NewConvertedDocument,
    NewDocument, NewDocumentCategory,
};
use crate::render::is_mergeable;
use crate::schema::{
    attachments, categories, compose_operations, converted_documents, document_categories,
    documents,
};
use crate::settings::SettingsSnapshot;
use crate::staging::{resolve_mime, validate_upload, StagedFile, StagingError};
use crate::state::{AppState, PgPooledConnection};
use crate::storage::{sanitize_key_segment, ObjectStorage};

pub use changeset::{
    ChangeSet, ComposeMode, MetadataPatch, ReorderEntry, ReorderTarget, ValidatedChangeSet,
};
pub use ordering::{normalize_order, OrderSlot, UNASSIGNED_ORDER};
pub use projection::{
    load_attachments, load_projection, with_download_url, AttachmentView, CategoryView,
    DocumentProjection, MainPdfView,
};

pub const CONVERSION_TYPE_PDF: &str = "pdf";

pub fn original_key(document_id: Uuid, file_name: &str) -> String {
    format!(
        "documents/{document_id}/original/{}/{}",
        Uuid::new_v4(),
        sanitize_key_segment(file_name)
    )
}

pub fn attachment_key(document_id: Uuid, attachment_id: Uuid, file_name: &str) -> String {
    format!(
        "documents/{document_id}/attachments/{attachment_id}/{}",
        sanitize_key_segment(file_name)
    )
}

pub fn attachment_type_for(mime_type: &str) -> &'static str {
    let mime = mime_type.trim().to_ascii_lowercase();
    if mime == "application/pdf" {
        "pdf"
    } else if mime.starts_with("image/") {
        "image"
    } else if is_mergeable(&mime) {
        "document"
    } else {
        "other"
    }
}

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("invalid change set")]
    Validation(Vec<String>),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error("document {0} not found")]
    DocumentNotFound(Uuid),
    #[error("attachment {0} not found")]
    AttachmentNotFound(Uuid),
    #[error("not allowed to modify this document")]
    Forbidden,
    #[error("storage error: {0}")]
    Storage(anyhow::Error),
    #[error("transaction failed: {0}")]
    Transaction(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(String),
}

impl From<ComposeError> for AppError {
    fn from(value: ComposeError) -> Self {
        match value {
            ComposeError::Validation(errors) => {
                AppError::bad_request("invalid change set").with_errors(errors)
            }
            ComposeError::Staging(err) => err.into(),
            ComposeError::DocumentNotFound(_) | ComposeError::AttachmentNotFound(_) => {
                AppError::new(StatusCode::NOT_FOUND, value.to_string())
            }
            ComposeError::Forbidden => AppError::new(StatusCode::FORBIDDEN, value.to_string()),
            ComposeError::Storage(_) => AppError::bad_gateway(value.to_string()),
            ComposeError::Transaction(_) | ComposeError::Pool(_) => AppError::internal(value),
        }
    }
}

/// What happened to the merged PDF after the commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MergeStatus {
    #[serde(rename_all = "camelCase")]
    Rebuilt { converted_id: Uuid },
    /// Only metadata changed; the current merged PDF still matches.
    Unchanged,
    /// The main file cannot be rendered; no merged PDF is kept.
    Unsupported,
    /// A later commit changed the document while this merge ran.
    Superseded,
    Failed { reason: String },
}

impl MergeStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, MergeStatus::Failed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ComposeOutcome {
    pub document_id: Uuid,
    pub created: bool,
    /// The operation id was already applied; nothing was changed.
    pub replayed: bool,
    pub merge: MergeStatus,
}

impl ComposeOutcome {
    fn replayed(document_id: Uuid) -> Self {
        Self {
            document_id,
            created: false,
            replayed: true,
            merge: MergeStatus::Unchanged,
        }
    }
}

enum Target {
    Create { author_id: Uuid },
    Update { before: Document },
}

struct PromotedFile {
    staged: StagedFile,
    key: String,
}

struct PromotedAttachment {
    id: Uuid,
    staged: StagedFile,
    key: String,
}

/// Blobs copied into the permanent tier for this commit. Until the commit
/// and merge succeed these are the compensation list.
#[derive(Default)]
struct Promotion {
    main: Option<PromotedFile>,
    attachments: Vec<PromotedAttachment>,
}

impl Promotion {
    fn keys(&self) -> Vec<String> {
        self.main
            .iter()
            .map(|file| file.key.clone())
            .chain(self.attachments.iter().map(|file| file.key.clone()))
            .collect()
    }

    fn temp_keys(&self) -> Vec<String> {
        self.main
            .iter()
            .map(|file| file.staged.temp_key.clone())
            .chain(
                self.attachments
                    .iter()
                    .map(|file| file.staged.temp_key.clone()),
            )
            .collect()
    }
}

enum TxOutcome {
    Committed(AppliedChanges),
    Replayed(Uuid),
}

struct AppliedChanges {
    document: Document,
    replaced_main_path: Option<String>,
    deleted_attachment_paths: Vec<String>,
}

enum MergeAttempt {
    Rebuilt {
        converted_id: Uuid,
        superseded_paths: Vec<String>,
    },
    Unchanged,
    Unsupported {
        superseded_paths: Vec<String>,
    },
    Superseded,
    Failed(String),
}

pub struct ComposeCommitter {
    pool: PgPool,
    storage: Arc<dyn ObjectStorage>,
    combiner: PdfCombiner,
    transaction_timeout: Duration,
    operation_ttl: ChronoDuration,
}

impl ComposeCommitter {
    pub fn new(
        pool: PgPool,
        storage: Arc<dyn ObjectStorage>,
        combiner: PdfCombiner,
        transaction_timeout: Duration,
        operation_ttl: ChronoDuration,
    ) -> Self {
        Self {
            pool,
            storage,
            combiner,
            transaction_timeout,
            operation_ttl,
        }
    }

    pub fn from_state(state: &AppState) -> Self {
        Self::new(
            state.pool.clone(),
            state.storage.clone(),
            state.combiner(),
            Duration::from_secs(state.config.compose_transaction_timeout_seconds),
            ChronoDuration::hours(state.config.operation_ttl_hours),
        )
    }

    pub async fn create(
        &self,
        user: &AuthenticatedUser,
        settings: &SettingsSnapshot,
        changes: ChangeSet,
    ) -> Result<ComposeOutcome, ComposeError> {
        let changes = changes
            .validate(ComposeMode::Create)
            .map_err(ComposeError::Validation)?;
        check_against_settings(settings, &changes)?;

        if let Some(existing) = self.find_operation(changes.operation_id)? {
            info!(operation_id = %changes.operation_id, document_id = %existing, "compose replayed");
            return Ok(ComposeOutcome::replayed(existing));
        }

        let document_id = Uuid::new_v4();
        let target = Target::Create {
            author_id: user.user_id,
        };
        self.run(document_id, target, changes).await
    }

    pub async fn update(
        &self,
        user: &AuthenticatedUser,
        settings: &SettingsSnapshot,
        document_id: Uuid,
        changes: ChangeSet,
    ) -> Result<ComposeOutcome, ComposeError> {
        let changes = changes
            .validate(ComposeMode::Update)
            .map_err(ComposeError::Validation)?;
        check_against_settings(settings, &changes)?;

        if let Some(existing) = self.find_operation(changes.operation_id)? {
            info!(operation_id = %changes.operation_id, document_id = %existing, "compose replayed");
            return Ok(ComposeOutcome::replayed(existing));
        }

        let (before, current_attachments) = {
            let mut conn = self.conn()?;
            let before = documents::table
                .find(document_id)
                .first::<Document>(&mut conn)
                .optional()?
                .filter(|doc| doc.deleted_at.is_none())
                .ok_or(ComposeError::DocumentNotFound(document_id))?;
            let current_attachments = load_attachments(&mut conn, document_id)?;
            (before, current_attachments)
        };

        if !user.can_modify(before.author_id) {
            return Err(ComposeError::Forbidden);
        }

        let known = |id: &Uuid| current_attachments.iter().any(|row| row.id == *id);
        if let Some(missing) = changes.delete_attachment_ids.iter().find(|id| !known(*id)) {
            return Err(ComposeError::AttachmentNotFound(*missing));
        }
        for (target, _) in &changes.reorder {
            if let ReorderTarget::Existing(id) = target {
                if !known(id) {
                    return Err(ComposeError::AttachmentNotFound(*id));
                }
            }
        }

        self.run(document_id, Target::Update { before }, changes)
            .await
    }

    async fn run(
        &self,
        document_id: Uuid,
        target: Target,
        changes: ValidatedChangeSet,
    ) -> Result<ComposeOutcome, ComposeError> {
        self.verify_staged_files(&changes).await?;
        let promotion = self.promote(document_id, &changes).await?;

        let committed = {
            let mut conn = self.conn()?;
            self.commit(&mut conn, document_id, &target, &changes, &promotion)
        };

        let applied = match committed {
            Ok(TxOutcome::Committed(applied)) => applied,
            Ok(TxOutcome::Replayed(existing)) => {
                self.delete_keys(promotion.keys(), "discarding replayed promotion")
                    .await;
                return Ok(ComposeOutcome::replayed(existing));
            }
            Err(err) => {
                warn!(document_id = %document_id, error = %err, "compose transaction failed");
                self.delete_keys(promotion.keys(), "rolling back promotion")
                    .await;
                // A concurrent request with the same operation id may have won.
                if let Ok(Some(existing)) = self.find_operation(changes.operation_id) {
                    return Ok(ComposeOutcome::replayed(existing));
                }
                return Err(err);
            }
        };

        info!(
            document_id = %document_id,
            operation_id = %changes.operation_id,
            added = promotion.attachments.len(),
            deleted = applied.deleted_attachment_paths.len(),
            replaced_main = promotion.main.is_some(),
            "compose committed"
        );

        self.delete_keys(promotion.temp_keys(), "removing promoted staging copies")
            .await;

        let created = matches!(target, Target::Create { .. });
        let touched = changes.touches_files() || applied.document.main_pdf_id.is_none();
        let attempt = self.refresh_merged_pdf(&applied.document, touched).await;

        let mut main_reverted = false;
        let mut superseded = Vec::new();
        let merge = match attempt {
            MergeAttempt::Rebuilt {
                converted_id,
                superseded_paths,
            } => {
                superseded.extend(superseded_paths);
                MergeStatus::Rebuilt { converted_id }
            }
            MergeAttempt::Unchanged => MergeStatus::Unchanged,
            MergeAttempt::Unsupported { superseded_paths } => {
                superseded.extend(superseded_paths);
                MergeStatus::Unsupported
            }
            MergeAttempt::Superseded => MergeStatus::Superseded,
            MergeAttempt::Failed(reason) => {
                warn!(document_id = %document_id, %reason, "merged PDF rebuild failed; compensating");
                main_reverted = self.compensate(document_id, &target, &promotion).await;
                MergeStatus::Failed { reason }
            }
        };

        let main_changed = promotion.main.is_some() && !main_reverted;
        let job = if main_changed {
            IndexJob::UpdateContentAndReindex { document_id }
        } else {
            IndexJob::IndexDocument { document_id }
        };
        self.enqueue_best_effort(job);

        if main_changed {
            superseded.extend(applied.replaced_main_path);
        }
        superseded.extend(applied.deleted_attachment_paths);
        self.delete_keys(superseded, "removing superseded blobs").await;

        Ok(ComposeOutcome {
            document_id,
            created,
            replayed: false,
            merge,
        })
    }

    fn conn(&self) -> Result<PgPooledConnection, ComposeError> {
        self.pool
            .get()
            .map_err(|err| ComposeError::Pool(err.to_string()))
    }

    fn find_operation(&self, operation_id: Uuid) -> Result<Option<Uuid>, ComposeError> {
        let mut conn = self.conn()?;
        let cutoff = Utc::now().naive_utc() - self.operation_ttl;
        Ok(find_recorded_operation(&mut conn, operation_id, cutoff)?)
    }

    /// Checks every referenced staged blob against what the store recorded
    /// at staging time. The declared type and size must match the stored ones.
    async fn verify_staged_files(&self, changes: &ValidatedChangeSet) -> Result<(), ComposeError> {
        let mut problems = Vec::new();
        for staged in changes.staged_files() {
            let head = self
                .storage
                .head_object(&staged.temp_key)
                .await
                .map_err(ComposeError::Storage)?;
            let Some(head) = head else {
                problems.push(format!("staged file {} does not exist", staged.temp_key));
                continue;
            };
            if head.size != staged.size {
                problems.push(format!(
                    "staged file {} is {} bytes, not {}",
                    staged.temp_key, head.size, staged.size
                ));
            }
            let stored_mime = resolve_mime(head.content_type.as_deref(), &staged.temp_key);
            let declared_mime =
                resolve_mime(Some(staged.mime_type.as_str()), &staged.original_name);
            if stored_mime != declared_mime {
                problems.push(format!(
                    "staged file {} was stored as {stored_mime}, not {}",
                    staged.temp_key, staged.mime_type
                ));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ComposeError::Validation(problems))
        }
    }

    /// Copies every staged file into its permanent key. On any failure the
    /// copies made so far are removed again.
    async fn promote(
        &self,
        document_id: Uuid,
        changes: &ValidatedChangeSet,
    ) -> Result<Promotion, ComposeError> {
        let mut promotion = Promotion::default();

        if let Some(staged) = &changes.replace_main {
            let key = original_key(document_id, &staged.original_name);
            if let Err(err) = self.storage.copy_object(&staged.temp_key, &key).await {
                return Err(ComposeError::Storage(err));
            }
            promotion.main = Some(PromotedFile {
                staged: staged.clone(),
                key,
            });
        }

        for staged in &changes.add_attachments {
            let id = Uuid::new_v4();
            let key = attachment_key(document_id, id, &staged.original_name);
            if let Err(err) = self.storage.copy_object(&staged.temp_key, &key).await {
                error!(document_id = %document_id, error = %err, key = %staged.temp_key, "promotion failed");
                self.delete_keys(promotion.keys(), "undoing partial promotion")
                    .await;
                return Err(ComposeError::Storage(err));
            }
            promotion.attachments.push(PromotedAttachment {
                id,
                staged: staged.clone(),
                key,
            });
        }

        Ok(promotion)
    }

    fn commit(
        &self,
        conn: &mut PgConnection,
        document_id: Uuid,
        target: &Target,
        changes: &ValidatedChangeSet,
        promotion: &Promotion,
    ) -> Result<TxOutcome, ComposeError> {
        let cutoff = Utc::now().naive_utc() - self.operation_ttl;

        conn.transaction::<_, ComposeError, _>(|conn| {
            lock_document(conn, document_id)?;
            set_transaction_timeout(conn, self.transaction_timeout)?;

            if let Some(existing) = find_recorded_operation(conn, changes.operation_id, cutoff)? {
                return Ok(TxOutcome::Replayed(existing));
            }

            let now = Utc::now().naive_utc();
            let mut replaced_main_path = None;

            match target {
                Target::Create { author_id } => {
                    let main = promotion.main.as_ref().ok_or_else(|| {
                        ComposeError::Validation(vec![
                            "replaceMain is required when creating a document".to_string(),
                        ])
                    })?;
                    let metadata = changes.metadata.clone().unwrap_or_default();
                    let new_document = NewDocument {
                        id: document_id,
                        title: metadata.title.unwrap_or_default(),
                        description: metadata.description.filter(|text| !text.is_empty()),
                        keywords: metadata.keywords.unwrap_or_default(),
                        file_path: main.key.clone(),
                        file_name: main.staged.original_name.clone(),
                        mime_type: main.staged.mime_type.clone(),
                        file_size: main.staged.size,
                        author_id: *author_id,
                    };
                    diesel::insert_into(documents::table)
                        .values(&new_document)
                        .execute(conn)?;
                    if let Some(category_ids) = &metadata.category_ids {
                        replace_categories(conn, document_id, category_ids)?;
                    }
                }
                Target::Update { .. } => {
                    let current = documents::table
                        .find(document_id)
                        .for_update()
                        .first::<Document>(conn)
                        .optional()?
                        .filter(|doc| doc.deleted_at.is_none())
                        .ok_or(ComposeError::DocumentNotFound(document_id))?;

                    if let Some(patch) = &changes.metadata {
                        apply_metadata(conn, document_id, patch)?;
                    }

                    if let Some(main) = &promotion.main {
                        diesel::update(documents::table.find(document_id))
                            .set((
                                documents::file_path.eq(&main.key),
                                documents::file_name.eq(&main.staged.original_name),
                                documents::mime_type.eq(&main.staged.mime_type),
                                documents::file_size.eq(main.staged.size),
                            ))
                            .execute(conn)?;
                        replaced_main_path = Some(current.file_path);
                    }
                }
            }

            insert_attachments(conn, document_id, &promotion.attachments, now)?;

            let mut deleted_attachment_paths = Vec::new();
            if !changes.delete_attachment_ids.is_empty() {
                let deleted: Vec<(Uuid, String)> = diesel::delete(
                    attachments::table
                        .filter(attachments::document_id.eq(document_id))
                        .filter(attachments::id.eq_any(&changes.delete_attachment_ids)),
                )
                .returning((attachments::id, attachments::file_path))
                .get_results(conn)?;

                // Another commit may have removed one after the pre-check.
                if let Some(missing) = changes
                    .delete_attachment_ids
                    .iter()
                    .find(|id| !deleted.iter().any(|(deleted_id, _)| deleted_id == *id))
                {
                    return Err(ComposeError::AttachmentNotFound(*missing));
                }
                deleted_attachment_paths = deleted.into_iter().map(|(_, path)| path).collect();
            }

            let mut requested = HashMap::new();
            for (target, order) in &changes.reorder {
                let attachment_id = match target {
                    ReorderTarget::Existing(id) => *id,
                    ReorderTarget::New(client_id) => promotion
                        .attachments
                        .iter()
                        .find(|file| file.staged.client_id.as_deref() == Some(client_id.as_str()))
                        .map(|file| file.id)
                        .ok_or_else(|| {
                            ComposeError::Validation(vec![format!(
                                "clientId '{client_id}' does not match any added attachment"
                            )])
                        })?,
                };
                requested.insert(attachment_id, *order);
            }
            renumber_attachments(conn, document_id, &requested)?;

            diesel::update(documents::table.find(document_id))
                .set(documents::updated_at.eq(now))
                .execute(conn)?;

            diesel::insert_into(compose_operations::table)
                .values(&NewComposeOperation {
                    operation_id: changes.operation_id,
                    document_id,
                })
                .execute(conn)?;

            let document = documents::table.find(document_id).first::<Document>(conn)?;
            Ok(TxOutcome::Committed(AppliedChanges {
                document,
                replaced_main_path,
                deleted_attachment_paths,
            }))
        })
    }

    /// Rebuilds the merged PDF from the committed state and switches the
    /// document to it. The previous merged PDF row goes only after the switch.
    async fn refresh_merged_pdf(&self, document: &Document, touched_files: bool) -> MergeAttempt {
        let document_id = document.id;

        if !is_mergeable(&document.mime_type) {
            if document.main_pdf_id.is_none() {
                return MergeAttempt::Unsupported {
                    superseded_paths: Vec::new(),
                };
            }
            let cleared = self.conn().and_then(|mut conn| {
                conn.transaction::<_, ComposeError, _>(|conn| {
                    lock_document(conn, document_id)?;
                    diesel::update(documents::table.find(document_id))
                        .set(documents::main_pdf_id.eq::<Option<Uuid>>(None))
                        .execute(conn)?;
                    Ok(diesel::delete(
                        converted_documents::table
                            .filter(converted_documents::document_id.eq(document_id))
                            .filter(converted_documents::conversion_type.eq(CONVERSION_TYPE_PDF)),
                    )
                    .returning(converted_documents::file_path)
                    .get_results::<String>(conn)?)
                })
            });
            return match cleared {
                Ok(superseded_paths) => MergeAttempt::Unsupported { superseded_paths },
                Err(err) => {
                    error!(document_id = %document_id, error = %err, "failed to drop stale merged PDF");
                    MergeAttempt::Unsupported {
                        superseded_paths: Vec::new(),
                    }
                }
            };
        }

        if !touched_files {
            return MergeAttempt::Unchanged;
        }

        let parts = match self
            .conn()
            .and_then(|mut conn| Ok(load_attachments(&mut conn, document_id)?))
        {
            Ok(rows) => rows,
            Err(err) => return MergeAttempt::Failed(err.to_string()),
        };
        let merged_layout = attachment_layout(&parts);

        let request = CombineRequest {
            document_id,
            main_document_path: document.file_path.clone(),
            main_document_name: document.file_name.clone(),
            main_document_mime_type: document.mime_type.clone(),
            attachments: parts
                .into_iter()
                .filter(|row| is_mergeable(&row.mime_type))
                .map(|row| CombineAttachment {
                    path: row.file_path,
                    file_name: row.file_name,
                    mime_type: row.mime_type,
                    order: row.sort_order,
                })
                .collect(),
        };

        let combined = match self.combiner.combine(request).await {
            Ok(combined) => combined,
            Err(err) => return MergeAttempt::Failed(err.to_string()),
        };

        let switched = self.conn().and_then(|mut conn| {
            conn.transaction::<_, ComposeError, _>(|conn| {
                lock_document(conn, document_id)?;
                let current_path = documents::table
                    .find(document_id)
                    .select(documents::file_path)
                    .first::<String>(conn)
                    .optional()?;
                if current_path.as_deref() != Some(document.file_path.as_str()) {
                    return Ok(None);
                }
                // Attachments added, removed or reordered since the merge started.
                if attachment_layout(&load_attachments(conn, document_id)?) != merged_layout {
                    return Ok(None);
                }

                diesel::insert_into(converted_documents::table)
                    .values(&NewConvertedDocument {
                        id: combined.converted_id,
                        document_id,
                        conversion_type: CONVERSION_TYPE_PDF.to_string(),
                        file_path: combined.key.clone(),
                        file_size: combined.file_size,
                        original_file: document.file_path.clone(),
                    })
                    .execute(conn)?;
                diesel::update(documents::table.find(document_id))
                    .set(documents::main_pdf_id.eq(Some(combined.converted_id)))
                    .execute(conn)?;
                let superseded = diesel::delete(
                    converted_documents::table
                        .filter(converted_documents::document_id.eq(document_id))
                        .filter(converted_documents::conversion_type.eq(CONVERSION_TYPE_PDF))
                        .filter(converted_documents::id.ne(combined.converted_id)),
                )
                .returning(converted_documents::file_path)
                .get_results::<String>(conn)?;
                Ok(Some(superseded))
            })
        });

        match switched {
            Ok(Some(superseded_paths)) => MergeAttempt::Rebuilt {
                converted_id: combined.converted_id,
                superseded_paths,
            },
            Ok(None) => {
                info!(document_id = %document_id, "document changed during merge; discarding result");
                self.delete_keys(vec![combined.key], "discarding superseded merge")
                    .await;
                MergeAttempt::Superseded
            }
            Err(err) => {
                self.delete_keys(vec![combined.key], "discarding unlinked merge")
                    .await;
                MergeAttempt::Failed(err.to_string())
            }
        }
    }

    /// Undoes the file side of a commit whose merge failed: removes the added
    /// attachments and, on update, restores the previous main file. Metadata,
    /// deletions and reorders stay committed. Returns whether the main file
    /// was restored.
    async fn compensate(&self, document_id: Uuid, target: &Target, promotion: &Promotion) -> bool {
        let added: Vec<Uuid> = promotion.attachments.iter().map(|file| file.id).collect();
        let restore_main = match (target, &promotion.main) {
            (Target::Update { before }, Some(main)) => Some((before, main)),
            _ => None,
        };

        let reverted = self.conn().and_then(|mut conn| {
            conn.transaction::<_, ComposeError, _>(|conn| {
                lock_document(conn, document_id)?;
                if !added.is_empty() {
                    diesel::delete(attachments::table.filter(attachments::id.eq_any(&added)))
                        .execute(conn)?;
                }

                let mut main_restored = false;
                if let Some((before, main)) = restore_main {
                    let restored = diesel::update(
                        documents::table
                            .find(document_id)
                            .filter(documents::file_path.eq(&main.key)),
                    )
                    .set((
                        documents::file_path.eq(&before.file_path),
                        documents::file_name.eq(&before.file_name),
                        documents::mime_type.eq(&before.mime_type),
                        documents::file_size.eq(before.file_size),
                    ))
                    .execute(conn)?;
                    main_restored = restored > 0;
                }

                renumber_attachments(conn, document_id, &HashMap::new())?;
                Ok(main_restored)
            })
        });

        match reverted {
            Ok(main_restored) => {
                let mut keys: Vec<String> = promotion
                    .attachments
                    .iter()
                    .map(|file| file.key.clone())
                    .collect();
                if main_restored {
                    keys.extend(promotion.main.iter().map(|file| file.key.clone()));
                }
                self.delete_keys(keys, "compensating failed merge").await;
                info!(
                    document_id = %document_id,
                    removed_attachments = added.len(),
                    main_restored,
                    "compensation applied"
                );
                main_restored
            }
            Err(err) => {
                error!(document_id = %document_id, error = %err, "compensation failed");
                false
            }
        }
    }

    fn enqueue_best_effort(&self, job: IndexJob) {
        let queued = self
            .conn()
            .map_err(|err| err.to_string())
            .and_then(|mut conn| jobs::enqueue(&mut conn, job).map_err(|err| err.to_string()));
        match queued {
            Ok(row) => info!(
                job_id = %row.id,
                job_type = job.job_type(),
                document_id = %job.document_id(),
                "index job queued"
            ),
            Err(err) => warn!(
                document_id = %job.document_id(),
                error = %err,
                "failed to queue index job; document stays searchable only after a reindex"
            ),
        }
    }

    async fn delete_keys(&self, keys: Vec<String>, reason: &str) {
        for key in keys {
            if let Err(err) = self.storage.delete_object(&key).await {
                warn!(%key, error = %err, reason, "best-effort blob delete failed");
            }
        }
    }
}

fn check_against_settings(
    settings: &SettingsSnapshot,
    changes: &ValidatedChangeSet,
) -> Result<(), ComposeError> {
    for staged in changes.staged_files() {
        validate_upload(settings, &staged.mime_type, staged.size)?;
    }
    Ok(())
}

/// Attachment ids in merge order; any difference means a different merged PDF.
fn attachment_layout(rows: &[Attachment]) -> Vec<(Uuid, i32)> {
    rows.iter().map(|row| (row.id, row.sort_order)).collect()
}

fn find_recorded_operation(
    conn: &mut PgConnection,
    operation_id: Uuid,
    cutoff: NaiveDateTime,
) -> QueryResult<Option<Uuid>> {
    compose_operations::table
        .find(operation_id)
        .filter(compose_operations::created_at.gt(cutoff))
        .select(compose_operations::document_id)
        .first(conn)
        .optional()
}

fn apply_metadata(
    conn: &mut PgConnection,
    document_id: Uuid,
    patch: &MetadataPatch,
) -> Result<(), ComposeError> {
    if let Some(title) = &patch.title {
        diesel::update(documents::table.find(document_id))
            .set(documents::title.eq(title))
            .execute(conn)?;
    }
    if let Some(description) = &patch.description {
        let description = Some(description.as_str()).filter(|text| !text.is_empty());
        diesel::update(documents::table.find(document_id))
            .set(documents::description.eq(description))
            .execute(conn)?;
    }
    if let Some(keywords) = &patch.keywords {
        diesel::update(documents::table.find(document_id))
            .set(documents::keywords.eq(keywords))
            .execute(conn)?;
    }
    if let Some(category_ids) = &patch.category_ids {
        replace_categories(conn, document_id, category_ids)?;
    }
    Ok(())
}

fn replace_categories(
    conn: &mut PgConnection,
    document_id: Uuid,
    category_ids: &[Uuid],
) -> Result<(), ComposeError> {
    let known: Vec<Uuid> = categories::table
        .filter(categories::id.eq_any(category_ids))
        .select(categories::id)
        .load(conn)?;
    let unknown: Vec<String> = category_ids
        .iter()
        .filter(|id| !known.contains(id))
        .map(|id| format!("category {id} does not exist"))
        .collect();
    if !unknown.is_empty() {
        return Err(ComposeError::Validation(unknown));
    }

    diesel::delete(
        document_categories::table.filter(document_categories::document_id.eq(document_id)),
    )
    .execute(conn)?;

    let rows: Vec<NewDocumentCategory> = category_ids
        .iter()
        .map(|category_id| NewDocumentCategory {
            document_id,
            category_id: *category_id,
        })
        .collect();
    if !rows.is_empty() {
        diesel::insert_into(document_categories::table)
            .values(&rows)
            .execute(conn)?;
    }
    Ok(())
}

fn insert_attachments(
    conn: &mut PgConnection,
    document_id: Uuid,
    files: &[PromotedAttachment],
    now: NaiveDateTime,
) -> QueryResult<()> {
    if files.is_empty() {
        return Ok(());
    }
    // Staggered timestamps keep request order as the tie-break.
    let rows: Vec<NewAttachment> = files
        .iter()
        .enumerate()
        .map(|(position, file)| NewAttachment {
            id: file.id,
            document_id,
            file_path: file.key.clone(),
            file_name: file.staged.original_name.clone(),
            mime_type: file.staged.mime_type.clone(),
            file_size: file.staged.size,
            sort_order: UNASSIGNED_ORDER,
            attachment_type: attachment_type_for(&file.staged.mime_type).to_string(),
            created_at: now + ChronoDuration::microseconds(position as i64),
        })
        .collect();
    diesel::insert_into(attachments::table)
        .values(&rows)
        .execute(conn)?;
    Ok(())
}

/// Applies requested positions and closes every gap, leaving `0..n-1`.
fn renumber_attachments(
    conn: &mut PgConnection,
    document_id: Uuid,
    requested: &HashMap<Uuid, i32>,
) -> Result<(), ComposeError> {
    let rows: Vec<Attachment> = load_attachments(conn, document_id)?;
    if let Some(missing) = requested
        .keys()
        .find(|id| !rows.iter().any(|row| row.id == **id))
    {
        return Err(ComposeError::AttachmentNotFound(*missing));
    }

    let slots: Vec<OrderSlot> = rows
        .iter()
        .map(|row| OrderSlot {
            id: row.id,
            current: row.sort_order,
            requested: requested.get(&row.id).copied(),
            created_at: row.created_at,
        })
        .collect();

    for (id, order) in normalize_order(&slots) {
        let unchanged = rows
            .iter()
            .any(|row| row.id == id && row.sort_order == order);
        if !unchanged {
            diesel::update(attachments::table.find(id))
                .set(attachments::sort_order.eq(order))
                .execute(conn)?;
        }
    }
    Ok(())
}
