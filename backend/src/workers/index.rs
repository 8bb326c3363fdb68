use diesel::prelude::*;
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    extract::{extract_document_text, ExtractError},
    jobs::{enqueue, IndexJob},
    models::Document,
    schema::documents,
    search::{ensure_index_ready, load_indexed_document, persist_snapshot},
    state::AppState,
};

use super::JobExecution;

/// Upserts the current row into the search index, or drops it when the row
/// is gone. Safe to run any number of times.
pub async fn index_document(state: &AppState, document_id: Uuid) -> JobExecution {
    if state.search.is_empty().await {
        let ready = ensure_index_ready(&state.pool, state.storage.as_ref(), &state.search).await;
        if let Err(err) = ready {
            return JobExecution::Retry {
                error: format!("lazy rebuild failed: {err}"),
            };
        }
    }

    let pool = state.pool.clone();
    let loaded = task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        load_indexed_document(&mut conn, document_id).map_err(|err| err.to_string())
    })
    .await;

    match loaded {
        Ok(Ok(Some(doc))) => {
            debug!(document_id = %document_id, deleted = doc.deleted, "upserting document in index");
            state.search.index_document(doc).await;
        }
        Ok(Ok(None)) => {
            info!(document_id = %document_id, "document no longer exists; removing from index");
            state.search.remove_from_index(document_id).await;
        }
        Ok(Err(error)) => return JobExecution::Retry { error },
        Err(join_err) => {
            return JobExecution::Retry {
                error: format!("index task panicked: {join_err}"),
            }
        }
    }

    persist(state).await;
    JobExecution::Success
}

pub async fn remove_from_index(state: &AppState, document_id: Uuid) -> JobExecution {
    let removed = state.search.remove_from_index(document_id).await;
    debug!(document_id = %document_id, removed, "removed document from index");
    persist(state).await;
    JobExecution::Success
}

/// Re-extracts text from the current main file, stores it, then queues a
/// plain index job.
pub async fn update_content_and_reindex(state: &AppState, document_id: Uuid) -> JobExecution {
    let pool = state.pool.clone();
    let loaded = task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        documents::table
            .find(document_id)
            .first::<Document>(&mut conn)
            .optional()
            .map_err(|err| err.to_string())
    })
    .await;

    let document = match loaded {
        Ok(Ok(Some(document))) => document,
        Ok(Ok(None)) => {
            info!(document_id = %document_id, "document no longer exists; nothing to extract");
            return JobExecution::Success;
        }
        Ok(Err(error)) => return JobExecution::Retry { error },
        Err(join_err) => {
            return JobExecution::Retry {
                error: format!("content task panicked: {join_err}"),
            }
        }
    };

    let extracted = extract_document_text(
        state.storage.as_ref(),
        state.renderer.as_ref(),
        &document.file_path,
        &document.file_name,
        &document.mime_type,
    )
    .await;

    let content = match extracted {
        Ok(content) => Some(content),
        Err(err @ (ExtractError::Fetch { .. } | ExtractError::Render(_))) => {
            return JobExecution::Retry {
                error: err.to_string(),
            }
        }
        Err(err @ ExtractError::Pdf(_)) => {
            warn!(document_id = %document_id, error = %err, "keeping previous content");
            None
        }
    };

    let pool = state.pool.clone();
    let file_path = document.file_path.clone();
    let stored = task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        if let Some(content) = content {
            // Skip the write when the main file changed since extraction.
            diesel::update(
                documents::table
                    .find(document_id)
                    .filter(documents::file_path.eq(&file_path)),
            )
            .set(documents::content.eq(content))
            .execute(&mut conn)
            .map_err(|err| err.to_string())?;
        }
        enqueue(&mut conn, IndexJob::IndexDocument { document_id })
            .map_err(|err| err.to_string())
    })
    .await;

    match stored {
        Ok(Ok(job)) => {
            info!(document_id = %document_id, job_id = %job.id, "content refreshed; index job queued");
            JobExecution::Success
        }
        Ok(Err(error)) => JobExecution::Retry { error },
        Err(join_err) => JobExecution::Retry {
            error: format!("content task panicked: {join_err}"),
        },
    }
}

async fn persist(state: &AppState) {
    if let Err(err) = persist_snapshot(state.storage.as_ref(), &state.search).await {
        warn!(error = %err, "failed to persist search index snapshot");
    }
}
