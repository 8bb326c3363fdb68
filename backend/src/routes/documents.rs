use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::compose::{
    load_projection, with_download_url, ChangeSet, ComposeCommitter, ComposeOutcome,
    DocumentProjection, MergeStatus,
};
use crate::error::{AppError, AppResult};
use crate::jobs::{enqueue, IndexJob};
use crate::models::Document;
use crate::schema::{attachments, converted_documents, document_access, documents};
use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposeResponse {
    pub status: &'static str,
    pub document_id: Uuid,
    pub replayed: bool,
    pub pdf: MergeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub document: Option<DocumentProjection>,
}

#[derive(Deserialize)]
pub struct DeleteDocumentQuery {
    #[serde(default)]
    pub permanent: bool,
}

fn parse_change_set(body: Result<Json<ChangeSet>, JsonRejection>) -> AppResult<ChangeSet> {
    body.map(|Json(changes)| changes).map_err(|rejection| {
        AppError::bad_request("invalid change set").with_errors(vec![rejection.body_text()])
    })
}

async fn compose_response(state: &AppState, outcome: ComposeOutcome) -> AppResult<Response> {
    let projection = {
        let mut conn = state.db()?;
        load_projection(&mut conn, outcome.document_id)?
    };
    let document = match projection {
        Some(projection) => Some(with_download_url(state.storage.as_ref(), projection).await),
        None => None,
    };

    let failed = outcome.merge.is_failed();
    let status = if failed {
        StatusCode::MULTI_STATUS
    } else if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let body = ComposeResponse {
        status: if failed { "pdf_rebuild_failed" } else { "ok" },
        document_id: outcome.document_id,
        replayed: outcome.replayed,
        message: failed
            .then(|| "changes saved, but the merged PDF could not be rebuilt".to_string()),
        pdf: outcome.merge,
        document,
    };
    Ok((status, Json(body)).into_response())
}

pub async fn compose_create(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    body: Result<Json<ChangeSet>, JsonRejection>,
) -> AppResult<Response> {
    let changes = parse_change_set(body)?;
    let settings = state.settings_snapshot().await;
    let outcome = ComposeCommitter::from_state(&state)
        .create(&user, &settings, changes)
        .await?;
    compose_response(&state, outcome).await
}

pub async fn compose_update(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
    body: Result<Json<ChangeSet>, JsonRejection>,
) -> AppResult<Response> {
    let changes = parse_change_set(body)?;
    let settings = state.settings_snapshot().await;
    let outcome = ComposeCommitter::from_state(&state)
        .update(&user, &settings, document_id, changes)
        .await?;
    compose_response(&state, outcome).await
}

fn can_view(
    conn: &mut PgConnection,
    document: &Document,
    user: &AuthenticatedUser,
) -> QueryResult<bool> {
    if user.can_modify(document.author_id) {
        return Ok(true);
    }
    if document.deleted_at.is_some() {
        return Ok(false);
    }
    let grants: Vec<Uuid> = document_access::table
        .filter(document_access::document_id.eq(document.id))
        .select(document_access::user_id)
        .load(conn)?;
    Ok(grants.is_empty() || grants.contains(&user.user_id))
}

pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<DocumentProjection>> {
    let projection = {
        let mut conn = state.db()?;
        let document = documents::table
            .find(document_id)
            .first::<Document>(&mut conn)
            .optional()?
            .ok_or_else(AppError::not_found)?;
        if !can_view(&mut conn, &document, &user)? {
            return Err(AppError::not_found());
        }
        load_projection(&mut conn, document_id)?.ok_or_else(AppError::not_found)?
    };

    Ok(Json(with_download_url(state.storage.as_ref(), projection).await))
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    Query(params): Query<DeleteDocumentQuery>,
    user: AuthenticatedUser,
) -> AppResult<StatusCode> {
    if params.permanent {
        user.require_admin()?;
        return purge_document(&state, document_id).await;
    }

    let mut conn = state.db()?;
    conn.transaction::<_, AppError, _>(|conn| {
        let document = documents::table
            .find(document_id)
            .for_update()
            .first::<Document>(conn)
            .optional()?
            .ok_or_else(AppError::not_found)?;
        if !user.can_modify(document.author_id) {
            return Err(AppError::forbidden());
        }
        if document.deleted_at.is_some() {
            return Ok(());
        }

        let now = Utc::now().naive_utc();
        diesel::update(documents::table.find(document_id))
            .set((
                documents::deleted_at.eq(Some(now)),
                documents::updated_at.eq(now),
            ))
            .execute(conn)?;
        enqueue(conn, IndexJob::IndexDocument { document_id })
            .map_err(AppError::internal)?;
        Ok(())
    })?;

    info!(document_id = %document_id, user_id = %user.user_id, "document moved to trash");
    Ok(StatusCode::NO_CONTENT)
}

/// Removes the rows (cascading to attachments and conversions), queues the
/// index removal in the same transaction, then deletes the blobs.
async fn purge_document(state: &AppState, document_id: Uuid) -> AppResult<StatusCode> {
    let keys = {
        let mut conn = state.db()?;
        conn.transaction::<_, AppError, _>(|conn| {
            let document = documents::table
                .find(document_id)
                .for_update()
                .first::<Document>(conn)
                .optional()?
                .ok_or_else(AppError::not_found)?;

            let mut keys = vec![document.file_path];
            keys.extend(
                attachments::table
                    .filter(attachments::document_id.eq(document_id))
                    .select(attachments::file_path)
                    .load::<String>(conn)?,
            );
            keys.extend(
                converted_documents::table
                    .filter(converted_documents::document_id.eq(document_id))
                    .select(converted_documents::file_path)
                    .load::<String>(conn)?,
            );

            diesel::delete(documents::table.find(document_id)).execute(conn)?;
            enqueue(conn, IndexJob::RemoveFromIndex { document_id })
                .map_err(AppError::internal)?;
            Ok(keys)
        })?
    };

    for key in &keys {
        if let Err(err) = state.storage.delete_object(key).await {
            warn!(document_id = %document_id, %key, error = %err, "failed to delete blob of purged document");
        }
    }
    info!(document_id = %document_id, blobs = keys.len(), "document permanently deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn restore_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<DocumentProjection>> {
    let projection = {
        let mut conn = state.db()?;
        conn.transaction::<_, AppError, _>(|conn| {
            let document = documents::table
                .find(document_id)
                .for_update()
                .first::<Document>(conn)
                .optional()?
                .ok_or_else(AppError::not_found)?;
            if !user.can_modify(document.author_id) {
                return Err(AppError::forbidden());
            }
            if document.deleted_at.is_some() {
                diesel::update(documents::table.find(document_id))
                    .set((
                        documents::deleted_at.eq::<Option<chrono::NaiveDateTime>>(None),
                        documents::updated_at.eq(Utc::now().naive_utc()),
                    ))
                    .execute(conn)?;
                enqueue(conn, IndexJob::IndexDocument { document_id })
                    .map_err(AppError::internal)?;
            }
            load_projection(conn, document_id)?.ok_or_else(AppError::not_found)
        })?
    };

    info!(document_id = %document_id, user_id = %user.user_id, "document restored");
    Ok(Json(with_download_url(state.storage.as_ref(), projection).await))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRefreshResponse {
    pub job_id: Uuid,
}

pub async fn refresh_content(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<(StatusCode, Json<ContentRefreshResponse>)> {
    let mut conn = state.db()?;
    let author_id = documents::table
        .find(document_id)
        .filter(documents::deleted_at.is_null())
        .select(documents::author_id)
        .first::<Uuid>(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;
    if !user.can_modify(author_id) {
        return Err(AppError::forbidden());
    }

    let job = enqueue(&mut conn, IndexJob::UpdateContentAndReindex { document_id })
        .map_err(AppError::internal)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ContentRefreshResponse { job_id: job.id }),
    ))
}
