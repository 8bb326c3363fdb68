use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::error;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
    staging::{stage_file, StagedFile, Upload},
    state::AppState,
};

/// Accepts one multipart `file` (plus an optional `clientId` echoed back) and
/// writes it to the temp tier.
pub async fn stage_upload(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<StagedFile>)> {
    let mut upload: Option<Upload> = None;
    let mut client_id: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("file") => {
                let original_name = field
                    .file_name()
                    .map(|n| n.to_string())
                    .filter(|n| !n.trim().is_empty())
                    .ok_or_else(|| AppError::bad_request("file field must carry a file name"))?;
                let declared_mime = field.content_type().map(|mime| mime.to_string());
                let data = field.bytes().await.map_err(|err| {
                    error!(error = %err, "failed to read file bytes");
                    AppError::bad_request(format!("failed to read file bytes: {err}"))
                })?;
                upload = Some(Upload {
                    bytes: data.to_vec(),
                    original_name,
                    declared_mime,
                });
            }
            Some("clientId") => {
                let value = field.text().await.map_err(|err| {
                    AppError::bad_request(format!("invalid clientId: {err}"))
                })?;
                client_id = Some(value.trim().to_string()).filter(|v| !v.is_empty());
            }
            _ => {}
        }
    }

    let upload = upload.ok_or_else(|| AppError::bad_request("file field is required"))?;
    let settings = state.settings_snapshot().await;
    let mut staged = stage_file(state.storage.as_ref(), &settings, upload).await?;
    staged.client_id = client_id;

    Ok((StatusCode::CREATED, Json(staged)))
}
