use axum::extract::{Json, State};
use tokio::task;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::jobs::{queue_stats, QueueStats};
use crate::state::AppState;

pub async fn job_stats(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<QueueStats>> {
    user.require_admin()?;
    let pool = state.pool.clone();
    let stats = task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))?;
        queue_stats(&mut conn).map_err(AppError::internal)
    })
    .await
    .map_err(AppError::internal)??;
    Ok(Json(stats))
}
