use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::json;

use crate::state::AppState;

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let index_loaded = !state.search.is_empty().await;
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "searchIndexLoaded": index_loaded })),
    )
}
