use axum::extract::{Json, Query, State};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::search::{
    rebuild_index, search_documents, SearchFilters, SearchResult, StatusFilter, Viewer,
};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    /// Comma separated category ids.
    pub categories: Option<String>,
    pub author: Option<Uuid>,
    pub from: Option<String>,
    pub to: Option<String>,
    #[serde(default)]
    pub status: StatusFilter,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub query: String,
    pub total: usize,
    pub results: Vec<SearchResult>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexResponse {
    pub indexed: usize,
}

/// Accepts `YYYY-MM-DD` or `YYYY-MM-DDTHH:MM:SS`. A bare date bound is
/// inclusive of the whole day.
fn parse_bound(raw: &str, end_of_day: bool) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(value) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(value);
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    }
}

impl SearchParams {
    pub fn filters(&self) -> Result<SearchFilters, Vec<String>> {
        let mut errors = Vec::new();

        let mut category_ids = Vec::new();
        for part in self.categories.iter().flat_map(|raw| raw.split(',')) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match Uuid::parse_str(part) {
                Ok(id) if !category_ids.contains(&id) => category_ids.push(id),
                Ok(_) => {}
                Err(_) => errors.push(format!("invalid category id: {part}")),
            }
        }

        let mut bound = |raw: &Option<String>, name: &str, end_of_day: bool| {
            raw.as_deref().and_then(|value| {
                let parsed = parse_bound(value, end_of_day);
                if parsed.is_none() {
                    errors.push(format!("invalid {name} date: {value}"));
                }
                parsed
            })
        };
        let created_from = bound(&self.from, "from", false);
        let created_to = bound(&self.to, "to", true);

        if let (Some(from), Some(to)) = (created_from, created_to) {
            if from > to {
                errors.push("from must not be after to".to_string());
            }
        }

        if errors.is_empty() {
            Ok(SearchFilters {
                category_ids,
                author_id: self.author,
                created_from,
                created_to,
                status: self.status,
            })
        } else {
            Err(errors)
        }
    }
}

pub async fn search(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<SearchParams>,
) -> AppResult<Json<SearchResponse>> {
    let filters = params
        .filters()
        .map_err(|errors| AppError::bad_request("invalid search parameters").with_errors(errors))?;
    let viewer = Viewer {
        user_id: user.user_id,
        is_admin: user.is_admin(),
    };

    let results = search_documents(
        &state.pool,
        state.storage.as_ref(),
        &state.search,
        &params.q,
        &filters,
        &viewer,
    )
    .await?;

    Ok(Json(SearchResponse {
        query: params.q,
        total: results.len(),
        results,
    }))
}

pub async fn reindex(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<ReindexResponse>> {
    user.require_admin()?;
    let indexed = rebuild_index(&state.pool, state.storage.as_ref(), &state.search).await?;
    info!(indexed, user_id = %user.user_id, "search index rebuilt on request");
    Ok(Json(ReindexResponse { indexed }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_category_lists_and_date_bounds() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let params = SearchParams {
            categories: Some(format!("{first}, {second},,{first}")),
            from: Some("2024-03-01".into()),
            to: Some("2024-03-31".into()),
            ..SearchParams::default()
        };

        let filters = params.filters().unwrap();
        assert_eq!(filters.category_ids, vec![first, second]);
        assert_eq!(
            filters.created_to.unwrap().to_string(),
            "2024-03-31 23:59:59"
        );
        assert_eq!(filters.status, StatusFilter::Active);
    }

    #[test]
    fn reports_every_bad_parameter() {
        let params = SearchParams {
            categories: Some("nope".into()),
            from: Some("2024-05-01".into()),
            to: Some("yesterday".into()),
            ..SearchParams::default()
        };
        let errors = params.filters().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn rejects_inverted_range() {
        let params = SearchParams {
            from: Some("2024-05-02".into()),
            to: Some("2024-05-01".into()),
            ..SearchParams::default()
        };
        assert!(params.filters().is_err());
    }
}
