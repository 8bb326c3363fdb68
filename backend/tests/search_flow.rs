mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, read_json, TestApp};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Deserialize)]
struct SearchResponse {
    total: usize,
    results: Vec<SearchResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResult {
    id: Uuid,
    title: String,
    category_ids: Vec<Uuid>,
    deleted_at: Option<String>,
    score: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Created {
    document_id: Uuid,
}

async fn create_text_document(
    app: &TestApp,
    token: &str,
    title: &str,
    body: &str,
    categories: &[Uuid],
) -> Result<Uuid> {
    let main = app
        .stage_json("notes.txt", "text/plain", body.as_bytes(), None, token)
        .await?;
    let response = app
        .post_json(
            "/api/documents/compose",
            &json!({
                "operationId": Uuid::new_v4(),
                "metadata": { "title": title, "categoryIds": categories },
                "replaceMain": main,
            }),
            Some(token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: Created = read_json(response).await?;
    Ok(created.document_id)
}

async fn search(app: &TestApp, query: &str, token: &str) -> Result<SearchResponse> {
    let response = app.get(&format!("/api/search?{query}"), Some(token)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    read_json(response).await
}

#[tokio::test]
async fn indexed_content_is_searchable_after_jobs_run() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let (_, token) = app.user_with_token("author", "editor").await?;

    let invoice =
        create_text_document(&app, &token, "Invoice 42", "payment due in october", &[]).await?;
    let minutes =
        create_text_document(&app, &token, "Board minutes", "quarterly meeting notes", &[])
            .await?;
    assert!(app.drain_jobs().await? >= 4);

    let by_content = search(&app, "q=october", &token).await?;
    assert_eq!(by_content.total, 1);
    assert_eq!(by_content.results[0].id, invoice);

    let by_prefix = search(&app, "q=meet", &token).await?;
    assert_eq!(by_prefix.results.len(), 1);
    assert_eq!(by_prefix.results[0].id, minutes);

    let every_term = search(&app, "q=invoice%20meeting", &token).await?;
    assert!(every_term.results.is_empty());

    let everything = search(&app, "q=", &token).await?;
    assert_eq!(everything.total, 2);
    Ok(())
}

#[tokio::test]
async fn results_reflect_live_rows_not_stale_index_entries() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let (_, token) = app.user_with_token("author", "editor").await?;
    let document_id = create_text_document(&app, &token, "Draft contract", "terms", &[]).await?;
    app.drain_jobs().await?;

    let renamed = app
        .patch_json(
            &format!("/api/documents/{document_id}/compose"),
            &json!({ "operationId": Uuid::new_v4(), "metadata": { "title": "Signed contract" } }),
            Some(&token),
        )
        .await?;
    assert_eq!(renamed.status(), StatusCode::OK);

    // The index still knows the old title; the response carries the new one.
    let stale = search(&app, "q=draft", &token).await?;
    assert_eq!(stale.results.len(), 1);
    assert_eq!(stale.results[0].title, "Signed contract");
    assert!(stale.results[0].score > 0.0);

    let trashed = app
        .delete(&format!("/api/documents/{document_id}"), Some(&token))
        .await?;
    assert_eq!(trashed.status(), StatusCode::NO_CONTENT);
    let hidden = search(&app, "q=contract", &token).await?;
    assert!(hidden.results.is_empty());

    app.drain_jobs().await?;
    let deleted = search(&app, "q=contract&status=deleted", &token).await?;
    assert_eq!(deleted.results.len(), 1);
    assert!(deleted.results[0].deleted_at.is_some());
    Ok(())
}

#[tokio::test]
async fn filters_and_access_lists_apply() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let (author_id, token) = app.user_with_token("author", "editor").await?;
    let (granted_id, granted_token) = app.user_with_token("granted", "editor").await?;
    let (_, outsider_token) = app.user_with_token("outsider", "editor").await?;
    let (_, admin_token) = app.admin_token().await?;
    let finance = app.insert_category("Finance").await?;

    let report =
        create_text_document(&app, &token, "Budget report", "numbers", &[finance]).await?;
    let private =
        create_text_document(&app, &token, "Budget salaries", "confidential", &[]).await?;
    app.grant_access(private, granted_id).await?;
    app.drain_jobs().await?;

    let by_category = search(&app, &format!("q=budget&categories={finance}"), &token).await?;
    assert_eq!(by_category.results.len(), 1);
    assert_eq!(by_category.results[0].id, report);
    assert_eq!(by_category.results[0].category_ids, vec![finance]);

    let by_author = search(&app, &format!("q=budget&author={author_id}"), &token).await?;
    assert_eq!(by_author.results.len(), 2);

    let future = search(&app, "q=budget&from=2999-01-01", &token).await?;
    assert!(future.results.is_empty());

    let outsider = search(&app, "q=budget", &outsider_token).await?;
    assert_eq!(outsider.results.len(), 1);
    assert_eq!(outsider.results[0].id, report);

    assert_eq!(search(&app, "q=budget", &granted_token).await?.results.len(), 2);
    assert_eq!(search(&app, "q=budget", &admin_token).await?.results.len(), 2);

    let bad = app
        .get("/api/search?q=budget&categories=not-a-uuid", Some(&token))
        .await?;
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn first_search_rebuilds_the_index_and_writes_a_snapshot() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let (_, token) = app.user_with_token("author", "editor").await?;
    let document_id = create_text_document(&app, &token, "Lease agreement", "rent", &[]).await?;
    app.clear_jobs().await?;
    assert!(app.state.search.is_empty().await);

    let found = search(&app, "q=lease", &token).await?;
    assert_eq!(found.results.len(), 1);
    assert_eq!(found.results[0].id, document_id);
    assert!(!app.state.search.is_empty().await);

    let storage = app.storage();
    assert!(storage.get("search-index/index.json").await.is_some());
    assert!(storage.get("search-index/documents.json").await.is_some());
    Ok(())
}

#[tokio::test]
async fn reindex_and_queue_stats_require_admin() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let (_, token) = app.user_with_token("author", "editor").await?;
    let (_, admin_token) = app.admin_token().await?;
    create_text_document(&app, &token, "Memo", "hello", &[]).await?;

    let denied = app.post_empty("/api/search/reindex", Some(&token)).await?;
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let rebuilt = app
        .post_empty("/api/search/reindex", Some(&admin_token))
        .await?;
    assert_eq!(rebuilt.status(), StatusCode::OK);
    let rebuilt: serde_json::Value = read_json(rebuilt).await?;
    assert_eq!(rebuilt["indexed"], 1);

    assert_eq!(
        app.get("/api/jobs/stats", Some(&token)).await?.status(),
        StatusCode::FORBIDDEN
    );
    let stats: serde_json::Value =
        read_json(app.get("/api/jobs/stats", Some(&admin_token)).await?).await?;
    assert_eq!(stats["queued"], 1);

    app.drain_jobs().await?;
    let stats: serde_json::Value =
        read_json(app.get("/api/jobs/stats", Some(&admin_token)).await?).await?;
    assert_eq!(stats["queued"], 0);
    assert!(stats["succeeded"].as_i64().unwrap_or_default() >= 2);
    Ok(())
}
