mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, read_json, TestApp};
use diesel::prelude::*;
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StagedFile {
    temp_key: String,
    original_name: String,
    mime_type: String,
    size: i64,
    client_id: Option<String>,
}

#[tokio::test]
async fn staging_writes_to_the_temp_tier() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let (_, token) = app.user_with_token("uploader", "editor").await?;

    let response = app
        .stage("Scan 01.pdf", "application/pdf", b"%PDF-1.7", Some("c-1"), &token)
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let staged: StagedFile = read_json(response).await?;
    assert!(staged.temp_key.starts_with("temp/"));
    assert!(!staged.temp_key.contains(' '));
    assert_eq!(staged.original_name, "Scan 01.pdf");
    assert_eq!(staged.mime_type, "application/pdf");
    assert_eq!(staged.size, 8);
    assert_eq!(staged.client_id.as_deref(), Some("c-1"));

    let stored = app
        .storage()
        .get(&staged.temp_key)
        .await
        .expect("staged blob written");
    assert_eq!(stored.bytes, b"%PDF-1.7");
    Ok(())
}

#[tokio::test]
async fn staging_rejects_bad_uploads_without_writing() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let (_, token) = app.user_with_token("uploader", "editor").await?;

    let empty = app
        .stage("empty.pdf", "application/pdf", b"", None, &token)
        .await?;
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

    let executable = app
        .stage("tool.exe", "application/x-msdownload", b"MZ", None, &token)
        .await?;
    assert_eq!(executable.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let oversized = vec![b'x'; 1024 * 1024 + 1];
    let too_large = app
        .stage("big.txt", "text/plain", &oversized, None, &token)
        .await?;
    assert_eq!(too_large.status(), StatusCode::PAYLOAD_TOO_LARGE);

    assert_eq!(app.storage().object_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn staging_follows_live_settings() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let (_, token) = app.user_with_token("uploader", "editor").await?;

    let pool = app.state.pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        use dossier::schema::settings;
        let mut conn = pool.get()?;
        diesel::insert_into(settings::table)
            .values((
                settings::key.eq("max_file_size"),
                settings::value.eq(serde_json::json!(4)),
            ))
            .execute(&mut conn)?;
        Ok(())
    })
    .await??;

    let response = app
        .stage("note.txt", "text/plain", b"hello", None, &token)
        .await?;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    Ok(())
}

#[tokio::test]
async fn staging_requires_a_token() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };
    let response = app
        .stage("note.txt", "text/plain", b"hello", None, "not-a-token")
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}
