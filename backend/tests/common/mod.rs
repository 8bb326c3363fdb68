use std::collections::HashSet;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use dossier::auth::jwt::JwtService;
use dossier::config::AppConfig;
use dossier::db::{self, PgPool};
use dossier::models::{Job, NewCategory, NewDocumentAccess, NewUser, ROLE_ADMIN};
use dossier::render::{RenderError, RenderService};
use dossier::routes;
use dossier::state::AppState;
use dossier::storage::{MemoryStorage, ObjectStorage};
use dossier::{Worker, MIGRATIONS};
use diesel_migrations::MigrationHarness;
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tower::util::ServiceExt;
use uuid::Uuid;

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Converts by wrapping bytes in `[...]` and merges by joining with `|`, so
/// tests can read the merged order straight from the stored blob.
#[derive(Default)]
pub struct FakeRenderer {
    pub failing_names: Mutex<HashSet<String>>,
    pub fail_merge: Mutex<bool>,
    merge_gate: Mutex<Option<MergeGate>>,
}

/// Holds one merge call open: `entered` fires when it starts, and it
/// returns only after `release` is notified.
#[derive(Clone, Default)]
pub struct MergeGate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[allow(dead_code)]
impl FakeRenderer {
    pub async fn fail_merges(&self, fail: bool) {
        *self.fail_merge.lock().await = fail;
    }

    pub async fn fail_conversion_of(&self, file_name: &str) {
        self.failing_names.lock().await.insert(file_name.to_string());
    }

    /// Gates the next merge call only; later merges run straight through.
    pub async fn hold_next_merge(&self) -> MergeGate {
        let gate = MergeGate::default();
        *self.merge_gate.lock().await = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl RenderService for FakeRenderer {
    async fn convert_to_pdf(
        &self,
        file_name: &str,
        _mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Vec<u8>, RenderError> {
        if self.failing_names.lock().await.contains(file_name) {
            return Err(RenderError::Status {
                status: 500,
                body: format!("cannot convert {file_name}"),
            });
        }
        let mut out = b"[".to_vec();
        out.extend(bytes);
        out.push(b']');
        Ok(out)
    }

    async fn merge_pdfs(&self, pdfs: Vec<Vec<u8>>) -> Result<Vec<u8>, RenderError> {
        let gate = self.merge_gate.lock().await.take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if *self.fail_merge.lock().await {
            return Err(RenderError::Status {
                status: 503,
                body: "merge unavailable".into(),
            });
        }
        Ok(pdfs.join(&b'|'))
    }
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    storage: Arc<MemoryStorage>,
    renderer: Arc<FakeRenderer>,
}

#[allow(dead_code)]
impl TestApp {
    /// Returns `None` when `TEST_DATABASE_URL` is not set.
    pub async fn new() -> Result<Option<Self>> {
        let Ok(database_url) = env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set; skipping integration test");
            return Ok(None);
        };

        let config = AppConfig {
            database_url,
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            jwt_secret: "test-secret".to_string(),
            jwt_issuer: "test-issuer".to_string(),
            jwt_audience: "test-audience".to_string(),
            jwt_expiry_minutes: 60,
            cors_allowed_origin: None,
            aws_endpoint_url: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_region: "us-east-1".to_string(),
            s3_bucket: "test-bucket".to_string(),
            render_service_url: None,
            render_timeout_seconds: 5,
            max_file_size_bytes: 1024 * 1024,
            allowed_mime_types: vec![
                "application/pdf".to_string(),
                "text/plain".to_string(),
                "image/png".to_string(),
                "application/zip".to_string(),
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
                    .to_string(),
            ],
            settings_ttl_seconds: 0,
            index_worker_concurrency: 1,
            worker_poll_interval_ms: 10,
            compose_transaction_timeout_seconds: 10,
            operation_ttl_hours: 24,
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let storage = Arc::new(MemoryStorage::new());
        let renderer = Arc::new(FakeRenderer::default());
        let storage_for_state: Arc<dyn ObjectStorage> = storage.clone();
        let renderer_for_state: Arc<dyn RenderService> = renderer.clone();
        let jwt = JwtService::from_config(&config)?;
        let state = AppState::new(pool, config, storage_for_state, renderer_for_state, jwt);
        let router = routes::create_router(state.clone());

        Ok(Some(Self {
            state,
            router,
            storage,
            renderer,
        }))
    }

    pub fn storage(&self) -> Arc<MemoryStorage> {
        self.storage.clone()
    }

    pub fn renderer(&self) -> Arc<FakeRenderer> {
        self.renderer.clone()
    }

    pub async fn insert_user(&self, username: &str, role: &str) -> Result<Uuid> {
        let user = NewUser {
            id: Uuid::new_v4(),
            username: username.to_string(),
            role: role.to_string(),
        };
        self.with_conn(move |conn| {
            diesel::insert_into(dossier::schema::users::table)
                .values(&user)
                .execute(conn)
                .context("failed to insert user")?;
            Ok(user.id)
        })
        .await
    }

    /// Inserts a user and returns it with a bearer token.
    pub async fn user_with_token(&self, username: &str, role: &str) -> Result<(Uuid, String)> {
        let id = self.insert_user(username, role).await?;
        let token = self.state.jwt.generate_token(id, username, role)?;
        Ok((id, token))
    }

    pub async fn admin_token(&self) -> Result<(Uuid, String)> {
        self.user_with_token("admin", ROLE_ADMIN).await
    }

    pub async fn insert_category(&self, name: &str) -> Result<Uuid> {
        let category = NewCategory {
            id: Uuid::new_v4(),
            name: name.to_string(),
        };
        self.with_conn(move |conn| {
            diesel::insert_into(dossier::schema::categories::table)
                .values(&category)
                .execute(conn)
                .context("failed to insert category")?;
            Ok(category.id)
        })
        .await
    }

    pub async fn grant_access(&self, document_id: Uuid, user_id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            diesel::insert_into(dossier::schema::document_access::table)
                .values(&NewDocumentAccess {
                    document_id,
                    user_id,
                })
                .execute(conn)
                .context("failed to grant access")?;
            Ok(())
        })
        .await
    }

    pub async fn jobs_by_type(&self, ty: &str) -> Result<Vec<Job>> {
        let ty = ty.to_string();
        self.with_conn(move |conn| {
            use dossier::schema::jobs::dsl::{created_at, job_type, jobs};
            jobs.filter(job_type.eq(&ty))
                .order(created_at.asc())
                .load::<Job>(conn)
                .context("failed to load jobs")
        })
        .await
    }

    pub async fn clear_jobs(&self) -> Result<()> {
        self.with_conn(|conn| {
            diesel::delete(dossier::schema::jobs::table)
                .execute(conn)
                .context("failed to clear jobs")?;
            Ok(())
        })
        .await
    }

    /// Runs queued jobs in-process until none are due.
    pub async fn drain_jobs(&self) -> Result<usize> {
        let worker = Worker::new(Arc::new(self.state.clone()), Duration::from_millis(10));
        let mut processed = 0;
        while worker.tick().await? {
            processed += 1;
        }
        Ok(processed)
    }

    pub async fn row_count(&self, table: &'static str, document_id: Uuid) -> Result<i64> {
        self.with_conn(move |conn| {
            use diesel::dsl::count_star;
            use dossier::schema::{attachments, converted_documents};
            let count = match table {
                "attachments" => attachments::table
                    .filter(attachments::document_id.eq(document_id))
                    .select(count_star())
                    .first(conn)?,
                "converted_documents" => converted_documents::table
                    .filter(converted_documents::document_id.eq(document_id))
                    .select(count_star())
                    .first(conn)?,
                other => return Err(anyhow!("unsupported table {other}")),
            };
            Ok(count)
        })
        .await
    }

    pub async fn stage(
        &self,
        file_name: &str,
        content_type: &str,
        data: &[u8],
        client_id: Option<&str>,
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();
        body.extend(format!("--{boundary}\r\n").as_bytes());
        body.extend(
            format!("Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n")
                .as_bytes(),
        );
        body.extend(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
        body.extend(data);
        body.extend(b"\r\n");

        if let Some(client_id) = client_id {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(b"Content-Disposition: form-data; name=\"clientId\"\r\n\r\n");
            body.extend(client_id.as_bytes());
            body.extend(b"\r\n");
        }
        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/uploads/stage")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(body))?;
        self.send(request).await
    }

    /// Stages a file and returns the staged-file JSON for use in a change set.
    pub async fn stage_json(
        &self,
        file_name: &str,
        content_type: &str,
        data: &[u8],
        client_id: Option<&str>,
        token: &str,
    ) -> Result<serde_json::Value> {
        let response = self
            .stage(file_name, content_type, data, client_id, token)
            .await?;
        anyhow::ensure!(
            response.status().is_success(),
            "staging {file_name} failed with {}",
            response.status()
        );
        read_json(response).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.json_request(Method::POST, path, payload, token).await
    }

    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.json_request(Method::PATCH, path, payload, token).await
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        self.empty_request(Method::GET, path, token).await
    }

    pub async fn post_empty(
        &self,
        path: &str,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.empty_request(Method::POST, path, token).await
    }

    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        self.empty_request(Method::DELETE, path, token).await
    }

    async fn json_request<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        self.send(builder.body(Body::from(body))?).await
    }

    async fn empty_request(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        self.send(builder.body(Body::empty())?).await
    }

    async fn send(&self, request: Request<Body>) -> Result<hyper::Response<Body>> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .map_err(|err| anyhow!("router error: {err}"))
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

#[allow(dead_code)]
pub async fn read_json<T: DeserializeOwned>(response: hyper::Response<Body>) -> Result<T> {
    let body = body_to_vec(response.into_body()).await?;
    serde_json::from_slice(&body).with_context(|| {
        format!(
            "unexpected response body: {}",
            String::from_utf8_lossy(&body)
        )
    })
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE compose_operations, converted_documents, attachments, document_access, \
         document_categories, documents, categories, users, jobs, settings RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
