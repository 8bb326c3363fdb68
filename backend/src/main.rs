use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use diesel_migrations::MigrationHarness;
use tokio::{net::TcpListener, signal};
use tracing_subscriber::EnvFilter;

use dossier::{
    auth::jwt::JwtService,
    config::AppConfig,
    db,
    render::{HttpRenderService, RenderService, UnconfiguredRenderService},
    routes,
    state::AppState,
    storage::{ObjectStorage, S3Storage},
    Worker, MIGRATIONS,
};

const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "server",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        s3_bucket = %config.s3_bucket,
        render_service = config.render_service_url.as_deref().unwrap_or("<none>"),
        index_workers = config.index_worker_concurrency,
        "loaded backend configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    {
        let pool = pool.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut conn = pool.get().context("failed to get migration connection")?;
            conn.run_pending_migrations(MIGRATIONS)
                .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
            Ok(())
        })
        .await
        .context("migration task panicked")??;
    }

    let storage: Arc<dyn ObjectStorage> = Arc::new(S3Storage::connect(&config).await?);
    let renderer: Arc<dyn RenderService> = match config.render_service_url.as_deref() {
        Some(url) => Arc::new(HttpRenderService::new(
            url,
            Duration::from_secs(config.render_timeout_seconds),
        )?),
        None => {
            tracing::warn!("RENDER_SERVICE_URL not set; merged PDFs cannot be rebuilt");
            Arc::new(UnconfiguredRenderService)
        }
    };
    let jwt = JwtService::from_config(&config)?;

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port)
        .parse()
        .context("invalid SERVER_HOST/SERVER_PORT")?;
    let concurrency = config.index_worker_concurrency;
    let poll_interval = Duration::from_millis(config.worker_poll_interval_ms);

    let state = AppState::new(pool, config, storage, renderer, jwt);
    let worker = Arc::new(Worker::new(Arc::new(state.clone()), poll_interval));
    let workers = worker.spawn(concurrency);

    let app = routes::create_router(state);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    workers.shutdown(WORKER_DRAIN_TIMEOUT).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("received shutdown signal");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
