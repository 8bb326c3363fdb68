use std::sync::Arc;
use std::time::Duration;

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};

use crate::{
    auth::jwt::JwtService,
    combiner::PdfCombiner,
    config::AppConfig,
    db::PgPool,
    error::{AppError, AppResult},
    render::RenderService,
    search::SearchIndex,
    settings::{SettingsCache, SettingsSnapshot},
    storage::ObjectStorage,
};

pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ObjectStorage>,
    pub renderer: Arc<dyn RenderService>,
    pub settings: Arc<SettingsCache>,
    pub search: Arc<SearchIndex>,
    pub jwt: JwtService,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        storage: Arc<dyn ObjectStorage>,
        renderer: Arc<dyn RenderService>,
        jwt: JwtService,
    ) -> Self {
        let settings = SettingsCache::new(
            Duration::from_secs(config.settings_ttl_seconds),
            SettingsSnapshot::from_config(&config),
        );
        Self {
            pool,
            config: Arc::new(config),
            storage,
            renderer,
            settings: Arc::new(settings),
            search: Arc::new(SearchIndex::new()),
            jwt,
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }

    pub fn combiner(&self) -> PdfCombiner {
        PdfCombiner::new(self.storage.clone(), self.renderer.clone())
    }

    pub async fn settings_snapshot(&self) -> SettingsSnapshot {
        self.settings.snapshot(&self.pool).await
    }
}
