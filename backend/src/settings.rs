use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use diesel::prelude::*;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{config::AppConfig, db::PgPool, models::Setting, schema::settings};

pub const SETTING_MAX_FILE_SIZE: &str = "max_file_size";
pub const SETTING_ALLOWED_MIME_TYPES: &str = "allowed_mime_types";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettingsSnapshot {
    pub max_file_size: i64,
    pub allowed_mime_types: Vec<String>,
}

impl SettingsSnapshot {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_file_size: config.max_file_size_bytes,
            allowed_mime_types: config.allowed_mime_types.clone(),
        }
    }

    pub fn allows_mime(&self, mime: &str) -> bool {
        let mime = mime.trim();
        self.allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(mime))
    }

    /// Overlays stored rows on top of `defaults`; malformed rows are ignored.
    fn overlay(defaults: &SettingsSnapshot, rows: Vec<(String, Value)>) -> Self {
        let mut snapshot = defaults.clone();
        for (key, value) in rows {
            match key.as_str() {
                SETTING_MAX_FILE_SIZE => match value.as_i64() {
                    Some(size) if size > 0 => snapshot.max_file_size = size,
                    _ => warn!(%key, %value, "ignoring invalid setting value"),
                },
                SETTING_ALLOWED_MIME_TYPES => match value.as_array() {
                    Some(items) => {
                        let list: Vec<String> = items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(|mime| mime.trim().to_ascii_lowercase())
                            .filter(|mime| !mime.is_empty())
                            .collect();
                        if !list.is_empty() {
                            snapshot.allowed_mime_types = list;
                        }
                    }
                    None => warn!(%key, %value, "ignoring invalid setting value"),
                },
                _ => {}
            }
        }
        snapshot
    }
}

/// TTL cache over the `settings` table. A failed refresh keeps serving the
/// last good snapshot (or the env defaults before the first load).
pub struct SettingsCache {
    ttl: Duration,
    defaults: SettingsSnapshot,
    cached: RwLock<Option<(Instant, SettingsSnapshot)>>,
}

impl SettingsCache {
    pub fn new(ttl: Duration, defaults: SettingsSnapshot) -> Self {
        Self {
            ttl,
            defaults,
            cached: RwLock::new(None),
        }
    }

    pub async fn snapshot(&self, pool: &PgPool) -> SettingsSnapshot {
        let pool = pool.clone();
        self.snapshot_with(|| async move {
            tokio::task::spawn_blocking(move || load_setting_rows(&pool))
                .await
                .map_err(|err| anyhow!("settings task panicked: {err}"))?
        })
        .await
    }

    pub async fn snapshot_with<F, Fut>(&self, load: F) -> SettingsSnapshot
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<(String, Value)>>>,
    {
        if let Some((loaded_at, snapshot)) = self.cached.read().await.as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return snapshot.clone();
            }
        }

        let mut guard = self.cached.write().await;
        if let Some((loaded_at, snapshot)) = guard.as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return snapshot.clone();
            }
        }

        match load().await {
            Ok(rows) => {
                let snapshot = SettingsSnapshot::overlay(&self.defaults, rows);
                debug!(
                    max_file_size = snapshot.max_file_size,
                    allowed = snapshot.allowed_mime_types.len(),
                    "settings snapshot refreshed"
                );
                *guard = Some((Instant::now(), snapshot.clone()));
                snapshot
            }
            Err(err) => {
                warn!(error = %err, "failed to refresh settings; serving previous snapshot");
                guard
                    .as_ref()
                    .map(|(_, snapshot)| snapshot.clone())
                    .unwrap_or_else(|| self.defaults.clone())
            }
        }
    }

    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }
}

fn load_setting_rows(pool: &PgPool) -> Result<Vec<(String, Value)>> {
    let mut conn = pool
        .get()
        .map_err(|err| anyhow!("database pool error: {err}"))?;
    let rows: Vec<Setting> = settings::table.load(&mut conn)?;
    Ok(rows.into_iter().map(|row| (row.key, row.value)).collect())
}
