use std::env;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use dossier::{
    config::AppConfig,
    db::{self, PgPool},
    jobs::{enqueue, prune_jobs, IndexJob},
    schema::{compose_operations, documents},
};

const USAGE: &str = "Usage: maintenance <reindex-all|prune-jobs|purge-operations>";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    let command = match args.next() {
        Some(command) => command,
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };
    if !matches!(
        command.as_str(),
        "reindex-all" | "prune-jobs" | "purge-operations"
    ) {
        eprintln!("Unknown command: {command}\n{USAGE}");
        std::process::exit(1);
    }

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        command = %command,
        "loaded backend configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, 1)?;

    match command.as_str() {
        "reindex-all" => reindex_all(&pool)?,
        "prune-jobs" => prune(&pool)?,
        _ => purge_operations(&pool, config.operation_ttl_hours)?,
    }
    Ok(())
}

/// Queues an index job for every document, trashed ones included, so the
/// worker pool rebuilds index entries from live rows.
fn reindex_all(pool: &PgPool) -> Result<()> {
    let mut conn = pool.get().context("failed to get database connection")?;
    let ids: Vec<Uuid> = documents::table
        .select(documents::id)
        .order(documents::created_at.asc())
        .load(&mut conn)
        .context("failed to load document ids")?;

    if ids.is_empty() {
        println!("No documents found.");
        return Ok(());
    }

    let mut queued = 0usize;
    for document_id in &ids {
        match enqueue(&mut conn, IndexJob::IndexDocument { document_id: *document_id }) {
            Ok(_) => queued += 1,
            Err(err) => eprintln!("Failed to queue index job for {document_id}: {err}"),
        }
    }
    println!("Queued {queued} of {} index jobs.", ids.len());
    Ok(())
}

fn prune(pool: &PgPool) -> Result<()> {
    let mut conn = pool.get().context("failed to get database connection")?;
    let removed = prune_jobs(&mut conn).context("failed to prune job history")?;
    println!("Removed {removed} finished jobs.");
    Ok(())
}

fn purge_operations(pool: &PgPool, ttl_hours: i64) -> Result<()> {
    let mut conn = pool.get().context("failed to get database connection")?;
    let cutoff = Utc::now().naive_utc() - ChronoDuration::hours(ttl_hours);
    let removed = diesel::delete(
        compose_operations::table.filter(compose_operations::created_at.le(cutoff)),
    )
    .execute(&mut conn)
    .context("failed to purge compose operations")?;
    println!("Purged {removed} expired compose operations.");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
