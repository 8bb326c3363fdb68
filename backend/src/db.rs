use std::time::Duration;

use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sql_types::{BigInt, Text};
use uuid::Uuid;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

pub const DEFAULT_MAX_POOL_SIZE: u32 = 4;

pub fn init_pool(database_url: &str) -> anyhow::Result<PgPool> {
    init_pool_with_size(database_url, DEFAULT_MAX_POOL_SIZE)
}

pub fn init_pool_with_size(database_url: &str, max_size: u32) -> anyhow::Result<PgPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool_size = max_size.max(1);
    let pool = Pool::builder()
        .max_size(pool_size)
        .connection_timeout(Duration::from_secs(30))
        .build(manager)?;
    Ok(pool)
}

/// Serializes writers on one document for the rest of the current transaction.
pub fn lock_document(conn: &mut PgConnection, document_id: Uuid) -> QueryResult<()> {
    diesel::sql_query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind::<Text, _>(document_id.to_string())
        .execute(conn)?;
    Ok(())
}

/// Bounds statements and lock waits for the rest of the current transaction.
pub fn set_transaction_timeout(conn: &mut PgConnection, timeout: Duration) -> QueryResult<()> {
    let millis = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
    diesel::sql_query("SELECT set_config('statement_timeout', $1::text, true)")
        .bind::<BigInt, _>(millis)
        .execute(conn)?;
    diesel::sql_query("SELECT set_config('lock_timeout', $1::text, true)")
        .bind::<BigInt, _>(millis)
        .execute(conn)?;
    Ok(())
}
