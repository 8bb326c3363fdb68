use std::collections::HashMap;

use chrono::NaiveDateTime;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::PgPool;
use crate::models::Document;
use crate::schema::{document_access, document_categories, documents, users};
use crate::storage::ObjectStorage;

use super::index::{IndexedDocument, SearchFilters, SearchIndex, Viewer};
use super::snapshot::{persist_snapshot, restore_snapshot};
use super::SearchError;

/// Loads documents in their indexable shape. `None` loads every document,
/// deleted ones included.
pub fn load_indexed_documents(
    conn: &mut PgConnection,
    ids: Option<&[Uuid]>,
) -> QueryResult<Vec<IndexedDocument>> {
    let mut query = documents::table
        .inner_join(users::table)
        .select((documents::all_columns, users::username))
        .into_boxed();
    if let Some(ids) = ids {
        query = query.filter(documents::id.eq_any(ids.to_vec()));
    }
    let rows: Vec<(Document, String)> = query.load(conn)?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let document_ids: Vec<Uuid> = rows.iter().map(|(doc, _)| doc.id).collect();

    let mut categories: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (document_id, category_id) in document_categories::table
        .filter(document_categories::document_id.eq_any(&document_ids))
        .select((
            document_categories::document_id,
            document_categories::category_id,
        ))
        .load::<(Uuid, Uuid)>(conn)?
    {
        categories.entry(document_id).or_default().push(category_id);
    }

    let mut access: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (document_id, user_id) in document_access::table
        .filter(document_access::document_id.eq_any(&document_ids))
        .select((document_access::document_id, document_access::user_id))
        .load::<(Uuid, Uuid)>(conn)?
    {
        access.entry(document_id).or_default().push(user_id);
    }

    Ok(rows
        .into_iter()
        .map(|(doc, author_name)| {
            let category_ids = categories.remove(&doc.id).unwrap_or_default();
            let access_user_ids = access.remove(&doc.id).unwrap_or_default();
            to_indexed(doc, author_name, category_ids, access_user_ids)
        })
        .collect())
}

pub fn load_indexed_document(
    conn: &mut PgConnection,
    id: Uuid,
) -> QueryResult<Option<IndexedDocument>> {
    Ok(load_indexed_documents(conn, Some(&[id]))?.into_iter().next())
}

fn to_indexed(
    doc: Document,
    author_name: String,
    mut category_ids: Vec<Uuid>,
    mut access_user_ids: Vec<Uuid>,
) -> IndexedDocument {
    category_ids.sort();
    access_user_ids.sort();
    IndexedDocument {
        id: doc.id,
        title: doc.title,
        description: doc.description,
        keywords: doc.keywords,
        content: doc.content,
        file_name: doc.file_name,
        author_id: doc.author_id,
        author_name: Some(author_name),
        category_ids,
        access_user_ids,
        created_at: doc.created_at,
        deleted: doc.deleted_at.is_some(),
    }
}

fn load_all(pool: &PgPool) -> Result<Vec<IndexedDocument>, SearchError> {
    let mut conn = pool
        .get()
        .map_err(|err| SearchError::Pool(err.to_string()))?;
    Ok(load_indexed_documents(&mut conn, None)?)
}

/// Rebuilds the whole index from the relational store and writes a fresh
/// snapshot. Snapshot failures are logged only.
pub async fn rebuild_index(
    pool: &PgPool,
    storage: &dyn ObjectStorage,
    index: &SearchIndex,
) -> Result<usize, SearchError> {
    let docs = load_all(pool)?;
    let count = docs.len();
    index.reindex_all(docs).await;
    info!(documents = count, "search index rebuilt");

    if let Err(err) = persist_snapshot(storage, index).await {
        warn!(error = %err, "failed to persist search index snapshot");
    }
    Ok(count)
}

/// Lazily builds the index on first use. When the relational store cannot be
/// read, falls back to the last blob-store snapshot.
pub async fn ensure_index_ready(
    pool: &PgPool,
    storage: &dyn ObjectStorage,
    index: &SearchIndex,
) -> Result<(), SearchError> {
    if !index.is_empty().await {
        return Ok(());
    }

    let _guard = index.rebuild_guard().await;
    if !index.is_empty().await {
        return Ok(());
    }

    match rebuild_index(pool, storage, index).await {
        Ok(_) => Ok(()),
        Err(rebuild_err) => {
            warn!(error = %rebuild_err, "lazy rebuild failed; trying snapshot");
            match restore_snapshot(storage, index).await {
                Ok(Some(_)) => Ok(()),
                Ok(None) => Err(rebuild_err),
                Err(err) => {
                    warn!(error = %err, "failed to restore search index snapshot");
                    Err(rebuild_err)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub file_name: String,
    pub mime_type: String,
    pub author_id: Uuid,
    pub author_name: String,
    pub category_ids: Vec<Uuid>,
    pub main_pdf_id: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
    pub score: f32,
}

/// Ranks with the index, then rebuilds every hit from live rows. Hits whose
/// row is gone or no longer passes the filters are dropped.
pub async fn search_documents(
    pool: &PgPool,
    storage: &dyn ObjectStorage,
    index: &SearchIndex,
    query: &str,
    filters: &SearchFilters,
    viewer: &Viewer,
) -> Result<Vec<SearchResult>, SearchError> {
    ensure_index_ready(pool, storage, index).await?;

    let hits = index.search(query, filters, viewer).await;
    if hits.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<Uuid> = hits.iter().map(|hit| hit.document_id).collect();
    let mut conn = pool
        .get()
        .map_err(|err| SearchError::Pool(err.to_string()))?;

    let rows: Vec<(Document, String)> = documents::table
        .inner_join(users::table)
        .filter(documents::id.eq_any(&ids))
        .select((documents::all_columns, users::username))
        .load(&mut conn)?;
    let live: HashMap<Uuid, IndexedDocument> = load_indexed_documents(&mut conn, Some(&ids))?
        .into_iter()
        .map(|doc| (doc.id, doc))
        .collect();
    let mut rows: HashMap<Uuid, (Document, String)> =
        rows.into_iter().map(|row| (row.0.id, row)).collect();

    let results: Vec<SearchResult> = hits
        .into_iter()
        .filter_map(|hit| {
            let current = live.get(&hit.document_id)?;
            if !filters.matches(current) || !viewer.can_see(current) {
                return None;
            }
            let (doc, author_name) = rows.remove(&hit.document_id)?;
            Some(SearchResult {
                id: doc.id,
                title: doc.title,
                description: doc.description,
                keywords: doc.keywords,
                file_name: doc.file_name,
                mime_type: doc.mime_type,
                author_id: doc.author_id,
                author_name,
                category_ids: current.category_ids.clone(),
                main_pdf_id: doc.main_pdf_id,
                created_at: doc.created_at,
                updated_at: doc.updated_at,
                deleted_at: doc.deleted_at,
                score: hit.score,
            })
        })
        .collect();

    debug!(query, results = results.len(), "search completed");
    Ok(results)
}
