//! In-process full-text search over documents, with a blob-store snapshot and
//! reconciliation against the relational store on every query.

mod index;
mod service;
mod snapshot;

use thiserror::Error;

use crate::error::AppError;

pub use index::{
    tokenize, IndexedDocument, InvertedIndex, SearchFilters, SearchHit, SearchIndex,
    StatusFilter, Viewer,
};
pub use service::{
    ensure_index_ready, load_indexed_document, load_indexed_documents, rebuild_index,
    search_documents, SearchResult,
};
pub use snapshot::{
    persist_snapshot, restore_snapshot, SNAPSHOT_DOCUMENTS_KEY, SNAPSHOT_INDEX_KEY,
};

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(String),
}

impl From<SearchError> for AppError {
    fn from(value: SearchError) -> Self {
        AppError::internal(value)
    }
}
