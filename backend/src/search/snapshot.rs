use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::storage::ObjectStorage;

use super::index::{IndexedDocument, InvertedIndex, SearchIndex};

pub const SNAPSHOT_INDEX_KEY: &str = "search-index/index.json";
pub const SNAPSHOT_DOCUMENTS_KEY: &str = "search-index/documents.json";

const JSON_MIME: &str = "application/json";

#[derive(Serialize, Deserialize)]
struct DocumentsBlob {
    generation: Uuid,
    documents: Vec<IndexedDocument>,
}

#[derive(Serialize, Deserialize)]
struct IndexBlob {
    generation: Uuid,
    index: InvertedIndex,
}

/// Writes the index as two JSON blobs stamped with the same generation id.
/// A pair with a missing blob or differing generations is not loaded.
pub async fn persist_snapshot(storage: &dyn ObjectStorage, index: &SearchIndex) -> Result<()> {
    let (inverted, documents) = index.export().await;
    let mut documents: Vec<IndexedDocument> = documents.into_values().collect();
    documents.sort_by_key(|doc| doc.id);
    let count = documents.len();
    let generation = Uuid::new_v4();

    let documents_json = serde_json::to_vec(&DocumentsBlob {
        generation,
        documents,
    })
    .context("failed to encode documents")?;
    let index_json = serde_json::to_vec(&IndexBlob {
        generation,
        index: inverted,
    })
    .context("failed to encode index")?;

    storage
        .put_object(
            SNAPSHOT_DOCUMENTS_KEY,
            documents_json,
            Some(JSON_MIME.to_string()),
            None,
        )
        .await?;
    storage
        .put_object(
            SNAPSHOT_INDEX_KEY,
            index_json,
            Some(JSON_MIME.to_string()),
            None,
        )
        .await?;

    info!(documents = count, %generation, "search index snapshot written");
    Ok(())
}

/// Restores the index from its blob snapshot. Returns the number of
/// documents restored, or `None` when no complete snapshot exists.
pub async fn restore_snapshot(
    storage: &dyn ObjectStorage,
    index: &SearchIndex,
) -> Result<Option<usize>> {
    if !storage.object_exists(SNAPSHOT_INDEX_KEY).await?
        || !storage.object_exists(SNAPSHOT_DOCUMENTS_KEY).await?
    {
        warn!("no search index snapshot available");
        return Ok(None);
    }

    let index_blob: IndexBlob =
        serde_json::from_slice(&storage.get_object(SNAPSHOT_INDEX_KEY).await?)
            .context("failed to decode index snapshot")?;
    let documents_blob: DocumentsBlob =
        serde_json::from_slice(&storage.get_object(SNAPSHOT_DOCUMENTS_KEY).await?)
            .context("failed to decode documents snapshot")?;

    if index_blob.generation != documents_blob.generation {
        warn!(
            index_generation = %index_blob.generation,
            documents_generation = %documents_blob.generation,
            "search index snapshot halves do not match"
        );
        return Ok(None);
    }

    let count = documents_blob.documents.len();
    let documents: HashMap<Uuid, IndexedDocument> = documents_blob
        .documents
        .into_iter()
        .map(|doc| (doc.id, doc))
        .collect();
    index.import(index_blob.index, documents).await;

    info!(documents = count, "search index restored from snapshot");
    Ok(Some(count))
}
