use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;
const PREFIX_MATCH_WEIGHT: f32 = 0.5;

const TITLE_WEIGHT: f32 = 3.0;
const KEYWORD_WEIGHT: f32 = 2.0;
const DESCRIPTION_WEIGHT: f32 = 1.5;
const BODY_WEIGHT: f32 = 1.0;

/// What the index knows about one document. Only used for matching and
/// filtering; responses are always built from relational rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedDocument {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub content: Option<String>,
    pub file_name: String,
    pub author_id: Uuid,
    pub author_name: Option<String>,
    pub category_ids: Vec<Uuid>,
    /// Empty means visible to every signed-in user.
    pub access_user_ids: Vec<Uuid>,
    pub created_at: NaiveDateTime,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    #[default]
    Active,
    Deleted,
    All,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub category_ids: Vec<Uuid>,
    pub author_id: Option<Uuid>,
    pub created_from: Option<NaiveDateTime>,
    pub created_to: Option<NaiveDateTime>,
    pub status: StatusFilter,
}

#[derive(Debug, Clone, Copy)]
pub struct Viewer {
    pub user_id: Uuid,
    pub is_admin: bool,
}

impl Viewer {
    pub fn can_see(&self, doc: &IndexedDocument) -> bool {
        self.is_admin
            || doc.author_id == self.user_id
            || doc.access_user_ids.is_empty()
            || doc.access_user_ids.contains(&self.user_id)
    }
}

impl SearchFilters {
    pub fn matches(&self, doc: &IndexedDocument) -> bool {
        let status_ok = match self.status {
            StatusFilter::Active => !doc.deleted,
            StatusFilter::Deleted => doc.deleted,
            StatusFilter::All => true,
        };
        status_ok
            && (self.category_ids.is_empty()
                || doc
                    .category_ids
                    .iter()
                    .any(|category| self.category_ids.contains(category)))
            && self.author_id.map_or(true, |author| doc.author_id == author)
            && self.created_from.map_or(true, |from| doc.created_at >= from)
            && self.created_to.map_or(true, |to| doc.created_at <= to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub document_id: Uuid,
    pub score: f32,
}

pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
        .collect()
}

/// Term -> document -> weighted term frequency, plus weighted document lengths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvertedIndex {
    pub postings: HashMap<String, HashMap<Uuid, f32>>,
    pub lengths: HashMap<Uuid, f32>,
}

impl InvertedIndex {
    fn insert(&mut self, doc: &IndexedDocument) {
        let mut frequencies: HashMap<String, f32> = HashMap::new();
        let mut add = |text: &str, weight: f32| {
            for token in tokenize(text) {
                *frequencies.entry(token).or_insert(0.0) += weight;
            }
        };

        add(&doc.title, TITLE_WEIGHT);
        for keyword in &doc.keywords {
            add(keyword, KEYWORD_WEIGHT);
        }
        if let Some(description) = &doc.description {
            add(description, DESCRIPTION_WEIGHT);
        }
        if let Some(content) = &doc.content {
            add(content, BODY_WEIGHT);
        }
        add(&doc.file_name, BODY_WEIGHT);
        if let Some(author) = &doc.author_name {
            add(author, BODY_WEIGHT);
        }

        let length: f32 = frequencies.values().sum();
        for (term, frequency) in frequencies {
            self.postings
                .entry(term)
                .or_default()
                .insert(doc.id, frequency);
        }
        self.lengths.insert(doc.id, length);
    }

    fn remove(&mut self, id: Uuid) {
        if self.lengths.remove(&id).is_none() {
            return;
        }
        self.postings.retain(|_, documents| {
            documents.remove(&id);
            !documents.is_empty()
        });
    }

    fn average_length(&self) -> f32 {
        if self.lengths.is_empty() {
            return 1.0;
        }
        let total: f32 = self.lengths.values().sum();
        (total / self.lengths.len() as f32).max(1.0)
    }

    /// Scores for one query token; exact matches count fully, prefix matches partially.
    fn score_token(&self, token: &str) -> HashMap<Uuid, f32> {
        let document_count = self.lengths.len() as f32;
        let average_length = self.average_length();
        let mut scores: HashMap<Uuid, f32> = HashMap::new();

        for (term, documents) in &self.postings {
            let weight = if term == token {
                1.0
            } else if term.starts_with(token) {
                PREFIX_MATCH_WEIGHT
            } else {
                continue;
            };

            let df = documents.len() as f32;
            let idf = ((document_count - df + 0.5) / (df + 0.5) + 1.0).ln();
            for (id, tf) in documents {
                let length = self.lengths.get(id).copied().unwrap_or(average_length);
                let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * length / average_length);
                let score = idf * (tf * (BM25_K1 + 1.0)) / (tf + norm) * weight;
                let entry = scores.entry(*id).or_insert(0.0);
                if score > *entry {
                    *entry = score;
                }
            }
        }
        scores
    }
}

#[derive(Debug, Default)]
struct IndexState {
    inverted: InvertedIndex,
    documents: HashMap<Uuid, IndexedDocument>,
    built: bool,
}

/// Process-wide full-text index. Starts empty; callers observe `is_empty`
/// and run `reindex_all` before trusting it.
#[derive(Debug, Default)]
pub struct SearchIndex {
    state: RwLock<IndexState>,
    rebuild: Mutex<()>,
}

impl SearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty means "never built and holds nothing"; a rebuilt index over zero
    /// documents is not empty.
    pub async fn is_empty(&self) -> bool {
        let state = self.state.read().await;
        !state.built && state.documents.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.documents.len()
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.state.read().await.documents.contains_key(&id)
    }

    /// Serializes full rebuilds so concurrent first queries rebuild once.
    pub async fn rebuild_guard(&self) -> MutexGuard<'_, ()> {
        self.rebuild.lock().await
    }

    pub async fn index_document(&self, doc: IndexedDocument) {
        let mut state = self.state.write().await;
        state.inverted.remove(doc.id);
        state.inverted.insert(&doc);
        state.documents.insert(doc.id, doc);
    }

    pub async fn remove_from_index(&self, id: Uuid) -> bool {
        let mut state = self.state.write().await;
        state.inverted.remove(id);
        state.documents.remove(&id).is_some()
    }

    pub async fn reindex_all(&self, docs: Vec<IndexedDocument>) {
        let mut inverted = InvertedIndex::default();
        let mut documents = HashMap::with_capacity(docs.len());
        for doc in docs {
            inverted.insert(&doc);
            documents.insert(doc.id, doc);
        }

        let mut state = self.state.write().await;
        state.inverted = inverted;
        state.documents = documents;
        state.built = true;
    }

    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        viewer: &Viewer,
    ) -> Vec<SearchHit> {
        let state = self.state.read().await;
        let visible = |id: &Uuid| {
            state
                .documents
                .get(id)
                .map(|doc| filters.matches(doc) && viewer.can_see(doc))
                .unwrap_or(false)
        };

        let mut tokens = tokenize(query);
        tokens.sort();
        tokens.dedup();

        if tokens.is_empty() {
            let mut docs: Vec<&IndexedDocument> = state
                .documents
                .values()
                .filter(|doc| visible(&doc.id))
                .collect();
            docs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
            return docs
                .into_iter()
                .map(|doc| SearchHit {
                    document_id: doc.id,
                    score: 0.0,
                })
                .collect();
        }

        let mut totals: Option<HashMap<Uuid, f32>> = None;
        for token in &tokens {
            let token_scores = state.inverted.score_token(token);
            totals = Some(match totals {
                None => token_scores,
                Some(previous) => {
                    let matching: HashSet<&Uuid> = token_scores.keys().collect();
                    previous
                        .into_iter()
                        .filter(|(id, _)| matching.contains(id))
                        .map(|(id, score)| (id, score + token_scores[&id]))
                        .collect()
                }
            });
        }

        let mut hits: Vec<SearchHit> = totals
            .unwrap_or_default()
            .into_iter()
            .filter(|(id, _)| visible(id))
            .map(|(document_id, score)| SearchHit { document_id, score })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.document_id.cmp(&b.document_id))
        });
        hits
    }

    pub(crate) async fn export(&self) -> (InvertedIndex, HashMap<Uuid, IndexedDocument>) {
        let state = self.state.read().await;
        (state.inverted.clone(), state.documents.clone())
    }

    pub(crate) async fn import(
        &self,
        inverted: InvertedIndex,
        documents: HashMap<Uuid, IndexedDocument>,
    ) {
        let mut state = self.state.write().await;
        state.inverted = inverted;
        state.documents = documents;
        state.built = true;
    }
}

#[cfg(test)]
pub(crate) fn sample_document(title: &str) -> IndexedDocument {
    IndexedDocument {
        id: Uuid::new_v4(),
        title: title.to_string(),
        description: None,
        keywords: Vec::new(),
        content: None,
        file_name: "file.pdf".to_string(),
        author_id: Uuid::new_v4(),
        author_name: None,
        category_ids: Vec::new(),
        access_user_ids: Vec::new(),
        created_at: chrono::Utc::now().naive_utc(),
        deleted: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn admin() -> Viewer {
        Viewer {
            user_id: Uuid::new_v4(),
            is_admin: true,
        }
    }

    #[test]
    fn tokenizer_lowercases_and_splits_on_punctuation() {
        assert_eq!(
            tokenize("Annual-Report, 2024: Zürich!"),
            vec!["annual", "report", "2024", "zürich"]
        );
    }

    #[tokio::test]
    async fn starts_empty_and_is_not_empty_after_reindex() {
        let index = SearchIndex::new();
        assert!(index.is_empty().await);
        index.reindex_all(vec![sample_document("Budget")]).await;
        assert!(!index.is_empty().await);

        let rebuilt_over_nothing = SearchIndex::new();
        rebuilt_over_nothing.reindex_all(Vec::new()).await;
        assert!(!rebuilt_over_nothing.is_empty().await);
    }

    #[tokio::test]
    async fn title_matches_rank_above_body_matches() {
        let index = SearchIndex::new();
        let mut in_title = sample_document("Invoice March");
        in_title.content = Some("payment terms".into());
        let mut in_body = sample_document("Letter");
        in_body.content = Some("the invoice is attached among many other words here".into());
        let unrelated = sample_document("Minutes");
        index
            .reindex_all(vec![in_title.clone(), in_body.clone(), unrelated])
            .await;

        let hits = index
            .search("invoice", &SearchFilters::default(), &admin())
            .await;
        let ids: Vec<Uuid> = hits.iter().map(|hit| hit.document_id).collect();
        assert_eq!(ids, vec![in_title.id, in_body.id]);
    }

    #[tokio::test]
    async fn all_query_terms_must_match_and_prefixes_count() {
        let index = SearchIndex::new();
        let both = sample_document("quarterly financial report");
        let one = sample_document("quarterly newsletter");
        index.reindex_all(vec![both.clone(), one]).await;

        let hits = index
            .search("quart finan", &SearchFilters::default(), &admin())
            .await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, both.id);
    }

    #[tokio::test]
    async fn empty_query_lists_active_visible_documents() {
        let index = SearchIndex::new();
        let viewer = Viewer {
            user_id: Uuid::new_v4(),
            is_admin: false,
        };
        let public = sample_document("Public");
        let mut restricted = sample_document("Restricted");
        restricted.access_user_ids = vec![Uuid::new_v4()];
        let mut shared = sample_document("Shared");
        shared.access_user_ids = vec![viewer.user_id];
        let mut deleted = sample_document("Deleted");
        deleted.deleted = true;
        index
            .reindex_all(vec![
                public.clone(),
                restricted,
                shared.clone(),
                deleted.clone(),
            ])
            .await;

        let hits = index.search("", &SearchFilters::default(), &viewer).await;
        let ids: HashSet<Uuid> = hits.iter().map(|hit| hit.document_id).collect();
        assert_eq!(ids, HashSet::from([public.id, shared.id]));

        let deleted_only = SearchFilters {
            status: StatusFilter::Deleted,
            ..SearchFilters::default()
        };
        let hits = index.search("", &deleted_only, &viewer).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, deleted.id);
    }

    #[tokio::test]
    async fn filters_by_category_author_and_date_range() {
        let index = SearchIndex::new();
        let category = Uuid::new_v4();
        let mut recent = sample_document("Contract");
        recent.category_ids = vec![category];
        let mut old = sample_document("Contract");
        old.category_ids = vec![category];
        old.created_at = recent.created_at - Duration::days(30);
        let other = sample_document("Contract");
        index
            .reindex_all(vec![recent.clone(), old.clone(), other])
            .await;

        let filters = SearchFilters {
            category_ids: vec![category],
            created_from: Some(recent.created_at - Duration::days(1)),
            ..SearchFilters::default()
        };
        let hits = index.search("contract", &filters, &admin()).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, recent.id);

        let by_author = SearchFilters {
            author_id: Some(old.author_id),
            ..SearchFilters::default()
        };
        let hits = index.search("", &by_author, &admin()).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, old.id);
    }

    #[tokio::test]
    async fn repeated_upsert_is_idempotent() {
        let index = SearchIndex::new();
        let doc = sample_document("Safety manual");
        index.index_document(doc.clone()).await;
        let once = index.export().await;
        index.index_document(doc.clone()).await;
        let twice = index.export().await;
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn upsert_replaces_stale_terms_and_remove_drops_postings() {
        let index = SearchIndex::new();
        let mut doc = sample_document("Draft agenda");
        index.index_document(doc.clone()).await;
        doc.title = "Final agenda".into();
        index.index_document(doc.clone()).await;

        let viewer = admin();
        assert!(index
            .search("draft", &SearchFilters::default(), &viewer)
            .await
            .is_empty());
        assert_eq!(
            index
                .search("final", &SearchFilters::default(), &viewer)
                .await
                .len(),
            1
        );

        assert!(index.remove_from_index(doc.id).await);
        assert!(!index.remove_from_index(doc.id).await);
        let (inverted, documents) = index.export().await;
        assert!(inverted.postings.is_empty());
        assert!(documents.is_empty());
    }
}
