//! Target store seam: record types, error taxonomy, and an in-memory store
//! with the same merge-by-key semantics as the graph database.

use crate::models::{Article, ConceptEdge, ConceptId};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("referential integrity violation: {0}")]
    Integrity(String),
    #[error("store failure: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Timeout(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConceptNode {
    pub id: ConceptId,
}

/// Article as written to the store, keyed by `(page_id, language)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArticleNode {
    pub page_id: u64,
    pub language: String,
    pub title: String,
    pub concept: ConceptId,
    pub revision_id: Option<u64>,
    pub timestamp: Option<String>,
    pub word_count: u64,
    pub text_length: u64,
    pub categories: Vec<String>,
    pub infobox_type: Option<String>,
}

impl ArticleNode {
    pub fn from_article(article: Article, concept: ConceptId) -> Self {
        Self {
            page_id: article.id,
            language: article.language,
            title: article.title,
            concept,
            revision_id: article.revision_id,
            timestamp: article.timestamp,
            word_count: article.word_count,
            text_length: article.text_length,
            categories: article.categories.into_iter().collect(),
            infobox_type: article.infobox_type,
        }
    }

    /// `<language>:<page_id>`, unique across languages.
    pub fn uid(&self) -> String {
        format!("{}:{}", self.language, self.page_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub concepts: u64,
    pub articles: u64,
    pub edges: u64,
}

/// One connection's worth of writes. Every upsert is idempotent: applying
/// the same batch twice leaves the store unchanged. Returns the number of
/// records applied; edges whose endpoints are missing are not applied.
#[async_trait]
pub trait GraphStore: Send {
    async fn ensure_schema(&mut self) -> Result<(), StoreError>;

    async fn upsert_concepts(&mut self, batch: &[ConceptNode]) -> Result<u64, StoreError>;

    /// Fails with [`StoreError::Integrity`] if a referenced concept does not exist.
    async fn upsert_articles(&mut self, batch: &[ArticleNode]) -> Result<u64, StoreError>;

    async fn upsert_edges(&mut self, batch: &[ConceptEdge]) -> Result<u64, StoreError>;

    async fn counts(&mut self) -> Result<StoreCounts, StoreError>;
}

/// Opens a fresh store connection per worker.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    type Store: GraphStore + 'static;

    async fn connect(&self) -> Result<Self::Store, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Schema,
    Concepts,
    Articles,
    Edges,
}

#[derive(Debug, Default)]
struct GraphState {
    concepts: BTreeSet<ConceptId>,
    articles: BTreeMap<(u64, String), ArticleNode>,
    edges: BTreeSet<ConceptEdge>,
    log: Vec<OpKind>,
}

/// Shared in-process graph. Clones are handles onto the same state, so each
/// worker can hold its own "connection".
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<GraphState>>,
    failures: Arc<AtomicU32>,
    delay: Option<Duration>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` upserts fail with a transient error. Schema setup
    /// and count queries are not affected.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Every operation sleeps this long first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, GraphState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Fatal("in-memory store lock poisoned".to_string()))
    }

    async fn enter(&self, kind: OpKind) -> Result<(), StoreError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let injected = kind != OpKind::Schema
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if injected {
            return Err(StoreError::Transient(format!("injected failure during {:?}", kind)));
        }
        self.lock()?.log.push(kind);
        Ok(())
    }

    pub fn articles_for_concept(&self, concept: &ConceptId) -> Vec<ArticleNode> {
        match self.lock() {
            Ok(state) => state
                .articles
                .values()
                .filter(|a| &a.concept == concept)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn edges(&self) -> Vec<ConceptEdge> {
        self.lock()
            .map(|s| s.edges.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Kinds of successful operations in the order they were applied.
    pub fn op_log(&self) -> Vec<OpKind> {
        self.lock().map(|s| s.log.clone()).unwrap_or_default()
    }

    pub fn snapshot_counts(&self) -> StoreCounts {
        self.lock()
            .map(|s| StoreCounts {
                concepts: s.concepts.len() as u64,
                articles: s.articles.len() as u64,
                edges: s.edges.len() as u64,
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl GraphStore for InMemoryStore {
    async fn ensure_schema(&mut self) -> Result<(), StoreError> {
        self.enter(OpKind::Schema).await
    }

    async fn upsert_concepts(&mut self, batch: &[ConceptNode]) -> Result<u64, StoreError> {
        self.enter(OpKind::Concepts).await?;
        let mut state = self.lock()?;
        for node in batch {
            state.concepts.insert(node.id.clone());
        }
        Ok(batch.len() as u64)
    }

    async fn upsert_articles(&mut self, batch: &[ArticleNode]) -> Result<u64, StoreError> {
        self.enter(OpKind::Articles).await?;
        let mut state = self.lock()?;
        if let Some(orphan) = batch.iter().find(|a| !state.concepts.contains(&a.concept)) {
            return Err(StoreError::Integrity(format!(
                "article {} references unknown concept {}",
                orphan.uid(),
                orphan.concept
            )));
        }
        for node in batch {
            state
                .articles
                .insert((node.page_id, node.language.clone()), node.clone());
        }
        Ok(batch.len() as u64)
    }

    async fn upsert_edges(&mut self, batch: &[ConceptEdge]) -> Result<u64, StoreError> {
        self.enter(OpKind::Edges).await?;
        let mut state = self.lock()?;
        let mut applied = 0;
        for edge in batch {
            if state.concepts.contains(&edge.source) && state.concepts.contains(&edge.target) {
                state.edges.insert(edge.clone());
                applied += 1;
            }
        }
        Ok(applied)
    }

    async fn counts(&mut self) -> Result<StoreCounts, StoreError> {
        Ok(self.snapshot_counts())
    }
}

#[async_trait]
impl StoreConnector for InMemoryStore {
    type Store = InMemoryStore;

    async fn connect(&self) -> Result<InMemoryStore, StoreError> {
        Ok(self.clone())
    }
}
