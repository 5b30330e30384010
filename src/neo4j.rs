//! Neo4j target store over Bolt.
//!
//! Every write is one `UNWIND $batch ... MERGE` statement, so replaying a
//! batch after a retry or a resumed run leaves the graph unchanged.

use crate::config::{
    CONNECT_MAX_RETRIES, CONNECT_RETRY_DELAY_SECS, DEFAULT_BOLT_URI, DEFAULT_BOLT_USER,
};
use crate::models::ConceptEdge;
use crate::store::{ArticleNode, ConceptNode, GraphStore, StoreConnector, StoreCounts, StoreError};
use async_trait::async_trait;
use neo4rs::{query, BoltList, BoltMap, BoltNull, BoltString, BoltType, Graph, Query};
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &[&str] = &[
    "CREATE CONSTRAINT concept_qid IF NOT EXISTS FOR (c:Concept) REQUIRE c.qid IS UNIQUE",
    "CREATE CONSTRAINT article_key IF NOT EXISTS FOR (a:Article) REQUIRE (a.id, a.lang) IS UNIQUE",
    "CREATE INDEX article_title IF NOT EXISTS FOR (a:Article) ON (a.title)",
];

const CYPHER_CONCEPTS: &str = "\
UNWIND $batch AS row
MERGE (c:Concept {qid: row.qid})
RETURN count(c) AS cnt";

const CYPHER_ARTICLES: &str = "\
UNWIND $batch AS row
MATCH (c:Concept {qid: row.concept})
MERGE (a:Article {id: row.id, lang: row.lang})
SET a.title = row.title,
    a.revision_id = row.revision_id,
    a.timestamp = row.timestamp,
    a.word_count = row.word_count,
    a.text_length = row.text_length,
    a.categories = row.categories,
    a.infobox_type = row.infobox_type
MERGE (a)-[:REPRESENTS]->(c)
RETURN count(a) AS cnt";

const CYPHER_EDGES: &str = "\
UNWIND $batch AS row
MATCH (s:Concept {qid: row.source})
MATCH (t:Concept {qid: row.target})
MERGE (s)-[:LINKS_TO]->(t)
RETURN count(*) AS cnt";

#[derive(Debug, Clone)]
pub struct Neo4jConnector {
    pub uri: String,
    pub user: String,
    pub password: String,
}

impl Default for Neo4jConnector {
    fn default() -> Self {
        Self {
            uri: DEFAULT_BOLT_URI.to_string(),
            user: DEFAULT_BOLT_USER.to_string(),
            password: String::new(),
        }
    }
}

impl Neo4jConnector {
    pub fn new(
        uri: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            user: user.into(),
            password: password.into(),
        }
    }

    async fn connect_with_retry(&self) -> Result<Graph, StoreError> {
        let delay = Duration::from_secs(CONNECT_RETRY_DELAY_SECS);
        let mut last_error = String::new();

        for attempt in 1..=CONNECT_MAX_RETRIES {
            match Graph::new(&self.uri, &self.user, &self.password) {
                Ok(graph) => match graph.run(query("RETURN 1")).await {
                    Ok(()) => return Ok(graph),
                    Err(e) => last_error = e.to_string(),
                },
                Err(e) => last_error = e.to_string(),
            }
            if attempt < CONNECT_MAX_RETRIES {
                info!(
                    attempt,
                    uri = %self.uri,
                    error = %last_error,
                    "Cannot reach Neo4j, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(StoreError::Fatal(format!(
            "cannot connect to Neo4j at {} after {} attempts: {}",
            self.uri, CONNECT_MAX_RETRIES, last_error
        )))
    }
}

#[async_trait]
impl StoreConnector for Neo4jConnector {
    type Store = Neo4jStore;

    async fn connect(&self) -> Result<Neo4jStore, StoreError> {
        let graph = self.connect_with_retry().await?;
        debug!(uri = %self.uri, "Neo4j connection ready");
        Ok(Neo4jStore { graph })
    }
}

pub struct Neo4jStore {
    graph: Graph,
}

/// Lock contention, leader switches and dropped sockets are worth retrying;
/// syntax, constraint and auth failures are not.
fn classify(error: neo4rs::Error) -> StoreError {
    let message = error.to_string();
    let lowered = message.to_ascii_lowercase();
    let transient = [
        "transient",
        "deadlock",
        "serviceunavailable",
        "sessionexpired",
        "connection",
        "broken pipe",
        "timed out",
        "io error",
    ];
    if transient.iter().any(|needle| lowered.contains(needle)) {
        StoreError::Transient(message)
    } else {
        StoreError::Fatal(message)
    }
}

fn text(value: &str) -> BoltType {
    BoltType::String(BoltString::from(value))
}

fn optional_text(value: Option<&str>) -> BoltType {
    match value {
        Some(v) => text(v),
        None => BoltType::Null(BoltNull),
    }
}

fn integer(value: u64) -> BoltType {
    BoltType::from(value as i64)
}

fn row(fields: Vec<(&str, BoltType)>) -> BoltType {
    let mut map = BoltMap::new();
    for (key, value) in fields {
        map.put(BoltString::from(key), value);
    }
    BoltType::Map(map)
}

fn rows<T>(batch: &[T], to_row: impl Fn(&T) -> BoltType) -> BoltType {
    let mut list = BoltList::new();
    for item in batch {
        list.push(to_row(item));
    }
    BoltType::List(list)
}

fn article_row(article: &ArticleNode) -> BoltType {
    let mut categories = BoltList::new();
    for category in &article.categories {
        categories.push(text(category));
    }
    row(vec![
        ("id", integer(article.page_id)),
        ("lang", text(&article.language)),
        ("title", text(&article.title)),
        ("concept", text(article.concept.as_str())),
        (
            "revision_id",
            article.revision_id.map(integer).unwrap_or(BoltType::Null(BoltNull)),
        ),
        ("timestamp", optional_text(article.timestamp.as_deref())),
        ("word_count", integer(article.word_count)),
        ("text_length", integer(article.text_length)),
        ("categories", BoltType::List(categories)),
        ("infobox_type", optional_text(article.infobox_type.as_deref())),
    ])
}

impl Neo4jStore {
    async fn run_cypher(&self, cypher: &str) -> Result<(), StoreError> {
        self.graph.run(query(cypher)).await.map_err(classify)
    }

    async fn query_count(&self, q: Query) -> Result<u64, StoreError> {
        let mut result = self.graph.execute(q).await.map_err(classify)?;
        match result.next().await.map_err(classify)? {
            Some(row) => {
                let count: i64 = row
                    .get("cnt")
                    .map_err(|e| StoreError::Fatal(format!("missing 'cnt' field in result: {e}")))?;
                Ok(count.max(0) as u64)
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn ensure_schema(&mut self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            self.run_cypher(statement).await?;
        }
        info!("Neo4j constraints and indexes in place");
        Ok(())
    }

    async fn upsert_concepts(&mut self, batch: &[ConceptNode]) -> Result<u64, StoreError> {
        let param = rows(batch, |c| row(vec![("qid", text(c.id.as_str()))]));
        self.query_count(query(CYPHER_CONCEPTS).param("batch", param)).await
    }

    async fn upsert_articles(&mut self, batch: &[ArticleNode]) -> Result<u64, StoreError> {
        let param = rows(batch, article_row);
        let applied = self
            .query_count(query(CYPHER_ARTICLES).param("batch", param))
            .await?;
        if applied < batch.len() as u64 {
            return Err(StoreError::Integrity(format!(
                "{} of {} articles reference a concept that does not exist",
                batch.len() as u64 - applied,
                batch.len()
            )));
        }
        Ok(applied)
    }

    async fn upsert_edges(&mut self, batch: &[ConceptEdge]) -> Result<u64, StoreError> {
        let param = rows(batch, |e| {
            row(vec![
                ("source", text(e.source.as_str())),
                ("target", text(e.target.as_str())),
            ])
        });
        self.query_count(query(CYPHER_EDGES).param("batch", param)).await
    }

    async fn counts(&mut self) -> Result<StoreCounts, StoreError> {
        Ok(StoreCounts {
            concepts: self
                .query_count(query("MATCH (c:Concept) RETURN count(c) AS cnt"))
                .await?,
            articles: self
                .query_count(query("MATCH (a:Article) RETURN count(a) AS cnt"))
                .await?,
            edges: self
                .query_count(query("MATCH ()-[r:LINKS_TO]->() RETURN count(r) AS cnt"))
                .await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Article, ConceptId};
    use std::collections::BTreeSet;

    #[test]
    fn article_row_carries_every_property() {
        let article = Article {
            id: 10,
            language: "en".into(),
            title: "Apple".into(),
            revision_id: Some(7),
            timestamp: None,
            word_count: 3,
            text_length: 20,
            categories: BTreeSet::from(["Fruit".to_string()]),
            infobox_type: None,
        };
        let node = ArticleNode::from_article(article, ConceptId::external("Q89"));
        let BoltType::Map(map) = article_row(&node) else {
            panic!("expected a map");
        };
        assert_eq!(map.value.len(), 10);
        assert!(map.value.contains_key(&BoltString::from("concept")));
    }

    #[test]
    fn default_connector_points_at_localhost() {
        let connector = Neo4jConnector::default();
        assert_eq!(connector.uri, DEFAULT_BOLT_URI);
        assert_eq!(connector.user, DEFAULT_BOLT_USER);
    }

    #[test]
    fn statements_are_idempotent_merges() {
        for cypher in [CYPHER_CONCEPTS, CYPHER_ARTICLES, CYPHER_EDGES] {
            assert!(cypher.starts_with("UNWIND $batch"));
            assert!(cypher.contains("MERGE"));
            assert!(!cypher.contains("CREATE "));
        }
        assert!(SCHEMA.iter().all(|s| s.contains("IF NOT EXISTS")));
    }
}
