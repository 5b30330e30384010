//! Load plan staged in SQLite, for runs whose article and edge sets do not
//! fit in RAM.
//!
//! Articles are upserted on `(page_id, lang)` as they are read, resolved
//! edges are appended raw. Finishing the plan derives concepts in
//! first-seen order and the deduplicated, non-dangling edge set with two
//! `INSERT .. SELECT` statements. The loader then pages through the tables
//! by `seq`, so at most one page per phase is held in memory.

use crate::identity::IdentityResolver;
use crate::models::{Article, ConceptEdge, ConceptId};
use crate::plan::{read_dirs, PlanReport, PlanSink, PlanSource};
use crate::resolve::LinkResolver;
use crate::stats::ResolutionStats;
use crate::store::{ArticleNode, ConceptNode, StoreCounts};
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const PLAN_SCHEMA: &str = r#"
PRAGMA journal_mode = OFF;
PRAGMA synchronous = OFF;
DROP TABLE IF EXISTS plan_articles;
DROP TABLE IF EXISTS plan_raw_edges;
DROP TABLE IF EXISTS plan_concepts;
DROP TABLE IF EXISTS plan_edges;
CREATE TABLE plan_articles (
    seq INTEGER PRIMARY KEY,
    page_id INTEGER NOT NULL,
    lang TEXT NOT NULL,
    concept TEXT NOT NULL,
    body TEXT NOT NULL,
    UNIQUE (page_id, lang)
);
CREATE TABLE plan_raw_edges (
    seq INTEGER PRIMARY KEY,
    source TEXT NOT NULL,
    target TEXT NOT NULL
);
CREATE TABLE plan_concepts (
    seq INTEGER PRIMARY KEY,
    qid TEXT NOT NULL UNIQUE
);
CREATE TABLE plan_edges (
    seq INTEGER PRIMARY KEY,
    source TEXT NOT NULL,
    target TEXT NOT NULL
);
"#;

/// A repeated `(page_id, lang)` replaces the record but keeps its `seq`.
const UPSERT_ARTICLE: &str = r#"
INSERT INTO plan_articles (page_id, lang, concept, body) VALUES (?1, ?2, ?3, ?4)
ON CONFLICT (page_id, lang) DO UPDATE SET concept = excluded.concept, body = excluded.body
"#;

const FILL_CONCEPTS: &str = r#"
INSERT INTO plan_concepts (qid)
SELECT concept FROM plan_articles GROUP BY concept ORDER BY MIN(seq)
"#;

const KNOWN_EDGES: &str = r#"
SELECT COUNT(*) FROM plan_raw_edges
WHERE source IN (SELECT qid FROM plan_concepts)
  AND target IN (SELECT qid FROM plan_concepts)
"#;

const FILL_EDGES: &str = r#"
INSERT INTO plan_edges (source, target)
SELECT source, target FROM plan_raw_edges
WHERE source IN (SELECT qid FROM plan_concepts)
  AND target IN (SELECT qid FROM plan_concepts)
GROUP BY source, target
ORDER BY MIN(seq)
"#;

fn count(conn: &Connection, table: &str) -> Result<u64> {
    let n: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .with_context(|| format!("Failed to count {table}"))?;
    Ok(n as u64)
}

pub struct StagedPlan {
    conn: Connection,
    report: PlanReport,
    sizes: StoreCounts,
}

struct StagingSink<'a> {
    conn: Connection,
    identity: &'a IdentityResolver,
}

impl<'a> StagingSink<'a> {
    fn open(db_path: Option<&Path>, identity: &'a IdentityResolver) -> Result<Self> {
        let conn = match db_path {
            Some(path) => Connection::open(path)
                .with_context(|| format!("Failed to open plan database: {:?}", path))?,
            None => Connection::open_in_memory().context("Failed to open in-memory database")?,
        };
        // the link resolver may hold a second connection to the same file
        conn.busy_timeout(Duration::from_secs(30))
            .context("Failed to set busy timeout")?;
        conn.execute_batch(PLAN_SCHEMA)
            .context("Failed to create plan schema")?;
        info!(path = ?db_path, "SQLite plan staging ready");
        Ok(Self { conn, identity })
    }
}

impl PlanSink for StagingSink<'_> {
    type Plan = StagedPlan;

    fn add_articles(&mut self, articles: Vec<Article>) -> Result<()> {
        let tx = self.conn.transaction().context("Failed to begin transaction")?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_ARTICLE)?;
            for article in &articles {
                let concept = self.identity.concept_for_article(article);
                let body = serde_json::to_string(article).context("Failed to encode article")?;
                stmt.execute(params![
                    article.id as i64,
                    article.language,
                    concept.as_str(),
                    body
                ])?;
            }
        }
        tx.commit().context("Failed to stage articles")?;
        Ok(())
    }

    fn add_edges(&mut self, edges: Vec<ConceptEdge>) -> Result<()> {
        let tx = self.conn.transaction().context("Failed to begin transaction")?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT INTO plan_raw_edges (source, target) VALUES (?1, ?2)")?;
            for edge in &edges {
                stmt.execute(params![edge.source.as_str(), edge.target.as_str()])?;
            }
        }
        tx.commit().context("Failed to stage edges")?;
        Ok(())
    }

    fn finish(mut self, mut report: PlanReport) -> Result<StagedPlan> {
        let tx = self.conn.transaction().context("Failed to begin transaction")?;
        let raw = count(&tx, "plan_raw_edges")?;
        tx.execute(FILL_CONCEPTS, [])
            .context("Failed to derive concepts")?;
        let known: i64 = tx
            .query_row(KNOWN_EDGES, [], |row| row.get(0))
            .context("Failed to count known edges")?;
        tx.execute(FILL_EDGES, []).context("Failed to dedupe edges")?;
        tx.execute("DELETE FROM plan_raw_edges", [])?;
        tx.commit().context("Failed to finish plan")?;

        let sizes = StoreCounts {
            concepts: count(&self.conn, "plan_concepts")?,
            articles: count(&self.conn, "plan_articles")?,
            edges: count(&self.conn, "plan_edges")?,
        };
        let known = known as u64;
        report.duplicate_articles = report.articles_read.saturating_sub(sizes.articles);
        report.dangling_edges = raw.saturating_sub(known);
        report.duplicate_edges = known.saturating_sub(sizes.edges);
        debug!(known_edges = known, "Plan staged");

        Ok(StagedPlan {
            conn: self.conn,
            report,
            sizes,
        })
    }
}

impl StagedPlan {
    /// Two-pass read of several extraction outputs, staged in the database
    /// at `db_path` (in memory when `None`). Plan tables from an earlier
    /// run in the same file are dropped first.
    pub fn from_dirs(
        db_path: Option<&Path>,
        dirs: &[&Path],
        identity: &IdentityResolver,
        resolver: &mut dyn LinkResolver,
        stats: &ResolutionStats,
    ) -> Result<Self> {
        let sink = StagingSink::open(db_path, identity)?;
        read_dirs(dirs, identity, resolver, stats, sink)
    }
}

impl PlanSource for StagedPlan {
    fn report(&self) -> PlanReport {
        self.report
    }

    fn sizes(&self) -> StoreCounts {
        self.sizes
    }

    fn concepts_page(&self, cursor: &mut u64, limit: usize) -> Result<Vec<ConceptNode>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT seq, qid FROM plan_concepts WHERE seq > ?1 ORDER BY seq LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![*cursor as i64, limit.max(1) as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut page = Vec::new();
        for row in rows {
            let (seq, qid) = row.context("Failed to read staged concept")?;
            *cursor = seq as u64;
            page.push(ConceptNode {
                id: ConceptId::external(qid),
            });
        }
        Ok(page)
    }

    fn articles_page(&self, cursor: &mut u64, limit: usize) -> Result<Vec<ArticleNode>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT seq, concept, body FROM plan_articles WHERE seq > ?1 ORDER BY seq LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![*cursor as i64, limit.max(1) as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut page = Vec::new();
        for row in rows {
            let (seq, concept, body) = row.context("Failed to read staged article")?;
            let article: Article =
                serde_json::from_str(&body).context("Failed to decode staged article")?;
            *cursor = seq as u64;
            page.push(ArticleNode::from_article(article, ConceptId::external(concept)));
        }
        Ok(page)
    }

    fn edges_page(&self, cursor: &mut u64, limit: usize) -> Result<Vec<ConceptEdge>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT seq, source, target FROM plan_edges WHERE seq > ?1 ORDER BY seq LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![*cursor as i64, limit.max(1) as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut page = Vec::new();
        for row in rows {
            let (seq, source, target) = row.context("Failed to read staged edge")?;
            *cursor = seq as u64;
            page.push(ConceptEdge {
                source: ConceptId::external(source),
                target: ConceptId::external(target),
            });
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ConceptMap;
    use crate::plan::LoadPlan;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn article(id: u64, language: &str, title: &str) -> Article {
        Article {
            id,
            language: language.into(),
            title: title.into(),
            revision_id: Some(id),
            timestamp: None,
            word_count: 0,
            text_length: 0,
            categories: BTreeSet::from(["Fruit".to_string()]),
            infobox_type: None,
        }
    }

    fn edge(a: &str, b: &str) -> ConceptEdge {
        ConceptEdge {
            source: ConceptId::external(a),
            target: ConceptId::external(b),
        }
    }

    fn identity() -> IdentityResolver {
        let mut en = ConceptMap::new();
        en.insert(1, "Q1");
        en.insert(2, "Q2");
        let mut de = ConceptMap::new();
        de.insert(5, "Q1");
        IdentityResolver::new().with_map("en", en).with_map("de", de)
    }

    fn stage(
        db_path: Option<&Path>,
        identity: &IdentityResolver,
        articles: Vec<Article>,
        edges: Vec<ConceptEdge>,
    ) -> StagedPlan {
        let mut sink = StagingSink::open(db_path, identity).unwrap();
        let report = PlanReport {
            articles_read: articles.len() as u64,
            ..PlanReport::default()
        };
        sink.add_articles(articles).unwrap();
        sink.add_edges(edges).unwrap();
        sink.finish(report).unwrap()
    }

    fn drain<T>(mut page: impl FnMut(&mut u64, usize) -> Result<Vec<T>>) -> Vec<T> {
        let mut cursor = 0;
        let mut out = Vec::new();
        loop {
            let next = page(&mut cursor, 2).unwrap();
            if next.is_empty() {
                return out;
            }
            out.extend(next);
        }
    }

    #[test]
    fn staged_plan_matches_in_memory_plan() {
        let identity = identity();
        let mut newer = article(1, "en", "Apple");
        newer.word_count = 42;
        let articles = vec![
            article(1, "en", "Apple"),
            article(2, "en", "Pear"),
            article(5, "de", "Apfel"),
            newer,
            article(3, "en", "Plum"),
        ];
        let edges = vec![
            edge("Q1", "Q2"),
            edge("Q1", "Q2"),
            edge("Q1", "Q77"),
            edge("Q2", "local:en:3"),
        ];
        let memory = LoadPlan::assemble(articles.clone(), edges.clone(), &identity);
        let staged = stage(None, &identity, articles, edges);

        assert_eq!(drain(|c, n| staged.concepts_page(c, n)), memory.concepts);
        assert_eq!(drain(|c, n| staged.articles_page(c, n)), memory.articles);
        assert_eq!(drain(|c, n| staged.edges_page(c, n)), memory.edges);
        assert_eq!(staged.report(), memory.report);
        assert_eq!(staged.sizes(), memory.sizes());
        assert_eq!(staged.report().duplicate_articles, 1);
        assert_eq!(staged.report().dangling_edges, 1);
        assert_eq!(staged.report().duplicate_edges, 1);
    }

    #[test]
    fn plan_rows_live_in_the_database_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("staging.db");
        let identity = identity();
        let staged = stage(
            Some(path.as_path()),
            &identity,
            vec![article(1, "en", "Apple"), article(2, "en", "Pear")],
            vec![edge("Q1", "Q2")],
        );

        let other = Connection::open(&path).unwrap();
        assert_eq!(count(&other, "plan_articles").unwrap(), 2);
        assert_eq!(count(&other, "plan_edges").unwrap(), 1);
        assert_eq!(staged.sizes().articles, 2);
    }

    #[test]
    fn reopened_file_drops_earlier_plan() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("staging.db");
        let identity = identity();
        drop(stage(
            Some(path.as_path()),
            &identity,
            vec![article(1, "en", "Apple"), article(2, "en", "Pear")],
            vec![edge("Q1", "Q2")],
        ));

        let staged = stage(Some(path.as_path()), &identity, vec![article(5, "de", "Apfel")], vec![]);
        assert_eq!(
            staged.sizes(),
            StoreCounts {
                concepts: 1,
                articles: 1,
                edges: 0
            }
        );
        let titles: Vec<String> = drain(|c, n| staged.articles_page(c, n))
            .into_iter()
            .map(|a| a.title)
            .collect();
        assert_eq!(titles, vec!["Apfel".to_string()]);
    }
}
