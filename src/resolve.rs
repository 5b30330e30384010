//! Raw link resolution into concept edges.
//!
//! Two interchangeable strategies sit behind [`LinkResolver`]: an in-memory
//! title index, and a SQLite staging database that performs the same lookup
//! as a join. Both see the same normalized titles, follow redirect chains
//! with the same hop limit and cycle rule, and emit edges in link order,
//! so their outputs are identical for identical inputs.

use crate::config::REDIRECT_MAX_HOPS;
use crate::identity::IdentityResolver;
use crate::index::{RedirectTable, TitleIndex};
use crate::models::{normalize_title, Article, ConceptEdge, ConceptId, RawLink, Redirect};
use crate::stats::ResolutionStats;
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Both phases must be fed completely (all articles, all redirects) before
/// the first call to [`LinkResolver::resolve`].
pub trait LinkResolver {
    fn name(&self) -> &'static str;

    fn add_articles(&mut self, articles: &[Article], identity: &IdentityResolver) -> Result<()>;

    fn add_redirects(&mut self, redirects: &[Redirect]) -> Result<()>;

    /// Resolves links in input order, counting every dropped link.
    fn resolve(&mut self, links: &[RawLink], stats: &ResolutionStats) -> Result<Vec<ConceptEdge>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResolveStrategy {
    #[default]
    Memory,
    /// Stage into SQLite; `None` keeps the database in memory
    Sqlite { db_path: Option<PathBuf> },
}

pub fn resolver_for(strategy: &ResolveStrategy, max_hops: u32) -> Result<Box<dyn LinkResolver>> {
    Ok(match strategy {
        ResolveStrategy::Memory => Box::new(MemoryResolver::new(max_hops)),
        ResolveStrategy::Sqlite { db_path } => {
            Box::new(SqliteResolver::open(db_path.as_deref(), max_hops)?)
        }
    })
}

/// Shared decision step, so both strategies drop and count links the same way.
fn decide(
    source: Option<ConceptId>,
    target: Option<(ConceptId, u32)>,
    stats: &ResolutionStats,
) -> Option<ConceptEdge> {
    let Some(source) = source else {
        stats.inc_unknown_source();
        return None;
    };
    let Some((target, hops)) = target else {
        stats.inc_redlinks();
        return None;
    };
    if source == target {
        stats.inc_self_edges();
        return None;
    }
    if hops > 0 {
        stats.inc_via_redirect();
    }
    stats.inc_resolved();
    Some(ConceptEdge { source, target })
}

pub struct MemoryResolver {
    titles: TitleIndex<ConceptId>,
    redirects: RedirectTable,
    max_hops: u32,
}

impl Default for MemoryResolver {
    fn default() -> Self {
        Self::new(REDIRECT_MAX_HOPS)
    }
}

impl MemoryResolver {
    pub fn new(max_hops: u32) -> Self {
        Self {
            titles: TitleIndex::new(),
            redirects: RedirectTable::new(),
            max_hops,
        }
    }
}

impl LinkResolver for MemoryResolver {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn add_articles(&mut self, articles: &[Article], identity: &IdentityResolver) -> Result<()> {
        identity.index_articles(&mut self.titles, articles);
        Ok(())
    }

    fn add_redirects(&mut self, redirects: &[Redirect]) -> Result<()> {
        for r in redirects {
            self.redirects.insert(&r.language, &r.alias_title, &r.target_title);
        }
        Ok(())
    }

    fn resolve(&mut self, links: &[RawLink], stats: &ResolutionStats) -> Result<Vec<ConceptEdge>> {
        let mut edges = Vec::with_capacity(links.len());
        for link in links {
            let source = self.titles.get(&link.language, &link.source_title).cloned();
            let target = self
                .titles
                .resolve(&self.redirects, &link.language, &link.target_title, self.max_hops)
                .map(|(concept, hops)| (concept.clone(), hops));
            if let Some(edge) = decide(source, target, stats) {
                edges.push(edge);
            }
        }
        Ok(edges)
    }
}

const SQLITE_SCHEMA: &str = r#"
PRAGMA journal_mode = OFF;
PRAGMA synchronous = OFF;
PRAGMA temp_store = MEMORY;
CREATE TABLE IF NOT EXISTS articles (
    lang TEXT NOT NULL,
    title TEXT NOT NULL,
    concept TEXT NOT NULL,
    PRIMARY KEY (lang, title)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS redirects (
    lang TEXT NOT NULL,
    alias TEXT NOT NULL,
    target TEXT NOT NULL,
    PRIMARY KEY (lang, alias)
) WITHOUT ROWID;
DELETE FROM articles;
DELETE FROM redirects;
CREATE TEMP TABLE IF NOT EXISTS temp_links (
    id INTEGER PRIMARY KEY,
    lang TEXT NOT NULL,
    source TEXT NOT NULL,
    target TEXT NOT NULL
);
"#;

/// Walks each link target through the redirect table until an article title
/// is hit, at most `?1` hops, never revisiting a title on the same chain.
const SQLITE_RESOLVE: &str = r#"
WITH RECURSIVE chain(id, lang, title, hops, path) AS (
    SELECT id, lang, target, 0, '|' || target || '|' FROM temp_links
    UNION ALL
    SELECT c.id, c.lang, r.target, c.hops + 1, c.path || r.target || '|'
    FROM chain c
    JOIN redirects r ON r.lang = c.lang AND r.alias = c.title
    WHERE c.hops < ?1
      AND NOT EXISTS (SELECT 1 FROM articles a WHERE a.lang = c.lang AND a.title = c.title)
      AND instr(c.path, '|' || r.target || '|') = 0
),
hit AS (
    SELECT c.id, a.concept, c.hops
    FROM chain c
    JOIN articles a ON a.lang = c.lang AND a.title = c.title
)
SELECT l.id, s.concept, h.concept, h.hops
FROM temp_links l
LEFT JOIN articles s ON s.lang = l.lang AND s.title = l.source
LEFT JOIN hit h ON h.id = l.id
ORDER BY l.id
"#;

/// Join-based resolution for when the title index does not fit in RAM.
pub struct SqliteResolver {
    conn: Connection,
    max_hops: u32,
}

impl SqliteResolver {
    /// Opens or creates the staging database. Rows staged by an earlier run
    /// are discarded, so a reused file resolves exactly like a fresh one.
    pub fn open(db_path: Option<&Path>, max_hops: u32) -> Result<Self> {
        let conn = match db_path {
            Some(path) => Connection::open(path)
                .with_context(|| format!("Failed to open staging database: {:?}", path))?,
            None => Connection::open_in_memory().context("Failed to open in-memory database")?,
        };
        conn.execute_batch(SQLITE_SCHEMA)
            .context("Failed to create staging schema")?;
        info!(path = ?db_path, max_hops, "SQLite resolver ready");
        Ok(Self { conn, max_hops })
    }
}

impl LinkResolver for SqliteResolver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn add_articles(&mut self, articles: &[Article], identity: &IdentityResolver) -> Result<()> {
        let tx = self.conn.transaction().context("Failed to begin transaction")?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO articles (lang, title, concept) VALUES (?1, ?2, ?3)",
            )?;
            for article in articles {
                let concept = identity.concept_for_article(article);
                stmt.execute(params![
                    article.language,
                    normalize_title(&article.title),
                    concept.as_str()
                ])?;
            }
        }
        tx.commit().context("Failed to stage articles")?;
        Ok(())
    }

    fn add_redirects(&mut self, redirects: &[Redirect]) -> Result<()> {
        let tx = self.conn.transaction().context("Failed to begin transaction")?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO redirects (lang, alias, target) VALUES (?1, ?2, ?3)",
            )?;
            for r in redirects {
                stmt.execute(params![
                    r.language,
                    normalize_title(&r.alias_title),
                    normalize_title(&r.target_title)
                ])?;
            }
        }
        tx.commit().context("Failed to stage redirects")?;
        Ok(())
    }

    fn resolve(&mut self, links: &[RawLink], stats: &ResolutionStats) -> Result<Vec<ConceptEdge>> {
        let tx = self.conn.transaction().context("Failed to begin transaction")?;
        tx.execute("DELETE FROM temp_links", [])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO temp_links (id, lang, source, target) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (i, link) in links.iter().enumerate() {
                stmt.execute(params![
                    i as i64,
                    link.language,
                    normalize_title(&link.source_title),
                    normalize_title(&link.target_title)
                ])?;
            }
        }

        let mut edges = Vec::with_capacity(links.len());
        {
            let mut stmt = tx.prepare(SQLITE_RESOLVE)?;
            let rows = stmt.query_map(params![self.max_hops], |row| {
                Ok((
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<u32>>(3)?,
                ))
            })?;
            for row in rows {
                let (source, target, hops) = row.context("Failed to read resolved link")?;
                let target = target.map(|t| (ConceptId::external(t), hops.unwrap_or(0)));
                if let Some(edge) = decide(source.map(ConceptId::external), target, stats) {
                    edges.push(edge);
                }
            }
        }
        tx.execute("DELETE FROM temp_links", [])?;
        tx.commit().context("Failed to finish link resolution")?;

        debug!(links = links.len(), edges = edges.len(), "Resolved link batch via join");
        Ok(edges)
    }
}

/// Adds articles to a title index keyed to page ids, for article-to-article graphs.
pub fn index_pages(index: &mut TitleIndex<u64>, articles: &[Article]) {
    for article in articles {
        index.insert(&article.language, &article.title, article.id);
    }
}

/// Resolves links into `(language, source_page_id, target_page_id)`,
/// independent of concept ids. Both ids belong to the link's language.
pub fn resolve_page_links<'a>(
    links: &'a [RawLink],
    index: &TitleIndex<u64>,
    redirects: &RedirectTable,
    max_hops: u32,
    stats: &ResolutionStats,
) -> Vec<(&'a str, u64, u64)> {
    let mut pairs = Vec::with_capacity(links.len());
    for link in links {
        let Some(&source) = index.get(&link.language, &link.source_title) else {
            stats.inc_unknown_source();
            continue;
        };
        let Some((&target, hops)) =
            index.resolve(redirects, &link.language, &link.target_title, max_hops)
        else {
            stats.inc_redlinks();
            continue;
        };
        if source == target {
            stats.inc_self_edges();
            continue;
        }
        if hops > 0 {
            stats.inc_via_redirect();
        }
        stats.inc_resolved();
        pairs.push((link.language.as_str(), source, target));
    }
    pairs
}
