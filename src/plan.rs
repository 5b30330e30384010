//! Load plan assembly: the two-pass read of extraction shards into the
//! deduplicated concept, article and edge sets handed to the loader.
//!
//! [`LoadPlan`] keeps the sets in memory. The SQLite-backed
//! [`StagedPlan`](crate::staging::StagedPlan) keeps them on disk. Both are
//! read back page by page through [`PlanSource`].

use crate::batch::{self, ShardRead};
use crate::identity::IdentityResolver;
use crate::models::{Article, ConceptEdge, ConceptId};
use crate::resolve::LinkResolver;
use crate::stats::ResolutionStats;
use crate::store::{ArticleNode, ConceptNode, StoreCounts};
use anyhow::{Context, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlanReport {
    pub articles_read: u64,
    pub duplicate_articles: u64,
    pub redirects_read: u64,
    pub links_read: u64,
    pub duplicate_edges: u64,
    pub dangling_edges: u64,
    pub malformed_lines: u64,
}

/// Paged, ordered access to a finished plan.
///
/// Each `*_page` call returns up to `limit` records after `cursor` and moves
/// the cursor past them. An empty page means the set is exhausted.
pub trait PlanSource {
    fn report(&self) -> PlanReport;

    /// Number of concepts, articles and edges the plan will hand out.
    fn sizes(&self) -> StoreCounts;

    fn concepts_page(&self, cursor: &mut u64, limit: usize) -> Result<Vec<ConceptNode>>;

    fn articles_page(&self, cursor: &mut u64, limit: usize) -> Result<Vec<ArticleNode>>;

    fn edges_page(&self, cursor: &mut u64, limit: usize) -> Result<Vec<ConceptEdge>>;

    fn is_empty(&self) -> bool {
        self.sizes() == StoreCounts::default()
    }
}

/// Receives the records of the two-pass read and turns them into a plan.
pub(crate) trait PlanSink {
    type Plan: PlanSource;

    fn add_articles(&mut self, articles: Vec<Article>) -> Result<()>;

    fn add_edges(&mut self, edges: Vec<ConceptEdge>) -> Result<()>;

    /// Dedupes, drops dangling edges and completes `report`.
    fn finish(self, report: PlanReport) -> Result<Self::Plan>;
}

/// Pass 1 feeds every article shard and redirect file of every directory
/// to the resolver; pass 2 resolves every link shard. A link may point at
/// an article written in any batch, so no link is resolved before pass 1
/// completes.
pub(crate) fn read_dirs<S: PlanSink>(
    dirs: &[&Path],
    identity: &IdentityResolver,
    resolver: &mut dyn LinkResolver,
    stats: &ResolutionStats,
    mut sink: S,
) -> Result<S::Plan> {
    let mut report = PlanReport::default();

    for dir in dirs {
        let shards = batch::article_shards(dir)?;
        if shards.is_empty() {
            warn!(dir = ?dir, "No article shards found");
        }
        for shard in shards {
            let ShardRead { records, malformed } = batch::read_articles(&shard)?;
            report.malformed_lines += malformed;
            report.articles_read += records.len() as u64;
            resolver
                .add_articles(&records, identity)
                .with_context(|| format!("Failed to index shard: {:?}", shard))?;
            debug!(shard = ?shard, articles = records.len(), "Indexed article shard");
            sink.add_articles(records)?;
        }

        let ShardRead { records, malformed } = batch::read_redirects(dir)?;
        report.malformed_lines += malformed;
        report.redirects_read += records.len() as u64;
        resolver
            .add_redirects(&records)
            .with_context(|| format!("Failed to index redirects in {:?}", dir))?;
    }
    info!(
        articles = report.articles_read,
        redirects = report.redirects_read,
        strategy = resolver.name(),
        "Pass 1 complete"
    );

    for dir in dirs {
        for shard in batch::link_shards(dir)? {
            let ShardRead { records, malformed } = batch::read_links(&shard)?;
            report.malformed_lines += malformed;
            report.links_read += records.len() as u64;
            let resolved = resolver
                .resolve(&records, stats)
                .with_context(|| format!("Failed to resolve shard: {:?}", shard))?;
            debug!(
                shard = ?shard,
                links = records.len(),
                edges = resolved.len(),
                "Resolved link shard"
            );
            sink.add_edges(resolved)?;
        }
    }

    let plan = sink.finish(report)?;
    let sizes = plan.sizes();
    let report = plan.report();
    info!(
        concepts = sizes.concepts,
        articles = sizes.articles,
        edges = sizes.edges,
        duplicates = report.duplicate_articles,
        redlinks = stats.redlinks(),
        dangling = report.dangling_edges,
        "Pass 2 complete"
    );
    Ok(plan)
}

#[derive(Debug, Default)]
pub struct LoadPlan {
    pub concepts: Vec<ConceptNode>,
    pub articles: Vec<ArticleNode>,
    pub edges: Vec<ConceptEdge>,
    pub report: PlanReport,
}

/// Articles keyed by `(page id, language)`. A repeat replaces the earlier
/// record in place, keeping the first position.
#[derive(Default)]
struct ArticleSet {
    positions: FxHashMap<(u64, String), usize>,
    articles: Vec<Article>,
    duplicates: u64,
}

impl ArticleSet {
    fn push(&mut self, article: Article) {
        let key = (article.id, article.language.clone());
        match self.positions.get(&key) {
            Some(&pos) => {
                self.articles[pos] = article;
                self.duplicates += 1;
            }
            None => {
                self.positions.insert(key, self.articles.len());
                self.articles.push(article);
            }
        }
    }
}

struct MemorySink<'a> {
    identity: &'a IdentityResolver,
    set: ArticleSet,
    edges: Vec<ConceptEdge>,
}

impl PlanSink for MemorySink<'_> {
    type Plan = LoadPlan;

    fn add_articles(&mut self, articles: Vec<Article>) -> Result<()> {
        for article in articles {
            self.set.push(article);
        }
        Ok(())
    }

    fn add_edges(&mut self, edges: Vec<ConceptEdge>) -> Result<()> {
        self.edges.extend(edges);
        Ok(())
    }

    fn finish(self, mut report: PlanReport) -> Result<LoadPlan> {
        report.duplicate_articles = self.set.duplicates;
        Ok(LoadPlan::finish(self.set.articles, self.edges, self.identity, report))
    }
}

impl LoadPlan {
    /// Builds a plan from in-memory records. Concepts come only from
    /// articles; edges touching any other concept are dropped and counted.
    pub fn assemble(
        articles: impl IntoIterator<Item = Article>,
        edges: impl IntoIterator<Item = ConceptEdge>,
        identity: &IdentityResolver,
    ) -> Self {
        let mut set = ArticleSet::default();
        for article in articles {
            set.push(article);
        }
        let report = PlanReport {
            articles_read: set.articles.len() as u64 + set.duplicates,
            duplicate_articles: set.duplicates,
            ..PlanReport::default()
        };
        Self::finish(set.articles, edges, identity, report)
    }

    fn finish(
        articles: Vec<Article>,
        edges: impl IntoIterator<Item = ConceptEdge>,
        identity: &IdentityResolver,
        mut report: PlanReport,
    ) -> Self {
        let mut known: FxHashSet<ConceptId> = FxHashSet::default();
        let mut concepts = Vec::new();
        let mut nodes = Vec::with_capacity(articles.len());
        for article in articles {
            let concept = identity.concept_for_article(&article);
            if known.insert(concept.clone()) {
                concepts.push(ConceptNode { id: concept.clone() });
            }
            nodes.push(ArticleNode::from_article(article, concept));
        }

        let mut seen: FxHashSet<ConceptEdge> = FxHashSet::default();
        let mut kept = Vec::new();
        for edge in edges {
            if !known.contains(&edge.source) || !known.contains(&edge.target) {
                report.dangling_edges += 1;
                continue;
            }
            if !seen.insert(edge.clone()) {
                report.duplicate_edges += 1;
                continue;
            }
            kept.push(edge);
        }

        Self {
            concepts,
            articles: nodes,
            edges: kept,
            report,
        }
    }

    /// Two-pass read of one language's extraction output.
    pub fn from_dir(
        dir: &Path,
        identity: &IdentityResolver,
        resolver: &mut dyn LinkResolver,
        stats: &ResolutionStats,
    ) -> Result<Self> {
        Self::from_dirs(&[dir], identity, resolver, stats)
    }

    /// Two-pass read of several extraction outputs into one in-memory plan.
    pub fn from_dirs(
        dirs: &[&Path],
        identity: &IdentityResolver,
        resolver: &mut dyn LinkResolver,
        stats: &ResolutionStats,
    ) -> Result<Self> {
        let sink = MemorySink {
            identity,
            set: ArticleSet::default(),
            edges: Vec::new(),
        };
        read_dirs(dirs, identity, resolver, stats, sink)
    }
}

fn page_of<T: Clone>(records: &[T], cursor: &mut u64, limit: usize) -> Vec<T> {
    let start = (*cursor as usize).min(records.len());
    let end = start.saturating_add(limit.max(1)).min(records.len());
    *cursor = end as u64;
    records[start..end].to_vec()
}

impl PlanSource for LoadPlan {
    fn report(&self) -> PlanReport {
        self.report
    }

    fn sizes(&self) -> StoreCounts {
        StoreCounts {
            concepts: self.concepts.len() as u64,
            articles: self.articles.len() as u64,
            edges: self.edges.len() as u64,
        }
    }

    fn concepts_page(&self, cursor: &mut u64, limit: usize) -> Result<Vec<ConceptNode>> {
        Ok(page_of(&self.concepts, cursor, limit))
    }

    fn articles_page(&self, cursor: &mut u64, limit: usize) -> Result<Vec<ArticleNode>> {
        Ok(page_of(&self.articles, cursor, limit))
    }

    fn edges_page(&self, cursor: &mut u64, limit: usize) -> Result<Vec<ConceptEdge>> {
        Ok(page_of(&self.edges, cursor, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ConceptMap;
    use crate::resolve::MemoryResolver;
    use std::collections::BTreeSet;

    fn article(id: u64, language: &str, title: &str) -> Article {
        Article {
            id,
            language: language.into(),
            title: title.into(),
            revision_id: None,
            timestamp: None,
            word_count: 0,
            text_length: 0,
            categories: BTreeSet::new(),
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

    #[test]
    fn duplicate_article_keeps_last_record() {
        let mut newer = article(1, "en", "Apple");
        newer.word_count = 42;
        let plan = LoadPlan::assemble(
            vec![article(1, "en", "Apple"), article(2, "en", "Pear"), newer],
            vec![],
            &identity(),
        );
        assert_eq!(plan.articles.len(), 2);
        assert_eq!(plan.articles[0].word_count, 42);
        assert_eq!(plan.report.duplicate_articles, 1);
        assert_eq!(plan.report.articles_read, 3);
    }

    #[test]
    fn shared_concept_is_planned_once() {
        let plan = LoadPlan::assemble(
            vec![article(1, "en", "Apple"), article(5, "de", "Apfel")],
            vec![],
            &identity(),
        );
        assert_eq!(plan.concepts.len(), 1);
        assert_eq!(plan.articles.len(), 2);
        assert!(plan.articles.iter().all(|a| a.concept.as_str() == "Q1"));
    }

    #[test]
    fn edges_are_deduplicated_and_dangling_dropped() {
        let plan = LoadPlan::assemble(
            vec![article(1, "en", "Apple"), article(2, "en", "Pear")],
            vec![edge("Q1", "Q2"), edge("Q1", "Q2"), edge("Q1", "Q77")],
            &identity(),
        );
        assert_eq!(plan.edges, vec![edge("Q1", "Q2")]);
        assert_eq!(plan.report.duplicate_edges, 1);
        assert_eq!(plan.report.dangling_edges, 1);
    }

    #[test]
    fn empty_dir_gives_empty_plan() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut resolver = MemoryResolver::default();
        let stats = ResolutionStats::new();
        let plan = LoadPlan::from_dir(dir.path(), &identity(), &mut resolver, &stats).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn pages_walk_the_plan_in_order() {
        let plan = LoadPlan::assemble(
            vec![
                article(1, "en", "Apple"),
                article(2, "en", "Pear"),
                article(5, "de", "Apfel"),
            ],
            vec![edge("Q1", "Q2")],
            &identity(),
        );
        let mut cursor = 0;
        let first = plan.articles_page(&mut cursor, 2).unwrap();
        let second = plan.articles_page(&mut cursor, 2).unwrap();
        let rest = plan.articles_page(&mut cursor, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].title, "Apfel");
        assert!(rest.is_empty());
        assert_eq!(
            plan.sizes(),
            StoreCounts {
                concepts: 2,
                articles: 3,
                edges: 1
            }
        );
    }
}
