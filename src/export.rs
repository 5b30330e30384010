//! neo4j-admin import CSVs for a resolved [`PlanSource`], the offline
//! alternative to loading over Bolt.

use crate::batch::{self, ShardRead};
use crate::index::{RedirectTable, TitleIndex};
use crate::plan::PlanSource;
use crate::resolve::{index_pages, resolve_page_links};
use crate::stats::ResolutionStats;
use crate::store::ArticleNode;
use anyhow::{Context, Result};
use csv::Writer;
use rustc_hash::FxHashSet;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use tracing::{debug, info};

pub const CONCEPTS_FILE: &str = "nodes_concepts.csv";
pub const ARTICLES_FILE: &str = "nodes_articles.csv";
pub const REPRESENTS_FILE: &str = "edges_represents.csv";
pub const LINKS_FILE: &str = "edges_links.csv";
pub const ARTICLE_LINKS_FILE: &str = "edges_article_links.csv";

/// Records pulled from the plan per page.
const EXPORT_PAGE_SIZE: usize = 10_000;

/// neo4j-admin's default array delimiter
const ARRAY_DELIMITER: &str = ";";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExportReport {
    pub concepts: u64,
    pub articles: u64,
    pub represents: u64,
    pub links: u64,
}

fn create_writer(dir: &Path, name: &str) -> Result<Writer<BufWriter<File>>> {
    let path = dir.join(name);
    let file = File::create(&path).with_context(|| format!("Failed to create {:?}", path))?;
    Ok(Writer::from_writer(BufWriter::with_capacity(256 * 1024, file)))
}

/// Writes the four node and edge files, paging through the plan so only
/// one page of records is held at a time.
pub fn export_csv(plan: &dyn PlanSource, dir: &Path) -> Result<ExportReport> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create directory: {:?}", dir))?;
    let mut report = ExportReport::default();

    let mut concepts = create_writer(dir, CONCEPTS_FILE)?;
    concepts.write_record(["qid:ID(Concept)", "synthetic:boolean", ":LABEL"])?;
    let mut cursor = 0;
    loop {
        let page = plan.concepts_page(&mut cursor, EXPORT_PAGE_SIZE)?;
        if page.is_empty() {
            break;
        }
        for node in &page {
            let synthetic = if node.id.is_synthetic() { "true" } else { "false" };
            concepts.write_record([node.id.as_str(), synthetic, "Concept"])?;
            report.concepts += 1;
        }
    }
    concepts.flush()?;

    let mut articles = create_writer(dir, ARTICLES_FILE)?;
    articles.write_record([
        "id:ID(Article)",
        "page_id:long",
        "title",
        "lang",
        "revision_id:long",
        "timestamp",
        "word_count:long",
        "text_length:long",
        "categories:string[]",
        "infobox_type",
        ":LABEL",
    ])?;
    let mut represents = create_writer(dir, REPRESENTS_FILE)?;
    represents.write_record([":START_ID(Article)", ":END_ID(Concept)", ":TYPE"])?;

    let mut cursor = 0;
    loop {
        let page = plan.articles_page(&mut cursor, EXPORT_PAGE_SIZE)?;
        if page.is_empty() {
            break;
        }
        for article in &page {
            write_article(&mut articles, &mut represents, article)?;
            report.articles += 1;
            report.represents += 1;
        }
    }
    articles.flush()?;
    represents.flush()?;

    let mut links = create_writer(dir, LINKS_FILE)?;
    links.write_record([":START_ID(Concept)", ":END_ID(Concept)", ":TYPE"])?;
    let mut cursor = 0;
    loop {
        let page = plan.edges_page(&mut cursor, EXPORT_PAGE_SIZE)?;
        if page.is_empty() {
            break;
        }
        for edge in &page {
            links.write_record([edge.source.as_str(), edge.target.as_str(), "LINKS_TO"])?;
            report.links += 1;
        }
    }
    links.flush()?;

    info!(
        concepts = report.concepts,
        articles = report.articles,
        links = report.links,
        dir = ?dir,
        "neo4j-admin CSVs written"
    );
    Ok(report)
}

fn write_article(
    articles: &mut Writer<BufWriter<File>>,
    represents: &mut Writer<BufWriter<File>>,
    article: &ArticleNode,
) -> Result<()> {
    let uid = article.uid();
    let page_id = article.page_id.to_string();
    let revision = article.revision_id.map(|r| r.to_string()).unwrap_or_default();
    let word_count = article.word_count.to_string();
    let text_length = article.text_length.to_string();
    let categories = article.categories.join(ARRAY_DELIMITER);
    articles.write_record([
        uid.as_str(),
        page_id.as_str(),
        article.title.as_str(),
        article.language.as_str(),
        revision.as_str(),
        article.timestamp.as_deref().unwrap_or(""),
        word_count.as_str(),
        text_length.as_str(),
        categories.as_str(),
        article.infobox_type.as_deref().unwrap_or(""),
        "Article",
    ])?;
    represents.write_record([uid.as_str(), article.concept.as_str(), "REPRESENTS"])?;
    Ok(())
}

/// Writes article-to-article `LINKS_TO` edges keyed by `<lang>:<page_id>`,
/// resolved straight from the extraction shards without going through
/// concepts. Returns the number of edges written.
///
/// Links of one page are contiguous in a shard, so repeated edges are
/// dropped per source page.
pub fn export_article_links(
    dirs: &[&Path],
    max_hops: u32,
    out_dir: &Path,
    stats: &ResolutionStats,
) -> Result<u64> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create directory: {:?}", out_dir))?;

    let mut index = TitleIndex::new();
    let mut redirects = Vec::new();
    for dir in dirs {
        for shard in batch::article_shards(dir)? {
            let ShardRead { records, .. } = batch::read_articles(&shard)?;
            index_pages(&mut index, &records);
        }
        redirects.extend(batch::read_redirects(dir)?.records);
    }
    let table = RedirectTable::from_redirects(&redirects);
    drop(redirects);
    debug!(pages = index.len(), redirects = table.len(), "Page index built");

    let mut writer = create_writer(out_dir, ARTICLE_LINKS_FILE)?;
    writer.write_record([":START_ID(Article)", ":END_ID(Article)", ":TYPE"])?;
    let mut written = 0;
    let mut current: Option<(String, u64)> = None;
    let mut targets: FxHashSet<u64> = FxHashSet::default();
    for dir in dirs {
        for shard in batch::link_shards(dir)? {
            let ShardRead { records, .. } = batch::read_links(&shard)?;
            for (lang, source, target) in
                resolve_page_links(&records, &index, &table, max_hops, stats)
            {
                let same_page = current
                    .as_ref()
                    .map(|(l, s)| l.as_str() == lang && *s == source)
                    .unwrap_or(false);
                if !same_page {
                    current = Some((lang.to_string(), source));
                    targets.clear();
                }
                if !targets.insert(target) {
                    continue;
                }
                let start = format!("{lang}:{source}");
                let end = format!("{lang}:{target}");
                writer.write_record([start.as_str(), end.as_str(), "LINKS_TO"])?;
                written += 1;
            }
        }
    }
    writer.flush()?;

    info!(edges = written, dir = ?out_dir, "Article link CSV written");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchWriter;
    use crate::checkpoint::CheckpointManager;
    use crate::config::REDIRECT_MAX_HOPS;
    use crate::models::{Article, ConceptEdge, ConceptId, PageOutcome, RawLink, Redirect};
    use crate::plan::LoadPlan;
    use crate::stats::ExtractionStats;
    use crate::store::ConceptNode;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn plan() -> LoadPlan {
        let mut plan = LoadPlan::default();
        for id in ["Q89", "Q503"] {
            plan.concepts.push(ConceptNode {
                id: ConceptId::external(id),
            });
        }
        let article = Article {
            id: 10,
            language: "en".into(),
            title: "Apple, the fruit".into(),
            revision_id: Some(5),
            timestamp: None,
            word_count: 2,
            text_length: 9,
            categories: BTreeSet::from(["Fruit".to_string(), "Rosaceae".to_string()]),
            infobox_type: Some("fruit".into()),
        };
        plan.articles
            .push(ArticleNode::from_article(article, ConceptId::external("Q89")));
        plan.edges.push(ConceptEdge {
            source: ConceptId::external("Q89"),
            target: ConceptId::external("Q503"),
        });
        plan
    }

    #[test]
    fn writes_all_four_files() {
        let dir = TempDir::new().unwrap();
        let report = export_csv(&plan(), dir.path()).unwrap();
        assert_eq!(
            report,
            ExportReport {
                concepts: 2,
                articles: 1,
                represents: 1,
                links: 1
            }
        );

        let concepts = fs::read_to_string(dir.path().join(CONCEPTS_FILE)).unwrap();
        assert_eq!(concepts.lines().count(), 3);
        assert!(concepts.starts_with("qid:ID(Concept)"));

        let links = fs::read_to_string(dir.path().join(LINKS_FILE)).unwrap();
        assert!(links.contains("Q89,Q503,LINKS_TO"));

        let represents = fs::read_to_string(dir.path().join(REPRESENTS_FILE)).unwrap();
        assert!(represents.contains("en:10,Q89,REPRESENTS"));
    }

    #[test]
    fn article_fields_are_quoted_and_joined() {
        let dir = TempDir::new().unwrap();
        export_csv(&plan(), dir.path()).unwrap();
        let mut reader = csv::Reader::from_path(dir.path().join(ARTICLES_FILE)).unwrap();
        let record = reader.records().next().unwrap().unwrap();
        assert_eq!(&record[0], "en:10");
        assert_eq!(&record[2], "Apple, the fruit");
        assert_eq!(&record[8], "Fruit;Rosaceae");
        assert_eq!(&record[10], "Article");
    }

    fn page(id: u64, title: &str, targets: &[&str]) -> PageOutcome {
        PageOutcome::Article {
            article: Article {
                id,
                language: "en".into(),
                title: title.into(),
                revision_id: None,
                timestamp: None,
                word_count: 0,
                text_length: 0,
                categories: BTreeSet::new(),
                infobox_type: None,
            },
            links: targets
                .iter()
                .map(|t| RawLink {
                    source_title: title.into(),
                    target_title: t.to_string(),
                    language: "en".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn article_links_follow_redirects_and_drop_repeats() {
        let data = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let stats = ExtractionStats::new();
        let checkpoints = CheckpointManager::new("dump.xml", "en", data.path());
        let mut writer = BatchWriter::new(data.path(), 10, None, checkpoints).unwrap();
        let redirect = Redirect {
            alias_title: "Bananas".into(),
            target_title: "Banana".into(),
            language: "en".into(),
        };
        writer
            .push(PageOutcome::Redirect { page_id: 12, redirect }, &stats)
            .unwrap();
        writer
            .push(page(10, "Apple", &["Banana", "Bananas", "Nowhere", "Apple"]), &stats)
            .unwrap();
        writer.push(page(11, "Banana", &["Apple"]), &stats).unwrap();
        writer.finish(&stats).unwrap();

        let resolution = ResolutionStats::new();
        let written =
            export_article_links(&[data.path()], REDIRECT_MAX_HOPS, out.path(), &resolution)
                .unwrap();
        assert_eq!(written, 2);
        assert_eq!(resolution.redlinks(), 1);
        assert_eq!(resolution.self_edges(), 1);

        let csv = fs::read_to_string(out.path().join(ARTICLE_LINKS_FILE)).unwrap();
        let rows: Vec<&str> = csv.lines().collect();
        assert_eq!(
            rows,
            vec![
                ":START_ID(Article),:END_ID(Article),:TYPE",
                "en:10,en:11,LINKS_TO",
                "en:11,en:10,LINKS_TO",
            ]
        );
    }
}
