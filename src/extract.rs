use crate::batch::{self, BatchWriter};
use crate::checkpoint::{self, CheckpointManager};
use crate::config::{LanguageRules, DEFAULT_BATCH_SIZE, EXTRACT_WINDOW, PROGRESS_INTERVAL};
use crate::models::{normalize_title, Article, Page, PageOutcome, RawLink, Redirect};
use crate::stats::ExtractionStats;
use crate::stream::PageStream;
use crate::wikitext;
use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use quick_xml::events::Event;
use quick_xml::Reader;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a single page was dropped. Never aborts the run.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("malformed page XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("page has no <{0}> element")]
    MissingField(&'static str),
    #[error("invalid number in <{field}>: {value:?}")]
    BadNumber { field: &'static str, value: String },
    #[error("redirect page {0:?} has no target")]
    RedirectWithoutTarget(String),
}

#[derive(Clone, Copy)]
enum Field {
    Title,
    Namespace,
    PageId,
    RevisionId,
    Timestamp,
    Text,
}

fn classify(name: &[u8], in_revision: bool, in_contributor: bool) -> Option<Field> {
    match (name, in_revision) {
        (b"title", false) => Some(Field::Title),
        (b"ns", false) => Some(Field::Namespace),
        (b"id", false) => Some(Field::PageId),
        (b"id", true) if !in_contributor => Some(Field::RevisionId),
        (b"timestamp", true) => Some(Field::Timestamp),
        (b"text", true) => Some(Field::Text),
        _ => None,
    }
}

fn parse_number<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ExtractError> {
    value.trim().parse().map_err(|_| ExtractError::BadNumber {
        field,
        value: value.to_string(),
    })
}

/// Reads the handful of fields the extractor needs from one page record.
pub fn parse_page(bytes: &[u8]) -> Result<Page, ExtractError> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut page = Page::default();
    let mut namespace = None;
    let mut id = None;
    let mut has_title = false;

    let mut in_revision = false;
    let mut in_contributor = false;
    let mut field = None;
    let mut value = String::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"revision" => in_revision = true,
                b"contributor" => in_contributor = true,
                name => {
                    field = classify(name, in_revision, in_contributor);
                    value.clear();
                }
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"redirect" => {
                    let title = e.try_get_attribute("title").map_err(quick_xml::Error::from)?;
                    if let Some(attr) = title {
                        page.redirect_title = Some(attr.unescape_value()?.into_owned());
                    }
                }
                b"text" if in_revision => {
                    page.text.get_or_insert_with(String::new);
                }
                _ => {}
            },
            Event::Text(t) => {
                if field.is_some() {
                    value.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if field.is_some() {
                    value.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"revision" => in_revision = false,
                b"contributor" => in_contributor = false,
                _ => match field.take() {
                    Some(Field::Title) => {
                        page.title = std::mem::take(&mut value);
                        has_title = true;
                    }
                    Some(Field::Namespace) => namespace = Some(parse_number("ns", &value)?),
                    Some(Field::PageId) => id = Some(parse_number("id", &value)?),
                    Some(Field::RevisionId) => {
                        page.revision_id = Some(parse_number("revision id", &value)?)
                    }
                    Some(Field::Timestamp) => page.timestamp = Some(std::mem::take(&mut value)),
                    Some(Field::Text) => page.text = Some(std::mem::take(&mut value)),
                    None => {}
                },
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !has_title {
        return Err(ExtractError::MissingField("title"));
    }
    page.namespace = namespace.ok_or(ExtractError::MissingField("ns"))?;
    page.id = id.ok_or(ExtractError::MissingField("id"))?;
    Ok(page)
}

/// Turns one raw page span into a redirect or an article with its links.
///
/// Holds only the compiled language rules, so any number of workers can
/// share one instance.
pub struct PageExtractor {
    rules: Arc<LanguageRules>,
}

impl PageExtractor {
    pub fn new(rules: Arc<LanguageRules>) -> Self {
        Self { rules }
    }

    pub fn extract(&self, bytes: &[u8]) -> Result<PageOutcome, ExtractError> {
        let page = parse_page(bytes)?;
        self.classify(page)
    }

    fn classify(&self, page: Page) -> Result<PageOutcome, ExtractError> {
        if page.namespace != 0 {
            return Ok(PageOutcome::Skipped { page_id: page.id });
        }

        let title = normalize_title(&page.title);
        if title.is_empty() {
            return Err(ExtractError::MissingField("title"));
        }
        let text = page.text.as_deref().unwrap_or("");
        let language = self.rules.code.clone();

        if wikitext::is_redirect(text, &self.rules) {
            let target = wikitext::redirect_target(text)
                .or_else(|| page.redirect_title.as_deref().map(normalize_title))
                .filter(|t| !t.is_empty())
                .ok_or_else(|| ExtractError::RedirectWithoutTarget(title.clone()))?;
            return Ok(PageOutcome::Redirect {
                page_id: page.id,
                redirect: Redirect {
                    alias_title: title,
                    target_title: target,
                    language,
                },
            });
        }

        if text.trim().is_empty() {
            return Ok(PageOutcome::Skipped { page_id: page.id });
        }

        let mut seen = FxHashSet::default();
        let links: Vec<RawLink> = wikitext::link_targets(text, &self.rules)
            .into_iter()
            .filter(|target| seen.insert(target.clone()))
            .map(|target| RawLink {
                source_title: title.clone(),
                target_title: target,
                language: language.clone(),
            })
            .collect();

        let article = Article {
            id: page.id,
            language,
            title,
            revision_id: page.revision_id,
            timestamp: page.timestamp,
            word_count: wikitext::word_count(text, &self.rules),
            text_length: text.chars().count() as u64,
            categories: wikitext::extract_categories(text, &self.rules),
            infobox_type: wikitext::infobox_type(text, &self.rules),
        };

        Ok(PageOutcome::Article { article, links })
    }
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    /// Raw byte offset the dump handle is seeked to before scanning
    pub offset: u64,
    /// Stop after this many pages have been read from the stream
    pub limit: Option<u64>,
    pub batch_size: usize,
    /// Extraction threads; 0 lets rayon decide
    pub threads: usize,
    pub resume: bool,
    /// Ignore any checkpoint and start over. Without a usable checkpoint the
    /// previous shards are always removed first.
    pub clean: bool,
    pub dry_run: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            output_dir: PathBuf::from("output"),
            offset: 0,
            limit: None,
            batch_size: DEFAULT_BATCH_SIZE,
            threads: 0,
            resume: false,
            clean: false,
            dry_run: false,
        }
    }
}

fn make_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} [{elapsed_precise}] {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(200));
    pb
}

fn record(outcome: &PageOutcome, stats: &ExtractionStats) {
    stats.inc_pages();
    match outcome {
        PageOutcome::Skipped { .. } => stats.inc_skipped(),
        PageOutcome::Redirect { .. } => stats.inc_redirects(),
        PageOutcome::Article { article, links } => {
            stats.inc_articles();
            stats.add_links(links.len() as u64);
            stats.add_categories(article.categories.len() as u64);
            if article.infobox_type.is_some() {
                stats.inc_infoboxes();
            }
        }
    }
}

/// Streams the dump, extracts pages in parallel windows and writes shards in arrival order.
///
/// The stream and the batch writer stay on the calling thread; only the
/// per-page work is handed to the pool.
pub fn run_extraction(
    options: &ExtractOptions,
    rules: Arc<LanguageRules>,
) -> Result<ExtractionStats> {
    if !options.input.exists() {
        bail!("Dump file does not exist: {:?}", options.input);
    }
    let input = options.input.to_string_lossy().to_string();
    let language = rules.code.clone();

    let checkpoint = if options.resume && !options.clean {
        let cp = checkpoint::load_if_valid(&input, &language, &options.output_dir)?;
        if cp.is_none() {
            info!("No valid checkpoint found, starting fresh");
        }
        cp
    } else {
        None
    };

    // shards left by an earlier run would otherwise be read back next to ours
    if checkpoint.is_none() && !options.dry_run {
        batch::remove_outputs(&options.output_dir)?;
    }

    let stats = match &checkpoint {
        Some(cp) => ExtractionStats::from_checkpoint(&cp.counters),
        None => ExtractionStats::new(),
    };
    let skip_through = checkpoint.as_ref().map(|cp| cp.last_page_id).unwrap_or(0);
    let first_batch = checkpoint.as_ref().map(|cp| cp.batch_number + 1).unwrap_or(1);

    let mut writer = if options.dry_run {
        None
    } else {
        let checkpoints = CheckpointManager::new(&input, &language, &options.output_dir);
        Some(BatchWriter::new(
            &options.output_dir,
            options.batch_size,
            checkpoint.as_ref(),
            checkpoints,
        )?)
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.threads)
        .thread_name(|i| format!("extract-{i}"))
        .build()
        .context("Failed to build extraction thread pool")?;

    let extractor = PageExtractor::new(rules);
    let mut stream = PageStream::open(&options.input, options.offset)?;

    info!(
        input = %input,
        language = %language,
        offset = options.offset,
        skip_through,
        first_batch,
        threads = pool.current_num_threads(),
        "Starting extraction"
    );

    let pb = make_spinner();
    let mut read: u64 = 0;
    let mut resumed_skips: u64 = 0;
    let mut dropped_reported = 0;
    let mut window = Vec::with_capacity(EXTRACT_WINDOW);

    loop {
        window.clear();
        while window.len() < EXTRACT_WINDOW {
            if options.limit.is_some_and(|limit| read >= limit) {
                break;
            }
            match stream.next() {
                Some(span) => {
                    window.push(span?);
                    read += 1;
                }
                None => break,
            }
        }
        if window.is_empty() {
            break;
        }

        let outcomes: Vec<Result<PageOutcome, ExtractError>> =
            pool.install(|| window.par_iter().map(|span| extractor.extract(span)).collect());

        for outcome in outcomes {
            match outcome {
                Ok(outcome) if outcome.page_id() <= skip_through => {
                    resumed_skips += 1;
                }
                Ok(outcome) => {
                    record(&outcome, &stats);
                    if let Some(writer) = writer.as_mut() {
                        writer.push(outcome, &stats)?;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Dropping malformed page");
                    stats.inc_pages();
                    stats.inc_malformed();
                }
            }
            if stats.pages() % PROGRESS_INTERVAL == 0 {
                pb.set_message(format!(
                    "{} pages, {} articles, {} redirects",
                    stats.pages(),
                    stats.articles(),
                    stats.redirects()
                ));
            }
        }

        let dropped = stream.dropped();
        if dropped > dropped_reported {
            stats.add_oversized(dropped - dropped_reported);
            dropped_reported = dropped;
        }
    }

    if let Some(writer) = writer {
        writer.finish(&stats)?;
    }
    pb.finish_and_clear();

    if resumed_skips > 0 {
        debug!(resumed_skips, "Pages already covered by the checkpoint were skipped");
    }
    info!(
        pages = stats.pages(),
        articles = stats.articles(),
        redirects = stats.redirects(),
        skipped = stats.skipped(),
        malformed = stats.malformed(),
        oversized = stats.oversized(),
        batches = stats.batches(),
        "Extraction finished"
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanguageConfig;

    fn extractor(code: &str) -> PageExtractor {
        let rules = LanguageConfig::builtin(code).unwrap().compile().unwrap();
        PageExtractor::new(Arc::new(rules))
    }

    fn page_xml(id: u64, ns: i32, title: &str, text: &str) -> Vec<u8> {
        format!(
            "<page xmlns=\"http://www.mediawiki.org/xml/export-0.11/\"><title>{title}</title><ns>{ns}</ns><id>{id}</id>\
             <revision><id>{rev}</id><timestamp>2024-01-01T00:00:00Z</timestamp>\
             <contributor><username>X</username><id>999</id></contributor>\
             <text bytes=\"1\" xml:space=\"preserve\">{text}</text></revision></page>",
            rev = id * 100
        )
        .into_bytes()
    }

    #[test]
    fn parses_minimal_fields() {
        let page = parse_page(&page_xml(10, 0, "Apple", "Red fruit")).unwrap();
        assert_eq!(page.id, 10);
        assert_eq!(page.namespace, 0);
        assert_eq!(page.title, "Apple");
        assert_eq!(page.revision_id, Some(1000));
        assert_eq!(page.timestamp.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(page.text.as_deref(), Some("Red fruit"));
    }

    #[test]
    fn entities_are_unescaped() {
        let page = parse_page(&page_xml(1, 0, "AT&amp;T", "a &lt;b&gt; [[X]]")).unwrap();
        assert_eq!(page.title, "AT&T");
        assert_eq!(page.text.as_deref(), Some("a <b> [[X]]"));
    }

    #[test]
    fn non_article_namespace_is_skipped() {
        let out = extractor("en").extract(&page_xml(5, 14, "Category:Fruit", "x")).unwrap();
        assert_eq!(out, PageOutcome::Skipped { page_id: 5 });
    }

    #[test]
    fn redirect_is_not_an_article() {
        let out = extractor("en")
            .extract(&page_xml(7, 0, "UK", "#REDIRECT [[United_Kingdom]]"))
            .unwrap();
        match out {
            PageOutcome::Redirect { page_id, redirect } => {
                assert_eq!(page_id, 7);
                assert_eq!(redirect.alias_title, "UK");
                assert_eq!(redirect.target_title, "United Kingdom");
                assert_eq!(redirect.language, "en");
            }
            other => panic!("expected redirect, got {:?}", other),
        }
    }

    #[test]
    fn redirect_falls_back_to_redirect_element() {
        let xml = b"<page><title>UK</title><ns>0</ns><id>7</id><redirect title=\"United Kingdom\" />\
            <revision><id>1</id><text>#REDIRECT</text></revision></page>";
        let out = extractor("en").extract(xml).unwrap();
        assert!(matches!(
            out,
            PageOutcome::Redirect { ref redirect, .. } if redirect.target_title == "United Kingdom"
        ));
    }

    #[test]
    fn redirect_without_target_is_an_error() {
        let err = extractor("en").extract(&page_xml(7, 0, "UK", "#REDIRECT nowhere")).unwrap_err();
        assert!(matches!(err, ExtractError::RedirectWithoutTarget(_)));
    }

    #[test]
    fn article_fields_and_links() {
        let text = "{{Infobox fruit|color=red}}'''Apple''' is a [[fruit]] like [[Banana|bananas]] and [[Fruit]]. \
                    [[Banana]] again. [[de:Apfel]] [[Category:Fruits]]";
        let out = extractor("en").extract(&page_xml(10, 0, "Apple", text)).unwrap();
        let PageOutcome::Article { article, links } = out else {
            panic!("expected article");
        };
        assert_eq!(article.id, 10);
        assert_eq!(article.language, "en");
        assert_eq!(article.infobox_type.as_deref(), Some("fruit"));
        assert!(article.categories.contains("Fruits"));
        assert_eq!(article.text_length, text.chars().count() as u64);
        assert!(article.word_count > 0);

        let targets: Vec<_> = links.iter().map(|l| l.target_title.as_str()).collect();
        assert_eq!(targets, vec!["fruit", "Banana", "Fruit"]);
        assert!(links.iter().all(|l| l.source_title == "Apple" && l.language == "en"));
    }

    #[test]
    fn empty_text_is_skipped() {
        let xml = b"<page><title>Blank</title><ns>0</ns><id>3</id><revision><id>1</id><text /></revision></page>";
        assert_eq!(extractor("en").extract(xml).unwrap(), PageOutcome::Skipped { page_id: 3 });
    }

    #[test]
    fn missing_id_is_an_error() {
        let xml = b"<page><title>X</title><ns>0</ns><revision><text>hi</text></revision></page>";
        let err = extractor("en").extract(xml).unwrap_err();
        assert!(matches!(err, ExtractError::MissingField("id")));
    }

    #[test]
    fn bad_namespace_number_is_an_error() {
        let xml = b"<page><title>X</title><ns>zero</ns><id>1</id></page>";
        let err = extractor("en").extract(xml).unwrap_err();
        assert!(matches!(err, ExtractError::BadNumber { field: "ns", .. }));
    }

    #[test]
    fn broken_xml_is_an_error() {
        let xml = b"<page><title>X</ns></page>";
        assert!(extractor("en").extract(xml).is_err());
    }
}
