//! Bulk loading of a [`PlanSource`] into a [`GraphStore`].
//!
//! Each phase is paged out of the plan in fixed-size batches and fed through
//! a bounded channel to a pool of tokio workers, each holding its own store
//! connection. Phases run strictly one after another: concepts, then
//! articles, then edges.

use crate::backoff::Backoff;
use crate::config::{
    LOADER_BACKOFF_BASE_MS, LOADER_BACKOFF_MAX_MS, LOADER_BATCH_SIZE, LOADER_MAX_RETRIES,
    LOADER_WORKERS, STORE_OP_TIMEOUT_SECS,
};
use crate::models::ConceptEdge;
use crate::plan::PlanSource;
use crate::stats::LoadStats;
use crate::store::{ArticleNode, ConceptNode, GraphStore, StoreConnector, StoreCounts, StoreError};
use anyhow::{Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub workers: usize,
    pub batch_size: usize,
    /// Retries per batch after the first attempt
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub op_timeout: Duration,
    pub show_progress: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            workers: LOADER_WORKERS,
            batch_size: LOADER_BATCH_SIZE,
            max_retries: LOADER_MAX_RETRIES,
            backoff_base_ms: LOADER_BACKOFF_BASE_MS,
            backoff_max_ms: LOADER_BACKOFF_MAX_MS,
            op_timeout: Duration::from_secs(STORE_OP_TIMEOUT_SECS),
            show_progress: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Concepts,
    Articles,
    Edges,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Concepts => "concepts",
            Phase::Articles => "articles",
            Phase::Edges => "edges",
        })
    }
}

#[derive(Debug, Clone)]
enum Batch {
    Concepts(Vec<ConceptNode>),
    Articles(Vec<ArticleNode>),
    Edges(Vec<ConceptEdge>),
}

impl Batch {
    fn len(&self) -> usize {
        match self {
            Batch::Concepts(b) => b.len(),
            Batch::Articles(b) => b.len(),
            Batch::Edges(b) => b.len(),
        }
    }
}

/// Pages the next batch of `phase` out of the plan; `None` once the phase is drained.
fn next_batch(
    plan: &dyn PlanSource,
    phase: Phase,
    cursor: &mut u64,
    size: usize,
) -> Result<Option<Batch>> {
    let batch = match phase {
        Phase::Concepts => Batch::Concepts(plan.concepts_page(cursor, size)?),
        Phase::Articles => Batch::Articles(plan.articles_page(cursor, size)?),
        Phase::Edges => Batch::Edges(plan.edges_page(cursor, size)?),
    };
    Ok((batch.len() > 0).then_some(batch))
}

async fn apply<S: GraphStore>(store: &mut S, batch: &Batch) -> Result<u64, StoreError> {
    match batch {
        Batch::Concepts(b) => store.upsert_concepts(b).await,
        Batch::Articles(b) => store.upsert_articles(b).await,
        Batch::Edges(b) => store.upsert_edges(b).await,
    }
}

/// Applies one batch under the per-operation timeout, retrying transient
/// failures with backoff until the retry ceiling is hit.
async fn apply_with_retry<S: GraphStore>(
    store: &mut S,
    batch: &Batch,
    config: &LoaderConfig,
    stats: &LoadStats,
) -> Result<u64, StoreError> {
    let mut backoff = Backoff::new(config.backoff_base_ms, config.backoff_max_ms);
    loop {
        let outcome = match tokio::time::timeout(config.op_timeout, apply(store, batch)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(config.op_timeout)),
        };
        match outcome {
            Ok(applied) => return Ok(applied),
            Err(e) if e.is_retryable() && backoff.attempts() < config.max_retries => {
                let delay = backoff.next_delay();
                stats.inc_retries();
                warn!(
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Store write failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn record(stats: &LoadStats, batch: &Batch, applied: u64) {
    match batch {
        Batch::Concepts(_) => stats.add_concepts(applied),
        Batch::Articles(_) => stats.add_articles(applied),
        Batch::Edges(b) => {
            stats.add_edges(applied);
            stats.add_rejected((b.len() as u64).saturating_sub(applied));
        }
    }
    stats.inc_batches();
}

fn make_progress_bar(mp: &MultiProgress, total: u64, phase: Phase, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = mp.add(ProgressBar::new(total));
    if let Ok(style) = ProgressStyle::with_template(&format!(
        "    {{spinner:.cyan}} {:<10} [{{bar:30.cyan/blue}}] {{pos}}/{{len}} batches",
        phase.to_string()
    )) {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

pub struct BulkLoader<C: StoreConnector> {
    connector: Arc<C>,
    config: LoaderConfig,
}

impl<C: StoreConnector + 'static> BulkLoader<C> {
    pub fn new(connector: C, config: LoaderConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            config,
        }
    }

    /// Loads the whole plan and returns the store's final counts. The first
    /// batch that still fails after its retries stops the run.
    pub async fn load(&self, plan: &dyn PlanSource, stats: Arc<LoadStats>) -> Result<StoreCounts> {
        let mut admin = self
            .connector
            .connect()
            .await
            .context("Failed to open store connection")?;
        admin
            .ensure_schema()
            .await
            .context("Failed to create store constraints")?;

        let size = self.config.batch_size.max(1);
        let sizes = plan.sizes();
        let mp = MultiProgress::new();
        let phases = [
            (Phase::Concepts, sizes.concepts),
            (Phase::Articles, sizes.articles),
            (Phase::Edges, sizes.edges),
        ];
        for (phase, records) in phases {
            let batches = records.div_ceil(size as u64);
            let pb = make_progress_bar(&mp, batches, phase, self.config.show_progress);
            self.run_phase(phase, plan, batches, &stats, &pb).await?;
            pb.finish_with_message(format!("{phase} done"));
        }

        let counts = admin.counts().await.context("Failed to query store counts")?;
        info!(
            concepts = counts.concepts,
            articles = counts.articles,
            edges = counts.edges,
            retries = stats.retries(),
            "Load complete"
        );
        Ok(counts)
    }

    /// Pages `phase` out of the plan on the calling task while workers drain
    /// the channel. Only `2 * workers` batches are in flight at once.
    async fn run_phase(
        &self,
        phase: Phase,
        plan: &dyn PlanSource,
        batches: u64,
        stats: &Arc<LoadStats>,
        pb: &ProgressBar,
    ) -> Result<()> {
        if batches == 0 {
            debug!(%phase, "Nothing to load");
            return Ok(());
        }
        let workers = self.config.workers.max(1).min(batches as usize);
        info!(%phase, batches, workers, "Loading phase");

        let (tx, rx) = mpsc::channel::<(usize, Batch)>(workers * 2);
        let rx = Arc::new(Mutex::new(rx));
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut in_flight = FuturesUnordered::new();
        for worker in 0..workers {
            let connector = Arc::clone(&self.connector);
            let rx = Arc::clone(&rx);
            let cancelled = Arc::clone(&cancelled);
            let stats = Arc::clone(stats);
            let config = self.config.clone();
            let pb = pb.clone();
            in_flight.push(tokio::spawn(async move {
                let mut store = match connector.connect().await {
                    Ok(store) => store,
                    Err(e) => {
                        cancelled.store(true, Ordering::SeqCst);
                        return Err((None, e));
                    }
                };
                loop {
                    if cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    let next = rx.lock().await.recv().await;
                    let Some((index, batch)) = next else {
                        break;
                    };
                    match apply_with_retry(&mut store, &batch, &config, &stats).await {
                        Ok(applied) => {
                            record(&stats, &batch, applied);
                            pb.inc(1);
                            debug!(
                                worker,
                                batch = index,
                                records = batch.len(),
                                applied,
                                "Batch written"
                            );
                        }
                        Err(e) => {
                            cancelled.store(true, Ordering::SeqCst);
                            return Err((Some(index), e));
                        }
                    }
                }
                Ok::<(), (Option<usize>, StoreError)>(())
            }));
        }
        // workers hold the only receivers, so a send fails once they have all stopped
        drop(rx);

        let mut source_error = None;
        let mut cursor = 0;
        let mut index = 0;
        while !cancelled.load(Ordering::SeqCst) {
            let batch = match next_batch(plan, phase, &mut cursor, self.config.batch_size) {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    cancelled.store(true, Ordering::SeqCst);
                    source_error = Some(e);
                    break;
                }
            };
            if tx.send((index, batch)).await.is_err() {
                break;
            }
            index += 1;
        }
        drop(tx);

        let mut first_error = None;
        while let Some(joined) = in_flight.next().await {
            match joined.context("Loader task panicked")? {
                Ok(()) => {}
                Err((index, e)) => {
                    error!(%phase, batch = ?index, error = %e, "Batch failed permanently");
                    if first_error.is_none() {
                        first_error = Some((index, e));
                    }
                }
            }
        }

        if let Some(e) = source_error {
            return Err(e.context(format!("Failed to read {phase} from the plan")));
        }
        match first_error {
            None => Ok(()),
            Some((Some(index), e)) => {
                Err(anyhow::Error::new(e).context(format!("Failed to load {phase} batch {index}")))
            }
            Some((None, e)) => Err(anyhow::Error::new(e)
                .context(format!("Loader worker for {phase} could not connect"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Article, ConceptId};
    use crate::plan::{LoadPlan, PlanReport};
    use crate::store::{InMemoryStore, OpKind};
    use std::collections::BTreeSet;

    fn fast_config() -> LoaderConfig {
        LoaderConfig {
            workers: 3,
            batch_size: 2,
            max_retries: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 4,
            op_timeout: Duration::from_secs(5),
            show_progress: false,
        }
    }

    fn plan(concepts: usize) -> LoadPlan {
        let mut plan = LoadPlan::default();
        for i in 0..concepts {
            let id = ConceptId::external(format!("Q{}", i));
            plan.concepts.push(ConceptNode { id: id.clone() });
            let article = Article {
                id: i as u64,
                language: "en".into(),
                title: format!("Title {}", i),
                revision_id: None,
                timestamp: None,
                word_count: 1,
                text_length: 1,
                categories: BTreeSet::new(),
                infobox_type: None,
            };
            plan.articles.push(ArticleNode::from_article(article, id));
        }
        for i in 1..concepts {
            plan.edges.push(ConceptEdge {
                source: ConceptId::external("Q0"),
                target: ConceptId::external(format!("Q{}", i)),
            });
        }
        plan
    }

    #[tokio::test]
    async fn phases_run_in_order() {
        let store = InMemoryStore::new();
        let loader = BulkLoader::new(store.clone(), fast_config());
        let stats = Arc::new(LoadStats::new());
        let counts = loader.load(&plan(9), Arc::clone(&stats)).await.unwrap();

        assert_eq!(counts, StoreCounts { concepts: 9, articles: 9, edges: 8 });
        assert_eq!(stats.batches(), 5 + 5 + 4);

        let log: Vec<OpKind> = store
            .op_log()
            .into_iter()
            .filter(|k| *k != OpKind::Schema)
            .collect();
        let last_concept = log.iter().rposition(|k| *k == OpKind::Concepts).unwrap();
        let first_article = log.iter().position(|k| *k == OpKind::Articles).unwrap();
        let last_article = log.iter().rposition(|k| *k == OpKind::Articles).unwrap();
        let first_edge = log.iter().position(|k| *k == OpKind::Edges).unwrap();
        assert!(last_concept < first_article);
        assert!(last_article < first_edge);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = InMemoryStore::new();
        let mut config = fast_config();
        config.workers = 1;
        let loader = BulkLoader::new(store.clone(), config);
        let stats = Arc::new(LoadStats::new());
        store.fail_next(2);

        let counts = loader.load(&plan(4), Arc::clone(&stats)).await.unwrap();
        assert_eq!(counts.concepts, 4);
        assert_eq!(stats.retries(), 2);
    }

    #[tokio::test]
    async fn batch_write_recovers_after_retries() {
        let store = InMemoryStore::new();
        let stats = LoadStats::new();
        let mut conn = store.clone();
        store.fail_next(2);
        let batch = Batch::Concepts(vec![ConceptNode {
            id: ConceptId::external("Q1"),
        }]);
        let applied = apply_with_retry(&mut conn, &batch, &fast_config(), &stats).await.unwrap();
        assert_eq!(applied, 1);
        assert_eq!(stats.retries(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_are_fatal() {
        let store = InMemoryStore::new();
        let stats = LoadStats::new();
        let mut conn = store.clone();
        store.fail_next(100);
        let batch = Batch::Concepts(vec![ConceptNode {
            id: ConceptId::external("Q1"),
        }]);
        let err = apply_with_retry(&mut conn, &batch, &fast_config(), &stats).await.unwrap_err();
        assert!(matches!(err, StoreError::Transient(_)));
        assert_eq!(stats.retries(), 3);
    }

    #[tokio::test]
    async fn slow_store_times_out() {
        let store = InMemoryStore::new().with_delay(Duration::from_millis(200));
        let stats = LoadStats::new();
        let mut conn = store.clone();
        let mut config = fast_config();
        config.op_timeout = Duration::from_millis(10);
        config.max_retries = 1;
        let batch = Batch::Edges(Vec::new());
        let err = apply_with_retry(&mut conn, &batch, &config, &stats).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
        assert_eq!(stats.retries(), 1);
    }

    #[tokio::test]
    async fn integrity_error_stops_the_run() {
        let store = InMemoryStore::new();
        let loader = BulkLoader::new(store.clone(), fast_config());
        let mut broken = plan(3);
        broken.concepts.remove(2);
        let err = loader
            .load(&broken, Arc::new(LoadStats::new()))
            .await
            .unwrap_err();
        let cause = err.downcast_ref::<StoreError>().unwrap();
        assert!(matches!(cause, StoreError::Integrity(_)));
        assert!(store.edges().is_empty());
    }

    #[tokio::test]
    async fn rejected_edges_are_counted() {
        let store = InMemoryStore::new();
        let loader = BulkLoader::new(store.clone(), fast_config());
        let mut p = plan(2);
        p.edges.push(ConceptEdge {
            source: ConceptId::external("Q0"),
            target: ConceptId::external("Q99"),
        });
        let stats = Arc::new(LoadStats::new());
        loader.load(&p, Arc::clone(&stats)).await.unwrap();
        assert_eq!(stats.edges(), 1);
        assert_eq!(stats.rejected(), 1);
    }

    #[tokio::test]
    async fn reloading_is_idempotent() {
        let store = InMemoryStore::new();
        let loader = BulkLoader::new(store.clone(), fast_config());
        let p = plan(5);
        let first = loader.load(&p, Arc::new(LoadStats::new())).await.unwrap();
        let second = loader.load(&p, Arc::new(LoadStats::new())).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn one_worker_drains_more_batches_than_the_channel_holds() {
        let store = InMemoryStore::new();
        let mut config = fast_config();
        config.workers = 1;
        let loader = BulkLoader::new(store.clone(), config);
        let stats = Arc::new(LoadStats::new());
        let counts = loader.load(&plan(20), Arc::clone(&stats)).await.unwrap();
        assert_eq!(counts, StoreCounts { concepts: 20, articles: 20, edges: 19 });
        assert_eq!(stats.batches(), 10 + 10 + 10);
    }

    /// Serves concepts and articles, then fails on the first edge page.
    struct UnreadableEdges(LoadPlan);

    impl PlanSource for UnreadableEdges {
        fn report(&self) -> PlanReport {
            self.0.report
        }

        fn sizes(&self) -> StoreCounts {
            self.0.sizes()
        }

        fn concepts_page(&self, cursor: &mut u64, limit: usize) -> Result<Vec<ConceptNode>> {
            self.0.concepts_page(cursor, limit)
        }

        fn articles_page(&self, cursor: &mut u64, limit: usize) -> Result<Vec<ArticleNode>> {
            self.0.articles_page(cursor, limit)
        }

        fn edges_page(&self, _cursor: &mut u64, _limit: usize) -> Result<Vec<ConceptEdge>> {
            anyhow::bail!("edge table unreadable")
        }
    }

    #[tokio::test]
    async fn plan_read_error_stops_the_run() {
        let store = InMemoryStore::new();
        let loader = BulkLoader::new(store.clone(), fast_config());
        let err = loader
            .load(&UnreadableEdges(plan(3)), Arc::new(LoadStats::new()))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("edge table unreadable"));
        assert_eq!(
            store.snapshot_counts(),
            StoreCounts { concepts: 3, articles: 3, edges: 0 }
        );
    }
}
