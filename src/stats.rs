use crate::checkpoint::CheckpointCounters;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters collected during extraction. Only the orchestrator mutates them;
/// atomics keep them shareable with the progress reporter.
#[derive(Default)]
pub struct ExtractionStats {
    pub pages_seen: AtomicU64,
    pub articles_written: AtomicU64,
    pub redirects_written: AtomicU64,
    pub pages_skipped: AtomicU64,
    pub pages_malformed: AtomicU64,
    pub pages_oversized: AtomicU64,
    pub links_extracted: AtomicU64,
    pub categories_found: AtomicU64,
    pub infoboxes_found: AtomicU64,
    pub batches_flushed: AtomicU64,
}

impl ExtractionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_pages(&self) {
        self.pages_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_articles(&self) {
        self.articles_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_redirects(&self) {
        self.redirects_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped(&self) {
        self.pages_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_malformed(&self) {
        self.pages_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_oversized(&self, count: u64) {
        self.pages_oversized.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_links(&self, count: u64) {
        self.links_extracted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_categories(&self, count: u64) {
        self.categories_found.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_infoboxes(&self) {
        self.infoboxes_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_batches(&self) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pages(&self) -> u64 {
        self.pages_seen.load(Ordering::Relaxed)
    }

    pub fn articles(&self) -> u64 {
        self.articles_written.load(Ordering::Relaxed)
    }

    pub fn redirects(&self) -> u64 {
        self.redirects_written.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.pages_skipped.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.pages_malformed.load(Ordering::Relaxed)
    }

    pub fn oversized(&self) -> u64 {
        self.pages_oversized.load(Ordering::Relaxed)
    }

    pub fn links(&self) -> u64 {
        self.links_extracted.load(Ordering::Relaxed)
    }

    pub fn categories(&self) -> u64 {
        self.categories_found.load(Ordering::Relaxed)
    }

    pub fn infoboxes(&self) -> u64 {
        self.infoboxes_found.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.batches_flushed.load(Ordering::Relaxed)
    }

    /// Create stats initialized from a checkpoint
    pub fn from_checkpoint(cp: &CheckpointCounters) -> Self {
        Self {
            pages_seen: AtomicU64::new(cp.pages_seen),
            articles_written: AtomicU64::new(cp.articles_written),
            redirects_written: AtomicU64::new(cp.redirects_written),
            pages_skipped: AtomicU64::new(cp.pages_skipped),
            pages_malformed: AtomicU64::new(cp.pages_malformed),
            pages_oversized: AtomicU64::new(cp.pages_oversized),
            links_extracted: AtomicU64::new(cp.links_extracted),
            categories_found: AtomicU64::new(cp.categories_found),
            infoboxes_found: AtomicU64::new(cp.infoboxes_found),
            batches_flushed: AtomicU64::new(cp.batches_flushed),
        }
    }

    /// Convert to checkpoint counters for persistence
    pub fn to_checkpoint(&self) -> CheckpointCounters {
        CheckpointCounters {
            pages_seen: self.pages(),
            articles_written: self.articles(),
            redirects_written: self.redirects(),
            pages_skipped: self.skipped(),
            pages_malformed: self.malformed(),
            pages_oversized: self.oversized(),
            links_extracted: self.links(),
            categories_found: self.categories(),
            infoboxes_found: self.infoboxes(),
            batches_flushed: self.batches(),
        }
    }
}

/// Outcome counters for link resolution. Every dropped link lands in exactly one bucket.
#[derive(Default)]
pub struct ResolutionStats {
    pub resolved: AtomicU64,
    pub redlinks: AtomicU64,
    pub self_edges: AtomicU64,
    pub unknown_source: AtomicU64,
    pub via_redirect: AtomicU64,
}

impl ResolutionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_redlinks(&self) {
        self.redlinks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_self_edges(&self) {
        self.self_edges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unknown_source(&self) {
        self.unknown_source.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_via_redirect(&self) {
        self.via_redirect.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resolved(&self) -> u64 {
        self.resolved.load(Ordering::Relaxed)
    }

    pub fn redlinks(&self) -> u64 {
        self.redlinks.load(Ordering::Relaxed)
    }

    pub fn self_edges(&self) -> u64 {
        self.self_edges.load(Ordering::Relaxed)
    }

    pub fn unknown_source(&self) -> u64 {
        self.unknown_source.load(Ordering::Relaxed)
    }

    pub fn via_redirect(&self) -> u64 {
        self.via_redirect.load(Ordering::Relaxed)
    }

    /// Links examined, whatever their outcome.
    pub fn total(&self) -> u64 {
        self.resolved() + self.redlinks() + self.self_edges() + self.unknown_source()
    }
}

#[derive(Default)]
pub struct LoadStats {
    pub concepts_written: AtomicU64,
    pub articles_written: AtomicU64,
    pub edges_written: AtomicU64,
    pub batches_written: AtomicU64,
    pub retries: AtomicU64,
    pub edges_rejected: AtomicU64,
}

impl LoadStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_concepts(&self, count: u64) {
        self.concepts_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_articles(&self, count: u64) {
        self.articles_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_edges(&self, count: u64) {
        self.edges_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_batches(&self) {
        self.batches_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Edges the store refused because an endpoint concept was missing.
    pub fn add_rejected(&self, count: u64) {
        self.edges_rejected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn concepts(&self) -> u64 {
        self.concepts_written.load(Ordering::Relaxed)
    }

    pub fn articles(&self) -> u64 {
        self.articles_written.load(Ordering::Relaxed)
    }

    pub fn edges(&self) -> u64 {
        self.edges_written.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.batches_written.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.edges_rejected.load(Ordering::Relaxed)
    }
}
