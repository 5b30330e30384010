//! Wikigraph: multi-language Wikipedia dumps into a cross-lingual concept graph
//!
//! The pipeline has three stages:
//!
//! 1. **Extraction** -- Stream one language's compressed dump, split it into
//!    `<page>` records, extract articles, raw links and redirects on a rayon
//!    pool, and write numbered bz2 shards with a checkpoint after each batch
//! 2. **Resolution** -- Map every article to a concept (an external id from
//!    the `page_props` dump, or a synthetic `local:<lang>:<id>`), build the
//!    full title index, then resolve every raw link into a concept edge,
//!    following redirect chains
//! 3. **Loading** -- Write concepts, then articles, then edges to the target
//!    store through a pool of workers with per-batch retry and backoff, or
//!    export neo4j-admin CSVs instead
//!
//! # Key Modules
//!
//! - [`stream`] -- Incremental page boundary scanning over decompressed input
//! - [`extract`] -- Per-page extraction and the extraction run
//! - [`wikitext`] -- Redirect, category, infobox, word and link extraction
//! - [`batch`] -- Shard writing and reading
//! - [`checkpoint`] -- Resume point persistence
//! - [`identity`] -- Property dump parsing and page-to-concept mapping
//! - [`cache`] -- Concept map cache
//! - [`index`] -- Per-language title index and redirect table
//! - [`resolve`] -- In-memory and SQLite link resolution
//! - [`plan`] -- Two-pass assembly of what gets loaded
//! - [`staging`] -- Load plan kept in SQLite for the sqlite strategy
//! - [`store`] -- Store traits, error taxonomy and the in-memory store
//! - [`neo4j`] -- Neo4j store over Bolt
//! - [`loader`] -- Bulk loader worker pool
//! - [`export`] -- neo4j-admin CSV export
//! - [`stats`] -- Atomic counters for every stage
//! - [`config`] -- Constants and per-language settings
//!
//! # Example Usage
//!
//! ```bash
//! wikigraph extract --lang en -i enwiki-latest-pages-articles.xml.bz2 -o out/en
//! wikigraph extract --lang de -i dewiki-latest-pages-articles.xml.bz2 -o out/de
//!
//! wikigraph load --lang en -d out/en --props enwiki-page_props.sql.gz \
//!                --lang de -d out/de --props dewiki-page_props.sql.gz
//! ```

pub mod backoff;
pub mod batch;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod export;
pub mod extract;
pub mod identity;
pub mod index;
pub mod loader;
pub mod models;
pub mod neo4j;
pub mod plan;
pub mod resolve;
pub mod staging;
pub mod stats;
pub mod store;
pub mod stream;
pub mod wikitext;
