//! Shard files between extraction and loading.
//!
//! Articles and raw links are buffered and flushed together as numbered,
//! bzip2-compressed shards (`articles_batch_0001.jsonl.bz2`,
//! `links_batch_0001.csv.bz2`). Redirects bypass batching and are appended
//! to `redirects.csv` as they arrive. Every flush is followed by a
//! checkpoint, so only fully flushed batches are ever considered durable.

use crate::checkpoint::{self, Checkpoint, CheckpointManager};
use crate::models::{Article, PageOutcome, RawLink, Redirect};
use crate::stats::ExtractionStats;
use crate::stream::open_decompressed;
use anyhow::{Context, Result};
use bzip2::write::BzEncoder;
use bzip2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const ARTICLES_PREFIX: &str = "articles_batch_";
pub const ARTICLES_SUFFIX: &str = ".jsonl.bz2";
pub const LINKS_PREFIX: &str = "links_batch_";
pub const LINKS_SUFFIX: &str = ".csv.bz2";
pub const REDIRECTS_FILE: &str = "redirects.csv";

pub fn articles_shard_path(dir: &Path, batch: u32) -> PathBuf {
    dir.join(format!("{}{:04}{}", ARTICLES_PREFIX, batch, ARTICLES_SUFFIX))
}

pub fn links_shard_path(dir: &Path, batch: u32) -> PathBuf {
    dir.join(format!("{}{:04}{}", LINKS_PREFIX, batch, LINKS_SUFFIX))
}

pub fn redirects_path(dir: &Path) -> PathBuf {
    dir.join(REDIRECTS_FILE)
}

#[derive(Serialize)]
struct LinkRow<'a> {
    source: &'a str,
    target: &'a str,
    lang: &'a str,
}

#[derive(Deserialize)]
struct OwnedRow {
    source: String,
    target: String,
    lang: String,
}

#[derive(Serialize)]
struct RedirectRow<'a> {
    alias: &'a str,
    target: &'a str,
    lang: &'a str,
}

#[derive(Deserialize)]
struct OwnedRedirectRow {
    alias: String,
    target: String,
    lang: String,
}

/// Owned exclusively by the orchestrating thread; there is never a second writer per file.
pub struct BatchWriter {
    output_dir: PathBuf,
    batch_size: usize,
    batch_number: u32,
    last_page_id: u64,
    articles: Vec<Article>,
    links: Vec<RawLink>,
    redirects: csv::Writer<BufWriter<File>>,
    checkpoints: CheckpointManager,
}

impl BatchWriter {
    /// Without a checkpoint numbering starts at 1 and the redirect file is truncated.
    /// On resume numbering continues after the checkpoint and the redirect file is cut
    /// back to the length the checkpoint recorded, dropping rows written after it.
    pub fn new(
        output_dir: &Path,
        batch_size: usize,
        resume: Option<&Checkpoint>,
        checkpoints: CheckpointManager,
    ) -> Result<Self> {
        fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;

        let path = redirects_path(output_dir);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(resume.is_some())
            .truncate(resume.is_none())
            .open(&path)
            .with_context(|| format!("Failed to open redirect file: {:?}", path))?;
        let mut len = file
            .metadata()
            .with_context(|| format!("Failed to stat redirect file: {:?}", path))?
            .len();
        if let Some(cp) = resume {
            if len > cp.redirects_len {
                file.set_len(cp.redirects_len)
                    .with_context(|| format!("Failed to truncate redirect file: {:?}", path))?;
                warn!(
                    dropped_bytes = len - cp.redirects_len,
                    "Discarded redirect rows written after the checkpoint"
                );
                len = cp.redirects_len;
            }
        }
        let mut redirects = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::with_capacity(128 * 1024, file));
        if len == 0 {
            redirects
                .write_record(["alias", "target", "lang"])
                .context("Failed to write redirect header")?;
        }

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            batch_size: batch_size.max(1),
            batch_number: resume.map(|cp| cp.batch_number + 1).unwrap_or(1),
            last_page_id: 0,
            articles: Vec::with_capacity(batch_size.min(100_000)),
            links: Vec::new(),
            redirects,
            checkpoints,
        })
    }

    /// Accepts one extraction outcome; returns the batch number if this push flushed a batch.
    pub fn push(&mut self, outcome: PageOutcome, stats: &ExtractionStats) -> Result<Option<u32>> {
        self.last_page_id = outcome.page_id();
        match outcome {
            PageOutcome::Skipped { .. } => Ok(None),
            PageOutcome::Redirect { redirect, .. } => {
                self.write_redirect(&redirect)?;
                Ok(None)
            }
            PageOutcome::Article { article, links } => {
                self.articles.push(article);
                self.links.extend(links);
                if self.articles.len() >= self.batch_size {
                    self.flush(stats)
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn write_redirect(&mut self, redirect: &Redirect) -> Result<()> {
        self.redirects
            .serialize(RedirectRow {
                alias: &redirect.alias_title,
                target: &redirect.target_title,
                lang: &redirect.language,
            })
            .context("Failed to write redirect")
    }

    /// Writes the buffered batch, then the checkpoint. Nothing happens for an empty buffer.
    pub fn flush(&mut self, stats: &ExtractionStats) -> Result<Option<u32>> {
        if self.articles.is_empty() && self.links.is_empty() {
            self.redirects.flush().context("Failed to flush redirect file")?;
            return Ok(None);
        }

        let batch = self.batch_number;
        write_articles(&articles_shard_path(&self.output_dir, batch), &self.articles)?;
        write_links(&links_shard_path(&self.output_dir, batch), &self.links)?;
        self.redirects.flush().context("Failed to flush redirect file")?;
        let redirects_len = self
            .redirects
            .get_ref()
            .get_ref()
            .metadata()
            .context("Failed to stat redirect file")?
            .len();

        stats.inc_batches();
        self.checkpoints.save(self.last_page_id, batch, redirects_len, stats)?;

        info!(
            batch,
            articles = self.articles.len(),
            links = self.links.len(),
            last_page_id = self.last_page_id,
            "Batch flushed"
        );

        self.articles.clear();
        self.links.clear();
        self.batch_number += 1;
        Ok(Some(batch))
    }

    /// Flushes whatever is left. Call once after the stream is exhausted.
    pub fn finish(mut self, stats: &ExtractionStats) -> Result<Option<u32>> {
        self.flush(stats)
    }
}

fn bz2_writer(tmp: &Path) -> Result<BzEncoder<BufWriter<File>>> {
    let file =
        File::create(tmp).with_context(|| format!("Failed to create shard: {:?}", tmp))?;
    Ok(BzEncoder::new(
        BufWriter::with_capacity(128 * 1024, file),
        Compression::default(),
    ))
}

fn commit(encoder: BzEncoder<BufWriter<File>>, tmp: &Path, path: &Path) -> Result<()> {
    let mut inner = encoder
        .finish()
        .with_context(|| format!("Failed to finish compression: {:?}", tmp))?;
    inner.flush().context("Failed to flush shard")?;
    drop(inner);
    fs::rename(tmp, path).with_context(|| format!("Failed to rename shard to: {:?}", path))
}

fn write_articles(path: &Path, articles: &[Article]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut encoder = bz2_writer(&tmp)?;
    for article in articles {
        serde_json::to_writer(&mut encoder, article).context("Failed to serialize article")?;
        encoder.write_all(b"\n").context("Failed to write article")?;
    }
    commit(encoder, &tmp, path)
}

fn write_links(path: &Path, links: &[RawLink]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let encoder = bz2_writer(&tmp)?;
    let mut writer = csv::Writer::from_writer(encoder);
    for link in links {
        writer
            .serialize(LinkRow {
                source: &link.source_title,
                target: &link.target_title,
                lang: &link.language,
            })
            .context("Failed to write link")?;
    }
    let encoder = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush link shard: {}", e.error()))?;
    commit(encoder, &tmp, path)
}

/// Shard files of one kind in batch order.
pub fn list_shards(dir: &Path, prefix: &str, suffix: &str) -> Result<Vec<PathBuf>> {
    let mut shards: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read data directory: {:?}", dir))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(prefix) && n.ends_with(suffix))
                .unwrap_or(false)
        })
        .collect();
    shards.sort();
    Ok(shards)
}

pub fn article_shards(dir: &Path) -> Result<Vec<PathBuf>> {
    list_shards(dir, ARTICLES_PREFIX, ARTICLES_SUFFIX)
}

pub fn link_shards(dir: &Path) -> Result<Vec<PathBuf>> {
    list_shards(dir, LINKS_PREFIX, LINKS_SUFFIX)
}

/// Records read from one file plus the number of malformed lines skipped.
#[derive(Debug)]
pub struct ShardRead<T> {
    pub records: Vec<T>,
    pub malformed: u64,
}

pub fn read_articles(path: &Path) -> Result<ShardRead<Article>> {
    let reader = open_decompressed(path)?;
    let mut records = Vec::new();
    let mut malformed = 0;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read shard: {:?}", path))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Article>(&line) {
            Ok(article) => records.push(article),
            Err(e) => {
                warn!(
                    path = ?path,
                    line = line_no + 1,
                    error = %e,
                    "Skipping malformed article line"
                );
                malformed += 1;
            }
        }
    }
    debug!(path = ?path, articles = records.len(), "Article shard read");
    Ok(ShardRead { records, malformed })
}

fn read_rows<T, R>(path: &Path, mut convert: impl FnMut(R) -> T) -> Result<ShardRead<T>>
where
    R: for<'de> Deserialize<'de>,
{
    let reader = open_decompressed(path)?;
    let mut rows = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let mut records = Vec::new();
    let mut malformed = 0;
    for row in rows.deserialize::<R>() {
        match row {
            Ok(row) => records.push(convert(row)),
            Err(e) => {
                warn!(path = ?path, error = %e, "Skipping malformed row");
                malformed += 1;
            }
        }
    }
    Ok(ShardRead { records, malformed })
}

pub fn read_links(path: &Path) -> Result<ShardRead<RawLink>> {
    read_rows(path, |row: OwnedRow| RawLink {
        source_title: row.source,
        target_title: row.target,
        language: row.lang,
    })
}

/// Reads the redirect file; a missing file means no redirects.
pub fn read_redirects(dir: &Path) -> Result<ShardRead<Redirect>> {
    let path = redirects_path(dir);
    if !path.exists() {
        warn!(path = ?path, "No redirect file, chains will not be followed");
        return Ok(ShardRead { records: Vec::new(), malformed: 0 });
    }
    read_rows(&path, |row: OwnedRedirectRow| Redirect {
        alias_title: row.alias,
        target_title: row.target,
        language: row.lang,
    })
}

/// Deletes shards, the redirect file and the checkpoint. Returns the number of files removed.
pub fn remove_outputs(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for path in article_shards(dir)?.into_iter().chain(link_shards(dir)?) {
        fs::remove_file(&path).with_context(|| format!("Failed to remove: {:?}", path))?;
        removed += 1;
    }
    let redirects = redirects_path(dir);
    if redirects.exists() {
        fs::remove_file(&redirects)
            .with_context(|| format!("Failed to remove: {:?}", redirects))?;
        removed += 1;
    }
    checkpoint::clear(dir)?;
    if removed > 0 {
        info!(removed, dir = ?dir, "Removed previous outputs");
    }
    Ok(removed)
}
