use crate::config::CHECKPOINT_VERSION;
use crate::stats::ExtractionStats;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CheckpointCounters {
    pub pages_seen: u64,
    pub articles_written: u64,
    pub redirects_written: u64,
    pub pages_skipped: u64,
    pub pages_malformed: u64,
    pub pages_oversized: u64,
    pub links_extracted: u64,
    pub categories_found: u64,
    pub infoboxes_found: u64,
    pub batches_flushed: u64,
}

/// Resumption point written after every batch flush.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Checkpoint {
    pub version: u32,
    pub input_path: String,
    pub language: String,
    pub last_page_id: u64,
    pub batch_number: u32,
    /// Byte length of `redirects.csv` when this checkpoint was written.
    pub redirects_len: u64,
    pub counters: CheckpointCounters,
    pub timestamp: DateTime<Utc>,
}

pub fn checkpoint_path(output_dir: &Path) -> PathBuf {
    output_dir.join("checkpoint.json")
}

/// Returns the checkpoint if one exists and was written for the same input and language.
pub fn load_if_valid(
    input_path: &str,
    language: &str,
    output_dir: &Path,
) -> Result<Option<Checkpoint>> {
    let path = checkpoint_path(output_dir);

    if !path.exists() {
        return Ok(None);
    }

    let file = File::open(&path).context("Failed to open checkpoint file")?;
    let reader = BufReader::new(file);

    let checkpoint: Checkpoint = match serde_json::from_reader(reader) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Checkpoint file is corrupt or unreadable");
            return Ok(None);
        }
    };

    if checkpoint.version != CHECKPOINT_VERSION {
        info!(
            cached = checkpoint.version,
            current = CHECKPOINT_VERSION,
            "Checkpoint version mismatch"
        );
        return Ok(None);
    }

    if checkpoint.input_path != input_path {
        info!(
            cached = checkpoint.input_path,
            current = input_path,
            "Checkpoint input path mismatch"
        );
        return Ok(None);
    }

    if checkpoint.language != language {
        info!(
            cached = checkpoint.language,
            current = language,
            "Checkpoint language mismatch"
        );
        return Ok(None);
    }

    info!(
        last_page_id = checkpoint.last_page_id,
        batch = checkpoint.batch_number,
        written_at = %checkpoint.timestamp,
        "Loaded valid checkpoint"
    );

    Ok(Some(checkpoint))
}

pub fn clear(output_dir: &Path) -> Result<()> {
    let path = checkpoint_path(output_dir);
    if path.exists() {
        fs::remove_file(&path)
            .with_context(|| format!("Failed to remove checkpoint file: {:?}", path))?;
        info!("Checkpoint cleared");
    }
    Ok(())
}

pub struct CheckpointManager {
    checkpoint_path: PathBuf,
    input_path: String,
    language: String,
}

impl CheckpointManager {
    pub fn new(input_path: &str, language: &str, output_dir: &Path) -> Self {
        Self {
            checkpoint_path: checkpoint_path(output_dir),
            input_path: input_path.to_string(),
            language: language.to_string(),
        }
    }

    /// Writes the checkpoint to a temp file and renames it into place.
    pub fn save(
        &self,
        last_page_id: u64,
        batch_number: u32,
        redirects_len: u64,
        stats: &ExtractionStats,
    ) -> Result<Checkpoint> {
        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            input_path: self.input_path.clone(),
            language: self.language.clone(),
            last_page_id,
            batch_number,
            redirects_len,
            counters: stats.to_checkpoint(),
            timestamp: Utc::now(),
        };

        if let Some(parent) = self.checkpoint_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let tmp_path = self.checkpoint_path.with_extension("json.tmp");
        let file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create temp checkpoint file: {:?}", tmp_path))?;
        let mut writer = BufWriter::new(file);

        serde_json::to_writer_pretty(&mut writer, &checkpoint)
            .context("Failed to serialize checkpoint")?;
        writer.flush().context("Failed to flush checkpoint")?;
        drop(writer);

        fs::rename(&tmp_path, &self.checkpoint_path).with_context(|| {
            format!(
                "Failed to rename temp checkpoint: {:?}",
                self.checkpoint_path
            )
        })?;

        debug!(
            last_page_id,
            batch = batch_number,
            articles = stats.articles(),
            "Checkpoint saved"
        );

        Ok(checkpoint)
    }
}
