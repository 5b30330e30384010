use crate::config::CACHE_VERSION;
use crate::identity::ConceptMap;
use anyhow::{bail, Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

#[derive(Serialize, Deserialize)]
pub struct CacheMetadata {
    pub version: u32,
    pub input_path: String,
    pub input_mtime: u64,
    pub input_size: u64,
    pub concept_count: usize,
}

#[derive(Deserialize)]
struct ConceptCacheDe {
    metadata: CacheMetadata,
    concepts: ConceptMap,
}

/// Borrows the map so saving does not clone millions of ids.
#[derive(Serialize)]
struct ConceptCacheSer<'a> {
    metadata: CacheMetadata,
    concepts: &'a ConceptMap,
}

pub fn cache_path(dir: &Path, language: &str) -> PathBuf {
    dir.join(format!("concepts_{}.cache", language))
}

fn get_input_metadata(input_path: &str) -> Result<(u64, u64)> {
    let metadata = fs::metadata(input_path)
        .with_context(|| format!("Failed to get metadata for: {}", input_path))?;
    let mtime = metadata
        .modified()
        .context("Failed to get modification time")?
        .duration_since(SystemTime::UNIX_EPOCH)
        .context("Invalid modification time")?
        .as_secs();
    let size = metadata.len();
    Ok((mtime, size))
}

fn read_cache(cache_path: &Path) -> Result<ConceptCacheDe> {
    let file_size = fs::metadata(cache_path).map(|m| m.len()).unwrap_or(0);
    let file = File::open(cache_path)
        .with_context(|| format!("Failed to open cache file: {:?}", cache_path))?;
    let reader = BufReader::with_capacity(256 * 1024, file);
    let options = bincode::options().with_limit(file_size.saturating_add(1024));
    options
        .deserialize_from(reader)
        .context("Failed to deserialize concept cache")
}

/// Returns `Ok(Some(map))` if the cache is valid, `Ok(None)` if missing or stale.
pub fn try_load_concepts(cache_path: &Path, input_path: &str) -> Result<Option<ConceptMap>> {
    if !cache_path.exists() {
        return Ok(None);
    }

    let cache = match read_cache(cache_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Cache file is corrupt or unreadable");
            return Ok(None);
        }
    };

    if cache.metadata.version != CACHE_VERSION {
        info!(
            cached = cache.metadata.version,
            current = CACHE_VERSION,
            "Cache version mismatch"
        );
        return Ok(None);
    }

    if cache.metadata.input_path != input_path {
        info!(
            cached = cache.metadata.input_path,
            current = input_path,
            "Cache input path mismatch"
        );
        return Ok(None);
    }

    let (mtime, size) = get_input_metadata(input_path)?;
    if cache.metadata.input_mtime != mtime || cache.metadata.input_size != size {
        info!(
            cached_mtime = cache.metadata.input_mtime,
            current_mtime = mtime,
            cached_size = cache.metadata.input_size,
            current_size = size,
            "Property dump has changed since cache was created"
        );
        return Ok(None);
    }

    info!(
        concepts = cache.metadata.concept_count,
        "Concept map loaded from cache"
    );

    Ok(Some(cache.concepts))
}

/// Serializes the map by reference and writes atomically via rename.
pub fn save_concepts(map: &ConceptMap, input_path: &str, cache_path: &Path) -> Result<()> {
    if let Some(parent) = cache_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    let (mtime, size) = get_input_metadata(input_path)?;

    let cache = ConceptCacheSer {
        metadata: CacheMetadata {
            version: CACHE_VERSION,
            input_path: input_path.to_string(),
            input_mtime: mtime,
            input_size: size,
            concept_count: map.len(),
        },
        concepts: map,
    };

    let tmp_path = cache_path.with_extension("cache.tmp");
    let file = File::create(&tmp_path)
        .with_context(|| format!("Failed to create temp cache file: {:?}", tmp_path))?;
    let writer = BufWriter::new(file);

    bincode::DefaultOptions::new()
        .serialize_into(writer, &cache)
        .context("Failed to serialize concept cache")?;

    fs::rename(&tmp_path, cache_path)
        .with_context(|| format!("Failed to rename temp cache file to: {:?}", cache_path))?;

    info!(concepts = map.len(), path = ?cache_path, "Concept cache saved");

    Ok(())
}

/// Loads a map from the cache file without checking staleness. Lets a worker
/// reload the map on its own from a path handed over by the orchestrator.
pub fn load_concepts(cache_path: &Path) -> Result<ConceptMap> {
    if !cache_path.exists() {
        bail!("Cache file does not exist: {:?}", cache_path);
    }
    let cache = read_cache(cache_path)?;
    info!(
        concepts = cache.metadata.concept_count,
        "Concept map loaded from cache"
    );
    Ok(cache.concepts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn create_test_input(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("props.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "page_id,qid\n10,Q89").unwrap();
        path
    }

    fn create_test_map() -> ConceptMap {
        let mut map = ConceptMap::new();
        map.insert(10, "Q89");
        map.insert(11, "Q503");
        map
    }

    #[test]
    fn cache_path_returns_correct_path() {
        let path = cache_path(Path::new("/output/dir"), "pl");
        assert_eq!(path, PathBuf::from("/output/dir/concepts_pl.cache"));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let input = create_test_input(&dir);
        let input_str = input.to_str().unwrap();
        let path = cache_path(dir.path(), "en");

        save_concepts(&create_test_map(), input_str, &path).unwrap();

        let loaded = load_concepts(&path).unwrap();
        assert_eq!(loaded.get(10), Some("Q89"));
        assert_eq!(loaded.get(11), Some("Q503"));

        let validated = try_load_concepts(&path, input_str).unwrap().unwrap();
        assert_eq!(validated, create_test_map());
    }

    #[test]
    fn missing_cache_is_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nonexistent.cache");
        assert!(try_load_concepts(&path, "/some/input").unwrap().is_none());
    }

    #[test]
    fn stale_when_input_modified() {
        let dir = TempDir::new().unwrap();
        let input = create_test_input(&dir);
        let input_str = input.to_str().unwrap();
        let path = cache_path(dir.path(), "en");
        save_concepts(&create_test_map(), input_str, &path).unwrap();

        let mut file = File::create(&input).unwrap();
        writeln!(file, "page_id,qid\n10,Q89\n11,Q503\n12,Q1").unwrap();

        assert!(try_load_concepts(&path, input_str).unwrap().is_none());
    }

    #[test]
    fn stale_for_different_input_path() {
        let dir = TempDir::new().unwrap();
        let input = create_test_input(&dir);
        let path = cache_path(dir.path(), "en");
        save_concepts(&create_test_map(), input.to_str().unwrap(), &path).unwrap();

        assert!(try_load_concepts(&path, "/different/props.csv").unwrap().is_none());
    }

    #[test]
    fn corrupt_cache_is_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("concepts_en.cache");
        fs::write(&path, b"not valid bincode data").unwrap();
        assert!(try_load_concepts(&path, "/some/input").unwrap().is_none());
    }

    #[test]
    fn load_fails_for_nonexistent_file() {
        assert!(load_concepts(Path::new("/nonexistent/cache.bin")).is_err());
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let input = create_test_input(&dir);
        let path = dir.path().join("nested").join("deep").join("concepts_en.cache");
        save_concepts(&create_test_map(), input.to_str().unwrap(), &path).unwrap();
        assert!(path.exists());
    }
}
