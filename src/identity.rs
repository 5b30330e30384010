//! Page id and title to concept id mappings.
//!
//! The page id map comes from an external property dump: either the
//! MediaWiki `page_props` SQL dump or a delimited export of it. Pages
//! without a mapping get a synthetic `local:<lang>:<id>` concept, so every
//! article resolves to some concept even when the dump is missing.

use crate::cache;
use crate::index::TitleIndex;
use crate::models::{Article, ConceptId};
use crate::stream::open_decompressed;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

static SQL_TUPLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d+),'((?:[^'\\]|\\.)*)','((?:[^'\\]|\\.)*)'").unwrap());

/// `pageId -> external id` for one language.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConceptMap {
    ids: FxHashMap<u64, String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PropertyDumpStats {
    pub rows: u64,
    pub kept: u64,
    pub malformed: u64,
}

impl ConceptMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, page_id: u64, external_id: impl Into<String>) {
        self.ids.insert(page_id, external_id.into());
    }

    pub fn get(&self, page_id: u64) -> Option<&str> {
        self.ids.get(&page_id).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// External id when mapped, otherwise the synthetic per-language id.
    pub fn concept_for(&self, language: &str, page_id: u64) -> ConceptId {
        match self.get(page_id) {
            Some(id) => ConceptId::external(id),
            None => ConceptId::synthetic(language, page_id),
        }
    }

    /// Parses a property dump file (plain, `.gz` or `.bz2`).
    pub fn from_property_dump(path: &Path, property: &str) -> Result<(Self, PropertyDumpStats)> {
        let reader = open_decompressed(path)?;
        Self::parse(reader, property)
            .with_context(|| format!("Failed to read property dump: {:?}", path))
    }

    /// Accepts any mix of SQL `INSERT INTO` lines, `page_id,property,value`
    /// rows and `page_id,value` rows. Header and comment lines are ignored.
    pub fn parse(mut reader: impl BufRead, property: &str) -> Result<(Self, PropertyDumpStats)> {
        let mut map = Self::new();
        let mut stats = PropertyDumpStats::default();
        let mut raw = Vec::new();

        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end();

            if line.starts_with("INSERT INTO") {
                for caps in SQL_TUPLE.captures_iter(line) {
                    stats.rows += 1;
                    if &caps[2] != property {
                        continue;
                    }
                    match caps[1].parse::<u64>() {
                        Ok(page_id) if !caps[3].is_empty() => {
                            map.insert(page_id, &caps[3]);
                            stats.kept += 1;
                        }
                        _ => stats.malformed += 1,
                    }
                }
                continue;
            }

            if line.is_empty() || line.starts_with("--") || line.starts_with("/*") {
                continue;
            }
            let fields: Vec<&str> = line.split([',', '\t']).map(|f| f.trim()).collect();
            let Ok(page_id) = fields[0].parse::<u64>() else {
                // header or statement we do not care about
                continue;
            };
            stats.rows += 1;
            let value = match fields.as_slice() {
                [_, prop, value] if *prop == property => *value,
                [_, _, _] => continue,
                [_, value] => *value,
                _ => {
                    stats.malformed += 1;
                    continue;
                }
            };
            if value.is_empty() {
                stats.malformed += 1;
                continue;
            }
            map.insert(page_id, value);
            stats.kept += 1;
        }

        Ok((map, stats))
    }
}

/// Loads the concept map for a language, preferring a valid cache.
///
/// A missing or unreadable property dump is not fatal: the run continues
/// with synthetic ids only and cross-lingual unification is lost.
pub fn load_concept_map(
    props: Option<&Path>,
    property: &str,
    cache_file: Option<&Path>,
) -> Result<ConceptMap> {
    let Some(props) = props else {
        warn!("No property dump given, using synthetic concept ids only");
        return Ok(ConceptMap::new());
    };
    if !props.exists() {
        warn!(path = ?props, "Property dump not found, using synthetic concept ids only");
        return Ok(ConceptMap::new());
    }
    let props_str = props.to_string_lossy();

    if let Some(cache_file) = cache_file {
        if let Some(map) = cache::try_load_concepts(cache_file, &props_str)? {
            return Ok(map);
        }
    }

    let (map, stats) = match ConceptMap::from_property_dump(props, property) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "Property dump unreadable, using synthetic concept ids only");
            return Ok(ConceptMap::new());
        }
    };
    info!(
        rows = stats.rows,
        mapped = stats.kept,
        malformed = stats.malformed,
        property,
        "Property dump parsed"
    );

    if let Some(cache_file) = cache_file {
        if let Err(e) = cache::save_concepts(&map, &props_str, cache_file) {
            warn!(error = %e, "Failed to save concept map cache");
        }
    }
    Ok(map)
}

/// Per-language concept maps, shared read-only with every consumer.
#[derive(Debug, Default, Clone)]
pub struct IdentityResolver {
    maps: FxHashMap<String, Arc<ConceptMap>>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_map(mut self, language: &str, map: ConceptMap) -> Self {
        self.maps.insert(language.to_string(), Arc::new(map));
        self
    }

    pub fn map(&self, language: &str) -> Option<Arc<ConceptMap>> {
        self.maps.get(language).cloned()
    }

    pub fn concept_for(&self, language: &str, page_id: u64) -> ConceptId {
        match self.maps.get(language) {
            Some(map) => map.concept_for(language, page_id),
            None => ConceptId::synthetic(language, page_id),
        }
    }

    pub fn concept_for_article(&self, article: &Article) -> ConceptId {
        self.concept_for(&article.language, article.id)
    }

    /// Adds every article to a `title -> concept` index.
    pub fn index_articles<'a>(
        &self,
        index: &mut TitleIndex<ConceptId>,
        articles: impl IntoIterator<Item = &'a Article>,
    ) -> u64 {
        let mut count = 0;
        for article in articles {
            index.insert(&article.language, &article.title, self.concept_for_article(article));
            count += 1;
        }
        count
    }
}
