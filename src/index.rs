use crate::models::{normalize_title, Redirect};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Per-language `title -> V` map. Titles are normalized on insert and on lookup.
///
/// `TitleIndex<ConceptId>` resolves links into concept edges;
/// `TitleIndex<u64>` resolves them into page-id pairs.
#[derive(Debug, Clone)]
pub struct TitleIndex<V> {
    by_language: FxHashMap<String, FxHashMap<String, V>>,
}

impl<V> Default for TitleIndex<V> {
    fn default() -> Self {
        Self {
            by_language: FxHashMap::default(),
        }
    }
}

impl<V> TitleIndex<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later inserts for the same title replace earlier ones.
    pub fn insert(&mut self, language: &str, title: &str, value: V) {
        self.by_language
            .entry(language.to_string())
            .or_default()
            .insert(normalize_title(title), value);
    }

    pub fn get(&self, language: &str, title: &str) -> Option<&V> {
        self.by_language
            .get(language)?
            .get(normalize_title(title).as_str())
    }

    pub fn len(&self) -> usize {
        self.by_language.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks `title` up directly, then follows its redirect chain for at most
    /// `max_hops` hops. Returns the value and the number of hops taken.
    /// A chain that loops back on itself resolves to nothing.
    pub fn resolve(
        &self,
        redirects: &RedirectTable,
        language: &str,
        title: &str,
        max_hops: u32,
    ) -> Option<(&V, u32)> {
        let titles = self.by_language.get(language)?;
        let start = normalize_title(title);
        if let Some(value) = titles.get(start.as_str()) {
            return Some((value, 0));
        }

        let aliases = redirects.by_language.get(language)?;
        let mut visited: Vec<&str> = vec![start.as_str()];
        let mut current = start.as_str();
        for hop in 1..=max_hops {
            let next = aliases.get(current)?.as_str();
            if visited.contains(&next) {
                debug!(title = %start, at = next, "Redirect cycle");
                return None;
            }
            if let Some(value) = titles.get(next) {
                return Some((value, hop));
            }
            visited.push(next);
            current = next;
        }
        debug!(title = %start, max_hops, "Redirect chain too deep");
        None
    }
}

/// Per-language `alias -> target` table loaded from the redirect file.
#[derive(Debug, Clone, Default)]
pub struct RedirectTable {
    by_language: FxHashMap<String, FxHashMap<String, String>>,
}

impl RedirectTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_redirects<'a>(redirects: impl IntoIterator<Item = &'a Redirect>) -> Self {
        let mut table = Self::new();
        for r in redirects {
            table.insert(&r.language, &r.alias_title, &r.target_title);
        }
        table
    }

    /// Later inserts for the same alias replace earlier ones.
    pub fn insert(&mut self, language: &str, alias: &str, target: &str) {
        self.by_language
            .entry(language.to_string())
            .or_default()
            .insert(normalize_title(alias), normalize_title(target));
    }

    pub fn target(&self, language: &str, alias: &str) -> Option<&str> {
        self.by_language
            .get(language)?
            .get(normalize_title(alias).as_str())
            .map(|t| t.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_language.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
