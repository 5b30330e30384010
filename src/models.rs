use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Fields read from one `<page>` record. Lives only inside an extraction worker.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub namespace: i32,
    pub id: u64,
    pub title: String,
    pub revision_id: Option<u64>,
    pub timestamp: Option<String>,
    pub text: Option<String>,
    /// Target declared by the dump's own `<redirect title=".."/>` element
    pub redirect_title: Option<String>,
}

/// Durable per-language article record, one JSON line in an articles shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: u64,
    pub language: String,
    pub title: String,
    pub revision_id: Option<u64>,
    pub timestamp: Option<String>,
    pub word_count: u64,
    pub text_length: u64,
    #[serde(default)]
    pub categories: BTreeSet<String>,
    #[serde(default)]
    pub infobox_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawLink {
    pub source_title: String,
    pub target_title: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub alias_title: String,
    pub target_title: String,
    pub language: String,
}

/// What a single page turns into. A page is never both a redirect and an article.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    Skipped { page_id: u64 },
    Redirect { page_id: u64, redirect: Redirect },
    Article { article: Article, links: Vec<RawLink> },
}

impl PageOutcome {
    pub fn page_id(&self) -> u64 {
        match self {
            PageOutcome::Skipped { page_id } => *page_id,
            PageOutcome::Redirect { page_id, .. } => *page_id,
            PageOutcome::Article { article, .. } => article.id,
        }
    }
}

const SYNTHETIC_PREFIX: &str = "local:";

/// Canonical cross-lingual identifier: an external id such as `Q42`, or
/// `local:<language>:<pageId>` when the page has no external mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConceptId(String);

impl ConceptId {
    pub fn external(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn synthetic(language: &str, page_id: u64) -> Self {
        let mut buf = itoa::Buffer::new();
        let digits = buf.format(page_id);
        let len = SYNTHETIC_PREFIX.len() + language.len() + 1 + digits.len();
        let mut id = String::with_capacity(len);
        id.push_str(SYNTHETIC_PREFIX);
        id.push_str(language);
        id.push(':');
        id.push_str(digits);
        Self(id)
    }

    pub fn is_synthetic(&self) -> bool {
        self.0.starts_with(SYNTHETIC_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolved `links-to` edge between two concepts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConceptEdge {
    pub source: ConceptId,
    pub target: ConceptId,
}

/// Canonical title form used on both sides of every title lookup:
/// underscores become spaces, runs of whitespace collapse, ends are trimmed.
pub fn normalize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for word in title
        .split(|c: char| c == '_' || c.is_whitespace())
        .filter(|w| !w.is_empty())
    {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}
