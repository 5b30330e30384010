use anyhow::{bail, Context, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Maximum number of redirect hops followed when resolving a link target
pub const REDIRECT_MAX_HOPS: u32 = 5;

/// Only this many leading characters of a revision are probed for a redirect magic word
pub const REDIRECT_PROBE_CHARS: usize = 300;

/// Articles per shard batch
pub const DEFAULT_BATCH_SIZE: usize = 20_000;

/// Decompressed bytes read per chunk by the page stream
pub const STREAM_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Accumulation buffer ceiling; a record that has not closed by then is dropped
pub const STREAM_BUFFER_CEILING: usize = 20 * 1024 * 1024;

/// Pages handed to the extraction pool per dispatch
pub const EXTRACT_WINDOW: usize = 4096;

/// Progress update interval (tick every N pages)
pub const PROGRESS_INTERVAL: u64 = 1000;

pub const CHECKPOINT_VERSION: u32 = 2;
pub const CACHE_VERSION: u32 = 1;

/// Property holding the cross-lingual identifier in `page_props`
pub const DEFAULT_ID_PROPERTY: &str = "wikibase_item";

/// Namespace injected into every yielded page so a single-page parse succeeds
pub const EXPORT_NAMESPACE: &str = "http://www.mediawiki.org/xml/export-0.11/";

pub const DEFAULT_BOLT_URI: &str = "bolt://localhost:7687";
pub const DEFAULT_BOLT_USER: &str = "neo4j";

/// Records per store write
pub const LOADER_BATCH_SIZE: usize = 5_000;
pub const LOADER_WORKERS: usize = 4;
pub const LOADER_MAX_RETRIES: u32 = 5;
pub const LOADER_BACKOFF_BASE_MS: u64 = 500;
pub const LOADER_BACKOFF_MAX_MS: u64 = 8_000;
pub const STORE_OP_TIMEOUT_SECS: u64 = 60;

/// Attempts made when first connecting to the store
pub const CONNECT_MAX_RETRIES: u32 = 10;
pub const CONNECT_RETRY_DELAY_SECS: u64 = 3;

/// Per-language settings consumed by the extractor. Loaded once and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguageConfig {
    pub code: String,
    /// Dump database name, e.g. `enwiki`
    pub dbname: String,
    /// Localized redirect magic words without the leading `#`
    pub redirect_keywords: Vec<String>,
    #[serde(default)]
    pub namespaces: NamespacePrefixes,
    #[serde(default = "default_infobox_prefixes")]
    pub infobox_prefixes: Vec<String>,
    /// File-like link prefixes removed before counting words
    #[serde(default)]
    pub cleanup_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NamespacePrefixes {
    #[serde(default)]
    pub category: Vec<String>,
    #[serde(default)]
    pub file: Vec<String>,
    #[serde(default)]
    pub template: Vec<String>,
    #[serde(default)]
    pub other: Vec<String>,
}

impl NamespacePrefixes {
    pub fn all(&self) -> impl Iterator<Item = &str> {
        self.category
            .iter()
            .chain(&self.file)
            .chain(&self.template)
            .chain(&self.other)
            .map(|s| s.trim_end_matches(':'))
    }
}

fn default_infobox_prefixes() -> Vec<String> {
    vec!["Infobox".to_string()]
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl LanguageConfig {
    /// Built-in settings for the languages the pipeline has been run against.
    pub fn builtin(code: &str) -> Option<Self> {
        let common_other = [
            "Wikipedia",
            "Help",
            "Portal",
            "Draft",
            "Module",
            "MediaWiki",
            "Special",
            "Talk",
            "User",
        ];
        let config = match code {
            "en" => Self {
                code: "en".into(),
                dbname: "enwiki".into(),
                redirect_keywords: strings(&["REDIRECT"]),
                namespaces: NamespacePrefixes {
                    category: strings(&["Category"]),
                    file: strings(&["File", "Image", "Media"]),
                    template: strings(&["Template"]),
                    other: strings(&common_other),
                },
                infobox_prefixes: strings(&["Infobox"]),
                cleanup_patterns: strings(&["File", "Image"]),
            },
            "pl" => Self {
                code: "pl".into(),
                dbname: "plwiki".into(),
                redirect_keywords: strings(&["PATRZ", "PRZEKIERUJ", "TAM", "REDIRECT"]),
                namespaces: NamespacePrefixes {
                    category: strings(&["Kategoria", "Category"]),
                    file: strings(&["Plik", "Grafika", "File", "Image"]),
                    template: strings(&["Szablon", "Template"]),
                    other: strings(&[
                        "Wikipedia",
                        "Pomoc",
                        "Portal",
                        "Moduł",
                        "Specjalna",
                        "Dyskusja",
                        "Wikipedysta",
                    ]),
                },
                infobox_prefixes: strings(&["Infobox"]),
                cleanup_patterns: strings(&["Plik", "Grafika", "File", "Image"]),
            },
            "de" => Self {
                code: "de".into(),
                dbname: "dewiki".into(),
                redirect_keywords: strings(&["WEITERLEITUNG", "REDIRECT"]),
                namespaces: NamespacePrefixes {
                    category: strings(&["Kategorie", "Category"]),
                    file: strings(&["Datei", "Bild", "File", "Image"]),
                    template: strings(&["Vorlage", "Template"]),
                    other: strings(&[
                        "Wikipedia",
                        "Hilfe",
                        "Portal",
                        "Modul",
                        "Spezial",
                        "Diskussion",
                        "Benutzer",
                    ]),
                },
                infobox_prefixes: strings(&["Infobox"]),
                cleanup_patterns: strings(&["Datei", "Bild", "File", "Image"]),
            },
            "fr" => Self {
                code: "fr".into(),
                dbname: "frwiki".into(),
                redirect_keywords: strings(&["REDIRECTION", "REDIRECT"]),
                namespaces: NamespacePrefixes {
                    category: strings(&["Catégorie", "Category"]),
                    file: strings(&["Fichier", "Image", "File"]),
                    template: strings(&["Modèle", "Template"]),
                    other: strings(&[
                        "Wikipédia",
                        "Aide",
                        "Portail",
                        "Projet",
                        "Module",
                        "Spécial",
                        "Discussion",
                        "Utilisateur",
                    ]),
                },
                infobox_prefixes: strings(&["Infobox"]),
                cleanup_patterns: strings(&["Fichier", "Image", "File"]),
            },
            _ => return None,
        };
        Some(config)
    }

    /// Reads a language config from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read language config: {:?}", path))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid language config: {:?}", path))?;
        if config.redirect_keywords.is_empty() {
            bail!("Language config {:?} has no redirect keywords", path);
        }
        Ok(config)
    }

    pub fn compile(&self) -> Result<LanguageRules> {
        LanguageRules::new(self)
    }
}

/// Regexes and lookup tables derived from a [`LanguageConfig`], compiled once per run.
#[derive(Debug)]
pub struct LanguageRules {
    pub code: String,
    pub redirect_markers: Vec<String>,
    pub namespace_prefixes: Vec<String>,
    pub category_regex: Regex,
    pub infobox_regex: Regex,
    pub cleanup_regex: Option<Regex>,
}

fn alternation(items: &[String]) -> String {
    items
        .iter()
        .map(|s| regex::escape(s.trim_end_matches(':')))
        .collect::<Vec<_>>()
        .join("|")
}

impl LanguageRules {
    pub fn new(config: &LanguageConfig) -> Result<Self> {
        let categories = if config.namespaces.category.is_empty() {
            vec!["Category".to_string()]
        } else {
            config.namespaces.category.clone()
        };

        let category_regex = RegexBuilder::new(&format!(
            r"\[\[\s*(?:{})\s*:\s*([^\]|]+)",
            alternation(&categories)
        ))
        .case_insensitive(true)
        .build()
        .context("Failed to compile category pattern")?;

        let infobox_regex = RegexBuilder::new(&format!(
            r"\{{\{{\s*(?:{})[ _]+([^\n|}}]+)",
            alternation(&config.infobox_prefixes)
        ))
        .case_insensitive(true)
        .build()
        .context("Failed to compile infobox pattern")?;

        let cleanup_regex = if config.cleanup_patterns.is_empty() {
            None
        } else {
            Some(
                RegexBuilder::new(&format!(
                    r"\[\[\s*(?:{})\s*:[^\]]*\]\]",
                    alternation(&config.cleanup_patterns)
                ))
                .case_insensitive(true)
                .build()
                .context("Failed to compile cleanup pattern")?,
            )
        };

        Ok(Self {
            code: config.code.clone(),
            redirect_markers: config
                .redirect_keywords
                .iter()
                .map(|k| format!("#{}", k.to_lowercase()))
                .collect(),
            namespace_prefixes: config
                .namespaces
                .all()
                .map(|p| p.to_lowercase())
                .collect(),
            category_regex,
            infobox_regex,
            cleanup_regex,
        })
    }

    pub fn is_namespace(&self, prefix: &str) -> bool {
        let prefix = prefix.trim().to_lowercase();
        self.namespace_prefixes.iter().any(|p| *p == prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn builtin_languages_compile() {
        for code in ["en", "pl", "de", "fr"] {
            let config = LanguageConfig::builtin(code).unwrap();
            let rules = config.compile().unwrap();
            assert_eq!(rules.code, code);
            assert!(!rules.redirect_markers.is_empty());
        }
    }

    #[test]
    fn builtin_unknown_language() {
        assert!(LanguageConfig::builtin("xx").is_none());
    }

    #[test]
    fn redirect_markers_are_lowercased_with_hash() {
        let rules = LanguageConfig::builtin("pl").unwrap().compile().unwrap();
        assert!(rules.redirect_markers.contains(&"#patrz".to_string()));
        assert!(rules.redirect_markers.contains(&"#redirect".to_string()));
    }

    #[test]
    fn namespace_lookup_is_case_insensitive() {
        let rules = LanguageConfig::builtin("de").unwrap().compile().unwrap();
        assert!(rules.is_namespace("Kategorie"));
        assert!(rules.is_namespace("datei"));
        assert!(!rules.is_namespace("en"));
    }

    #[test]
    fn from_file_reads_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"code":"xx","dbname":"xxwiki","redirect_keywords":["GO"],
                "namespaces":{{"category":["Kat"]}}}}"#
        )
        .unwrap();
        let config = LanguageConfig::from_file(file.path()).unwrap();
        assert_eq!(config.code, "xx");
        assert_eq!(config.infobox_prefixes, vec!["Infobox"]);
        assert_eq!(config.namespaces.category, vec!["Kat"]);
        assert!(config.cleanup_patterns.is_empty());
    }

    #[test]
    fn from_file_rejects_missing_keywords() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"code":"xx","dbname":"xxwiki","redirect_keywords":[]}}"#).unwrap();
        assert!(LanguageConfig::from_file(file.path()).is_err());
    }
}
