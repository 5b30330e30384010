//! Narrow wikitext pattern extraction. No rendering, just the handful of
//! signals the graph needs: redirect targets, categories, an infobox type,
//! a rough word count and internal link targets.

use crate::config::{LanguageRules, REDIRECT_PROBE_CHARS};
use crate::models::normalize_title;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

pub static LINK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[([^\[\]|]+)(?:\|[^\[\]]*)?\]\]").unwrap());

static LINK_DISPLAY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[(?:[^\[\]|]*\|)?([^\[\]|]*)\]\]").unwrap());

static EMPHASIS_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"''+").unwrap());

static TAG_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());

/// True if a localized redirect magic word appears in the head of the revision.
pub fn is_redirect(text: &str, rules: &LanguageRules) -> bool {
    let head: String = text.chars().take(REDIRECT_PROBE_CHARS).collect();
    let head = head.to_lowercase();
    rules.redirect_markers.iter().any(|m| head.contains(m.as_str()))
}

/// First bracketed link target, without display text or section anchor.
pub fn redirect_target(text: &str) -> Option<String> {
    LINK_REGEX
        .captures(text)
        .map(|c| normalize_title(strip_anchor(&c[1])))
        .filter(|t| !t.is_empty())
}

pub fn extract_categories(text: &str, rules: &LanguageRules) -> BTreeSet<String> {
    rules
        .category_regex
        .captures_iter(text)
        .map(|c| normalize_title(&c[1]))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Best-effort type token of the first infobox, e.g. `person` for `{{Infobox person`.
pub fn infobox_type(text: &str, rules: &LanguageRules) -> Option<String> {
    rules
        .infobox_regex
        .captures(text)
        .map(|c| normalize_title(&c[1]))
        .filter(|s| !s.is_empty())
}

/// Whitespace-separated words left after markup is stripped.
pub fn word_count(text: &str, rules: &LanguageRules) -> u64 {
    let stripped = strip_templates(text);
    let stripped = match &rules.cleanup_regex {
        Some(re) => re.replace_all(&stripped, " ").into_owned(),
        None => stripped,
    };
    let stripped = LINK_DISPLAY_REGEX.replace_all(&stripped, "$1");
    let stripped = EMPHASIS_REGEX.replace_all(&stripped, "");
    let stripped = TAG_REGEX.replace_all(&stripped, " ");
    stripped.split_whitespace().count() as u64
}

/// Internal article link targets in document order.
///
/// Namespace links (categories, files, templates, ...) and interlanguage
/// links (`de:Apfel`) are dropped.
pub fn link_targets(text: &str, rules: &LanguageRules) -> Vec<String> {
    LINK_REGEX
        .captures_iter(text)
        .filter_map(|c| clean_link(&c[1], rules))
        .collect()
}

fn clean_link(raw: &str, rules: &LanguageRules) -> Option<String> {
    let target = strip_anchor(raw).trim();
    if target.is_empty() || target.starts_with(':') {
        return None;
    }
    if let Some((prefix, _)) = target.split_once(':') {
        let prefix = prefix.trim();
        if rules.is_namespace(prefix) || is_language_prefix(prefix) {
            return None;
        }
    }
    let title = normalize_title(target);
    (!title.is_empty()).then_some(title)
}

fn strip_anchor(target: &str) -> &str {
    target.split('#').next().unwrap_or("")
}

fn is_language_prefix(prefix: &str) -> bool {
    (2..=3).contains(&prefix.len()) && prefix.bytes().all(|b| b.is_ascii_alphabetic())
}

/// Removes `{{ ... }}` blocks, honouring nesting. An unclosed block runs to the end.
fn strip_templates(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;
    let mut run_start = 0;

    while i < bytes.len() {
        if i + 1 < bytes.len() && bytes[i] == b'{' && bytes[i + 1] == b'{' {
            if run_start < i {
                result.push_str(&text[run_start..i]);
            }
            let mut depth: i32 = 0;
            while i + 1 < bytes.len() {
                if bytes[i] == b'{' && bytes[i + 1] == b'{' {
                    depth += 1;
                    i += 2;
                } else if bytes[i] == b'}' && bytes[i + 1] == b'}' {
                    depth -= 1;
                    i += 2;
                    if depth == 0 {
                        break;
                    }
                } else {
                    i += 1;
                }
            }
            if depth != 0 {
                i = bytes.len();
            }
            run_start = i;
        } else {
            i += 1;
        }
    }

    if run_start < bytes.len() {
        result.push_str(&text[run_start..]);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanguageConfig;

    fn rules(code: &str) -> LanguageRules {
        LanguageConfig::builtin(code).unwrap().compile().unwrap()
    }

    #[test]
    fn redirect_detected_case_insensitively() {
        let en = rules("en");
        assert!(is_redirect("#REDIRECT [[Rust (programming language)]]", &en));
        assert!(is_redirect("#redirect [[Rust]]", &en));
        assert!(!is_redirect("Rust is a language. [[Mozilla]]", &en));
    }

    #[test]
    fn redirect_localized_keyword() {
        let pl = rules("pl");
        assert!(is_redirect("#PATRZ [[Warszawa]]", &pl));
        assert!(!is_redirect("#PATRZ [[Warszawa]]", &rules("en")));
    }

    #[test]
    fn redirect_keyword_beyond_probe_window_ignored() {
        let text = format!("{}#REDIRECT [[X]]", "a".repeat(REDIRECT_PROBE_CHARS));
        assert!(!is_redirect(&text, &rules("en")));
    }

    #[test]
    fn redirect_target_strips_anchor_and_pipe() {
        let target = redirect_target("#REDIRECT [[Rust_(lang)#History|x]]");
        assert_eq!(target.as_deref(), Some("Rust (lang)"));
        assert_eq!(redirect_target("#REDIRECT nothing"), None);
    }

    #[test]
    fn category_simple_and_sort_key() {
        let en = rules("en");
        let cats = extract_categories("[[Category:Science]] [[Category:People|Smith, John]]", &en);
        assert_eq!(cats.into_iter().collect::<Vec<_>>(), vec!["People", "Science"]);
    }

    #[test]
    fn category_localized_prefix() {
        let pl = rules("pl");
        let text = "[[Kategoria:Miasta w Polsce]] [[ kategoria : Stolice ]]";
        let cats = extract_categories(text, &pl);
        assert!(cats.contains("Miasta w Polsce"));
        assert!(cats.contains("Stolice"));
    }

    #[test]
    fn category_newlines_collapsed() {
        let cats = extract_categories("[[Category:Explorers from\nNew France]]", &rules("en"));
        assert!(cats.contains("Explorers from New France"));
    }

    #[test]
    fn category_does_not_match_regular_links() {
        assert!(extract_categories("[[Rust]] and [[Python]]", &rules("en")).is_empty());
    }

    #[test]
    fn infobox_type_found() {
        let en = rules("en");
        let person = infobox_type("{{Infobox person\n| name = X\n}}", &en);
        assert_eq!(person.as_deref(), Some("person"));
        let settlement = infobox_type("{{infobox_settlement|name=Y}}", &en);
        assert_eq!(settlement.as_deref(), Some("settlement"));
        assert_eq!(infobox_type("{{cite web|url=x}}", &en), None);
    }

    #[test]
    fn word_count_ignores_markup() {
        let en = rules("en");
        let text = "{{Infobox person|name=Test}}'''Rust''' is a [[systems programming|systems]] language.<ref>cite</ref> [[File:Logo.png|thumb|Logo caption]]";
        assert_eq!(word_count(text, &en), 5);
    }

    #[test]
    fn word_count_empty() {
        assert_eq!(word_count("", &rules("en")), 0);
    }

    #[test]
    fn links_trim_pipe_and_anchor() {
        let en = rules("en");
        let text = "See [[C++|C plus plus]], [[Python#History]] and [[ Mozilla_Foundation ]].";
        let links = link_targets(text, &en);
        assert_eq!(links, vec!["C++", "Python", "Mozilla Foundation"]);
    }

    #[test]
    fn links_skip_namespaces_and_interlanguage() {
        let en = rules("en");
        let text = "[[Category:X]] [[File:a.png|thumb|see [[Banana]]]] [[de:Apfel]] [[zh:苹果]] [[:Category:Y]] [[#Local]] [[Star Wars: Episode I]]";
        let links = link_targets(text, &en);
        assert_eq!(links, vec!["Banana", "Star Wars: Episode I"]);
    }

    #[test]
    fn strip_templates_nested() {
        assert_eq!(strip_templates("{{outer {{inner}} end}} text"), " text");
        assert_eq!(strip_templates("{{a}} middle {{b}} end"), " middle  end");
        assert_eq!(strip_templates("plain text"), "plain text");
    }

    #[test]
    fn strip_templates_unclosed_does_not_hang() {
        let result = strip_templates("before {{unclosed template text after");
        assert_eq!(result, "before ");
    }
}
