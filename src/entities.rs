// src/entities.rs
//! Locator and text parsing: status URLs, hashtags, mentions.

use once_cell::sync::OnceCell;
use regex::Regex;

use crate::types::ExtractedLink;

fn status_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:https?://)?(?:www\.|mobile\.)?[a-z0-9.-]*/?(?P<handle>[A-Za-z0-9_]{1,32})/status(?:es)?/(?P<id>\d+)")
            .expect("status locator regex")
    })
}

/// Parse `https://<host>/<handle>/status/<id>` (or a bare `/<handle>/status/<id>` path).
/// Returns `(handle, id)`.
pub fn parse_status_locator(locator: &str) -> Option<(String, String)> {
    let caps = status_re().captures(locator.trim())?;
    let handle = caps.name("handle")?.as_str().to_string();
    let id = caps.name("id")?.as_str().to_string();
    Some((handle, id))
}

/// Fill a missing id or handle from the locator; `None` when neither the
/// extractor nor the locator yields an id.
pub fn complete_link(mut link: ExtractedLink) -> Option<ExtractedLink> {
    if link.id.trim().is_empty() || link.origin_handle.trim().is_empty() {
        if let Some((handle, id)) = parse_status_locator(&link.locator) {
            if link.id.trim().is_empty() {
                link.id = id;
            }
            if link.origin_handle.trim().is_empty() {
                link.origin_handle = handle;
            }
        }
    }
    if link.id.trim().is_empty() {
        return None;
    }
    Some(link)
}

/// Distinct, lowercased hashtags (without `#`), sorted.
pub fn parse_hashtags(input: &str) -> Vec<String> {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE.get_or_init(|| Regex::new(r"(?u)#(?P<tag>\w+)").expect("hashtag regex"));
    collect_tags(re, input, |s| s.to_lowercase())
}

/// Distinct mentions (without `@`), sorted, original case kept.
pub fn parse_mentions(input: &str) -> Vec<String> {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE.get_or_init(|| Regex::new(r"@(?P<tag>[A-Za-z0-9_]{1,32})").expect("mention regex"));
    collect_tags(re, input, |s| s.to_string())
}

fn collect_tags(re: &Regex, input: &str, norm: impl Fn(&str) -> String) -> Vec<String> {
    let mut tags: Vec<String> = re
        .captures_iter(input)
        .filter_map(|c| c.name("tag").map(|m| norm(m.as_str())))
        .collect();
    tags.sort();
    tags.dedup();
    tags
}
