//! Side-artifact extraction from task output.
//!
//! Two patterns are collected: `http(s)://` URLs and absolute paths that end
//! in a file extension. Matches are kept once, in first-seen order.

use std::sync::OnceLock;

use regex::Regex;

// Both patterns are literals; compilation cannot fail.
#[allow(clippy::expect_used)]
fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(https?://[^\s"'<>)]+)"#).expect("valid url regex"))
}

#[allow(clippy::expect_used)]
fn path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:/[A-Za-z0-9._\-]+)+\.[A-Za-z0-9._\-]+").expect("valid path regex")
    })
}

/// URL-like substrings of `text`, in order.
#[must_use]
pub fn extract_urls(text: &str) -> Vec<String> {
    url_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_owned())
        .collect()
}

/// Absolute-path-like substrings of `text`, in order.
#[must_use]
pub fn extract_paths(text: &str) -> Vec<String> {
    path_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_owned())
        .collect()
}

/// Append each candidate not already present.
pub fn merge_unique(target: &mut Vec<String>, candidates: Vec<String>) {
    for candidate in candidates {
        if !target.contains(&candidate) {
            target.push(candidate);
        }
    }
}
