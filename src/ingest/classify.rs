// src/ingest/classify.rs
//! Link extraction and target-domain classification.

use once_cell::sync::OnceCell;
use regex::Regex;

/// Texts with fewer non-whitespace chars than this carry no links.
pub const DEFAULT_MIN_TEXT_LEN: usize = 10;

/// Host patterns (anchored right after the scheme) that count as the target domain.
const TARGET_HOST_PATTERNS: &[&str] = &[
    r"(?:www\.|m\.|smile\.)?amazon\.[a-z]{2,3}(?:\.[a-z]{2})?",
    r"amzn\.(?:to|in|eu|asia)",
    r"a\.co",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkClass {
    Target,
    Other,
}

/// A URL extracted from message text plus its class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateLink {
    pub raw: String,
    pub class: LinkClass,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partitioned {
    pub target: Vec<String>,
    pub other: Vec<String>,
}

impl Partitioned {
    pub fn is_empty(&self) -> bool {
        self.target.is_empty() && self.other.is_empty()
    }
}

fn any_url_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?i)https?://\S+").expect("any-url regex"))
}

fn target_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        let hosts = TARGET_HOST_PATTERNS.join("|");
        Regex::new(&format!(r"(?i)^https?://(?:{hosts})(?:[:/?#]|$)"))
            .expect("target-domain regex")
    })
}

fn long_enough(text: &str, min_len: usize) -> bool {
    text.chars().filter(|c| !c.is_whitespace()).count() >= min_len
}

fn trim_trailing_punct(url: &str) -> &str {
    url.trim_end_matches(['.', ',', ';', ':', '!', '?', ')', ']', '}', '>', '"', '\''])
}

/// True if `url` belongs to the target e-commerce domain.
pub fn is_target_url(url: &str) -> bool {
    target_re().is_match(url)
}

/// All distinct URLs in `text`, in first-seen order.
/// Returns nothing for absent or too-short text, without running any pattern.
pub fn extract_urls(text: Option<&str>, min_len: usize) -> Vec<String> {
    let Some(text) = text else {
        return Vec::new();
    };
    if !long_enough(text, min_len) {
        return Vec::new();
    }

    let mut out: Vec<String> = Vec::new();
    for m in any_url_re().find_iter(text) {
        let url = trim_trailing_punct(m.as_str());
        if url.ends_with("://") {
            continue;
        }
        if !out.iter().any(|u| u == url) {
            out.push(url.to_string());
        }
    }
    out
}

/// Distinct target-domain URLs in `text`.
pub fn extract_target_urls(text: Option<&str>, min_len: usize) -> Vec<String> {
    extract_urls(text, min_len)
        .into_iter()
        .filter(|u| is_target_url(u))
        .collect()
}

pub fn classify(url: &str) -> CandidateLink {
    let class = if is_target_url(url) {
        LinkClass::Target
    } else {
        LinkClass::Other
    };
    CandidateLink {
        raw: url.to_string(),
        class,
    }
}

/// Extract and split into target-domain vs other links.
pub fn partition(text: Option<&str>, min_len: usize) -> Partitioned {
    let mut out = Partitioned::default();
    for link in extract_urls(text, min_len).iter().map(|u| classify(u)) {
        match link.class {
            LinkClass::Target => out.target.push(link.raw),
            LinkClass::Other => out.other.push(link.raw),
        }
    }
    out
}
