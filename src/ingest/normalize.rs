// src/ingest/normalize.rs
//! Canonical dedup keys for links and forwarded texts. Pure functions.

use once_cell::sync::OnceCell;
use regex::Regex;
use sha2::{Digest, Sha256};

fn product_id_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)/(?:dp|gp/product|gp/aw/d|d|product)/([a-z0-9]{10})(?:[/?#]|$)")
            .expect("product id regex")
    })
}

/// Strip query and fragment, lowercase scheme + host, drop one trailing slash.
pub fn strip_url(url: &str) -> String {
    let url = url.trim();
    let cut = url.find(['?', '#']).unwrap_or(url.len());
    let base = &url[..cut];

    let (scheme_host, path) = match base.find("://") {
        Some(i) => {
            let after = i + 3;
            let path_start = base[after..].find('/').map(|p| after + p).unwrap_or(base.len());
            (&base[..path_start], &base[path_start..])
        }
        None => ("", base),
    };

    let mut out = scheme_host.to_ascii_lowercase();
    out.push_str(path.strip_suffix('/').unwrap_or(path));
    out
}

/// Fixed-length product identifier from the path, uppercased.
pub fn product_id(url: &str) -> Option<String> {
    let cut = url.find(['?', '#']).unwrap_or(url.len());
    product_id_re()
        .captures(&url[..cut])
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_uppercase())
}

/// Dedup key for a link: `id_<PRODUCT>` when the path carries a product id,
/// otherwise the stripped URL.
pub fn normalize_url(url: &str) -> String {
    match product_id(url) {
        Some(id) => format!("id_{id}"),
        None => strip_url(url),
    }
}

/// Dedup key for a whole message on the forward path.
pub fn text_key(text: &str) -> String {
    let folded = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let digest = Sha256::digest(folded.as_bytes());
    let mut out = String::with_capacity(5 + 16);
    out.push_str("text_");
    for b in digest.iter().take(8) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_params_collapse_to_product_id() {
        let a = normalize_url("https://amazon.in/dp/B0ABCDEFGH?tag=x&ref=y");
        let b = normalize_url("https://amazon.in/dp/B0ABCDEFGH");
        assert_eq!(a, "id_B0ABCDEFGH");
        assert_eq!(a, b);
        assert_ne!(a, normalize_url("https://amazon.in/dp/B0ZZZZZZZZ"));
    }

    #[test]
    fn different_shapes_same_product() {
        let a = normalize_url("https://www.amazon.in/Some-Title/dp/b0abcdefgh/ref=sr_1_1");
        let b = normalize_url("https://amazon.in/gp/product/B0ABCDEFGH");
        assert_eq!(a, b);
    }

    #[test]
    fn fallback_strips_query_and_fragment() {
        assert_eq!(
            normalize_url("https://AMZN.to/abc?x=1#frag"),
            "https://amzn.to/abc"
        );
        assert_eq!(normalize_url("https://amzn.to/abc/"), "https://amzn.to/abc");
        assert_eq!(normalize_url("https://example.com"), "https://example.com");
    }

    #[test]
    fn short_token_is_not_a_product_id() {
        assert_eq!(product_id("https://amazon.in/dp/B0ABC"), None);
        assert_eq!(product_id("https://amazon.in/dp/B0ABCDEFGHIJ"), None);
    }

    #[test]
    fn text_key_ignores_spacing_and_case() {
        let a = text_key("Great  deal\nhttps://example.com/x");
        let b = text_key("great deal https://example.com/x ");
        assert_eq!(a, b);
        assert!(a.starts_with("text_"));
        assert_eq!(a.len(), 5 + 16);
        assert_ne!(a, text_key("other deal"));
    }
}
