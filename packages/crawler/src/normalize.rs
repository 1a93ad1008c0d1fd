//! URL normalization and deduplication hashing.
//!
//! Every URL entering the frontier passes through [`normalize_url`] so that
//! trivially different spellings of the same page collapse to one
//! `url_hash`. The hash is SHA-256 over the normalized string.

use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid URL: {0}")]
    Invalid(#[from] url::ParseError),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("URL has no host")]
    MissingHost,
}

/// A URL in canonical form, ready for frontier submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedUrl {
    pub url: String,
    pub url_hash: String,
    pub host: String,
}

/// Query parameters dropped during normalization. These vary per visitor
/// without changing the document.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
];

/// Normalize a URL: lowercase scheme and host, strip the fragment, default
/// ports, tracking query parameters, and a trailing slash on the root path.
pub fn normalize_url(raw: &str) -> Result<NormalizedUrl, NormalizeError> {
    let mut parsed = Url::parse(raw.trim())?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(NormalizeError::UnsupportedScheme(other.to_string())),
    }

    let host = parsed
        .host_str()
        .ok_or(NormalizeError::MissingHost)?
        .to_ascii_lowercase();

    parsed.set_fragment(None);

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let query = kept
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        parsed.set_query(Some(&query));
    }

    let mut url = parsed.to_string();
    // "https://example.com/" and "https://example.com" are the same page.
    if parsed.path() == "/" && parsed.query().is_none() && url.ends_with('/') {
        url.pop();
    }

    Ok(NormalizedUrl {
        url_hash: hash_url(&url),
        url,
        host,
    })
}

/// SHA-256 of the normalized URL, hex-encoded.
pub fn hash_url(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 of a document body, hex-encoded. Used for change detection.
pub fn hash_content(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fragment_and_tracking_params() {
        let a = normalize_url("https://Example.com/news/story?utm_source=x&id=7#top").unwrap();
        let b = normalize_url("https://example.com/news/story?id=7").unwrap();
        assert_eq!(a.url, b.url);
        assert_eq!(a.url_hash, b.url_hash);
        assert_eq!(a.host, "example.com");
    }

    #[test]
    fn root_path_with_and_without_slash_collapse() {
        let a = normalize_url("https://example.com/").unwrap();
        let b = normalize_url("https://example.com").unwrap();
        assert_eq!(a.url_hash, b.url_hash);
    }

    #[test]
    fn default_port_is_dropped() {
        let a = normalize_url("https://example.com:443/page").unwrap();
        let b = normalize_url("https://example.com/page").unwrap();
        assert_eq!(a.url_hash, b.url_hash);
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(matches!(
            normalize_url("ftp://example.com/file"),
            Err(NormalizeError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            normalize_url("mailto:x@example.com"),
            Err(NormalizeError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(normalize_url("not a url").is_err());
    }

    #[test]
    fn distinct_pages_get_distinct_hashes() {
        let a = normalize_url("https://example.com/a").unwrap();
        let b = normalize_url("https://example.com/b").unwrap();
        assert_ne!(a.url_hash, b.url_hash);
    }
}
