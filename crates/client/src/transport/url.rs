//! URL canonicalization for consistent cache identity.

/// Error type for URL canonicalization failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UrlError {
    #[error("empty URL")]
    Empty,

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<UrlError> for harbor_core::Error {
    fn from(err: UrlError) -> Self {
        harbor_core::Error::InvalidUrl(err.to_string())
    }
}

/// Canonicalize a URL string so equivalent requests share one cache key.
///
/// Normalization steps:
/// 1. Trim leading/trailing whitespace
/// 2. Default scheme to https:// if missing
/// 3. Lowercase the host
/// 4. Remove fragment (#...)
/// 5. Sort query parameters by name, keeping the relative order of repeats
pub fn canonicalize(input: &str) -> Result<url::Url, UrlError> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }

    let url_str = if trimmed.contains("://") { trimmed.to_string() } else { format!("https://{trimmed}") };

    let mut parsed = url::Url::parse(&url_str).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlError::UnsupportedScheme(scheme.to_string())),
    }

    if let Some(host) = parsed.host_str() {
        let host = host.to_lowercase();
        parsed
            .set_host(Some(&host))
            .map_err(|e| UrlError::InvalidUrl(e.to_string()))?;
    }

    parsed.set_fragment(None);

    let mut pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        parsed.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_basic() {
        let url = canonicalize("https://example.com").unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.host_str(), Some("example.com"));
    }

    #[test]
    fn test_canonicalize_default_scheme() {
        let url = canonicalize("example.com/api/notices").unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.path(), "/api/notices");
    }

    #[test]
    fn test_canonicalize_lowercase_host() {
        let url = canonicalize("https://EXAMPLE.COM/Path").unwrap();
        assert_eq!(url.host_str(), Some("example.com"));
        assert_eq!(url.path(), "/Path");
    }

    #[test]
    fn test_canonicalize_remove_fragment() {
        let url = canonicalize("https://example.com#section").unwrap();
        assert_eq!(url.fragment(), None);
        assert_eq!(url.as_str(), "https://example.com/");
    }

    #[test]
    fn test_canonicalize_sorts_query() {
        let a = canonicalize("https://example.com/api?page=2&block=B").unwrap();
        let b = canonicalize("https://example.com/api?block=B&page=2").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.query(), Some("block=B&page=2"));
    }

    #[test]
    fn test_canonicalize_keeps_repeated_key_order() {
        let url = canonicalize("https://example.com/?tag=b&id=1&tag=a").unwrap();
        assert_eq!(url.query(), Some("id=1&tag=b&tag=a"));
    }

    #[test]
    fn test_canonicalize_drops_empty_query() {
        let url = canonicalize("https://example.com/?").unwrap();
        assert_eq!(url.query(), None);
    }

    #[test]
    fn test_canonicalize_trim_whitespace() {
        let url = canonicalize("  https://example.com  ").unwrap();
        assert_eq!(url.as_str(), "https://example.com/");
    }

    #[test]
    fn test_canonicalize_unsupported_scheme() {
        let result = canonicalize("file:///etc/passwd");
        assert!(matches!(result, Err(UrlError::UnsupportedScheme(_))));
    }

    #[test]
    fn test_canonicalize_empty() {
        assert!(matches!(canonicalize(""), Err(UrlError::Empty)));
        assert!(matches!(canonicalize("   "), Err(UrlError::Empty)));
    }

    #[test]
    fn test_url_error_into_core_error() {
        let err: harbor_core::Error = canonicalize("").unwrap_err().into();
        assert!(matches!(err, harbor_core::Error::InvalidUrl(_)));
    }
}
