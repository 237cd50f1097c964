//! Cache key generation for request identity.

use sha2::{Digest, Sha256};

/// Compute the cache key for a request.
///
/// The key is `cache:<METHOD>:<sha256>`. The hash covers the URL, and for
/// methods other than GET also the request body, so two reads that differ
/// only in their payload never share an entry. Callers pass an already
/// canonicalized URL.
pub fn compute_cache_key(method: &str, url: &str, body: Option<&[u8]>) -> String {
    let method = method.to_ascii_uppercase();
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    if method != "GET"
        && let Some(body) = body
    {
        hasher.update(b"\n");
        hasher.update(body);
    }
    format!("cache:{}:{}", method, hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_stability() {
        let a = compute_cache_key("GET", "https://example.com/api/weather", None);
        let b = compute_cache_key("get", "https://example.com/api/weather", None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_format() {
        let key = compute_cache_key("GET", "https://example.com", None);
        let hash = key.strip_prefix("cache:GET:").unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_get_ignores_body() {
        let without = compute_cache_key("GET", "https://example.com", None);
        let with = compute_cache_key("GET", "https://example.com", Some(b"{}"));
        assert_eq!(without, with);
    }

    #[test]
    fn test_non_get_read_hashes_body() {
        let a = compute_cache_key("POST", "https://example.com/search", Some(b"{\"q\":\"a\"}"));
        let b = compute_cache_key("POST", "https://example.com/search", Some(b"{\"q\":\"b\"}"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_method_is_part_of_key() {
        let get = compute_cache_key("GET", "https://example.com", None);
        let head = compute_cache_key("HEAD", "https://example.com", None);
        assert_ne!(get, head);
    }
}
