//! Provider key: a fingerprint of everything that can change embeddings.
//!
//! Two connections to the same model through different endpoints or with
//! different non-secret headers are not guaranteed to produce identical
//! vectors, so the key covers provider id, base URL, model, and headers.
//! Credentials are excluded so rotating an API key does not invalidate the
//! cache.

use serde::Serialize;
use std::collections::BTreeMap;

use memory_index_core::chunk::hash_text;

/// Headers never folded into the key.
const SECRET_HEADERS: [&str; 2] = ["authorization", "x-goog-api-key"];

#[derive(Serialize)]
struct KeyMaterial<'a> {
    provider: &'a str,
    #[serde(rename = "baseUrl", skip_serializing_if = "Option::is_none")]
    base_url: Option<&'a str>,
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<Vec<(String, &'a str)>>,
}

/// SHA-256 hex of the provider's connection identity.
///
/// `base_url` and `headers` are `None` for providers without a network
/// connection (in-process models).
pub fn compute_provider_key(
    provider: &str,
    base_url: Option<&str>,
    model: &str,
    headers: Option<&BTreeMap<String, String>>,
) -> String {
    let headers = headers.map(|h| {
        let mut kept: Vec<(String, &str)> = h
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.as_str()))
            .filter(|(k, _)| !SECRET_HEADERS.contains(&k.as_str()))
            .collect();
        kept.sort();
        kept
    });
    let material = KeyMaterial {
        provider,
        base_url,
        model,
        headers,
    };
    // Serializing plain strings and tuples cannot fail.
    let json = serde_json::to_string(&material).unwrap_or_default();
    hash_text(&json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_auth_headers_ignored() {
        let a = headers(&[("Authorization", "Bearer one"), ("X-Team", "core")]);
        let b = headers(&[("authorization", "Bearer two"), ("X-Team", "core")]);
        let c = headers(&[("X-Goog-Api-Key", "zzz"), ("x-team", "core")]);
        let ka = compute_provider_key("openai", Some("https://api"), "m", Some(&a));
        let kb = compute_provider_key("openai", Some("https://api"), "m", Some(&b));
        let kc = compute_provider_key("openai", Some("https://api"), "m", Some(&c));
        assert_eq!(ka, kb);
        assert_eq!(ka, kc);
    }

    #[test]
    fn test_connection_changes_key() {
        let h = headers(&[("X-Team", "core")]);
        let base = compute_provider_key("openai", Some("https://a"), "m", Some(&h));
        assert_ne!(base, compute_provider_key("openai", Some("https://b"), "m", Some(&h)));
        assert_ne!(base, compute_provider_key("openai", Some("https://a"), "m2", Some(&h)));
        assert_ne!(base, compute_provider_key("gemini", Some("https://a"), "m", Some(&h)));
        let other = headers(&[("X-Team", "infra")]);
        assert_ne!(base, compute_provider_key("openai", Some("https://a"), "m", Some(&other)));
    }

    #[test]
    fn test_key_is_hex_sha256() {
        let key = compute_provider_key("local", None, "nomic-embed-text", None);
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
