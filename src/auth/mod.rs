pub mod keys;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

pub use self::keys::{KeyRecord, KeyStore};

const BEARER_SCHEME: &str = "bearer ";

/// A resolved virtual key together with the provider credentials behind it.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub virtual_key: String,
    pub record: KeyRecord,
}

impl Credentials {
    pub fn provider(&self) -> &str {
        &self.record.provider_id
    }
}

/// Extract the Bearer token from the Authorization header.
///
/// The scheme is matched case-insensitively and the remainder is trimmed.
/// Missing headers, other schemes and empty tokens all yield `None`.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;

    let scheme = value.get(..BEARER_SCHEME.len())?;
    if !scheme.eq_ignore_ascii_case(BEARER_SCHEME) {
        return None;
    }

    let token = value[BEARER_SCHEME.len()..].trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Shorten a key for log output, e.g. `vk-abc...`.
pub fn mask_key(key: &str) -> String {
    let visible: String = key.chars().take(6).collect();
    if visible.len() < key.len() {
        format!("{visible}...")
    } else {
        "***".to_string()
    }
}
