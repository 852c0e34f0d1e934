//! Upstream LLM providers.
//!
//! Providers are plain data: an id plus the URLs to call. The table is built
//! once from configuration and shared read-only.

pub mod health;
pub mod upstream;

use std::collections::BTreeMap;

use crate::config::ProviderEndpoint;

pub use self::health::{HealthProber, HealthReport};
pub use self::upstream::{UpstreamClient, UpstreamResponse};

/// Errors that can occur while talking to a provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("no endpoint configured for provider '{0}'")]
    UnknownProvider(String),

    #[error("failed to read provider response: {0}")]
    Body(String),

    #[error("HTTP client error: {0}")]
    Client(String),
}

/// Immutable provider id -> endpoint table.
#[derive(Debug, Clone, Default)]
pub struct ProviderTable {
    endpoints: BTreeMap<String, ProviderEndpoint>,
}

impl ProviderTable {
    pub fn new(endpoints: BTreeMap<String, ProviderEndpoint>) -> Self {
        Self { endpoints }
    }

    pub fn chat_url(&self, provider_id: &str) -> Option<&str> {
        self.endpoints.get(provider_id).map(|e| e.chat_url.as_str())
    }

    pub fn health_url(&self, provider_id: &str) -> Option<&str> {
        self.endpoints
            .get(provider_id)
            .and_then(|e| e.health_url.as_deref())
    }
}
