pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod net;
pub mod providers;
pub mod usage;

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::auth::KeyStore;
use crate::config::Config;
use crate::net::HttpClient;
use crate::providers::{HealthProber, ProviderError, ProviderTable, UpstreamClient};
use crate::usage::{AuditEntry, RateLimiter, UsageStore};

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub keys: Arc<KeyStore>,
    pub usage: Arc<UsageStore>,
    pub limiter: Arc<RateLimiter>,
    pub upstream: Arc<UpstreamClient>,
    pub health: Arc<HealthProber>,
    pub audit_tx: UnboundedSender<AuditEntry>,
}

impl AppState {
    /// Wire stores and clients from configuration. Does not touch the usage
    /// file; call [`UsageStore::initialize`] first.
    pub fn from_config(
        config: Config,
        audit_tx: UnboundedSender<AuditEntry>,
    ) -> Result<Self, ProviderError> {
        let table = Arc::new(ProviderTable::new(config.providers.clone()));

        let upstream_http = HttpClient::builder(config.limits.upstream_timeout())
            .build()
            .map_err(|e| ProviderError::Client(e.to_string()))?;
        let health_http = HttpClient::builder(config.limits.health_timeout())
            .build()
            .map_err(|e| ProviderError::Client(e.to_string()))?;

        let usage = Arc::new(UsageStore::new(
            config.storage.usage_path.clone(),
            config.limits.window,
        ));
        let limiter = Arc::new(RateLimiter::new(
            Arc::clone(&usage),
            config.limits.max_requests_per_hour,
        ));

        Ok(Self {
            keys: Arc::new(KeyStore::new(config.storage.keys_path.clone())),
            usage,
            limiter,
            upstream: Arc::new(UpstreamClient::new(upstream_http, Arc::clone(&table))),
            health: Arc::new(HealthProber::new(health_http, table)),
            audit_tx,
            config: Arc::new(config),
        })
    }
}
