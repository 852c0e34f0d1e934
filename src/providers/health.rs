//! Provider availability probe.
//!
//! A probe is a single GET against the provider's health URL. Transport
//! failures and 5xx answers both count as unavailable; anything else,
//! including 4xx from an unauthenticated models endpoint, counts as up.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::net::HttpClient;
use crate::providers::ProviderTable;
use crate::usage::audit::format_timestamp;

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub provider: String,
    pub available: bool,
    /// Upstream status, absent on transport error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct HealthProber {
    http: HttpClient,
    table: Arc<ProviderTable>,
}

impl HealthProber {
    pub fn new(http: HttpClient, table: Arc<ProviderTable>) -> Self {
        Self { http, table }
    }

    /// Probe `provider`. Returns `None` when it has no health URL.
    pub async fn probe(&self, provider: &str) -> Option<HealthReport> {
        let url = self.table.health_url(provider)?;

        let status = match self.http.inner().get(url).send().await {
            Ok(response) => Some(response.status().as_u16()),
            Err(e) => {
                tracing::warn!(provider, error = %e, "Health probe failed");
                None
            }
        };
        let available = status.is_some_and(|s| s < 500);

        tracing::info!(
            timestamp = %format_timestamp(Utc::now()),
            provider,
            available,
            status,
            "Provider health"
        );

        Some(HealthReport {
            provider: provider.to_string(),
            available,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::config::ProviderEndpoint;

    fn prober_for(health_url: String) -> HealthProber {
        let table = ProviderTable::new(BTreeMap::from([(
            "openai".to_string(),
            ProviderEndpoint {
                chat_url: "http://127.0.0.1:1/unused".to_string(),
                health_url: Some(health_url),
            },
        )]));
        let http = HttpClient::builder(Duration::from_secs(2)).build().unwrap();
        HealthProber::new(http, Arc::new(table))
    }

    async fn server_answering(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_probe_ok() {
        let server = server_answering(200).await;
        let report = prober_for(format!("{}/status", server.uri()))
            .probe("openai")
            .await
            .unwrap();
        assert!(report.available);
        assert_eq!(report.status, Some(200));
    }

    #[tokio::test]
    async fn test_probe_client_error_counts_as_available() {
        let server = server_answering(401).await;
        let report = prober_for(format!("{}/status", server.uri()))
            .probe("openai")
            .await
            .unwrap();
        assert!(report.available);
    }

    #[tokio::test]
    async fn test_probe_server_error_is_unavailable() {
        let server = server_answering(503).await;
        let report = prober_for(format!("{}/status", server.uri()))
            .probe("openai")
            .await
            .unwrap();
        assert!(!report.available);
        assert_eq!(report.status, Some(503));
    }

    #[tokio::test]
    async fn test_probe_transport_error_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/status", listener.local_addr().unwrap());
        drop(listener);

        let report = prober_for(url).probe("openai").await.unwrap();
        assert!(!report.available);
        assert_eq!(report.status, None);
    }

    #[tokio::test]
    async fn test_probe_unknown_provider() {
        let prober = prober_for("http://127.0.0.1:1/status".to_string());
        assert!(prober.probe("mistral").await.is_none());
    }
}
