use std::sync::Arc;

use axum::body::Bytes;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, HOST, HeaderMap, HeaderName, HeaderValue};

use crate::net::HttpClient;
use crate::providers::{ProviderError, ProviderTable};

/// Connection-scoped headers that must not be forwarded in either direction.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Client headers to send upstream. Credentials, host and framing headers are
/// dropped; the client's `Content-Type` passes through untouched.
pub fn forward_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut outbound = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if name == AUTHORIZATION || name == HOST || name == CONTENT_LENGTH || is_hop_by_hop(name) {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }
    outbound
}

/// A fully read provider response.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Sends chat requests to the provider a virtual key resolves to.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: HttpClient,
    table: Arc<ProviderTable>,
}

impl UpstreamClient {
    pub fn new(http: HttpClient, table: Arc<ProviderTable>) -> Self {
        Self { http, table }
    }

    /// POST `body` to the provider's chat URL with the provider API key.
    ///
    /// No retries. The client timeout covers the body read.
    pub async fn dispatch(
        &self,
        provider_id: &str,
        inbound: &HeaderMap,
        api_key: &str,
        body: Bytes,
    ) -> Result<UpstreamResponse, ProviderError> {
        let url = self
            .table
            .chat_url(provider_id)
            .ok_or_else(|| ProviderError::UnknownProvider(provider_id.to_string()))?;

        let mut headers = forward_headers(inbound);
        let auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| ProviderError::Client(format!("invalid provider API key: {e}")))?;
        headers.insert(AUTHORIZATION, auth);

        tracing::debug!(provider = provider_id, url, bytes = body.len(), "Dispatching to provider");

        let response = self
            .http
            .inner()
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Body(e.to_string()))?;

        tracing::debug!(provider = provider_id, status = status.as_u16(), bytes = body.len(), "Provider responded");

        Ok(UpstreamResponse { status, headers, body })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
