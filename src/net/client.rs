use std::time::Duration;

use reqwest::{Client, ClientBuilder};

/// User agent sent on every outbound request.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Default connection timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Cloneable handle to a configured `reqwest` client.
///
/// Clones share one connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
}

impl HttpClient {
    pub fn builder(timeout: Duration) -> HttpClientBuilder {
        HttpClientBuilder::new(timeout)
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }
}

/// Builder for [`HttpClient`].
pub struct HttpClientBuilder {
    builder: ClientBuilder,
}

impl HttpClientBuilder {
    fn new(timeout: Duration) -> Self {
        Self {
            builder: Client::builder()
                .user_agent(USER_AGENT)
                .connect_timeout(CONNECT_TIMEOUT.min(timeout))
                .timeout(timeout),
        }
    }

    /// Build the client. Fails only if the TLS backend cannot initialize.
    pub fn build(self) -> Result<HttpClient, reqwest::Error> {
        let inner = self.builder.build()?;
        Ok(HttpClient { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_names_the_crate() {
        assert!(USER_AGENT.starts_with("llm-gateway/"));
    }

    #[test]
    fn test_build_with_short_timeout() {
        // Connect timeout is clamped to the overall budget.
        assert!(HttpClient::builder(Duration::from_millis(500)).build().is_ok());
    }
}
