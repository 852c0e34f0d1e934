use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::usage::{UsageError, UsageRecord, UsageStore};

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// The key has used its hourly allowance; answer 429.
    Deny,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        self == Self::Admit
    }
}

/// Per-key hourly request limiter over the usage store.
///
/// The check does not reserve a slot: a burst of concurrent requests for the
/// same key can all be admitted before any of them commits.
#[derive(Debug)]
pub struct RateLimiter {
    store: Arc<UsageStore>,
    max_requests_per_hour: u32,
}

impl RateLimiter {
    pub fn new(store: Arc<UsageStore>, max_requests_per_hour: u32) -> Self {
        Self {
            store,
            max_requests_per_hour,
        }
    }

    /// Decide whether `virtual_key` may send another request to `provider`.
    pub async fn may_admit(
        &self,
        virtual_key: &str,
        provider: &str,
    ) -> Result<Admission, UsageError> {
        let record = self.store.read_for_key_async(virtual_key).await?;
        let admission = decide(record.as_ref(), provider, self.max_requests_per_hour, Utc::now());

        if admission == Admission::Deny {
            tracing::info!(
                provider,
                limit = self.max_requests_per_hour,
                "Rate limit reached"
            );
        }
        Ok(admission)
    }
}

/// Pure admission rule.
///
/// No record, a record for another provider, or an expired record all admit.
/// Otherwise the key is admitted while its count is under `max`.
pub fn decide(
    record: Option<&UsageRecord>,
    provider: &str,
    max: u32,
    now: DateTime<Utc>,
) -> Admission {
    let Some(record) = record else {
        return Admission::Admit;
    };
    if record.provider != provider || record.is_expired(now) {
        return Admission::Admit;
    }
    if record.request_count >= max {
        Admission::Deny
    } else {
        Admission::Admit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowMode;
    use chrono::TimeDelta;

    fn record(provider: &str, count: u32, last_reset: DateTime<Utc>) -> UsageRecord {
        UsageRecord {
            provider: provider.to_string(),
            virtual_key: "vk1".to_string(),
            total_request_time_ms: 0,
            request_count: count,
            tokens_used: 0,
            last_reset,
        }
    }

    #[test]
    fn test_no_record_admits() {
        assert_eq!(decide(None, "openai", 100, Utc::now()), Admission::Admit);
    }

    #[test]
    fn test_under_limit_admits() {
        let now = Utc::now();
        let r = record("openai", 99, now - TimeDelta::minutes(5));
        assert_eq!(decide(Some(&r), "openai", 100, now), Admission::Admit);
    }

    #[test]
    fn test_at_limit_denies() {
        let now = Utc::now();
        let r = record("openai", 100, now - TimeDelta::minutes(10));
        assert_eq!(decide(Some(&r), "openai", 100, now), Admission::Deny);
        assert!(!Admission::Deny.is_admitted());
    }

    #[test]
    fn test_expired_record_admits() {
        let now = Utc::now();
        let r = record("openai", 100, now - TimeDelta::minutes(61));
        assert_eq!(decide(Some(&r), "openai", 100, now), Admission::Admit);
    }

    #[test]
    fn test_provider_mismatch_admits() {
        let now = Utc::now();
        let r = record("anthropic", 500, now);
        assert_eq!(decide(Some(&r), "openai", 100, now), Admission::Admit);
    }

    #[test]
    fn test_custom_limit() {
        let now = Utc::now();
        let r = record("openai", 3, now);
        assert_eq!(decide(Some(&r), "openai", 3, now), Admission::Deny);
        assert_eq!(decide(Some(&r), "openai", 4, now), Admission::Admit);
    }

    #[tokio::test]
    async fn test_hundred_and_first_request_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(UsageStore::new(
            dir.path().join("usage.json"),
            WindowMode::Floating,
        ));
        let limiter = RateLimiter::new(Arc::clone(&store), 100);

        for i in 0..100 {
            assert!(
                limiter.may_admit("vk1", "openai").await.unwrap().is_admitted(),
                "request {} should be admitted",
                i + 1
            );
            store.commit_request_async("vk1", "openai", 5).await.unwrap();
        }
        assert_eq!(limiter.may_admit("vk1", "openai").await.unwrap(), Admission::Deny);
        // Same key, other provider.
        assert_eq!(
            limiter.may_admit("vk1", "anthropic").await.unwrap(),
            Admission::Admit
        );
    }

    #[tokio::test]
    async fn test_corrupt_usage_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");
        std::fs::write(&path, "[").unwrap();
        let store = Arc::new(UsageStore::new(path, WindowMode::Floating));
        let limiter = RateLimiter::new(store, 100);
        assert!(limiter.may_admit("vk1", "openai").await.is_err());
    }
}
