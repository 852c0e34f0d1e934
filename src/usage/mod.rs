pub mod audit;
pub mod limiter;
pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

pub use self::audit::{AuditEntry, AuditSink, spawn_audit_logger};
pub use self::limiter::{Admission, RateLimiter};
pub use self::store::UsageStore;

/// Length of one accounting window.
pub const WINDOW_SECS: i64 = 3600;

/// Virtual key -> usage record, as persisted in the usage file.
pub type UsageMap = BTreeMap<String, UsageRecord>;

/// Errors raised by the usage store.
#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("failed to read usage file: {0}")]
    Read(String),

    #[error("failed to parse usage file: {0}")]
    Parse(String),

    #[error("failed to serialize usage map: {0}")]
    Serialize(String),

    #[error("failed to write usage file: {0}")]
    Write(String),

    #[error("usage task failed: {0}")]
    Task(String),
}

/// Per-key request counters for the current window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UsageRecord {
    pub provider: String,
    pub virtual_key: String,
    pub total_request_time_ms: i64,
    pub request_count: u32,
    /// Reserved; always 0.
    #[serde(default)]
    pub tokens_used: i64,
    pub last_reset: DateTime<Utc>,
}

impl UsageRecord {
    /// A first request for `virtual_key`.
    pub fn first(virtual_key: &str, provider: &str, elapsed_ms: i64, now: DateTime<Utc>) -> Self {
        Self {
            provider: provider.to_string(),
            virtual_key: virtual_key.to_string(),
            total_request_time_ms: elapsed_ms,
            request_count: 1,
            tokens_used: 0,
            last_reset: now,
        }
    }

    /// True once more than one window has passed since `last_reset`. An
    /// expired record counts as empty for admission.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_reset) > TimeDelta::seconds(WINDOW_SECS)
    }
}

/// Aggregate view served by `GET /metrics`. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_requests: i64,
    pub requests_per_provider: BTreeMap<String, i64>,
    pub average_response_time_ms: f64,
}

impl Metrics {
    pub fn from_usage(usage: &UsageMap) -> Self {
        let mut total_requests = 0i64;
        let mut total_duration_ms = 0i64;
        let mut requests_per_provider = BTreeMap::new();

        for record in usage.values() {
            let count = i64::from(record.request_count);
            total_requests = total_requests.saturating_add(count);
            let per_provider = requests_per_provider
                .entry(record.provider.clone())
                .or_insert(0i64);
            *per_provider = per_provider.saturating_add(count);
            total_duration_ms = total_duration_ms.saturating_add(record.total_request_time_ms);
        }

        // Integer division first, then widen: 905ms over 10 requests reports 90.0.
        let average_response_time_ms = if total_requests > 0 {
            (total_duration_ms / total_requests) as f64
        } else {
            0.0
        };

        Self {
            total_requests,
            requests_per_provider,
            average_response_time_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(provider: &str, key: &str, count: u32, total_ms: i64) -> UsageRecord {
        UsageRecord {
            provider: provider.to_string(),
            virtual_key: key.to_string(),
            total_request_time_ms: total_ms,
            request_count: count,
            tokens_used: 0,
            last_reset: Utc::now(),
        }
    }

    #[test]
    fn test_record_field_names() {
        let json = serde_json::to_value(record("openai", "vk1", 3, 300)).unwrap();
        let obj = json.as_object().unwrap();
        for field in [
            "Provider",
            "VirtualKey",
            "TotalRequestTimeMs",
            "RequestCount",
            "TokensUsed",
            "LastReset",
        ] {
            assert!(obj.contains_key(field), "missing {field}");
        }
        assert_eq!(obj.len(), 6);
    }

    #[test]
    fn test_last_reset_is_rfc3339_utc_with_nanos() {
        let mut r = record("openai", "vk1", 1, 0);
        r.last_reset = DateTime::parse_from_rfc3339("2025-03-04T05:06:07.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["LastReset"], "2025-03-04T05:06:07.123456789Z");
    }

    #[test]
    fn test_parses_record_without_tokens_used() {
        let json = r#"{
            "Provider": "anthropic",
            "VirtualKey": "vk2",
            "TotalRequestTimeMs": 42,
            "RequestCount": 2,
            "LastReset": "2025-01-01T00:00:00Z"
        }"#;
        let r: UsageRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.tokens_used, 0);
        assert_eq!(r.request_count, 2);
    }

    #[test]
    fn test_is_expired_boundary() {
        let now = Utc::now();
        let mut r = record("openai", "vk1", 100, 0);

        r.last_reset = now - TimeDelta::minutes(10);
        assert!(!r.is_expired(now));

        r.last_reset = now - TimeDelta::seconds(WINDOW_SECS);
        assert!(!r.is_expired(now), "exactly one hour is still inside the window");

        r.last_reset = now - TimeDelta::minutes(61);
        assert!(r.is_expired(now));
    }

    #[test]
    fn test_metrics_aggregation() {
        let usage = UsageMap::from([
            ("vk1".to_string(), record("openai", "vk1", 3, 300)),
            ("vk2".to_string(), record("anthropic", "vk2", 2, 100)),
            ("vk3".to_string(), record("openai", "vk3", 5, 500)),
        ]);

        let metrics = Metrics::from_usage(&usage);
        assert_eq!(metrics.total_requests, 10);
        assert_eq!(metrics.requests_per_provider["openai"], 8);
        assert_eq!(metrics.requests_per_provider["anthropic"], 2);
        assert_eq!(metrics.average_response_time_ms, 90.0);
    }

    #[test]
    fn test_metrics_average_truncates() {
        let usage = UsageMap::from([("vk1".to_string(), record("openai", "vk1", 3, 100))]);
        let metrics = Metrics::from_usage(&usage);
        assert_eq!(metrics.average_response_time_ms, 33.0);
    }

    #[test]
    fn test_metrics_saturate_on_huge_totals() {
        let usage = UsageMap::from([
            ("vk1".to_string(), record("openai", "vk1", 1, i64::MAX)),
            ("vk2".to_string(), record("openai", "vk2", 1, i64::MAX)),
        ]);
        let metrics = Metrics::from_usage(&usage);
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.average_response_time_ms, (i64::MAX / 2) as f64);
    }

    #[test]
    fn test_metrics_empty() {
        let metrics = Metrics::from_usage(&UsageMap::new());
        assert_eq!(metrics.total_requests, 0);
        assert!(metrics.requests_per_provider.is_empty());
        assert_eq!(metrics.average_response_time_ms, 0.0);

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["average_response_time_ms"], 0.0);
    }

    proptest! {
        #[test]
        fn usage_map_survives_serialization(
            entries in proptest::collection::btree_map(
                "[a-z0-9_]{1,12}",
                (
                    prop_oneof![Just("openai"), Just("anthropic")],
                    0u32..10_000,
                    0i64..10_000_000,
                    0i64..4_000_000_000,
                    0u32..1_000_000_000,
                ),
                0..8,
            )
        ) {
            let usage: UsageMap = entries
                .into_iter()
                .map(|(key, (provider, count, total_ms, secs, nanos))| {
                    let record = UsageRecord {
                        provider: provider.to_string(),
                        virtual_key: key.clone(),
                        total_request_time_ms: total_ms,
                        request_count: count,
                        tokens_used: 0,
                        last_reset: DateTime::from_timestamp(secs, nanos).unwrap(),
                    };
                    (key, record)
                })
                .collect();

            let text = serde_json::to_string_pretty(&usage).unwrap();
            let parsed: UsageMap = serde_json::from_str(&text).unwrap();
            prop_assert_eq!(parsed, usage);
        }
    }
}
