//! `POST /chat/completion`
//!
//! The request moves through fixed stages: validate, authenticate, admit,
//! dispatch, relay, record, audit. Everything from dispatch on runs in a
//! spawned task, so a client that hangs up does not cancel the upstream call
//! or the usage commit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderMap, Method};
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::AppState;
use crate::auth::{self, Credentials, KeyStore, mask_key};
use crate::error::AppError;
use crate::providers::upstream::is_hop_by_hop;
use crate::providers::{UpstreamClient, UpstreamResponse};
use crate::usage::audit::{embed_payload, format_timestamp};
use crate::usage::{AuditEntry, RateLimiter, UsageStore};

/// Largest request body accepted.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// The shallow view of a chat request the gateway validates.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatRequestBody {
    pub prompt: String,
}

/// Per-request state carried from validation to audit.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub started_at: DateTime<Utc>,
    pub start: Instant,
    pub method: Method,
    pub headers: HeaderMap,
    /// Bytes sent upstream.
    pub body: Bytes,
}

pub async fn chat_completion(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, AppError> {
    let started_at = Utc::now();
    let start = Instant::now();
    let (parts, body) = request.into_parts();

    let request_id = parts
        .headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    validate_method(&parts.method)?;
    let raw = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| AppError::BadRequest(format!("failed to read request body: {e}")))?;
    let body = validate_body(raw, state.config.gateway.forward_original_body)?;

    let creds = authenticate(&parts.headers, &state.keys).await?;
    admit(&state.limiter, &creds).await?;

    tracing::info!(
        request_id = %request_id,
        virtual_key = %mask_key(&creds.virtual_key),
        provider = creds.provider(),
        "Chat completion request"
    );

    let ctx = RequestContext {
        request_id,
        started_at,
        start,
        method: parts.method,
        headers: parts.headers,
        body,
    };

    tokio::spawn(forward(state, ctx, creds))
        .await
        .map_err(|e| AppError::Internal(format!("request task failed: {e}")))?
}

/// Dispatch through audit. Runs detached from the client connection.
async fn forward(state: AppState, ctx: RequestContext, creds: Credentials) -> Result<Response, AppError> {
    let budget = state.config.limits.request_timeout();
    let upstream = match dispatch(&state.upstream, &ctx, &creds, budget).await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!(
                request_id = %ctx.request_id,
                provider = creds.provider(),
                error = %e,
                "Chat completion failed"
            );
            return Err(e);
        }
    };

    let elapsed_ms = i64::try_from(ctx.start.elapsed().as_millis()).unwrap_or(i64::MAX);
    let status = upstream.status.as_u16();
    let response_body = upstream.body.clone();

    let response = relay(upstream);

    record(&state.usage, &creds, elapsed_ms).await;
    emit_audit(&state.audit_tx, &ctx, &creds, status, elapsed_ms, &response_body);

    tracing::info!(
        request_id = %ctx.request_id,
        provider = creds.provider(),
        status,
        latency_ms = elapsed_ms,
        "Chat completion finished"
    );
    Ok(response)
}

pub fn validate_method(method: &Method) -> Result<(), AppError> {
    if *method != Method::POST {
        return Err(AppError::BadRequest("only POST method allowed".to_string()));
    }
    Ok(())
}

/// Check the body is `{"prompt": string}` and return the bytes to forward:
/// either the original bytes or the re-serialized shallow view.
pub fn validate_body(raw: Bytes, forward_original: bool) -> Result<Bytes, AppError> {
    let parsed: ChatRequestBody = serde_json::from_slice(&raw)
        .map_err(|e| AppError::BadRequest(format!("invalid JSON: {e}")))?;

    if forward_original {
        return Ok(raw);
    }
    let body = serde_json::to_vec(&parsed)
        .map_err(|e| AppError::Internal(format!("failed to encode request body: {e}")))?;
    Ok(Bytes::from(body))
}

pub async fn authenticate(
    headers: &HeaderMap,
    keys: &Arc<KeyStore>,
) -> Result<Credentials, AppError> {
    let virtual_key = auth::bearer_token(headers).ok_or(AppError::Unauthorized)?;
    let record = keys
        .resolve_async(&virtual_key)
        .await
        .ok_or(AppError::Unauthorized)?;
    Ok(Credentials { virtual_key, record })
}

pub async fn admit(limiter: &RateLimiter, creds: &Credentials) -> Result<(), AppError> {
    if limiter
        .may_admit(&creds.virtual_key, creds.provider())
        .await?
        .is_admitted()
    {
        Ok(())
    } else {
        Err(AppError::RateLimited)
    }
}

/// Call the provider within `budget`. On timeout the in-flight call is dropped.
pub async fn dispatch(
    upstream: &UpstreamClient,
    ctx: &RequestContext,
    creds: &Credentials,
    budget: Duration,
) -> Result<UpstreamResponse, AppError> {
    let call = upstream.dispatch(
        creds.provider(),
        &ctx.headers,
        &creds.record.api_key,
        ctx.body.clone(),
    );
    match tokio::time::timeout(budget, call).await {
        Ok(result) => result.map_err(AppError::from),
        Err(_) => Err(AppError::UpstreamTimeout),
    }
}

/// Build the client response from the provider's status, headers and body.
pub fn relay(upstream: UpstreamResponse) -> Response {
    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;

    let headers = response.headers_mut();
    for (name, value) in &upstream.headers {
        if name == CONTENT_LENGTH || is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    response
}

/// Commit usage for a completed request. Failures are logged only; the
/// response has already been decided.
pub async fn record(usage: &Arc<UsageStore>, creds: &Credentials, elapsed_ms: i64) {
    if let Err(e) = usage
        .commit_request_async(&creds.virtual_key, creds.provider(), elapsed_ms)
        .await
    {
        tracing::error!(
            virtual_key = %mask_key(&creds.virtual_key),
            provider = creds.provider(),
            error = %e,
            "Failed to track usage"
        );
    }
}

pub fn emit_audit(
    tx: &UnboundedSender<AuditEntry>,
    ctx: &RequestContext,
    creds: &Credentials,
    status: u16,
    duration_ms: i64,
    response_body: &[u8],
) {
    let entry = AuditEntry {
        timestamp: format_timestamp(ctx.started_at),
        virtual_key: creds.virtual_key.clone(),
        provider: creds.provider().to_string(),
        method: ctx.method.to_string(),
        status,
        duration_ms,
        request: embed_payload(&ctx.body),
        response: embed_payload(response_body),
    };
    if tx.send(entry).is_err() {
        tracing::warn!(request_id = %ctx.request_id, "Audit logger is gone; entry dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;
    use axum::http::{HeaderValue, StatusCode};

    use crate::auth::KeyRecord;

    fn creds() -> Credentials {
        Credentials {
            virtual_key: "vk1".to_string(),
            record: KeyRecord {
                provider_id: "openai".to_string(),
                api_key: "sk-test".to_string(),
            },
        }
    }

    #[test]
    fn test_validate_method() {
        assert!(validate_method(&Method::POST).is_ok());
        let err = validate_method(&Method::GET).unwrap_err();
        assert_eq!(err.to_string(), "only POST method allowed");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_validate_body_reserializes() {
        let raw = Bytes::from_static(br#"{ "prompt" : "hi", "model": "gpt-4o" }"#);
        let body = validate_body(raw, false).unwrap();
        assert_eq!(&body[..], br#"{"prompt":"hi"}"#);
    }

    #[test]
    fn test_validate_body_forwards_original() {
        let raw = Bytes::from_static(br#"{ "prompt" : "hi", "model": "gpt-4o" }"#);
        let body = validate_body(raw.clone(), true).unwrap();
        assert_eq!(body, raw);
    }

    #[test]
    fn test_validate_body_rejects_bad_json() {
        let err = validate_body(Bytes::from_static(b"not json"), false).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(ref m) if m.starts_with("invalid JSON: ")));

        let err = validate_body(Bytes::from_static(br#"{"prompt": 42}"#), false).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let err = validate_body(Bytes::from_static(br#"{}"#), false).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_authenticate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(
            &path,
            r#"{"virtual_keys": {"vk1": {"provider": "openai", "api_key": "sk-test"}}}"#,
        )
        .unwrap();
        let keys = Arc::new(KeyStore::new(path));

        let mut headers = HeaderMap::new();
        assert!(matches!(
            authenticate(&headers, &keys).await,
            Err(AppError::Unauthorized)
        ));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert!(matches!(
            authenticate(&headers, &keys).await,
            Err(AppError::Unauthorized)
        ));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer vk1"));
        let creds = authenticate(&headers, &keys).await.unwrap();
        assert_eq!(creds.provider(), "openai");
        assert_eq!(creds.record.api_key, "sk-test");
    }

    #[test]
    fn test_relay_copies_status_headers_and_body() {
        let mut headers = HeaderMap::new();
        headers.insert("x-upstream", HeaderValue::from_static("yes"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("11"));

        let response = relay(UpstreamResponse {
            status: StatusCode::IM_A_TEAPOT,
            headers,
            body: Bytes::from_static(br#"{"ok":true}"#),
        });

        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(response.headers()["x-upstream"], "yes");
        assert!(response.headers().get("transfer-encoding").is_none());
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
    }

    #[test]
    fn test_emit_audit_entry() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = RequestContext {
            request_id: "req-1".to_string(),
            started_at: DateTime::parse_from_rfc3339("2025-03-04T05:06:07.5Z")
                .unwrap()
                .with_timezone(&Utc),
            start: Instant::now(),
            method: Method::POST,
            headers: HeaderMap::new(),
            body: Bytes::from_static(br#"{"prompt":"hi"}"#),
        };

        emit_audit(&tx, &ctx, &creds(), 200, 12, br#"{"ok":true}"#);

        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.timestamp, "2025-03-04T05:06:07.500Z");
        assert_eq!(entry.method, "POST");
        assert_eq!(entry.status, 200);
        assert_eq!(entry.request.get(), r#"{"prompt":"hi"}"#);
        assert_eq!(entry.response.get(), r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn test_record_survives_store_failure() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every read fail.
        let store = Arc::new(UsageStore::new(
            dir.path(),
            crate::config::WindowMode::Floating,
        ));
        record(&store, &creds(), 10).await;
    }
}
