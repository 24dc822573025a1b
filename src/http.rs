use std::time::Duration;

use reqwest::{header::HeaderMap, Method, StatusCode};

use crate::{
    errors::{APIError, Error, RetryMetadata},
    REQUEST_ID_HEADER,
};

/// Remote codes that reject a specific call rather than the caller's session.
const CALL_ERROR_CODES: &[&str] = &[
    "INVALID_PHONE",
    "DND_BLOCKED",
    "POLICY_VIOLATION",
    "INSUFFICIENT_DETAIL",
    "SUBSCRIPTION_REQUIRED",
    "INSUFFICIENT_CREDITS",
    "ACCESS_DENIED",
    "NOT_FOUND",
];

/// Retry/backoff configuration for single HTTP requests.
///
/// Defaults use 3 attempts with jittered exponential backoff for reads. Call
/// creation is not idempotent, so POST requests are never retried unless
/// `retry_post` is set. Rate limiting (429) is always surfaced to the caller.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub retry_post: bool,
}

impl RetryConfig {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Whether the given status code should trigger a retry for this method.
    pub fn should_retry_status(&self, method: &Method, status: StatusCode) -> bool {
        if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
            return self.allow_for_method(method);
        }
        false
    }

    /// Whether the given transport error should trigger a retry.
    pub fn should_retry_error(&self, method: &Method, err: &reqwest::Error) -> bool {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return self.allow_for_method(method);
        }
        false
    }

    /// Jittered exponential backoff for the given attempt (1-indexed).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = if attempt == 0 {
            0
        } else {
            (attempt - 1).min(10)
        };
        let base = self.base_backoff.saturating_mul(2u32.saturating_pow(exp));
        let capped = std::cmp::min(base, self.max_backoff);
        let jitter = 0.5 + fastrand::f64(); // 0.5x .. 1.5x
        let seconds = (capped.as_secs_f64() * jitter).min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(seconds)
    }

    fn allow_for_method(&self, method: &Method) -> bool {
        if method == Method::POST {
            return self.retry_post;
        }
        true
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(5),
            retry_post: false,
        }
    }
}

pub(crate) fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Seconds-form `Retry-After`; HTTP-date values are ignored.
pub(crate) fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a remote error envelope onto the SDK taxonomy.
///
/// 401 and expired/missing token codes are authorization failures, 429 and
/// `RATE_LIMITED` are rate limits, call-specific rejection codes are policy
/// violations. Everything else stays a plain API error.
pub(crate) fn classify_api_error(api: APIError) -> Error {
    let code = api.code.as_deref().unwrap_or_default();
    if api.status == 401 || code == "TOKEN_EXPIRED" || code == "AUTH_REQUIRED" {
        return Error::Auth(api);
    }
    if api.status == 429 || code == "RATE_LIMITED" {
        return Error::RateLimited(api);
    }
    if CALL_ERROR_CODES.contains(&code) {
        return Error::Policy(api);
    }
    Error::Api(api)
}

/// Parse the `{"error": {"code", "message"}}` envelope out of a JSON value.
pub(crate) fn api_error_from_value(status: u16, value: &serde_json::Value) -> Option<APIError> {
    let err_obj = value.get("error").and_then(|v| v.as_object())?;
    let code = err_obj
        .get("code")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let message = err_obj
        .get("message")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("HTTP {status}"));
    let status = err_obj
        .get("status")
        .and_then(|v| v.as_u64())
        .map(|v| v as u16)
        .unwrap_or(status);
    Some(APIError {
        status,
        code,
        message,
        request_id: value
            .get("request_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        retry_after: None,
        retries: None,
        raw_body: None,
    })
}

pub(crate) fn parse_api_error_parts(
    status: StatusCode,
    headers: &HeaderMap,
    body: String,
    retries: Option<RetryMetadata>,
) -> Error {
    let request_id = request_id_from_headers(headers);
    let retry_after = retry_after_from_headers(headers);
    let status_code = status.as_u16();

    let parsed = if body.trim().is_empty() {
        None
    } else {
        serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|value| api_error_from_value(status_code, &value))
    };

    let api = match parsed {
        Some(mut api) => {
            api.request_id = api.request_id.or(request_id);
            api.retry_after = retry_after;
            api.retries = retries;
            api.raw_body = Some(body);
            api
        }
        None => APIError {
            status: status_code,
            code: None,
            message: status
                .canonical_reason()
                .map(|reason| reason.to_string())
                .unwrap_or_else(|| format!("HTTP {status_code}")),
            request_id,
            retry_after,
            retries,
            raw_body: if body.is_empty() { None } else { Some(body) },
        },
    };
    classify_api_error(api)
}
