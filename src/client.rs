use std::{fmt, sync::Arc, time::Duration};

use reqwest::{header::ACCEPT, Method};
use tokio::time::sleep;

use crate::{
    core::RetryState,
    credentials::{
        auth_failure, gateway_url_with, parse_request_token, parse_verified_credentials,
        Credentials, AUTH_REQUEST_PATH, AUTH_VERIFY_PATH,
    },
    errors::{Error, Result, TransportError, TransportErrorKind, ValidationError},
    http::{parse_api_error_parts, RetryConfig},
    sse::{CallEventStream, EVENT_STREAM_CONTENT_TYPE},
    transport::{BoxFuture, CallTransport},
    types::{parse_call_initiated, parse_call_payload, CallInitiated, CallLookup, CallRequest, CallResult},
    waiter::{CallWatch, WaitOptions, Waiter},
    CLIENT_HEADER, DEFAULT_AUTH_URL, DEFAULT_CLIENT_HEADER, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_STREAM_IDLE_TIMEOUT, LAST_EVENT_ID_HEADER, USER_ID_HEADER,
};

/// Client configuration. Unset fields fall back to the environment and crate defaults.
#[derive(Clone, Default)]
pub struct Config {
    /// Defaults to `PINE_ACCESS_TOKEN`.
    pub access_token: Option<String>,
    /// Defaults to `PINE_USER_ID`.
    pub user_id: Option<String>,
    /// Defaults to `PINE_GATEWAY_URL`, then [`crate::DEFAULT_GATEWAY_URL`].
    pub gateway_url: Option<String>,
    pub client_header: Option<String>,
    pub http_client: Option<reqwest::Client>,
    /// Override the connect timeout (defaults to 30s).
    pub connect_timeout: Option<Duration>,
    /// Override the request timeout for create/get (defaults to 300s).
    pub timeout: Option<Duration>,
    /// Longest silence tolerated on an event stream (defaults to 7500s).
    pub stream_idle_timeout: Option<Duration>,
    /// Retry/backoff policy for reads (defaults to 3 attempts, exponential backoff + jitter).
    pub retry: Option<RetryConfig>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("user_id", &self.user_id)
            .field("gateway_url", &self.gateway_url)
            .field("client_header", &self.client_header)
            .field("connect_timeout", &self.connect_timeout)
            .field("timeout", &self.timeout)
            .field("stream_idle_timeout", &self.stream_idle_timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Async client for the voice gateway.
///
/// Cheap to clone; clones share one connection pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    base_url: reqwest::Url,
    credentials: Credentials,
    client_header: String,
    http: reqwest::Client,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
    retry: RetryConfig,
}

impl Client {
    /// Build a client, resolving unset credentials and gateway URL from the environment.
    pub fn new(cfg: Config) -> Result<Self> {
        let credentials = Credentials::resolve(cfg.access_token.clone(), cfg.user_id.clone())?;
        Self::with_credentials(credentials, cfg)
    }

    /// Build a client entirely from `PINE_ACCESS_TOKEN`, `PINE_USER_ID` and `PINE_GATEWAY_URL`.
    pub fn from_env() -> Result<Self> {
        Self::new(Config::default())
    }

    /// Build a client for already-resolved credentials (for example from [`AuthClient::verify_code`]).
    pub fn with_credentials(credentials: Credentials, cfg: Config) -> Result<Self> {
        let base = gateway_url_with(cfg.gateway_url.as_deref(), |key| std::env::var(key).ok());
        let base_url = parse_base_url(&base)?;

        let connect_timeout = cfg.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let http = match cfg.http_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .build()
                .map_err(|err| {
                    let mut transport = TransportError::from_reqwest(err, None);
                    transport.kind = TransportErrorKind::Connect;
                    transport.message = "failed to build http client".to_string();
                    transport
                })?,
        };

        let client_header = cfg
            .client_header
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CLIENT_HEADER.to_string());

        Ok(Self {
            inner: Arc::new(ClientInner {
                base_url,
                credentials,
                client_header,
                http,
                request_timeout: cfg.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
                stream_idle_timeout: cfg
                    .stream_idle_timeout
                    .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT),
                retry: cfg.retry.unwrap_or_default(),
            }),
        })
    }

    pub fn calls(&self) -> CallsClient {
        CallsClient {
            inner: self.inner.clone(),
        }
    }

    pub fn user_id(&self) -> &str {
        self.inner.credentials.user_id()
    }

    pub fn gateway_url(&self) -> &str {
        self.inner.base_url.as_str()
    }

    /// Release this handle. The connection pool closes once every clone is gone.
    pub fn close(self) {
        drop(self);
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("gateway_url", &self.inner.base_url.as_str())
            .field("credentials", &self.inner.credentials)
            .finish_non_exhaustive()
    }
}

pub(crate) fn parse_base_url(base: &str) -> Result<reqwest::Url> {
    let url = reqwest::Url::parse(base.trim_end_matches('/'))
        .map_err(|err| Error::Config(format!("invalid gateway url: {err}")))?;
    if url.cannot_be_a_base() {
        return Err(Error::Config(format!("invalid gateway url: {base}")));
    }
    Ok(url)
}

/// `{base}/api/v2/voice/call[/{call_id}[/stream]]`, with the id percent-encoded.
pub(crate) fn call_url(
    base: &reqwest::Url,
    call_id: Option<&str>,
    stream: bool,
) -> Result<reqwest::Url> {
    let mut url = base.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| Error::Config(format!("invalid gateway url: {base}")))?;
        segments.pop_if_empty().extend(["api", "v2", "voice", "call"]);
        if let Some(id) = call_id {
            segments.push(id);
            if stream {
                segments.push("stream");
            }
        }
    }
    Ok(url)
}

pub(crate) fn require_call_id(call_id: &str) -> Result<&str> {
    let trimmed = call_id.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new("is required").with_field("call_id").into());
    }
    Ok(trimmed)
}

/// Call operations: create, get, subscribe and wait.
#[derive(Clone)]
pub struct CallsClient {
    inner: Arc<ClientInner>,
}

impl CallsClient {
    /// Place a call. Returns as soon as the gateway accepts it.
    ///
    /// Validation and the destination allow-list run before any request is sent.
    /// The POST is never retried unless [`RetryConfig::retry_post`] is set.
    pub async fn create(&self, req: CallRequest) -> Result<CallInitiated> {
        req.validate()?;
        let url = call_url(&self.inner.base_url, None, false)?;
        let builder = self
            .inner
            .request(Method::POST, url, "application/json")
            .timeout(self.inner.request_timeout)
            .json(&req.to_wire());
        let resp = send_with_retry(builder, Method::POST, self.inner.retry.clone()).await?;
        let body = self.inner.read_body(resp).await?;
        parse_call_initiated(&body)
    }

    /// Current state of a call. Terminal calls return the full result.
    pub async fn get(&self, call_id: &str) -> Result<CallLookup> {
        let call_id = require_call_id(call_id)?;
        let url = call_url(&self.inner.base_url, Some(call_id), false)?;
        let builder = self
            .inner
            .request(Method::GET, url, "application/json")
            .timeout(self.inner.request_timeout);
        let resp = send_with_retry(builder, Method::GET, self.inner.retry.clone()).await?;
        let body = self.inner.read_body(resp).await?;
        parse_call_payload(&body)
    }

    /// Subscribe to a call's event stream, resuming after `last_event_id` when given.
    ///
    /// A single attempt: the waiter owns reconnect policy.
    pub async fn open_events(
        &self,
        call_id: &str,
        last_event_id: Option<&str>,
    ) -> Result<CallEventStream> {
        let call_id = require_call_id(call_id)?;
        let url = call_url(&self.inner.base_url, Some(call_id), true)?;
        let mut builder = self
            .inner
            .request(Method::GET, url, EVENT_STREAM_CONTENT_TYPE);
        if let Some(cursor) = last_event_id.filter(|id| !id.trim().is_empty()) {
            builder = builder.header(LAST_EVENT_ID_HEADER, cursor);
        }
        // The idle timeout only covers body reads; bound the wait for headers too.
        let open_timeout = self.inner.request_timeout.min(self.inner.stream_idle_timeout);
        let resp = match tokio::time::timeout(
            open_timeout,
            send_with_retry(builder, Method::GET, RetryConfig::disabled()),
        )
        .await
        {
            Ok(resp) => resp?,
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    call_id = %call_id,
                    open_ms = open_timeout.as_millis() as u64,
                    "event stream open timed out"
                );
                return Err(Error::Transport(TransportError::timeout(format!(
                    "event stream did not answer within {}ms",
                    open_timeout.as_millis()
                ))));
            }
        };
        CallEventStream::from_response(resp, self.inner.stream_idle_timeout)
    }

    /// Wait for a call to finish. See [`Waiter`] for the transport rules.
    pub async fn wait(&self, call_id: &str, options: WaitOptions) -> Result<CallResult> {
        Waiter::new(self.clone()).wait(call_id, options).await
    }

    /// Observe a call as a stream of progress updates ending in its result.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch(&self, call_id: impl Into<String>, options: WaitOptions) -> CallWatch {
        Waiter::new(self.clone()).watch(call_id, options)
    }

    /// Place a call and wait for it to finish.
    pub async fn create_and_wait(
        &self,
        req: CallRequest,
        options: WaitOptions,
    ) -> Result<CallResult> {
        options.validate()?;
        let initiated = self.create(req).await?;
        #[cfg(feature = "tracing")]
        tracing::debug!(call_id = %initiated.call_id, status = %initiated.status, "call created");
        self.wait(&initiated.call_id, options).await
    }
}

impl CallTransport for CallsClient {
    fn get_call<'a>(&'a self, call_id: &'a str) -> BoxFuture<'a, Result<CallLookup>> {
        Box::pin(self.get(call_id))
    }

    fn open_events<'a>(
        &'a self,
        call_id: &'a str,
        last_event_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<CallEventStream>> {
        Box::pin(CallsClient::open_events(self, call_id, last_event_id))
    }
}

impl fmt::Debug for CallsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallsClient")
            .field("gateway_url", &self.inner.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl ClientInner {
    fn request(
        &self,
        method: Method,
        url: reqwest::Url,
        accept: &str,
    ) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header(ACCEPT, accept)
            .header(CLIENT_HEADER, self.client_header.as_str())
            .header(USER_ID_HEADER, self.credentials.user_id())
            .bearer_auth(self.credentials.access_token())
    }

    async fn read_body(&self, resp: reqwest::Response) -> Result<String> {
        resp.text()
            .await
            .map_err(|err| TransportError::from_reqwest(err, None).into())
    }
}

/// Send a request, retrying per `retry`, and turn non-2xx responses into classified errors.
pub(crate) async fn send_with_retry(
    builder: reqwest::RequestBuilder,
    method: Method,
    retry: RetryConfig,
) -> Result<reqwest::Response> {
    let max_attempts = retry.max_attempts.max(1);
    let mut state = RetryState::new();
    #[cfg(feature = "tracing")]
    let start = std::time::Instant::now();

    for attempt in 1..=max_attempts {
        let attempt_builder = builder
            .try_clone()
            .ok_or_else(|| Error::Config("request body is not cloneable for retry".into()))?;
        #[cfg(feature = "tracing")]
        let span = tracing::debug_span!("pine_voice.http", method = %method, attempt, max_attempts);
        #[cfg(feature = "tracing")]
        let _guard = span.enter();

        match attempt_builder.send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        status = %status,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "request completed"
                    );
                    return Ok(resp);
                }
                state.record_attempt(attempt);
                state.record_status(status);

                if retry.should_retry_status(&method, status) && attempt < max_attempts {
                    sleep(retry.backoff_delay(attempt)).await;
                    continue;
                }

                #[cfg(feature = "tracing")]
                tracing::warn!(status = %status, attempt, "request failed; returning error");
                let headers = resp.headers().clone();
                let body = resp.text().await.unwrap_or_default();
                return Err(parse_api_error_parts(status, &headers, body, state.metadata()));
            }
            Err(err) => {
                state.record_attempt(attempt);
                state.record_error(&err);
                if retry.should_retry_error(&method, &err) && attempt < max_attempts {
                    sleep(retry.backoff_delay(attempt)).await;
                    continue;
                }
                #[cfg(feature = "tracing")]
                tracing::warn!(attempt, error = %err, "transport error");
                return Err(TransportError::from_reqwest(err, state.metadata()).into());
            }
        }
    }

    Err(Error::Transport(TransportError {
        kind: TransportErrorKind::Other,
        message: "request failed".to_string(),
        source: None,
        retries: state.metadata(),
    }))
}

/// Configuration for the email-code auth exchange.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Defaults to [`crate::DEFAULT_AUTH_URL`].
    pub auth_url: Option<String>,
    pub client_header: Option<String>,
    pub http_client: Option<reqwest::Client>,
    pub connect_timeout: Option<Duration>,
    pub timeout: Option<Duration>,
}

/// Obtains credentials through the email verification-code flow.
#[derive(Clone, Debug)]
pub struct AuthClient {
    base_url: reqwest::Url,
    client_header: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl AuthClient {
    pub fn new(cfg: AuthConfig) -> Result<Self> {
        let base = cfg
            .auth_url
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_AUTH_URL.to_string());
        let base_url = parse_base_url(&base)?;
        let http = match cfg.http_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .connect_timeout(cfg.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
                .build()
                .map_err(|err| TransportError::from_reqwest(err, None))?,
        };
        Ok(Self {
            base_url,
            client_header: cfg
                .client_header
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CLIENT_HEADER.to_string()),
            http,
            timeout: cfg.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        })
    }

    /// Email a verification code. Returns the request token needed by [`Self::verify_code`].
    pub async fn request_code(&self, email: &str) -> Result<String> {
        if email.trim().is_empty() {
            return Err(ValidationError::new("is required").with_field("email").into());
        }
        let body = serde_json::json!({ "email": email.trim() });
        let text = self
            .post(AUTH_REQUEST_PATH, &body)
            .await
            .map_err(|err| auth_failure(err, "AUTH_REQUEST_FAILED"))?;
        parse_request_token(&text)
    }

    /// Exchange the emailed code for credentials.
    pub async fn verify_code(
        &self,
        email: &str,
        request_token: &str,
        code: &str,
    ) -> Result<Credentials> {
        for (field, value) in [("email", email), ("request_token", request_token), ("code", code)] {
            if value.trim().is_empty() {
                return Err(ValidationError::new("is required").with_field(field).into());
            }
        }
        let body = serde_json::json!({
            "email": email.trim(),
            "request_token": request_token,
            "code": code.trim(),
        });
        let text = self
            .post(AUTH_VERIFY_PATH, &body)
            .await
            .map_err(|err| auth_failure(err, "AUTH_VERIFY_FAILED"))?;
        parse_verified_credentials(&text)
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<String> {
        let url = reqwest::Url::parse(&format!(
            "{}{path}",
            self.base_url.as_str().trim_end_matches('/')
        ))
        .map_err(|err| Error::Config(format!("invalid auth url: {err}")))?;
        let builder = self
            .http
            .post(url)
            .header(ACCEPT, "application/json")
            .header(CLIENT_HEADER, self.client_header.as_str())
            .timeout(self.timeout)
            .json(body);
        let resp = send_with_retry(builder, Method::POST, RetryConfig::disabled()).await?;
        resp.text()
            .await
            .map_err(|err| TransportError::from_reqwest(err, None).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_urls_encode_ids_and_keep_prefixes() {
        let base = parse_base_url("https://gw.example.com/").unwrap();
        assert_eq!(
            call_url(&base, None, false).unwrap().as_str(),
            "https://gw.example.com/api/v2/voice/call"
        );
        assert_eq!(
            call_url(&base, Some("a/b c"), true).unwrap().as_str(),
            "https://gw.example.com/api/v2/voice/call/a%2Fb%20c/stream"
        );

        let prefixed = parse_base_url("https://gw.example.com/edge").unwrap();
        assert_eq!(
            call_url(&prefixed, Some("c1"), false).unwrap().as_str(),
            "https://gw.example.com/edge/api/v2/voice/call/c1"
        );
    }

    #[test]
    fn rejects_unusable_gateway_urls() {
        assert!(matches!(parse_base_url("not a url"), Err(Error::Config(_))));
        assert!(matches!(parse_base_url("mailto:ops@example.com"), Err(Error::Config(_))));
    }

    #[test]
    fn blank_call_id_is_a_validation_error() {
        assert!(matches!(require_call_id("  "), Err(Error::Validation(_))));
        assert_eq!(require_call_id(" c1 ").unwrap(), "c1");
    }

    #[test]
    fn config_debug_redacts_token() {
        let cfg = Config {
            access_token: Some("secret".into()),
            ..Default::default()
        };
        assert!(!format!("{cfg:?}").contains("secret"));
    }
}
