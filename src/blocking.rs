use std::{
    fmt,
    io::BufReader,
    sync::{atomic::AtomicBool, Arc},
    thread,
    time::Duration,
};

use reqwest::{
    blocking::{Client as HttpClient, RequestBuilder, Response},
    header::{ACCEPT, CONTENT_TYPE},
    Method, Url,
};

use crate::{
    client::{call_url, parse_base_url, require_call_id},
    core::{RetryState, SseLines},
    credentials::{
        auth_failure, gateway_url_with, parse_request_token, parse_verified_credentials,
        Credentials, AUTH_REQUEST_PATH, AUTH_VERIFY_PATH,
    },
    errors::{Error, Result, TransportError, TransportErrorKind, ValidationError},
    http::{parse_api_error_parts, RetryConfig},
    sse::{is_event_stream, EVENT_STREAM_CONTENT_TYPE},
    transport::{BlockingCallEventStream, BlockingCallTransport},
    types::{
        parse_call_initiated, parse_call_payload, CallInitiated, CallLookup, CallRequest,
        CallResult,
    },
    waiter::{BlockingWaiter, WaitOptions},
    CLIENT_HEADER, DEFAULT_AUTH_URL, DEFAULT_CLIENT_HEADER, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_STREAM_IDLE_TIMEOUT, LAST_EVENT_ID_HEADER, USER_ID_HEADER,
};

/// Blocking counterpart of [`crate::Config`].
#[derive(Clone, Default)]
pub struct BlockingConfig {
    pub access_token: Option<String>,
    pub user_id: Option<String>,
    pub gateway_url: Option<String>,
    pub client_header: Option<String>,
    pub http_client: Option<HttpClient>,
    /// Override the connect timeout (defaults to 30s).
    pub connect_timeout: Option<Duration>,
    /// Override the request timeout for create/get (defaults to 300s).
    pub timeout: Option<Duration>,
    /// Upper bound on a single event-stream subscription (defaults to 7500s).
    pub stream_idle_timeout: Option<Duration>,
    pub retry: Option<RetryConfig>,
}

impl fmt::Debug for BlockingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingConfig")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("user_id", &self.user_id)
            .field("gateway_url", &self.gateway_url)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct BlockingClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    base_url: Url,
    credentials: Credentials,
    client_header: String,
    http: HttpClient,
    request_timeout: Duration,
    stream_timeout: Duration,
    retry: RetryConfig,
}

impl BlockingClient {
    pub fn new(cfg: BlockingConfig) -> Result<Self> {
        let credentials = Credentials::resolve(cfg.access_token.clone(), cfg.user_id.clone())?;
        Self::with_credentials(credentials, cfg)
    }

    pub fn from_env() -> Result<Self> {
        Self::new(BlockingConfig::default())
    }

    pub fn with_credentials(credentials: Credentials, cfg: BlockingConfig) -> Result<Self> {
        let base = gateway_url_with(cfg.gateway_url.as_deref(), |key| std::env::var(key).ok());
        let base_url = parse_base_url(&base)?;

        let http = match cfg.http_client {
            Some(client) => client,
            None => build_http(cfg.connect_timeout)?,
        };

        Ok(Self {
            inner: Arc::new(ClientInner {
                base_url,
                credentials,
                client_header: cfg
                    .client_header
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_CLIENT_HEADER.to_string()),
                http,
                request_timeout: cfg.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
                stream_timeout: cfg
                    .stream_idle_timeout
                    .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT),
                retry: cfg.retry.unwrap_or_default(),
            }),
        })
    }

    pub fn calls(&self) -> BlockingCallsClient {
        BlockingCallsClient {
            inner: self.inner.clone(),
        }
    }

    pub fn user_id(&self) -> &str {
        self.inner.credentials.user_id()
    }

    pub fn gateway_url(&self) -> &str {
        self.inner.base_url.as_str()
    }

    pub fn close(self) {
        drop(self);
    }
}

impl fmt::Debug for BlockingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingClient")
            .field("gateway_url", &self.inner.base_url.as_str())
            .field("credentials", &self.inner.credentials)
            .finish_non_exhaustive()
    }
}

fn build_http(connect_timeout: Option<Duration>) -> Result<HttpClient> {
    HttpClient::builder()
        .connect_timeout(connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
        .build()
        .map_err(|err| {
            TransportError {
                kind: TransportErrorKind::Connect,
                message: "failed to build http client".to_string(),
                source: Some(err),
                retries: None,
            }
            .into()
        })
}

/// Call operations on the calling thread.
#[derive(Clone)]
pub struct BlockingCallsClient {
    inner: Arc<ClientInner>,
}

impl BlockingCallsClient {
    pub fn create(&self, req: CallRequest) -> Result<CallInitiated> {
        req.validate()?;
        let url = call_url(&self.inner.base_url, None, false)?;
        let builder = self
            .inner
            .request(Method::POST, url, "application/json")
            .timeout(self.inner.request_timeout)
            .json(&req.to_wire());
        let resp = send_with_retry(builder, Method::POST, self.inner.retry.clone())?;
        parse_call_initiated(&read_body(resp)?)
    }

    pub fn get(&self, call_id: &str) -> Result<CallLookup> {
        let call_id = require_call_id(call_id)?;
        let url = call_url(&self.inner.base_url, Some(call_id), false)?;
        let builder = self
            .inner
            .request(Method::GET, url, "application/json")
            .timeout(self.inner.request_timeout);
        let resp = send_with_retry(builder, Method::GET, self.inner.retry.clone())?;
        parse_call_payload(&read_body(resp)?)
    }

    /// Subscribe to a call's event stream. Reading the returned iterator blocks.
    pub fn open_events(
        &self,
        call_id: &str,
        last_event_id: Option<&str>,
    ) -> Result<BlockingCallEventStream> {
        let call_id = require_call_id(call_id)?;
        let url = call_url(&self.inner.base_url, Some(call_id), true)?;
        let mut builder = self
            .inner
            .request(Method::GET, url, EVENT_STREAM_CONTENT_TYPE)
            .timeout(self.inner.stream_timeout);
        if let Some(cursor) = last_event_id.filter(|id| !id.trim().is_empty()) {
            builder = builder.header(LAST_EVENT_ID_HEADER, cursor);
        }
        let resp = send_with_retry(builder, Method::GET, RetryConfig::disabled())?;

        let received = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !is_event_stream(&received) {
            return Err(Error::StreamContentType {
                expected: EVENT_STREAM_CONTENT_TYPE,
                received,
                status: resp.status().as_u16(),
            });
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        let lines = SseLines::new(BufReader::new(resp)).with_cancel(cancelled.clone());
        Ok(BlockingCallEventStream::with_cancel_flag(lines, cancelled))
    }

    pub fn wait(&self, call_id: &str, options: WaitOptions) -> Result<CallResult> {
        BlockingWaiter::new(self.clone()).wait(call_id, options)
    }

    pub fn create_and_wait(&self, req: CallRequest, options: WaitOptions) -> Result<CallResult> {
        options.validate()?;
        let initiated = self.create(req)?;
        #[cfg(feature = "tracing")]
        tracing::debug!(call_id = %initiated.call_id, status = %initiated.status, "call created");
        self.wait(&initiated.call_id, options)
    }
}

impl BlockingCallTransport for BlockingCallsClient {
    fn get_call(&self, call_id: &str) -> Result<CallLookup> {
        self.get(call_id)
    }

    fn open_events(
        &self,
        call_id: &str,
        last_event_id: Option<&str>,
    ) -> Result<BlockingCallEventStream> {
        BlockingCallsClient::open_events(self, call_id, last_event_id)
    }
}

impl fmt::Debug for BlockingCallsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingCallsClient")
            .field("gateway_url", &self.inner.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl ClientInner {
    fn request(&self, method: Method, url: Url, accept: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(ACCEPT, accept)
            .header(CLIENT_HEADER, self.client_header.as_str())
            .header(USER_ID_HEADER, self.credentials.user_id())
            .bearer_auth(self.credentials.access_token())
    }
}

fn read_body(resp: Response) -> Result<String> {
    resp.text()
        .map_err(|err| TransportError::from_reqwest(err, None).into())
}

fn send_with_retry(builder: RequestBuilder, method: Method, retry: RetryConfig) -> Result<Response> {
    let max_attempts = retry.max_attempts.max(1);
    let mut state = RetryState::new();

    for attempt in 1..=max_attempts {
        let attempt_builder = builder
            .try_clone()
            .ok_or_else(|| Error::Config("request body is not cloneable for retry".into()))?;

        match attempt_builder.send() {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return Ok(resp);
                }
                state.record_attempt(attempt);
                state.record_status(status);

                if retry.should_retry_status(&method, status) && attempt < max_attempts {
                    thread::sleep(retry.backoff_delay(attempt));
                    continue;
                }

                #[cfg(feature = "tracing")]
                tracing::warn!(status = %status, attempt, "request failed; returning error");
                let headers = resp.headers().clone();
                let body = resp.text().unwrap_or_default();
                return Err(parse_api_error_parts(status, &headers, body, state.metadata()));
            }
            Err(err) => {
                state.record_attempt(attempt);
                state.record_error(&err);
                if retry.should_retry_error(&method, &err) && attempt < max_attempts {
                    thread::sleep(retry.backoff_delay(attempt));
                    continue;
                }
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

/// Blocking counterpart of [`crate::AuthConfig`].
#[derive(Clone, Debug, Default)]
pub struct BlockingAuthConfig {
    pub auth_url: Option<String>,
    pub client_header: Option<String>,
    pub http_client: Option<HttpClient>,
    pub connect_timeout: Option<Duration>,
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct BlockingAuthClient {
    base_url: Url,
    client_header: String,
    http: HttpClient,
    timeout: Duration,
}

impl BlockingAuthClient {
    pub fn new(cfg: BlockingAuthConfig) -> Result<Self> {
        let base = cfg
            .auth_url
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_AUTH_URL.to_string());
        let base_url = parse_base_url(&base)?;
        let http = match cfg.http_client {
            Some(client) => client,
            None => build_http(cfg.connect_timeout)?,
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

    pub fn request_code(&self, email: &str) -> Result<String> {
        if email.trim().is_empty() {
            return Err(ValidationError::new("is required").with_field("email").into());
        }
        let body = serde_json::json!({ "email": email.trim() });
        let text = self
            .post(AUTH_REQUEST_PATH, &body)
            .map_err(|err| auth_failure(err, "AUTH_REQUEST_FAILED"))?;
        parse_request_token(&text)
    }

    pub fn verify_code(&self, email: &str, request_token: &str, code: &str) -> Result<Credentials> {
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
            .map_err(|err| auth_failure(err, "AUTH_VERIFY_FAILED"))?;
        parse_verified_credentials(&text)
    }

    fn post(&self, path: &str, body: &serde_json::Value) -> Result<String> {
        let url = Url::parse(&format!(
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
        let resp = send_with_retry(builder, Method::POST, RetryConfig::disabled())?;
        read_body(resp)
    }
}
