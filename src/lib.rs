//! Rust SDK for placing AI voice calls through the Pine voice gateway.
//!
//! The centerpiece is the call waiter: given a call id it follows the call over
//! server-sent events, reconnects once if the stream drops, falls back to
//! polling when streaming is unavailable and returns exactly one terminal
//! [`CallResult`].
//!
//! ```no_run
//! # async fn run() -> pine_voice::Result<()> {
//! use pine_voice::{CallRequest, Client, WaitOptions};
//!
//! let client = Client::from_env()?;
//! let request = CallRequest::new(
//!     "+14155551234",
//!     "Dr. Smith Office",
//!     "Local dental office, existing patient",
//!     "Book a cleaning next week",
//! );
//! let result = client
//!     .calls()
//!     .create_and_wait(request, WaitOptions::default().with_progress(|p| {
//!         println!("{} {:?}", p.status, p.phase);
//!     }))
//!     .await?;
//! println!("{:?}", result.summary);
//! # Ok(())
//! # }
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]
// Boxing the error enum would be a breaking change for match-heavy callers.
#![allow(clippy::result_large_err)]

use std::time::Duration;

/// Default voice gateway base URL.
pub const DEFAULT_GATEWAY_URL: &str = "https://agent3-api-gateway-staging.19pine.ai";

/// Default base URL for the email-code auth exchange.
pub const DEFAULT_AUTH_URL: &str = "https://www.19pine.ai";

/// Default client identification header value.
pub(crate) const DEFAULT_CLIENT_HEADER: &str =
    concat!("pine-voice-rust/", env!("CARGO_PKG_VERSION"));

/// Default connection timeout (30 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default request timeout for plain request/response calls (300 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Longest silence tolerated on an open event stream before it counts as dropped.
///
/// Sized to outlast the longest call the gateway accepts plus a margin; the
/// gateway sends heartbeat comments well inside this window.
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(7_500);

/// Default sleep between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Consecutive transient poll failures tolerated before the wait gives up.
pub const DEFAULT_MAX_TRANSIENT_FAILURES: u32 = 5;

/// HTTP header carrying the caller's user id.
pub const USER_ID_HEADER: &str = "X-Pine-User-Id";

/// HTTP header used for request ID tracing.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// HTTP header identifying the SDK.
pub(crate) const CLIENT_HEADER: &str = "X-Pine-Client";

/// HTTP header used to resume an event stream.
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Environment variable holding the access token.
pub const ACCESS_TOKEN_ENV: &str = "PINE_ACCESS_TOKEN";

/// Environment variable holding the user id.
pub const USER_ID_ENV: &str = "PINE_USER_ID";

/// Environment variable overriding the gateway URL.
pub const GATEWAY_URL_ENV: &str = "PINE_GATEWAY_URL";

mod client;
mod core;
mod credentials;
mod errors;
mod http;
#[cfg(any(test, feature = "mock"))]
mod mock;
mod progress;
mod sse;
mod transport;
mod types;
mod waiter;

#[doc(hidden)]
pub mod testing;

pub use client::{AuthClient, AuthConfig, CallsClient, Client, Config};
pub use credentials::{resolve_gateway_url, Credentials};
pub use errors::{
    APIError, CancelReason, Error, ErrorKind, Result, RetryMetadata, TransportError,
    TransportErrorKind, ValidationError,
};
pub use http::RetryConfig;
#[cfg(any(test, feature = "mock"))]
pub use mock::{fixtures, MockConfig, MockStream, MockTransport};
pub use progress::{ProgressMarker, ProgressTracker};
pub use sse::CallEventStream;
pub use transport::{
    BlockingCallEventStream, BlockingCallTransport, BoxFuture, CallEvent, CallEventKind,
    CallTransport,
};
pub use types::{
    CallInitiated, CallLookup, CallPhase, CallProgress, CallRequest, CallResult, CallStatus,
    CallStatusKind, CallerPersona, TranscriptEntry, TriageCategory, Voice,
    DEFAULT_MAX_DURATION_MINUTES, SUPPORTED_COUNTRY_CODES,
};
pub use waiter::{
    BlockingWaiter, CallWatch, Observation, ProgressCallback, WaitOptions, WaitSession,
    WaitState, WaitUpdate, Waiter,
};

#[cfg(feature = "blocking")]
mod blocking;
#[cfg(feature = "blocking")]
pub use blocking::{
    BlockingAuthClient, BlockingAuthConfig, BlockingCallsClient, BlockingClient, BlockingConfig,
};
