//! Transport seams used by the call waiter.
//!
//! The HTTP clients implement these traits against the gateway; tests and the
//! `mock` feature implement them with scripted responses.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    errors::Result,
    sse::CallEventStream,
    types::{CallLookup, CallProgress, CallResult},
};

/// A boxed future type for transport operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One decoded event from a call's event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEvent {
    /// SSE `id:` field, used as the resume cursor.
    pub id: Option<String>,
    pub kind: CallEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEventKind {
    Progress(CallProgress),
    Result(CallResult),
}

impl CallEvent {
    pub fn progress(id: Option<&str>, progress: CallProgress) -> Self {
        Self {
            id: id.map(str::to_string),
            kind: CallEventKind::Progress(progress),
        }
    }

    pub fn result(id: Option<&str>, result: CallResult) -> Self {
        Self {
            id: id.map(str::to_string),
            kind: CallEventKind::Result(result),
        }
    }

    /// Event id as a monotonic sequence number, when it parses as one.
    pub fn sequence(&self) -> Option<u64> {
        self.id.as_deref().and_then(|id| id.trim().parse().ok())
    }
}

/// Async access to a remote call: snapshot reads and event subscriptions.
pub trait CallTransport: Send + Sync {
    /// Fetch the current state of a call.
    fn get_call<'a>(&'a self, call_id: &'a str) -> BoxFuture<'a, Result<CallLookup>>;

    /// Open an event subscription, resuming after `last_event_id` when given.
    fn open_events<'a>(
        &'a self,
        call_id: &'a str,
        last_event_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<CallEventStream>>;
}

/// Blocking counterpart of [`CallTransport`].
pub trait BlockingCallTransport: Send + Sync {
    fn get_call(&self, call_id: &str) -> Result<CallLookup>;

    fn open_events(
        &self,
        call_id: &str,
        last_event_id: Option<&str>,
    ) -> Result<BlockingCallEventStream>;
}

/// Iterator over events from a blocking subscription.
///
/// Reads block the calling thread; the blocking waiter drains it from a helper
/// thread so that cancellation is not held up by a quiet stream. Once
/// cancelled the iterator ends at its next step.
pub struct BlockingCallEventStream {
    inner: Box<dyn Iterator<Item = Result<CallEvent>> + Send>,
    cancelled: Arc<AtomicBool>,
}

impl BlockingCallEventStream {
    pub fn new<I>(iter: I) -> Self
    where
        I: Iterator<Item = Result<CallEvent>> + Send + 'static,
    {
        Self::with_cancel_flag(iter, Arc::new(AtomicBool::new(false)))
    }

    /// Share `cancelled` with a reader that can observe it between its own
    /// reads (heartbeats included).
    pub fn with_cancel_flag<I>(iter: I, cancelled: Arc<AtomicBool>) -> Self
    where
        I: Iterator<Item = Result<CallEvent>> + Send + 'static,
    {
        Self {
            inner: Box::new(iter),
            cancelled,
        }
    }

    /// Handle that ends the iterator from another thread.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Build a stream from a fixed sequence of events (useful for tests/mocks).
    pub fn from_events(events: impl IntoIterator<Item = CallEvent>) -> Self {
        let collected: Vec<CallEvent> = events.into_iter().collect();
        Self::new(collected.into_iter().map(Ok))
    }

    pub fn from_results(items: impl IntoIterator<Item = Result<CallEvent>>) -> Self {
        let collected: Vec<Result<CallEvent>> = items.into_iter().collect();
        Self::new(collected.into_iter())
    }
}

impl Iterator for BlockingCallEventStream {
    type Item = Result<CallEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_cancelled() {
            return None;
        }
        self.inner.next()
    }
}

impl std::fmt::Debug for BlockingCallEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingCallEventStream")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
