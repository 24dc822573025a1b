//! Scripted in-memory transport for offline tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use futures_util::{stream, StreamExt};

use crate::{
    errors::{APIError, Error, Result, TransportError, ValidationError},
    sse::CallEventStream,
    transport::{
        BlockingCallEventStream, BlockingCallTransport, BoxFuture, CallEvent, CallTransport,
    },
    types::CallLookup,
};

/// One scripted answer to an `open_events` call.
pub enum MockStream {
    /// Yield these items, then close cleanly.
    Events(Vec<Result<CallEvent>>),
    /// Fail the open itself.
    OpenError(Error),
    /// Yield these events, then go quiet. Async streams stay open until
    /// dropped; blocking streams end with an idle timeout.
    Stalled(Vec<CallEvent>),
}

/// In-memory mock configuration.
///
/// Opens consume `streams` in order; once exhausted, opens fail with 404 as a
/// gateway without streaming would. Polls consume `polls` in order, then
/// repeat `repeat_poll` if set.
#[derive(Default)]
pub struct MockConfig {
    pub streams: Vec<MockStream>,
    pub polls: Vec<Result<CallLookup>>,
    pub repeat_poll: Option<CallLookup>,
}

impl MockConfig {
    pub fn with_stream_events(mut self, events: Vec<CallEvent>) -> Self {
        self.streams
            .push(MockStream::Events(events.into_iter().map(Ok).collect()));
        self
    }

    pub fn with_stream_results(mut self, items: Vec<Result<CallEvent>>) -> Self {
        self.streams.push(MockStream::Events(items));
        self
    }

    pub fn with_stream_failure(mut self, err: Error) -> Self {
        self.streams.push(MockStream::OpenError(err));
        self
    }

    pub fn with_stalled_stream(mut self, events: Vec<CallEvent>) -> Self {
        self.streams.push(MockStream::Stalled(events));
        self
    }

    pub fn with_poll(mut self, lookup: CallLookup) -> Self {
        self.polls.push(Ok(lookup));
        self
    }

    pub fn with_poll_error(mut self, err: Error) -> Self {
        self.polls.push(Err(err));
        self
    }

    pub fn with_repeating_poll(mut self, lookup: CallLookup) -> Self {
        self.repeat_poll = Some(lookup);
        self
    }
}

/// Scripted [`CallTransport`] / [`BlockingCallTransport`] that records what it was asked.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

struct MockInner {
    streams: Mutex<VecDeque<MockStream>>,
    polls: Mutex<VecDeque<Result<CallLookup>>>,
    repeat_poll: Option<CallLookup>,
    opens: Mutex<Vec<Option<String>>>,
    poll_count: AtomicUsize,
    live_streams: Arc<AtomicUsize>,
}

/// Held by each scripted stream; counts open subscriptions.
struct LiveStream(Arc<AtomicUsize>);

impl LiveStream {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for LiveStream {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockTransport {
    pub fn new(cfg: MockConfig) -> Self {
        Self {
            inner: Arc::new(MockInner {
                streams: Mutex::new(VecDeque::from(cfg.streams)),
                polls: Mutex::new(VecDeque::from(cfg.polls)),
                repeat_poll: cfg.repeat_poll,
                opens: Mutex::new(Vec::new()),
                poll_count: AtomicUsize::new(0),
                live_streams: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Number of subscription attempts so far.
    pub fn open_count(&self) -> usize {
        lock(&self.inner.opens).len()
    }

    /// `Last-Event-ID` passed to each subscription attempt, in order.
    pub fn open_cursors(&self) -> Vec<Option<String>> {
        lock(&self.inner.opens).clone()
    }

    pub fn poll_count(&self) -> usize {
        self.inner.poll_count.load(Ordering::SeqCst)
    }

    /// Subscriptions handed out and not yet dropped.
    pub fn live_streams(&self) -> usize {
        self.inner.live_streams.load(Ordering::SeqCst)
    }

    fn next_stream(&self, last_event_id: Option<&str>) -> MockStream {
        lock(&self.inner.opens).push(last_event_id.map(str::to_string));
        lock(&self.inner.streams)
            .pop_front()
            .unwrap_or_else(|| {
                MockStream::OpenError(Error::Api(
                    APIError::new(404, "streaming is not available").with_code("NOT_FOUND"),
                ))
            })
    }

    fn next_poll(&self) -> Result<CallLookup> {
        self.inner.poll_count.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = lock(&self.inner.polls).pop_front() {
            return next;
        }
        match &self.inner.repeat_poll {
            Some(lookup) => Ok(lookup.clone()),
            None => Err(Error::Validation(ValidationError::new(
                "no mock poll response queued",
            ))),
        }
    }
}

impl CallTransport for MockTransport {
    fn get_call<'a>(&'a self, _call_id: &'a str) -> BoxFuture<'a, Result<CallLookup>> {
        let next = self.next_poll();
        Box::pin(async move { next })
    }

    fn open_events<'a>(
        &'a self,
        _call_id: &'a str,
        last_event_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<CallEventStream>> {
        let scripted = self.next_stream(last_event_id);
        let live = &self.inner.live_streams;
        let opened = match scripted {
            MockStream::OpenError(err) => Err(err),
            MockStream::Events(items) => {
                let guard = LiveStream::new(live);
                Ok(CallEventStream::from_stream(stream::iter(items).map(
                    move |item| {
                        let _held = &guard;
                        item
                    },
                )))
            }
            MockStream::Stalled(events) => {
                let guard = LiveStream::new(live);
                let quiet = stream::iter(events.into_iter().map(Ok)).chain(stream::pending());
                Ok(CallEventStream::from_stream(quiet.map(move |item| {
                    let _held = &guard;
                    item
                })))
            }
        };
        Box::pin(async move { opened })
    }
}

impl BlockingCallTransport for MockTransport {
    fn get_call(&self, _call_id: &str) -> Result<CallLookup> {
        self.next_poll()
    }

    fn open_events(
        &self,
        _call_id: &str,
        last_event_id: Option<&str>,
    ) -> Result<BlockingCallEventStream> {
        let live = &self.inner.live_streams;
        match self.next_stream(last_event_id) {
            MockStream::OpenError(err) => Err(err),
            MockStream::Events(items) => {
                let guard = LiveStream::new(live);
                Ok(BlockingCallEventStream::new(items.into_iter().map(
                    move |item| {
                        let _held = &guard;
                        item
                    },
                )))
            }
            MockStream::Stalled(events) => {
                let guard = LiveStream::new(live);
                let timeout: Result<CallEvent> =
                    Err(TransportError::timeout("no event stream data").into());
                Ok(BlockingCallEventStream::new(
                    events
                        .into_iter()
                        .map(Ok)
                        .chain(std::iter::once(timeout))
                        .map(move |item| {
                            let _held = &guard;
                            item
                        }),
                ))
            }
        }
    }
}

/// Builders for call payloads used across tests.
pub mod fixtures {
    use crate::{
        transport::CallEvent,
        types::{
            CallLookup, CallPhase, CallProgress, CallResult, CallStatus, CallStatusKind,
            TranscriptEntry, TriageCategory,
        },
    };

    pub const CALL_ID: &str = "call_mock_123";

    /// `turns` alternating agent/user lines.
    pub fn transcript(turns: usize) -> Vec<TranscriptEntry> {
        (0..turns)
            .map(|i| {
                let speaker = if i % 2 == 0 { "agent" } else { "user" };
                TranscriptEntry::new(speaker, format!("line {i}"))
            })
            .collect()
    }

    pub fn status(phase: &str, turns: usize) -> CallStatus {
        CallStatus {
            call_id: CALL_ID.into(),
            status: CallStatusKind::InProgress,
            phase: Some(CallPhase::from(phase)),
            duration_seconds: Some(turns as u64 * 5),
            partial_transcript: Some(transcript(turns)),
        }
    }

    pub fn progress(phase: &str, turns: usize) -> CallProgress {
        CallProgress::from(status(phase, turns))
    }

    pub fn in_progress(phase: &str, turns: usize) -> CallLookup {
        CallLookup::InProgress(status(phase, turns))
    }

    pub fn completed() -> CallResult {
        CallResult {
            call_id: CALL_ID.into(),
            status: CallStatusKind::Completed,
            duration_seconds: 95,
            summary: Some("Appointment booked for Tuesday 10am.".into()),
            transcript: transcript(4),
            triage_category: Some(TriageCategory::Successful),
            credits_charged: 2.5,
        }
    }

    pub fn finished() -> CallLookup {
        CallLookup::Finished(completed())
    }

    pub fn progress_event(id: Option<&str>, phase: &str, turns: usize) -> CallEvent {
        CallEvent::progress(id, progress(phase, turns))
    }

    pub fn result_event(id: Option<&str>) -> CallEvent {
        CallEvent::result(id, completed())
    }
}
