use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use futures_core::Stream;
use futures_util::{stream, StreamExt};
use reqwest::{header::CONTENT_TYPE, Response};

use crate::{
    core::{consume_sse_buffer, map_sse_event, RawEvent},
    errors::{Error, Result, TransportError},
    transport::CallEvent,
};

pub(crate) const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Streaming handle over a call's server-sent events.
///
/// Yields progress and result events in arrival order. A read error or idle
/// timeout is yielded once as an error and ends the stream; a clean close ends
/// it without an error.
pub struct CallEventStream {
    stream: Pin<Box<dyn Stream<Item = Result<CallEvent>> + Send>>,
    cancelled: Arc<AtomicBool>,
}

impl CallEventStream {
    /// Wrap an HTTP response, rejecting anything that is not an event stream.
    pub(crate) fn from_response(response: Response, idle_timeout: Duration) -> Result<Self> {
        check_event_stream(&response)?;
        let cancelled = Arc::new(AtomicBool::new(false));
        let stream = build_stream(response, idle_timeout, cancelled.clone());
        Ok(Self {
            stream: Box::pin(stream),
            cancelled,
        })
    }

    /// Build a stream handle from a sequence of events (useful for tests/mocks).
    pub fn from_events(events: impl IntoIterator<Item = CallEvent>) -> Self {
        let collected: Vec<CallEvent> = events.into_iter().collect();
        Self::from_stream(stream::iter(collected.into_iter().map(Ok)))
    }

    /// Build a stream handle from events and errors, in order.
    pub fn from_results(items: impl IntoIterator<Item = Result<CallEvent>>) -> Self {
        let collected: Vec<Result<CallEvent>> = items.into_iter().collect();
        Self::from_stream(stream::iter(collected))
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<CallEvent>> + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let stream = build_custom_stream(stream, cancelled.clone());
        Self {
            stream: Box::pin(stream),
            cancelled,
        }
    }

    /// Stop yielding events; the connection is released when the handle drops.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for CallEventStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Stream for CallEventStream {
    type Item = Result<CallEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for CallEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEventStream")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

pub(crate) fn check_event_stream(response: &Response) -> Result<()> {
    let received = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();
    if is_event_stream(&received) {
        return Ok(());
    }
    Err(Error::StreamContentType {
        expected: EVENT_STREAM_CONTENT_TYPE,
        received,
        status: response.status().as_u16(),
    })
}

pub(crate) fn is_event_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|mime| mime.trim().eq_ignore_ascii_case(EVENT_STREAM_CONTENT_TYPE))
        .unwrap_or(false)
}

/// Move the longest valid UTF-8 prefix of `bytes` into `out`.
///
/// A multi-byte character split across chunks stays in `bytes` until the rest
/// arrives; invalid sequences are replaced.
fn drain_utf8(bytes: &mut Vec<u8>, out: &mut String) {
    match std::str::from_utf8(bytes) {
        Ok(text) => {
            out.push_str(text);
            bytes.clear();
        }
        Err(err) => {
            let valid = err.valid_up_to();
            let cut = match err.error_len() {
                Some(len) => valid + len,
                None => valid,
            };
            out.push_str(&String::from_utf8_lossy(&bytes[..cut]));
            bytes.drain(..cut);
        }
    }
}

struct StreamState<B> {
    body: B,
    bytes: Vec<u8>,
    buffer: String,
    pending: VecDeque<Result<CallEvent>>,
    cancelled: Arc<AtomicBool>,
    idle_timeout: Duration,
    finished: bool,
}

impl<B> StreamState<B> {
    fn enqueue(&mut self, raw: Vec<RawEvent>) {
        for evt in raw {
            match map_sse_event(evt) {
                Ok(Some(event)) => self.pending.push_back(Ok(event)),
                Ok(None) => {}
                Err(err) => {
                    self.pending.push_back(Err(err));
                    self.finished = true;
                    return;
                }
            }
        }
    }
}

fn build_stream(
    response: Response,
    idle_timeout: Duration,
    cancelled: Arc<AtomicBool>,
) -> impl Stream<Item = Result<CallEvent>> + Send {
    let state = StreamState {
        body: Box::pin(response.bytes_stream()),
        bytes: Vec::new(),
        buffer: String::new(),
        pending: VecDeque::new(),
        cancelled,
        idle_timeout,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.cancelled.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match tokio::time::timeout(state.idle_timeout, state.body.next()).await {
                Ok(Some(Ok(chunk))) => {
                    state.bytes.extend_from_slice(&chunk);
                    let mut text = std::mem::take(&mut state.buffer);
                    drain_utf8(&mut state.bytes, &mut text);
                    let (events, remainder) = consume_sse_buffer(&text);
                    state.buffer = remainder;
                    state.enqueue(events);
                }
                Ok(Some(Err(err))) => {
                    state.finished = true;
                    let error = Error::Transport(TransportError::from_reqwest(err, None));
                    return Some((Err(error), state));
                }
                Ok(None) => {
                    // Whatever is left never saw its blank line: a cut-off event.
                    state.finished = true;
                    state.buffer.clear();
                    state.bytes.clear();
                }
                Err(_) => {
                    state.finished = true;
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        idle_ms = state.idle_timeout.as_millis() as u64,
                        "event stream idle timeout"
                    );
                    let error = Error::Transport(TransportError::timeout(format!(
                        "no event stream data for {}ms",
                        state.idle_timeout.as_millis()
                    )));
                    return Some((Err(error), state));
                }
            }
        }
    })
}

fn build_custom_stream<S>(
    stream: S,
    cancelled: Arc<AtomicBool>,
) -> impl Stream<Item = Result<CallEvent>> + Send
where
    S: Stream<Item = Result<CallEvent>> + Send + 'static,
{
    stream::unfold((Box::pin(stream), cancelled), |state| async move {
        let (mut stream, cancelled) = state;
        if cancelled.load(Ordering::SeqCst) {
            return None;
        }
        let item = stream.next().await?;
        Some((item, (stream, cancelled)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        transport::CallEventKind,
        types::{CallProgress, CallStatusKind},
    };

    fn progress(id: &str) -> CallEvent {
        CallEvent::progress(
            Some(id),
            CallProgress {
                call_id: "c1".into(),
                status: CallStatusKind::InProgress,
                phase: None,
                duration_seconds: None,
                partial_transcript: Vec::new(),
                new_turns: Vec::new(),
            },
        )
    }

    #[test]
    fn content_type_matching_ignores_parameters() {
        assert!(is_event_stream("text/event-stream"));
        assert!(is_event_stream("Text/Event-Stream; charset=utf-8"));
        assert!(!is_event_stream("application/json"));
        assert!(!is_event_stream(""));
    }

    #[test]
    fn split_utf8_waits_for_the_rest() {
        let snowman = "☃".as_bytes();
        let mut bytes = snowman[..2].to_vec();
        let mut out = String::new();
        drain_utf8(&mut bytes, &mut out);
        assert_eq!(out, "");
        assert_eq!(bytes.len(), 2);
        bytes.extend_from_slice(&snowman[2..]);
        drain_utf8(&mut bytes, &mut out);
        assert_eq!(out, "☃");
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn scripted_stream_yields_in_order() {
        let mut stream = CallEventStream::from_events(vec![progress("1"), progress("2")]);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.id.as_deref(), Some("1"));
        let second = stream.next().await.unwrap().unwrap();
        assert!(matches!(second.kind, CallEventKind::Progress(_)));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn cancel_stops_the_stream() {
        let mut stream = CallEventStream::from_events(vec![progress("1"), progress("2")]);
        stream.cancel();
        assert!(stream.next().await.is_none());
    }
}
