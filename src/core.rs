//! Shared runtime-agnostic logic for async and blocking clients.
//!
//! This module contains data structures and pure functions that are used by both
//! the async client (`client.rs`) and the blocking client (`blocking.rs`).
//!
//! ## Contents
//!
//! - **Retry State**: [`RetryState`] for tracking HTTP retry attempts
//! - **SSE Parsing**: [`RawEvent`], [`consume_sse_buffer`], [`map_sse_event`] for call events
//! - **Blocking reader**: `SseLines` turns a `BufRead` into parsed call events

#[cfg(any(test, feature = "blocking"))]
use std::{
    io::BufRead,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

#[cfg(any(test, feature = "blocking"))]
use crate::errors::{TransportError, TransportErrorKind};

use reqwest::StatusCode;

use crate::{
    errors::{Error, Result, RetryMetadata},
    http::{api_error_from_value, classify_api_error},
    transport::{CallEvent, CallEventKind},
    types::{parse_call_payload, parse_progress_payload, CallLookup, CallProgress},
};

/// Tracks retry state across attempts for both async and blocking clients.
#[derive(Default)]
pub(crate) struct RetryState {
    pub(crate) attempts: u32,
    pub(crate) last_status: Option<u16>,
    pub(crate) last_error: Option<String>,
}

impl RetryState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_attempt(&mut self, attempt: u32) {
        self.attempts = attempt;
    }

    pub(crate) fn record_status(&mut self, status: StatusCode) {
        self.last_status = Some(status.as_u16());
    }

    pub(crate) fn record_error(&mut self, err: &reqwest::Error) {
        self.last_error = Some(err.to_string());
    }

    pub(crate) fn metadata(&self) -> Option<RetryMetadata> {
        if self.attempts <= 1 {
            None
        } else {
            Some(RetryMetadata {
                attempts: self.attempts,
                last_status: self.last_status,
                last_error: self.last_error.clone(),
            })
        }
    }
}

/// A single SSE event block before interpretation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct RawEvent {
    pub(crate) id: Option<String>,
    pub(crate) event: String,
    pub(crate) data: String,
}

/// Consumes complete SSE blocks (terminated by a blank line) from a buffer.
///
/// Returns the parsed blocks and the remaining incomplete buffer. A block is
/// only dispatched once its blank line arrives; readers drop the remainder at EOF.
pub(crate) fn consume_sse_buffer(buffer: &str) -> (Vec<RawEvent>, String) {
    let mut events = Vec::new();
    let mut remainder = buffer.replace("\r\n", "\n");

    loop {
        if let Some(idx) = remainder.find("\n\n") {
            let (block, rest) = remainder.split_at(idx);
            let rest_owned = rest[2..].to_string();
            if let Some(evt) = parse_event_block(block) {
                events.push(evt);
            }
            remainder = rest_owned;
            continue;
        }
        break;
    }

    (events, remainder)
}

/// Parse one event block. Comment-only blocks (heartbeats) yield `None`.
pub(crate) fn parse_event_block(block: &str) -> Option<RawEvent> {
    let mut id: Option<String> = None;
    let mut event_name = String::new();
    let mut data_lines: Vec<String> = Vec::new();

    for line in block.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("id:") {
            let rest = rest.trim();
            if !rest.is_empty() {
                id = Some(rest.to_string());
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event_name = rest.trim().to_string();
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim().to_string());
            continue;
        }
    }

    if id.is_none() && event_name.is_empty() && data_lines.is_empty() {
        return None;
    }

    Some(RawEvent {
        id,
        event: event_name,
        data: data_lines.join("\n"),
    })
}

/// Maps a raw SSE block to a call event.
///
/// Returns:
/// - `Ok(Some(event))` - progress or terminal result
/// - `Ok(None)` - expected skip (unknown event names, empty payloads)
/// - `Err(...)` - remote `error` event or unparsable payload, surfaced as-is
///
/// Event names:
/// - `status` / `transcript` / `progress`: progress snapshot (terminal status becomes a result)
/// - `result`: terminal payload, same shape as `GET /call/{id}`
/// - `error`: `{"error":{"code","message"}}`
pub(crate) fn map_sse_event(raw: RawEvent) -> Result<Option<CallEvent>> {
    let RawEvent { id, event, data } = raw;
    match event.as_str() {
        "result" => {
            let result = match parse_call_payload(&data)? {
                CallLookup::Finished(result) => result,
                CallLookup::InProgress(_) => {
                    return Err(Error::malformed(
                        "result event did not carry a terminal status",
                        Some(&data),
                    ))
                }
            };
            Ok(Some(CallEvent {
                id,
                kind: CallEventKind::Result(result),
            }))
        }
        "status" | "transcript" | "progress" => {
            if data.trim().is_empty() {
                return Ok(None);
            }
            let kind = match parse_progress_payload(&data)? {
                CallLookup::Finished(result) => CallEventKind::Result(result),
                CallLookup::InProgress(status) => {
                    CallEventKind::Progress(CallProgress::from(status))
                }
            };
            Ok(Some(CallEvent { id, kind }))
        }
        "error" => {
            let value: serde_json::Value = serde_json::from_str(&data)
                .map_err(|err| Error::malformed(format!("invalid error event: {err}"), Some(&data)))?;
            let api = api_error_from_value(0, &value).ok_or_else(|| {
                Error::malformed("error event is missing the error envelope", Some(&data))
            })?;
            Err(classify_api_error(api))
        }
        _ => Ok(None),
    }
}

/// Blocking SSE reader: yields parsed call events from a line-oriented body.
///
/// The cancel flag is checked after every line, so heartbeats are enough for
/// a released subscription to stop reading.
#[cfg(any(test, feature = "blocking"))]
pub(crate) struct SseLines<R> {
    reader: R,
    block: String,
    done: bool,
    cancelled: Option<Arc<AtomicBool>>,
}

#[cfg(any(test, feature = "blocking"))]
impl<R: BufRead> SseLines<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            block: String::new(),
            done: false,
            cancelled: None,
        }
    }

    pub(crate) fn with_cancel(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = Some(cancelled);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn take_block(&mut self) -> Option<RawEvent> {
        let block = std::mem::take(&mut self.block);
        parse_event_block(&block)
    }
}

#[cfg(any(test, feature = "blocking"))]
impl<R: BufRead> Iterator for SseLines<R> {
    type Item = Result<CallEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if self.is_cancelled() {
                self.done = true;
                return None;
            }
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    // An unterminated block at EOF is a cut-off event.
                    self.done = true;
                    self.block.clear();
                }
                Ok(_) => {
                    let line = line.trim_end_matches(['\r', '\n']);
                    if !line.is_empty() {
                        self.block.push_str(line);
                        self.block.push('\n');
                        continue;
                    }
                    if let Some(raw) = self.take_block() {
                        match map_sse_event(raw) {
                            Ok(Some(evt)) => return Some(Ok(evt)),
                            Ok(None) => {}
                            Err(err) => return Some(Err(err)),
                        }
                    }
                }
                Err(err) => {
                    self.done = true;
                    let kind = if matches!(
                        err.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) {
                        TransportErrorKind::Timeout
                    } else {
                        TransportErrorKind::Closed
                    };
                    return Some(Err(Error::Transport(TransportError::new(
                        kind,
                        format!("event stream read failed: {err}"),
                    ))));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::types::{CallPhase, CallStatusKind};

    #[test]
    fn parses_ids_names_and_data() {
        let data = "id: 1\nevent: status\ndata: {\"call_id\":\"c1\",\"status\":\"in_progress\",\"phase\":\"ringing\"}\n\n: heartbeat\n\nid: 2\nevent: result\ndata: {\"call_id\":\"c1\",\"status\":\"completed\"}\n\n";
        let (events, remainder) = consume_sse_buffer(data);
        assert_eq!(remainder, "");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id.as_deref(), Some("1"));
        assert_eq!(events[1].event, "result");

        let progress = map_sse_event(events[0].clone()).unwrap().unwrap();
        match progress.kind {
            CallEventKind::Progress(p) => {
                assert_eq!(p.status, CallStatusKind::InProgress);
                assert_eq!(p.phase, Some(CallPhase::Ringing));
            }
            other => panic!("expected progress, got {other:?}"),
        }
        let result = map_sse_event(events[1].clone()).unwrap().unwrap();
        assert!(matches!(result.kind, CallEventKind::Result(_)));
    }

    #[test]
    fn handles_crlf_and_incomplete_buffers() {
        let data = "event: status\r\ndata: {\"status\":\"pending\"}\r\n\r\nevent: transcript\r\ndata: {";
        let (events, remainder) = consume_sse_buffer(data);
        assert_eq!(events.len(), 1);
        assert_eq!(remainder, "event: transcript\ndata: {");
    }

    #[test]
    fn multi_line_data_is_joined() {
        let raw = parse_event_block("event: status\ndata: {\"status\":\ndata: \"pending\"}").unwrap();
        assert_eq!(raw.data, "{\"status\":\n\"pending\"}");
        assert!(map_sse_event(raw).unwrap().is_some());
    }

    #[test]
    fn heartbeat_blocks_are_skipped() {
        assert!(parse_event_block(": keepalive").is_none());
        let unknown = RawEvent {
            id: None,
            event: "ping".into(),
            data: "{}".into(),
        };
        assert!(map_sse_event(unknown).unwrap().is_none());
    }

    #[test]
    fn non_terminal_result_event_is_malformed() {
        let raw = RawEvent {
            id: None,
            event: "result".into(),
            data: r#"{"call_id":"c1","status":"in_progress"}"#.into(),
        };
        assert_eq!(
            map_sse_event(raw).unwrap_err().kind(),
            ErrorKind::MalformedResponse
        );
    }

    #[test]
    fn error_event_is_classified() {
        let raw = RawEvent {
            id: Some("4".into()),
            event: "error".into(),
            data: r#"{"error":{"code":"TOKEN_EXPIRED","message":"expired"}}"#.into(),
        };
        let err = map_sse_event(raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
        assert_eq!(err.api_error().unwrap().status, 0);
    }

    #[test]
    fn invalid_json_is_malformed() {
        let raw = RawEvent {
            id: None,
            event: "status".into(),
            data: "not json".into(),
        };
        assert_eq!(
            map_sse_event(raw).unwrap_err().kind(),
            ErrorKind::MalformedResponse
        );
    }

    #[test]
    fn blocking_reader_yields_events() {
        let body = "id: 1\nevent: status\ndata: {\"status\":\"in_progress\"}\n\n:hb\n\nid: 2\nevent: result\ndata: {\"call_id\":\"c\",\"status\":\"failed\"}\n\n";
        let events: Vec<_> = SseLines::new(body.as_bytes()).collect();
        assert_eq!(events.len(), 2);
        let first = events[0].as_ref().unwrap();
        assert_eq!(first.id.as_deref(), Some("1"));
        let last = events[1].as_ref().unwrap();
        assert!(matches!(last.kind, CallEventKind::Result(_)));
    }

    #[test]
    fn blocking_reader_drops_unterminated_tail() {
        let body = "id: 1\nevent: status\ndata: {\"status\":\"in_progress\"}\n\nid: 2\nevent: result\ndata: {\"call_id\":\"c\",\"status\":\"compl";
        let events: Vec<_> = SseLines::new(body.as_bytes()).collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap().id.as_deref(), Some("1"));
    }

    #[test]
    fn blocking_reader_stops_once_cancelled() {
        let body = ": hb\n\n: hb\n\nid: 1\nevent: status\ndata: {\"status\":\"in_progress\"}\n\n";
        let flag = Arc::new(AtomicBool::new(false));
        let mut lines = SseLines::new(body.as_bytes()).with_cancel(flag.clone());
        flag.store(true, Ordering::SeqCst);
        assert!(lines.next().is_none());
        assert!(lines.next().is_none());
    }

    #[test]
    fn retry_metadata_only_after_retries() {
        let mut state = RetryState::new();
        state.record_attempt(1);
        assert!(state.metadata().is_none());
        state.record_attempt(2);
        state.record_status(StatusCode::BAD_GATEWAY);
        assert_eq!(state.metadata().unwrap().last_status, Some(502));
    }
}
