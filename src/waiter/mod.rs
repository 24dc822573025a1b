//! Call completion waiter.
//!
//! [`WaitSession`] holds the per-wait state and all transition rules as plain
//! methods. [`Waiter`] drives a session over a [`CallTransport`] on tokio,
//! [`BlockingWaiter`] drives one on the calling thread.
//!
//! Transport selection:
//! 1. With `use_stream`, subscribe to the call's event stream.
//! 2. If the subscription cannot be opened, poll instead. Authorization,
//!    rate-limit and policy failures are surfaced rather than masked.
//! 3. If an open subscription drops before a result, reconnect once with the
//!    last event id; a second drop, or a drop on a stream that never carried
//!    ids, switches to polling.
//! 4. Polling repeats `get` until the call is terminal, tolerating a bounded
//!    run of transient failures.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc as std_mpsc, Arc,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures_core::Stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    errors::{CancelReason, Error, ErrorKind, Result, ValidationError},
    progress::ProgressTracker,
    transport::{BlockingCallTransport, CallEvent, CallEventKind, CallTransport},
    types::{CallLookup, CallProgress, CallResult},
    DEFAULT_MAX_TRANSIENT_FAILURES, DEFAULT_POLL_INTERVAL,
};

/// Observer for progress notifications. Runs on the task or thread driving the wait.
pub type ProgressCallback = Arc<dyn Fn(&CallProgress) + Send + Sync>;

/// Longest uninterrupted sleep in the blocking driver.
const BLOCKING_SLICE: Duration = Duration::from_millis(100);

/// HTTP statuses on a stream open that mean "no streaming here", whatever the body says.
const STREAM_UNAVAILABLE_STATUSES: &[u16] = &[404, 405, 406, 501];

/// Options for a single wait.
#[derive(Clone)]
pub struct WaitOptions {
    /// Sleep between polls (defaults to 10s). Must be non-zero.
    pub poll_interval: Duration,
    /// Try the event stream before polling (defaults to true).
    pub use_stream: bool,
    /// Consecutive transient poll failures that end the wait (defaults to 5).
    pub max_transient_failures: u32,
    /// Overall deadline for the wait.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    pub on_progress: Option<ProgressCallback>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            use_stream: true,
            max_transient_failures: DEFAULT_MAX_TRANSIENT_FAILURES,
            timeout: None,
            cancel: None,
            on_progress: None,
        }
    }
}

impl WaitOptions {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Skip the event stream and poll from the start.
    pub fn disable_stream(mut self) -> Self {
        self.use_stream = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_max_transient_failures(mut self, max: u32) -> Self {
        self.max_transient_failures = max;
        self
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CallProgress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(ValidationError::new("must be greater than zero")
                .with_field("poll_interval")
                .into());
        }
        Ok(())
    }

    fn notify(&self, progress: &CallProgress) {
        if let Some(callback) = &self.on_progress {
            callback(progress);
        }
    }
}

impl fmt::Debug for WaitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitOptions")
            .field("poll_interval", &self.poll_interval)
            .field("use_stream", &self.use_stream)
            .field("max_transient_failures", &self.max_transient_failures)
            .field("timeout", &self.timeout)
            .field("cancel", &self.cancel.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Where a wait currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    NotStarted,
    /// Subscribed (or subscribing) to the event stream.
    Streaming { reconnected: bool },
    /// The stream dropped; the single reconnect is next.
    ReconnectingOnce,
    Polling,
    Terminal,
    Failed,
    Cancelled,
}

/// What a single event or poll snapshot meant for the wait.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// New progress to hand to the observer.
    Progress(CallProgress),
    /// Nothing the observer has not already seen.
    Unchanged,
    Finished(CallResult),
}

/// Per-wait state and transition rules, independent of any transport.
#[derive(Debug, Clone)]
pub struct WaitSession {
    call_id: String,
    state: WaitState,
    tracker: ProgressTracker,
    last_event_id: Option<String>,
    stream_events: usize,
    transient_failures: u32,
    max_transient_failures: u32,
    result: Option<CallResult>,
}

impl WaitSession {
    pub fn new(call_id: impl Into<String>, max_transient_failures: u32) -> Self {
        Self {
            call_id: call_id.into(),
            state: WaitState::NotStarted,
            tracker: ProgressTracker::new(),
            last_event_id: None,
            stream_events: 0,
            transient_failures: 0,
            max_transient_failures,
            result: None,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn state(&self) -> WaitState {
        self.state
    }

    /// Resume cursor for the next subscription.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn transient_failures(&self) -> u32 {
        self.transient_failures
    }

    pub fn result(&self) -> Option<&CallResult> {
        self.result.as_ref()
    }

    /// Leave `NotStarted` for either the stream or the poll loop.
    pub fn begin(&mut self, use_stream: bool) -> WaitState {
        if self.state == WaitState::NotStarted {
            self.state = if use_stream {
                WaitState::Streaming { reconnected: false }
            } else {
                WaitState::Polling
            };
        }
        self.state
    }

    pub fn stream_opened(&mut self) {
        if self.state == WaitState::ReconnectingOnce {
            self.state = WaitState::Streaming { reconnected: true };
        }
    }

    /// A subscription could not be opened.
    ///
    /// Streaming being unavailable sends the wait to polling. Failures polling
    /// would hit as well (authorization, rate limit, policy, local
    /// configuration) end the wait with that error.
    pub fn stream_open_failed(&mut self, err: Error) -> Result<()> {
        let unavailable = err
            .api_error()
            .map(|api| STREAM_UNAVAILABLE_STATUSES.contains(&api.status))
            .unwrap_or(false);
        let fatal = matches!(
            err.kind(),
            ErrorKind::AuthFailure
                | ErrorKind::RateLimited
                | ErrorKind::PolicyViolation
                | ErrorKind::Configuration
                | ErrorKind::Validation
                | ErrorKind::Cancelled
        );
        if fatal && !unavailable {
            self.state = WaitState::Failed;
            return Err(err);
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(call_id = %self.call_id, error = %err, "event stream unavailable; polling");
        self.state = WaitState::Polling;
        Ok(())
    }

    /// An open subscription ended without a result, cleanly (`None`) or with an error.
    ///
    /// Transient drops earn one reconnect when the stream can be resumed: it
    /// either carried event ids or delivered nothing yet. Any other error ends
    /// the wait.
    pub fn stream_dropped(&mut self, err: Option<Error>) -> Result<()> {
        if let Some(err) = err {
            if !err.is_transient() {
                self.state = WaitState::Failed;
                return Err(err);
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(call_id = %self.call_id, error = %err, "event stream dropped");
        }

        let resumable = self.last_event_id.is_some() || self.stream_events == 0;
        self.state = match self.state {
            WaitState::Streaming { reconnected: false } if resumable => WaitState::ReconnectingOnce,
            _ => WaitState::Polling,
        };
        #[cfg(feature = "tracing")]
        tracing::debug!(
            call_id = %self.call_id,
            state = ?self.state,
            last_event_id = ?self.last_event_id,
            "event stream closed before a result"
        );
        Ok(())
    }

    /// Record one stream event.
    pub fn observe_event(&mut self, event: CallEvent) -> Observation {
        self.stream_events += 1;
        let sequence = event.sequence();
        if let Some(id) = event.id {
            self.last_event_id = Some(id);
        }
        match event.kind {
            CallEventKind::Result(result) => self.finish(result),
            CallEventKind::Progress(progress) => self.admit(progress, sequence),
        }
    }

    /// Record one successful poll.
    pub fn observe_poll(&mut self, lookup: CallLookup) -> Observation {
        self.transient_failures = 0;
        match lookup {
            CallLookup::Finished(result) => self.finish(result),
            CallLookup::InProgress(status) => self.admit(CallProgress::from(status), None),
        }
    }

    /// Record a failed poll; `Err` means the wait is over.
    pub fn poll_failed(&mut self, err: Error) -> Result<()> {
        if !err.is_transient() {
            self.state = WaitState::Failed;
            return Err(err);
        }
        self.transient_failures += 1;
        if self.transient_failures >= self.max_transient_failures {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                call_id = %self.call_id,
                failures = self.transient_failures,
                error = %err,
                "giving up after consecutive poll failures"
            );
            self.state = WaitState::Failed;
            return Err(err);
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(
            call_id = %self.call_id,
            failures = self.transient_failures,
            error = %err,
            "transient poll failure"
        );
        Ok(())
    }

    pub fn mark_cancelled(&mut self) {
        if !matches!(self.state, WaitState::Terminal | WaitState::Failed) {
            self.state = WaitState::Cancelled;
        }
    }

    fn finish(&mut self, mut result: CallResult) -> Observation {
        if result.call_id.is_empty() {
            result.call_id = self.call_id.clone();
        }
        self.state = WaitState::Terminal;
        self.result = Some(result.clone());
        Observation::Finished(result)
    }

    fn admit(&mut self, mut progress: CallProgress, sequence: Option<u64>) -> Observation {
        if progress.call_id.is_empty() {
            progress.call_id = self.call_id.clone();
        }
        match self.tracker.admit(progress, sequence) {
            Some(progress) => Observation::Progress(progress),
            None => Observation::Unchanged,
        }
    }
}

/// Races suspension points against the caller's token and the deadline.
struct Interrupt {
    cancel: Option<CancellationToken>,
    deadline: Option<tokio::time::Instant>,
}

impl Interrupt {
    fn new(options: &WaitOptions) -> Self {
        Self {
            cancel: options.cancel.clone(),
            deadline: options
                .timeout
                .map(|timeout| tokio::time::Instant::now() + timeout),
        }
    }

    fn check(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(cancelled(CancelReason::Signal));
        }
        if self
            .deadline
            .is_some_and(|deadline| tokio::time::Instant::now() >= deadline)
        {
            return Err(cancelled(CancelReason::Deadline));
        }
        Ok(())
    }

    async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        let signal = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = signal => Err(cancelled(CancelReason::Signal)),
            _ = deadline => Err(cancelled(CancelReason::Deadline)),
            out = fut => Ok(out),
        }
    }
}

fn cancelled(reason: CancelReason) -> Error {
    Error::Cancelled { reason }
}

/// Async driver for [`WaitSession`].
#[derive(Clone, Debug)]
pub struct Waiter<T> {
    transport: T,
}

impl<T: CallTransport> Waiter<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Wait for `call_id` to reach a terminal status.
    ///
    /// Returns `Error::Cancelled` when the token fires or the timeout elapses;
    /// the progress callback is not invoked after that point.
    pub async fn wait(&self, call_id: &str, options: WaitOptions) -> Result<CallResult> {
        options.validate()?;
        if call_id.trim().is_empty() {
            return Err(ValidationError::new("is required").with_field("call_id").into());
        }
        let interrupt = Interrupt::new(&options);
        let mut session = WaitSession::new(call_id, options.max_transient_failures);
        let result = self.drive(&mut session, &options, &interrupt).await;
        if matches!(result, Err(Error::Cancelled { .. })) {
            session.mark_cancelled();
            #[cfg(feature = "tracing")]
            tracing::debug!(call_id, "wait cancelled");
        }
        result
    }

    async fn drive(
        &self,
        session: &mut WaitSession,
        options: &WaitOptions,
        interrupt: &Interrupt,
    ) -> Result<CallResult> {
        interrupt.check()?;
        let call_id = session.call_id().to_string();

        if session.begin(options.use_stream) != WaitState::Polling {
            loop {
                let cursor = session.last_event_id().map(str::to_string);
                let opened = interrupt
                    .run(self.transport.open_events(&call_id, cursor.as_deref()))
                    .await?;
                let mut stream = match opened {
                    Ok(stream) => {
                        session.stream_opened();
                        stream
                    }
                    Err(err) => {
                        session.stream_open_failed(err)?;
                        break;
                    }
                };

                let dropped = loop {
                    match interrupt.run(stream.next()).await? {
                        Some(Ok(event)) => match session.observe_event(event) {
                            Observation::Finished(result) => return Ok(result),
                            Observation::Progress(progress) => {
                                interrupt.check()?;
                                options.notify(&progress);
                            }
                            Observation::Unchanged => {}
                        },
                        Some(Err(err)) => break Some(err),
                        None => break None,
                    }
                };
                drop(stream);

                session.stream_dropped(dropped)?;
                if session.state() == WaitState::Polling {
                    break;
                }
            }
        }

        loop {
            match interrupt.run(self.transport.get_call(&call_id)).await? {
                Ok(lookup) => match session.observe_poll(lookup) {
                    Observation::Finished(result) => return Ok(result),
                    Observation::Progress(progress) => {
                        interrupt.check()?;
                        options.notify(&progress);
                    }
                    Observation::Unchanged => {}
                },
                Err(err) => session.poll_failed(err)?,
            }
            interrupt
                .run(tokio::time::sleep(options.poll_interval))
                .await?;
        }
    }
}

impl<T> Waiter<T>
where
    T: CallTransport + Clone + 'static,
{
    /// Run the wait on a background task and observe it as a stream.
    ///
    /// Must be called from within a tokio runtime. Dropping the returned
    /// [`CallWatch`] cancels the wait.
    pub fn watch(&self, call_id: impl Into<String>, mut options: WaitOptions) -> CallWatch {
        let token = options
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let (tx, rx) = mpsc::unbounded_channel();

        let progress_tx = tx.clone();
        options.cancel = Some(token.clone());
        options.on_progress = Some(Arc::new(move |progress: &CallProgress| {
            let _ = progress_tx.send(Ok(WaitUpdate::Progress(progress.clone())));
        }));

        let waiter = self.clone();
        let call_id = call_id.into();
        tokio::spawn(async move {
            let outcome = waiter.wait(&call_id, options).await;
            let _ = tx.send(outcome.map(WaitUpdate::Finished));
        });

        CallWatch {
            rx,
            cancel: token,
            done: false,
        }
    }
}

/// One item from a [`CallWatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WaitUpdate {
    Progress(CallProgress),
    Finished(CallResult),
}

/// Stream of progress updates ending in exactly one result or error.
pub struct CallWatch {
    rx: mpsc::UnboundedReceiver<Result<WaitUpdate>>,
    cancel: CancellationToken,
    done: bool,
}

impl CallWatch {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain the stream and return the terminal result.
    pub async fn finish(mut self) -> Result<CallResult> {
        while let Some(update) = self.next().await {
            if let WaitUpdate::Finished(result) = update? {
                return Ok(result);
            }
        }
        Err(cancelled(CancelReason::Signal))
    }
}

impl Stream for CallWatch {
    type Item = Result<WaitUpdate>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                if !matches!(item, Ok(WaitUpdate::Progress(_))) {
                    self.done = true;
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CallWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for CallWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallWatch")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

/// Blocking driver for [`WaitSession`].
///
/// Sleeps are sliced so the token and deadline are observed within ~100ms.
/// Stream reads happen on a helper thread. When the wait leaves the stream the
/// subscription is flagged for release and closed after the reader's next
/// line, usually a heartbeat. A stream that sends nothing at all is held until
/// its read fails, bounded by the client's `stream_idle_timeout`.
#[derive(Clone, Debug)]
pub struct BlockingWaiter<T> {
    transport: T,
}

/// Flags a blocking subscription for release when the reading loop exits.
struct ReleaseOnDrop(Arc<AtomicBool>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl<T: BlockingCallTransport> BlockingWaiter<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn wait(&self, call_id: &str, options: WaitOptions) -> Result<CallResult> {
        options.validate()?;
        if call_id.trim().is_empty() {
            return Err(ValidationError::new("is required").with_field("call_id").into());
        }
        let guard = BlockingInterrupt {
            cancel: options.cancel.clone(),
            deadline: options.timeout.map(|timeout| Instant::now() + timeout),
        };
        let mut session = WaitSession::new(call_id, options.max_transient_failures);
        let result = self.drive(&mut session, &options, &guard);
        if matches!(result, Err(Error::Cancelled { .. })) {
            session.mark_cancelled();
        }
        result
    }

    fn drive(
        &self,
        session: &mut WaitSession,
        options: &WaitOptions,
        guard: &BlockingInterrupt,
    ) -> Result<CallResult> {
        guard.check()?;
        let call_id = session.call_id().to_string();

        if session.begin(options.use_stream) != WaitState::Polling {
            loop {
                let cursor = session.last_event_id().map(str::to_string);
                let stream = match self.transport.open_events(&call_id, cursor.as_deref()) {
                    Ok(stream) => {
                        session.stream_opened();
                        stream
                    }
                    Err(err) => {
                        guard.check()?;
                        session.stream_open_failed(err)?;
                        break;
                    }
                };

                let _release = ReleaseOnDrop(stream.cancel_handle());
                let (tx, rx) = std_mpsc::channel();
                std::thread::spawn(move || {
                    for item in stream {
                        if tx.send(item).is_err() {
                            break;
                        }
                    }
                });

                let dropped = loop {
                    guard.check()?;
                    match rx.recv_timeout(guard.slice()) {
                        Ok(Ok(event)) => match session.observe_event(event) {
                            Observation::Finished(result) => return Ok(result),
                            Observation::Progress(progress) => {
                                guard.check()?;
                                options.notify(&progress);
                            }
                            Observation::Unchanged => {}
                        },
                        Ok(Err(err)) => break Some(err),
                        Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                        Err(std_mpsc::RecvTimeoutError::Disconnected) => break None,
                    }
                };

                session.stream_dropped(dropped)?;
                if session.state() == WaitState::Polling {
                    break;
                }
            }
        }

        loop {
            guard.check()?;
            match self.transport.get_call(&call_id) {
                Ok(lookup) => match session.observe_poll(lookup) {
                    Observation::Finished(result) => return Ok(result),
                    Observation::Progress(progress) => {
                        guard.check()?;
                        options.notify(&progress);
                    }
                    Observation::Unchanged => {}
                },
                Err(err) => session.poll_failed(err)?,
            }
            guard.sleep(options.poll_interval)?;
        }
    }
}

struct BlockingInterrupt {
    cancel: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl BlockingInterrupt {
    fn check(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(cancelled(CancelReason::Signal));
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(cancelled(CancelReason::Deadline));
        }
        Ok(())
    }

    /// Next wait slice, shortened to land on the deadline.
    fn slice(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(BLOCKING_SLICE)
                .max(Duration::from_millis(1)),
            None => BLOCKING_SLICE,
        }
    }

    fn sleep(&self, duration: Duration) -> Result<()> {
        let end = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= end {
                return Ok(());
            }
            std::thread::sleep((end - now).min(self.slice()));
        }
    }
}
