//! The streaming answer controller.
//!
//! One session exists per question, owned exclusively by the requesting
//! connection. The controller registry hands out a command channel per
//! session (pause/resume/cancel) and an event channel carrying
//! [`AnswerEvent`]s back to the client.
//!
//! Pause is a client-facing illusion: the upstream provider has no pause
//! primitive, so the upstream stream keeps flowing and arriving chunks are
//! buffered locally. Resume flushes the buffer in arrival order before any
//! live chunk. Cancel drops the upstream stream (which aborts the call),
//! discards the buffer, and is reported as `Cancelled`, never as an error.
//! Every session await races against the command channel, so a cancel also
//! aborts retrieval, a retry backoff, the single-shot fallback, and the
//! follow-up step, not just a live stream.
//!
//! A session has at most one in-flight upstream completion call at a time;
//! the retry loop is strictly sequential.

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::embedding::backoff_delay;
use crate::retrieval::{RetrievalEngine, RetrievalOptions, RetrievalScope};
use crate::types::PipelineError;

use super::prompt::{self, GroundedPrompt};
use super::{AnswerEvent, CompletionProvider, CompletionStream, SessionStatus, citations};

/// A question to answer, with its owner scope and retrieval tuning.
#[derive(Clone, Debug)]
pub struct AnswerRequest {
    pub query: String,
    pub owner_id: String,
    pub scope: RetrievalScope,
    pub retrieval: RetrievalOptions,
}

impl AnswerRequest {
    pub fn new(query: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            owner_id: owner_id.into(),
            scope: RetrievalScope::default(),
            retrieval: RetrievalOptions::default(),
        }
    }

    #[must_use]
    pub fn with_scope(mut self, scope: RetrievalScope) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub fn with_retrieval(mut self, options: RetrievalOptions) -> Self {
        self.retrieval = options;
        self
    }
}

/// Controller-level tuning.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Retries after the initial streaming attempt, for retryable errors.
    pub max_stream_retries: u32,
    pub retry_base_delay: std::time::Duration,
    /// Sessions with no activity for this long are reaped.
    pub idle_timeout: std::time::Duration,
    /// Whether to run the best-effort follow-up suggestion step.
    pub suggest_follow_ups: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_stream_retries: 3,
            retry_base_delay: std::time::Duration::from_millis(500),
            idle_timeout: std::time::Duration::from_secs(300),
            suggest_follow_ups: true,
        }
    }
}

/// Handle returned to the caller: the session id plus the event channel.
#[derive(Debug)]
pub struct AnswerStream {
    pub session_id: String,
    pub events: flume::Receiver<AnswerEvent>,
}

enum SessionCommand {
    Pause,
    Resume,
    Cancel,
}

struct SessionShared {
    status: Mutex<SessionStatus>,
    last_activity: Mutex<Instant>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            status: Mutex::new(SessionStatus::Idle),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.lock() = status;
        self.touch();
    }

    fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }
}

struct SessionHandle {
    commands: flume::Sender<SessionCommand>,
    shared: Arc<SessionShared>,
}

/// Drives LLM completion streams for concurrent answer sessions.
pub struct AnswerController {
    retrieval: Arc<RetrievalEngine>,
    completions: Arc<dyn CompletionProvider>,
    config: ControllerConfig,
    sessions: Arc<Mutex<FxHashMap<String, SessionHandle>>>,
}

impl AnswerController {
    pub fn new(
        retrieval: Arc<RetrievalEngine>,
        completions: Arc<dyn CompletionProvider>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            retrieval,
            completions,
            config,
            sessions: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Start answering a question, returning the session's event stream.
    ///
    /// Input validation happens here, before any upstream call: an empty
    /// query or a request with both retrieval sources disabled is rejected
    /// synchronously.
    pub fn ask(&self, request: AnswerRequest) -> Result<AnswerStream, PipelineError> {
        if request.query.trim().is_empty() {
            return Err(PipelineError::invalid_input("empty query"));
        }
        if !request.retrieval.enable_docs && !request.retrieval.enable_web {
            return Err(PipelineError::invalid_input(
                "at least one retrieval source must be enabled",
            ));
        }

        let session_id = Uuid::new_v4().to_string();
        let (event_tx, event_rx) = flume::unbounded();
        let (command_tx, command_rx) = flume::unbounded();
        let shared = Arc::new(SessionShared::new());

        self.sessions.lock().insert(
            session_id.clone(),
            SessionHandle {
                commands: command_tx,
                shared: Arc::clone(&shared),
            },
        );

        let ctx = SessionCtx {
            session_id: session_id.clone(),
            request,
            retrieval: Arc::clone(&self.retrieval),
            completions: Arc::clone(&self.completions),
            config: self.config.clone(),
            events: event_tx,
            commands: command_rx,
            shared,
            sessions: Arc::clone(&self.sessions),
        };
        tokio::spawn(run_session(ctx));

        Ok(AnswerStream {
            session_id,
            events: event_rx,
        })
    }

    /// Stop forwarding chunks to the client; arriving chunks are buffered.
    pub fn pause(&self, session_id: &str) -> Result<(), PipelineError> {
        self.command(session_id, SessionCommand::Pause)
    }

    /// Flush buffered chunks in arrival order and go live again.
    pub fn resume(&self, session_id: &str) -> Result<(), PipelineError> {
        self.command(session_id, SessionCommand::Resume)
    }

    /// Abort the upstream call and discard buffered content. Reported to the
    /// client as `Cancelled`, not as an error.
    pub fn cancel(&self, session_id: &str) -> Result<(), PipelineError> {
        self.command(session_id, SessionCommand::Cancel)
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|handle| handle.shared.status())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Drop sessions idle beyond the configured timeout. Dropping a
    /// session's command channel cancels its task cooperatively.
    pub fn reap_idle(&self) -> usize {
        let timeout = self.config.idle_timeout;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|id, handle| {
            let keep = handle.shared.idle_for() <= timeout;
            if !keep {
                tracing::info!(session_id = %id, "reaping idle session");
            }
            keep
        });
        before - sessions.len()
    }

    fn command(&self, session_id: &str, command: SessionCommand) -> Result<(), PipelineError> {
        let sessions = self.sessions.lock();
        let handle = sessions
            .get(session_id)
            .ok_or_else(|| PipelineError::UnknownSession(session_id.to_string()))?;
        handle.shared.touch();
        handle
            .commands
            .send(command)
            .map_err(|_| PipelineError::UnknownSession(session_id.to_string()))
    }
}

struct SessionCtx {
    session_id: String,
    request: AnswerRequest,
    retrieval: Arc<RetrievalEngine>,
    completions: Arc<dyn CompletionProvider>,
    config: ControllerConfig,
    events: flume::Sender<AnswerEvent>,
    commands: flume::Receiver<SessionCommand>,
    shared: Arc<SessionShared>,
    sessions: Arc<Mutex<FxHashMap<String, SessionHandle>>>,
}

impl SessionCtx {
    /// Returns `false` when the client receiver is gone.
    fn send(&self, event: AnswerEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

/// Mutable state carried across stream attempts within one session.
struct LiveSession {
    answer: String,
    buffered: Vec<String>,
    paused: bool,
    attempt: u32,
}

enum PumpResult {
    Finished,
    Cancelled,
    ClientGone,
    Failed(PipelineError),
}

enum RetryDecision {
    Retry,
    Fallback,
    Cancelled,
    Fail(PipelineError),
}

async fn run_session(ctx: SessionCtx) {
    drive_session(&ctx).await;
    ctx.sessions.lock().remove(&ctx.session_id);
}

async fn drive_session(ctx: &SessionCtx) {
    let mut session = LiveSession {
        answer: String::new(),
        buffered: Vec::new(),
        paused: false,
        attempt: 0,
    };

    let retrieved = await_or_cancel(
        ctx,
        &mut session,
        ctx.retrieval.retrieve(
            &ctx.request.query,
            &ctx.request.owner_id,
            &ctx.request.scope,
            &ctx.request.retrieval,
        ),
    )
    .await;
    let outcome = match retrieved {
        None => {
            cancelled(ctx);
            return;
        }
        Some(Ok(outcome)) => outcome,
        Some(Err(err)) => {
            fail(ctx, err);
            return;
        }
    };
    let grounded = prompt::build_grounded_prompt(&ctx.request.query, &outcome);

    loop {
        let opened =
            await_or_cancel(ctx, &mut session, ctx.completions.stream(&grounded.prompt)).await;
        let stream = match opened {
            None => {
                cancelled(ctx);
                return;
            }
            Some(Ok(stream)) => stream,
            Some(Err(err)) => match classify_retry(ctx, &mut session, err).await {
                RetryDecision::Retry => continue,
                RetryDecision::Fallback => {
                    run_fallback(ctx, &grounded, &mut session).await;
                    return;
                }
                RetryDecision::Cancelled => {
                    cancelled(ctx);
                    return;
                }
                RetryDecision::Fail(err) => {
                    fail(ctx, err);
                    return;
                }
            },
        };
        if !session.paused {
            ctx.shared.set_status(SessionStatus::Streaming);
        }

        match pump_stream(ctx, stream, &mut session).await {
            PumpResult::Finished => break,
            PumpResult::Cancelled => {
                cancelled(ctx);
                return;
            }
            PumpResult::ClientGone => {
                ctx.shared.set_status(SessionStatus::Cancelled);
                return;
            }
            PumpResult::Failed(err) => match classify_retry(ctx, &mut session, err).await {
                RetryDecision::Retry => continue,
                RetryDecision::Fallback => {
                    run_fallback(ctx, &grounded, &mut session).await;
                    return;
                }
                RetryDecision::Cancelled => {
                    cancelled(ctx);
                    return;
                }
                RetryDecision::Fail(err) => {
                    fail(ctx, err);
                    return;
                }
            },
        }
    }

    finish(ctx, &grounded, &mut session).await;
}

/// Forward one upstream stream until it ends, fails, or the session is
/// cancelled. Commands win the race against arriving chunks so a cancel
/// takes effect within one scheduling tick.
async fn pump_stream(
    ctx: &SessionCtx,
    mut stream: CompletionStream,
    session: &mut LiveSession,
) -> PumpResult {
    // A retried stream restarts from the beginning of the completion; skip
    // text equivalent to what the session already holds so the client never
    // sees a duplicate. What was sent, stays sent.
    let mut resume_skip = session.answer.chars().count();

    loop {
        tokio::select! {
            biased;
            command = ctx.commands.recv_async() => match command {
                Ok(SessionCommand::Pause) => {
                    if !session.paused {
                        session.paused = true;
                        ctx.shared.set_status(SessionStatus::Paused);
                    }
                }
                Ok(SessionCommand::Resume) => {
                    if session.paused {
                        session.paused = false;
                        ctx.shared.set_status(SessionStatus::Streaming);
                        for text in session.buffered.drain(..) {
                            if !ctx.send(AnswerEvent::delta(&ctx.session_id, text)) {
                                return PumpResult::ClientGone;
                            }
                        }
                    }
                }
                Ok(SessionCommand::Cancel) | Err(_) => {
                    // Dropping `stream` aborts the upstream call.
                    session.buffered.clear();
                    return PumpResult::Cancelled;
                }
            },
            item = stream.next() => match item {
                Some(Ok(piece)) => {
                    let piece = skip_chars(piece, &mut resume_skip);
                    if piece.is_empty() {
                        continue;
                    }
                    session.answer.push_str(&piece);
                    ctx.shared.touch();
                    if session.paused {
                        session.buffered.push(piece);
                    } else if !ctx.send(AnswerEvent::delta(&ctx.session_id, piece)) {
                        return PumpResult::ClientGone;
                    }
                }
                Some(Err(err)) => return PumpResult::Failed(err),
                None => return PumpResult::Finished,
            },
        }
    }
}

/// Race a session-long await against the command channel, so commands land
/// even while no stream is being pumped (retrieval, stream open, retry
/// backoff, the fallback completion, follow-up suggestion). Pause and resume
/// behave exactly as in the pump; cancel (or a dropped command handle) wins
/// the race and returns `None`, dropping the awaited future and with it any
/// upstream call it holds.
async fn await_or_cancel<T>(
    ctx: &SessionCtx,
    session: &mut LiveSession,
    fut: impl std::future::Future<Output = T>,
) -> Option<T> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            command = ctx.commands.recv_async() => match command {
                Ok(SessionCommand::Pause) => {
                    if !session.paused {
                        session.paused = true;
                        ctx.shared.set_status(SessionStatus::Paused);
                    }
                }
                Ok(SessionCommand::Resume) => {
                    if session.paused {
                        session.paused = false;
                        ctx.shared.set_status(SessionStatus::Streaming);
                        for text in session.buffered.drain(..) {
                            if !ctx.send(AnswerEvent::delta(&ctx.session_id, text)) {
                                return None;
                            }
                        }
                    }
                }
                Ok(SessionCommand::Cancel) | Err(_) => {
                    session.buffered.clear();
                    return None;
                }
            },
            out = &mut fut => return Some(out),
        }
    }
}

/// Retryable errors back off and retry until the budget is spent, then fall
/// back to a single non-streaming completion. Permanent errors (auth,
/// malformed request) fail immediately: zero retries, and the fallback is
/// not eligible.
async fn classify_retry(
    ctx: &SessionCtx,
    session: &mut LiveSession,
    err: PipelineError,
) -> RetryDecision {
    if !err.is_retryable() {
        return RetryDecision::Fail(err);
    }
    if session.attempt >= ctx.config.max_stream_retries {
        tracing::warn!(
            session_id = %ctx.session_id,
            attempts = session.attempt + 1,
            error = %err,
            "streaming retries exhausted, falling back to single-shot completion"
        );
        return RetryDecision::Fallback;
    }
    let delay = backoff_delay(ctx.config.retry_base_delay, session.attempt);
    session.attempt += 1;
    tracing::debug!(
        session_id = %ctx.session_id,
        attempt = session.attempt,
        delay_ms = delay.as_millis() as u64,
        error = %err,
        "retrying completion stream"
    );
    if await_or_cancel(ctx, session, tokio::time::sleep(delay))
        .await
        .is_none()
    {
        return RetryDecision::Cancelled;
    }
    RetryDecision::Retry
}

async fn run_fallback(ctx: &SessionCtx, grounded: &GroundedPrompt, session: &mut LiveSession) {
    let completed =
        match await_or_cancel(ctx, session, ctx.completions.complete(&grounded.prompt)).await {
            None => {
                cancelled(ctx);
                return;
            }
            Some(completed) => completed,
        };
    match completed {
        Ok(full) => {
            let mut skip = session.answer.chars().count();
            let remainder = skip_chars(full, &mut skip);
            if !remainder.is_empty() {
                session.answer.push_str(&remainder);
                if session.paused {
                    session.buffered.push(remainder);
                } else if !ctx.send(AnswerEvent::delta(&ctx.session_id, remainder)) {
                    ctx.shared.set_status(SessionStatus::Cancelled);
                    return;
                }
            }
            finish(ctx, grounded, session).await;
        }
        Err(err) => fail(ctx, err.into_unavailable(session.attempt + 1)),
    }
}

async fn finish(ctx: &SessionCtx, grounded: &GroundedPrompt, session: &mut LiveSession) {
    // Anything still buffered from a pause is delivered before the terminal
    // events, preserving arrival order.
    for text in session.buffered.drain(..) {
        if !ctx.send(AnswerEvent::delta(&ctx.session_id, text)) {
            ctx.shared.set_status(SessionStatus::Cancelled);
            return;
        }
    }

    let cited = citations::extract_citations(&session.answer, &grounded.citations);
    if !ctx.send(AnswerEvent::Citations {
        session_id: ctx.session_id.clone(),
        citations: cited,
    }) {
        ctx.shared.set_status(SessionStatus::Cancelled);
        return;
    }

    let follow_ups = if ctx.config.suggest_follow_ups {
        let suggestion_prompt = prompt::follow_up_prompt(&ctx.request.query, &session.answer);
        let suggestion =
            await_or_cancel(ctx, session, ctx.completions.complete(&suggestion_prompt)).await;
        match suggestion {
            // Cancel during the suggestion step aborts the call; the answer
            // itself was already delivered as deltas.
            None => {
                cancelled(ctx);
                return;
            }
            Some(Ok(raw)) => prompt::parse_follow_ups(&raw),
            Some(Err(err)) => {
                // Best-effort: never fails the primary answer.
                tracing::debug!(session_id = %ctx.session_id, error = %err, "follow-up suggestion failed");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    ctx.send(AnswerEvent::Completed {
        session_id: ctx.session_id.clone(),
        answer: std::mem::take(&mut session.answer),
        follow_ups,
    });
    ctx.shared.set_status(SessionStatus::Completed);
}

fn cancelled(ctx: &SessionCtx) {
    ctx.send(AnswerEvent::Cancelled {
        session_id: ctx.session_id.clone(),
    });
    ctx.shared.set_status(SessionStatus::Cancelled);
}

fn fail(ctx: &SessionCtx, err: PipelineError) {
    tracing::error!(session_id = %ctx.session_id, error = %err, "answer session failed");
    ctx.send(AnswerEvent::Errored {
        session_id: ctx.session_id.clone(),
        message: err.to_string(),
    });
    ctx.shared.set_status(SessionStatus::Errored);
}

/// Drop the first `skip` characters from `piece`, decrementing `skip` by the
/// amount consumed.
fn skip_chars(piece: String, skip: &mut usize) -> String {
    if *skip == 0 {
        return piece;
    }
    let total = piece.chars().count();
    if total <= *skip {
        *skip -= total;
        return String::new();
    }
    let boundary = piece
        .char_indices()
        .nth(*skip)
        .map(|(idx, _)| idx)
        .unwrap_or(piece.len());
    *skip = 0;
    piece[boundary..].to_string()
}
