//! Realtime session orchestration
//!
//! [`Session`] owns the whole conversation lifecycle: credential fetch,
//! websocket connect, audio pipe-up, server event dispatch, delegation to the
//! reasoning model, and reconnection with backoff. It is a plain owned object
//! driven by [`Session::run`]; observers subscribe to its event bus and
//! control arrives through a cloneable [`SessionHandle`].
//!
//! All collaborators sit behind traits, so every scenario below is testable
//! with scripted fakes and no network or audio hardware.

pub mod reconnect;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::audio::{AudioSink, AudioSource, SourceFrame, decode_pcm, encode_pcm};
use crate::config::Config;
use crate::delegation::{FALLBACK_ANSWER, INJECTION_WRAPPER, ReasoningGateway, TriggerMatcher};
use crate::events::{EventBus, SessionEvent};
use crate::knowledge::ContextProvider;
use crate::persona;
use crate::protocol::{ClientEvent, ConversationItem, ServerEvent, SessionConfig, parse_server_event};
use crate::relay::CredentialProvider;
use crate::transcript::{ContextWindow, TranscriptLog};
use crate::transport::{CLOSE_NORMAL, Connector, Frame, Transport};
use crate::Result;

pub use reconnect::{MAX_ATTEMPTS, ReconnectState, backoff_delay};
pub use state::{ConnectionState, ProcessingMode};

/// Pause between the trigger turn finishing and the injected answer, so the
/// handoff sounds like the assistant collecting its thoughts rather than an
/// instant voice change.
const INJECT_DELAY: Duration = Duration::from_millis(400);

/// How many recent turns accompany a delegated query
const DELEGATION_CONTEXT_TURNS: usize = 5;

/// Capacity of the capture frame channel
const AUDIO_CHANNEL_CAPACITY: usize = 64;

/// Control commands deliverable through a [`SessionHandle`]
#[derive(Debug)]
enum Command {
    Interrupt,
    StopConversation,
    Disconnect,
}

/// Result of one spawned delegation task
#[derive(Debug)]
struct DelegationOutcome {
    epoch: u64,
    answer: String,
    used_search: bool,
}

/// External services and devices a session talks to
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialProvider>,
    pub connector: Arc<dyn Connector>,
    pub gateway: Arc<dyn ReasoningGateway>,
    /// Optional knowledge context; `None` disables augmentation
    pub context: Option<Arc<dyn ContextProvider>>,
    pub source: Box<dyn AudioSource>,
    pub sink: Arc<dyn AudioSink>,
}

/// Cloneable control handle for a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    /// Cut off the assistant mid-utterance (barge-in).
    pub async fn interrupt(&self) {
        let _ = self.tx.send(Command::Interrupt).await;
    }

    /// Stop the current conversation but stay connected.
    pub async fn stop_conversation(&self) {
        let _ = self.tx.send(Command::StopConversation).await;
    }

    /// Close the session intentionally; no reconnection will follow.
    pub async fn disconnect(&self) {
        let _ = self.tx.send(Command::Disconnect).await;
    }
}

/// One realtime voice session
pub struct Session {
    config: Config,

    credentials: Arc<dyn CredentialProvider>,
    connector: Arc<dyn Connector>,
    gateway: Arc<dyn ReasoningGateway>,
    context: Option<Arc<dyn ContextProvider>>,
    source: Box<dyn AudioSource>,
    sink: Arc<dyn AudioSink>,

    state: ConnectionState,
    mode: ProcessingMode,
    session_id: Option<String>,
    active_model: String,
    error: Option<String>,
    volume: f32,
    knowledge_active: bool,

    transcript: TranscriptLog,
    context_window: ContextWindow,
    last_user_query: String,

    triggers: TriggerMatcher,
    pending_answer: Option<String>,
    delegation_triggered: bool,
    /// Bumped on interrupt so in-flight delegation results become stale
    delegation_epoch: u64,
    /// The trigger turn finished before the delegated answer arrived
    turn_done: bool,

    intentional_close: bool,
    reconnect: ReconnectState,
    reconnect_at: Option<Instant>,

    transport: Option<Box<dyn Transport>>,
    audio_rx: Option<mpsc::Receiver<SourceFrame>>,
    delegation_tx: mpsc::Sender<DelegationOutcome>,
    delegation_rx: mpsc::Receiver<DelegationOutcome>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,

    events: EventBus,
}

/// What the run loop should do next
enum Step {
    Frame(Frame),
    Audio(SourceFrame),
    AudioClosed,
    Delegation(DelegationOutcome),
    Command(Command),
    ReconnectDue,
}

impl Session {
    #[must_use]
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let (delegation_tx, delegation_rx) = mpsc::channel(8);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let triggers = TriggerMatcher::new(&config.trigger_phrases);
        let active_model = config.primary_model.clone();
        Self {
            config,
            credentials: collaborators.credentials,
            connector: collaborators.connector,
            gateway: collaborators.gateway,
            context: collaborators.context,
            source: collaborators.source,
            sink: collaborators.sink,
            state: ConnectionState::Idle,
            mode: ProcessingMode::Idle,
            session_id: None,
            active_model,
            error: None,
            volume: 0.0,
            knowledge_active: false,
            transcript: TranscriptLog::new(),
            context_window: ContextWindow::new(),
            last_user_query: String::new(),
            triggers,
            pending_answer: None,
            delegation_triggered: false,
            delegation_epoch: 0,
            turn_done: false,
            intentional_close: false,
            reconnect: ReconnectState::default(),
            reconnect_at: None,
            transport: None,
            audio_rx: None,
            delegation_tx,
            delegation_rx,
            cmd_tx,
            cmd_rx,
            events: EventBus::new(),
        }
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    /// Subscribe to session events from this point forward.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub const fn mode(&self) -> ProcessingMode {
        self.mode
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    #[must_use]
    pub fn active_model(&self) -> &str {
        &self.active_model
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    #[must_use]
    pub const fn volume(&self) -> f32 {
        self.volume
    }

    #[must_use]
    pub const fn knowledge_active(&self) -> bool {
        self.knowledge_active
    }

    /// Transcript entries in insertion order.
    #[must_use]
    pub fn transcript(&self) -> Vec<String> {
        self.transcript.lines()
    }

    /// Establish the session: fetch credentials, open the channel, start
    /// capture, and send the session configuration.
    ///
    /// A no-op unless the session is idle or in a recoverable error state.
    /// Failures never panic or return: they land in the observable error slot
    /// with the state set to [`ConnectionState::Error`], retryable by calling
    /// `connect` again.
    pub async fn connect(&mut self) {
        if !matches!(self.state, ConnectionState::Idle | ConnectionState::Error) {
            tracing::debug!(state = %self.state, "connect ignored in current state");
            return;
        }
        self.error = None;
        self.intentional_close = false;
        self.set_state(ConnectionState::Connecting);

        if let Err(e) = self.try_connect().await {
            tracing::error!(error = %e, "connection failed");
            self.teardown();
            self.fail(e.to_string());
        }
    }

    async fn try_connect(&mut self) -> Result<()> {
        let creds = self.credentials.fetch().await?;
        let transport = self.connector.connect(&creds.url).await?;
        self.transport = Some(transport);

        let (frames_tx, frames_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        self.source.start(frames_tx)?;
        self.audio_rx = Some(frames_rx);

        self.handle_open().await;
        Ok(())
    }

    /// Channel is up: configure the session and reset per-connection state.
    async fn handle_open(&mut self) {
        self.set_state(ConnectionState::Connected);
        self.set_mode(ProcessingMode::Idle);
        self.active_model = self.config.primary_model.clone();
        self.delegation_triggered = false;
        self.turn_done = false;

        if self.reconnect.attempts() > 0 {
            self.push_marker("[reconnected]");
        }
        self.reconnect.reset();
        self.reconnect_at = None;

        let context = match &self.context {
            Some(provider) => match provider.context().await {
                Ok(ctx) if !ctx.trim().is_empty() => {
                    self.knowledge_active = true;
                    Some(ctx)
                }
                Ok(_) => {
                    self.knowledge_active = false;
                    None
                }
                Err(e) => {
                    tracing::warn!(error = %e, "knowledge context unavailable");
                    self.knowledge_active = false;
                    None
                }
            },
            None => {
                self.knowledge_active = false;
                None
            }
        };

        let instructions = persona::build_instructions(context.as_deref());
        let session = SessionConfig::build(&self.config, instructions);
        self.send(ClientEvent::SessionUpdate { session }).await;
    }

    /// Drive the session until it is intentionally closed or permanently
    /// failed and then told to disconnect.
    pub async fn run(&mut self) {
        loop {
            let reconnect_at = self.reconnect_at;
            let step = tokio::select! {
                frame = next_frame(self.transport.as_mut()) => Step::Frame(frame),
                frame = next_audio(self.audio_rx.as_mut()) => match frame {
                    Some(f) => Step::Audio(f),
                    None => Step::AudioClosed,
                },
                Some(outcome) = self.delegation_rx.recv() => Step::Delegation(outcome),
                Some(cmd) = self.cmd_rx.recv() => Step::Command(cmd),
                () = sleep_until_opt(reconnect_at) => Step::ReconnectDue,
            };

            match step {
                Step::Frame(Frame::Text(text)) => {
                    if let Some(event) = parse_server_event(&text) {
                        self.handle_server_event(event).await;
                    }
                }
                Step::Frame(Frame::Closed(code)) => {
                    self.handle_close(code).await;
                }
                Step::Audio(frame) => {
                    self.volume = frame.volume;
                    self.events.emit(SessionEvent::Volume(frame.volume));
                    if self.state.is_connected() {
                        self.send(ClientEvent::InputAudioBufferAppend {
                            audio: encode_pcm(&frame.pcm),
                        })
                        .await;
                    }
                }
                Step::AudioClosed => {
                    self.audio_rx = None;
                }
                Step::Delegation(outcome) => {
                    self.handle_delegation_outcome(outcome).await;
                }
                Step::Command(cmd) => match cmd {
                    Command::Interrupt => self.interrupt().await,
                    Command::StopConversation => self.stop_conversation().await,
                    Command::Disconnect => self.disconnect().await,
                },
                Step::ReconnectDue => {
                    self.reconnect_at = None;
                    // Quiet reset so connect's entry guard accepts.
                    self.state = ConnectionState::Idle;
                    self.connect().await;
                    if self.state == ConnectionState::Error {
                        self.schedule_reconnect();
                    }
                }
            }

            if self.state == ConnectionState::Idle
                && self.transport.is_none()
                && self.reconnect_at.is_none()
            {
                tracing::debug!("session loop finished");
                break;
            }
        }
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionCreated { session } => {
                self.session_id = session.id;
                tracing::info!(id = self.session_id.as_deref().unwrap_or(""), "session created");
                self.push_marker("[session started]");
            }
            ServerEvent::SessionUpdated => {
                tracing::debug!("session configuration applied");
                self.push_marker("[session configured]");
            }
            ServerEvent::SpeechStarted => {
                self.set_state(ConnectionState::Listening);
                self.set_mode(ProcessingMode::Realtime);
            }
            ServerEvent::SpeechStopped => {
                tracing::trace!("user speech ended");
            }
            ServerEvent::ResponseTextDelta { delta } => {
                let accumulated = self.transcript.extend_streaming(&delta);
                self.events.emit(SessionEvent::TranscriptExtended(delta));
                if !self.delegation_triggered && self.triggers.matches(&accumulated) {
                    self.delegation_triggered = true;
                    self.begin_delegation();
                }
            }
            ServerEvent::ResponseTextDone { transcript } => {
                let line = self.transcript.finalize_streaming("Assistant", &transcript);
                self.events.emit(SessionEvent::TranscriptAppended(line.clone()));
                self.context_window.push(line);
            }
            ServerEvent::ResponseAudioDelta { delta } => {
                // A thinking session keeps its state; audio still plays so the
                // trigger phrase itself is heard.
                if self.state != ConnectionState::Thinking {
                    self.set_state(ConnectionState::Speaking);
                    self.set_mode(ProcessingMode::Realtime);
                }
                let pcm = decode_pcm(&delta);
                if !pcm.is_empty() {
                    self.sink.enqueue(&pcm);
                }
            }
            ServerEvent::ResponseAudioDone => {
                tracing::trace!("assistant audio complete");
            }
            ServerEvent::ResponseDone => {
                self.handle_response_done().await;
            }
            ServerEvent::InputTranscriptionCompleted { transcript } => {
                let text = transcript.trim().to_string();
                if text.is_empty() {
                    return;
                }
                let line = format!("You: {text}");
                self.transcript.append(&line);
                self.events.emit(SessionEvent::TranscriptAppended(line.clone()));
                self.context_window.push(line);
                self.last_user_query = text.clone();
                if let Some(provider) = &self.context {
                    provider.observe(&text).await;
                }
            }
            ServerEvent::ErrorEvent { error } => {
                let msg = error
                    .message
                    .unwrap_or_else(|| "unknown service error".to_string());
                tracing::warn!(message = %msg, "service reported an error");
                self.error = Some(msg.clone());
                self.events.emit(SessionEvent::SessionError(msg.clone()));
                self.push_marker(&format!("[service error: {msg}]"));
            }
            ServerEvent::Unknown => {}
        }
    }

    /// Hand the current query to the reasoning model.
    ///
    /// The session stays live: the primary model keeps speaking its trigger
    /// utterance while the gateway works in a spawned task.
    fn begin_delegation(&mut self) {
        if self.state == ConnectionState::Thinking {
            return;
        }
        tracing::info!(query = %self.last_user_query, "delegating to reasoning model");
        self.set_state(ConnectionState::Thinking);
        self.set_mode(ProcessingMode::Thinking);
        self.active_model = self.config.secondary_model.clone();
        self.push_marker("[consulting the reasoning model]");

        let epoch = self.delegation_epoch;
        let query = self.last_user_query.clone();
        let context = self.context_window.recent_joined(DELEGATION_CONTEXT_TURNS);
        let gateway = Arc::clone(&self.gateway);
        let tx = self.delegation_tx.clone();
        tokio::spawn(async move {
            let (answer, used_search) = match gateway.answer(&query, &context).await {
                Ok(a) => (a.answer, a.used_search),
                Err(e) => {
                    tracing::error!(error = %e, "delegated query failed");
                    (FALLBACK_ANSWER.to_string(), false)
                }
            };
            let _ = tx
                .send(DelegationOutcome {
                    epoch,
                    answer,
                    used_search,
                })
                .await;
        });
    }

    async fn handle_delegation_outcome(&mut self, outcome: DelegationOutcome) {
        if outcome.epoch != self.delegation_epoch {
            tracing::debug!("discarding stale delegated answer");
            return;
        }
        self.active_model = self.config.primary_model.clone();
        if outcome.used_search {
            self.set_mode(ProcessingMode::Searching);
        }
        if self.turn_done {
            // The trigger turn already finished; inject without waiting for
            // another response.done.
            self.turn_done = false;
            self.delegation_triggered = false;
            tokio::time::sleep(INJECT_DELAY).await;
            self.inject_answer(&outcome.answer).await;
        } else {
            self.pending_answer = Some(outcome.answer);
        }
    }

    async fn handle_response_done(&mut self) {
        if let Some(answer) = self.pending_answer.take() {
            self.delegation_triggered = false;
            tokio::time::sleep(INJECT_DELAY).await;
            self.inject_answer(&answer).await;
        } else if self.state == ConnectionState::Thinking {
            // Trigger turn over, gateway still working.
            self.turn_done = true;
        } else {
            self.set_state(ConnectionState::Connected);
            self.set_mode(ProcessingMode::Idle);
            self.delegation_triggered = false;
        }
    }

    /// Feed the delegated answer back as a user item and ask for a response.
    async fn inject_answer(&mut self, answer: &str) {
        tracing::debug!(chars = answer.len(), "injecting delegated answer");
        let text = format!("{INJECTION_WRAPPER} {answer}");
        self.send(ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text(&text),
        })
        .await;
        self.send(ClientEvent::ResponseCreate).await;
        self.set_state(ConnectionState::Speaking);
        self.set_mode(ProcessingMode::Realtime);
    }

    /// Barge-in: flush playback, cancel the response, drop any delegation.
    async fn interrupt(&mut self) {
        if !self.state.is_connected() {
            return;
        }
        tracing::debug!("interrupt");
        self.sink.stop();
        self.send(ClientEvent::ResponseCancel).await;
        self.clear_delegation();
        self.set_state(ConnectionState::Connected);
        self.set_mode(ProcessingMode::Idle);
        self.push_marker("[interrupted]");
    }

    /// Stop talking and listening but keep the channel open.
    async fn stop_conversation(&mut self) {
        tracing::debug!("stop conversation");
        self.source.stop();
        self.sink.stop();
        if matches!(
            self.state,
            ConnectionState::Speaking | ConnectionState::Thinking
        ) {
            self.send(ClientEvent::ResponseCancel).await;
        }
        self.send(ClientEvent::InputAudioBufferClear).await;
        self.clear_delegation();
        if self.state.is_connected() {
            self.set_state(ConnectionState::Connected);
        }
        self.set_mode(ProcessingMode::Idle);
    }

    /// Intentional close: no reconnection follows.
    async fn disconnect(&mut self) {
        tracing::info!("disconnecting");
        self.reconnect.reset();
        self.reconnect_at = None;
        self.source.stop();
        self.sink.stop();
        self.audio_rx = None;
        self.clear_delegation();
        match &mut self.transport {
            Some(transport) => {
                // State goes idle when the close completes in handle_close.
                self.intentional_close = true;
                transport.close(CLOSE_NORMAL).await;
            }
            None => {
                self.set_state(ConnectionState::Idle);
                self.set_mode(ProcessingMode::Idle);
            }
        }
    }

    /// The channel closed, cleanly or not.
    async fn handle_close(&mut self, code: Option<u16>) {
        tracing::info!(code = ?code, "realtime channel closed");
        self.transport = None;
        self.audio_rx = None;
        self.source.stop();
        self.sink.stop();
        self.session_id = None;
        self.clear_delegation();
        self.set_mode(ProcessingMode::Idle);

        if self.intentional_close {
            // One-shot: the flag never outlives the close it explains.
            self.intentional_close = false;
            self.error = None;
            self.volume = 0.0;
            self.set_state(ConnectionState::Idle);
            return;
        }
        if code == Some(CLOSE_NORMAL) {
            self.error = None;
            self.volume = 0.0;
            self.set_state(ConnectionState::Idle);
            return;
        }

        let msg = match code {
            Some(c) => format!("connection lost (close code {c})"),
            None => "connection lost".to_string(),
        };
        self.error = Some(msg.clone());
        self.events.emit(SessionEvent::SessionError(msg));
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        match self.reconnect.next_attempt() {
            Some(attempt) => {
                let delay = backoff_delay(attempt);
                tracing::info!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "scheduling reconnect"
                );
                self.push_marker(&format!("[reconnecting, attempt {attempt}/{MAX_ATTEMPTS}]"));
                self.reconnect_at = Some(Instant::now() + delay);
                self.set_state(ConnectionState::Connecting);
            }
            None => {
                tracing::error!("reconnect attempts exhausted");
                self.fail(
                    "connection lost and reconnect attempts exhausted, reconnect manually"
                        .to_string(),
                );
            }
        }
    }

    fn clear_delegation(&mut self) {
        self.pending_answer = None;
        self.delegation_triggered = false;
        self.turn_done = false;
        self.delegation_epoch += 1;
        self.active_model = self.config.primary_model.clone();
    }

    fn teardown(&mut self) {
        self.source.stop();
        self.sink.stop();
        self.transport = None;
        self.audio_rx = None;
    }

    fn fail(&mut self, msg: String) {
        self.error = Some(msg.clone());
        self.events.emit(SessionEvent::SessionError(msg));
        self.set_state(ConnectionState::Error);
        self.set_mode(ProcessingMode::Idle);
    }

    async fn send(&mut self, event: ClientEvent) {
        match &mut self.transport {
            Some(transport) if transport.is_open() => transport.send(event.to_frame()).await,
            _ => tracing::trace!("dropping client event, no open channel"),
        }
    }

    fn push_marker(&mut self, marker: &str) {
        self.transcript.append(marker);
        self.events
            .emit(SessionEvent::TranscriptAppended(marker.to_string()));
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(from = %self.state, to = %state, "state change");
            self.state = state;
            self.events.emit(SessionEvent::StateChanged(state));
        }
    }

    fn set_mode(&mut self, mode: ProcessingMode) {
        if self.mode != mode {
            tracing::debug!(from = %self.mode, to = %mode, "mode change");
            self.mode = mode;
            self.events.emit(SessionEvent::ModeChanged(mode));
        }
    }
}

async fn next_frame(transport: Option<&mut Box<dyn Transport>>) -> Frame {
    match transport {
        Some(transport) => transport.next_frame().await,
        None => std::future::pending().await,
    }
}

async fn next_audio(rx: Option<&mut mpsc::Receiver<SourceFrame>>) -> Option<SourceFrame> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::delegation::ReasoningAnswer;
    use crate::relay::RelayCredentials;
    use crate::{Error, Result};

    struct MockCredentials {
        calls: AtomicUsize,
        fail: bool,
    }

    impl MockCredentials {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl CredentialProvider for MockCredentials {
        async fn fetch(&self) -> Result<RelayCredentials> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Relay("relay down".to_string()));
            }
            Ok(RelayCredentials {
                url: "wss://test.invalid/session".to_string(),
            })
        }
    }

    struct MockTransport {
        sent: Arc<StdMutex<Vec<String>>>,
        open: bool,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, text: String) {
            if self.open {
                self.sent.lock().unwrap().push(text);
            }
        }

        async fn next_frame(&mut self) -> Frame {
            std::future::pending().await
        }

        async fn close(&mut self, _code: u16) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    struct MockConnector {
        sent: Arc<StdMutex<Vec<String>>>,
        fail: bool,
    }

    impl MockConnector {
        fn new(fail: bool) -> (Arc<Self>, Arc<StdMutex<Vec<String>>>) {
            let sent = Arc::new(StdMutex::new(Vec::new()));
            (
                Arc::new(Self {
                    sent: Arc::clone(&sent),
                    fail,
                }),
                sent,
            )
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>> {
            if self.fail {
                return Err(Error::Transport("connection refused".to_string()));
            }
            Ok(Box::new(MockTransport {
                sent: Arc::clone(&self.sent),
                open: true,
            }))
        }
    }

    struct MockGateway {
        answer: String,
        used_search: bool,
        fail: bool,
    }

    #[async_trait]
    impl ReasoningGateway for MockGateway {
        async fn answer(&self, _query: &str, _context: &str) -> Result<ReasoningAnswer> {
            if self.fail {
                return Err(Error::Reasoning("gateway down".to_string()));
            }
            Ok(ReasoningAnswer {
                answer: self.answer.clone(),
                used_search: self.used_search,
            })
        }
    }

    struct FixedContext {
        ctx: String,
        observed: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl ContextProvider for FixedContext {
        async fn context(&self) -> Result<String> {
            Ok(self.ctx.clone())
        }

        async fn observe(&self, text: &str) {
            self.observed.lock().unwrap().push(text.to_string());
        }
    }

    struct NullSource {
        capturing: bool,
    }

    impl AudioSource for NullSource {
        fn start(&mut self, _frames: mpsc::Sender<SourceFrame>) -> Result<()> {
            self.capturing = true;
            Ok(())
        }

        fn stop(&mut self) {
            self.capturing = false;
        }

        fn is_capturing(&self) -> bool {
            self.capturing
        }
    }

    #[derive(Default)]
    struct NullSink {
        samples: AtomicUsize,
        stops: AtomicUsize,
    }

    impl AudioSink for NullSink {
        fn enqueue(&self, pcm: &[i16]) {
            self.samples.fetch_add(pcm.len(), Ordering::SeqCst);
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct TestBed {
        creds_fail: bool,
        connector_fail: bool,
        gateway_fail: bool,
        gateway_answer: String,
        used_search: bool,
        context: Option<String>,
    }

    impl Default for TestBed {
        fn default() -> Self {
            Self {
                creds_fail: false,
                connector_fail: false,
                gateway_fail: false,
                gateway_answer: "Forty-two.".to_string(),
                used_search: false,
                context: None,
            }
        }
    }

    struct Fixture {
        session: Session,
        sent: Arc<StdMutex<Vec<String>>>,
        sink: Arc<NullSink>,
        credentials: Arc<MockCredentials>,
        observed: Arc<StdMutex<Vec<String>>>,
    }

    fn build(bed: TestBed) -> Fixture {
        let credentials = MockCredentials::new(bed.creds_fail);
        let (connector, sent) = MockConnector::new(bed.connector_fail);
        let sink = Arc::new(NullSink::default());
        let observed = Arc::new(StdMutex::new(Vec::new()));
        let context = bed.context.map(|ctx| {
            Arc::new(FixedContext {
                ctx,
                observed: Arc::clone(&observed),
            }) as Arc<dyn ContextProvider>
        });
        let collaborators = Collaborators {
            credentials: Arc::clone(&credentials) as Arc<dyn CredentialProvider>,
            connector,
            gateway: Arc::new(MockGateway {
                answer: bed.gateway_answer,
                used_search: bed.used_search,
                fail: bed.gateway_fail,
            }),
            context,
            source: Box::new(NullSource { capturing: false }),
            sink: Arc::clone(&sink) as Arc<dyn AudioSink>,
        };
        Fixture {
            session: Session::new(Config::default(), collaborators),
            sent,
            sink,
            credentials,
            observed,
        }
    }

    fn sent_frames(fixture: &Fixture) -> Vec<String> {
        fixture.sent.lock().unwrap().clone()
    }

    /// Let spawned delegation tasks finish, then apply their outcomes.
    async fn pump(session: &mut Session) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        while let Ok(outcome) = session.delegation_rx.try_recv() {
            session.handle_delegation_outcome(outcome).await;
        }
    }

    async fn speak_trigger(session: &mut Session) {
        session
            .handle_server_event(ServerEvent::InputTranscriptionCompleted {
                transcript: "what is the airspeed velocity of an unladen swallow".to_string(),
            })
            .await;
        session
            .handle_server_event(ServerEvent::ResponseTextDelta {
                delta: "Hmm, let me think about that.".to_string(),
            })
            .await;
    }

    #[tokio::test]
    async fn connect_configures_the_session() {
        let mut f = build(TestBed::default());
        f.session.connect().await;

        assert_eq!(f.session.state(), ConnectionState::Connected);
        assert_eq!(f.session.active_model(), "gpt-4o-realtime-preview");
        let frames = sent_frames(&f);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains(r#""type":"session.update""#));
        assert!(frames[0].contains("server_vad"));
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_connected() {
        let mut f = build(TestBed::default());
        f.session.connect().await;
        f.session.connect().await;
        assert_eq!(f.credentials.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_failure_is_recoverable() {
        let mut f = build(TestBed {
            creds_fail: true,
            ..TestBed::default()
        });
        f.session.connect().await;

        assert_eq!(f.session.state(), ConnectionState::Error);
        assert!(f.session.error().unwrap().contains("relay down"));
        assert!(!f.session.source.is_capturing());

        // Error is a retryable state.
        f.session.connect().await;
        assert_eq!(f.credentials.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transport_failure_sets_error_state() {
        let mut f = build(TestBed {
            connector_fail: true,
            ..TestBed::default()
        });
        f.session.connect().await;
        assert_eq!(f.session.state(), ConnectionState::Error);
        assert!(f.session.error().unwrap().contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_phrase_delegates_and_injects_on_response_done() {
        let mut f = build(TestBed::default());
        f.session.connect().await;
        speak_trigger(&mut f.session).await;

        assert_eq!(f.session.state(), ConnectionState::Thinking);
        assert_eq!(f.session.mode(), ProcessingMode::Thinking);
        assert_eq!(f.session.active_model(), "o3-mini");
        assert!(
            f.session
                .transcript()
                .iter()
                .any(|l| l == "[consulting the reasoning model]")
        );

        pump(&mut f.session).await;
        assert_eq!(f.session.pending_answer.as_deref(), Some("Forty-two."));
        assert_eq!(f.session.active_model(), "gpt-4o-realtime-preview");

        f.session.handle_server_event(ServerEvent::ResponseDone).await;
        let frames = sent_frames(&f);
        let inject = frames
            .iter()
            .find(|fr| fr.contains(r#""type":"conversation.item.create""#))
            .expect("injected item");
        assert!(inject.contains("Forty-two."));
        assert!(inject.contains("Read this analysis aloud"));
        assert!(frames.iter().any(|fr| fr.contains(r#""type":"response.create""#)));
        assert_eq!(f.session.state(), ConnectionState::Speaking);
        assert!(!f.session.delegation_triggered);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_latches_once_per_turn() {
        let mut f = build(TestBed::default());
        f.session.connect().await;
        speak_trigger(&mut f.session).await;
        f.session
            .handle_server_event(ServerEvent::ResponseTextDelta {
                delta: " Actually, let me research that too.".to_string(),
            })
            .await;

        let markers = f
            .session
            .transcript()
            .iter()
            .filter(|l| l.as_str() == "[consulting the reasoning model]")
            .count();
        assert_eq!(markers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_failure_injects_fallback() {
        let mut f = build(TestBed {
            gateway_fail: true,
            ..TestBed::default()
        });
        f.session.connect().await;
        speak_trigger(&mut f.session).await;
        pump(&mut f.session).await;
        f.session.handle_server_event(ServerEvent::ResponseDone).await;

        let frames = sent_frames(&f);
        let inject = frames
            .iter()
            .find(|fr| fr.contains(r#""type":"conversation.item.create""#))
            .expect("injected item");
        assert!(inject.contains("Could you ask me again"));
    }

    #[tokio::test(start_paused = true)]
    async fn late_answer_injects_after_turn_completes() {
        let mut f = build(TestBed::default());
        f.session.connect().await;
        speak_trigger(&mut f.session).await;

        // Turn finishes while the gateway is still working.
        f.session.handle_server_event(ServerEvent::ResponseDone).await;
        assert_eq!(f.session.state(), ConnectionState::Thinking);
        assert!(f.session.turn_done);
        assert!(
            !sent_frames(&f)
                .iter()
                .any(|fr| fr.contains("conversation.item.create"))
        );

        pump(&mut f.session).await;
        assert!(
            sent_frames(&f)
                .iter()
                .any(|fr| fr.contains("conversation.item.create"))
        );
        assert_eq!(f.session.state(), ConnectionState::Speaking);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_discards_stale_answer() {
        let mut f = build(TestBed::default());
        f.session.connect().await;
        speak_trigger(&mut f.session).await;

        f.session.interrupt().await;
        assert_eq!(f.session.state(), ConnectionState::Connected);
        assert_eq!(f.sink.stops.load(Ordering::SeqCst), 1);
        assert!(
            sent_frames(&f)
                .iter()
                .any(|fr| fr.contains(r#""type":"response.cancel""#))
        );
        assert!(f.session.transcript().iter().any(|l| l == "[interrupted]"));

        // The delegation result arrives after the interrupt and is stale.
        pump(&mut f.session).await;
        assert!(f.session.pending_answer.is_none());
        f.session.handle_server_event(ServerEvent::ResponseDone).await;
        assert!(
            !sent_frames(&f)
                .iter()
                .any(|fr| fr.contains("conversation.item.create"))
        );
    }

    #[tokio::test]
    async fn plain_turn_returns_to_connected() {
        let mut f = build(TestBed::default());
        f.session.connect().await;
        f.session
            .handle_server_event(ServerEvent::ResponseTextDelta {
                delta: "The answer is four.".to_string(),
            })
            .await;
        f.session
            .handle_server_event(ServerEvent::ResponseAudioDelta {
                delta: crate::audio::encode_pcm(&[100, -100, 50]),
            })
            .await;
        assert_eq!(f.session.state(), ConnectionState::Speaking);
        assert_eq!(f.sink.samples.load(Ordering::SeqCst), 3);

        f.session
            .handle_server_event(ServerEvent::ResponseTextDone {
                transcript: "The answer is four.".to_string(),
            })
            .await;
        f.session.handle_server_event(ServerEvent::ResponseDone).await;
        assert_eq!(f.session.state(), ConnectionState::Connected);
        assert_eq!(f.session.mode(), ProcessingMode::Idle);
        assert_eq!(
            f.session.transcript().last().map(String::as_str),
            Some("Assistant: The answer is four.")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn audio_during_thinking_keeps_thinking_state() {
        let mut f = build(TestBed::default());
        f.session.connect().await;
        speak_trigger(&mut f.session).await;
        f.session
            .handle_server_event(ServerEvent::ResponseAudioDelta {
                delta: crate::audio::encode_pcm(&[1, 2, 3]),
            })
            .await;
        assert_eq!(f.session.state(), ConnectionState::Thinking);
        assert!(f.sink.samples.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn user_transcription_is_recorded_and_observed() {
        let mut f = build(TestBed {
            context: Some(String::new()),
            ..TestBed::default()
        });
        f.session.connect().await;
        f.session
            .handle_server_event(ServerEvent::InputTranscriptionCompleted {
                transcript: "my name is Ada".to_string(),
            })
            .await;
        assert_eq!(
            f.session.transcript().last().map(String::as_str),
            Some("You: my name is Ada")
        );
        assert_eq!(f.observed.lock().unwrap().as_slice(), ["my name is Ada"]);

        // Empty transcriptions are dropped.
        f.session
            .handle_server_event(ServerEvent::InputTranscriptionCompleted {
                transcript: "   ".to_string(),
            })
            .await;
        assert_eq!(f.observed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn knowledge_context_lands_in_instructions() {
        let mut f = build(TestBed {
            context: Some("- name: Ada".to_string()),
            ..TestBed::default()
        });
        f.session.connect().await;
        assert!(f.session.knowledge_active());
        assert!(sent_frames(&f)[0].contains("name: Ada"));

        let mut empty = build(TestBed {
            context: Some(String::new()),
            ..TestBed::default()
        });
        empty.session.connect().await;
        assert!(!empty.session.knowledge_active());
    }

    #[tokio::test]
    async fn service_error_does_not_change_state() {
        let mut f = build(TestBed::default());
        f.session.connect().await;
        f.session
            .handle_server_event(ServerEvent::ErrorEvent {
                error: crate::protocol::ErrorDetail {
                    message: Some("rate limited".to_string()),
                },
            })
            .await;
        assert_eq!(f.session.state(), ConnectionState::Connected);
        assert_eq!(f.session.error(), Some("rate limited"));
        assert!(
            f.session
                .transcript()
                .iter()
                .any(|l| l == "[service error: rate limited]")
        );
    }

    #[tokio::test]
    async fn stop_conversation_stays_connected() {
        let mut f = build(TestBed::default());
        f.session.connect().await;
        f.session
            .handle_server_event(ServerEvent::ResponseAudioDelta {
                delta: crate::audio::encode_pcm(&[1, 2]),
            })
            .await;
        f.session.stop_conversation().await;

        assert_eq!(f.session.state(), ConnectionState::Connected);
        assert_eq!(f.session.mode(), ProcessingMode::Idle);
        assert!(!f.session.source.is_capturing());
        let frames = sent_frames(&f);
        assert!(frames.iter().any(|fr| fr.contains(r#""type":"response.cancel""#)));
        assert!(
            frames
                .iter()
                .any(|fr| fr.contains(r#""type":"input_audio_buffer.clear""#))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_close_schedules_backoff() {
        let mut f = build(TestBed::default());
        f.session.connect().await;
        f.session.handle_close(Some(1006)).await;

        assert_eq!(f.session.state(), ConnectionState::Connecting);
        assert!(f.session.reconnect_at.is_some());
        assert_eq!(f.session.reconnect.attempts(), 1);
        assert!(
            f.session
                .transcript()
                .iter()
                .any(|l| l == "[reconnecting, attempt 1/5]")
        );
        assert!(f.session.error().unwrap().contains("1006"));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_attempts_exhaust_into_error() {
        let mut f = build(TestBed::default());
        f.session.connect().await;
        for _ in 0..5 {
            f.session.handle_close(None).await;
        }
        assert_eq!(f.session.reconnect.attempts(), 5);
        assert_eq!(f.session.state(), ConnectionState::Connecting);

        f.session.handle_close(None).await;
        assert_eq!(f.session.state(), ConnectionState::Error);
        assert!(f.session.error().unwrap().contains("exhausted"));
        assert!(f.session.reconnect_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reconnect_resets_the_budget() {
        let mut f = build(TestBed::default());
        f.session.connect().await;
        f.session.handle_close(None).await;
        assert_eq!(f.session.reconnect.attempts(), 1);

        f.session.reconnect_at = None;
        f.session.state = ConnectionState::Idle;
        f.session.connect().await;

        assert_eq!(f.session.state(), ConnectionState::Connected);
        assert_eq!(f.session.reconnect.attempts(), 0);
        assert!(f.session.transcript().iter().any(|l| l == "[reconnected]"));
    }

    #[tokio::test]
    async fn normal_close_goes_idle_without_retry() {
        let mut f = build(TestBed::default());
        f.session.connect().await;
        f.session.handle_close(Some(CLOSE_NORMAL)).await;
        assert_eq!(f.session.state(), ConnectionState::Idle);
        assert!(f.session.reconnect_at.is_none());
        assert!(f.session.error().is_none());
    }

    #[tokio::test]
    async fn disconnect_suppresses_reconnection_once() {
        let mut f = build(TestBed::default());
        f.session.connect().await;
        f.session.disconnect().await;
        assert!(f.session.intentional_close);

        f.session.handle_close(Some(CLOSE_NORMAL)).await;
        assert_eq!(f.session.state(), ConnectionState::Idle);
        assert!(!f.session.intentional_close);
        assert!(f.session.reconnect_at.is_none());
        assert!(!f.session.source.is_capturing());
    }

    #[tokio::test(start_paused = true)]
    async fn used_search_is_surfaced_as_searching_mode() {
        let mut f = build(TestBed {
            used_search: true,
            ..TestBed::default()
        });
        f.session.connect().await;
        speak_trigger(&mut f.session).await;
        pump(&mut f.session).await;
        assert_eq!(f.session.mode(), ProcessingMode::Searching);
    }
}
