//! Execution session lifecycle: execute, stop, input, termination.
//!
//! [`SessionManager`] owns at most one active session. `execute` validates
//! the launch parameters, resolves the topology, creates or execs the agent
//! and attaches to it; failures up to that point are returned to the caller
//! and release the slot. From then on a pump task owns the session: it reads
//! raw chunks, runs them through the [`StreamProcessor`] one at a time, and
//! is the only place a [`SessionEvent::Terminated`] is emitted, so every
//! session ends with exactly one terminal signal.
//!
//! Stopping is cooperative. [`SessionControl::stop`] moves the session to
//! `Stopping` and cancels its token; the pump then kills a fresh instance or
//! writes an interrupt into an exec'd command, tears the stream down whether
//! or not that succeeded, and publishes `Terminated(Stopped)`.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::models::event::{DiagnosticKind, LifecycleStage, SessionEvent};
use crate::models::session::{LaunchParams, SessionState, TerminalSignal, Topology};
use crate::orchestrator::scheduler::Scheduler;
use crate::runtime::discovery::{DiscoveryContext, ResolvedTopology, TopologyOverride};
use crate::runtime::{DuplexStream, InstanceHandle, InstanceSpec, RuntimeClient, RuntimeSignal};
use crate::stream::processor::{ProcessorOutput, StreamProcessor};
use crate::stream::prompt::PromptResponse;
use crate::stream::reader::{ChunkReader, ReadItem};
use crate::stream::writer::{input_line, run_writer};
use crate::{AppError, Result};

/// Queued input lines per session.
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Interrupt written into an exec'd command on stop (Ctrl-C).
const INTERRUPT: &str = "\u{3}";

/// How long teardown waits for queued input to drain.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long teardown waits for the runtime to kill a fresh instance.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Label carrying the session id on fresh instances.
pub const SESSION_LABEL: &str = "assessment-relay.session";

/// Per-call options of [`SessionManager::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Extra environment for the agent; overrides configured variables.
    pub env: Vec<(String, String)>,
    /// Overrides `[prompts] auto_confirm` for this session.
    pub auto_confirm: Option<bool>,
    /// Forces a topology, bypassing discovery.
    pub topology: Option<TopologyOverride>,
    /// External abort signal; cancelling it stops the session.
    pub abort: Option<CancellationToken>,
}

type ActiveSlot = Arc<Mutex<Option<Arc<SessionShared>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Shared session state ──────────────────────────────────────────────────────

#[derive(Debug)]
struct SessionShared {
    id: String,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
    input: Mutex<Option<mpsc::Sender<String>>>,
}

impl SessionShared {
    fn new(cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            id: Uuid::new_v4().to_string(),
            state,
            cancel,
            input: Mutex::new(None),
        }
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(session_id = %self.id, from = ?*current, to = ?next, "session state transition");
                *current = next;
                true
            } else {
                false
            }
        })
    }

    async fn write_input(&self, text: String) -> Result<()> {
        if self.state() != SessionState::Active {
            return Err(AppError::NotActive(format!("session {} is not active", self.id)));
        }
        let sender = lock(&self.input).clone().ok_or_else(|| {
            AppError::NotActive(format!("session {} has no input channel", self.id))
        })?;
        sender.send(text).await.map_err(|_| {
            AppError::NotActive(format!("input channel of session {} is closed", self.id))
        })
    }

    async fn wait_terminated(&self) -> TerminalSignal {
        let mut rx = self.state.subscribe();
        let signal = match rx.wait_for(|state| state.is_terminated()).await.as_deref() {
            Ok(SessionState::Terminated(signal)) => *signal,
            _ => TerminalSignal::Stopped,
        };
        signal
    }

    async fn stop(&self) -> TerminalSignal {
        if let SessionState::Terminated(signal) = self.state() {
            debug!(session_id = %self.id, "stop ignored, session already terminated");
            return signal;
        }
        if self.transition(SessionState::Stopping) {
            info!(session_id = %self.id, "stop requested");
        }
        self.cancel.cancel();
        self.wait_terminated().await
    }
}

// ── Public handles ────────────────────────────────────────────────────────────

/// Cloneable control surface of one session.
#[derive(Debug, Clone)]
pub struct SessionControl {
    shared: Arc<SessionShared>,
    topology: Topology,
    instance: InstanceHandle,
}

impl SessionControl {
    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Topology the session runs in.
    #[must_use]
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Instance the agent runs in.
    #[must_use]
    pub fn instance(&self) -> &InstanceHandle {
        &self.instance
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Watch channel following the lifecycle state.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Whether the session is still running and not being stopped.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Starting | SessionState::Attached | SessionState::Active
        )
    }

    /// Write `text` plus a newline into the agent's input.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotActive`] when the session is not active or its
    /// input channel is gone.
    pub async fn send_input(&self, text: &str) -> Result<()> {
        self.shared.write_input(input_line(text)).await
    }

    /// Stop the session and wait for its terminal state. Safe to call any
    /// number of times; a session yields exactly one terminal signal.
    pub async fn stop(&self) -> TerminalSignal {
        self.shared
            .stop()
            .instrument(info_span!("stop_session", session_id = %self.shared.id))
            .await
    }

    /// Wait for the terminal signal without requesting a stop.
    pub async fn wait_terminated(&self) -> TerminalSignal {
        self.shared.wait_terminated().await
    }
}

/// Handle returned by [`SessionManager::execute`]: the session's control
/// surface plus the receiving end of its event channel.
#[derive(Debug)]
pub struct SessionHandle {
    control: SessionControl,
    events: mpsc::Receiver<SessionEvent>,
}

impl SessionHandle {
    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        self.control.id()
    }

    /// A cloneable control surface, usable while events are being consumed.
    #[must_use]
    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    /// Next event; `None` once the terminal event has been consumed.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Split into the control surface and the event receiver.
    #[must_use]
    pub fn into_parts(self) -> (SessionControl, mpsc::Receiver<SessionEvent>) {
        (self.control, self.events)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.control.state()
    }

    /// Whether the session is still running and not being stopped.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.control.is_active()
    }

    /// See [`SessionControl::send_input`].
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotActive`] when the session is not active.
    pub async fn send_input(&self, text: &str) -> Result<()> {
        self.control.send_input(text).await
    }

    /// See [`SessionControl::stop`].
    pub async fn stop(&self) -> TerminalSignal {
        self.control.stop().await
    }

    /// See [`SessionControl::wait_terminated`].
    pub async fn wait_terminated(&self) -> TerminalSignal {
        self.control.wait_terminated().await
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

/// Launches and supervises one execution session at a time.
pub struct SessionManager {
    runtime: Arc<dyn RuntimeClient>,
    config: Arc<GlobalConfig>,
    discovery: DiscoveryContext,
    active: ActiveSlot,
}

impl SessionManager {
    /// Manager over `runtime` using `config`.
    #[must_use]
    pub fn new(runtime: Arc<dyn RuntimeClient>, config: GlobalConfig) -> Self {
        let discovery = DiscoveryContext::new(config.reuse.clone());
        Self {
            runtime,
            config: Arc::new(config),
            discovery,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Topology discovery state.
    #[must_use]
    pub fn discovery(&self) -> &DiscoveryContext {
        &self.discovery
    }

    /// Whether a session is currently active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Identifier of the active session, if any.
    #[must_use]
    pub fn active_session_id(&self) -> Option<String> {
        lock(&self.active).as_ref().map(|s| s.id.clone())
    }

    /// Launch a session.
    ///
    /// Returns once the agent is attached; output is pumped in the background
    /// and delivered through the handle's event channel.
    ///
    /// # Errors
    ///
    /// - [`AppError::AlreadyActive`] when a session is already running.
    /// - [`AppError::Validation`] for missing or invalid launch parameters,
    ///   raised before any runtime interaction.
    /// - [`AppError::RuntimeUnavailable`] / [`AppError::Runtime`] when
    ///   discovery, instance creation or attaching fails.
    /// - [`AppError::Aborted`] when the abort signal fires during startup;
    ///   a fresh instance already requested is killed first.
    /// - [`AppError::Config`] when a prompt pattern fails to compile.
    pub async fn execute(
        &self,
        params: LaunchParams,
        options: ExecuteOptions,
    ) -> Result<SessionHandle> {
        let shared = self.claim(&params, options.abort.as_ref())?;
        let span = info_span!(
            "execute_session",
            session_id = %shared.id,
            target = %params.target,
            module = %params.module
        );

        let started = self
            .start(Arc::clone(&shared), &params, options)
            .instrument(span)
            .await;
        if let Err(err) = &started {
            warn!(session_id = %shared.id, %err, "session failed to start");
            self.release(&shared);
            shared
                .state
                .send_replace(SessionState::Terminated(err.terminal_signal()));
        }
        started
    }

    /// Reserve the single session slot and validate parameters.
    fn claim(
        &self,
        params: &LaunchParams,
        abort: Option<&CancellationToken>,
    ) -> Result<Arc<SessionShared>> {
        let mut slot = lock(&self.active);
        if let Some(current) = slot.as_ref() {
            return Err(AppError::AlreadyActive(format!(
                "session {} is still running",
                current.id
            )));
        }
        params.validate()?;

        let cancel = abort.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let shared = Arc::new(SessionShared::new(cancel));
        shared.transition(SessionState::Starting);
        *slot = Some(Arc::clone(&shared));
        Ok(shared)
    }

    fn release(&self, shared: &SessionShared) {
        release_slot(&self.active, &shared.id);
    }

    async fn start(
        &self,
        shared: Arc<SessionShared>,
        params: &LaunchParams,
        options: ExecuteOptions,
    ) -> Result<SessionHandle> {
        let processor = StreamProcessor::from_config(&self.config, options.auto_confirm)?;
        let (event_tx, event_rx) = mpsc::channel(self.config.stream.event_channel_capacity.max(1));

        narrate(&event_tx, &shared.id, "resolving execution topology");
        let (topology, instance, stream) = self
            .establish(&shared.id, &shared.cancel, params, &options, &event_tx)
            .await?;
        shared.transition(SessionState::Attached);

        let DuplexStream {
            output,
            input,
            keepalive,
        } = stream;
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let writer_cancel = CancellationToken::new();
        let writer = tokio::spawn(
            run_writer(shared.id.clone(), input, input_rx, writer_cancel.clone())
                .instrument(info_span!("input_writer", session_id = %shared.id)),
        );
        *lock(&shared.input) = Some(input_tx);

        let scheduler = Scheduler::new(&shared.cancel);
        schedule_ready(
            &scheduler,
            Arc::clone(&shared),
            event_tx.clone(),
            Duration::from_millis(self.config.stream.ready_delay_ms),
        );

        shared.transition(SessionState::Active);
        info!(
            session_id = %shared.id,
            %topology,
            instance = %instance,
            "session active"
        );

        let pump = SessionPump {
            shared: Arc::clone(&shared),
            slot: Arc::clone(&self.active),
            runtime: Arc::clone(&self.runtime),
            topology,
            instance: instance.clone(),
            events: event_tx,
            processor,
            scheduler,
            abort: options.abort,
            max_read_errors: self.config.stream.max_read_errors,
        };
        tokio::spawn(
            pump.run(output, keepalive, writer, writer_cancel).instrument(info_span!(
                "session_pump",
                session_id = %shared.id,
                %topology
            )),
        );

        Ok(SessionHandle {
            control: SessionControl {
                shared,
                topology,
                instance,
            },
            events: event_rx,
        })
    }

    /// Resolve the topology and attach to the agent.
    ///
    /// Every runtime call races the session token. A fresh instance that was
    /// already requested is killed before an abort is returned.
    async fn establish(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
        params: &LaunchParams,
        options: &ExecuteOptions,
        event_tx: &mpsc::Sender<SessionEvent>,
    ) -> Result<(Topology, InstanceHandle, DuplexStream)> {
        let resolved = until_cancelled(
            cancel,
            self.discovery.resolve(self.runtime.as_ref(), options.topology),
        )
        .await?;
        let env = self.session_env(session_id, params, &options.env);
        let command = render_command(&self.config.runtime.agent_command, params, session_id);

        match resolved {
            ResolvedTopology::Shared { instance } => {
                narrate(event_tx, session_id, &format!("exec into shared instance {instance}"));
                let stream =
                    until_cancelled(cancel, self.runtime.exec(&instance, &command, &env)).await?;
                Ok((Topology::ExecIntoShared, instance, stream))
            }
            ResolvedTopology::Fresh { network } => {
                let image = self.config.runtime.image.clone().ok_or_else(|| {
                    AppError::RuntimeUnavailable("no image configured for fresh instances".into())
                })?;
                let mut labels = self.config.runtime.labels.clone();
                labels.insert(SESSION_LABEL.to_owned(), session_id.to_owned());
                let spec = InstanceSpec {
                    name: format!(
                        "{}-{}",
                        self.config.runtime.instance_prefix,
                        session_id.get(..8).unwrap_or(session_id)
                    ),
                    image,
                    command,
                    env,
                    network,
                    labels,
                    workdir: self.config.runtime.workdir.clone(),
                    auto_remove: self.config.runtime.auto_remove,
                };

                narrate(event_tx, session_id, &format!("creating fresh instance {}", spec.name));
                let instance = match until_cancelled(cancel, self.runtime.create(&spec)).await {
                    Ok(instance) => instance,
                    Err(err @ AppError::Aborted(_)) => {
                        // The create may have landed; the name is all we have.
                        let by_name = InstanceHandle {
                            id: spec.name.clone(),
                            name: Some(spec.name.clone()),
                        };
                        self.discard_instance(&by_name, "aborted create").await;
                        return Err(err);
                    }
                    Err(err) => return Err(err),
                };

                narrate(event_tx, session_id, "attaching to agent stream");
                match until_cancelled(cancel, self.runtime.attach(&instance)).await {
                    Ok(stream) => Ok((Topology::FreshInstance, instance, stream)),
                    Err(err) => {
                        self.discard_instance(&instance, "failed attach").await;
                        Err(err)
                    }
                }
            }
        }
    }

    /// Best-effort kill of an instance that never became a session.
    async fn discard_instance(&self, instance: &InstanceHandle, cause: &str) {
        let kill = self.runtime.kill(instance, RuntimeSignal::Kill);
        match tokio::time::timeout(KILL_TIMEOUT, kill).await {
            Ok(Ok(())) => info!(instance = %instance, cause, "discarded instance"),
            Ok(Err(err)) => debug!(%err, instance = %instance, cause, "instance cleanup failed"),
            Err(_) => debug!(instance = %instance, cause, "instance cleanup timed out"),
        }
    }

    /// Agent environment: configured variables, then per-call overrides,
    /// then the launch parameters themselves.
    fn session_env(
        &self,
        session_id: &str,
        params: &LaunchParams,
        extra: &[(String, String)],
    ) -> Vec<(String, String)> {
        let mut env: BTreeMap<String, String> = self.config.agent_env().into_iter().collect();
        env.extend(extra.iter().cloned());
        env.extend(params.to_env(session_id));
        env.into_iter().collect()
    }
}

/// Substitute `{target}`, `{module}` and `{session_id}` in the agent argv.
#[must_use]
pub fn render_command(template: &[String], params: &LaunchParams, session_id: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{target}", &params.target)
                .replace("{module}", &params.module)
                .replace("{session_id}", session_id)
        })
        .collect()
}

/// Run a startup step unless the session is aborted first.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    step: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(AppError::Aborted("session aborted during startup".into())),
        result = step => result,
    }
}

fn release_slot(slot: &Mutex<Option<Arc<SessionShared>>>, session_id: &str) {
    let mut slot = lock(slot);
    if slot.as_ref().is_some_and(|s| s.id == session_id) {
        *slot = None;
    }
}

/// Startup narration; dropped rather than blocking when the channel is full.
fn narrate(events: &mpsc::Sender<SessionEvent>, session_id: &str, detail: &str) {
    info!(session_id, detail, "session starting");
    let event = SessionEvent::Lifecycle {
        session_id: session_id.to_owned(),
        stage: LifecycleStage::Starting {
            detail: detail.to_owned(),
        },
    };
    if events.try_send(event).is_err() {
        debug!(session_id, "event channel full, startup narration dropped");
    }
}

fn schedule_ready(
    scheduler: &Scheduler,
    shared: Arc<SessionShared>,
    events: mpsc::Sender<SessionEvent>,
    delay: Duration,
) {
    scheduler.schedule("ready", delay, async move {
        if shared.state() != SessionState::Active {
            return;
        }
        info!(session_id = %shared.id, "session ready");
        let _ = events
            .send(SessionEvent::Lifecycle {
                session_id: shared.id.clone(),
                stage: LifecycleStage::Ready,
            })
            .await;
    });
}

// ── Pump ──────────────────────────────────────────────────────────────────────

struct SessionPump {
    shared: Arc<SessionShared>,
    slot: ActiveSlot,
    runtime: Arc<dyn RuntimeClient>,
    topology: Topology,
    instance: InstanceHandle,
    events: mpsc::Sender<SessionEvent>,
    processor: StreamProcessor,
    scheduler: Scheduler,
    abort: Option<CancellationToken>,
    max_read_errors: u32,
}

impl SessionPump {
    async fn run(
        mut self,
        output: Box<dyn AsyncRead + Send + Unpin>,
        keepalive: Option<Box<dyn std::any::Any + Send>>,
        writer: JoinHandle<Result<()>>,
        writer_cancel: CancellationToken,
    ) {
        let mut reader = ChunkReader::new(self.shared.id.clone(), output, self.max_read_errors);

        let (signal, reason) = loop {
            let item = tokio::select! {
                biased;
                () = self.shared.cancel.cancelled() => break self.stop_reason(),
                item = reader.next() => item,
            };
            match item {
                ReadItem::Chunk(bytes) => {
                    let outputs = self.processor.process(&bytes);
                    if !self.dispatch(outputs).await {
                        break self.stop_reason();
                    }
                }
                ReadItem::Fault { message, .. } => {
                    let event = SessionEvent::Diagnostic {
                        kind: DiagnosticKind::Stream,
                        message,
                    };
                    if !self.emit(event).await {
                        break self.stop_reason();
                    }
                }
                ReadItem::Exhausted { message } => {
                    self.emit_now(SessionEvent::Lifecycle {
                        session_id: self.shared.id.clone(),
                        stage: LifecycleStage::Error {
                            message: message.clone(),
                        },
                    });
                    break (TerminalSignal::Errored, format!("output stream lost: {message}"));
                }
                ReadItem::Eof => {
                    let outputs = self.processor.finish();
                    if !self.dispatch(outputs).await || self.shared.cancel.is_cancelled() {
                        break self.stop_reason();
                    }
                    let signal = self.processor.completion().on_stream_end();
                    let reason = if signal == TerminalSignal::Complete {
                        "agent reported completion".to_owned()
                    } else {
                        "stream ended without completion marker".to_owned()
                    };
                    break (signal, reason);
                }
            }
        };

        self.scheduler.cancel_all();
        let input = lock(&self.shared.input).take();
        if self.shared.cancel.is_cancelled() || signal == TerminalSignal::Errored {
            self.force_terminate(input.as_ref()).await;
        }
        drop(input);
        drain_writer(&self.shared.id, writer, writer_cancel).await;
        drop(reader);
        drop(keepalive);

        self.finish(signal, reason).await;
    }

    fn stop_reason(&self) -> (TerminalSignal, String) {
        if self.abort.as_ref().is_some_and(CancellationToken::is_cancelled) {
            (TerminalSignal::Stopped, "aborted".to_owned())
        } else {
            (TerminalSignal::Stopped, "stopped by request".to_owned())
        }
    }

    /// Emit processor outputs in order. Returns `false` when a stop
    /// interrupted delivery.
    async fn dispatch(&self, outputs: Vec<ProcessorOutput>) -> bool {
        for output in outputs {
            match output {
                ProcessorOutput::Event(event) => {
                    if !self.emit(event).await {
                        return false;
                    }
                }
                ProcessorOutput::Respond(response) => self.schedule_response(response),
            }
        }
        true
    }

    /// Deliver one event, giving up when the session is being stopped.
    async fn emit(&self, event: SessionEvent) -> bool {
        tokio::select! {
            biased;
            () = self.shared.cancel.cancelled() => false,
            sent = self.events.send(event) => {
                if sent.is_err() {
                    debug!(session_id = %self.shared.id, "event receiver dropped");
                }
                true
            }
        }
    }

    fn emit_now(&self, event: SessionEvent) {
        if self.events.try_send(event).is_err() {
            debug!(session_id = %self.shared.id, "event channel full or closed, event dropped");
        }
    }

    fn schedule_response(&self, response: PromptResponse) {
        let PromptResponse {
            pattern,
            text,
            delay,
            repeat_after,
        } = response;
        let line = input_line(&text);

        {
            let shared = Arc::clone(&self.shared);
            let events = self.events.clone();
            let line = line.clone();
            let pattern = pattern.clone();
            self.scheduler.schedule("prompt_response", delay, async move {
                match shared.write_input(line).await {
                    Ok(()) => {
                        info!(session_id = %shared.id, pattern = %pattern, "prompt answered");
                        let _ = events
                            .send(SessionEvent::PromptAnswered {
                                pattern,
                                response: text,
                            })
                            .await;
                    }
                    Err(err) => debug!(%err, pattern = %pattern, "prompt answer skipped"),
                }
            });
        }

        if let Some(repeat_after) = repeat_after {
            let shared = Arc::clone(&self.shared);
            self.scheduler
                .schedule("prompt_response_repeat", delay + repeat_after, async move {
                    match shared.write_input(line).await {
                        Ok(()) => debug!(pattern = %pattern, "prompt answer repeated"),
                        Err(err) => debug!(%err, pattern = %pattern, "prompt repeat skipped"),
                    }
                });
        }
    }

    /// Kill a fresh instance or interrupt an exec'd command. Failures are
    /// reported but never prevent teardown.
    async fn force_terminate(&self, input: Option<&mpsc::Sender<String>>) {
        match self.topology {
            Topology::FreshInstance => {
                let kill = self.runtime.kill(&self.instance, RuntimeSignal::Kill);
                let message = match tokio::time::timeout(KILL_TIMEOUT, kill).await {
                    Ok(Ok(())) => return,
                    Ok(Err(err)) => format!("failed to kill instance {}: {err}", self.instance),
                    Err(_) => format!("timed out killing instance {}", self.instance),
                };
                warn!(session_id = %self.shared.id, %message, "force-terminate failed");
                self.emit_now(SessionEvent::Lifecycle {
                    session_id: self.shared.id.clone(),
                    stage: LifecycleStage::Error { message },
                });
            }
            Topology::ExecIntoShared => {
                let sent = input.is_some_and(|tx| tx.try_send(INTERRUPT.to_owned()).is_ok());
                if sent {
                    debug!(session_id = %self.shared.id, "interrupt queued for exec'd command");
                } else {
                    warn!(session_id = %self.shared.id, "could not interrupt exec'd command");
                }
            }
        }
    }

    /// Publish the terminal state and the single terminal event.
    async fn finish(self, signal: TerminalSignal, reason: String) {
        release_slot(&self.slot, &self.shared.id);
        self.shared.state.send_if_modified(|state| {
            if state.is_terminated() {
                false
            } else {
                *state = SessionState::Terminated(signal);
                true
            }
        });
        info!(session_id = %self.shared.id, ?signal, reason = %reason, "session terminated");
        let _ = self
            .events
            .send(SessionEvent::Terminated { signal, reason })
            .await;
    }
}

async fn drain_writer(
    session_id: &str,
    mut writer: JoinHandle<Result<()>>,
    writer_cancel: CancellationToken,
) {
    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => debug!(session_id, %err, "input writer ended with error"),
        Ok(Err(err)) => warn!(session_id, %err, "input writer task failed"),
        Err(_) => {
            debug!(session_id, "input writer did not drain in time, cancelling");
            writer_cancel.cancel();
            writer.abort();
        }
    }
}
