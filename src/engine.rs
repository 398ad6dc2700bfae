//! The engine task.
//!
//! One tokio task owns the session registry and drives every agent
//! round; commands and subprocess output funnel into it over channels,
//! and consumers watch a single event stream. Single ownership is the
//! concurrency story: no session state is shared, so no session state
//! is locked.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::compaction::{self, Gate};
use crate::config::EngineConfig;
use crate::discovery::Discovery;
use crate::event::{AgentEvent, EngineCommand, EngineEvent};
use crate::protocol::types::{StreamMessage, SystemMessage, Usage};
use crate::resume::{self, RoundEnd, SpawnPlan};
use crate::session::record::{ResumeId, Session, SessionId, SessionStatus};
use crate::session::registry::Registry;
use crate::session::store::{self, SessionStore, StoreError, StoreLock};
use crate::supervisor::AgentProcess;
use crate::tokens::{self, Pressure, TokenAccountant};

// ── handle ──────────────────────────────────────────────────────────────────

/// Producer half of a running engine.
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    pub fn send(&self, session_id: SessionId, text: String) {
        let _ = self.commands.send(EngineCommand::Send { session_id, text });
    }

    pub fn stop(&self, session_id: SessionId) {
        let _ = self.commands.send(EngineCommand::Stop { session_id });
    }

    pub fn select_session(&self, session_id: SessionId) {
        let _ = self.commands.send(EngineCommand::SelectSession { session_id });
    }

    /// Stop all rounds, flush persistence, and wait for the engine to
    /// finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(EngineCommand::Shutdown);
        let _ = self.task.await;
    }
}

// ── internal plumbing ───────────────────────────────────────────────────────

/// Why a round's watchdog fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeoutKind {
    /// No output inside the stall window.
    Stalled,
    /// The round outlived its overall cap.
    RoundCap,
}

impl TimeoutKind {
    fn describe(self) -> &'static str {
        match self {
            TimeoutKind::Stalled => "no output within the stall window",
            TimeoutKind::RoundCap => "round exceeded its time cap",
        }
    }
}

/// Everything a round driver reports back to the engine task.
enum Internal {
    AgentMessage {
        session_id: SessionId,
        message: Box<StreamMessage>,
    },
    AgentStderr {
        session_id: SessionId,
        line: String,
    },
    RoundFinished {
        session_id: SessionId,
        exit_code: Option<i32>,
        timed_out: Option<TimeoutKind>,
    },
    CompactionDue {
        session_id: SessionId,
    },
}

/// Which kind of round a session is running.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RoundPurpose {
    UserSend { text: String, attempt: Attempt },
    Summarize,
}

/// First launch of a send, or its single fresh retry after the stored
/// resume id turned out to be gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    FreshRetry,
}

/// Book-keeping for the round currently running on a session.
struct ActiveRound {
    kill: Option<oneshot::Sender<()>>,
    purpose: RoundPurpose,
    used_resume: bool,
    saw_result: bool,
    result_was_error: bool,
    /// stderr lines and error-flagged result content, for exit
    /// classification. Assistant prose never lands here.
    error_text: String,
    /// Newest conversation id the agent reported during this round.
    captured_resume: Option<ResumeId>,
    /// Usage from the round's result message.
    result_usage: Option<Usage>,
    stop_requested: bool,
}

/// Engine-local scheduling state for one session. Never persisted.
#[derive(Default)]
struct SessionRuntime {
    round: Option<ActiveRound>,
    queued_sends: VecDeque<String>,
    compaction_wanted: bool,
    compaction_timer_armed: bool,
}

// ── engine ──────────────────────────────────────────────────────────────────

pub struct Engine {
    config: EngineConfig,
    accountant: TokenAccountant,
    registry: Registry,
    discovery: Discovery,
    runtime: HashMap<SessionId, SessionRuntime>,
    active: Option<SessionId>,
    events: mpsc::UnboundedSender<EngineEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    shutting_down: bool,
    _lock: StoreLock,
}

impl Engine {
    /// Lock the state directory, open the store, and start the engine
    /// task. Returns the command handle and the event stream.
    pub fn start(
        config: EngineConfig,
        state_dir: &Path,
    ) -> Result<(EngineHandle, mpsc::UnboundedReceiver<EngineEvent>), StoreError> {
        let lock = store::lock_state_dir(state_dir)?;
        let store = Arc::new(SessionStore::open(state_dir)?);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let accountant = TokenAccountant::new(
            config.max_context_tokens,
            config.auto_compact_threshold,
            config.force_compact_threshold,
        );
        let engine = Engine {
            config,
            accountant,
            registry: Registry::new(store),
            discovery: Discovery::new(),
            runtime: HashMap::new(),
            active: None,
            events: event_tx,
            internal_tx,
            shutting_down: false,
            _lock: lock,
        };
        let task = tokio::spawn(engine.run(command_rx, internal_rx));
        Ok((
            EngineHandle {
                commands: command_tx,
                task,
            },
            event_rx,
        ))
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<EngineCommand>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv(), if !self.shutting_down => {
                    match command {
                        Some(EngineCommand::Shutdown) | None => self.begin_shutdown(),
                        Some(command) => self.handle_command(command).await,
                    }
                }
                event = internal.recv() => {
                    // The engine holds a sender, so this never yields None.
                    if let Some(event) = event {
                        self.handle_internal(event).await;
                    }
                }
            }
            if self.shutting_down && self.runtime.values().all(|r| r.round.is_none()) {
                break;
            }
        }
        self.registry.shutdown().await;
        info!("engine stopped");
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    // ── commands ────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Send { session_id, text } => self.handle_send(session_id, text).await,
            EngineCommand::Stop { session_id } => self.handle_stop(&session_id),
            EngineCommand::SelectSession { session_id } => self.handle_select(session_id),
            EngineCommand::Shutdown => self.begin_shutdown(),
        }
    }

    async fn handle_send(&mut self, session_id: SessionId, text: String) {
        if self.registry.ensure_loaded(&session_id).is_none() {
            // First send under a new id bootstraps the session.
            let directory = self.default_working_directory();
            let mut session = Session::new(directory);
            session.id = session_id.clone();
            info!(session_id = %session_id, "creating session");
            self.registry.create(session);
        }

        let runtime = self.runtime.entry(session_id.clone()).or_default();
        if runtime.round.is_some() {
            // One process per session: later sends wait their turn.
            runtime.queued_sends.push_back(text);
            return;
        }

        if self.compact_before_send(&session_id) {
            let runtime = self.runtime.entry(session_id.clone()).or_default();
            runtime.queued_sends.push_back(text);
            self.start_summarize_round(&session_id).await;
            return;
        }

        self.start_user_round(&session_id, text, Attempt::First).await;
    }

    /// Mandatory pressure runs compaction ahead of the send, but only
    /// when the gate is open. A deferred or exhausted gate lets the
    /// send through with a warning rather than stalling the user.
    fn compact_before_send(&self, session_id: &SessionId) -> bool {
        let Some(session) = self.registry.get(session_id) else {
            return false;
        };
        if session.external_resume_id.is_none() {
            return false;
        }
        if self.accountant.evaluate(session) != Pressure::Mandatory {
            return false;
        }
        match compaction::evaluate_gate(&session.compaction, &self.config, SystemTime::now()) {
            Gate::Ready => true,
            Gate::Deferred { remaining } => {
                warn!(
                    session_id = %session_id,
                    remaining_secs = remaining.as_secs(),
                    "context pressure is critical but compaction is cooling down; sending anyway"
                );
                false
            }
            Gate::Exhausted => {
                warn!(
                    session_id = %session_id,
                    "context pressure is critical and compaction attempts are exhausted; sending anyway"
                );
                false
            }
        }
    }

    fn handle_stop(&mut self, session_id: &SessionId) {
        let Some(runtime) = self.runtime.get_mut(session_id) else {
            return;
        };
        runtime.queued_sends.clear();
        let Some(round) = runtime.round.as_mut() else {
            return;
        };
        round.stop_requested = true;
        if round.purpose == RoundPurpose::Summarize {
            // Compaction is not cancellable once started; the stop
            // takes effect when the round ends.
            debug!(session_id = %session_id, "stop queued behind running compaction");
            return;
        }
        if let Some(kill) = round.kill.take() {
            let _ = kill.send(());
        }
    }

    fn handle_select(&mut self, session_id: SessionId) {
        if self.registry.ensure_loaded(&session_id).is_none() {
            // Selecting an id with no stored record starts fresh under it.
            let directory = self.default_working_directory();
            let mut session = Session::new(directory);
            session.id = session_id.clone();
            info!(session_id = %session_id, "creating session");
            self.registry.create(session);
        }
        let Some(session) = self.registry.get(&session_id) else {
            return;
        };
        let usage = session.token_usage;
        let ratio = self.accountant.usage_ratio(session);
        self.active = Some(session_id.clone());
        self.emit(EngineEvent::TokenUpdate {
            session_id,
            usage,
            ratio,
        });
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        for runtime in self.runtime.values_mut() {
            runtime.queued_sends.clear();
            if let Some(round) = runtime.round.as_mut() {
                round.stop_requested = true;
                if let Some(kill) = round.kill.take() {
                    let _ = kill.send(());
                }
            }
        }
    }

    fn default_working_directory(&self) -> PathBuf {
        self.config
            .default_working_directory
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    // ── starting rounds ─────────────────────────────────────────────────────

    async fn start_user_round(&mut self, session_id: &SessionId, text: String, attempt: Attempt) {
        let Some(session) = self.registry.get_mut(session_id) else {
            return;
        };
        session.status = SessionStatus::Streaming;
        let plan = resume::prepare_send(session, &text, &self.config);
        let purpose = RoundPurpose::UserSend { text, attempt };
        if let Err(detail) = self.launch(session_id, plan, purpose).await {
            self.fail_session(session_id, &detail);
        }
    }

    async fn start_summarize_round(&mut self, session_id: &SessionId) {
        let Some(session) = self.registry.get_mut(session_id) else {
            return;
        };
        let Some(plan) = compaction::summarize_plan(session, &self.config) else {
            // Nothing stored to compact; drop the request.
            debug!(session_id = %session_id, "skipping compaction for session with no resume id");
            if let Some(runtime) = self.runtime.get_mut(session_id) {
                runtime.compaction_wanted = false;
            }
            self.resume_queued_work(session_id).await;
            return;
        };
        session.status = SessionStatus::Compacting;
        self.emit(EngineEvent::CompactionStart {
            session_id: session_id.clone(),
        });
        if let Err(detail) = self.launch(session_id, plan, RoundPurpose::Summarize).await {
            // The session itself is still usable; count the miss against
            // the retry budget and let queued sends through uncompacted.
            if let Some(session) = self.registry.get_mut(session_id) {
                session.status = SessionStatus::Idle;
            }
            self.emit(EngineEvent::ProcessError {
                session_id: session_id.clone(),
                error: detail,
            });
            self.finish_compaction_failure(session_id);
            self.resume_queued_work(session_id).await;
        }
    }

    /// Spawns the agent and installs the round driver. On a spawn error
    /// the caller decides how the session degrades.
    async fn launch(
        &mut self,
        session_id: &SessionId,
        plan: SpawnPlan,
        purpose: RoundPurpose,
    ) -> Result<(), String> {
        let program = match &self.config.agent_executable {
            Some(path) => path.clone(),
            None => self.discovery.resolve().await.to_path_buf(),
        };

        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        let used_resume = plan.resume.is_some();
        let process = match AgentProcess::spawn(&program, &plan, &agent_tx) {
            Ok(process) => process,
            Err(error) => {
                warn!(session_id = %session_id, %error, "agent spawn failed");
                return Err(error.to_string());
            }
        };
        drop(agent_tx);

        let (kill_tx, kill_rx) = oneshot::channel();
        let runtime = self.runtime.entry(session_id.clone()).or_default();
        runtime.round = Some(ActiveRound {
            kill: Some(kill_tx),
            purpose,
            used_resume,
            saw_result: false,
            result_was_error: false,
            error_text: String::new(),
            captured_resume: None,
            result_usage: None,
            stop_requested: false,
        });

        spawn_round_driver(
            session_id.clone(),
            process,
            agent_rx,
            kill_rx,
            self.config.stall_window(),
            self.config.round_timeout(),
            self.internal_tx.clone(),
        );
        Ok(())
    }

    // ── internal events ─────────────────────────────────────────────────────

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::AgentMessage {
                session_id,
                message,
            } => self.handle_agent_message(&session_id, message),
            Internal::AgentStderr { session_id, line } => {
                debug!(session_id = %session_id, line = %line, "agent stderr");
                if let Some(round) = self.round_mut(&session_id) {
                    round.error_text.push_str(&line);
                    round.error_text.push('\n');
                }
            }
            Internal::RoundFinished {
                session_id,
                exit_code,
                timed_out,
            } => self.handle_round_finished(&session_id, exit_code, timed_out).await,
            Internal::CompactionDue { session_id } => {
                self.handle_compaction_due(&session_id).await;
            }
        }
    }

    fn round_mut(&mut self, session_id: &SessionId) -> Option<&mut ActiveRound> {
        self.runtime.get_mut(session_id).and_then(|r| r.round.as_mut())
    }

    /// Apply one decoded message to the session record, then forward it.
    fn handle_agent_message(&mut self, session_id: &SessionId, message: Box<StreamMessage>) {
        let summarizing = self
            .round_mut(session_id)
            .is_some_and(|round| round.purpose == RoundPurpose::Summarize);

        match message.as_ref() {
            StreamMessage::System(SystemMessage::Init(init)) => {
                let id = ResumeId::new(init.session_id.clone());
                if let Some(round) = self.round_mut(session_id) {
                    round.captured_resume = Some(id.clone());
                }
                // User rounds adopt the newest conversation id as soon
                // as the agent reports it; a summarize round holds it
                // back until the whole swap can land at once.
                if !summarizing {
                    self.set_resume_id(session_id, id);
                }
            }
            StreamMessage::Result(result) => {
                if let Some(round) = self.round_mut(session_id) {
                    round.saw_result = true;
                    round.result_was_error = result.is_error;
                    if result.is_error {
                        round.error_text.push_str(&result.result);
                        round.error_text.push('\n');
                    }
                    round.result_usage = result.usage;
                }
                if let Some(sid) = &result.session_id {
                    let id = ResumeId::new(sid.clone());
                    if let Some(round) = self.round_mut(session_id) {
                        round.captured_resume = Some(id.clone());
                    }
                    if !summarizing {
                        self.set_resume_id(session_id, id);
                    }
                }
                if !summarizing
                    && let Some(usage) = result.usage
                {
                    self.apply_round_usage(session_id, usage);
                }
            }
            StreamMessage::Error(error) => {
                if let Some(round) = self.round_mut(session_id) {
                    round.error_text.push_str(&error.message);
                    round.error_text.push('\n');
                }
            }
            _ => {}
        }

        if let Some(session) = self.registry.get_mut(session_id) {
            session.messages.push(message.as_ref().clone());
            self.registry.persist(session_id);
        }
        self.emit(EngineEvent::Message {
            session_id: session_id.clone(),
            message,
        });
    }

    fn set_resume_id(&mut self, session_id: &SessionId, id: ResumeId) {
        let Some(session) = self.registry.get_mut(session_id) else {
            return;
        };
        if session.external_resume_id.as_ref() == Some(&id) {
            return;
        }
        session.external_resume_id = Some(id);
        self.registry.persist(session_id);
    }

    fn apply_round_usage(&mut self, session_id: &SessionId, usage: Usage) {
        let Some(session) = self.registry.get_mut(session_id) else {
            return;
        };
        tokens::apply_result(session, usage);
        let snapshot = session.token_usage;
        let ratio = self.accountant.usage_ratio(session);
        let pressure = self.accountant.evaluate(session);
        self.registry.persist(session_id);

        if pressure != Pressure::None {
            let runtime = self.runtime.entry(session_id.clone()).or_default();
            runtime.compaction_wanted = true;
        }
        self.emit(EngineEvent::TokenUpdate {
            session_id: session_id.clone(),
            usage: snapshot,
            ratio,
        });
    }

    // ── finishing rounds ────────────────────────────────────────────────────

    async fn handle_round_finished(
        &mut self,
        session_id: &SessionId,
        exit_code: Option<i32>,
        timed_out: Option<TimeoutKind>,
    ) {
        let Some(runtime) = self.runtime.get_mut(session_id) else {
            return;
        };
        let Some(mut round) = runtime.round.take() else {
            return;
        };
        if let Some(kind) = timed_out {
            round.error_text.push_str(kind.describe());
            round.error_text.push('\n');
        }

        match round.purpose.clone() {
            RoundPurpose::UserSend { text, attempt } => {
                self.finish_user_round(session_id, &round, &text, attempt, exit_code)
                    .await;
            }
            RoundPurpose::Summarize => {
                self.finish_summarize_round(session_id, &round, exit_code).await;
            }
        }
    }

    async fn finish_user_round(
        &mut self,
        session_id: &SessionId,
        round: &ActiveRound,
        text: &str,
        attempt: Attempt,
        exit_code: Option<i32>,
    ) {
        if round.stop_requested {
            self.set_status(session_id, SessionStatus::Idle);
            return;
        }

        let end = resume::classify_round_end(
            round.used_resume,
            exit_code,
            round.saw_result,
            &round.error_text,
        );
        match end {
            RoundEnd::Completed => {
                self.set_status(session_id, SessionStatus::Idle);
                self.resume_queued_work(session_id).await;
            }
            RoundEnd::ResumeNotFound => {
                info!(session_id = %session_id, "stored conversation is gone; reissuing fresh");
                self.clear_resume_id(session_id);
                self.emit(EngineEvent::ResumeInvalidated {
                    session_id: session_id.clone(),
                });
                match attempt {
                    Attempt::First => {
                        // The single transparent retry for this send.
                        self.start_user_round(session_id, text.to_string(), Attempt::FreshRetry)
                            .await;
                    }
                    Attempt::FreshRetry => {
                        self.fail_session(session_id, "agent rejected a fresh run as resumed");
                    }
                }
            }
            RoundEnd::Failed { detail } => {
                self.fail_session(session_id, &detail);
            }
        }
    }

    async fn finish_summarize_round(
        &mut self,
        session_id: &SessionId,
        round: &ActiveRound,
        exit_code: Option<i32>,
    ) {
        let end = resume::classify_round_end(
            round.used_resume,
            exit_code,
            round.saw_result,
            &round.error_text,
        );

        let succeeded = end == RoundEnd::Completed
            && !round.result_was_error
            && round.captured_resume.is_some()
            && round.result_usage.is_some();

        if succeeded {
            let new_resume = round.captured_resume.clone();
            let baseline = round.result_usage;
            if let Some(session) = self.registry.get_mut(session_id)
                && let (Some(new_resume), Some(baseline)) = (new_resume, baseline)
            {
                compaction::apply_success(session, new_resume, baseline, SystemTime::now());
                let usage = session.token_usage;
                let ratio = self.accountant.usage_ratio(session);
                session.status = SessionStatus::Idle;
                self.registry.persist(session_id);
                if let Some(runtime) = self.runtime.get_mut(session_id) {
                    runtime.compaction_wanted = false;
                }
                self.emit(EngineEvent::TokenUpdate {
                    session_id: session_id.clone(),
                    usage,
                    ratio,
                });
                self.emit(EngineEvent::CompactionComplete {
                    session_id: session_id.clone(),
                    compacted: true,
                });
            }
            self.drop_queue_if_stopped(session_id, round);
            self.resume_queued_work(session_id).await;
            return;
        }

        if end == RoundEnd::ResumeNotFound {
            info!(session_id = %session_id, "conversation vanished during compaction");
            self.clear_resume_id(session_id);
            self.emit(EngineEvent::ResumeInvalidated {
                session_id: session_id.clone(),
            });
        } else {
            warn!(session_id = %session_id, "compaction round failed");
        }
        self.finish_compaction_failure(session_id);
        self.set_status(session_id, SessionStatus::Idle);
        self.drop_queue_if_stopped(session_id, round);
        self.resume_queued_work(session_id).await;
    }

    /// Record a failed compaction attempt and arm the single deferred
    /// retry if one is still available.
    fn finish_compaction_failure(&mut self, session_id: &SessionId) {
        let now = SystemTime::now();
        let Some(session) = self.registry.get_mut(session_id) else {
            return;
        };
        compaction::apply_failure(session, now);
        let gate = compaction::evaluate_gate(&session.compaction, &self.config, now);
        self.registry.persist(session_id);
        self.emit(EngineEvent::CompactionComplete {
            session_id: session_id.clone(),
            compacted: false,
        });

        match gate {
            Gate::Deferred { remaining } => self.arm_compaction_timer(session_id, remaining),
            Gate::Exhausted => {
                warn!(
                    session_id = %session_id,
                    "compaction attempts exhausted; session continues uncompacted"
                );
                if let Some(runtime) = self.runtime.get_mut(session_id) {
                    runtime.compaction_wanted = false;
                }
                self.emit(EngineEvent::ProcessError {
                    session_id: session_id.clone(),
                    error: "compaction retries exhausted; continuing uncompacted".to_string(),
                });
            }
            Gate::Ready => {}
        }
    }

    fn arm_compaction_timer(&mut self, session_id: &SessionId, delay: Duration) {
        let runtime = self.runtime.entry(session_id.clone()).or_default();
        if runtime.compaction_timer_armed {
            return;
        }
        runtime.compaction_timer_armed = true;
        let tx = self.internal_tx.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::CompactionDue { session_id });
        });
    }

    async fn handle_compaction_due(&mut self, session_id: &SessionId) {
        if let Some(runtime) = self.runtime.get_mut(session_id) {
            runtime.compaction_timer_armed = false;
            if runtime.round.is_some() {
                // A live round re-evaluates pressure when it ends.
                runtime.compaction_wanted = true;
                return;
            }
        }
        self.maybe_start_compaction(session_id).await;
    }

    /// Start a summarize round if pressure still calls for one and the
    /// gate is open. Deferred gates re-arm the timer instead.
    async fn maybe_start_compaction(&mut self, session_id: &SessionId) -> bool {
        if self.shutting_down {
            return false;
        }
        let Some(session) = self.registry.get(session_id) else {
            return false;
        };
        if self.accountant.evaluate(session) == Pressure::None {
            if let Some(runtime) = self.runtime.get_mut(session_id) {
                runtime.compaction_wanted = false;
            }
            return false;
        }
        match compaction::evaluate_gate(&session.compaction, &self.config, SystemTime::now()) {
            Gate::Ready => {
                // Boxed to keep the start/resume call graph finitely sized.
                Box::pin(self.start_summarize_round(session_id)).await;
                true
            }
            Gate::Deferred { remaining } => {
                self.arm_compaction_timer(session_id, remaining);
                false
            }
            Gate::Exhausted => {
                if let Some(runtime) = self.runtime.get_mut(session_id) {
                    runtime.compaction_wanted = false;
                }
                false
            }
        }
    }

    /// Pick up whatever the session should do next: a wanted
    /// compaction first, then the oldest queued send.
    async fn resume_queued_work(&mut self, session_id: &SessionId) {
        if self.shutting_down {
            return;
        }
        let wanted = self
            .runtime
            .get(session_id)
            .is_some_and(|r| r.compaction_wanted && r.round.is_none());
        if wanted && self.maybe_start_compaction(session_id).await {
            return;
        }
        let next = self
            .runtime
            .get_mut(session_id)
            .and_then(|r| if r.round.is_none() { r.queued_sends.pop_front() } else { None });
        if let Some(text) = next {
            self.start_user_round(session_id, text, Attempt::First).await;
        }
    }

    fn drop_queue_if_stopped(&mut self, session_id: &SessionId, round: &ActiveRound) {
        if round.stop_requested
            && let Some(runtime) = self.runtime.get_mut(session_id)
        {
            runtime.queued_sends.clear();
        }
    }

    fn fail_session(&mut self, session_id: &SessionId, detail: &str) {
        warn!(session_id = %session_id, detail, "round failed");
        self.set_status(session_id, SessionStatus::Error);
        if let Some(runtime) = self.runtime.get_mut(session_id) {
            runtime.queued_sends.clear();
        }
        self.emit(EngineEvent::ProcessError {
            session_id: session_id.clone(),
            error: detail.to_string(),
        });
    }

    fn set_status(&mut self, session_id: &SessionId, status: SessionStatus) {
        if let Some(session) = self.registry.get_mut(session_id) {
            session.status = status;
        }
    }

    fn clear_resume_id(&mut self, session_id: &SessionId) {
        if let Some(session) = self.registry.get_mut(session_id) {
            session.external_resume_id = None;
            self.registry.persist(session_id);
        }
    }
}

// ── round driver ────────────────────────────────────────────────────────────

/// Shuttle one round's output into the engine and watch for stalls.
///
/// The driver owns the process: it kills on stall, on the round cap,
/// or on request, then drains remaining output and reports the exit.
fn spawn_round_driver(
    session_id: SessionId,
    mut process: AgentProcess,
    mut agent_rx: mpsc::UnboundedReceiver<AgentEvent>,
    mut kill_rx: oneshot::Receiver<()>,
    stall_window: Duration,
    round_timeout: Duration,
    internal_tx: mpsc::UnboundedSender<Internal>,
) {
    tokio::spawn(async move {
        let round_deadline = Instant::now() + round_timeout;
        let mut last_output = Instant::now();
        let mut kill_handled = false;
        let mut timed_out = None;

        loop {
            let stall_deadline = last_output + stall_window;
            let deadline = stall_deadline.min(round_deadline);
            tokio::select! {
                requested = &mut kill_rx, if !kill_handled => {
                    kill_handled = true;
                    if requested.is_ok() {
                        process.kill().await;
                    }
                }
                event = agent_rx.recv() => {
                    let Some(event) = event else { break };
                    last_output = Instant::now();
                    forward(&internal_tx, &session_id, event);
                }
                () = tokio::time::sleep_until(deadline), if !kill_handled => {
                    timed_out = Some(if deadline == round_deadline {
                        TimeoutKind::RoundCap
                    } else {
                        TimeoutKind::Stalled
                    });
                    process.kill().await;
                    break;
                }
            }
        }

        // Drain whatever the readers flushed before the pipes closed.
        while let Some(event) = agent_rx.recv().await {
            forward(&internal_tx, &session_id, event);
        }

        let exit_code = match process.wait().await {
            Ok(code) => code,
            Err(error) => {
                warn!(session_id = %session_id, %error, "failed to reap agent process");
                None
            }
        };
        let _ = internal_tx.send(Internal::RoundFinished {
            session_id,
            exit_code,
            timed_out,
        });
    });
}

fn forward(tx: &mpsc::UnboundedSender<Internal>, session_id: &SessionId, event: AgentEvent) {
    let message = match event {
        AgentEvent::Message(message) => Internal::AgentMessage {
            session_id: session_id.clone(),
            message,
        },
        AgentEvent::Stderr(line) => Internal::AgentStderr {
            session_id: session_id.clone(),
            line,
        },
    };
    let _ = tx.send(message);
}
