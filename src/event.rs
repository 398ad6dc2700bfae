use crate::protocol::types::StreamMessage;
use crate::session::record::{SessionId, TokenUsage};

/// Events emitted by the engine for consumers.
#[derive(Debug)]
pub enum EngineEvent {
    /// A message streamed from the agent, in input order.
    Message {
        session_id: SessionId,
        message: Box<StreamMessage>,
    },
    /// Cumulative token usage changed.
    TokenUpdate {
        session_id: SessionId,
        usage: TokenUsage,
        ratio: f64,
    },
    /// A compaction round began.
    CompactionStart { session_id: SessionId },
    /// A compaction round finished. `compacted` is false when the
    /// round failed and the session continues uncompacted.
    CompactionComplete {
        session_id: SessionId,
        compacted: bool,
    },
    /// The stored resume id was rejected by the agent and cleared.
    ResumeInvalidated { session_id: SessionId },
    /// A subprocess failed in a way the engine could not recover.
    ProcessError {
        session_id: SessionId,
        error: String,
    },
}

/// Commands accepted by the engine.
#[derive(Debug)]
pub enum EngineCommand {
    /// Send user text to a session, spawning an agent round.
    Send { session_id: SessionId, text: String },
    /// Stop the session's running round, if any.
    Stop { session_id: SessionId },
    /// Make a session active, loading it from disk if needed.
    SelectSession { session_id: SessionId },
    /// Stop all rounds and shut the engine down.
    Shutdown,
}

/// Output of one agent process, forwarded by its reader tasks.
///
/// The channel closes once both pipes reach EOF; the exit code comes
/// from waiting on the process afterwards.
#[derive(Debug)]
pub(crate) enum AgentEvent {
    /// A parsed message from the agent's stdout.
    Message(Box<StreamMessage>),
    /// A line from the agent's stderr.
    Stderr(String),
}
