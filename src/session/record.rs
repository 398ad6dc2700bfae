use std::path::PathBuf;
use std::time::SystemTime;

use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::protocol::types::{StreamMessage, Usage};

/// Stable local identifier for a conversation. Minted once, never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn mint() -> Self {
        let mut rng = rand::rng();
        SessionId(format!("s-{:016x}", rng.random::<u64>()))
    }

    pub fn new(id: impl Into<String>) -> Self {
        SessionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque resume token understood by the external agent.
///
/// Not a [`SessionId`]: the two are invalidated independently and are
/// never interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeId(String);

impl ResumeId {
    pub fn new(id: impl Into<String>) -> Self {
        ResumeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accumulated token counters for one conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_create: u64,
    pub cache_read: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_create + self.cache_read
    }
}

impl From<Usage> for TokenUsage {
    fn from(u: Usage) -> Self {
        TokenUsage {
            input: u.input_tokens,
            output: u.output_tokens,
            cache_create: u.cache_creation_input_tokens,
            cache_read: u.cache_read_input_tokens,
        }
    }
}

/// Compaction bookkeeping carried on the session record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionState {
    pub was_compacted: bool,
    pub last_compaction_at: Option<SystemTime>,
    pub attempts: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    #[default]
    Idle,
    Streaming,
    Compacting,
    Error,
}

/// One conversation's full state. Everything except `status` is durable;
/// a freshly loaded session always starts `Idle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    #[serde(default)]
    pub external_resume_id: Option<ResumeId>,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub compaction: CompactionState,
    /// Append-only transcript of decoded protocol messages.
    #[serde(default)]
    pub messages: Vec<StreamMessage>,
    #[serde(skip)]
    pub status: SessionStatus,
}

impl Session {
    /// Create a fresh session rooted at `working_directory`.
    pub fn new(working_directory: PathBuf) -> Self {
        Session {
            id: SessionId::mint(),
            external_resume_id: None,
            working_directory,
            token_usage: TokenUsage::default(),
            compaction: CompactionState::default(),
            messages: Vec::new(),
            status: SessionStatus::Idle,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_are_distinct() {
        let a = SessionId::mint();
        let b = SessionId::mint();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("s-"));
    }

    #[test]
    fn usage_total_sums_all_counters() {
        let usage = TokenUsage {
            input: 1,
            output: 2,
            cache_create: 3,
            cache_read: 4,
        };
        assert_eq!(usage.total(), 10);
    }

    #[test]
    fn status_is_not_persisted() {
        let mut session = Session::new(PathBuf::from("/tmp/p"));
        session.status = SessionStatus::Streaming;
        let json = serde_json::to_string(&session).unwrap();
        let restored: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.status, SessionStatus::Idle);
        assert_eq!(restored.id, session.id);
    }
}
