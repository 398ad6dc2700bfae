//! Context compaction scheduling and bookkeeping.
//!
//! When token pressure calls for it, the engine runs a dedicated
//! summarize round: the agent is resumed with its built-in compaction
//! command and replies with a fresh conversation holding a summary in
//! place of the full history. On success the session atomically
//! adopts the new resume id and the summarize round's usage as its
//! baseline. Failures are retried once after a cooldown, then the
//! session degrades to running uncompacted.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::config::EngineConfig;
use crate::paths;
use crate::protocol::types::Usage;
use crate::resume::SpawnPlan;
use crate::session::record::{CompactionState, ResumeId, Session};
use crate::tokens;

/// The agent's own compaction command, sent as the round's prompt.
pub(crate) const SUMMARIZE_PROMPT: &str = "/compact";

/// Whether a compaction round may start now.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Gate {
    Ready,
    /// Inside the cooldown window; check again after `remaining`.
    Deferred { remaining: Duration },
    /// Attempts are used up; the session runs uncompacted until a
    /// round succeeds or the operator intervenes.
    Exhausted,
}

/// Gate a compaction request against cooldown and the attempts cap.
///
/// The cooldown clock starts at the last attempt, successful or not,
/// so a failed round defers its retry instead of burning it.
pub(crate) fn evaluate_gate(
    state: &CompactionState,
    config: &EngineConfig,
    now: SystemTime,
) -> Gate {
    if state.attempts >= config.max_compaction_attempts {
        return Gate::Exhausted;
    }
    if let Some(last) = state.last_compaction_at
        && let Ok(since) = now.duration_since(last)
        && since < config.compaction_cooldown()
    {
        return Gate::Deferred {
            remaining: config.compaction_cooldown() - since,
        };
    }
    Gate::Ready
}

/// Build the summarize round's plan.
///
/// Returns `None` when the session has no resume id: with no stored
/// conversation there is nothing to compact.
pub(crate) fn summarize_plan(session: &Session, config: &EngineConfig) -> Option<SpawnPlan> {
    let resume = session.external_resume_id.clone()?;
    Some(SpawnPlan {
        prompt: SUMMARIZE_PROMPT.to_string(),
        resume: Some(resume),
        model: config.model.clone(),
        append_system_prompt: None,
        working_directory: PathBuf::from(paths::to_agent_path(&session.working_directory)),
    })
}

/// Adopt a successful summarize round.
///
/// One mutation covers the resume id swap, the usage baseline, and
/// the compaction flags, so a single durable write captures all of it.
pub(crate) fn apply_success(
    session: &mut Session,
    new_resume: ResumeId,
    baseline: Usage,
    now: SystemTime,
) {
    session.external_resume_id = Some(new_resume);
    tokens::apply_baseline(session, baseline);
    session.compaction.was_compacted = true;
    session.compaction.last_compaction_at = Some(now);
    session.compaction.attempts = 0;
}

/// Record a failed summarize round. The session keeps its id, usage,
/// and history untouched.
pub(crate) fn apply_failure(session: &mut Session, now: SystemTime) {
    session.compaction.attempts += 1;
    session.compaction.last_compaction_at = Some(now);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn test_usage(input: u64, output: u64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        }
    }

    #[test]
    fn fresh_state_is_ready() {
        let gate = evaluate_gate(
            &CompactionState::default(),
            &EngineConfig::default(),
            SystemTime::now(),
        );
        assert_eq!(gate, Gate::Ready);
    }

    #[test]
    fn recent_attempt_defers_within_cooldown() {
        let config = EngineConfig::default();
        let now = SystemTime::now();
        let state = CompactionState {
            last_compaction_at: Some(now - Duration::from_secs(10)),
            ..CompactionState::default()
        };
        match evaluate_gate(&state, &config, now) {
            Gate::Deferred { remaining } => {
                assert!(remaining <= config.compaction_cooldown());
                assert!(remaining >= config.compaction_cooldown() - Duration::from_secs(11));
            }
            other => panic!("expected deferral, got {other:?}"),
        }
    }

    #[test]
    fn cooldown_expiry_allows_the_retry() {
        let config = EngineConfig::default();
        let now = SystemTime::now();
        let state = CompactionState {
            attempts: 1,
            last_compaction_at: Some(now - config.compaction_cooldown() - Duration::from_secs(1)),
            ..CompactionState::default()
        };
        assert_eq!(evaluate_gate(&state, &config, now), Gate::Ready);
    }

    #[test]
    fn attempts_cap_exhausts_the_gate() {
        let config = EngineConfig::default();
        let state = CompactionState {
            attempts: config.max_compaction_attempts,
            ..CompactionState::default()
        };
        assert_eq!(
            evaluate_gate(&state, &config, SystemTime::now()),
            Gate::Exhausted
        );
    }

    #[test]
    fn summarize_needs_a_stored_conversation() {
        let config = EngineConfig::default();
        let mut session = Session::new(PathBuf::from("/tmp/p"));
        assert!(summarize_plan(&session, &config).is_none());

        session.external_resume_id = Some(ResumeId::new("r-1".to_string()));
        let plan = summarize_plan(&session, &config).unwrap();
        assert_eq!(plan.prompt, SUMMARIZE_PROMPT);
        assert_eq!(plan.resume.as_ref().map(ResumeId::as_str), Some("r-1"));
    }

    #[test]
    fn success_swaps_id_resets_usage_and_marks_compacted() {
        let mut session = Session::new(PathBuf::from("/tmp/p"));
        session.external_resume_id = Some(ResumeId::new("r-old".to_string()));
        tokens::apply_result(&mut session, test_usage(100, 50));
        tokens::apply_result(&mut session, test_usage(80, 40));
        assert_eq!(session.token_usage.total(), 270);

        let now = SystemTime::now();
        apply_success(
            &mut session,
            ResumeId::new("r-new".to_string()),
            test_usage(20, 0),
            now,
        );

        assert_eq!(
            session.external_resume_id.as_ref().map(ResumeId::as_str),
            Some("r-new")
        );
        assert_eq!(session.token_usage.total(), 20);
        assert!(session.compaction.was_compacted);
        assert_eq!(session.compaction.last_compaction_at, Some(now));
        assert_eq!(session.compaction.attempts, 0);
    }

    #[test]
    fn failure_counts_an_attempt_and_leaves_the_session_alone() {
        let mut session = Session::new(PathBuf::from("/tmp/p"));
        session.external_resume_id = Some(ResumeId::new("r-1".to_string()));
        tokens::apply_result(&mut session, test_usage(100, 50));

        apply_failure(&mut session, SystemTime::now());

        assert_eq!(session.compaction.attempts, 1);
        assert!(!session.compaction.was_compacted);
        assert_eq!(session.token_usage.total(), 150);
        assert_eq!(
            session.external_resume_id.as_ref().map(ResumeId::as_str),
            Some("r-1")
        );
    }
}
