//! Token accounting and context-pressure evaluation.
//!
//! Usage from each result message is folded into the session's counters
//! field-wise. A successful compaction round replaces the counters wholesale
//! with the round's reported baseline instead of adding to them.

use crate::protocol::types::Usage;
use crate::session::record::{Session, TokenUsage};

/// Fold one result's usage into the session counters.
pub fn apply_result(session: &mut Session, usage: Usage) {
    session.token_usage.input += usage.input_tokens;
    session.token_usage.output += usage.output_tokens;
    session.token_usage.cache_create += usage.cache_creation_input_tokens;
    session.token_usage.cache_read += usage.cache_read_input_tokens;
}

/// Replace the counters with a post-compaction baseline.
pub fn apply_baseline(session: &mut Session, usage: Usage) {
    session.token_usage = TokenUsage::from(usage);
}

/// How close a session is to its context limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    /// Below both thresholds.
    None,
    /// Compaction requested; a cooldown may defer it.
    Advisory,
    /// Compaction required before the next user send, cooldown or not.
    Mandatory,
}

/// Threshold evaluator over accumulated usage.
#[derive(Debug, Clone, Copy)]
pub struct TokenAccountant {
    max_context_tokens: u64,
    auto_threshold: f64,
    force_threshold: f64,
}

impl TokenAccountant {
    pub fn new(max_context_tokens: u64, auto_threshold: f64, force_threshold: f64) -> Self {
        TokenAccountant {
            max_context_tokens: max_context_tokens.max(1),
            auto_threshold,
            force_threshold,
        }
    }

    /// Fraction of the context window the session has consumed.
    #[allow(clippy::cast_precision_loss)]
    pub fn usage_ratio(&self, session: &Session) -> f64 {
        session.token_usage.total() as f64 / self.max_context_tokens as f64
    }

    pub fn evaluate(&self, session: &Session) -> Pressure {
        let ratio = self.usage_ratio(session);
        if ratio >= self.force_threshold {
            Pressure::Mandatory
        } else if ratio >= self.auto_threshold {
            Pressure::Advisory
        } else {
            Pressure::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn usage(input: u64, output: u64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        }
    }

    #[test]
    fn results_accumulate_field_wise() {
        let mut session = Session::new(PathBuf::from("/p"));
        apply_result(&mut session, usage(100, 50));
        assert_eq!(session.token_usage.total(), 150);
        apply_result(&mut session, usage(80, 40));
        assert_eq!(session.token_usage.total(), 270);
        assert_eq!(session.token_usage.input, 180);
        assert_eq!(session.token_usage.output, 90);
    }

    #[test]
    fn cache_counters_accumulate_too() {
        let mut session = Session::new(PathBuf::from("/p"));
        apply_result(
            &mut session,
            Usage {
                input_tokens: 1,
                output_tokens: 2,
                cache_creation_input_tokens: 3,
                cache_read_input_tokens: 4,
            },
        );
        apply_result(
            &mut session,
            Usage {
                input_tokens: 1,
                output_tokens: 1,
                cache_creation_input_tokens: 1,
                cache_read_input_tokens: 1,
            },
        );
        assert_eq!(session.token_usage.cache_create, 4);
        assert_eq!(session.token_usage.cache_read, 5);
        assert_eq!(session.token_usage.total(), 14);
    }

    #[test]
    fn baseline_replaces_instead_of_adding() {
        let mut session = Session::new(PathBuf::from("/p"));
        apply_result(&mut session, usage(100, 50));
        apply_result(&mut session, usage(80, 40));
        assert_eq!(session.token_usage.total(), 270);

        apply_baseline(&mut session, usage(20, 0));
        assert_eq!(session.token_usage.total(), 20);
        assert_eq!(session.token_usage.input, 20);
        assert_eq!(session.token_usage.output, 0);
    }

    #[test]
    fn pressure_tracks_thresholds() {
        let accountant = TokenAccountant::new(1000, 0.96, 0.98);
        let mut session = Session::new(PathBuf::from("/p"));

        apply_result(&mut session, usage(900, 0));
        assert_eq!(accountant.evaluate(&session), Pressure::None);

        apply_result(&mut session, usage(60, 0));
        assert_eq!(accountant.evaluate(&session), Pressure::Advisory);

        apply_result(&mut session, usage(20, 0));
        assert_eq!(accountant.evaluate(&session), Pressure::Mandatory);
    }

    #[test]
    fn ratio_is_total_over_window() {
        let accountant = TokenAccountant::new(200, 0.96, 0.98);
        let mut session = Session::new(PathBuf::from("/p"));
        apply_result(&mut session, usage(30, 20));
        let ratio = accountant.usage_ratio(&session);
        assert!((ratio - 0.25).abs() < f64::EPSILON);
    }
}
