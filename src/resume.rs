//! Spawn planning and resume-failure classification.
//!
//! A session resumes its prior conversation only when an earlier round
//! left a resume id on record. The id always comes from the agent
//! itself (the init message of a previous round); it is never invented
//! here. When the agent reports that the conversation behind a stored
//! id no longer exists, the id is cleared and the send is re-issued
//! fresh, exactly once.

use std::path::PathBuf;

use crate::config::EngineConfig;
use crate::paths;
use crate::session::record::{ResumeId, Session};

/// Everything needed to launch one agent round.
#[derive(Debug, Clone)]
pub struct SpawnPlan {
    pub prompt: String,
    pub resume: Option<ResumeId>,
    pub model: Option<String>,
    pub append_system_prompt: Option<String>,
    pub working_directory: PathBuf,
}

impl SpawnPlan {
    /// Render CLI arguments for the agent.
    ///
    /// Argument order matters to the agent: `--resume` must come
    /// first, and `--print` is only valid on fresh runs, never
    /// together with `--resume`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(resume) = &self.resume {
            args.push("--resume".to_string());
            args.push(resume.to_string());
        }
        if !self.prompt.trim().is_empty() {
            args.push("-p".to_string());
            args.push(self.prompt.clone());
        }
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push("--output-format".to_string());
        args.push("stream-json".to_string());
        if self.resume.is_none() {
            args.push("--print".to_string());
        }
        args.push("--verbose".to_string());
        if let Some(system_prompt) = &self.append_system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(system_prompt.clone());
        }
        args
    }
}

/// Build the plan for sending `text` on `session`.
///
/// The working directory is mapped into the agent's filesystem
/// namespace; on hosts where the two coincide it passes through
/// unchanged.
pub fn prepare_send(session: &Session, text: &str, config: &EngineConfig) -> SpawnPlan {
    SpawnPlan {
        prompt: text.to_string(),
        resume: session.external_resume_id.clone(),
        model: config.model.clone(),
        append_system_prompt: config.append_system_prompt.clone(),
        working_directory: PathBuf::from(paths::to_agent_path(&session.working_directory)),
    }
}

/// How a finished round should be interpreted.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RoundEnd {
    /// The agent delivered a result and exited cleanly.
    Completed,
    /// The conversation behind the resume id no longer exists.
    ResumeNotFound,
    /// Anything else: nonzero exit, signal, missing result.
    Failed { detail: String },
}

/// Classify a round once its process has exited.
///
/// `error_text` must only accumulate stderr lines and error-flagged
/// result content, so assistant prose can never trigger invalidation.
/// The `used_resume` guard keeps fresh runs from being classified as
/// invalidated, whatever their output says.
pub(crate) fn classify_round_end(
    used_resume: bool,
    exit_code: Option<i32>,
    saw_result: bool,
    error_text: &str,
) -> RoundEnd {
    if used_resume && indicates_missing_conversation(error_text) {
        return RoundEnd::ResumeNotFound;
    }
    match exit_code {
        Some(0) if saw_result => RoundEnd::Completed,
        Some(0) => RoundEnd::Failed {
            detail: "agent exited without a result message".to_string(),
        },
        Some(code) => RoundEnd::Failed {
            detail: format!("agent exited with status {code}: {}", error_text.trim()),
        },
        None if error_text.trim().is_empty() => RoundEnd::Failed {
            detail: "agent terminated by signal".to_string(),
        },
        None => RoundEnd::Failed {
            detail: format!("agent terminated by signal: {}", error_text.trim()),
        },
    }
}

fn indicates_missing_conversation(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("no conversation found") || lower.contains("no conversation with session")
}
