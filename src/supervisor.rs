//! Agent subprocess supervision.
//!
//! One process per round: spawn with piped output, forward decoded
//! stdout and raw stderr lines over a channel, and guarantee the
//! process is gone when the round ends. Killing escalates from a
//! polite signal through a bounded wait to a forceful kill.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::AgentEvent;
use crate::protocol::decode::StreamDecoder;
use crate::protocol::types::StreamMessage;
use crate::resume::SpawnPlan;

/// Grace period between the polite kill and the forceful one.
const KILL_GRACE: Duration = Duration::from_secs(5);
const KILL_POLL: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 8 * 1024;

/// A running agent round.
///
/// Holds only the live process handle; everything worth keeping about
/// a round arrives through the event channel.
pub struct AgentProcess {
    child: Child,
}

impl AgentProcess {
    /// Spawn one agent round.
    ///
    /// Decoded stdout messages and stderr lines flow to `events` in
    /// output order. The channel closes once both pipes reach EOF.
    pub(crate) fn spawn(
        program: &Path,
        plan: &SpawnPlan,
        events: &mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<Self> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(plan.to_args())
            .current_dir(&plan.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn agent `{}`", program.display()))?;

        let stdout = child.stdout.take().context("agent stdout should be piped")?;
        let stderr = child.stderr.take().context("agent stderr should be piped")?;
        spawn_stdout_reader(stdout, events.clone());
        spawn_stderr_reader(stderr, events.clone());

        Ok(Self { child })
    }

    /// Wait for the process to exit and return its status code.
    ///
    /// `None` means it was terminated by a signal.
    pub(crate) async fn wait(&mut self) -> Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    /// Kill the process, politely first.
    ///
    /// Always completes: if the process outlives the grace period the
    /// forceful kill is unconditional.
    pub(crate) async fn kill(&mut self) {
        request_graceful_exit(&mut self.child);

        let deadline = tokio::time::Instant::now() + KILL_GRACE;
        while tokio::time::Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(?status, "agent exited after graceful kill");
                    return;
                }
                Ok(None) => tokio::time::sleep(KILL_POLL).await,
                Err(error) => {
                    debug!(%error, "try_wait failed during kill");
                    break;
                }
            }
        }
        if let Err(error) = self.child.kill().await {
            warn!(%error, "forceful kill failed; process may already be gone");
        }
    }
}

#[cfg(unix)]
fn request_graceful_exit(child: &mut Child) {
    if let Some(pid) = child.id()
        && let Ok(pid) = i32::try_from(pid)
    {
        let _ = unsafe { libc::kill(pid, libc::SIGTERM) };
    }
}

#[cfg(not(unix))]
fn request_graceful_exit(child: &mut Child) {
    if let Err(error) = child.start_kill() {
        debug!(%error, "start_kill failed; process may have exited");
    }
}

fn spawn_stdout_reader(mut stdout: ChildStdout, events: mpsc::UnboundedSender<AgentEvent>) {
    tokio::spawn(async move {
        let mut decoder = StreamDecoder::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut forward = |message: StreamMessage| {
            let _ = events.send(AgentEvent::Message(Box::new(message)));
        };
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => decoder.feed(&buf[..n], &mut forward),
                Err(error) => {
                    warn!(%error, "agent stdout read failed");
                    break;
                }
            }
        }
        decoder.finish(&mut forward);
    });
}

fn spawn_stderr_reader(stderr: ChildStderr, events: mpsc::UnboundedSender<AgentEvent>) {
    tokio::spawn(async move {
        let reader = BufReader::new(stderr);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if events.send(AgentEvent::Stderr(line)).is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn plan_for(dir: &Path) -> SpawnPlan {
        SpawnPlan {
            prompt: "hello".to_string(),
            resume: None,
            model: None,
            append_system_prompt: None,
            working_directory: dir.to_path_buf(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forwards_stdout_and_stderr_then_closes_channel() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = write_script(
            dir.path(),
            "agent",
            concat!(
                r#"printf '{"type":"system","subtype":"init","session_id":"r-1"}\n'"#,
                "\n",
                r#"printf 'not json\n'"#,
                "\n",
                r#"printf '{"type":"result","subtype":"success","usage":{"input_tokens":1,"output_tokens":2}}\n'"#,
                "\n",
                r#"printf 'something went sideways\n' >&2"#,
                "\n",
            ),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut process = AgentProcess::spawn(&script, &plan_for(dir.path()), &tx).unwrap();
        drop(tx);

        let mut messages = 0;
        let mut stderr_lines = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Message(_) => messages += 1,
                AgentEvent::Stderr(line) => stderr_lines.push(line),
            }
        }
        // The malformed line is dropped by the decoder.
        assert_eq!(messages, 2);
        assert_eq!(stderr_lines, vec!["something went sideways".to_string()]);
        assert_eq!(process.wait().await.unwrap(), Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_completes_against_a_sleeping_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = write_script(dir.path(), "agent", "exec sleep 30\n");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut process = AgentProcess::spawn(&script, &plan_for(dir.path()), &tx).unwrap();
        drop(tx);

        process.kill().await;
        let code = process.wait().await.unwrap();
        // SIGTERM leaves no exit code.
        assert_eq!(code, None);
        while rx.recv().await.is_some() {}
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_failure_surfaces_as_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let missing = dir.path().join("not-there");
        assert!(AgentProcess::spawn(&missing, &plan_for(dir.path()), &tx).is_err());
    }
}
