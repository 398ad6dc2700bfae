//! Locating the agent executable.
//!
//! Installations vary: some put the binary on `PATH`, others under
//! `~/.local/bin` or the agent's own `~/.claude/local` directory.
//! Candidates are probed in order with `--version` and the first
//! working one is cached for the lifetime of the process.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Bare executable name, resolved through `PATH`.
pub const AGENT_EXECUTABLE: &str = "claude";

/// Resolves and caches the agent executable path.
#[derive(Debug, Default)]
pub struct Discovery {
    resolved: OnceCell<PathBuf>,
}

impl Discovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// The discovered executable, probing candidates on first call.
    ///
    /// Always yields something runnable-looking: if no candidate
    /// responds to `--version`, falls back to the bare name so the
    /// spawn error surfaces through the usual path.
    pub async fn resolve(&self) -> &Path {
        self.resolved
            .get_or_init(|| async { resolve_from(&candidates()).await })
            .await
    }
}

#[cfg(not(windows))]
fn candidates() -> Vec<PathBuf> {
    let mut out = vec![
        PathBuf::from(AGENT_EXECUTABLE),
        PathBuf::from("/usr/local/bin/claude"),
    ];
    if let Some(home) = dirs::home_dir() {
        out.push(home.join(".local/bin/claude"));
        out.push(home.join(".claude/local/claude"));
    }
    out
}

#[cfg(windows)]
fn candidates() -> Vec<PathBuf> {
    let mut out = vec![PathBuf::from("claude.cmd"), PathBuf::from("claude.exe")];
    if let Some(home) = dirs::home_dir() {
        out.push(home.join(".claude").join("local").join("claude.exe"));
    }
    out
}

async fn resolve_from(candidates: &[PathBuf]) -> PathBuf {
    for candidate in candidates {
        if probe(candidate).await {
            debug!(path = %candidate.display(), "agent executable found");
            return candidate.clone();
        }
    }
    warn!("no agent executable answered --version; falling back to PATH lookup");
    PathBuf::from(AGENT_EXECUTABLE)
}

async fn probe(path: &Path) -> bool {
    let status = Command::new(path)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) => status.success(),
        Err(error) => {
            debug!(path = %path.display(), %error, "candidate probe failed");
            false
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[cfg(not(windows))]
    #[test]
    fn path_lookup_is_tried_first() {
        let candidates = candidates();
        assert_eq!(candidates[0], PathBuf::from(AGENT_EXECUTABLE));
    }

    #[tokio::test]
    async fn probe_rejects_missing_binary() {
        assert!(!probe(Path::new("/nonexistent/agent-binary")).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn first_working_candidate_wins() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-agent");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let missing = dir.path().join("missing");
        let resolved = resolve_from(&[missing, script.clone()]).await;
        assert_eq!(resolved, script);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn falls_back_to_bare_name_when_nothing_probes() {
        let resolved = resolve_from(&[PathBuf::from("/nonexistent/agent-binary")]).await;
        assert_eq!(resolved, PathBuf::from(AGENT_EXECUTABLE));
    }
}
