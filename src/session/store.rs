//! Durable session records.
//!
//! One JSON file per session under `<state-dir>/sessions/`. Saves go through
//! a temp file and an atomic rename so a concurrent load never observes a
//! half-written record. Missing and corrupt records both read as "not
//! found"; callers treat them like a new session.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::record::{Session, SessionId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("another instance holds the lock at {0}")]
    Locked(PathBuf),
    #[error("failed to serialize session record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// On-disk shape: the session plus the time it was written.
#[derive(Serialize, Deserialize)]
struct StoredSession {
    saved_at: SystemTime,
    #[serde(flatten)]
    session: Session,
}

pub struct SessionStore {
    sessions_dir: PathBuf,
}

impl SessionStore {
    /// Open (creating if needed) the store under `state_dir`.
    pub fn open(state_dir: &Path) -> Result<Self, StoreError> {
        let sessions_dir = state_dir.join("sessions");
        fs::create_dir_all(&sessions_dir).map_err(|e| io_err(&sessions_dir, e))?;
        Ok(SessionStore { sessions_dir })
    }

    /// Load a session record, or `None` if it is missing or unreadable.
    ///
    /// A corrupt record is logged and left on disk for inspection; from the
    /// caller's perspective it does not exist.
    pub fn load(&self, id: &SessionId) -> Option<Session> {
        let path = self.session_path(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(session_id = %id, error = %e, "failed to read session record");
                return None;
            }
        };
        match serde_json::from_str::<StoredSession>(&content) {
            Ok(stored) => Some(stored.session),
            Err(e) => {
                warn!(session_id = %id, error = %e, "ignoring corrupt session record");
                None
            }
        }
    }

    /// Durably save a session. Atomic with respect to concurrent loads.
    pub fn save(&self, session: &Session) -> Result<(), StoreError> {
        let stored = StoredSession {
            saved_at: SystemTime::now(),
            session: session.clone(),
        };
        let json = serde_json::to_string(&stored)?;

        let path = self.session_path(&session.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    /// All session ids present in the store, sorted.
    pub fn list(&self) -> Result<Vec<SessionId>, StoreError> {
        let mut ids = Vec::new();
        let entries = fs::read_dir(&self.sessions_dir).map_err(|e| io_err(&self.sessions_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&self.sessions_dir, e))?;
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(SessionId::new(stem));
            }
        }
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }

    fn session_path(&self, id: &SessionId) -> PathBuf {
        self.sessions_dir.join(format!("{id}.json"))
    }
}

/// Held for the engine's lifetime; released on drop (the `File` lock is
/// released on drop by fs2).
#[derive(Debug)]
pub struct StoreLock {
    _file: File,
}

/// Take the exclusive engine lock for a state directory.
///
/// A second engine instance pointed at the same directory fails fast here
/// instead of racing the first one's session writes.
pub fn lock_state_dir(state_dir: &Path) -> Result<StoreLock, StoreError> {
    fs::create_dir_all(state_dir).map_err(|e| io_err(state_dir, e))?;
    let path = state_dir.join("engine.lock");
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|e| io_err(&path, e))?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(StoreLock { _file: file }),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(StoreError::Locked(path)),
        Err(e) => Err(io_err(&path, e)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::protocol::decode::parse_line;
    use crate::session::record::{ResumeId, TokenUsage};
    use tempfile::TempDir;

    fn sample_session() -> Session {
        let mut session = Session::new(PathBuf::from("/home/dev/project"));
        session.external_resume_id = Some(ResumeId::new("ext-123"));
        session.token_usage = TokenUsage {
            input: 100,
            output: 50,
            cache_create: 7,
            cache_read: 3,
        };
        session.compaction.attempts = 1;
        session.messages.push(
            parse_line(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#)
                .unwrap()
                .unwrap(),
        );
        session
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let session = sample_session();

        store.save(&session).unwrap();
        let loaded = store.load(&session.id).unwrap();

        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.external_resume_id, session.external_resume_id);
        assert_eq!(loaded.token_usage, session.token_usage);
        assert_eq!(loaded.compaction, session.compaction);
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.working_directory, session.working_directory);
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        assert!(store.load(&SessionId::new("s-nope")).is_none());
    }

    #[test]
    fn load_corrupt_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let id = SessionId::new("s-bad");
        fs::write(dir.path().join("sessions").join("s-bad.json"), "{not json").unwrap();
        assert!(store.load(&id).is_none());
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let session = sample_session();
        store.save(&session).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path().join("sessions"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn save_overwrites_previous_record() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let mut session = sample_session();
        store.save(&session).unwrap();

        session.external_resume_id = Some(ResumeId::new("ext-456"));
        store.save(&session).unwrap();

        let loaded = store.load(&session.id).unwrap();
        assert_eq!(loaded.external_resume_id, Some(ResumeId::new("ext-456")));
    }

    #[test]
    fn list_returns_sorted_ids() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        let mut b = Session::new(PathBuf::from("/b"));
        b.id = SessionId::new("s-bbb");
        let mut a = Session::new(PathBuf::from("/a"));
        a.id = SessionId::new("s-aaa");
        store.save(&b).unwrap();
        store.save(&a).unwrap();

        let ids = store.list().unwrap();
        assert_eq!(ids, vec![SessionId::new("s-aaa"), SessionId::new("s-bbb")]);
    }

    #[test]
    fn second_lock_fails_while_first_is_held() {
        let dir = TempDir::new().unwrap();
        let _held = lock_state_dir(dir.path()).unwrap();
        match lock_state_dir(dir.path()) {
            Err(StoreError::Locked(_)) => {}
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let held = lock_state_dir(dir.path()).unwrap();
        drop(held);
        lock_state_dir(dir.path()).unwrap();
    }
}
