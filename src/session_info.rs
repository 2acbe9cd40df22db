//! Per-session metadata records.
//!
//! The control directory holds one directory per session, containing the
//! recording (`stream.cast`) and a `session.json` record created by the PTY
//! spawner. The stream core reads records freely but only ever updates an
//! existing one, so partial session records never materialize from this side.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

pub const SESSION_FILE: &str = "session.json";
pub const STREAM_FILE: &str = "stream.cast";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A session record. The core owns `lastClearOffset`; every other field
/// belongs to the spawner and round-trips untouched through `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(default)]
    pub last_clear_offset: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct SessionInfoStore {
    root: PathBuf,
}

impl SessionInfoStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    pub fn stream_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(STREAM_FILE)
    }

    fn record_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(SESSION_FILE)
    }

    /// Load a record. Missing and unreadable records both read as `None`;
    /// corruption is logged and treated as absence.
    pub fn load(&self, session_id: &str) -> Option<SessionInfo> {
        let path = self.record_path(session_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                debug!(session = session_id, %err, "session record unreadable");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(info) => Some(info),
            Err(err) => {
                debug!(session = session_id, %err, "session record is corrupt");
                None
            }
        }
    }

    /// Atomic save: write a sibling temp file, then rename it over the
    /// record, so concurrent readers never observe a partial write.
    pub fn save(&self, session_id: &str, info: &SessionInfo) -> Result<(), StoreError> {
        let path = self.record_path(session_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(info)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Advance `lastClearOffset` for an existing record. Never creates a
    /// record and never moves the offset backwards. Returns whether a write
    /// happened.
    pub fn advance_last_clear_offset(
        &self,
        session_id: &str,
        offset: u64,
    ) -> Result<bool, StoreError> {
        let Some(mut info) = self.load(session_id) else {
            return Ok(false);
        };
        if offset <= info.last_clear_offset {
            return Ok(false);
        }
        info.last_clear_offset = offset;
        self.save(session_id, &info)?;
        Ok(true)
    }

    /// Session ids carrying a metadata record, with their records, sorted by
    /// id.
    pub fn list(&self) -> Vec<(String, SessionInfo)> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut sessions: Vec<(String, SessionInfo)> = entries
            .flatten()
            .filter_map(|entry| {
                let session_id = entry.file_name().into_string().ok()?;
                let info = self.load(&session_id)?;
                Some((session_id, info))
            })
            .collect();
        sessions.sort_by(|a, b| a.0.cmp(&b.0));
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store_with_session(session_id: &str) -> (TempDir, SessionInfoStore) {
        let root = TempDir::new().unwrap();
        let store = SessionInfoStore::new(root.path());
        std::fs::create_dir_all(store.session_dir(session_id)).unwrap();
        (root, store)
    }

    #[test]
    fn round_trips_spawner_owned_fields() {
        let (_root, store) = store_with_session("s1");
        std::fs::write(
            store.session_dir("s1").join(SESSION_FILE),
            json!({
                "lastClearOffset": 12,
                "name": "build",
                "pid": 4242,
            })
            .to_string(),
        )
        .unwrap();

        let info = store.load("s1").unwrap();
        assert_eq!(info.last_clear_offset, 12);
        assert_eq!(info.extra["name"], "build");

        assert!(store.advance_last_clear_offset("s1", 90).unwrap());
        let reloaded = store.load("s1").unwrap();
        assert_eq!(reloaded.last_clear_offset, 90);
        assert_eq!(reloaded.extra["pid"], 4242);
    }

    #[test]
    fn never_creates_a_missing_record() {
        let (_root, store) = store_with_session("s1");
        assert!(!store.advance_last_clear_offset("s1", 10).unwrap());
        assert!(store.load("s1").is_none());
        assert!(!store.session_dir("s1").join(SESSION_FILE).exists());
    }

    #[test]
    fn offset_is_monotonic() {
        let (_root, store) = store_with_session("s1");
        store.save("s1", &SessionInfo::default()).unwrap();

        assert!(store.advance_last_clear_offset("s1", 50).unwrap());
        assert!(!store.advance_last_clear_offset("s1", 20).unwrap());
        assert_eq!(store.load("s1").unwrap().last_clear_offset, 50);
    }

    #[test]
    fn corrupt_record_reads_as_absent() {
        let (_root, store) = store_with_session("s1");
        std::fs::write(store.session_dir("s1").join(SESSION_FILE), b"{oops").unwrap();
        assert!(store.load("s1").is_none());
    }

    #[test]
    fn lists_sessions_sorted() {
        let root = TempDir::new().unwrap();
        let store = SessionInfoStore::new(root.path());
        for id in ["b", "a"] {
            std::fs::create_dir_all(store.session_dir(id)).unwrap();
            store.save(id, &SessionInfo::default()).unwrap();
        }
        // A directory without a record is not a session.
        std::fs::create_dir_all(store.session_dir("empty")).unwrap();

        let ids: Vec<String> = store.list().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
