//! In-memory session registry.
//!
//! Sessions map opaque IDs to their source, discovered metadata, and torrent
//! linkage. Nothing here survives a process restart; the registry is the
//! single source of truth for which streams are live.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::temp_dir_for_session;

/// How a session's source is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Local file or remote HTTP video, transcoded to HLS
    #[default]
    Http,
    /// BitTorrent magnet, admitted through the torrent adapter
    Torrent,
}

/// One audio (or pass-through subtitle) track discovered by the prober.
///
/// `index` is relative to streams of the same type, matching the ffmpeg
/// `-map 0:a:<index>` addressing used by the transcoder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Index relative to streams of this type
    pub index: usize,
    /// Stream type, `"audio"` or `"subtitle"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Codec name as reported by the analyser
    pub codec: String,
    /// ISO language tag, empty when untagged
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub language: String,
    /// Human-readable title, empty when untagged
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
}

/// A chapter marker from the source container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    /// Chapter start in seconds
    #[serde(rename = "startTime")]
    pub start_time: f64,
    /// Chapter end in seconds
    #[serde(rename = "endTime")]
    pub end_time: f64,
    /// Chapter title, empty when untagged
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
}

/// A streaming session as exposed over the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Opaque 12-character URL-safe identifier
    pub id: String,
    /// Source URI; for torrent sessions this is the adapter's internal URL
    pub source: String,
    /// Session kind; never changes after creation
    pub kind: SessionKind,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Initial playback offset in seconds
    pub start_time: f64,
    /// Discovered container duration, 0 until probed
    #[serde(default, skip_serializing_if = "is_zero")]
    pub duration_seconds: f64,
    /// Discovered chapter markers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chapters: Vec<Chapter>,
    /// Discovered audio track descriptors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available_streams: Vec<StreamInfo>,
    /// Currently selected audio track (relative audio index)
    pub audio_index: usize,
    /// Whether the session is backed by the torrent adapter
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_torrent: bool,
    /// Info hash of the backing torrent, empty for plain sessions
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub torrent_info_hash: String,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// Errors from the session registry.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A session was created without a source
    #[error("source is required")]
    MissingSource,

    /// Lookup for an unknown session ID
    #[error("session {id} not found")]
    NotFound {
        /// The ID that failed to resolve
        id: String,
    },

    /// Work directory creation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Thread-safe in-memory session registry.
///
/// Callers receive clones of the stored record; mutations go back through
/// the store so concurrent readers never observe a half-written session.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session.
    ///
    /// Validates the source, defaults the kind to [`SessionKind::Http`], and
    /// pre-creates the per-session work directory for HTTP sessions.
    ///
    /// # Errors
    ///
    /// - [`SessionError::MissingSource`] when `source` is empty
    /// - [`SessionError::Io`] when the work directory cannot be created
    pub fn create(
        &self,
        source: &str,
        kind: Option<SessionKind>,
        start_time: f64,
    ) -> Result<Session, SessionError> {
        if source.is_empty() {
            return Err(SessionError::MissingSource);
        }
        let kind = kind.unwrap_or_default();

        let id = random_id(12);
        let session = Session {
            id: id.clone(),
            source: source.to_string(),
            kind,
            created_at: Utc::now(),
            start_time,
            duration_seconds: 0.0,
            chapters: Vec::new(),
            available_streams: Vec::new(),
            audio_index: 0,
            is_torrent: false,
            torrent_info_hash: String::new(),
        };

        if kind == SessionKind::Http {
            std::fs::create_dir_all(temp_dir_for_session(&id))?;
        }

        let mut sessions = self.sessions.write().expect("session lock poisoned");
        sessions.insert(id, session.clone());
        Ok(session)
    }

    /// Fetch a session by ID.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] for unknown IDs.
    pub fn get(&self, id: &str) -> Result<Session, SessionError> {
        let sessions = self.sessions.read().expect("session lock poisoned");
        sessions
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })
    }

    /// Apply a mutation to a stored session under the registry lock.
    ///
    /// Returns `false` when the session no longer exists.
    pub fn update<F>(&self, id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Session),
    {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        match sessions.get_mut(id) {
            Some(session) => {
                mutate(session);
                true
            }
            None => false,
        }
    }

    /// Remove a session. Unknown IDs are ignored.
    pub fn delete(&self, id: &str) {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        sessions.remove(id);
    }

    /// Snapshot of all live session IDs.
    pub fn ids(&self) -> Vec<String> {
        let sessions = self.sessions.read().expect("session lock poisoned");
        sessions.keys().cloned().collect()
    }
}

fn random_id(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_defaults_kind_to_http() {
        let store = SessionStore::new();
        let session = store.create("http://host/video.mp4", None, 0.0).unwrap();

        assert_eq!(session.kind, SessionKind::Http);
        assert_eq!(session.id.len(), 12);
        assert_eq!(session.audio_index, 0);
        assert!(temp_dir_for_session(&session.id).is_dir());

        std::fs::remove_dir_all(temp_dir_for_session(&session.id)).unwrap();
    }

    #[test]
    fn test_create_rejects_empty_source() {
        let store = SessionStore::new();
        assert!(matches!(
            store.create("", None, 0.0),
            Err(SessionError::MissingSource)
        ));
    }

    #[test]
    fn test_ids_are_unique() {
        let store = SessionStore::new();
        let a = store.create("file:///a.mkv", None, 0.0).unwrap();
        let b = store.create("file:///b.mkv", None, 0.0).unwrap();
        assert_ne!(a.id, b.id);

        for id in [&a.id, &b.id] {
            std::fs::remove_dir_all(temp_dir_for_session(id)).unwrap();
        }
    }

    #[test]
    fn test_update_and_delete() {
        let store = SessionStore::new();
        let session = store.create("http://host/v.mp4", None, 0.0).unwrap();

        assert!(store.update(&session.id, |s| s.audio_index = 2));
        assert_eq!(store.get(&session.id).unwrap().audio_index, 2);

        store.delete(&session.id);
        assert!(matches!(
            store.get(&session.id),
            Err(SessionError::NotFound { .. })
        ));
        assert!(!store.update(&session.id, |s| s.audio_index = 3));

        std::fs::remove_dir_all(temp_dir_for_session(&session.id)).unwrap();
    }

    #[test]
    fn test_session_json_omits_zero_values() {
        let store = SessionStore::new();
        let session = store.create("http://host/v.mp4", None, 0.0).unwrap();
        let json = serde_json::to_string(&session).unwrap();

        assert!(!json.contains("durationSeconds"));
        assert!(!json.contains("chapters"));
        assert!(!json.contains("isTorrent"));
        assert!(json.contains("\"kind\":\"http\""));

        std::fs::remove_dir_all(temp_dir_for_session(&session.id)).unwrap();
    }
}
