//! Torrent streaming adapter.
//!
//! Admits magnets into a wrapped BitTorrent client, selects the main video
//! file, biases the swarm toward seek-friendly head and tail pieces, and
//! exposes the file as a seekable byte stream behind
//! `/torrents/{hash}`. Session creation never blocks on the swarm:
//! preparation runs behind a once-latch and readiness is reported through
//! the status endpoint.

pub mod client;
pub mod rqbit;
pub mod streamer;

use serde::Serialize;

pub use client::{
    SwarmStats, TorrentClient, TorrentFileInfo, TorrentFileReader, TorrentHandle,
};
pub use rqbit::RqbitClient;
pub use streamer::{TargetFile, TorrentStream, TorrentStreamer};

/// Errors from torrent admission, preparation, and serving.
///
/// Clonable because a stream's preparation failure is cached terminally and
/// replayed to every subsequent caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TorrentError {
    /// The client rejected the magnet or info hash
    #[error("failed to add torrent: {reason}")]
    AddFailed {
        /// What went wrong
        reason: String,
    },

    /// The swarm did not deliver metadata within the budget
    #[error("timeout waiting for torrent metadata")]
    MetadataTimeout,

    /// The torrent has no files, or file selection failed
    #[error("no usable file in torrent")]
    NoFile,

    /// Lookup for an info hash the adapter does not track
    #[error("torrent {info_hash} not found")]
    NotFound {
        /// The hash that failed to resolve
        info_hash: String,
    },

    /// Serving was attempted before preparation finished
    #[error("torrent not ready: {reason}")]
    NotReady {
        /// What is still outstanding
        reason: String,
    },

    /// A read against the target file failed
    #[error("torrent read failed: {reason}")]
    ReadFailed {
        /// What went wrong
        reason: String,
    },
}

impl TorrentError {
    /// Whether the failure is transient and worth retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TorrentError::NotReady { .. } | TorrentError::MetadataTimeout
        )
    }
}

/// Lifecycle stage reported by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TorrentStage {
    /// Waiting for the swarm to deliver torrent metadata
    Metadata,
    /// Metadata known, target file downloading
    Downloading,
    /// Target file selected and servable
    Ready,
    /// Preparation failed terminally
    Error,
    /// The adapter does not track this hash
    Missing,
}

/// Status JSON for `/torrents/{hash}/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentStatus {
    /// Lifecycle stage
    pub stage: TorrentStage,
    /// Whether the target file is servable
    pub ready: bool,
    /// Cached preparation error, if any
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Connected peers
    #[serde(skip_serializing_if = "is_zero_usize")]
    pub peers: usize,
    /// Completed pieces across the torrent
    #[serde(skip_serializing_if = "is_zero_usize")]
    pub pieces_complete: usize,
    /// Total pieces in the torrent
    #[serde(skip_serializing_if = "is_zero_usize")]
    pub pieces_total: usize,
    /// Completion ratio in `[0, 1]`
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub progress: f64,
    /// Payload bytes received from the swarm
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub down_useful_bytes: u64,
}

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_json_omits_zero_fields() {
        let status = TorrentStatus {
            stage: TorrentStage::Metadata,
            ready: false,
            error: String::new(),
            peers: 0,
            pieces_complete: 0,
            pieces_total: 0,
            progress: 0.0,
            down_useful_bytes: 0,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"stage":"metadata","ready":false}"#);
    }

    #[test]
    fn test_status_json_camel_case_fields() {
        let status = TorrentStatus {
            stage: TorrentStage::Downloading,
            ready: false,
            error: String::new(),
            peers: 4,
            pieces_complete: 10,
            pieces_total: 100,
            progress: 0.1,
            down_useful_bytes: 1234,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"piecesComplete\":10"));
        assert!(json.contains("\"piecesTotal\":100"));
        assert!(json.contains("\"downUsefulBytes\":1234"));
    }
}
