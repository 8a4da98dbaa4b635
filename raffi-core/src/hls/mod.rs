//! HLS slice pipeline: probing, transcoder supervision, playlist inspection,
//! and the per-session slice controller.
//!
//! A "slice" is one contiguous transcoder run rooted at a media offset,
//! producing one rolling playlist plus segment series on disk. The
//! controller decides when a seek can reuse an existing slice and when a
//! fresh transcoder launch is required, and throttles running transcoders
//! against client demand.

pub mod controller;
pub mod playlist;
pub mod probe;
pub mod session;
pub mod throttle;
pub mod transcoder;

use std::path::PathBuf;

pub use controller::{SeekOutcome, SliceController};
pub use probe::{FfprobeProber, MediaProber, Metadata, VideoDecision};
pub use session::{SliceInfo, TranscodeSession};
pub use throttle::{PlatformProcessControl, ProcessControl};
pub use transcoder::{FfmpegTranscoder, TranscodeJob, TranscodeProcess, Transcoder};

/// Errors from the HLS pipeline.
#[derive(Debug, thiserror::Error)]
pub enum HlsError {
    /// The media analyser failed or produced unparseable output
    #[error("probe failed: {reason}")]
    ProbeFailed {
        /// What went wrong
        reason: String,
    },

    /// The segmenter could not be launched
    #[error("transcoder failed: {reason}")]
    TranscoderFailed {
        /// What went wrong
        reason: String,
    },

    /// The rolling playlist did not appear within its readiness budget
    #[error("timeout waiting for manifest: {path}")]
    ManifestTimeout {
        /// Manifest that never materialised
        path: PathBuf,
    },

    /// A requested segment never appeared on disk
    #[error("timeout waiting for file: {path}")]
    SegmentUnavailable {
        /// Segment that never materialised
        path: PathBuf,
    },

    /// Operation against an unknown controller session
    #[error("session {id} not found")]
    SessionNotFound {
        /// The ID that failed to resolve
        id: String,
    },

    /// Filesystem errors from work-directory management
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HlsError {
    /// Whether the failure is transient: the client may retry and succeed
    /// once the transcoder catches up.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HlsError::ManifestTimeout { .. } | HlsError::SegmentUnavailable { .. }
        )
    }
}

/// Returns true when the source is a remote HTTP(S) URI.
///
/// Local files tolerate indefinite transcoder pauses; HTTP upstreams may
/// drop the connection, which changes the throttle policy.
pub fn is_http_source(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Returns true when the source is served by the torrent adapter.
///
/// Torrent sessions point at a local adapter URL like
/// `http://127.0.0.1:6969/torrents/{infoHash}`.
pub fn is_torrent_source(source: &str) -> bool {
    source.contains("/torrents/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_classification() {
        assert!(is_http_source("http://host/video.mp4"));
        assert!(is_http_source("https://host/video.mp4"));
        assert!(!is_http_source("/home/user/video.mkv"));

        assert!(is_torrent_source("http://127.0.0.1:6969/torrents/abcd"));
        assert!(!is_torrent_source("http://host/video.mp4"));
    }
}
