//! Per-session transcoder state owned by the slice controller.

use std::path::PathBuf;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::session::StreamInfo;

use super::VideoDecision;

/// One transcoder run rooted at a media offset.
///
/// Slice indices are dense and never reused within a session; start times
/// may go backward when the user seeks back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceInfo {
    /// Dense, monotonically assigned slice index
    pub index: u64,
    /// Media offset this slice begins at, seconds
    pub start_time: f64,
}

/// Handle to the currently running segmenter child.
///
/// The child itself lives in its watcher task; the controller keeps the
/// process ID for pause/resume signalling, the cancellation capability, and
/// a generation counter so a stale exit notification can never clobber a
/// newer launch.
#[derive(Debug)]
pub struct ActiveChild {
    /// OS process ID for signal-based pause/resume
    pub pid: Option<u32>,
    /// Launch generation; exit notifications must match to apply
    pub generation: u64,
    /// Cancelling terminates the child promptly
    pub cancel: CancellationToken,
}

/// Mutable controller record for one session.
#[derive(Debug)]
pub struct TranscodeSession {
    /// Session ID (mirrors the registry key)
    pub id: String,
    /// Source URI the transcoder reads
    pub source: String,
    /// Root work directory holding `slice_NNN/` children
    pub work_dir: PathBuf,
    /// Probed container duration, used for clamping seeks
    pub duration_hint: f64,
    /// Video copy/re-encode decision from the prober
    pub video: VideoDecision,
    /// Selected audio track, relative audio index
    pub audio_index: usize,
    /// Codec of the selected track
    pub audio_codec: String,
    /// Audio track descriptors discovered at ensure time
    pub available_streams: Vec<StreamInfo>,

    /// Index of the active slice
    pub slice_index: u64,
    /// All slices created so far, in creation order
    pub slices: Vec<SliceInfo>,
    /// Idempotency key of the last applied seek
    pub last_seek_id: String,
    /// Seek target the current slice is serving
    pub currently_at: f64,

    /// The live child, if any. At most one per session.
    pub child: Option<ActiveChild>,
    /// Transcoder reached end of media and exited cleanly
    pub finished: bool,
    /// Child is currently stopped via the process-control capability
    pub paused: bool,
    /// The pause came from the duty-cycle cap rather than the hard ceiling
    pub paused_by_cap: bool,

    /// Highest segment sequence delivered to a client, -1 before the first
    pub last_served_seq: i64,
    /// Cap-pausing is suppressed until this instant while a client is
    /// actively pulling assets
    pub demand_resume_until: Option<Instant>,
}

impl TranscodeSession {
    /// Directory of the slice with the given index.
    pub fn slice_dir(&self, index: u64) -> PathBuf {
        self.work_dir.join(format!("slice_{index:03}"))
    }

    /// Directory of the active slice.
    pub fn current_slice_dir(&self) -> PathBuf {
        self.slice_dir(self.slice_index)
    }

    /// Manifest path of the active slice.
    pub fn current_manifest_path(&self) -> PathBuf {
        self.current_slice_dir().join("child.m3u8")
    }

    /// Start time of the active slice.
    pub fn current_slice_start(&self) -> f64 {
        self.slices
            .iter()
            .find(|s| s.index == self.slice_index)
            .map(|s| s.start_time)
            .unwrap_or(0.0)
    }

    /// Whether a demand-grace window is currently open.
    pub fn in_demand_grace(&self, now: Instant) -> bool {
        self.demand_resume_until.is_some_and(|until| now < until)
    }
}
