//! Media analysis via an external prober.
//!
//! Runs ffprobe against a source URI and parses its JSON report into the
//! metadata the controller needs: duration, chapters, per-stream codec and
//! language tags, and the video-copy decision.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{HlsError, is_torrent_source};

/// Whether the first video stream can be stream-copied into HLS segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoDecision {
    /// `h264` in a baseline-compatible profile: copy without re-encoding
    Copy,
    /// Anything else: re-encode with libx264
    Reencode,
}

/// Parsed analyser report for one source.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Metadata {
    /// Container-level format information
    #[serde(default)]
    pub format: FormatInfo,
    /// All streams in declaration order
    #[serde(default)]
    pub streams: Vec<ProbedStream>,
    /// Chapter markers
    #[serde(default)]
    pub chapters: Vec<ProbedChapter>,
}

/// Container-level format section of the report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatInfo {
    /// Duration in seconds, as the analyser's decimal string
    #[serde(default)]
    pub duration: String,
}

/// One stream entry of the report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbedStream {
    /// Absolute stream index
    #[serde(default)]
    pub index: usize,
    /// Codec name, e.g. `h264`, `aac`
    #[serde(default)]
    pub codec_name: String,
    /// Stream type, e.g. `video`, `audio`, `subtitle`
    #[serde(default)]
    pub codec_type: String,
    /// Codec profile, e.g. `High 10`
    #[serde(default)]
    pub profile: String,
    /// Pixel format for video streams
    #[serde(default)]
    pub pix_fmt: String,
    /// Container tags
    #[serde(default)]
    pub tags: StreamTags,
}

/// Language/title tags attached to a stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamTags {
    /// ISO language tag
    #[serde(default)]
    pub language: String,
    /// Human-readable title
    #[serde(default)]
    pub title: String,
}

/// One chapter entry of the report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbedChapter {
    /// Chapter start in seconds, as a decimal string
    #[serde(default)]
    pub start_time: String,
    /// Chapter end in seconds, as a decimal string
    #[serde(default)]
    pub end_time: String,
    /// Container tags
    #[serde(default)]
    pub tags: ChapterTags,
}

/// Title tag attached to a chapter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChapterTags {
    /// Chapter title
    #[serde(default)]
    pub title: String,
}

impl Metadata {
    /// Container duration in seconds, 0.0 when the analyser omitted it.
    pub fn duration_seconds(&self) -> f64 {
        self.format.duration.parse().unwrap_or(0.0)
    }

    /// Decide whether the first video stream is safe to stream-copy.
    ///
    /// `h264` copies cleanly into MPEG-TS segments unless it uses a 10-bit
    /// or 4:2:2/4:4:4 profile, which most hardware decoders reject.
    pub fn video_decision(&self) -> VideoDecision {
        for stream in &self.streams {
            if stream.codec_type != "video" {
                continue;
            }
            if stream.codec_name == "h264"
                && stream.profile != "High 10"
                && stream.profile != "High 4:2:2"
                && stream.profile != "High 4:4:4 Predictive"
            {
                return VideoDecision::Copy;
            }
            break;
        }
        VideoDecision::Reencode
    }
}

/// Seam for media analysis, mockable in controller tests.
#[async_trait]
pub trait MediaProber: Send + Sync {
    /// Analyse `source`, failing after `timeout`.
    ///
    /// # Errors
    ///
    /// [`HlsError::ProbeFailed`] when the analyser exits non-zero, emits
    /// malformed JSON, or the deadline fires.
    async fn probe(&self, source: &str, timeout: Duration) -> Result<Metadata, HlsError>;
}

/// Production prober shelling out to `ffprobe`.
#[derive(Debug, Default)]
pub struct FfprobeProber;

impl FfprobeProber {
    /// Create a prober using `ffprobe` from `PATH`.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, source: &str, timeout: Duration) -> Result<Metadata, HlsError> {
        // Torrent-backed sources get the metadata flag so the adapter widens
        // its read-ahead while ffprobe scans trailer boxes.
        let probe_source = if is_torrent_source(source) {
            let sep = if source.contains('?') { '&' } else { '?' };
            format!("{source}{sep}metadata=1")
        } else {
            source.to_string()
        };

        let mut cmd = tokio::process::Command::new("ffprobe");
        cmd.args([
            "-v",
            "quiet",
            "-analyzeduration",
            "200M",
            "-probesize",
            "200M",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
            "-show_chapters",
        ])
        .arg(&probe_source)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| HlsError::ProbeFailed {
                reason: format!("deadline exceeded after {timeout:?}"),
            })?
            .map_err(|e| HlsError::ProbeFailed {
                reason: format!("failed to run ffprobe: {e}"),
            })?;

        if !output.status.success() {
            return Err(HlsError::ProbeFailed {
                reason: format!("ffprobe exited with {}", output.status),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| HlsError::ProbeFailed {
            reason: format!("invalid ffprobe JSON: {e}"),
        })
    }
}
