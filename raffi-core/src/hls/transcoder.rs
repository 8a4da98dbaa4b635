//! Transcoder driver: launches the external segmenter as a child process
//! writing a rolling playlist plus `.ts` segments into a slice directory.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use super::{HlsError, VideoDecision, is_http_source};

/// Everything needed to launch one segmenter run.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    /// Source URI handed to the segmenter
    pub source: String,
    /// Slice directory receiving `child.m3u8` and segments
    pub out_dir: PathBuf,
    /// Media offset to start from, seconds
    pub start_seconds: f64,
    /// Starting segment sequence number (`-start_number`)
    pub start_seq: u64,
    /// Target segment duration
    pub segment_duration: Duration,
    /// Video copy/re-encode decision
    pub video: VideoDecision,
    /// Audio track to map, relative to audio streams
    pub audio_index: usize,
    /// Codec of that track as reported by the prober
    pub audio_codec: String,
    /// Resume an existing playlist instead of wiping the directory
    pub append: bool,
}

/// A running segmenter child.
///
/// The controller hands this to a watcher task; pause/resume signalling goes
/// through the process ID held separately in the session record.
#[async_trait]
pub trait TranscodeProcess: Send {
    /// OS process ID, if the child is still identifiable.
    fn pid(&self) -> Option<u32>;

    /// Wait for the child to exit. Returns `true` on a clean (zero) exit.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the underlying wait.
    async fn wait(&mut self) -> std::io::Result<bool>;

    /// Terminate the child. Idempotent.
    async fn kill(&mut self);
}

/// Seam for launching segmenter runs, mockable in controller tests.
pub trait Transcoder: Send + Sync {
    /// Launch the segmenter for `job`.
    ///
    /// Cold starts (`append == false`) wipe the output directory first;
    /// append mode leaves it intact so the resumed run continues the same
    /// playlist.
    ///
    /// # Errors
    ///
    /// [`HlsError::TranscoderFailed`] when the child cannot be spawned,
    /// [`HlsError::Io`] when the directory cannot be prepared.
    fn spawn(&self, job: &TranscodeJob) -> Result<Box<dyn TranscodeProcess>, HlsError>;
}

/// Production driver shelling out to `ffmpeg`.
#[derive(Debug, Default)]
pub struct FfmpegTranscoder;

impl FfmpegTranscoder {
    /// Create a driver using `ffmpeg` from `PATH`.
    pub fn new() -> Self {
        Self
    }
}

/// Builds the full ffmpeg argument vector for a job.
///
/// Kept separate from spawning so the argument contract is testable without
/// launching processes.
pub fn build_ffmpeg_args(job: &TranscodeJob) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hwaccel".into(), "auto".into()];

    if is_http_source(&job.source) {
        // Keep flaky upstreams alive across stalls; 5s cap on redial backoff.
        args.extend(
            [
                "-reconnect",
                "1",
                "-reconnect_at_eof",
                "1",
                "-reconnect_streamed",
                "1",
                "-reconnect_delay_max",
                "5",
            ]
            .map(String::from),
        );
    }

    if job.start_seconds > 0.0 {
        // -ss before -i: fast seek on the demuxer side.
        args.push("-ss".into());
        args.push(format!("{}", job.start_seconds));
    }

    args.push("-i".into());
    args.push(job.source.clone());
    args.push("-map".into());
    args.push("0:v:0".into());
    args.push("-map".into());
    args.push(format!("0:a:{}", job.audio_index));

    match job.video {
        VideoDecision::Copy => {
            args.push("-c:v".into());
            args.push("copy".into());
        }
        VideoDecision::Reencode => {
            args.push("-c:v".into());
            args.push("libx264".into());
            args.push("-preset".into());
            args.push("ultrafast".into());
        }
    }

    if job.audio_codec == "aac" {
        args.push("-c:a".into());
        args.push("copy".into());
    } else {
        args.extend(
            [
                "-c:a",
                "aac",
                "-ac",
                "2",
                "-ar",
                "48000",
                "-b:a",
                "160k",
                "-af",
                "aresample=async=1",
            ]
            .map(String::from),
        );
    }

    let mut hls_flags = String::from("independent_segments+temp_file");
    if job.append {
        hls_flags.push_str("+append_list");
    }

    args.extend(
        [
            "-avoid_negative_ts",
            "make_zero",
            "-muxdelay",
            "0",
            "-muxpreload",
            "0",
            "-max_interleave_delta",
            "0",
            "-f",
            "hls",
        ]
        .map(String::from),
    );
    args.push("-hls_time".into());
    args.push(format!("{:.2}", job.segment_duration.as_secs_f64()));
    args.extend(["-hls_list_size", "0", "-hls_playlist_type", "event"].map(String::from));
    args.push("-hls_flags".into());
    args.push(hls_flags);
    args.push("-start_number".into());
    args.push(job.start_seq.to_string());
    args.push("-hls_segment_filename".into());
    args.push(
        job.out_dir
            .join("segment%05d.ts")
            .to_string_lossy()
            .into_owned(),
    );
    args.push(job.out_dir.join("child.m3u8").to_string_lossy().into_owned());

    args
}

struct FfmpegProcess {
    child: tokio::process::Child,
}

#[async_trait]
impl TranscodeProcess for FfmpegProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> std::io::Result<bool> {
        let status = self.child.wait().await?;
        Ok(status.success())
    }

    async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}

impl Transcoder for FfmpegTranscoder {
    fn spawn(&self, job: &TranscodeJob) -> Result<Box<dyn TranscodeProcess>, HlsError> {
        if !job.append {
            let _ = std::fs::remove_dir_all(&job.out_dir);
            std::fs::create_dir_all(&job.out_dir)?;
        }

        let args = build_ffmpeg_args(job);
        tracing::debug!(source = %job.source, seek = job.start_seconds, append = job.append,
            "launching ffmpeg {}", args.join(" "));

        let child = tokio::process::Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| HlsError::TranscoderFailed {
                reason: format!("ffmpeg start failed: {e}"),
            })?;

        Ok(Box::new(FfmpegProcess { child }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> TranscodeJob {
        TranscodeJob {
            source: "http://host/video.mp4".into(),
            out_dir: PathBuf::from("/tmp/raffi/s/slice_000"),
            start_seconds: 0.0,
            start_seq: 0,
            segment_duration: Duration::from_secs(6),
            video: VideoDecision::Copy,
            audio_index: 0,
            audio_codec: "aac".into(),
            append: false,
        }
    }

    fn args_of(job: &TranscodeJob) -> Vec<String> {
        build_ffmpeg_args(job)
    }

    fn window(args: &[String], flag: &str) -> Option<String> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1).cloned())
    }

    #[test]
    fn test_http_source_enables_reconnect() {
        let args = args_of(&job());
        assert!(args.contains(&"-reconnect".to_string()));
        assert_eq!(window(&args, "-reconnect_delay_max").as_deref(), Some("5"));
    }

    #[test]
    fn test_local_source_skips_reconnect() {
        let mut j = job();
        j.source = "/media/video.mkv".into();
        let args = args_of(&j);
        assert!(!args.contains(&"-reconnect".to_string()));
    }

    #[test]
    fn test_seek_precedes_input() {
        let mut j = job();
        j.start_seconds = 300.0;
        let args = args_of(&j);
        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < input);
        assert_eq!(args[ss + 1], "300");
    }

    #[test]
    fn test_zero_seek_omits_ss() {
        let args = args_of(&job());
        assert!(!args.contains(&"-ss".to_string()));
    }

    #[test]
    fn test_copy_decision_passes_video_through() {
        let args = args_of(&job());
        assert_eq!(window(&args, "-c:v").as_deref(), Some("copy"));
        assert!(!args.contains(&"-preset".to_string()));
    }

    #[test]
    fn test_reencode_decision_uses_ultrafast_x264() {
        let mut j = job();
        j.video = VideoDecision::Reencode;
        let args = args_of(&j);
        assert_eq!(window(&args, "-c:v").as_deref(), Some("libx264"));
        assert_eq!(window(&args, "-preset").as_deref(), Some("ultrafast"));
    }

    #[test]
    fn test_aac_audio_is_copied() {
        let args = args_of(&job());
        assert_eq!(window(&args, "-c:a").as_deref(), Some("copy"));
    }

    #[test]
    fn test_other_audio_transcodes_to_stereo_aac() {
        let mut j = job();
        j.audio_codec = "dts".into();
        j.audio_index = 2;
        let args = args_of(&j);
        assert_eq!(window(&args, "-c:a").as_deref(), Some("aac"));
        assert_eq!(window(&args, "-ar").as_deref(), Some("48000"));
        assert_eq!(window(&args, "-b:a").as_deref(), Some("160k"));
        assert!(args.contains(&"0:a:2".to_string()));
    }

    #[test]
    fn test_hls_flags_and_start_number() {
        let mut j = job();
        j.start_seq = 3;
        let args = args_of(&j);
        assert_eq!(
            window(&args, "-hls_flags").as_deref(),
            Some("independent_segments+temp_file")
        );
        assert_eq!(window(&args, "-start_number").as_deref(), Some("3"));
        assert_eq!(window(&args, "-hls_playlist_type").as_deref(), Some("event"));
        assert_eq!(window(&args, "-hls_list_size").as_deref(), Some("0"));
    }

    #[test]
    fn test_append_mode_adds_append_list() {
        let mut j = job();
        j.append = true;
        let args = args_of(&j);
        assert_eq!(
            window(&args, "-hls_flags").as_deref(),
            Some("independent_segments+temp_file+append_list")
        );
    }
}
