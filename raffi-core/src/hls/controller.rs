//! The slice controller: per-session transcoder lifecycle, seek-aware slice
//! reuse, and the throttle loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::{HlsConfig, temp_dir_for_session};
use crate::session::StreamInfo;

use super::playlist::{read_playlist_state, wait_for_manifest_ready};
use super::session::{ActiveChild, SliceInfo, TranscodeSession};
use super::throttle::{self, ProcessControl, ThrottleAction, ThrottleSnapshot};
use super::transcoder::{TranscodeJob, Transcoder};
use super::{HlsError, MediaProber, Metadata, is_torrent_source};

/// Result of a seek: what the playlist handler needs to answer the client.
#[derive(Debug, Clone, PartialEq)]
pub struct SeekOutcome {
    /// Probed container duration
    pub duration: f64,
    /// Start time of the slice now serving the seek target
    pub slice_start: f64,
    /// Manifest of that slice
    pub manifest_path: PathBuf,
}

/// Per-session state machine over transcoder runs.
///
/// All state transitions happen under one mutex that is never held across
/// awaits; long operations (probing, manifest readiness) run on snapshots
/// taken under the lock, and callers re-validate afterwards.
#[derive(Clone)]
pub struct SliceController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: HlsConfig,
    sessions: Mutex<HashMap<String, TranscodeSession>>,
    prober: Arc<dyn MediaProber>,
    transcoder: Arc<dyn Transcoder>,
    process_control: Arc<dyn ProcessControl>,
    /// Reference point for duty-cycle phase computation
    epoch: Instant,
    /// Child launch generations, for stale-exit detection
    generation: AtomicU64,
}

impl SliceController {
    /// Create a controller with injected subprocess and signalling seams.
    pub fn new(
        config: HlsConfig,
        prober: Arc<dyn MediaProber>,
        transcoder: Arc<dyn Transcoder>,
        process_control: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                config,
                sessions: Mutex::new(HashMap::new()),
                prober,
                transcoder,
                process_control,
                epoch: Instant::now(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Create a controller with the production ffprobe/ffmpeg/signal stack.
    pub fn with_defaults(config: HlsConfig) -> Self {
        Self::new(
            config,
            Arc::new(super::FfprobeProber::new()),
            Arc::new(super::FfmpegTranscoder::new()),
            Arc::new(super::PlatformProcessControl::new()),
        )
    }

    /// Ensure the session exists and has a running (or finished) transcoder.
    ///
    /// Idempotent: an already-running or finished session returns its
    /// current manifest without touching the transcoder.
    ///
    /// # Errors
    ///
    /// Probe, launch, and manifest-readiness failures bubble up.
    pub async fn ensure_session(
        &self,
        id: &str,
        source: &str,
        start_time: f64,
    ) -> Result<(f64, PathBuf), HlsError> {
        self.inner
            .ensure_record(id, source, start_time, "")
            .await?;

        let (duration, manifest) = {
            let mut sessions = self.inner.lock_sessions();
            let sess = sessions
                .get_mut(id)
                .ok_or_else(|| HlsError::SessionNotFound { id: id.to_string() })?;

            if sess.child.is_some() || sess.finished {
                return Ok((sess.duration_hint, sess.current_manifest_path()));
            }

            let slice_dir = sess.current_slice_dir();
            std::fs::create_dir_all(&slice_dir)?;
            let start = sess.current_slice_start();
            self.inner.ensure_cmd_locked(sess, start, slice_dir, false)?;
            (sess.duration_hint, sess.current_manifest_path())
        };

        let timeout = if is_torrent_source(source) {
            self.inner.config.torrent_manifest_timeout
        } else {
            self.inner.config.manifest_timeout
        };
        wait_for_manifest_ready(&manifest, timeout).await?;

        Ok((duration, manifest))
    }

    /// Seek the session to `target` seconds.
    ///
    /// Replays of the same non-empty `seek_id` return the current slice
    /// unchanged, so clients can retry network failures safely. Otherwise
    /// the target is clamped to the probed duration, existing slices are
    /// scanned for reuse (skipped when `force_slice`), and a miss launches
    /// a fresh slice rooted at the target.
    ///
    /// # Errors
    ///
    /// Probe, launch, and manifest-readiness failures bubble up.
    pub async fn seek(
        &self,
        id: &str,
        source: &str,
        target: f64,
        seek_id: &str,
        force_slice: bool,
    ) -> Result<SeekOutcome, HlsError> {
        let created = self
            .inner
            .ensure_record(id, source, target, seek_id)
            .await?;

        let (outcome, wait_manifest) = {
            let mut sessions = self.inner.lock_sessions();
            let sess = sessions
                .get_mut(id)
                .ok_or_else(|| HlsError::SessionNotFound { id: id.to_string() })?;

            if created && sess.child.is_none() && !sess.finished {
                // Fresh record created by this seek: launch slice 0 at the
                // target instead of going through the reuse scan.
                let slice_dir = sess.current_slice_dir();
                std::fs::create_dir_all(&slice_dir)?;
                let start = sess.current_slice_start();
                self.inner.ensure_cmd_locked(sess, start, slice_dir, false)?;
                (
                    SeekOutcome {
                        duration: sess.duration_hint,
                        slice_start: start,
                        manifest_path: sess.current_manifest_path(),
                    },
                    true,
                )
            } else if !seek_id.is_empty() && sess.last_seek_id == seek_id {
                tracing::debug!(id, seek_id, "seek replay, reusing current slice");
                (
                    SeekOutcome {
                        duration: sess.duration_hint,
                        slice_start: sess.current_slice_start(),
                        manifest_path: sess.current_manifest_path(),
                    },
                    false,
                )
            } else {
                let mut target = target.max(0.0);
                if sess.duration_hint > 0.0 && target > sess.duration_hint {
                    target = sess.duration_hint;
                }

                match self.inner.try_reuse_slice(sess, target, seek_id, force_slice) {
                    Some(outcome) => (outcome, false),
                    None => {
                        sess.finished = false;
                        sess.last_seek_id = seek_id.to_string();
                        // Indices stay dense and are never reused, even when
                        // a reuse hit moved slice_index back to an old slice.
                        sess.slice_index = sess.slices.last().map(|s| s.index + 1).unwrap_or(0);
                        sess.slices.push(SliceInfo {
                            index: sess.slice_index,
                            start_time: target,
                        });
                        let slice_dir = sess.current_slice_dir();
                        std::fs::create_dir_all(&slice_dir)?;
                        self.inner
                            .ensure_cmd_locked(sess, target, slice_dir, false)?;
                        (
                            SeekOutcome {
                                duration: sess.duration_hint,
                                slice_start: target,
                                manifest_path: sess.current_manifest_path(),
                            },
                            true,
                        )
                    }
                }
            }
        };

        if wait_manifest {
            let timeout = if is_torrent_source(source) {
                self.inner.config.torrent_manifest_timeout
            } else {
                self.inner.config.manifest_timeout
            };
            wait_for_manifest_ready(&outcome.manifest_path, timeout).await?;
        }

        tracing::debug!(
            id,
            target,
            slice_start = outcome.slice_start,
            "seek resolved"
        );
        Ok(outcome)
    }

    /// Switch the selected audio track.
    ///
    /// Kills the live transcoder so the next asset request relaunches with
    /// the new mapping. No-op when the track is already selected.
    ///
    /// # Errors
    ///
    /// [`HlsError::SessionNotFound`] for unknown sessions.
    pub fn set_audio_track(&self, id: &str, index: usize) -> Result<(), HlsError> {
        let mut sessions = self.inner.lock_sessions();
        let sess = sessions
            .get_mut(id)
            .ok_or_else(|| HlsError::SessionNotFound { id: id.to_string() })?;

        if sess.audio_index == index {
            return Ok(());
        }

        sess.audio_index = index;
        for st in &sess.available_streams {
            if st.index == index {
                sess.audio_codec = st.codec.clone();
                break;
            }
        }

        if let Some(child) = sess.child.take() {
            child.cancel.cancel();
        }
        sess.paused = false;
        sess.paused_by_cap = false;

        tracing::info!(id, index, codec = %sess.audio_codec, "audio track switched");
        Ok(())
    }

    /// Record that a segment was delivered to a client.
    ///
    /// Raises the served watermark monotonically and re-evaluates the
    /// throttle immediately.
    pub fn mark_segment_served(&self, id: &str, filename: &str) {
        let Some(seq) = super::playlist::parse_segment_sequence(filename) else {
            return;
        };

        let mut sessions = self.inner.lock_sessions();
        let Some(sess) = sessions.get_mut(id) else {
            return;
        };
        if seq as i64 > sess.last_served_seq {
            sess.last_served_seq = seq as i64;
        }
        self.inner.adjust_throttle_locked(sess);
    }

    /// Record that a client actively requested an asset.
    ///
    /// Opens the demand-grace window and lifts a cap-pause immediately so an
    /// actively pulling client is never starved by the throttle.
    pub fn notify_client_asset_request(&self, id: &str) {
        let mut sessions = self.inner.lock_sessions();
        let Some(sess) = sessions.get_mut(id) else {
            return;
        };
        sess.demand_resume_until = Some(Instant::now() + self.inner.config.demand_grace);
        if sess.paused && sess.paused_by_cap {
            self.inner.resume_locked(sess, false);
        }
    }

    /// Stop the session: cancel the child, remove the work directory, and
    /// forget the record.
    pub fn stop_session(&self, id: &str) {
        let work_dir = {
            let mut sessions = self.inner.lock_sessions();
            match sessions.remove(id) {
                Some(mut sess) => {
                    if let Some(child) = sess.child.take() {
                        child.cancel.cancel();
                    }
                    Some(sess.work_dir)
                }
                None => None,
            }
        };

        if let Some(dir) = work_dir {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(id, dir = %dir.display(), "failed to remove work dir: {e}");
                }
            }
        }
    }

    /// Start time of the session's active slice, 0.0 for unknown sessions.
    pub fn slice_start(&self, id: &str) -> f64 {
        let sessions = self.inner.lock_sessions();
        sessions
            .get(id)
            .map(|s| s.current_slice_start())
            .unwrap_or(0.0)
    }

    /// Directory of the session's active slice.
    pub fn current_slice_dir(&self, id: &str) -> Option<PathBuf> {
        let sessions = self.inner.lock_sessions();
        sessions.get(id).map(|s| s.current_slice_dir())
    }

    /// Selected audio index and discovered streams for a session.
    pub fn describe(&self, id: &str) -> Option<(usize, Vec<StreamInfo>)> {
        let sessions = self.inner.lock_sessions();
        sessions
            .get(id)
            .map(|s| (s.audio_index, s.available_streams.clone()))
    }

    /// IDs of all sessions the controller currently tracks.
    pub fn session_ids(&self) -> Vec<String> {
        let sessions = self.inner.lock_sessions();
        sessions.keys().cloned().collect()
    }

    /// Run a metadata probe on behalf of the HTTP layer.
    ///
    /// # Errors
    ///
    /// [`HlsError::ProbeFailed`] as from the prober.
    pub async fn probe_metadata(
        &self,
        source: &str,
        timeout: Duration,
    ) -> Result<Metadata, HlsError> {
        self.inner.prober.probe(source, timeout).await
    }
}

impl ControllerInner {
    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, TranscodeSession>> {
        self.sessions.lock().expect("controller lock poisoned")
    }

    /// Probe and insert the session record if it does not exist yet.
    ///
    /// The probe runs without the lock; on return the record is re-checked
    /// so concurrent creators collapse to one insert. Returns whether this
    /// call created the record.
    async fn ensure_record(
        self: &Arc<Self>,
        id: &str,
        source: &str,
        start_time: f64,
        seek_id: &str,
    ) -> Result<bool, HlsError> {
        {
            let sessions = self.lock_sessions();
            if sessions.contains_key(id) {
                return Ok(false);
            }
        }

        let base_dir = temp_dir_for_session(id);
        std::fs::create_dir_all(&base_dir)?;

        let probe_timeout = if is_torrent_source(source) {
            self.config.torrent_probe_timeout
        } else {
            self.config.probe_timeout
        };
        let meta = self.prober.probe(source, probe_timeout).await?;
        let duration = meta.duration_seconds();
        let video = meta.video_decision();
        let (streams, audio_index, audio_codec) = select_audio(&meta);

        let mut sessions = self.lock_sessions();
        if sessions.contains_key(id) {
            // Lost the creation race; the winner's record stands.
            return Ok(false);
        }
        sessions.insert(
            id.to_string(),
            TranscodeSession {
                id: id.to_string(),
                source: source.to_string(),
                work_dir: base_dir,
                duration_hint: duration,
                video,
                audio_index,
                audio_codec,
                available_streams: streams,
                slice_index: 0,
                slices: vec![SliceInfo {
                    index: 0,
                    start_time,
                }],
                last_seek_id: seek_id.to_string(),
                currently_at: start_time,
                child: None,
                finished: false,
                paused: false,
                paused_by_cap: false,
                last_served_seq: -1,
                demand_resume_until: None,
            },
        );
        Ok(true)
    }

    /// Scan existing slices for one whose playlist already covers `target`.
    ///
    /// A slice with start `S` and `n` produced segments covers
    /// `[S, S + n·segdur − safety_margin)`; the safety margin keeps seeks
    /// out of the segment still being written. Reuse is additionally capped
    /// at `max_buffer_ahead` from the slice start so the client never gets a
    /// TIME-OFFSET far from the live edge.
    fn try_reuse_slice(
        self: &Arc<Self>,
        sess: &mut TranscodeSession,
        target: f64,
        seek_id: &str,
        force_slice: bool,
    ) -> Option<SeekOutcome> {
        if force_slice {
            return None;
        }

        let seg_dur = self.config.segment_duration.as_secs_f64();
        let max_reuse_window = self.config.max_buffer_ahead.as_secs_f64();

        for slice in sess.slices.clone() {
            let slice_dir = sess.slice_dir(slice.index);
            let manifest = slice_dir.join("child.m3u8");
            let Ok((media_seq, seg_count)) = read_playlist_state(&manifest) else {
                continue;
            };
            if seg_count == 0 {
                continue;
            }

            let end_time = slice.start_time + seg_count as f64 * seg_dur;
            if target < slice.start_time
                || target >= end_time - self.config.slice_reuse_safety_margin
            {
                continue;
            }
            if target - slice.start_time > max_reuse_window {
                // A reuse this deep would hand the client a TIME-OFFSET far
                // from the last produced segment and stall startup on some
                // players.
                continue;
            }

            tracing::debug!(
                id = %sess.id,
                slice = slice.index,
                slice_start = slice.start_time,
                target,
                "seek reusing existing slice"
            );
            sess.slice_index = slice.index;
            sess.last_seek_id = seek_id.to_string();
            sess.currently_at = target;

            if !sess.finished && end_time < sess.duration_hint {
                let resume_time = slice.start_time + (media_seq + seg_count) as f64 * seg_dur;
                if let Err(e) = self.ensure_cmd_locked(sess, resume_time, slice_dir, true) {
                    tracing::warn!(id = %sess.id, slice = slice.index, "failed to resume slice: {e}");
                }
            }

            return Some(SeekOutcome {
                duration: sess.duration_hint,
                slice_start: slice.start_time,
                manifest_path: sess.current_manifest_path(),
            });
        }
        None
    }

    /// Launch (or relaunch) the transcoder for the session's active slice.
    ///
    /// Caller holds the controller lock. Any previous child is cancelled,
    /// per-launch state is reset, and the exit watcher plus throttle ticker
    /// tasks are started without performing I/O under the lock.
    fn ensure_cmd_locked(
        self: &Arc<Self>,
        sess: &mut TranscodeSession,
        seek: f64,
        out_dir: PathBuf,
        append: bool,
    ) -> Result<(), HlsError> {
        if let Some(child) = sess.child.take() {
            child.cancel.cancel();
        }

        let job = TranscodeJob {
            source: sess.source.clone(),
            out_dir,
            start_seconds: seek,
            start_seq: sess.slice_index,
            segment_duration: self.config.segment_duration,
            video: sess.video,
            audio_index: sess.audio_index,
            audio_codec: sess.audio_codec.clone(),
            append,
        };
        let mut process = self.transcoder.spawn(&job)?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        sess.child = Some(ActiveChild {
            pid: process.pid(),
            generation,
            cancel: cancel.clone(),
        });
        sess.currently_at = seek;
        sess.paused = false;
        sess.paused_by_cap = false;
        sess.last_served_seq = -1;
        sess.finished = false;

        let id = sess.id.clone();

        let watcher_inner = Arc::clone(self);
        let watcher_cancel = cancel.clone();
        let watcher_id = id.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                _ = watcher_cancel.cancelled() => None,
                result = process.wait() => Some(result.unwrap_or(false)),
            };
            match exit {
                // Cancelled: a newer launch or a stop superseded this child.
                None => process.kill().await,
                Some(clean) => watcher_inner.on_child_exit(&watcher_id, generation, clean),
            }
        });

        let ticker_inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                if !ticker_inner.tick_throttle(&id, generation) {
                    return;
                }
            }
        });

        Ok(())
    }

    /// Apply a child exit, ignoring notifications from superseded launches.
    fn on_child_exit(&self, id: &str, generation: u64, clean: bool) {
        let mut sessions = self.lock_sessions();
        let Some(sess) = sessions.get_mut(id) else {
            return;
        };
        match &sess.child {
            Some(child) if child.generation == generation => {}
            // The session has moved on to a newer command; don't touch it.
            _ => return,
        }

        if clean {
            sess.finished = true;
        } else {
            tracing::warn!(id, "transcoder exited with error");
        }
        sess.child = None;
        sess.paused = false;
        sess.paused_by_cap = false;
    }

    /// One throttle tick. Returns false when the ticker should stop.
    fn tick_throttle(&self, id: &str, generation: u64) -> bool {
        let mut sessions = self.lock_sessions();
        let Some(sess) = sessions.get_mut(id) else {
            return false;
        };
        match &sess.child {
            Some(child) if child.generation == generation => {}
            _ => return false,
        }
        self.adjust_throttle_locked(sess);
        true
    }

    /// Shared throttle evaluation, caller holds the lock.
    fn adjust_throttle_locked(&self, sess: &mut TranscodeSession) {
        let Some(child) = &sess.child else {
            return;
        };
        if child.pid.is_none() {
            return;
        }

        let now = Instant::now();
        let in_grace = sess.in_demand_grace(now);

        let manifest = sess.current_manifest_path();
        let (media_seq, seg_count) = match read_playlist_state(&manifest) {
            Ok(state) => state,
            Err(_) => (0, 0),
        };
        if seg_count == 0 {
            if in_grace && sess.paused {
                self.resume_locked(sess, false);
            }
            return;
        }

        let highest = media_seq + seg_count - 1;
        let ahead_segments = (highest as i64 - sess.last_served_seq).max(0) as u32;
        let ahead = self.config.segment_duration * ahead_segments;

        let cycle = throttle::THROTTLE_CYCLE_WINDOW.as_nanos();
        let phase = Duration::from_nanos((self.epoch.elapsed().as_nanos() % cycle) as u64);

        let snapshot = ThrottleSnapshot {
            ahead,
            last_served_seq: sess.last_served_seq,
            http_source: super::is_http_source(&sess.source),
            in_demand_grace: in_grace,
            phase,
            paused: sess.paused,
            paused_by_cap: sess.paused_by_cap,
        };

        match throttle::decide(self.config.max_buffer_ahead, &snapshot) {
            ThrottleAction::None => {}
            ThrottleAction::Pause { by_cap } => self.pause_locked(sess, by_cap),
            ThrottleAction::Resume { only_cap_paused } => {
                self.resume_locked(sess, only_cap_paused);
            }
        }
    }

    fn pause_locked(&self, sess: &mut TranscodeSession, by_cap: bool) {
        if sess.paused {
            return;
        }
        let Some(pid) = sess.child.as_ref().and_then(|c| c.pid) else {
            return;
        };
        match self.process_control.pause(pid) {
            Ok(()) => {
                sess.paused = true;
                sess.paused_by_cap = by_cap;
            }
            Err(e) => tracing::warn!(id = %sess.id, pid, "failed to pause transcoder: {e}"),
        }
    }

    fn resume_locked(&self, sess: &mut TranscodeSession, only_cap_paused: bool) {
        if !sess.paused || (only_cap_paused && !sess.paused_by_cap) {
            return;
        }
        let Some(pid) = sess.child.as_ref().and_then(|c| c.pid) else {
            return;
        };
        match self.process_control.resume(pid) {
            Ok(()) => {
                sess.paused = false;
                sess.paused_by_cap = false;
            }
            Err(e) => tracing::warn!(id = %sess.id, pid, "failed to resume transcoder: {e}"),
        }
    }
}

/// Collect audio streams and choose the default track: the first track
/// tagged `eng`, otherwise index 0. Returns the relative-audio-index stream
/// list, the chosen index, and its codec.
fn select_audio(meta: &Metadata) -> (Vec<StreamInfo>, usize, String) {
    let mut streams = Vec::new();
    let mut audio_index = 0;
    let mut found_eng = false;
    let mut audio_count = 0;

    for st in &meta.streams {
        if st.codec_type != "audio" {
            continue;
        }
        streams.push(StreamInfo {
            index: audio_count,
            kind: "audio".to_string(),
            codec: st.codec_name.clone(),
            language: st.tags.language.clone(),
            title: st.tags.title.clone(),
        });
        if !found_eng && st.tags.language.eq_ignore_ascii_case("eng") {
            audio_index = audio_count;
            found_eng = true;
        }
        audio_count += 1;
    }

    let audio_codec = streams
        .iter()
        .find(|s| s.index == audio_index)
        .map(|s| s.codec.clone())
        .unwrap_or_else(|| "aac".to_string());

    (streams, audio_index, audio_codec)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::super::throttle::CountingProcessControl;
    use super::super::transcoder::TranscodeProcess;
    use super::*;

    struct MockProber {
        meta: Metadata,
        calls: AtomicUsize,
    }

    impl MockProber {
        fn new(json: &str) -> Self {
            Self {
                meta: serde_json::from_str(json).unwrap(),
                calls: AtomicUsize::new(0),
            }
        }

        fn standard() -> Self {
            Self::new(
                r#"{
                    "format": {"duration": "3600.000000"},
                    "streams": [
                        {"codec_name": "h264", "codec_type": "video", "profile": "Main"},
                        {"codec_name": "ac3", "codec_type": "audio",
                         "tags": {"language": "jpn", "title": "Japanese"}},
                        {"codec_name": "aac", "codec_type": "audio",
                         "tags": {"language": "eng", "title": "English"}}
                    ]
                }"#,
            )
        }
    }

    #[async_trait]
    impl MediaProber for MockProber {
        async fn probe(&self, _source: &str, _timeout: Duration) -> Result<Metadata, HlsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.meta.clone())
        }
    }

    struct MockProcess;

    #[async_trait]
    impl TranscodeProcess for MockProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        async fn wait(&mut self) -> std::io::Result<bool> {
            std::future::pending::<()>().await;
            unreachable!()
        }

        async fn kill(&mut self) {}
    }

    /// Writes a synthetic rolling playlist at spawn so readiness waits and
    /// the reuse scan see real files.
    struct MockTranscoder {
        jobs: Mutex<Vec<TranscodeJob>>,
        segments_per_launch: u64,
    }

    impl MockTranscoder {
        fn new(segments_per_launch: u64) -> Self {
            Self {
                jobs: Mutex::new(Vec::new()),
                segments_per_launch,
            }
        }

        fn jobs(&self) -> Vec<TranscodeJob> {
            self.jobs.lock().unwrap().clone()
        }
    }

    impl Transcoder for MockTranscoder {
        fn spawn(&self, job: &TranscodeJob) -> Result<Box<dyn TranscodeProcess>, HlsError> {
            if !job.append {
                let _ = std::fs::remove_dir_all(&job.out_dir);
                std::fs::create_dir_all(&job.out_dir)?;
            }
            let mut playlist = format!(
                "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-MEDIA-SEQUENCE:{}\n",
                job.start_seq
            );
            for i in 0..self.segments_per_launch {
                playlist.push_str(&format!(
                    "#EXTINF:6.000000,\nsegment{:05}.ts\n",
                    job.start_seq + i
                ));
            }
            std::fs::write(job.out_dir.join("child.m3u8"), playlist)?;
            self.jobs.lock().unwrap().push(job.clone());
            Ok(Box::new(MockProcess))
        }
    }

    struct Harness {
        controller: SliceController,
        transcoder: Arc<MockTranscoder>,
        prober: Arc<MockProber>,
        control: Arc<CountingProcessControl>,
        id: String,
    }

    impl Harness {
        fn new(segments_per_launch: u64) -> Self {
            let prober = Arc::new(MockProber::standard());
            let transcoder = Arc::new(MockTranscoder::new(segments_per_launch));
            let control = Arc::new(CountingProcessControl::default());
            let controller = SliceController::new(
                HlsConfig {
                    manifest_timeout: Duration::from_secs(2),
                    ..HlsConfig::default()
                },
                prober.clone(),
                transcoder.clone(),
                control.clone(),
            );
            // Unique per-harness ID so temp dirs never collide.
            let id = format!("t{:08x}", rand::random::<u32>());
            Self {
                controller,
                transcoder,
                prober,
                control,
                id,
            }
        }

        fn with_session<R>(&self, f: impl FnOnce(&mut TranscodeSession) -> R) -> R {
            let mut sessions = self.controller.inner.lock_sessions();
            f(sessions.get_mut(&self.id).unwrap())
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(temp_dir_for_session(&self.id));
        }
    }

    const SOURCE: &str = "http://host/video.mp4";

    #[tokio::test]
    async fn test_ensure_session_cold_start() {
        let h = Harness::new(3);
        let (duration, manifest) = h
            .controller
            .ensure_session(&h.id, SOURCE, 0.0)
            .await
            .unwrap();

        assert_eq!(duration, 3600.0);
        assert!(manifest.ends_with("slice_000/child.m3u8"));
        assert!(manifest.exists());
        assert_eq!(h.prober.calls.load(Ordering::SeqCst), 1);

        let jobs = h.transcoder.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].start_seconds, 0.0);
        assert!(!jobs[0].append);
    }

    #[tokio::test]
    async fn test_ensure_session_is_idempotent_while_running() {
        let h = Harness::new(3);
        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();
        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();

        assert_eq!(h.transcoder.jobs().len(), 1);
        assert_eq!(h.prober.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_selects_english_audio() {
        let h = Harness::new(3);
        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();

        let (audio_index, streams) = h.controller.describe(&h.id).unwrap();
        assert_eq!(audio_index, 1);
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].language, "jpn");
        assert_eq!(streams[1].language, "eng");

        h.with_session(|s| assert_eq!(s.audio_codec, "aac"));
    }

    #[tokio::test]
    async fn test_seek_into_uncached_region_creates_slice() {
        let h = Harness::new(3);
        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();

        let outcome = h
            .controller
            .seek(&h.id, SOURCE, 300.0, "s1", false)
            .await
            .unwrap();
        assert_eq!(outcome.slice_start, 300.0);
        assert!(outcome.manifest_path.ends_with("slice_001/child.m3u8"));

        h.with_session(|s| {
            assert_eq!(s.slice_index, 1);
            assert_eq!(s.slices[1].start_time, 300.0);
            assert_eq!(s.last_seek_id, "s1");
        });

        let jobs = h.transcoder.jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].start_seconds, 300.0);
        assert_eq!(jobs[1].start_seq, 1);
    }

    #[tokio::test]
    async fn test_seek_replay_with_same_id_is_idempotent() {
        let h = Harness::new(3);
        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();

        let first = h
            .controller
            .seek(&h.id, SOURCE, 300.0, "s1", false)
            .await
            .unwrap();
        let replay = h
            .controller
            .seek(&h.id, SOURCE, 300.0, "s1", false)
            .await
            .unwrap();

        assert_eq!(first, replay);
        assert_eq!(h.transcoder.jobs().len(), 2);
        h.with_session(|s| assert_eq!(s.slice_index, 1));
    }

    #[tokio::test]
    async fn test_small_seek_within_window_reuses_slice() {
        // 10 segments = 60s of coverage per launch.
        let h = Harness::new(10);
        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();
        h.controller
            .seek(&h.id, SOURCE, 300.0, "s1", false)
            .await
            .unwrap();

        let outcome = h
            .controller
            .seek(&h.id, SOURCE, 310.0, "s2", false)
            .await
            .unwrap();

        assert_eq!(outcome.slice_start, 300.0);
        h.with_session(|s| {
            assert_eq!(s.slice_index, 1);
            assert_eq!(s.currently_at, 310.0);
            assert_eq!(s.last_seek_id, "s2");
        });

        // The reuse resumed the transcoder in append mode at the playlist
        // tail: start 300 + (1 + 10) * 6 = 366 given start_number = 1.
        let jobs = h.transcoder.jobs();
        let resume = jobs.last().unwrap();
        assert!(resume.append);
        assert_eq!(resume.start_seconds, 366.0);
    }

    #[tokio::test]
    async fn test_force_slice_skips_reuse() {
        let h = Harness::new(10);
        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();
        h.controller
            .seek(&h.id, SOURCE, 300.0, "s1", false)
            .await
            .unwrap();

        let outcome = h
            .controller
            .seek(&h.id, SOURCE, 310.0, "s3", true)
            .await
            .unwrap();

        assert_eq!(outcome.slice_start, 310.0);
        h.with_session(|s| assert_eq!(s.slice_index, 2));
        assert!(h
            .controller
            .current_slice_dir(&h.id)
            .unwrap()
            .ends_with("slice_002"));
    }

    #[tokio::test]
    async fn test_seek_clamps_to_duration() {
        let h = Harness::new(3);
        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();

        let outcome = h
            .controller
            .seek(&h.id, SOURCE, 99999.0, "s1", false)
            .await
            .unwrap();
        assert_eq!(outcome.slice_start, 3600.0);

        let negative = h
            .controller
            .seek(&h.id, SOURCE, -5.0, "s2", true)
            .await
            .unwrap();
        assert_eq!(negative.slice_start, 0.0);
    }

    #[tokio::test]
    async fn test_set_audio_track_kills_child_and_relaunches_on_ensure() {
        let h = Harness::new(3);
        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();

        let old_cancel = h.with_session(|s| s.child.as_ref().unwrap().cancel.clone());
        h.controller.set_audio_track(&h.id, 0).unwrap();

        assert!(old_cancel.is_cancelled());
        h.with_session(|s| {
            assert!(s.child.is_none());
            assert_eq!(s.audio_index, 0);
            assert_eq!(s.audio_codec, "ac3");
            assert!(!s.paused);
        });

        // Next ensure relaunches with the new mapping.
        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();
        let jobs = h.transcoder.jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].audio_index, 0);
        assert_eq!(jobs[1].audio_codec, "ac3");
    }

    #[tokio::test]
    async fn test_set_audio_track_same_index_is_noop() {
        let h = Harness::new(3);
        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();

        h.controller.set_audio_track(&h.id, 1).unwrap();
        h.with_session(|s| assert!(s.child.is_some()));
    }

    #[tokio::test]
    async fn test_mark_segment_served_is_monotonic() {
        let h = Harness::new(3);
        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();

        h.controller.mark_segment_served(&h.id, "segment00004.ts");
        h.with_session(|s| assert_eq!(s.last_served_seq, 4));

        // Out-of-order delivery is absorbed.
        h.controller.mark_segment_served(&h.id, "segment00002.ts");
        h.with_session(|s| assert_eq!(s.last_served_seq, 4));

        h.controller.mark_segment_served(&h.id, "child.m3u8");
        h.with_session(|s| assert_eq!(s.last_served_seq, 4));
    }

    #[tokio::test]
    async fn test_stale_exit_does_not_clobber_newer_launch() {
        let h = Harness::new(3);
        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();
        let old_generation = h.with_session(|s| s.child.as_ref().unwrap().generation);

        // Relaunch via a forced seek; the old watcher's exit must be ignored.
        h.controller
            .seek(&h.id, SOURCE, 60.0, "s1", true)
            .await
            .unwrap();
        h.controller.inner.on_child_exit(&h.id, old_generation, true);

        h.with_session(|s| {
            assert!(s.child.is_some());
            assert!(!s.finished);
        });

        // The current generation's clean exit applies.
        let current = h.with_session(|s| s.child.as_ref().unwrap().generation);
        h.controller.inner.on_child_exit(&h.id, current, true);
        h.with_session(|s| {
            assert!(s.child.is_none());
            assert!(s.finished);
        });
    }

    #[tokio::test]
    async fn test_finished_session_returns_manifest_without_relaunch() {
        let h = Harness::new(3);
        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();
        let generation = h.with_session(|s| s.child.as_ref().unwrap().generation);
        h.controller.inner.on_child_exit(&h.id, generation, true);

        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();
        assert_eq!(h.transcoder.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_notify_client_asset_request_resumes_cap_pause() {
        let h = Harness::new(3);
        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();

        h.with_session(|s| {
            s.paused = true;
            s.paused_by_cap = true;
        });
        h.controller.notify_client_asset_request(&h.id);

        h.with_session(|s| {
            assert!(!s.paused);
            assert!(s.demand_resume_until.is_some());
        });
        assert_eq!(h.control.resumes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_session_removes_state_and_work_dir() {
        let h = Harness::new(3);
        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();
        let cancel = h.with_session(|s| s.child.as_ref().unwrap().cancel.clone());
        let work_dir = temp_dir_for_session(&h.id);
        assert!(work_dir.exists());

        h.controller.stop_session(&h.id);

        assert!(cancel.is_cancelled());
        assert!(!work_dir.exists());
        assert!(h.controller.describe(&h.id).is_none());
    }

    #[tokio::test]
    async fn test_slice_invariants_hold_across_seeks() {
        let h = Harness::new(10);
        h.controller.ensure_session(&h.id, SOURCE, 0.0).await.unwrap();
        for (target, sid) in [(300.0, "a"), (10.0, "b"), (600.0, "c"), (605.0, "d")] {
            let outcome = h
                .controller
                .seek(&h.id, SOURCE, target, sid, false)
                .await
                .unwrap();
            assert!(outcome.slice_start >= 0.0);
            assert!(outcome.slice_start <= target);
            assert!(target - outcome.slice_start <= 90.0 + 6.0);
        }

        h.with_session(|s| {
            // Dense indices, active slice always valid.
            assert!((s.slice_index as usize) < s.slices.len());
            for (i, slice) in s.slices.iter().enumerate() {
                assert_eq!(slice.index as usize, i);
            }
        });
    }
}
