//! Centralized configuration for Raffi.
//!
//! All tunable parameters live here to avoid hard-coded values scattered
//! throughout the codebase. Defaults carry the shipping behaviour; a small
//! set of environment variables override them at startup.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Raffi components.
#[derive(Debug, Clone, Default)]
pub struct RaffiConfig {
    /// HLS slice controller and transcoder settings
    pub hls: HlsConfig,
    /// Torrent adapter settings
    pub torrent: TorrentConfig,
    /// Metadata probe retry settings
    pub probe: ProbeConfig,
    /// Cast token gate settings
    pub cast: CastConfig,
}

/// HLS transcoding and throttling configuration.
#[derive(Debug, Clone)]
pub struct HlsConfig {
    /// Target duration of a single segment
    pub segment_duration: Duration,
    /// Ceiling on produced-but-unserved playlist ahead of the play head
    pub max_buffer_ahead: Duration,
    /// Seconds shaved off a slice's coverage window so seeks never land
    /// inside a segment still being written
    pub slice_reuse_safety_margin: f64,
    /// Manifest readiness wait for plain HTTP / local sources
    pub manifest_timeout: Duration,
    /// Manifest readiness wait for torrent-backed sources
    pub torrent_manifest_timeout: Duration,
    /// Probe budget applied when ensuring a plain HTTP / local session
    pub probe_timeout: Duration,
    /// Probe budget applied when ensuring a torrent-backed session
    pub torrent_probe_timeout: Duration,
    /// How long a client asset request suppresses cap-pausing
    pub demand_grace: Duration,
    /// How long segment requests wait for the file to appear on disk
    pub segment_wait_timeout: Duration,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            segment_duration: Duration::from_secs(6),
            max_buffer_ahead: Duration::from_secs(90),
            slice_reuse_safety_margin: 5.0,
            manifest_timeout: Duration::from_secs(10),
            torrent_manifest_timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(30),
            torrent_probe_timeout: Duration::from_secs(10),
            demand_grace: Duration::from_secs(4),
            segment_wait_timeout: Duration::from_secs(20),
        }
    }
}

/// Torrent adapter configuration.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Directory holding downloaded torrent data
    pub data_dir: PathBuf,
    /// Budget for the swarm to deliver torrent metadata
    pub metadata_timeout: Duration,
    /// Best-effort wait for the first prioritised piece
    pub first_piece_timeout: Duration,
    /// Bytes at the head of the target file raised to top priority
    pub head_priority_bytes: u64,
    /// Bytes at the tail raised to top priority (container index boxes)
    pub tail_priority_bytes: u64,
    /// Only files at least this large get the tail prioritisation
    pub tail_priority_min_file_size: u64,
    /// Read-ahead for ordinary playback reads
    pub readahead_bytes: u64,
    /// Read-ahead while the prober is scanning trailer boxes
    pub metadata_readahead_bytes: u64,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            data_dir: std::env::temp_dir().join("raffi-torrents"),
            metadata_timeout: Duration::from_secs(20),
            first_piece_timeout: Duration::from_secs(15),
            head_priority_bytes: 10 * 1024 * 1024,
            tail_priority_bytes: 64 * 1024 * 1024,
            tail_priority_min_file_size: 64 * 1024 * 1024,
            readahead_bytes: 16 * 1024 * 1024,
            metadata_readahead_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Retry policy for metadata probes triggered by `GET /sessions/{id}`.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Attempts for plain HTTP / local sources
    pub max_attempts: usize,
    /// Per-attempt timeout for plain HTTP / local sources
    pub attempt_timeout: Duration,
    /// Attempts for torrent-backed sources
    pub torrent_max_attempts: usize,
    /// Per-attempt timeout for torrent-backed sources
    pub torrent_attempt_timeout: Duration,
    /// Cooldown after a failed torrent probe before the next try
    pub torrent_failure_cooldown: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(12),
            torrent_max_attempts: 2,
            torrent_attempt_timeout: Duration::from_secs(30),
            torrent_failure_cooldown: Duration::from_secs(20),
        }
    }
}

/// Cast token issuance policy.
#[derive(Debug, Clone)]
pub struct CastConfig {
    /// TTL applied when the request does not supply one
    pub default_ttl: Duration,
    /// Lower clamp on requested TTLs
    pub min_ttl: Duration,
    /// Upper clamp on requested TTLs
    pub max_ttl: Duration,
    /// Interval of the expired-token sweep
    pub sweep_interval: Duration,
}

impl Default for CastConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(15 * 60),
            min_ttl: Duration::from_secs(30),
            max_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl RaffiConfig {
    /// Creates configuration with environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("RAFFI_TORRENT_DATA_DIR") {
            if !dir.trim().is_empty() {
                config.torrent.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(timeout) = std::env::var("RAFFI_METADATA_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.torrent.metadata_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(timeout) = std::env::var("RAFFI_SEGMENT_WAIT_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.hls.segment_wait_timeout = Duration::from_secs(seconds);
            }
        }

        config
    }
}

/// Returns the temp directory that holds per-session HLS work directories.
pub fn sessions_temp_dir() -> PathBuf {
    std::env::temp_dir().join("raffi")
}

/// Returns the work directory for a single session.
pub fn temp_dir_for_session(id: &str) -> PathBuf {
    sessions_temp_dir().join(id)
}
