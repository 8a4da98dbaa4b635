//! Raffi Core - streaming control plane
//!
//! This crate provides the building blocks of the Raffi streaming gateway:
//! the session registry, the HLS slice controller (transcoder supervision,
//! seek-aware slice reuse, demand-driven throttling), the torrent streaming
//! adapter, and configuration management.

#![warn(missing_docs)]
#![warn(clippy::too_many_lines)]

pub mod config;
pub mod hls;
pub mod reaper;
pub mod session;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::RaffiConfig;
pub use hls::{HlsError, SliceController};
pub use session::{Session, SessionError, SessionKind, SessionStore};
pub use torrent::{TorrentError, TorrentStatus, TorrentStreamer};
pub use tracing_setup::{CliLogLevel, init_tracing};

/// Core errors that can bubble up from any Raffi subsystem.
#[derive(Debug, thiserror::Error)]
pub enum RaffiError {
    /// Session registry errors (validation, missing sessions)
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// HLS pipeline errors (probing, transcoding, playlist readiness)
    #[error("Streaming error: {0}")]
    Hls(#[from] HlsError),

    /// Torrent adapter errors (admission, preparation, reading)
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    /// Standard I/O errors from filesystem operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RaffiError {
    /// Whether this failure is transient and worth retrying by the client.
    pub fn is_transient(&self) -> bool {
        match self {
            RaffiError::Hls(e) => e.is_transient(),
            RaffiError::Torrent(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Convenience Result type using RaffiError as the error type
pub type Result<T> = std::result::Result<T, RaffiError>;
