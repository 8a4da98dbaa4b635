//! Seam between the adapter and the wrapped BitTorrent client.
//!
//! The adapter's policy (file selection, head/tail prioritisation, status
//! reporting) is written against these traits; production wraps a real
//! swarm client, tests substitute an in-memory mock.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek};

use super::TorrentError;

/// One file inside a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFileInfo {
    /// Index within the torrent's file list
    pub index: usize,
    /// Relative path inside the torrent
    pub path: String,
    /// File length in bytes
    pub length: u64,
    /// Byte offset of the file within the torrent's piece space
    pub offset: u64,
}

/// Swarm-level counters surfaced through the status endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwarmStats {
    /// Connected peers
    pub peers: usize,
    /// Completed pieces across the torrent
    pub pieces_complete: usize,
    /// Payload bytes received from the swarm
    pub bytes_read_useful: u64,
}

/// Seekable reader over a torrent file.
///
/// Readers are responsive: they prefer returning short reads over blocking
/// the connection while the swarm fetches distant pieces.
pub trait TorrentFileReader: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> TorrentFileReader for T {}

/// One admitted torrent inside the wrapped client.
#[async_trait]
pub trait TorrentHandle: Send + Sync {
    /// Hex info hash of the torrent.
    fn info_hash(&self) -> String;

    /// Wait for the swarm to deliver torrent metadata.
    ///
    /// # Errors
    ///
    /// [`TorrentError::MetadataTimeout`] when the budget runs out.
    async fn wait_for_metadata(&self, timeout: Duration) -> Result<(), TorrentError>;

    /// Whether metadata has arrived.
    fn has_metadata(&self) -> bool;

    /// Files in the torrent; empty before metadata arrives.
    fn files(&self) -> Vec<TorrentFileInfo>;

    /// Piece length in bytes; 0 before metadata arrives.
    fn piece_length(&self) -> u64;

    /// Total pieces; 0 before metadata arrives.
    fn piece_count(&self) -> usize;

    /// Exclude a file from downloading.
    fn deselect_file(&self, index: usize);

    /// Download a file at normal priority.
    fn download_file(&self, index: usize);

    /// Raise the given pieces to top priority.
    fn prioritize_pieces(&self, pieces: RangeInclusive<usize>);

    /// Whether a piece has been downloaded and verified.
    fn piece_complete(&self, piece: usize) -> bool;

    /// Current swarm counters.
    fn stats(&self) -> SwarmStats;

    /// Open a seekable responsive reader over a file.
    ///
    /// `readahead` is a hint in bytes; larger values accommodate a prober
    /// scanning trailer boxes without stalling.
    ///
    /// # Errors
    ///
    /// [`TorrentError::ReadFailed`] when the reader cannot be created.
    async fn open_reader(
        &self,
        file_index: usize,
        readahead: u64,
    ) -> Result<Box<dyn TorrentFileReader>, TorrentError>;
}

/// The wrapped BitTorrent client.
#[async_trait]
pub trait TorrentClient: Send + Sync {
    /// Add a torrent from a magnet URI and return its handle immediately;
    /// metadata resolution continues in the background.
    ///
    /// # Errors
    ///
    /// [`TorrentError::AddFailed`] when the client rejects the URI.
    async fn add_magnet(&self, magnet: &str) -> Result<Arc<dyn TorrentHandle>, TorrentError>;

    /// Drop a torrent and release its swarm resources.
    ///
    /// # Errors
    ///
    /// [`TorrentError::NotFound`] for hashes the client does not track.
    async fn remove(&self, info_hash: &str) -> Result<(), TorrentError>;

    /// Shut the client down, closing all swarm connections.
    async fn shutdown(&self);
}
