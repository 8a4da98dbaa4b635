//! Production torrent client backed by a librqbit session.
//!
//! librqbit exposes file selection and stream-position-driven piece
//! scheduling rather than direct per-piece priorities, so the seam's piece
//! hints degrade gracefully: file selection maps to `update_only_files`,
//! and explicit piece prioritisation is left to the stream's own
//! around-the-read-position scheduling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use librqbit::{AddTorrent, AddTorrentOptions, AddTorrentResponse, ManagedTorrent, Session};

use super::client::{SwarmStats, TorrentClient, TorrentFileInfo, TorrentFileReader, TorrentHandle};
use super::TorrentError;

/// Torrent client wrapping a shared librqbit [`Session`].
pub struct RqbitClient {
    session: Arc<Session>,
    /// Maps hex info hashes to librqbit torrent IDs for removal.
    ids: RwLock<HashMap<String, usize>>,
}

impl RqbitClient {
    /// Start a session storing torrent data under `data_dir`.
    ///
    /// # Errors
    ///
    /// [`TorrentError::AddFailed`] when the session cannot be created.
    pub async fn new(data_dir: PathBuf) -> Result<Self, TorrentError> {
        std::fs::create_dir_all(&data_dir).map_err(|e| TorrentError::AddFailed {
            reason: format!("failed to create torrent data dir: {e}"),
        })?;
        let session = Session::new(data_dir)
            .await
            .map_err(|e| TorrentError::AddFailed {
                reason: format!("failed to create torrent session: {e}"),
            })?;
        Ok(Self {
            session,
            ids: RwLock::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl TorrentClient for RqbitClient {
    async fn add_magnet(&self, magnet: &str) -> Result<Arc<dyn TorrentHandle>, TorrentError> {
        let options = AddTorrentOptions {
            overwrite: true,
            ..Default::default()
        };
        let response = self
            .session
            .add_torrent(AddTorrent::from_url(magnet), Some(options))
            .await
            .map_err(|e| TorrentError::AddFailed {
                reason: e.to_string(),
            })?;

        let (id, handle) = match response {
            AddTorrentResponse::Added(id, handle) => (id, handle),
            AddTorrentResponse::AlreadyManaged(id, handle) => (id, handle),
            AddTorrentResponse::ListOnly(_) => {
                return Err(TorrentError::AddFailed {
                    reason: "torrent was added in list-only mode".to_string(),
                });
            }
        };

        let wrapped = RqbitHandle { handle };
        let info_hash = wrapped.info_hash();
        self.ids
            .write()
            .expect("torrent id lock poisoned")
            .insert(info_hash, id);
        Ok(Arc::new(wrapped))
    }

    async fn remove(&self, info_hash: &str) -> Result<(), TorrentError> {
        let id = {
            let ids = self.ids.read().expect("torrent id lock poisoned");
            ids.get(info_hash).copied()
        };
        let Some(id) = id else {
            return Err(TorrentError::NotFound {
                info_hash: info_hash.to_string(),
            });
        };

        self.session
            .delete(id.into(), true)
            .await
            .map_err(|e| TorrentError::AddFailed {
                reason: format!("failed to delete torrent: {e}"),
            })?;
        self.ids
            .write()
            .expect("torrent id lock poisoned")
            .remove(info_hash);
        Ok(())
    }

    async fn shutdown(&self) {
        self.session.stop().await;
    }
}

struct RqbitHandle {
    handle: Arc<ManagedTorrent>,
}

#[async_trait]
impl TorrentHandle for RqbitHandle {
    fn info_hash(&self) -> String {
        self.handle.info_hash().as_string()
    }

    async fn wait_for_metadata(&self, timeout: Duration) -> Result<(), TorrentError> {
        tokio::time::timeout(timeout, self.handle.wait_until_initialized())
            .await
            .map_err(|_| TorrentError::MetadataTimeout)?
            .map_err(|e| TorrentError::AddFailed {
                reason: format!("torrent initialization failed: {e}"),
            })
    }

    fn has_metadata(&self) -> bool {
        self.handle.with_metadata(|_| ()).is_ok()
    }

    fn files(&self) -> Vec<TorrentFileInfo> {
        self.handle
            .with_metadata(|meta| {
                meta.file_infos
                    .iter()
                    .enumerate()
                    .map(|(index, file)| TorrentFileInfo {
                        index,
                        path: file.relative_filename.to_string_lossy().into_owned(),
                        length: file.len,
                        offset: file.offset_in_torrent,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn piece_length(&self) -> u64 {
        self.handle
            .with_metadata(|meta| u64::from(meta.lengths.default_piece_length()))
            .unwrap_or(0)
    }

    fn piece_count(&self) -> usize {
        self.handle
            .with_metadata(|meta| meta.lengths.total_pieces() as usize)
            .unwrap_or(0)
    }

    fn deselect_file(&self, index: usize) {
        // File exclusion happens wholesale in download_file via
        // update_only_files; nothing to do per excluded file.
        tracing::trace!(index, "deselect_file: deferred to update_only_files");
    }

    fn download_file(&self, index: usize) {
        let only: std::collections::HashSet<usize> = [index].into_iter().collect();
        if let Err(e) = self.handle.update_only_files(&only) {
            tracing::warn!(index, "failed to restrict torrent to target file: {e}");
        }
    }

    fn prioritize_pieces(&self, pieces: std::ops::RangeInclusive<usize>) {
        // librqbit schedules pieces around active stream positions; explicit
        // head/tail boosts ride on the reader opened at those offsets.
        tracing::trace!(?pieces, "piece prioritisation delegated to stream scheduling");
    }

    fn piece_complete(&self, _piece: usize) -> bool {
        self.handle.stats().progress_bytes > 0
    }

    fn stats(&self) -> SwarmStats {
        let stats = self.handle.stats();
        let peers = stats
            .live
            .as_ref()
            .map(|live| live.snapshot.peer_stats.live as usize)
            .unwrap_or(0);
        let piece_length = self.piece_length();
        let pieces_complete = if piece_length > 0 {
            (stats.progress_bytes / piece_length) as usize
        } else {
            0
        };
        SwarmStats {
            peers,
            pieces_complete,
            bytes_read_useful: stats.progress_bytes,
        }
    }

    async fn open_reader(
        &self,
        file_index: usize,
        readahead: u64,
    ) -> Result<Box<dyn TorrentFileReader>, TorrentError> {
        // The stream drives librqbit's piece scheduling from its read
        // position; the readahead hint has no direct knob here.
        tracing::trace!(file_index, readahead, "opening torrent file stream");
        let stream = self
            .handle
            .clone()
            .stream(file_index)
            .map_err(|e| TorrentError::ReadFailed {
                reason: e.to_string(),
            })?;
        Ok(Box::new(stream))
    }
}
