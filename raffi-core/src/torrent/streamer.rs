//! The torrent adapter: admission, once-latched preparation with
//! seek-friendly piece prioritisation, and reader handout.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::TorrentConfig;

use super::client::{TorrentClient, TorrentFileReader, TorrentHandle};
use super::{TorrentError, TorrentStage, TorrentStatus};

/// The file chosen to stream out of a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFile {
    /// Index within the torrent's file list
    pub index: usize,
    /// Base name used for content-type inference
    pub name: String,
    /// File length in bytes
    pub length: u64,
}

/// One admitted torrent and its preparation latch.
pub struct TorrentStream {
    handle: Arc<dyn TorrentHandle>,
    file_index_override: Option<usize>,
    ready: OnceCell<Result<TargetFile, TorrentError>>,
    stopped: CancellationToken,
    config: TorrentConfig,
}

impl TorrentStream {
    fn new(
        handle: Arc<dyn TorrentHandle>,
        file_index_override: Option<usize>,
        config: TorrentConfig,
    ) -> Self {
        Self {
            handle,
            file_index_override,
            ready: OnceCell::new(),
            stopped: CancellationToken::new(),
            config,
        }
    }

    /// Run preparation exactly once; later callers observe the cached
    /// outcome, including a cached terminal error.
    pub async fn ensure_ready(&self) -> Result<TargetFile, TorrentError> {
        self.ready
            .get_or_init(|| async { self.prepare().await })
            .await
            .clone()
    }

    async fn prepare(&self) -> Result<TargetFile, TorrentError> {
        let hash = self.handle.info_hash();
        tracing::info!(%hash, "waiting for torrent metadata");
        self.handle
            .wait_for_metadata(self.config.metadata_timeout)
            .await?;

        let files = self.handle.files();
        if files.is_empty() {
            return Err(TorrentError::NoFile);
        }
        for f in &files {
            tracing::debug!(%hash, index = f.index, path = %f.path, length = f.length, "torrent file");
        }

        let target = match self.file_index_override {
            Some(idx) if idx < files.len() => files[idx].clone(),
            _ => files
                .iter()
                .max_by_key(|f| f.length)
                .cloned()
                .ok_or(TorrentError::NoFile)?,
        };
        tracing::info!(%hash, path = %target.path, length = target.length, "selected target file");

        // Only the target should reach disk; the rest of the torrent stays
        // unfetched.
        for f in &files {
            if f.index != target.index {
                self.handle.deselect_file(f.index);
            }
        }
        self.handle.download_file(target.index);

        let piece_length = self.handle.piece_length();
        let piece_count = self.handle.piece_count();
        let (head, tail) = priority_piece_ranges(
            target.offset,
            target.length,
            piece_length,
            piece_count,
            self.config.head_priority_bytes,
            self.config.tail_priority_bytes,
            self.config.tail_priority_min_file_size,
        )?;

        let start_piece = *head.start();
        self.handle.prioritize_pieces(head);
        if let Some(tail) = tail {
            tracing::debug!(%hash, range = ?tail, "prioritized tail pieces for container metadata");
            self.handle.prioritize_pieces(tail);
        }

        self.spawn_stats_logger(&hash);

        // Best-effort wait for the first piece; playback can start catching
        // up even when the swarm is slow.
        let deadline = tokio::time::Instant::now() + self.config.first_piece_timeout;
        loop {
            if self.handle.piece_complete(start_piece) {
                tracing::info!(%hash, "first piece ready, streaming can start");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(%hash, "timeout waiting for first piece, proceeding anyway");
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let name = std::path::Path::new(&target.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| target.path.clone());
        Ok(TargetFile {
            index: target.index,
            name,
            length: target.length,
        })
    }

    fn spawn_stats_logger(&self, hash: &str) {
        let handle = Arc::clone(&self.handle);
        let stopped = self.stopped.clone();
        let hash = hash.to_string();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let stats = handle.stats();
                tracing::debug!(
                    %hash,
                    peers = stats.peers,
                    pieces = format_args!("{}/{}", stats.pieces_complete, handle.piece_count()),
                    down_useful = stats.bytes_read_useful,
                    "torrent progress"
                );
            }
        });
    }

    /// Current status for the status endpoint.
    pub fn status(&self) -> TorrentStatus {
        let mut status = TorrentStatus {
            stage: TorrentStage::Metadata,
            ready: false,
            error: String::new(),
            peers: 0,
            pieces_complete: 0,
            pieces_total: 0,
            progress: 0.0,
            down_useful_bytes: 0,
        };

        match self.ready.get() {
            Some(Err(e)) => {
                status.stage = TorrentStage::Error;
                status.error = e.to_string();
                return status;
            }
            Some(Ok(_)) => {
                status.stage = TorrentStage::Ready;
                status.ready = true;
            }
            None => {
                status.stage = if self.handle.has_metadata() {
                    TorrentStage::Downloading
                } else {
                    TorrentStage::Metadata
                };
            }
        }

        let stats = self.handle.stats();
        status.peers = stats.peers;
        status.pieces_complete = stats.pieces_complete;
        status.pieces_total = self.handle.piece_count();
        if status.pieces_total > 0 {
            status.progress = status.pieces_complete as f64 / status.pieces_total as f64;
        }
        status.down_useful_bytes = stats.bytes_read_useful;
        status
    }
}

/// Compute the piece ranges to raise to top priority.
///
/// The head range covers the first `head_bytes` of the file; the tail range
/// covers the final `tail_bytes` but only for files at least
/// `tail_min_file_size` long. Together they bias the swarm toward the
/// container's moov box and first frames so probing and seeking stay
/// responsive.
///
/// # Errors
///
/// [`TorrentError::NoFile`] when the piece geometry is degenerate or the
/// file lies outside the torrent's piece space.
#[allow(clippy::too_many_arguments)]
pub fn priority_piece_ranges(
    file_offset: u64,
    file_length: u64,
    piece_length: u64,
    piece_count: usize,
    head_bytes: u64,
    tail_bytes: u64,
    tail_min_file_size: u64,
) -> Result<(RangeInclusive<usize>, Option<RangeInclusive<usize>>), TorrentError> {
    if piece_length == 0 || piece_count == 0 {
        return Err(TorrentError::NoFile);
    }

    let start_piece = (file_offset / piece_length) as usize;
    if start_piece >= piece_count {
        return Err(TorrentError::NoFile);
    }
    let head_end = (((file_offset + head_bytes) / piece_length) as usize).min(piece_count - 1);
    let head = start_piece..=head_end;

    if file_length == 0 || file_length < tail_min_file_size {
        return Ok((head, None));
    }

    let tail_bytes = tail_bytes.min(file_length);
    let tail_offset = file_offset + file_length - tail_bytes;
    let tail_start = (tail_offset / piece_length) as usize;
    let tail_end = (((file_offset + file_length - 1) / piece_length) as usize).min(piece_count - 1);
    Ok((head, Some(tail_start..=tail_end)))
}

/// Registry of admitted torrents, keyed by hex info hash.
pub struct TorrentStreamer {
    client: Arc<dyn TorrentClient>,
    config: TorrentConfig,
    base_url: String,
    streams: RwLock<HashMap<String, Arc<TorrentStream>>>,
}

impl TorrentStreamer {
    /// Create the adapter over a client.
    ///
    /// `base_url` is the server's own origin (e.g. `http://127.0.0.1:6969`),
    /// used to mint internal source URLs for the transcoder.
    pub fn new(client: Arc<dyn TorrentClient>, config: TorrentConfig, base_url: String) -> Self {
        Self {
            client,
            config,
            base_url: base_url.trim_end_matches('/').to_string(),
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Admit a magnet URI or bare info hash.
    ///
    /// Returns `(internal_url, info_hash)` immediately; metadata and file
    /// selection continue in the background so session creation never
    /// blocks on the swarm.
    ///
    /// # Errors
    ///
    /// [`TorrentError::AddFailed`] when the client rejects the URI.
    pub async fn add(
        &self,
        magnet_or_info_hash: &str,
        file_idx: Option<usize>,
    ) -> Result<(String, String), TorrentError> {
        let magnet = if magnet_or_info_hash.starts_with("magnet:") {
            magnet_or_info_hash.to_string()
        } else {
            format!("magnet:?xt=urn:btih:{magnet_or_info_hash}")
        };

        let handle = self.client.add_magnet(&magnet).await?;
        let info_hash = handle.info_hash();

        let stream = Arc::new(TorrentStream::new(handle, file_idx, self.config.clone()));
        {
            let mut streams = self.streams.write().expect("torrent lock poisoned");
            streams.insert(info_hash.clone(), Arc::clone(&stream));
        }

        // Kick off metadata + file selection in the background.
        let bg_hash = info_hash.clone();
        tokio::spawn(async move {
            if let Err(e) = stream.ensure_ready().await {
                tracing::warn!(hash = %bg_hash, "torrent prepare failed: {e}");
            }
        });

        Ok((
            format!("{}/torrents/{}", self.base_url, info_hash),
            info_hash,
        ))
    }

    fn stream(&self, info_hash: &str) -> Option<Arc<TorrentStream>> {
        let streams = self.streams.read().expect("torrent lock poisoned");
        streams.get(info_hash).cloned()
    }

    /// Status of an admitted torrent, `None` for unknown hashes.
    pub fn status(&self, info_hash: &str) -> Option<TorrentStatus> {
        self.stream(info_hash).map(|s| s.status())
    }

    /// Open a seekable reader over the torrent's target file.
    ///
    /// Blocks on preparation; `metadata` widens the read-ahead for prober
    /// trailer scans.
    ///
    /// # Errors
    ///
    /// [`TorrentError::NotFound`] for unknown hashes, plus any cached
    /// preparation error.
    pub async fn open_reader(
        &self,
        info_hash: &str,
        metadata: bool,
    ) -> Result<(Box<dyn TorrentFileReader>, TargetFile), TorrentError> {
        let stream = self.stream(info_hash).ok_or_else(|| TorrentError::NotFound {
            info_hash: info_hash.to_string(),
        })?;

        let target = stream.ensure_ready().await?;
        let readahead = if metadata {
            self.config.metadata_readahead_bytes
        } else {
            self.config.readahead_bytes
        };
        let reader = stream.handle.open_reader(target.index, readahead).await?;
        Ok((reader, target))
    }

    /// Drop a torrent from the registry and release swarm resources.
    pub async fn remove(&self, info_hash: &str) {
        let stream = {
            let mut streams = self.streams.write().expect("torrent lock poisoned");
            streams.remove(info_hash)
        };

        if let Some(stream) = stream {
            tracing::info!(hash = %info_hash, "dropping torrent");
            stream.stopped.cancel();
            if let Err(e) = self.client.remove(info_hash).await {
                tracing::warn!(hash = %info_hash, "failed to drop torrent: {e}");
            }
        }
    }

    /// Shut the wrapped client down.
    pub async fn shutdown(&self) {
        self.client.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::super::client::{SwarmStats, TorrentFileInfo};
    use super::*;

    const MIB: u64 = 1024 * 1024;

    struct MockHandle {
        info_hash: String,
        files: Vec<TorrentFileInfo>,
        piece_length: u64,
        piece_count: usize,
        metadata_available: AtomicBool,
        metadata_waits: AtomicUsize,
        deselected: Mutex<Vec<usize>>,
        downloaded: Mutex<Vec<usize>>,
        prioritized: Mutex<Vec<RangeInclusive<usize>>>,
    }

    impl MockHandle {
        fn new(files: Vec<TorrentFileInfo>, piece_length: u64, piece_count: usize) -> Self {
            Self {
                info_hash: "aabbccddeeff00112233445566778899aabbccdd".to_string(),
                files,
                piece_length,
                piece_count,
                metadata_available: AtomicBool::new(true),
                metadata_waits: AtomicUsize::new(0),
                deselected: Mutex::new(Vec::new()),
                downloaded: Mutex::new(Vec::new()),
                prioritized: Mutex::new(Vec::new()),
            }
        }

        fn without_metadata(self) -> Self {
            self.metadata_available.store(false, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl TorrentHandle for MockHandle {
        fn info_hash(&self) -> String {
            self.info_hash.clone()
        }

        async fn wait_for_metadata(&self, _timeout: Duration) -> Result<(), TorrentError> {
            self.metadata_waits.fetch_add(1, Ordering::SeqCst);
            if self.metadata_available.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(TorrentError::MetadataTimeout)
            }
        }

        fn has_metadata(&self) -> bool {
            self.metadata_available.load(Ordering::SeqCst)
        }

        fn files(&self) -> Vec<TorrentFileInfo> {
            self.files.clone()
        }

        fn piece_length(&self) -> u64 {
            self.piece_length
        }

        fn piece_count(&self) -> usize {
            self.piece_count
        }

        fn deselect_file(&self, index: usize) {
            self.deselected.lock().unwrap().push(index);
        }

        fn download_file(&self, index: usize) {
            self.downloaded.lock().unwrap().push(index);
        }

        fn prioritize_pieces(&self, pieces: RangeInclusive<usize>) {
            self.prioritized.lock().unwrap().push(pieces);
        }

        fn piece_complete(&self, _piece: usize) -> bool {
            true
        }

        fn stats(&self) -> SwarmStats {
            SwarmStats {
                peers: 3,
                pieces_complete: 10,
                bytes_read_useful: 42 * MIB,
            }
        }

        async fn open_reader(
            &self,
            _file_index: usize,
            _readahead: u64,
        ) -> Result<Box<dyn TorrentFileReader>, TorrentError> {
            Ok(Box::new(std::io::Cursor::new(vec![0u8; 16])))
        }
    }

    struct MockClient {
        handle: Arc<MockHandle>,
        magnets: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
    }

    impl MockClient {
        fn new(handle: Arc<MockHandle>) -> Self {
            Self {
                handle,
                magnets: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TorrentClient for MockClient {
        async fn add_magnet(&self, magnet: &str) -> Result<Arc<dyn TorrentHandle>, TorrentError> {
            self.magnets.lock().unwrap().push(magnet.to_string());
            Ok(Arc::clone(&self.handle) as Arc<dyn TorrentHandle>)
        }

        async fn remove(&self, info_hash: &str) -> Result<(), TorrentError> {
            self.removed.lock().unwrap().push(info_hash.to_string());
            Ok(())
        }

        async fn shutdown(&self) {}
    }

    fn movie_files() -> Vec<TorrentFileInfo> {
        vec![
            TorrentFileInfo {
                index: 0,
                path: "sample.mkv".into(),
                length: 20 * MIB,
                offset: 0,
            },
            TorrentFileInfo {
                index: 1,
                path: "movie/feature.mkv".into(),
                length: 800 * MIB,
                offset: 20 * MIB,
            },
            TorrentFileInfo {
                index: 2,
                path: "readme.txt".into(),
                length: 1024,
                offset: 820 * MIB,
            },
        ]
    }

    fn fast_config() -> TorrentConfig {
        TorrentConfig {
            first_piece_timeout: Duration::from_millis(50),
            metadata_timeout: Duration::from_millis(100),
            ..TorrentConfig::default()
        }
    }

    fn streamer(handle: Arc<MockHandle>) -> (TorrentStreamer, Arc<MockClient>) {
        let client = Arc::new(MockClient::new(handle));
        let streamer = TorrentStreamer::new(
            Arc::clone(&client) as Arc<dyn TorrentClient>,
            fast_config(),
            "http://127.0.0.1:6969".to_string(),
        );
        (streamer, client)
    }

    #[tokio::test]
    async fn test_add_wraps_bare_info_hash_into_magnet() {
        let handle = Arc::new(MockHandle::new(movie_files(), 4 * MIB, 256));
        let (streamer, client) = streamer(Arc::clone(&handle));

        let (url, hash) = streamer.add("aabbccdd", None).await.unwrap();
        assert_eq!(hash, handle.info_hash);
        assert_eq!(url, format!("http://127.0.0.1:6969/torrents/{hash}"));
        assert_eq!(
            client.magnets.lock().unwrap()[0],
            "magnet:?xt=urn:btih:aabbccdd"
        );
    }

    #[tokio::test]
    async fn test_add_passes_full_magnet_through() {
        let handle = Arc::new(MockHandle::new(movie_files(), 4 * MIB, 256));
        let (streamer, client) = streamer(handle);

        let magnet = "magnet:?xt=urn:btih:aabbccdd&dn=movie";
        streamer.add(magnet, None).await.unwrap();
        assert_eq!(client.magnets.lock().unwrap()[0], magnet);
    }

    #[tokio::test]
    async fn test_prepare_selects_largest_file_and_isolates_it() {
        let handle = Arc::new(MockHandle::new(movie_files(), 4 * MIB, 256));
        let (streamer, _client) = streamer(Arc::clone(&handle));

        let (_, hash) = streamer.add("aabbccdd", None).await.unwrap();
        let stream = streamer.stream(&hash).unwrap();
        let target = stream.ensure_ready().await.unwrap();

        assert_eq!(target.index, 1);
        assert_eq!(target.name, "feature.mkv");
        assert_eq!(target.length, 800 * MIB);

        let mut deselected = handle.deselected.lock().unwrap().clone();
        deselected.sort_unstable();
        assert_eq!(deselected, vec![0, 2]);
        assert_eq!(handle.downloaded.lock().unwrap().clone(), vec![1]);
    }

    #[tokio::test]
    async fn test_prepare_honours_file_index_override() {
        let handle = Arc::new(MockHandle::new(movie_files(), 4 * MIB, 256));
        let (streamer, _client) = streamer(Arc::clone(&handle));

        let (_, hash) = streamer.add("aabbccdd", Some(0)).await.unwrap();
        let target = streamer.stream(&hash).unwrap().ensure_ready().await.unwrap();
        assert_eq!(target.index, 0);
    }

    #[tokio::test]
    async fn test_prepare_out_of_range_override_falls_back_to_largest() {
        let handle = Arc::new(MockHandle::new(movie_files(), 4 * MIB, 256));
        let (streamer, _client) = streamer(Arc::clone(&handle));

        let (_, hash) = streamer.add("aabbccdd", Some(99)).await.unwrap();
        let target = streamer.stream(&hash).unwrap().ensure_ready().await.unwrap();
        assert_eq!(target.index, 1);
    }

    #[tokio::test]
    async fn test_prepare_prioritizes_head_and_tail_pieces() {
        let handle = Arc::new(MockHandle::new(movie_files(), 4 * MIB, 256));
        let (streamer, _client) = streamer(Arc::clone(&handle));

        let (_, hash) = streamer.add("aabbccdd", None).await.unwrap();
        streamer.stream(&hash).unwrap().ensure_ready().await.unwrap();

        let prioritized = handle.prioritized.lock().unwrap().clone();
        assert_eq!(prioritized.len(), 2);
        // Head: file offset 20 MiB / 4 MiB pieces = piece 5, first 10 MiB
        // reaches piece (30 MiB / 4 MiB) = 7.
        assert_eq!(prioritized[0], 5..=7);
        // Tail: last 64 MiB of a file ending at 820 MiB -> pieces 189..=204.
        assert_eq!(prioritized[1], 189..=204);
    }

    #[tokio::test]
    async fn test_prepare_runs_once_and_caches_errors() {
        let handle = Arc::new(MockHandle::new(movie_files(), 4 * MIB, 256).without_metadata());
        let (streamer, _client) = streamer(Arc::clone(&handle));

        let (_, hash) = streamer.add("aabbccdd", None).await.unwrap();
        let stream = streamer.stream(&hash).unwrap();

        let first = stream.ensure_ready().await.unwrap_err();
        assert!(matches!(first, TorrentError::MetadataTimeout));
        let second = stream.ensure_ready().await.unwrap_err();
        assert!(matches!(second, TorrentError::MetadataTimeout));

        // The background kick-off from add() plus our first call race for
        // the latch; exactly one of them ran prepare.
        assert_eq!(handle.metadata_waits.load(Ordering::SeqCst), 1);

        let status = stream.status();
        assert_eq!(status.stage, TorrentStage::Error);
        assert!(!status.error.is_empty());
    }

    #[tokio::test]
    async fn test_status_stage_progression() {
        let handle = Arc::new(MockHandle::new(movie_files(), 4 * MIB, 256).without_metadata());
        // Construct the stream directly so no background prepare races the
        // stage assertions.
        let stream = TorrentStream::new(
            Arc::clone(&handle) as Arc<dyn TorrentHandle>,
            None,
            fast_config(),
        );

        assert_eq!(stream.status().stage, TorrentStage::Metadata);

        handle.metadata_available.store(true, Ordering::SeqCst);
        assert_eq!(stream.status().stage, TorrentStage::Downloading);

        stream.ensure_ready().await.unwrap();
        let status = stream.status();
        assert_eq!(status.stage, TorrentStage::Ready);
        assert!(status.ready);
        assert_eq!(status.peers, 3);
        assert_eq!(status.pieces_total, 256);
        assert!(status.progress > 0.0);
    }

    #[tokio::test]
    async fn test_remove_drops_stream_and_client_entry() {
        let handle = Arc::new(MockHandle::new(movie_files(), 4 * MIB, 256));
        let (streamer, client) = streamer(Arc::clone(&handle));

        let (_, hash) = streamer.add("aabbccdd", None).await.unwrap();
        streamer.remove(&hash).await;

        assert!(streamer.status(&hash).is_none());
        assert_eq!(client.removed.lock().unwrap().clone(), vec![hash]);
    }

    #[tokio::test]
    async fn test_open_reader_unknown_hash() {
        let handle = Arc::new(MockHandle::new(movie_files(), 4 * MIB, 256));
        let (streamer, _client) = streamer(handle);

        let err = streamer.open_reader("ffff", false).await.unwrap_err();
        assert!(matches!(err, TorrentError::NotFound { .. }));
    }

    #[test]
    fn test_priority_ranges_small_file_has_no_tail() {
        let (head, tail) =
            priority_piece_ranges(0, 30 * MIB, 4 * MIB, 100, 10 * MIB, 64 * MIB, 64 * MIB)
                .unwrap();
        assert_eq!(head, 0..=2);
        assert!(tail.is_none());
    }

    #[test]
    fn test_priority_ranges_clamp_to_piece_count() {
        let (head, tail) =
            priority_piece_ranges(0, 65 * MIB, 4 * MIB, 17, 100 * MIB, 64 * MIB, 64 * MIB)
                .unwrap();
        assert_eq!(head, 0..=16);
        assert_eq!(tail, Some(0..=16));
    }

    #[test]
    fn test_priority_ranges_degenerate_geometry() {
        assert!(priority_piece_ranges(0, MIB, 0, 0, MIB, MIB, MIB).is_err());
        assert!(
            priority_piece_ranges(100 * MIB, MIB, 4 * MIB, 10, MIB, MIB, MIB).is_err()
        );
    }
}
