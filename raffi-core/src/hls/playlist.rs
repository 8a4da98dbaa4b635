//! Rolling playlist inspection and readiness polling.

use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;

use super::HlsError;

/// Parse the rolling playlist at `path` into
/// `(media_sequence, segment_count)`.
///
/// Counts `#EXTINF:` lines and reads the first `#EXT-X-MEDIA-SEQUENCE:` tag.
/// A partially written file simply yields fewer segments.
///
/// # Errors
///
/// Propagates the I/O error when the playlist cannot be read at all.
pub fn read_playlist_state(path: &Path) -> std::io::Result<(u64, u64)> {
    let content = std::fs::read_to_string(path)?;

    let mut media_seq = 0u64;
    let mut segments = 0u64;
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            if let Ok(seq) = value.trim().parse() {
                media_seq = seq;
            }
        }
        if line.starts_with("#EXTINF:") {
            segments += 1;
        }
    }
    Ok((media_seq, segments))
}

/// Decode a segment filename back to its sequence number.
///
/// Strips the extension and parses the trailing run of digits, the inverse
/// of the segmenter's `segment%05d.ts` formatter.
pub fn parse_segment_sequence(name: &str) -> Option<u64> {
    let stem = match name.rfind('.') {
        Some(dot) => &name[..dot],
        None => name,
    };
    let digits = stem.trim_end_matches(|c: char| !c.is_ascii_digit());
    let tail = &stem[digits.len()..];
    if tail.is_empty() {
        return None;
    }
    tail.parse().ok()
}

/// Wait until the manifest exists and holds at least two segments.
///
/// The two-segment floor gives players a smooth start. Once the manifest
/// exists, running out the budget is only a warning; the playlist will keep
/// growing under the client.
///
/// # Errors
///
/// [`HlsError::ManifestTimeout`] when the manifest never appears.
pub async fn wait_for_manifest_ready(path: &Path, timeout: Duration) -> Result<(), HlsError> {
    let deadline = Instant::now() + timeout;

    loop {
        if path.exists() {
            break;
        }
        if Instant::now() >= deadline {
            return Err(HlsError::ManifestTimeout {
                path: path.to_path_buf(),
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    loop {
        if let Ok((_, segments)) = read_playlist_state(path) {
            if segments >= 2 {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            tracing::warn!(path = %path.display(), "manifest has few segments yet, continuing");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Wait for a file to appear on disk, polling every 100 ms.
///
/// # Errors
///
/// [`HlsError::SegmentUnavailable`] when the budget runs out,
/// [`HlsError::Io`] on stat failures other than not-found.
pub async fn wait_for_file(path: &Path, timeout: Duration) -> Result<(), HlsError> {
    let deadline = Instant::now() + timeout;

    loop {
        match std::fs::metadata(path) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(HlsError::Io(e)),
        }
        if Instant::now() >= deadline {
            return Err(HlsError::SegmentUnavailable {
                path: path.to_path_buf(),
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_playlist(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("child.m3u8");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_read_playlist_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_playlist(
            dir.path(),
            "#EXTM3U\n\
             #EXT-X-VERSION:3\n\
             #EXT-X-MEDIA-SEQUENCE:7\n\
             #EXTINF:6.000000,\n\
             segment00007.ts\n\
             #EXTINF:6.000000,\n\
             segment00008.ts\n",
        );

        assert_eq!(read_playlist_state(&path).unwrap(), (7, 2));
    }

    #[test]
    fn test_read_playlist_state_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_playlist(dir.path(), "#EXTM3U\n#EXT-X-VERS");
        assert_eq!(read_playlist_state(&path).unwrap(), (0, 0));
    }

    #[test]
    fn test_read_playlist_state_missing_file() {
        assert!(read_playlist_state(Path::new("/nonexistent/child.m3u8")).is_err());
    }

    #[test]
    fn test_parse_segment_sequence_roundtrip() {
        for seq in [0u64, 7, 123, 99999] {
            let name = format!("segment{seq:05}.ts");
            assert_eq!(parse_segment_sequence(&name), Some(seq));
        }
    }

    #[test]
    fn test_parse_segment_sequence_rejects_digitless_names() {
        assert_eq!(parse_segment_sequence("child.m3u8"), None);
        assert_eq!(parse_segment_sequence("segment"), None);
        assert_eq!(parse_segment_sequence(""), None);
    }

    #[test]
    fn test_parse_segment_sequence_takes_trailing_run() {
        assert_eq!(parse_segment_sequence("seg2part00010.ts"), Some(10));
    }

    #[tokio::test]
    async fn test_wait_for_manifest_ready_times_out_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("child.m3u8");
        let err = wait_for_manifest_ready(&path, Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, HlsError::ManifestTimeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_manifest_ready_with_two_segments() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_playlist(
            dir.path(),
            "#EXTM3U\n#EXTINF:6.0,\nsegment00000.ts\n#EXTINF:6.0,\nsegment00001.ts\n",
        );
        wait_for_manifest_ready(&path, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_manifest_proceeds_on_sparse_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_playlist(dir.path(), "#EXTM3U\n#EXTINF:6.0,\nsegment00000.ts\n");
        // One segment only: best effort, returns Ok after the budget.
        wait_for_manifest_ready(&path, Duration::from_millis(150))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment00000.ts");

        let err = wait_for_file(&path, Duration::from_millis(120))
            .await
            .unwrap_err();
        assert!(matches!(err, HlsError::SegmentUnavailable { .. }));

        std::fs::write(&path, b"data").unwrap();
        wait_for_file(&path, Duration::from_millis(120)).await.unwrap();
    }
}
