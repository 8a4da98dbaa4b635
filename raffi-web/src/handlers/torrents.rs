//! Torrent status and byte-range serving over the adapter's reader.

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::io::ReaderStream;

use raffi_core::torrent::TorrentError;

use crate::range::{extract_range_header, parse_range_header, validate_range_bounds};
use crate::server::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct TorrentQuery {
    /// `1` widens the read-ahead for prober trailer scans
    #[serde(default)]
    metadata: Option<String>,
}

/// `GET /torrents/{hash}/status`
pub async fn torrent_status(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Response {
    match state.torrents.status(&hash) {
        Some(status) => Json(status).into_response(),
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

/// `GET /torrents/{hash}` — seekable byte stream over the target file.
pub async fn stream_torrent(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Query(query): Query<TorrentQuery>,
    headers: HeaderMap,
) -> Response {
    let metadata = query.metadata.as_deref() == Some("1");

    let (mut reader, target) = match state.torrents.open_reader(&hash, metadata).await {
        Ok(opened) => opened,
        Err(TorrentError::NotFound { .. }) => {
            return (StatusCode::NOT_FOUND, "not found").into_response();
        }
        Err(e @ (TorrentError::NotReady { .. } | TorrentError::MetadataTimeout)) => {
            return (StatusCode::GATEWAY_TIMEOUT, format!("torrent not ready: {e}"))
                .into_response();
        }
        Err(TorrentError::NoFile) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "torrent has no selected file",
            )
                .into_response();
        }
        Err(e) => {
            tracing::warn!(hash, "torrent open failed: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let total_size = target.length;
    let has_range = extract_range_header(&headers).is_some();
    let (start, end, _) = match extract_range_header(&headers) {
        Some(range) => parse_range_header(&range, total_size),
        None => (0, total_size.saturating_sub(1), total_size),
    };
    let (start, safe_end, safe_length) = match validate_range_bounds(start, end, total_size) {
        Ok(bounds) => bounds,
        Err(status) => return status.into_response(),
    };

    if let Err(e) = reader.seek(SeekFrom::Start(start)).await {
        tracing::warn!(hash, start, "torrent seek failed: {e}");
        return (StatusCode::INTERNAL_SERVER_ERROR, "read failed").into_response();
    }

    let body = Body::from_stream(ReaderStream::new(reader.take(safe_length)));
    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, content_type_for(&target.name))
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, safe_length.to_string());

    if has_range {
        response = response
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {start}-{safe_end}/{total_size}"),
            );
    } else {
        response = response.status(StatusCode::OK);
    }

    response
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn content_type_for(name: &str) -> &'static str {
    let ext = std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        Some("avi") => "video/x-msvideo",
        Some("mov") => "video/quicktime",
        Some("ts") => "video/mp2t",
        _ => "application/octet-stream",
    }
}
