//! Playlist and segment delivery.
//!
//! The playlist path honours seek parameters, stamps the slice start
//! header, injects the `EXT-X-START` offset tag, and rewrites URIs with the
//! presenting cast token. The segment path verifies containment, waits for
//! the segmenter to catch up, and feeds the throttle's demand signals.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tower::util::ServiceExt;
use tower_http::services::ServeFile;

use raffi_core::RaffiError;
use raffi_core::hls::playlist::wait_for_file;
use raffi_core::session::{Session, SessionKind};

use crate::server::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Seek target in seconds; unparseable values are ignored
    #[serde(default)]
    seek: Option<String>,
    /// Idempotency key for seek retries
    #[serde(default)]
    seek_id: Option<String>,
    /// `1` forces a fresh slice even when reuse would be possible
    #[serde(default)]
    force_slice: Option<String>,
    /// Bearer token for LAN clients; also accepted via header
    #[serde(default)]
    cast_token: Option<String>,
    /// Asset alias on the bare stream route
    #[serde(default)]
    stream: Option<String>,
}

/// `GET /sessions/{id}/stream`
pub async fn stream_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    let asset = query.stream.clone().unwrap_or_else(|| "child.m3u8".to_string());
    serve_session_asset(state, id, asset, query, headers).await
}

/// `GET /sessions/{id}/stream/{asset}`
pub async fn stream_asset(
    State(state): State<AppState>,
    Path((id, asset)): Path<(String, String)>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    serve_session_asset(state, id, asset, query, headers).await
}

async fn serve_session_asset(
    state: AppState,
    id: String,
    asset: String,
    query: StreamQuery,
    headers: HeaderMap,
) -> Response {
    let session = match state.sessions.get(&id) {
        Ok(session) => session,
        Err(_) => return (StatusCode::NOT_FOUND, "not found").into_response(),
    };
    if session.kind != SessionKind::Http {
        return (StatusCode::BAD_REQUEST, "unsupported session type").into_response();
    }

    if let Err(e) = state
        .controller
        .ensure_session(&id, &session.source, session.start_time)
        .await
    {
        tracing::warn!(id, "failed to prepare stream: {e}");
        return prepare_error_response(&RaffiError::Hls(e));
    }

    let cast_token = query
        .cast_token
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| {
            headers
                .get("x-raffi-cast-token")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|t| !t.is_empty())
        })
        .unwrap_or_default();

    if asset == "child.m3u8" {
        playlist_response(state, session, query, cast_token).await
    } else {
        asset_response(state, &id, &asset, &headers).await
    }
}

fn prepare_error_response(err: &RaffiError) -> Response {
    if err.is_transient() {
        (StatusCode::SERVICE_UNAVAILABLE, "stream not ready yet").into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "failed to prepare stream").into_response()
    }
}

async fn playlist_response(
    state: AppState,
    session: Session,
    query: StreamQuery,
    cast_token: String,
) -> Response {
    let id = session.id.clone();
    let mut slice_start = state.controller.slice_start(&id);

    let seek_target = query
        .seek
        .as_deref()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| *v >= 0.0);

    if let Some(target) = seek_target {
        let seek_id = query.seek_id.as_deref().unwrap_or("");
        let force_slice = query.force_slice.as_deref() == Some("1");
        tracing::debug!(id, target, seek_id, force_slice, "seeking session");

        match state
            .controller
            .seek(&id, &session.source, target, seek_id, force_slice)
            .await
        {
            Ok(outcome) => {
                if outcome.duration > 0.0 {
                    state
                        .sessions
                        .update(&id, |s| s.duration_seconds = outcome.duration);
                }
                slice_start = outcome.slice_start;
            }
            Err(e) => {
                tracing::warn!(id, "seek failed: {e}");
                return prepare_error_response(&RaffiError::Hls(e));
            }
        }
    }

    let Some(slice_dir) = state.controller.current_slice_dir(&id) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "no active slice").into_response();
    };
    let content = match std::fs::read_to_string(slice_dir.join("child.m3u8")) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(id, "failed to read playlist: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to read playlist").into_response();
        }
    };

    let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();
    if let Some(target) = seek_target {
        let offset = (target - slice_start).max(0.0);
        inject_start_offset(&mut lines, offset);
    }
    if !cast_token.is_empty() {
        for line in &mut lines {
            *line = rewrite_playlist_line(line, &cast_token);
        }
    }

    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                "application/vnd.apple.mpegurl".to_string(),
            ),
            (
                header::CACHE_CONTROL,
                "no-store, no-cache, must-revalidate, max-age=0".to_string(),
            ),
            (header::PRAGMA, "no-cache".to_string()),
            (header::EXPIRES, "0".to_string()),
            (
                axum::http::HeaderName::from_static("x-raffi-slice-start"),
                format!("{slice_start:.3}"),
            ),
        ],
        lines.join("\n"),
    )
        .into_response()
}

async fn asset_response(
    state: AppState,
    id: &str,
    asset: &str,
    headers: &HeaderMap,
) -> Response {
    // No traversal out of the slice directory.
    if asset.starts_with('/') || asset.split('/').any(|part| part == "..") {
        return (StatusCode::BAD_REQUEST, "invalid path").into_response();
    }

    let Some(slice_dir) = state.controller.current_slice_dir(id) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "no active slice").into_response();
    };
    let full_path = slice_dir.join(asset);

    let is_segment = full_path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("ts"));
    if is_segment {
        state.controller.notify_client_asset_request(id);
    }

    if let Err(e) = wait_for_file(&full_path, state.config.hls.segment_wait_timeout).await {
        tracing::warn!(id, asset, "segment wait failed: {e}");
        return (StatusCode::SERVICE_UNAVAILABLE, "segment unavailable").into_response();
    }

    match std::fs::metadata(&full_path) {
        Ok(meta) if meta.is_dir() => {
            return (StatusCode::BAD_REQUEST, "invalid asset").into_response();
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return (StatusCode::NOT_FOUND, "not found").into_response();
        }
        Err(_) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to read asset").into_response();
        }
    }

    if is_segment {
        if let Some(name) = full_path.file_name().and_then(|n| n.to_str()) {
            state.controller.mark_segment_served(id, name);
        }
    }

    // Range support is the file service's problem.
    let mut req = Request::builder().uri("/");
    if let Some(range) = headers.get(header::RANGE) {
        req = req.header(header::RANGE, range);
    }
    let req = match req.body(Body::empty()) {
        Ok(req) => req,
        Err(_) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to read asset").into_response();
        }
    };

    match ServeFile::new(&full_path).oneshot(req).await {
        Ok(response) => response.map(Body::new).into_response(),
        Err(e) => {
            tracing::warn!(id, asset, "failed to serve asset: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to read asset").into_response()
        }
    }
}

/// Append `cast_token=<token>` to a URL unless one is already present.
pub fn add_cast_token_to_url(raw_url: &str, cast_token: &str) -> String {
    let url = raw_url.trim();
    if url.is_empty() || cast_token.is_empty() {
        return url.to_string();
    }
    if url.contains("cast_token=") {
        return url.to_string();
    }
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}cast_token={cast_token}")
}

/// Rewrite one playlist line to carry the cast token: bare URL lines are
/// patched directly, tag lines only inside a `URI="…"` attribute.
pub fn rewrite_playlist_line(line: &str, cast_token: &str) -> String {
    let trimmed = line.trim();
    if trimmed.is_empty() || cast_token.is_empty() {
        return line.to_string();
    }

    if trimmed.starts_with('#') {
        let Some(uri_start) = line.find("URI=\"") else {
            return line.to_string();
        };
        let value_start = uri_start + "URI=\"".len();
        let Some(value_end_rel) = line[value_start..].find('"') else {
            return line.to_string();
        };
        let value_end = value_start + value_end_rel;
        let uri_value = &line[value_start..value_end];
        let patched = add_cast_token_to_url(uri_value, cast_token);
        if patched == uri_value {
            return line.to_string();
        }
        return format!("{}{}{}", &line[..value_start], patched, &line[value_end..]);
    }

    add_cast_token_to_url(trimmed, cast_token)
}

/// Insert `#EXT-X-START:TIME-OFFSET=<offset>,PRECISE=YES` right after the
/// `#EXTM3U` header, so players land on the seek target inside the slice.
pub fn inject_start_offset(lines: &mut Vec<String>, offset: f64) {
    let tag = format!("#EXT-X-START:TIME-OFFSET={offset:.3},PRECISE=YES");
    if lines.first().is_some_and(|l| l.starts_with("#EXTM3U")) {
        lines.insert(1, tag);
    } else {
        lines.insert(0, tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_cast_token_to_url() {
        assert_eq!(
            add_cast_token_to_url("segment00001.ts", "tok"),
            "segment00001.ts?cast_token=tok"
        );
        assert_eq!(
            add_cast_token_to_url("child.m3u8?seek=10", "tok"),
            "child.m3u8?seek=10&cast_token=tok"
        );
        assert_eq!(add_cast_token_to_url("", "tok"), "");
    }

    #[test]
    fn test_add_cast_token_is_idempotent() {
        let once = add_cast_token_to_url("segment00001.ts", "tok");
        assert_eq!(add_cast_token_to_url(&once, "tok"), once);
        assert_eq!(once.matches("cast_token=").count(), 1);
    }

    #[test]
    fn test_rewrite_plain_url_line() {
        assert_eq!(
            rewrite_playlist_line("segment00003.ts", "tok"),
            "segment00003.ts?cast_token=tok"
        );
    }

    #[test]
    fn test_rewrite_tag_line_with_uri_attribute() {
        let line = r#"#EXT-X-MEDIA:TYPE=AUDIO,URI="audio/child.m3u8",GROUP-ID="aud""#;
        assert_eq!(
            rewrite_playlist_line(line, "tok"),
            r#"#EXT-X-MEDIA:TYPE=AUDIO,URI="audio/child.m3u8?cast_token=tok",GROUP-ID="aud""#
        );
    }

    #[test]
    fn test_rewrite_leaves_plain_tags_alone() {
        assert_eq!(rewrite_playlist_line("#EXTINF:6.0,", "tok"), "#EXTINF:6.0,");
        assert_eq!(rewrite_playlist_line("#EXTM3U", "tok"), "#EXTM3U");
        assert_eq!(rewrite_playlist_line("", "tok"), "");
    }

    #[test]
    fn test_inject_start_offset_after_header() {
        let mut lines: Vec<String> = ["#EXTM3U", "#EXTINF:6.0,", "segment00000.ts"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        inject_start_offset(&mut lines, 10.0);
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXT-X-START:TIME-OFFSET=10.000,PRECISE=YES");
        assert_eq!(lines[2], "#EXTINF:6.0,");
    }

    #[test]
    fn test_inject_start_offset_without_header() {
        let mut lines: Vec<String> = vec!["segment00000.ts".to_string()];
        inject_start_offset(&mut lines, 0.0);
        assert_eq!(lines[0], "#EXT-X-START:TIME-OFFSET=0.000,PRECISE=YES");
    }
}
