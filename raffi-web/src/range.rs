//! HTTP Range parsing for swarm-backed byte streams.
//!
//! On-disk segment files delegate Range handling to the static file
//! service; torrent reads come from a seekable reader instead, so the
//! header handling lives here.

use axum::http::{HeaderMap, StatusCode};

/// Parse a `Range` header into `(start, end, content_length)`.
///
/// Handles the single-range `bytes=start-end` form with open ends; missing
/// or unparseable specs fall back to the full entity.
pub fn parse_range_header(range: &str, total_size: u64) -> (u64, u64, u64) {
    if !range.starts_with("bytes=") {
        return (0, total_size.saturating_sub(1), total_size);
    }

    let spec = &range[6..];
    if let Some((start_str, end_str)) = spec.split_once('-') {
        let start = start_str.parse::<u64>().unwrap_or(0);
        let end = if end_str.is_empty() {
            total_size.saturating_sub(1)
        } else {
            end_str
                .parse::<u64>()
                .unwrap_or(total_size.saturating_sub(1))
        };
        let content_length = end.saturating_sub(start) + 1;
        (start, end, content_length)
    } else {
        (0, total_size.saturating_sub(1), total_size)
    }
}

/// Clamp a requested range to the entity and reject impossible starts.
///
/// # Errors
///
/// `RANGE_NOT_SATISFIABLE` when the start lies beyond the entity.
pub fn validate_range_bounds(
    start: u64,
    end: u64,
    total_size: u64,
) -> Result<(u64, u64, u64), StatusCode> {
    if start > total_size {
        return Err(StatusCode::RANGE_NOT_SATISFIABLE);
    }
    let safe_end = end.min(total_size.saturating_sub(1));
    let safe_length = safe_end.saturating_sub(start) + 1;
    Ok((start, safe_end, safe_length))
}

/// Fetch the `Range` header as a string, if present and valid UTF-8.
pub fn extract_range_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("range")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
