//! Clip export: cut a sub-range of the session's source into an MP4 file.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use raffi_core::hls::is_http_source;

use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct ClipRequest {
    start: f64,
    end: f64,
    #[serde(default)]
    name: Option<String>,
    /// Absolute output path chosen by the client (Save-As); otherwise the
    /// server picks a default clips directory.
    #[serde(default, rename = "outputPath")]
    output_path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClipResponse {
    #[serde(rename = "outputPath")]
    output_path: String,
}

/// `POST /sessions/{id}/clip`
pub async fn export_clip(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ClipRequest>,
) -> Result<Json<ClipResponse>, (StatusCode, String)> {
    if req.start < 0.0 || req.end <= 0.0 || req.end <= req.start {
        return Err((StatusCode::BAD_REQUEST, "invalid start/end".to_string()));
    }

    let session = state
        .sessions
        .get(&id)
        .map_err(|_| (StatusCode::NOT_FOUND, "not found".to_string()))?;
    let input = session.source.trim().to_string();
    if input.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "missing session source".to_string()));
    }

    let clip_duration = req.end - req.start;
    // Remote sources hold an upstream connection for the whole export, so
    // they get the tighter cap.
    let max_duration = if is_http_source(&input) { 900.0 } else { 3600.0 };
    if clip_duration > max_duration {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("clip too long (max {max_duration:.0}s)"),
        ));
    }

    let output_path = resolve_output_path(req.name.as_deref(), req.output_path.as_deref())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))?;

    let timeout = Duration::from_secs(120)
        .saturating_add(Duration::from_secs_f64(clip_duration * 5.0))
        .min(Duration::from_secs(3600));

    let mut args: Vec<String> = ["-y", "-hide_banner", "-loglevel", "error"]
        .map(String::from)
        .to_vec();
    if is_http_source(&input) {
        args.extend(
            [
                "-reconnect",
                "1",
                "-reconnect_at_eof",
                "1",
                "-reconnect_streamed",
                "1",
                "-reconnect_delay_max",
                "5",
            ]
            .map(String::from),
        );
    }

    // -ss/-to before -i for fast demuxer-side seeking.
    let audio_map = format!("0:a:{}?", session.audio_index);
    args.extend([
        "-ss".to_string(),
        format!("{:.3}", req.start),
        "-to".to_string(),
        format!("{:.3}", req.end),
        "-i".to_string(),
        input,
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        audio_map,
    ]);
    args.extend(
        [
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-crf",
            "23",
            "-pix_fmt",
            "yuv420p",
            "-profile:v",
            "main",
            "-level:v",
            "4.1",
            "-tune",
            "fastdecode",
            "-tag:v",
            "avc1",
            "-c:a",
            "aac",
            "-ac",
            "2",
            "-ar",
            "48000",
            "-b:a",
            "160k",
            "-movflags",
            "+faststart",
        ]
        .map(String::from),
    );
    args.push(output_path.to_string_lossy().into_owned());

    tracing::info!(id, start = req.start, end = req.end, out = %output_path.display(), "exporting clip");

    let output = tokio::time::timeout(
        timeout,
        tokio::process::Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "ffmpeg failed: clip export timed out".to_string(),
        )
    })?
    .map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ffmpeg failed: {e}"),
        )
    })?;

    if !output.status.success() {
        let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.is_empty() {
            stderr = format!("exit status {}", output.status);
        }
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ffmpeg failed: {stderr}"),
        ));
    }

    Ok(Json(ClipResponse {
        output_path: output_path.to_string_lossy().into_owned(),
    }))
}

fn resolve_output_path(name: Option<&str>, output_path: Option<&str>) -> Result<PathBuf, String> {
    if let Some(path) = output_path.map(str::trim).filter(|p| !p.is_empty()) {
        let mut path = path.to_string();
        if !path.to_lowercase().ends_with(".mp4") {
            path.push_str(".mp4");
        }
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create output dir: {e}"))?;
        }
        return Ok(path);
    }

    let clips_dir = default_clips_dir();
    std::fs::create_dir_all(&clips_dir).map_err(|e| format!("failed to create clips dir: {e}"))?;

    let mut base_name = name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("clip_{}", chrono::Local::now().format("%Y%m%d_%H%M%S")));
    base_name = sanitize_filename(&base_name);
    if !base_name.to_lowercase().ends_with(".mp4") {
        base_name.push_str(".mp4");
    }
    Ok(clips_dir.join(base_name))
}

/// OS config directory when resolvable, temp fallback otherwise.
fn default_clips_dir() -> PathBuf {
    let config_dir = if cfg!(target_os = "macos") {
        std::env::var_os("HOME").map(|home| {
            PathBuf::from(home)
                .join("Library")
                .join("Application Support")
        })
    } else if cfg!(windows) {
        std::env::var_os("APPDATA").map(PathBuf::from)
    } else {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
    };

    match config_dir {
        Some(dir) => dir.join("Raffi").join("clips"),
        None => std::env::temp_dir().join("raffi").join("clips"),
    }
}

/// Replace filesystem-hostile characters so client-supplied names cannot
/// escape or break the clips directory.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();
    let cleaned = cleaned.trim_matches(['.', ' ']).to_string();
    if cleaned.is_empty() {
        "clip".to_string()
    } else {
        cleaned
    }
}
