//! Session CRUD, audio switching, cast-token minting, and cleanup.

use std::net::SocketAddr;
use std::time::Instant;

use axum::Json;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use raffi_core::hls::HlsError;
use raffi_core::session::{Chapter, Session, SessionKind, StreamInfo};

use crate::cast;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    source: String,
    #[serde(default)]
    kind: Option<SessionKind>,
    #[serde(default, rename = "startTime")]
    start_time: f64,
    #[serde(default, rename = "fileIdx")]
    file_idx: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    id: String,
}

/// `POST /sessions`
///
/// Torrent sources are first admitted through the adapter (which returns
/// synchronously); the stored session is then an HTTP session pointing at
/// the adapter URL, with the torrent linkage recorded.
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, (StatusCode, String)> {
    let session = if req.kind == Some(SessionKind::Torrent) {
        let (stream_url, info_hash) = state
            .torrents
            .add(&req.source, req.file_idx)
            .await
            .map_err(|e| {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to start torrent: {e}"),
                )
            })?;

        let session = state
            .sessions
            .create(&stream_url, Some(SessionKind::Http), req.start_time)
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        state.sessions.update(&session.id, |s| {
            s.is_torrent = true;
            s.torrent_info_hash = info_hash.clone();
        });
        session
    } else {
        state
            .sessions
            .create(&req.source, req.kind, req.start_time)
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    };

    tracing::info!(id = %session.id, kind = ?session.kind, "session created");
    Ok(Json(CreateSessionResponse { id: session.id }))
}

/// `GET /sessions/{id}`
///
/// Serves the session record, lazily probing metadata when duration,
/// chapters, or streams are still missing. Torrent sessions wait for the
/// adapter to report readiness with at least one completed piece, and a
/// failed torrent probe sets a cooldown to avoid a retry storm while pieces
/// trickle in.
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, (StatusCode, String)> {
    let mut session = state
        .sessions
        .get(&id)
        .map_err(|_| (StatusCode::NOT_FOUND, "not found".to_string()))?;

    if session.kind != SessionKind::Http {
        return Ok(Json(session));
    }

    if let Some((audio_index, streams)) = state.controller.describe(&id) {
        session.audio_index = audio_index;
        if !streams.is_empty() {
            session.available_streams = streams;
        }
        let (ai, st) = (session.audio_index, session.available_streams.clone());
        state.sessions.update(&id, |s| {
            s.audio_index = ai;
            if !st.is_empty() {
                s.available_streams = st.clone();
            }
        });
    }

    let needs_probe = session.duration_seconds == 0.0
        || session.chapters.is_empty()
        || session.available_streams.is_empty();
    if !needs_probe {
        return Ok(Json(session));
    }

    if session.is_torrent && !session.torrent_info_hash.is_empty() {
        let ready = state
            .torrents
            .status(&session.torrent_info_hash)
            .map(|status| status.ready && status.pieces_complete > 0)
            .unwrap_or(false);
        if !ready {
            return Ok(Json(session));
        }

        let cooling_down = {
            let cooldown = state.probe_cooldown.lock().expect("cooldown lock poisoned");
            cooldown
                .get(&id)
                .is_some_and(|until| Instant::now() < *until)
        };
        if cooling_down {
            return Ok(Json(session));
        }
    }

    let probe = &state.config.probe;
    let (max_attempts, attempt_timeout) = if session.is_torrent {
        (probe.torrent_max_attempts, probe.torrent_attempt_timeout)
    } else {
        (probe.max_attempts, probe.attempt_timeout)
    };

    let mut result = Err(HlsError::ProbeFailed {
        reason: "no probe attempts configured".to_string(),
    });
    for attempt in 0..max_attempts {
        result = state
            .controller
            .probe_metadata(&session.source, attempt_timeout)
            .await;
        if result.is_ok() {
            break;
        }
        if attempt + 1 < max_attempts {
            tokio::time::sleep(std::time::Duration::from_millis(200 * (attempt as u64 + 1)))
                .await;
        }
    }

    match result {
        Ok(meta) => {
            {
                let mut cooldown = state.probe_cooldown.lock().expect("cooldown lock poisoned");
                cooldown.remove(&id);
            }

            session.duration_seconds = meta.duration_seconds();
            session.chapters = meta
                .chapters
                .iter()
                .map(|c| Chapter {
                    start_time: c.start_time.parse().unwrap_or(0.0),
                    end_time: c.end_time.parse().unwrap_or(0.0),
                    title: c.tags.title.clone(),
                })
                .collect();

            let mut streams = Vec::new();
            let mut preferred_index = 0;
            let mut found_eng = false;
            let mut audio_count = 0;
            for st in &meta.streams {
                if st.codec_type != "audio" {
                    continue;
                }
                streams.push(StreamInfo {
                    index: audio_count,
                    kind: "audio".to_string(),
                    codec: st.codec_name.clone(),
                    language: st.tags.language.clone(),
                    title: st.tags.title.clone(),
                });
                if !found_eng && st.tags.language.eq_ignore_ascii_case("eng") {
                    preferred_index = audio_count;
                    found_eng = true;
                }
                audio_count += 1;
            }
            session.available_streams = streams;
            if !session.available_streams.is_empty() {
                session.audio_index = preferred_index;
            }

            let snapshot = session.clone();
            state.sessions.update(&id, |s| {
                s.duration_seconds = snapshot.duration_seconds;
                s.chapters = snapshot.chapters.clone();
                s.available_streams = snapshot.available_streams.clone();
                s.audio_index = snapshot.audio_index;
            });
        }
        Err(e) => {
            if session.is_torrent {
                let mut cooldown = state.probe_cooldown.lock().expect("cooldown lock poisoned");
                cooldown.insert(id.clone(), Instant::now() + probe.torrent_failure_cooldown);
            }
            tracing::warn!(id, "metadata probe failed: {e}");
        }
    }

    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
pub struct AudioTrackRequest {
    index: usize,
}

/// `POST /sessions/{id}/audio`
pub async fn set_audio_track(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AudioTrackRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    match state.controller.set_audio_track(&id, req.index) {
        Ok(()) => {}
        Err(HlsError::SessionNotFound { .. }) => {
            // The transcoder has not been ensured yet; the registry update
            // below still records the selection for the next launch.
        }
        Err(e) => return Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }

    if !state.sessions.update(&id, |s| s.audio_index = req.index) {
        return Err((StatusCode::NOT_FOUND, "not found".to_string()));
    }
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct CastTokenRequest {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(default, rename = "ttlSeconds")]
    ttl_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CastTokenResponse {
    token: String,
    #[serde(rename = "expiresAt")]
    expires_at: DateTime<Utc>,
}

/// `POST /cast/token` — loopback only.
pub async fn issue_cast_token(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<CastTokenRequest>,
) -> Result<Json<CastTokenResponse>, (StatusCode, String)> {
    if !cast::is_loopback(&addr) {
        return Err((StatusCode::FORBIDDEN, "forbidden".to_string()));
    }

    let session_id = req.session_id.trim();
    if session_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "sessionId is required".to_string()));
    }
    if state.sessions.get(session_id).is_err() {
        return Err((StatusCode::NOT_FOUND, "session not found".to_string()));
    }

    let (token, expires_at) = state.cast.issue(session_id, req.ttl_seconds);
    Ok(Json(CastTokenResponse { token, expires_at }))
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupQuery {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupBody {
    #[serde(default)]
    id: Option<String>,
}

/// `POST|DELETE /cleanup` — stop the session, release its torrent, drop the
/// registry record.
pub async fn cleanup(
    State(state): State<AppState>,
    Query(query): Query<CleanupQuery>,
    body: axum::body::Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let id = query
        .id
        .filter(|id| !id.is_empty())
        .or_else(|| {
            serde_json::from_slice::<CleanupBody>(&body)
                .ok()
                .and_then(|b| b.id)
        })
        .filter(|id| !id.is_empty())
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "id required".to_string()))?;

    tracing::info!(id, "cleaning up session");

    if let Ok(session) = state.sessions.get(&id) {
        if session.is_torrent && !session.torrent_info_hash.is_empty() {
            state.torrents.remove(&session.torrent_info_hash).await;
        }
    }

    state.controller.stop_session(&id);
    state.sessions.delete(&id);
    Ok(StatusCode::OK)
}
