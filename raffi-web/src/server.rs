//! Router assembly and server startup.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::Router;
use axum::http::{HeaderName, Method, header};
use axum::middleware;
use axum::routing::{get, post};
use tower_http::cors::{AllowOrigin, CorsLayer};

use raffi_core::hls::SliceController;
use raffi_core::session::SessionStore;
use raffi_core::torrent::TorrentStreamer;
use raffi_core::RaffiConfig;

use crate::cast::{self, CastGate};
use crate::handlers::{addons, clip, sessions, stream, torrents};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    /// Tuning knobs, shared across subsystems
    pub config: Arc<RaffiConfig>,
    /// Session registry
    pub sessions: Arc<SessionStore>,
    /// HLS slice controller
    pub controller: SliceController,
    /// Torrent adapter
    pub torrents: Arc<TorrentStreamer>,
    /// Cast-token gate
    pub cast: Arc<CastGate>,
    /// Community-addon catalogue cache
    pub addons: Arc<addons::AddonCache>,
    /// Per-session cooldown after failed torrent probes
    pub probe_cooldown: Arc<Mutex<HashMap<String, Instant>>>,
}

impl AppState {
    /// Assemble the state over already-constructed subsystems.
    pub fn new(
        config: RaffiConfig,
        sessions: Arc<SessionStore>,
        controller: SliceController,
        torrents: Arc<TorrentStreamer>,
    ) -> Self {
        let cast = Arc::new(CastGate::new(config.cast.clone()));
        Self {
            config: Arc::new(config),
            sessions,
            controller,
            torrents,
            cast,
            addons: Arc::new(addons::AddonCache::default()),
            probe_cooldown: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Build the full route tree with the LAN guard and CORS middleware.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", post(sessions::create_session))
        .route("/sessions/{id}", get(sessions::get_session))
        .route("/sessions/{id}/stream", get(stream::stream_session))
        .route("/sessions/{id}/stream/{*asset}", get(stream::stream_asset))
        .route("/sessions/{id}/audio", post(sessions::set_audio_track))
        .route("/sessions/{id}/clip", post(clip::export_clip))
        .route("/cast/token", post(sessions::issue_cast_token))
        .route(
            "/cleanup",
            post(sessions::cleanup).delete(sessions::cleanup),
        )
        .route("/torrents/{hash}", get(torrents::stream_torrent))
        .route("/torrents/{hash}/status", get(torrents::torrent_status))
        .route("/community-addons", get(addons::community_addons))
        .layer(middleware::from_fn_with_state(state.clone(), cast::lan_guard))
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::OPTIONS,
            Method::DELETE,
            Method::HEAD,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT_ENCODING,
            header::RANGE,
            header::ORIGIN,
            header::ACCEPT,
            HeaderName::from_static("x-raffi-cast-token"),
        ])
        .expose_headers([
            HeaderName::from_static("x-raffi-slice-start"),
            header::ACCEPT_RANGES,
            header::CONTENT_RANGE,
            header::CONTENT_LENGTH,
        ])
        .max_age(std::time::Duration::from_secs(86_400))
}

/// Bind the listener and serve until shutdown.
///
/// # Errors
///
/// Propagates bind and serve failures.
pub async fn run_server(addr: &str, state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    if local.ip().is_loopback() {
        tracing::info!("server listening on http://{local} (loopback only)");
    } else {
        tracing::info!("server listening on http://{local} (LAN mode with cast token guard)");
    }

    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
