//! Cast-token gate: short-lived bearer tokens minted from loopback and
//! accepted on a restricted read-only route set for LAN clients.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use rand::RngCore;

use raffi_core::config::CastConfig;

use crate::server::AppState;

/// One issued token grant.
#[derive(Debug, Clone)]
pub struct CastToken {
    /// Session the token is scoped to
    pub session_id: String,
    /// Expiry instant
    pub expires_at: DateTime<Utc>,
}

/// Token table with loopback-only issuance and lazy expiry pruning.
pub struct CastGate {
    config: CastConfig,
    tokens: RwLock<HashMap<String, CastToken>>,
}

impl CastGate {
    /// Create an empty gate.
    pub fn new(config: CastConfig) -> Self {
        Self {
            config,
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Issue a token for a session.
    ///
    /// The TTL defaults to the configured value and is clamped into the
    /// configured `[min, max]` window.
    pub fn issue(&self, session_id: &str, ttl_seconds: Option<i64>) -> (String, DateTime<Utc>) {
        let mut ttl = match ttl_seconds {
            Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
            _ => self.config.default_ttl,
        };
        ttl = ttl.clamp(self.config.min_ttl, self.config.max_ttl);

        let token = random_token();
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();

        let mut tokens = self.tokens.write().expect("cast lock poisoned");
        tokens.insert(
            token.clone(),
            CastToken {
                session_id: session_id.to_string(),
                expires_at,
            },
        );
        (token, expires_at)
    }

    /// Validate a token against a session, pruning it when expired.
    pub fn validate(&self, token: &str, session_id: &str) -> bool {
        if token.is_empty() || session_id.is_empty() {
            return false;
        }

        let grant = {
            let tokens = self.tokens.read().expect("cast lock poisoned");
            tokens.get(token).cloned()
        };
        let Some(grant) = grant else {
            return false;
        };

        if Utc::now() > grant.expires_at {
            let mut tokens = self.tokens.write().expect("cast lock poisoned");
            tokens.remove(token);
            return false;
        }
        grant.session_id == session_id
    }

    /// Drop all expired tokens.
    pub fn sweep(&self) {
        let now = Utc::now();
        let mut tokens = self.tokens.write().expect("cast lock poisoned");
        tokens.retain(|_, grant| now <= grant.expires_at);
    }

    /// Number of live grants, for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.tokens.read().expect("cast lock poisoned").len()
    }

    /// Whether no grants are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawn the periodic expired-token sweep.
pub fn spawn_sweeper(
    state: AppState,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            state.cast.sweep();
        }
    })
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Whether the request originated from a loopback address.
pub fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}

/// Extract the cast token from the query string or the alt header.
pub fn cast_token_from_request(uri: &Uri, headers: &HeaderMap) -> String {
    if let Some(query) = uri.query() {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("cast_token=") {
                if !value.is_empty() {
                    return value.to_string();
                }
            }
        }
    }
    headers
        .get("x-raffi-cast-token")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

/// Session ID segment of a `/sessions/{id}...` path, empty otherwise.
pub fn session_id_from_path(path: &str) -> String {
    let Some(trimmed) = path.strip_prefix("/sessions/") else {
        return String::new();
    };
    trimmed
        .split('/')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Whether a non-loopback request may pass with a valid token: read-only
/// session info and stream assets, nothing else.
pub fn is_allowed_cast_route(path: &str, method: &Method) -> bool {
    if method != Method::GET {
        return false;
    }
    let Some(trimmed) = path.strip_prefix("/sessions/") else {
        return false;
    };
    if trimmed.is_empty() {
        return false;
    }
    let parts: Vec<&str> = trimmed.split('/').collect();
    match parts.len() {
        1 => true,
        _ => parts[1] == "stream",
    }
}

/// LAN guard middleware: loopback passes untouched; everything else is
/// limited to the cast route set with a valid, session-matching token.
pub async fn lan_guard(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if is_loopback(&addr) {
        return next.run(request).await;
    }

    let path = request.uri().path().to_string();
    if !path.starts_with("/sessions/") {
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }
    if !is_allowed_cast_route(&path, request.method()) {
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }

    let session_id = session_id_from_path(&path);
    let token = cast_token_from_request(request.uri(), request.headers());
    if !state.cast.validate(&token, &session_id) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    next.run(request).await
}
