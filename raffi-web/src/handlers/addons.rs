//! Community addon catalogue proxy.
//!
//! Fetches the upstream catalogues server-side (the renderer cannot, for
//! CORS reasons), merges and deduplicates them, and caches the merged
//! payload for half an hour.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::Value;

use crate::server::AppState;

const CACHE_TTL: Duration = Duration::from_secs(30 * 60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(25);

const UPSTREAMS: &[&str] = &[
    "https://api.strem.io/addonscollection.json",
    "https://stremio-addons.com/catalog.json",
];

/// Cached merged catalogue payload.
#[derive(Default)]
pub struct AddonCache {
    payload: Mutex<Option<(Instant, Bytes)>>,
}

impl AddonCache {
    fn fresh(&self) -> Option<Bytes> {
        let payload = self.payload.lock().expect("addon cache lock poisoned");
        payload
            .as_ref()
            .filter(|(fetched, _)| fetched.elapsed() < CACHE_TTL)
            .map(|(_, bytes)| bytes.clone())
    }

    fn store(&self, bytes: Bytes) {
        let mut payload = self.payload.lock().expect("addon cache lock poisoned");
        *payload = Some((Instant::now(), bytes));
    }
}

/// `GET /community-addons`
pub async fn community_addons(State(state): State<AppState>) -> Response {
    if let Some(payload) = state.addons.fresh() {
        return catalogue_response(payload);
    }

    let client = match reqwest::Client::builder().timeout(FETCH_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to build client: {e}"),
            )
                .into_response();
        }
    };

    let mut merged: Vec<Value> = Vec::new();
    let mut last_err: Option<String> = None;

    for upstream in UPSTREAMS {
        match fetch_catalogue(&client, upstream).await {
            Ok(mut entries) => merged.append(&mut entries),
            Err(e) => {
                tracing::debug!(upstream, "addon catalogue fetch failed: {e}");
                last_err = Some(e);
            }
        }
    }

    if merged.is_empty() {
        let mut message = "failed to fetch community addons".to_string();
        if let Some(e) = last_err {
            message = format!("{message}: {e}");
        }
        return (StatusCode::BAD_GATEWAY, message).into_response();
    }

    let deduped = dedupe_addons(merged);
    let payload = match serde_json::to_vec(&deduped) {
        Ok(payload) => Bytes::from(payload),
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode response",
            )
                .into_response();
        }
    };

    state.addons.store(payload.clone());
    catalogue_response(payload)
}

fn catalogue_response(payload: Bytes) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json; charset=utf-8"),
            (header::CACHE_CONTROL, "public, max-age=1800"),
        ],
        payload,
    )
        .into_response()
}

async fn fetch_catalogue(client: &reqwest::Client, url: &str) -> Result<Vec<Value>, String> {
    let response = client
        .get(url)
        .header("accept", "application/json")
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = response.status();
    if !status.is_success() {
        return Err(format!("upstream {url} returned {}", status.as_u16()));
    }

    response
        .json::<Vec<Value>>()
        .await
        .map_err(|e| format!("invalid JSON from {url}: {e}"))
}

/// Deduplicate catalogue entries by transport URL, falling back to the
/// manifest ID. Entries with neither key are dropped.
pub fn dedupe_addons(merged: Vec<Value>) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    let mut deduped = Vec::with_capacity(merged.len());

    for entry in merged {
        let Some(obj) = entry.as_object() else {
            continue;
        };

        let mut key = obj
            .get("transportUrl")
            .or_else(|| obj.get("transport_url"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if key.is_empty() {
            key = obj
                .get("manifest")
                .and_then(Value::as_object)
                .and_then(|m| m.get("id"))
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default()
                .to_string();
        }
        if key.is_empty() || !seen.insert(key) {
            continue;
        }
        deduped.push(entry);
    }

    deduped
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_dedupe_by_transport_url() {
        let merged = vec![
            json!({"transportUrl": "https://a/manifest.json", "name": "first"}),
            json!({"transportUrl": "https://a/manifest.json", "name": "dup"}),
            json!({"transport_url": "https://b/manifest.json"}),
        ];
        let deduped = dedupe_addons(merged);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0]["name"], "first");
    }

    #[test]
    fn test_dedupe_falls_back_to_manifest_id() {
        let merged = vec![
            json!({"manifest": {"id": "org.example"}}),
            json!({"manifest": {"id": "org.example"}}),
            json!({"manifest": {"id": "org.other"}}),
        ];
        assert_eq!(dedupe_addons(merged).len(), 2);
    }

    #[test]
    fn test_dedupe_drops_unkeyed_entries() {
        let merged = vec![json!({"name": "keyless"}), json!("not-an-object")];
        assert!(dedupe_addons(merged).is_empty());
    }

    #[test]
    fn test_cache_expiry() {
        let cache = AddonCache::default();
        assert!(cache.fresh().is_none());

        cache.store(Bytes::from_static(b"[]"));
        assert_eq!(cache.fresh().unwrap(), Bytes::from_static(b"[]"));
    }
}
