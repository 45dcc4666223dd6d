//! Threat-advisory feed: a small durable list with TTL expiry.
//!
//! Memory is authoritative; the JSON file is best-effort persistence
//! written synchronously under the list lock. A missing or corrupt file
//! at startup means an empty feed, never an error.

use crate::model::{truncate_chars, Severity, ThreatFeedItem, RAW_TRUNCATE_CHARS};
use crate::session::Scope;
use crate::AppState;
use axum::extract::{ConnectInfo, Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_PATH: &str = "data/threat-feed.json";

const MAX_ITEMS: usize = 50;
const MAX_SOURCE_CHARS: usize = 100;
const DEFAULT_SOURCE: &str = "N8N";
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const API_TOKEN_HEADER: &str = "x-api-token";

/// Ingest-side item shape; only `text` is required.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingItem {
    pub text: Option<String>,
    pub severity: Option<String>,
    pub source: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct ThreatFeedStore {
    path: PathBuf,
    items: Mutex<Vec<ThreatFeedItem>>,
    demo_enabled: bool,
}

impl ThreatFeedStore {
    pub fn load(path: impl Into<PathBuf>, demo_enabled: bool) -> Self {
        let path = path.into();
        let items = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<ThreatFeedItem>>(&raw) {
                Ok(mut items) => {
                    items.sort_by_key(|i| i.created_at);
                    if items.len() > MAX_ITEMS {
                        items.drain(..items.len() - MAX_ITEMS);
                    }
                    info!(count = items.len(), path = %path.display(), "threat feed loaded");
                    items
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "threat feed file corrupt, starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self { path, items: Mutex::new(items), demo_enabled }
    }

    /// Active items: lazy TTL filter, demo fallback when empty.
    pub fn active(&self) -> Vec<ThreatFeedItem> {
        let now = Utc::now();
        let items = self.items.lock().unwrap();
        let live: Vec<ThreatFeedItem> =
            items.iter().filter(|i| !i.is_expired(now)).cloned().collect();
        if live.is_empty() && self.demo_enabled {
            return demo_items();
        }
        live
    }

    /// Validate, cap and persist a batch. Returns how many were stored.
    pub fn ingest(&self, incoming: Vec<IncomingItem>) -> usize {
        let now = Utc::now();
        let mut accepted = 0;
        let mut items = self.items.lock().unwrap();
        for item in incoming {
            let Some(text) = item.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
                continue;
            };
            let source = item
                .source
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_SOURCE);
            items.push(ThreatFeedItem {
                id: uuid::Uuid::new_v4().to_string(),
                text: truncate_chars(text, RAW_TRUNCATE_CHARS),
                severity: Severity::from_token(item.severity.as_deref()),
                source: truncate_chars(source, MAX_SOURCE_CHARS),
                created_at: now,
                expires_at: item.expires_at,
            });
            accepted += 1;
        }
        if accepted > 0 {
            let overflow = items.len().saturating_sub(MAX_ITEMS);
            if overflow > 0 {
                items.drain(..overflow); // oldest first
            }
            persist(&self.path, &items);
        }
        accepted
    }

    /// Remove by id. Persists only when something was removed.
    pub fn remove(&self, id: &str) -> bool {
        let mut items = self.items.lock().unwrap();
        let before = items.len();
        items.retain(|i| i.id != id);
        let removed = items.len() != before;
        if removed {
            persist(&self.path, &items);
        }
        removed
    }

    /// Drop expired items from memory and disk; returns how many went.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut items = self.items.lock().unwrap();
        let before = items.len();
        items.retain(|i| !i.is_expired(now));
        let removed = before - items.len();
        if removed > 0 {
            persist(&self.path, &items);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

fn persist(path: &Path, items: &[ThreatFeedItem]) {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    match serde_json::to_string_pretty(items) {
        Ok(raw) => {
            if let Err(e) = std::fs::write(path, raw) {
                warn!(path = %path.display(), error = %e, "threat feed persist failed");
            }
        }
        Err(e) => warn!(error = %e, "threat feed serialize failed"),
    }
}

/// Placeholder advisories so a fresh dashboard never renders an empty
/// panel. Ids are stable so clients can key on them.
fn demo_items() -> Vec<ThreatFeedItem> {
    let now = Utc::now();
    let demo = |id: &str, text: &str, severity| ThreatFeedItem {
        id: id.to_string(),
        text: text.to_string(),
        severity,
        source: "ThreatMap".to_string(),
        created_at: now,
        expires_at: None,
    };
    vec![
        demo("demo-1", "Botnet command-and-control activity observed across EU address space", Severity::High),
        demo("demo-2", "Credential-stuffing wave targeting exposed management interfaces", Severity::Medium),
        demo("demo-3", "Mass scanning for recently disclosed VPN gateway vulnerability", Severity::Critical),
    ]
}

// ── HTTP handlers ────────────────────────────────────────────────────

pub async fn get_feed(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if !state.allow(Scope::Api, addr.ip()) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    Json(state.feed.active()).into_response()
}

pub async fn ingest_feed(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if !state.allow(Scope::ThreatFeed, addr.ip()) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    let Some(expected) = state.config.threat_feed_api_key.as_deref() else {
        // No key configured means ingest is not in service, not forbidden.
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    if !token_matches(&headers, expected) {
        warn!(target: "security", ip = %addr.ip(), "threat feed ingest rejected: bad token");
        crate::metrics::PipelineMetrics::incr(&state.metrics.auth_failures);
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let incoming = parse_incoming(body);
    let accepted = state.feed.ingest(incoming);
    if accepted == 0 {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "no valid items" })))
            .into_response();
    }
    info!(accepted, total = state.feed.len(), "threat feed ingested");
    state.bus.publish_threat_feed(state.feed.active());
    (StatusCode::OK, Json(json!({ "accepted": accepted }))).into_response()
}

pub async fn delete_feed(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    if !state.allow(Scope::ThreatFeed, addr.ip()) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    if state.sessions.identity(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if !state.feed.remove(&id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    info!(id = %id, "threat feed item deleted");
    state.bus.publish_threat_feed(state.feed.active());
    StatusCode::OK.into_response()
}

/// Body is a single item or an array; elements that fail to parse are
/// skipped rather than failing the batch.
fn parse_incoming(body: serde_json::Value) -> Vec<IncomingItem> {
    match body {
        serde_json::Value::Array(values) => values
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect(),
        single => serde_json::from_value(single).into_iter().collect(),
    }
}

fn token_matches(headers: &HeaderMap, expected: &str) -> bool {
    let Some(provided) = headers.get(API_TOKEN_HEADER).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Periodic expiry so the persisted file does not accumulate corpses.
pub async fn sweeper(state: AppState, cancel: CancellationToken) {
    let mut iv = tokio::time::interval(SWEEP_INTERVAL);
    iv.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = iv.tick() => {
                let removed = state.feed.sweep_expired();
                if removed > 0 {
                    info!(removed, "expired threat feed items swept");
                    state.bus.publish_threat_feed(state.feed.active());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn incoming(text: &str) -> IncomingItem {
        IncomingItem { text: Some(text.into()), severity: None, source: None, expires_at: None }
    }

    fn store(dir: &tempfile::TempDir, demo: bool) -> ThreatFeedStore {
        ThreatFeedStore::load(dir.path().join("feed.json"), demo)
    }

    #[test]
    fn missing_and_corrupt_files_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(&dir, false).is_empty());

        std::fs::write(dir.path().join("feed.json"), "{not json").unwrap();
        assert!(store(&dir, false).is_empty());
    }

    #[test]
    fn ingest_defaults_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir, false);
        let accepted = s.ingest(vec![IncomingItem {
            text: Some("z".repeat(800)),
            severity: Some("bogus".into()),
            source: Some("w".repeat(300)),
            expires_at: None,
        }]);
        assert_eq!(accepted, 1);
        let items = s.active();
        assert_eq!(items[0].text.chars().count(), RAW_TRUNCATE_CHARS);
        assert_eq!(items[0].severity, Severity::Medium);
        assert_eq!(items[0].source.chars().count(), MAX_SOURCE_CHARS);
    }

    #[test]
    fn items_without_text_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir, false);
        let accepted = s.ingest(vec![
            IncomingItem { text: None, severity: None, source: None, expires_at: None },
            IncomingItem { text: Some("  ".into()), severity: None, source: None, expires_at: None },
            incoming("real advisory"),
        ]);
        assert_eq!(accepted, 1);
    }

    #[test]
    fn cap_evicts_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir, false);
        for i in 0..MAX_ITEMS + 1 {
            s.ingest(vec![incoming(&format!("advisory {i}"))]);
        }
        assert_eq!(s.len(), MAX_ITEMS);
        let texts: Vec<String> = s.active().iter().map(|i| i.text.clone()).collect();
        assert!(!texts.contains(&"advisory 0".to_string()), "oldest evicted");
        assert!(texts.contains(&format!("advisory {MAX_ITEMS}")));
    }

    #[test]
    fn concurrent_ingest_of_51_items_yields_exactly_50() {
        let dir = tempfile::tempdir().unwrap();
        let s = Arc::new(store(&dir, false));
        let handles: Vec<_> = (0..51)
            .map(|i| {
                let s = s.clone();
                std::thread::spawn(move || s.ingest(vec![incoming(&format!("item {i}"))]))
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 1);
        }
        assert_eq!(s.len(), MAX_ITEMS);
    }

    #[test]
    fn expired_items_are_filtered_and_demo_fallback_kicks_in() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir, true);
        s.ingest(vec![IncomingItem {
            text: Some("already gone".into()),
            severity: None,
            source: None,
            expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
        }]);
        assert_eq!(s.len(), 1, "expired item is stored");
        let active = s.active();
        assert_eq!(active.len(), 3, "demo fallback served");
        assert!(active.iter().all(|i| i.id.starts_with("demo-")));
    }

    #[test]
    fn demo_fallback_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir, false);
        assert!(s.active().is_empty());
    }

    #[test]
    fn restart_preserves_the_active_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        let first = ThreatFeedStore::load(&path, false);
        first.ingest(vec![incoming("survives restart")]);
        let id = first.active()[0].id.clone();

        let second = ThreatFeedStore::load(&path, false);
        let active = second.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, id);
        assert_eq!(active[0].text, "survives restart");
    }

    #[test]
    fn delete_persists_the_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        let s = ThreatFeedStore::load(&path, false);
        s.ingest(vec![incoming("a"), incoming("b")]);
        let id = s.active()[0].id.clone();

        assert!(s.remove(&id));
        assert!(!s.remove(&id), "second delete is a miss");
        assert!(!s.remove("no-such-id"));

        let reloaded = ThreatFeedStore::load(&path, false);
        assert!(reloaded.active().iter().all(|i| i.id != id));
    }

    #[test]
    fn sweep_drops_expired_from_disk_too() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        let s = ThreatFeedStore::load(&path, false);
        s.ingest(vec![
            IncomingItem {
                text: Some("stale".into()),
                severity: None,
                source: None,
                expires_at: Some(Utc::now() - chrono::Duration::seconds(5)),
            },
            incoming("fresh"),
        ]);
        assert_eq!(s.sweep_expired(), 1);
        assert_eq!(s.len(), 1);
        let reloaded = ThreatFeedStore::load(&path, false);
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn incoming_accepts_single_object_or_array() {
        let single = parse_incoming(json!({ "text": "one" }));
        assert_eq!(single.len(), 1);
        let many = parse_incoming(json!([
            { "text": "one" },
            { "text": "two", "severity": "high" },
            42,
        ]));
        assert_eq!(many.len(), 2, "non-object elements are skipped");
    }

    #[test]
    fn token_comparison_requires_exact_match() {
        let mut headers = HeaderMap::new();
        assert!(!token_matches(&headers, "secret"));
        headers.insert(API_TOKEN_HEADER, "wrong".parse().unwrap());
        assert!(!token_matches(&headers, "secret"));
        headers.insert(API_TOKEN_HEADER, "secret".parse().unwrap());
        assert!(token_matches(&headers, "secret"));
    }
}
