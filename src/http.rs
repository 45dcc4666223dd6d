//! HTTP surface: login, settings, logo upload and the static dashboard
//! pages, assembled into the process router together with the WebSocket
//! and threat-feed routes.

use crate::session::Scope;
use crate::{feed, ws, AppState};
use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const MAX_LOGO_BYTES: usize = 5 * 1024 * 1024;
const UPLOADS_DIR: &str = "public/uploads";
const LOGO_STEM: &str = "custom-logo";
const MAX_ARCS_RANGE: std::ops::RangeInclusive<i64> = 1..=50;

// ── Settings ─────────────────────────────────────────────────────────

/// Merge-written JSON settings document, persisted best-effort.
pub struct SettingsStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl SettingsStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<Map<String, Value>>(&raw).ok())
            .unwrap_or_default();
        Self { path, values: Mutex::new(values) }
    }

    pub fn all(&self) -> Value {
        Value::Object(self.values.lock().unwrap().clone())
    }

    /// Merge updates into the document. Validation failures reject the
    /// whole write so the document never holds a half-applied batch.
    pub fn merge(&self, updates: Map<String, Value>) -> Result<(), String> {
        if let Some(arcs) = updates.get("maxArcs") {
            let valid = arcs.as_i64().is_some_and(|n| MAX_ARCS_RANGE.contains(&n));
            if !valid {
                return Err("maxArcs must be an integer between 1 and 50".to_string());
            }
        }
        let mut values = self.values.lock().unwrap();
        for (key, value) in updates {
            values.insert(key, value);
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        if let Err(e) = std::fs::write(&self.path, Value::Object(values.clone()).to_string()) {
            warn!(path = %self.path.display(), error = %e, "settings persist failed");
        }
        Ok(())
    }
}

// ── Password gate ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("current password is incorrect")]
    BadCurrent,
    #[error("password must be at least 8 characters with lower, upper and digit")]
    Policy,
    #[error("failed to persist password hash: {0}")]
    Io(#[from] std::io::Error),
}

/// Login verification: bootstrap plaintext until the first successful
/// change writes a bcrypt hash, bcrypt verify from then on.
pub struct PasswordGate {
    hash_path: PathBuf,
    username: String,
    bootstrap_password: String,
}

impl PasswordGate {
    pub fn new(hash_path: impl Into<PathBuf>, username: String, bootstrap_password: String) -> Self {
        Self { hash_path: hash_path.into(), username, bootstrap_password }
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        use subtle::ConstantTimeEq;
        let user_ok: bool = username.as_bytes().ct_eq(self.username.as_bytes()).into();
        if !user_ok {
            return false;
        }
        match std::fs::read_to_string(&self.hash_path) {
            Ok(hash) => bcrypt::verify(password, hash.trim()).unwrap_or(false),
            Err(_) => password.as_bytes().ct_eq(self.bootstrap_password.as_bytes()).into(),
        }
    }

    pub fn change(&self, current: &str, new: &str) -> Result<(), PasswordError> {
        if !self.verify(&self.username, current) {
            return Err(PasswordError::BadCurrent);
        }
        if !password_meets_policy(new) {
            return Err(PasswordError::Policy);
        }
        let hash = bcrypt::hash(new, bcrypt::DEFAULT_COST)
            .map_err(|e| PasswordError::Io(std::io::Error::other(e)))?;
        if let Some(parent) = self.hash_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        write_private(&self.hash_path, hash.as_bytes())?;
        info!(target: "security", "dashboard password changed");
        Ok(())
    }
}

fn password_meets_policy(password: &str) -> bool {
    password.len() >= 8
        && password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_digit())
}

/// Write with owner-only permissions; the hash must not be world-readable.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        f.write_all(contents)
    }
    #[cfg(not(unix))]
    std::fs::write(path, contents)
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn root_redirect() -> Redirect {
    Redirect::to("/dashboard")
}

async fn dashboard_page() -> Html<String> {
    serve_page("public/dashboard.html", "Threat Map").await
}

async fn login_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if state.sessions.identity(&headers).is_some() {
        return Redirect::to("/admin").into_response();
    }
    serve_page("public/login.html", "Login").await.into_response()
}

async fn admin_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if state.sessions.identity(&headers).is_none() {
        return Redirect::to("/login").into_response();
    }
    serve_page("public/admin.html", "Admin").await.into_response()
}

async fn serve_page(path: &str, title: &str) -> Html<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(body) => Html(body),
        Err(_) => Html(format!(
            "<!doctype html><html><head><title>{title}</title></head>\
             <body><h1>{title}</h1><p>Static asset missing: {path}</p></body></html>"
        )),
    }
}

#[derive(Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<LoginBody>,
) -> Response {
    if !state.allow(Scope::Login, addr.ip()) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    if !state.passwords.verify(&body.username, &body.password) {
        warn!(target: "security", ip = %addr.ip(), "login failed");
        crate::metrics::PipelineMetrics::incr(&state.metrics.auth_failures);
        // Generic message: no username/password distinction to enumerate.
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid credentials" })))
            .into_response();
    }
    let cookie = state.sessions.login(&body.username);
    ([(SET_COOKIE, cookie)], Json(json!({ "success": true }))).into_response()
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let cookie = state.sessions.logout(&headers);
    ([(SET_COOKIE, cookie)], Json(json!({ "success": true }))).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordBody {
    current_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ChangePasswordBody>,
) -> Response {
    if !state.allow(Scope::PasswordChange, addr.ip()) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    if state.sessions.identity(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.passwords.change(&body.current_password, &body.new_password) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(PasswordError::BadCurrent) => {
            warn!(target: "security", ip = %addr.ip(), "password change rejected");
            (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid credentials" })))
                .into_response()
        }
        Err(PasswordError::Policy) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": PasswordError::Policy.to_string() })))
                .into_response()
        }
        // The hash write is the one persistence failure that must surface.
        Err(PasswordError::Io(e)) => {
            warn!(error = %e, "password hash write failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_settings(State(state): State<AppState>) -> Json<Value> {
    Json(state.settings.all())
}

async fn put_settings(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !state.allow(Scope::Api, addr.ip()) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    if state.sessions.identity(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Value::Object(updates) = body else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "expected an object" })))
            .into_response();
    };
    match state.settings.merge(updates) {
        Ok(()) => Json(state.settings.all()).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "error": e }))).into_response(),
    }
}

async fn auth_status(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    match state.sessions.identity(&headers) {
        Some(session) => Json(json!({ "authenticated": true, "userId": session.user_id })),
        None => Json(json!({ "authenticated": false, "userId": null })),
    }
}

// ── Logo ─────────────────────────────────────────────────────────────

const LOGO_TYPES: [(&str, &str); 5] = [
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
    ("image/svg+xml", "svg"),
];

fn logo_extension(mime: &str) -> Option<&'static str> {
    LOGO_TYPES.iter().find(|(m, _)| *m == mime).map(|(_, ext)| *ext)
}

fn current_logo() -> Option<PathBuf> {
    LOGO_TYPES.iter().map(|(_, ext)| PathBuf::from(format!("{UPLOADS_DIR}/{LOGO_STEM}.{ext}")))
        .find(|p| p.exists())
}

/// At most one custom logo exists; any upload removes the previous one
/// whatever its extension was.
fn remove_existing_logos() {
    for (_, ext) in LOGO_TYPES {
        let _ = std::fs::remove_file(format!("{UPLOADS_DIR}/{LOGO_STEM}.{ext}"));
    }
}

async fn get_logo() -> Response {
    match current_logo() {
        Some(path) => {
            let url = format!("/{}", path.display());
            Json(json!({ "logoUrl": url })).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn post_logo(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if !state.allow(Scope::Api, addr.ip()) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    if state.sessions.identity(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    while let Ok(Some(field)) = multipart.next_field().await {
        let Some(mime) = field.content_type().map(str::to_string) else { continue };
        let Some(ext) = logo_extension(&mime) else {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": "unsupported image type" })))
                .into_response();
        };
        let Ok(bytes) = field.bytes().await else {
            return (StatusCode::PAYLOAD_TOO_LARGE, Json(json!({ "error": "upload too large" })))
                .into_response();
        };
        if bytes.len() > MAX_LOGO_BYTES {
            return (StatusCode::PAYLOAD_TOO_LARGE, Json(json!({ "error": "upload too large" })))
                .into_response();
        }
        let _ = std::fs::create_dir_all(UPLOADS_DIR);
        remove_existing_logos();
        let path = format!("{UPLOADS_DIR}/{LOGO_STEM}.{ext}");
        if let Err(e) = std::fs::write(&path, &bytes) {
            warn!(error = %e, "logo write failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        info!(path = %path, size = bytes.len(), "logo uploaded");
        return Json(json!({ "logoUrl": format!("/{path}") })).into_response();
    }
    (StatusCode::BAD_REQUEST, Json(json!({ "error": "no file field" }))).into_response()
}

async fn delete_logo(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if !state.allow(Scope::Api, addr.ip()) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    if state.sessions.identity(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    remove_existing_logos();
    Json(json!({ "success": true })).into_response()
}

// ── Operational endpoints ────────────────────────────────────────────

async fn health() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
struct MetricsResponse {
    // Ingest
    datagrams_received: u64,
    bytes_received: u64,
    recv_errors: u64,
    // Parse
    parsed: u64,
    filtered: u64,
    parse_errors: u64,
    csv_no_action: u64,
    // Enrichment
    enriched: u64,
    enrichment_errors: u64,
    latency_exceeded: u64,
    geo_hits: u64,
    geo_misses: u64,
    geo_hit_rate: f64,
    geo_cache_size: usize,
    // Fan-out
    broadcast_events: u64,
    broadcast_batches: u64,
    ws_clients: usize,
    ws_connected_total: u64,
    ws_terminated_total: u64,
    // Persistence + auth
    dlq_written: u64,
    dlq_dropped: u64,
    rate_limited: u64,
    auth_failures: u64,
    // Feed
    feed_items: usize,
    uptime_s: u64,
}

async fn metrics_endpoint(State(state): State<AppState>) -> Json<MetricsResponse> {
    use std::sync::atomic::Ordering::Relaxed;
    let m = &state.metrics;
    let geo = state.geo.stats();
    Json(MetricsResponse {
        datagrams_received: m.datagrams_received.load(Relaxed),
        bytes_received: m.bytes_received.load(Relaxed),
        recv_errors: m.recv_errors.load(Relaxed),
        parsed: m.parsed.load(Relaxed),
        filtered: m.filtered.load(Relaxed),
        parse_errors: m.parse_errors.load(Relaxed),
        csv_no_action: m.csv_no_action.load(Relaxed),
        enriched: m.enriched.load(Relaxed),
        enrichment_errors: m.enrichment_errors.load(Relaxed),
        latency_exceeded: m.latency_exceeded.load(Relaxed),
        geo_hits: geo.hits,
        geo_misses: geo.misses,
        geo_hit_rate: geo.hit_rate,
        geo_cache_size: geo.size,
        broadcast_events: m.broadcast_events.load(Relaxed),
        broadcast_batches: m.broadcast_batches.load(Relaxed),
        ws_clients: state.registry.len(),
        ws_connected_total: m.ws_connected.load(Relaxed),
        ws_terminated_total: m.ws_terminated.load(Relaxed),
        dlq_written: m.dlq_written.load(Relaxed),
        dlq_dropped: m.dlq_dropped.load(Relaxed),
        rate_limited: m.rate_limited.load(Relaxed),
        auth_failures: m.auth_failures.load(Relaxed),
        feed_items: state.feed.len(),
        uptime_s: state.geo.uptime().as_secs(),
    })
}

// ── Router ───────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_redirect))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/dashboard", get(dashboard_page))
        .route("/login", get(login_page).post(login))
        .route("/logout", post(logout))
        .route("/admin", get(admin_page))
        .route("/ws", get(ws::upgrade))
        .route("/ws/admin", get(ws::upgrade_admin))
        .route("/api/change-password", post(change_password))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route(
            "/api/logo",
            get(get_logo)
                .post(post_logo)
                .delete(delete_logo)
                .layer(DefaultBodyLimit::max(MAX_LOGO_BYTES + 64 * 1024)),
        )
        .route("/api/threat-feed", get(feed::get_feed).post(feed::ingest_feed))
        .route("/api/threat-feed/:id", delete(feed::delete_feed))
        .route("/api/auth/status", get(auth_status))
        .nest_service("/public", ServeDir::new("public"))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(CompressionLayer::new()))
}
