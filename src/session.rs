//! Cookie sessions and per-IP rate limiting.
//!
//! The session store sits behind a trait so a shared store can replace
//! the in-process map if more than one instance is ever deployed.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "threatmap_session";
const SESSION_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

pub trait SessionStore: Send + Sync + 'static {
    fn create(&self, user_id: &str) -> String;
    fn get(&self, token: &str) -> Option<Session>;
    fn destroy(&self, token: &str);
}

/// Default in-process store. Sessions die with the process, which is
/// acceptable for a single admin identity.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, Session>,
}

impl SessionStore for MemorySessionStore {
    fn create(&self, user_id: &str) -> String {
        let token = Uuid::new_v4().to_string();
        self.sessions.insert(
            token.clone(),
            Session { user_id: user_id.to_string(), created_at: Utc::now() },
        );
        token
    }

    fn get(&self, token: &str) -> Option<Session> {
        let expired = {
            let entry = self.sessions.get(token)?;
            Utc::now() - entry.created_at > ChronoDuration::hours(SESSION_TTL_HOURS)
        };
        if expired {
            self.sessions.remove(token);
            return None;
        }
        self.sessions.get(token).map(|e| e.value().clone())
    }

    fn destroy(&self, token: &str) {
        self.sessions.remove(token);
    }
}

pub struct SessionManager {
    store: Box<dyn SessionStore>,
    secure_cookies: bool,
}

impl SessionManager {
    pub fn new(store: impl SessionStore, secure_cookies: bool) -> Self {
        Self { store: Box::new(store), secure_cookies }
    }

    /// Attach identity from the request's cookie, if any.
    pub fn identity(&self, headers: &HeaderMap) -> Option<Session> {
        let token = cookie_value(headers, SESSION_COOKIE)?;
        self.store.get(&token)
    }

    /// Create a session and return the `Set-Cookie` header value.
    pub fn login(&self, user_id: &str) -> String {
        let token = self.store.create(user_id);
        info!(target: "security", user = user_id, "session created");
        self.set_cookie(&token, None)
    }

    /// Destroy the request's session; returns the clearing cookie.
    pub fn logout(&self, headers: &HeaderMap) -> String {
        if let Some(token) = cookie_value(headers, SESSION_COOKIE) {
            self.store.destroy(&token);
        }
        self.set_cookie("", Some(0))
    }

    fn set_cookie(&self, token: &str, max_age: Option<u32>) -> String {
        let mut cookie = format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax");
        if let Some(age) = max_age {
            cookie.push_str(&format!("; Max-Age={age}"));
        }
        if self.secure_cookies {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

// ── Rate limiting ────────────────────────────────────────────────────

/// Fixed-window limits, keyed strictly by client IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Login,
    PasswordChange,
    Api,
    ThreatFeed,
}

impl Scope {
    fn limit(self) -> (u32, Duration) {
        match self {
            Self::Login => (5, Duration::from_secs(15 * 60)),
            Self::PasswordChange => (3, Duration::from_secs(60 * 60)),
            Self::Api => (100, Duration::from_secs(60)),
            Self::ThreatFeed => (10, Duration::from_secs(60)),
        }
    }
}

struct WindowEntry {
    count: u32,
    window_start: Instant,
}

#[derive(Default)]
pub struct RateLimiter {
    windows: DashMap<(Scope, IpAddr), WindowEntry>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the caller is over the scope's limit; each
    /// rejection lands in the security log.
    pub fn check(&self, scope: Scope, ip: IpAddr) -> bool {
        let (max, window) = scope.limit();
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry((scope, ip))
            .or_insert(WindowEntry { count: 0, window_start: now });
        if now.duration_since(entry.window_start) > window {
            entry.count = 1;
            entry.window_start = now;
            return true;
        }
        if entry.count < max {
            entry.count += 1;
            return true;
        }
        warn!(target: "security", ip = %ip, scope = ?scope, "rate limit exceeded");
        false
    }

    /// Drops windows that have been idle for two full periods.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.windows
            .retain(|(scope, _), e| now.duration_since(e.window_start) < scope.limit().1 * 2);
    }
}

/// Periodic eviction so abandoned windows do not accumulate.
pub async fn sweeper(limiter: std::sync::Arc<RateLimiter>, cancel: CancellationToken) {
    let mut iv = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = iv.tick() => limiter.sweep(),
        }
    }
}
