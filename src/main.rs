// =============================================================================
// THREATMAP — Firewall Attack Ingestion & Fan-out Server
// =============================================================================
// Cold path: UDP syslog → parse → enrich → bus → WebSocket batches.
// Side paths: parse failures → dead-letter file; threat advisories →
// persistent feed → same sockets. The HTTP surface is thin glue.
// =============================================================================

mod broadcast;
mod bus;
mod config;
mod dlq;
mod enrich;
mod feed;
mod geo;
mod http;
mod metrics;
mod model;
mod parser;
mod session;
mod syslog;
mod ws;

use crate::bus::EventBus;
use crate::config::Config;
use crate::feed::ThreatFeedStore;
use crate::geo::GeoResolver;
use crate::http::{PasswordGate, SettingsStore};
use crate::metrics::PipelineMetrics;
use crate::session::{MemorySessionStore, RateLimiter, SessionManager};
use crate::ws::ClientRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const PASSWORD_HASH_PATH: &str = "data/password.hash";
const SETTINGS_PATH: &str = "data/settings.json";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub bus: Arc<EventBus>,
    pub feed: Arc<ThreatFeedStore>,
    pub sessions: Arc<SessionManager>,
    pub limiter: Arc<RateLimiter>,
    pub registry: Arc<ClientRegistry>,
    pub settings: Arc<SettingsStore>,
    pub passwords: Arc<PasswordGate>,
    pub metrics: Arc<PipelineMetrics>,
    pub geo: Arc<GeoResolver>,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Rate-limit gate; rejections land in the counters as well as the
    /// security log.
    pub fn allow(&self, scope: crate::session::Scope, ip: std::net::IpAddr) -> bool {
        let ok = self.limiter.check(scope, ip);
        if !ok {
            PipelineMetrics::incr(&self.metrics.rate_limited);
        }
        ok
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "threatmap_ingest=info,tower_http=info".into()),
        )
        .json()
        .init();
    info!(version = env!("CARGO_PKG_VERSION"), "ThreatMap ingestion server starting");

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "configuration invalid");
            std::process::exit(1);
        }
    };

    for dir in ["data", "logs", "public/uploads"] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            error!(dir, error = %e, "could not create state directory");
            std::process::exit(1);
        }
    }

    let shutdown = CancellationToken::new();
    let metrics = PipelineMetrics::new();
    let bus = Arc::new(EventBus::new());
    let geo = GeoResolver::new();
    let registry = ClientRegistry::new(metrics.clone());
    let feed_store = Arc::new(ThreatFeedStore::load(feed::DEFAULT_PATH, config.threat_feed_demo));
    let sessions = Arc::new(SessionManager::new(MemorySessionStore::default(), config.production));
    let limiter = Arc::new(RateLimiter::new());
    let settings = Arc::new(SettingsStore::load(SETTINGS_PATH));
    let passwords = Arc::new(PasswordGate::new(
        PASSWORD_HASH_PATH,
        config.dashboard_username.clone(),
        config.dashboard_password.clone(),
    ));

    // Syslog socket first: a privileged-port failure must be a clean
    // startup abort, not a half-started server.
    let syslog_addr = SocketAddr::new(config.syslog_bind, config.syslog_port);
    let syslog_socket = match syslog::bind(syslog_addr) {
        Ok(socket) => socket,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            error!(
                addr = %syslog_addr,
                "permission denied binding syslog port; ports below 1024 need elevated privileges"
            );
            std::process::exit(1);
        }
        Err(e) => {
            error!(addr = %syslog_addr, error = %e, "could not bind syslog socket");
            std::process::exit(1);
        }
    };

    // The city database loads off the runtime; lookups error with
    // NotReady until it lands, and a load failure is fatal.
    {
        let geo = geo.clone();
        let path = PathBuf::from(&config.geoip_db_path);
        tokio::spawn(async move {
            if let Err(e) = geo.load(path.clone()).await {
                error!(path = %path.display(), error = %e, "geo database load failed");
                std::process::exit(1);
            }
        });
    }

    let state = AppState {
        config: config.clone(),
        bus: bus.clone(),
        feed: feed_store.clone(),
        sessions,
        limiter: limiter.clone(),
        registry: registry.clone(),
        settings,
        passwords,
        metrics: metrics.clone(),
        geo: geo.clone(),
        shutdown: shutdown.clone(),
    };

    tokio::spawn(syslog::run(syslog_socket, bus.clone(), metrics.clone(), shutdown.clone()));
    tokio::spawn(parser::run(bus.clone(), metrics.clone(), shutdown.clone()));
    tokio::spawn(enrich::run(
        bus.clone(),
        geo.clone(),
        Arc::new(config.ocde_ranges.clone()),
        metrics.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(dlq::run(
        bus.clone(),
        PathBuf::from(dlq::DEFAULT_PATH),
        metrics.clone(),
        shutdown.clone(),
    ));
    let broadcaster = tokio::spawn(broadcast::run(
        bus.clone(),
        registry.clone(),
        metrics.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(ws::heartbeat(registry.clone(), shutdown.clone()));
    tokio::spawn(ws::feed_forwarder(bus.clone(), registry.clone(), shutdown.clone()));
    tokio::spawn(feed::sweeper(state.clone(), shutdown.clone()));
    tokio::spawn(session::sweeper(limiter.clone(), shutdown.clone()));
    tokio::spawn(metrics::reporter(metrics.clone(), geo.clone(), shutdown.clone()));

    let app = http::router(state);
    let http_addr = SocketAddr::new(config.http_bind, config.http_port);
    let listener = match tokio::net::TcpListener::bind(http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %http_addr, error = %e, "could not bind HTTP listener");
            std::process::exit(1);
        }
    };
    info!(http = %http_addr, syslog = %syslog_addr, "listening");

    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .await
    {
        error!(error = %e, "http server error");
        std::process::exit(1);
    }

    // The token is already cancelled; give the broadcaster its final
    // flush before the process exits.
    shutdown.cancel();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), broadcaster).await;
    info!("shutdown complete");
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                cancel.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = term.recv() => info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("ctrl-c received");
    }
    cancel.cancel();
}
