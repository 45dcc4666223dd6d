//! Environment configuration, parsed once at startup.
//!
//! Malformed values are configuration-fatal: the caller logs the error and
//! exits 1 rather than running with a half-understood environment.

use anyhow::{bail, Context, Result};
use ipnet::Ipv4Net;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::warn;

const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_SYSLOG_PORT: u16 = 514;
const DEFAULT_BIND: &str = "127.0.0.1";
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_bind: IpAddr,
    pub http_port: u16,
    pub syslog_bind: IpAddr,
    pub syslog_port: u16,
    pub session_secret: Option<String>,
    pub dashboard_username: String,
    /// Bootstrap password only; retired once `data/password.hash` exists.
    pub dashboard_password: String,
    pub ocde_ranges: Vec<Ipv4Net>,
    pub threat_feed_api_key: Option<String>,
    pub threat_feed_demo: bool,
    pub geoip_db_path: PathBuf,
    pub production: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let http_port = parse_port("HTTP_PORT", DEFAULT_HTTP_PORT)?;
        let syslog_port = parse_port("SYSLOG_PORT", DEFAULT_SYSLOG_PORT)?;
        let http_bind = parse_addr("HTTP_BIND_ADDRESS")?;
        let syslog_bind = parse_addr("SYSLOG_BIND_ADDRESS")?;

        let session_secret = std::env::var("SESSION_SECRET").ok().filter(|s| !s.is_empty());
        match &session_secret {
            None => warn!("SESSION_SECRET is unset; sessions will not survive restarts"),
            Some(s) if s.len() < MIN_SECRET_LEN => {
                warn!(len = s.len(), min = MIN_SECRET_LEN, "SESSION_SECRET is short")
            }
            Some(_) => {}
        }

        let ocde_ranges = parse_cidrs(std::env::var("OCDE_IP_RANGES").ok().as_deref())?;

        Ok(Self {
            http_bind,
            http_port,
            syslog_bind,
            syslog_port,
            session_secret,
            dashboard_username: env_or("DASHBOARD_USERNAME", "admin"),
            dashboard_password: env_or("DASHBOARD_PASSWORD", "ChangeMe"),
            ocde_ranges,
            threat_feed_api_key: std::env::var("THREAT_FEED_API_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            threat_feed_demo: env_or("THREAT_FEED_DEMO", "true") != "false",
            geoip_db_path: PathBuf::from(env_or("GEOIP_DB_PATH", "data/GeoLite2-City.mmdb")),
            production: std::env::var("NODE_ENV").as_deref() == Ok("production"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|s| !s.is_empty()).unwrap_or_else(|| default.to_string())
}

fn parse_port(key: &str, default: u16) -> Result<u16> {
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => {
            raw.parse::<u16>().with_context(|| format!("{key}={raw:?} is not a valid port"))
        }
        _ => Ok(default),
    }
}

fn parse_addr(key: &str) -> Result<IpAddr> {
    let raw = env_or(key, DEFAULT_BIND);
    raw.parse::<IpAddr>().with_context(|| format!("{key}={raw:?} is not a valid address"))
}

/// Comma-separated IPv4 CIDR list. A single malformed entry is fatal: a
/// silently dropped range would flip `is_target` to false for real attacks.
fn parse_cidrs(raw: Option<&str>) -> Result<Vec<Ipv4Net>> {
    let Some(raw) = raw else { return Ok(Vec::new()) };
    let mut nets = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.parse::<Ipv4Net>() {
            Ok(net) => nets.push(net),
            Err(e) => bail!("OCDE_IP_RANGES entry {part:?}: {e}"),
        }
    }
    Ok(nets)
}
