//! Syslog message parser: tolerant RFC 5424 + Palo Alto CSV extraction
//! with a deny-only filter.
//!
//! Extraction is layered; the first strategy to produce a field wins:
//!   1. RFC 5424 structured-data blocks `[id k="v" ...]`
//!   2. free-form `key=value` pairs anywhere in the message
//!   3. Palo Alto CSV positional columns
//!
//! The parser never panics on any input. ALLOW-class traffic is discarded
//! here, before it can reach the geo cache.

use crate::bus::EventBus;
use crate::metrics::PipelineMetrics;
use crate::model::{DenyAction, ParsedEvent, ParseFailure, RawMessage, ThreatType};
use chrono::Utc;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// Palo Alto THREAT log columns (PAN-OS 10.x layout).
const CSV_MIN_FIELDS: usize = 31;
const CSV_SRC: usize = 7;
const CSV_DST: usize = 8;
const CSV_ACTION: usize = 30;
const CSV_THREAT: usize = 33;

/// What the parser concluded about one message.
#[derive(Debug)]
pub enum Outcome {
    /// A deny event was extracted.
    Event(ParsedEvent),
    /// Recognized traffic outside the deny set, or fields without an
    /// action. Noise; dropped silently.
    Filtered,
    /// Non-empty input from which no strategy extracted anything.
    Failure(String),
    /// Nothing left after escape normalization.
    Empty,
}

#[derive(Debug)]
pub struct Extraction {
    pub outcome: Outcome,
    /// A CSV row cleared the field-count bar but carried no action —
    /// the calibration signal for column drift across PAN-OS versions.
    pub csv_missing_action: bool,
}

#[derive(Debug, Default)]
struct Fields {
    src: Option<String>,
    dst: Option<String>,
    action: Option<String>,
    threat: Option<String>,
    dport: Option<String>,
    proto: Option<String>,
}

impl Fields {
    fn any(&self) -> bool {
        self.src.is_some() || self.dst.is_some() || self.action.is_some()
    }

    fn fill(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            return;
        }
        let slot = match key {
            "src" => &mut self.src,
            "dst" => &mut self.dst,
            "action" => &mut self.action,
            "threat_type" => &mut self.threat,
            "dport" => &mut self.dport,
            "proto" => &mut self.proto,
            _ => return,
        };
        if slot.is_none() {
            *slot = Some(value.to_string());
        }
    }
}

/// Parse one message. Infallible by construction.
pub fn extract(raw: &str) -> Extraction {
    let normalized = normalize(raw);
    if normalized.is_empty() {
        return Extraction { outcome: Outcome::Empty, csv_missing_action: false };
    }

    let mut fields = Fields::default();
    extract_structured_data(&normalized, &mut fields);
    extract_key_values(&normalized, &mut fields);
    let csv_missing_action = extract_csv(&normalized, &mut fields);

    if !fields.any() {
        return Extraction {
            outcome: Outcome::Failure("no extractable fields in message".into()),
            csv_missing_action,
        };
    }

    let Some(action) = fields.action.as_deref().and_then(DenyAction::from_token) else {
        return Extraction { outcome: Outcome::Filtered, csv_missing_action };
    };

    let event = ParsedEvent {
        timestamp: Utc::now(),
        source_ip: fields.src.filter(|s| is_valid_ipv4(s)),
        destination_ip: fields.dst.filter(|s| is_valid_ipv4(s)),
        destination_port: fields.dport.and_then(|p| p.parse::<u16>().ok()),
        service: fields.proto,
        threat_type: ThreatType::classify(fields.threat.as_deref()),
        action,
        raw: normalized,
    };
    Extraction { outcome: Outcome::Event(event), csv_missing_action }
}

/// Undo the common syslog-relay escape: `#012` and literal newlines
/// become single spaces.
fn normalize(raw: &str) -> String {
    raw.replace("#012", " ").replace(['\n', '\r'], " ").trim().to_string()
}

/// Strict IPv4 dotted-decimal. `Ipv4Addr::from_str` already rejects
/// ports, IPv6, out-of-range octets and leading zeros.
pub fn is_valid_ipv4(s: &str) -> bool {
    s.parse::<Ipv4Addr>().is_ok()
}

// ── Strategy 1: RFC 5424 structured data ─────────────────────────────

fn extract_structured_data(msg: &str, fields: &mut Fields) {
    let mut rest = msg;
    while let Some(open) = rest.find('[') {
        let Some(close_rel) = rest[open + 1..].find(']') else { break };
        let block = &rest[open + 1..open + 1 + close_rel];
        parse_sd_block(block, fields);
        rest = &rest[open + 1 + close_rel + 1..];
    }
}

/// `pan@0 src="1.2.3.4" dst=5.6.7.8 ...` — the sd-id is the first
/// space-delimited token; the remainder is k=v pairs, values optionally
/// double-quoted (quoted values may contain spaces).
fn parse_sd_block(block: &str, fields: &mut Fields) {
    let body = match block.find(' ') {
        Some(idx) => &block[idx + 1..],
        None => return, // sd-id with no params
    };
    let mut pos = 0;
    while pos < body.len() {
        let Some(eq_rel) = body[pos..].find('=') else { break };
        let key = body[pos..pos + eq_rel].trim();
        let val_start = pos + eq_rel + 1;
        if val_start >= body.len() {
            break;
        }
        let (value, next) = if body[val_start..].starts_with('"') {
            match body[val_start + 1..].find('"') {
                Some(q) => (&body[val_start + 1..val_start + 1 + q], val_start + q + 2),
                None => (&body[val_start + 1..], body.len()),
            }
        } else {
            match body[val_start..].find(' ') {
                Some(sp) => (&body[val_start..val_start + sp], val_start + sp + 1),
                None => (&body[val_start..], body.len()),
            }
        };
        fields.fill(key, value);
        pos = next;
    }
}

// ── Strategy 2: free-form key=value ──────────────────────────────────

fn extract_key_values(msg: &str, fields: &mut Fields) {
    for token in msg.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else { continue };
        let value = value.trim_matches(['"', '[', ']', ',']);
        fields.fill(key, value);
    }
}

// ── Strategy 3: Palo Alto CSV ────────────────────────────────────────

/// Returns true when a qualifying CSV row carried no action.
fn extract_csv(msg: &str, fields: &mut Fields) -> bool {
    let Some(row) = csv_candidate(msg) else { return false };
    let cols: Vec<&str> = row.split(',').collect();
    if cols.len() < CSV_MIN_FIELDS {
        return false;
    }
    fields.fill("src", cols[CSV_SRC].trim());
    fields.fill("dst", cols[CSV_DST].trim());
    let action = cols[CSV_ACTION].trim();
    if action.is_empty() {
        return fields.action.is_none();
    }
    fields.fill("action", action);
    if let Some(threat) = cols.get(CSV_THREAT) {
        fields.fill("threat_type", threat.trim());
    }
    false
}

/// The CSV body either is the whole message or starts mid-message after
/// the syslog header; it is recognized by a `1,` version prefix at a
/// token boundary.
fn csv_candidate(msg: &str) -> Option<&str> {
    if msg.starts_with("1,") {
        return Some(msg);
    }
    let mut search = 0;
    while let Some(rel) = msg[search..].find("1,") {
        let idx = search + rel;
        if idx > 0 && msg.as_bytes()[idx - 1] == b' ' {
            return Some(&msg[idx..]);
        }
        search = idx + 2;
    }
    None
}

// ── Pipeline task ────────────────────────────────────────────────────

/// Subscribes to `message`, publishes `parsed` or `parse-error`.
pub async fn run(
    bus: Arc<EventBus>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
) {
    let mut rx = bus.subscribe_message();
    info!("parser started");
    loop {
        let msg: Arc<RawMessage> = tokio::select! {
            _ = cancel.cancelled() => return,
            recv = rx.recv() => match recv {
                Ok(msg) => msg,
                Err(RecvError::Lagged(n)) => {
                    warn!(lost = n, "parser lagged behind ingest");
                    continue;
                }
                Err(RecvError::Closed) => return,
            },
        };
        let extraction = extract(&msg.raw);
        if extraction.csv_missing_action {
            PipelineMetrics::incr(&metrics.csv_no_action);
        }
        match extraction.outcome {
            Outcome::Event(mut event) => {
                // The event carries the kernel-side arrival time, not
                // the moment this stage got around to it.
                event.timestamp = msg.received_at;
                PipelineMetrics::incr(&metrics.parsed);
                debug!(
                    action = event.action.as_str(),
                    threat = event.threat_type.as_str(),
                    src = event.source_ip.as_deref().unwrap_or("-"),
                    "parsed"
                );
                bus.publish_parsed(event);
            }
            Outcome::Filtered => PipelineMetrics::incr(&metrics.filtered),
            Outcome::Failure(reason) => {
                PipelineMetrics::incr(&metrics.parse_errors);
                debug!(remote = %msg.remote_addr, reason = %reason, "parse_failure");
                bus.publish_parse_error(ParseFailure::new(reason, &msg.raw));
            }
            Outcome::Empty => {}
        }
    }
}
