//! Core event records shared across pipeline stages.
//!
//! Every stage hands the next one a value from this module; no stage
//! mutates an event it did not create.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Maximum characters of raw input retained in failures and feed text.
pub const RAW_TRUNCATE_CHARS: usize = 500;

/// One UDP datagram, decoded to text.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub raw: String,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub received_at: DateTime<Utc>,
}

/// Firewall verdicts that are surfaced. Everything else is filtered noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DenyAction {
    Deny,
    Drop,
    Block,
}

impl DenyAction {
    /// Case-insensitive match against the three-value deny set.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "deny" => Some(Self::Deny),
            "drop" => Some(Self::Drop),
            "block" => Some(Self::Block),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deny => "deny",
            Self::Drop => "drop",
            Self::Block => "block",
        }
    }
}

/// Normalized threat category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatType {
    Malware,
    Intrusion,
    Ddos,
    Unknown,
}

impl ThreatType {
    /// Substring classification, case-insensitive, first hit wins.
    pub fn classify(raw: Option<&str>) -> Self {
        let Some(raw) = raw else { return Self::Unknown };
        let lower = raw.to_ascii_lowercase();
        const MALWARE: [&str; 5] = ["malware", "virus", "trojan", "spyware", "url"];
        const INTRUSION: [&str; 4] = ["intrusion", "exploit", "vulnerability", "brute"];
        const DDOS: [&str; 3] = ["ddos", "dos", "flood"];
        if MALWARE.iter().any(|m| lower.contains(m)) {
            Self::Malware
        } else if INTRUSION.iter().any(|m| lower.contains(m)) {
            Self::Intrusion
        } else if DDOS.iter().any(|m| lower.contains(m)) {
            Self::Ddos
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Malware => "malware",
            Self::Intrusion => "intrusion",
            Self::Ddos => "ddos",
            Self::Unknown => "unknown",
        }
    }
}

/// A deny event extracted from one syslog message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedEvent {
    pub timestamp: DateTime<Utc>,
    /// Well-formed IPv4 dotted-decimal, or absent.
    pub source_ip: Option<String>,
    pub destination_ip: Option<String>,
    pub destination_port: Option<u16>,
    pub service: Option<String>,
    pub threat_type: ThreatType,
    pub action: DenyAction,
    pub raw: String,
}

/// A message the parser could not turn into a deny event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseFailure {
    pub error_message: String,
    pub raw_message: String,
    pub timestamp: DateTime<Utc>,
}

impl ParseFailure {
    pub fn new(error_message: impl Into<String>, raw: &str) -> Self {
        Self {
            error_message: error_message.into(),
            raw_message: truncate_chars(raw, RAW_TRUNCATE_CHARS),
            timestamp: Utc::now(),
        }
    }
}

/// Resolved geolocation for a source address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoData {
    pub latitude: f64,
    pub longitude: f64,
    pub city: Option<String>,
    pub country_iso2: Option<String>,
    pub country_name: Option<String>,
}

/// The unit of broadcast: a parsed event plus enrichment.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedEvent {
    #[serde(flatten)]
    pub event: ParsedEvent,
    pub geo: Option<GeoData>,
    pub is_target: bool,
    pub enrichment_time_ms: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrichment_error: Option<String>,
}

/// Advisory severity. Anything unrecognized collapses to `Medium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn from_token(token: Option<&str>) -> Self {
        match token.map(|t| t.to_ascii_lowercase()).as_deref() {
            Some("critical") => Self::Critical,
            Some("high") => Self::High,
            Some("low") => Self::Low,
            _ => Self::Medium,
        }
    }
}

/// One entry in the persistent threat-advisory feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatFeedItem {
    pub id: String,
    pub text: String,
    pub severity: Severity,
    pub source: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ThreatFeedItem {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

// ── Wire shapes ──────────────────────────────────────────────────────
// The dashboard client predates this server; field names and the
// country/country_code duplication are part of its contract.

#[derive(Debug, Clone, Serialize)]
pub struct GeoWire {
    pub latitude: f64,
    pub longitude: f64,
    pub city: Option<String>,
    pub country: Option<String>,
    #[serde(rename = "countryName")]
    pub country_name: Option<String>,
    pub country_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttackWire {
    pub source_ip: Option<String>,
    pub destination_ip: Option<String>,
    pub destination_port: Option<u16>,
    pub service: Option<String>,
    pub threat_type: ThreatType,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichedEventWire {
    pub timestamp: DateTime<Utc>,
    pub geo: Option<GeoWire>,
    #[serde(rename = "sourceIP")]
    pub source_ip: Option<String>,
    #[serde(rename = "destinationIP")]
    pub destination_ip: Option<String>,
    #[serde(rename = "isOCDETarget")]
    pub is_target: bool,
    #[serde(rename = "threatType")]
    pub threat_type: ThreatType,
    pub attack: AttackWire,
}

impl From<&EnrichedEvent> for EnrichedEventWire {
    fn from(e: &EnrichedEvent) -> Self {
        let geo = e.geo.as_ref().map(|g| GeoWire {
            latitude: g.latitude,
            longitude: g.longitude,
            city: g.city.clone(),
            country: g.country_iso2.clone(),
            country_name: g.country_name.clone(),
            country_code: g.country_iso2.clone(),
        });
        Self {
            timestamp: e.event.timestamp,
            geo,
            source_ip: e.event.source_ip.clone(),
            destination_ip: e.event.destination_ip.clone(),
            is_target: e.is_target,
            threat_type: e.event.threat_type,
            attack: AttackWire {
                source_ip: e.event.source_ip.clone(),
                destination_ip: e.event.destination_ip.clone(),
                destination_port: e.event.destination_port,
                service: e.event.service.clone(),
                threat_type: e.event.threat_type,
            },
        }
    }
}

/// Char-boundary-safe truncation.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_set_is_exactly_three_values() {
        assert_eq!(DenyAction::from_token("DENY"), Some(DenyAction::Deny));
        assert_eq!(DenyAction::from_token("Drop"), Some(DenyAction::Drop));
        assert_eq!(DenyAction::from_token("block"), Some(DenyAction::Block));
        for noise in ["allow", "permit", "alert", "reset-both", ""] {
            assert_eq!(DenyAction::from_token(noise), None, "{noise:?} must filter");
        }
    }

    #[test]
    fn threat_classification_first_hit_wins() {
        assert_eq!(ThreatType::classify(Some("Trojan.Win32")), ThreatType::Malware);
        assert_eq!(ThreatType::classify(Some("URL-filtering")), ThreatType::Malware);
        assert_eq!(ThreatType::classify(Some("brute-force")), ThreatType::Intrusion);
        assert_eq!(ThreatType::classify(Some("SYN flood")), ThreatType::Ddos);
        assert_eq!(ThreatType::classify(Some("spyware dos")), ThreatType::Malware);
        assert_eq!(ThreatType::classify(Some("scan")), ThreatType::Unknown);
        assert_eq!(ThreatType::classify(None), ThreatType::Unknown);
    }

    #[test]
    fn parse_failure_truncates_raw() {
        let raw = "x".repeat(2000);
        let f = ParseFailure::new("broken", &raw);
        assert_eq!(f.raw_message.chars().count(), RAW_TRUNCATE_CHARS);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "日本語テキスト";
        assert_eq!(truncate_chars(s, 3), "日本語");
        assert_eq!(truncate_chars("ab", 10), "ab");
    }

    #[test]
    fn severity_defaults_to_medium() {
        assert_eq!(Severity::from_token(Some("critical")), Severity::Critical);
        assert_eq!(Severity::from_token(Some("HIGH")), Severity::High);
        assert_eq!(Severity::from_token(Some("bogus")), Severity::Medium);
        assert_eq!(Severity::from_token(None), Severity::Medium);
    }

    #[test]
    fn expiry_is_inclusive_at_the_boundary() {
        let now = Utc::now();
        let item = ThreatFeedItem {
            id: "a".into(),
            text: "t".into(),
            severity: Severity::Medium,
            source: "N8N".into(),
            created_at: now,
            expires_at: Some(now),
        };
        assert!(item.is_expired(now));
        let mut live = item.clone();
        live.expires_at = Some(now + chrono::Duration::seconds(1));
        assert!(!live.is_expired(now));
        live.expires_at = None;
        assert!(!live.is_expired(now));
    }

    #[test]
    fn wire_duplicates_country_code() {
        let e = EnrichedEvent {
            event: ParsedEvent {
                timestamp: Utc::now(),
                source_ip: Some("203.0.113.9".into()),
                destination_ip: Some("198.51.100.2".into()),
                destination_port: Some(443),
                service: Some("tcp".into()),
                threat_type: ThreatType::Malware,
                action: DenyAction::Deny,
                raw: "raw".into(),
            },
            geo: Some(GeoData {
                latitude: 1.0,
                longitude: 2.0,
                city: Some("Zurich".into()),
                country_iso2: Some("CH".into()),
                country_name: Some("Switzerland".into()),
            }),
            is_target: true,
            enrichment_time_ms: 3,
            enrichment_error: None,
        };
        let wire = EnrichedEventWire::from(&e);
        let json = serde_json::to_value(&wire).unwrap();
        let geo = wire.geo.expect("geo present");
        assert_eq!(geo.country.as_deref(), Some("CH"));
        assert_eq!(geo.country_code.as_deref(), Some("CH"));
        assert_eq!(json["isOCDETarget"], true);
        assert_eq!(json["geo"]["countryName"], "Switzerland");
        assert_eq!(json["attack"]["destination_port"], 443);
    }
}
