//! Enrichment pipeline: geolocation plus the owned-infrastructure flag.
//!
//! Exactly one `EnrichedEvent` leaves this stage for every `ParsedEvent`
//! that enters it, including on internal failure — the dashboard must
//! never lose an attack because a lookup went sideways.

use crate::bus::{EnrichmentError, EventBus, LatencyExceeded};
use crate::geo::GeoResolver;
use crate::metrics::PipelineMetrics;
use crate::model::{EnrichedEvent, ParsedEvent};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// End-to-end budget for a single event; beyond this the live display
/// is visibly stale.
const LATENCY_BUDGET_MS: u32 = 5_000;

/// Destination-in-our-ranges check. Empty range set or absent
/// destination is simply not a target.
pub fn is_target(destination_ip: Option<&str>, ranges: &[Ipv4Net]) -> bool {
    if ranges.is_empty() {
        return false;
    }
    let Some(ip) = destination_ip.and_then(|d| d.parse::<Ipv4Addr>().ok()) else {
        return false;
    };
    ranges.iter().any(|net| net.contains(&ip))
}

/// Enrich one event. Infallible: failures are folded into the output.
pub fn enrich(parsed: &ParsedEvent, geo: &GeoResolver, ranges: &[Ipv4Net]) -> EnrichedEvent {
    let started = Instant::now();
    let target = is_target(parsed.destination_ip.as_deref(), ranges);
    let (geo_data, error) = match parsed.source_ip.as_deref() {
        None => (None, None),
        Some(src) => match geo.get(src) {
            Ok(found) => (found, None),
            Err(e) => (None, Some(e.to_string())),
        },
    };
    EnrichedEvent {
        event: parsed.clone(),
        geo: geo_data,
        is_target: target,
        enrichment_time_ms: started.elapsed().as_millis().min(u32::MAX as u128) as u32,
        enrichment_error: error,
    }
}

/// Subscribes to `parsed`, publishes `enriched` for every input.
pub async fn run(
    bus: Arc<EventBus>,
    geo: Arc<GeoResolver>,
    ranges: Arc<Vec<Ipv4Net>>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
) {
    let mut rx = bus.subscribe_parsed();
    info!(ranges = ranges.len(), "enrichment pipeline started");
    loop {
        let parsed: Arc<ParsedEvent> = tokio::select! {
            _ = cancel.cancelled() => return,
            recv = rx.recv() => match recv {
                Ok(p) => p,
                Err(RecvError::Lagged(n)) => {
                    warn!(lost = n, "enrichment lagged behind parser");
                    continue;
                }
                Err(RecvError::Closed) => return,
            },
        };
        let enriched = enrich(&parsed, &geo, &ranges);
        PipelineMetrics::incr(&metrics.enriched);
        if let Some(error) = &enriched.enrichment_error {
            PipelineMetrics::incr(&metrics.enrichment_errors);
            bus.publish_enrichment_error(EnrichmentError { message: Arc::from(error.as_str()) });
        }
        if enriched.enrichment_time_ms > LATENCY_BUDGET_MS {
            PipelineMetrics::incr(&metrics.latency_exceeded);
            warn!(
                elapsed_ms = enriched.enrichment_time_ms,
                src = enriched.event.source_ip.as_deref().unwrap_or("-"),
                "enrichment latency budget exceeded"
            );
            bus.publish_latency_exceeded(LatencyExceeded {
                elapsed_ms: enriched.enrichment_time_ms,
                source_ip: enriched.event.source_ip.clone(),
            });
        }
        bus.publish_enriched(enriched);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DenyAction, ThreatType};
    use chrono::Utc;

    fn parsed(src: Option<&str>, dst: Option<&str>) -> ParsedEvent {
        ParsedEvent {
            timestamp: Utc::now(),
            source_ip: src.map(String::from),
            destination_ip: dst.map(String::from),
            destination_port: None,
            service: None,
            threat_type: ThreatType::Unknown,
            action: DenyAction::Deny,
            raw: String::new(),
        }
    }

    fn ranges(specs: &[&str]) -> Vec<Ipv4Net> {
        specs.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn target_flag_follows_destination_membership() {
        let nets = ranges(&["203.0.113.0/24", "10.10.0.0/16"]);
        assert!(is_target(Some("203.0.113.50"), &nets));
        assert!(is_target(Some("10.10.255.1"), &nets));
        assert!(!is_target(Some("198.51.100.1"), &nets));
        assert!(!is_target(None, &nets));
        assert!(!is_target(Some("203.0.113.50"), &[]));
        assert!(!is_target(Some("not-an-ip"), &nets));
    }

    #[test]
    fn enrichment_always_produces_an_event() {
        // GeoResolver with no database: get() errors with NotReady, and
        // the event must still come out with the error folded in.
        let geo = GeoResolver::new();
        let nets = ranges(&["203.0.113.0/24"]);
        let out = enrich(&parsed(Some("8.8.8.8"), Some("203.0.113.50")), &geo, &nets);
        assert!(out.geo.is_none());
        assert!(out.is_target, "target flag computed despite geo failure");
        assert!(out.enrichment_error.is_some());
    }

    #[test]
    fn absent_source_skips_lookup_without_error() {
        let geo = GeoResolver::new();
        let out = enrich(&parsed(None, None), &geo, &[]);
        assert!(out.geo.is_none());
        assert!(out.enrichment_error.is_none());
        assert!(!out.is_target);
    }

    #[tokio::test]
    async fn one_enriched_per_parsed() {
        let bus = Arc::new(EventBus::new());
        let geo = GeoResolver::new();
        let metrics = PipelineMetrics::new();
        let cancel = CancellationToken::new();
        let mut enriched_rx = bus.subscribe_enriched();

        let task = tokio::spawn(run(
            bus.clone(),
            geo,
            Arc::new(Vec::new()),
            metrics,
            cancel.clone(),
        ));
        // Let the pipeline task reach its subscription before publishing.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        for i in 0..10 {
            bus.publish_parsed(parsed(Some(&format!("192.0.2.{i}")), None));
        }
        for i in 0..10 {
            let got = enriched_rx.recv().await.unwrap();
            assert_eq!(got.event.source_ip.as_deref(), Some(format!("192.0.2.{i}").as_str()));
        }
        cancel.cancel();
        task.await.unwrap();
    }
}
