//! Attack broadcaster: time/size batching of enriched events into a
//! single frame fanned out to every open WebSocket client.
//!
//! The frame is serialized exactly once per flush. Serializing per
//! client is a demonstrated bottleneck at burst rates and is not done
//! here under any path.

use crate::bus::EventBus;
use crate::metrics::PipelineMetrics;
use crate::model::{EnrichedEvent, EnrichedEventWire};
use crate::ws::ClientRegistry;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
const MAX_BATCH: usize = 50;
const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct BatchFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    count: usize,
    events: Vec<EnrichedEventWire>,
}

/// Serialize one batch frame. `count` always equals `events.len()`.
pub fn encode_batch(pending: &[Arc<EnrichedEvent>]) -> String {
    let events: Vec<EnrichedEventWire> =
        pending.iter().map(|e| EnrichedEventWire::from(e.as_ref())).collect();
    let frame = BatchFrame { kind: "batch", count: events.len(), events };
    serde_json::to_string(&frame)
        .unwrap_or_else(|_| r#"{"type":"batch","count":0,"events":[]}"#.to_string())
}

/// Subscribes to `enriched`; flushes every 100 ms or at 50 queued
/// events, whichever comes first. Cancellation flushes the remainder —
/// skipping that would drop the final batch.
pub async fn run(
    bus: Arc<EventBus>,
    registry: Arc<ClientRegistry>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
) {
    let mut rx = bus.subscribe_enriched();
    let mut pending: Vec<Arc<EnrichedEvent>> = Vec::with_capacity(MAX_BATCH);
    let mut flush_iv = tokio::time::interval(FLUSH_INTERVAL);
    let mut stats_iv = tokio::time::interval(STATS_INTERVAL);
    let mut window_events = 0u64;
    let mut window_batches = 0u64;
    info!("attack broadcaster started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                flush(&mut pending, &registry, &metrics, &mut window_events, &mut window_batches);
                return;
            }
            recv = rx.recv() => match recv {
                Ok(event) => {
                    pending.push(event);
                    if pending.len() >= MAX_BATCH {
                        flush(&mut pending, &registry, &metrics, &mut window_events, &mut window_batches);
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(lost = n, "broadcaster lagged behind enrichment");
                }
                Err(RecvError::Closed) => {
                    flush(&mut pending, &registry, &metrics, &mut window_events, &mut window_batches);
                    return;
                }
            },
            _ = flush_iv.tick() => {
                flush(&mut pending, &registry, &metrics, &mut window_events, &mut window_batches);
            }
            _ = stats_iv.tick() => {
                info!(
                    events = window_events,
                    batches = window_batches,
                    events_per_sec = window_events / STATS_INTERVAL.as_secs(),
                    clients = registry.len(),
                    "broadcast_stats"
                );
                window_events = 0;
                window_batches = 0;
            }
        }
    }
}

fn flush(
    pending: &mut Vec<Arc<EnrichedEvent>>,
    registry: &ClientRegistry,
    metrics: &PipelineMetrics,
    window_events: &mut u64,
    window_batches: &mut u64,
) {
    if pending.is_empty() {
        return;
    }
    // Events are counted even with nobody connected; the serialization
    // work is skipped.
    if !registry.is_empty() {
        let frame = encode_batch(pending);
        registry.broadcast_text(&frame);
    }
    metrics.broadcast_events.fetch_add(pending.len() as u64, Ordering::Relaxed);
    PipelineMetrics::incr(&metrics.broadcast_batches);
    *window_events += pending.len() as u64;
    *window_batches += 1;
    pending.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DenyAction, GeoData, ParsedEvent, ThreatType};
    use chrono::Utc;

    fn enriched(src: &str) -> EnrichedEvent {
        EnrichedEvent {
            event: ParsedEvent {
                timestamp: Utc::now(),
                source_ip: Some(src.into()),
                destination_ip: Some("203.0.113.50".into()),
                destination_port: Some(443),
                service: Some("tcp".into()),
                threat_type: ThreatType::Malware,
                action: DenyAction::Deny,
                raw: String::new(),
            },
            geo: Some(GeoData {
                latitude: 48.8,
                longitude: 2.3,
                city: Some("Paris".into()),
                country_iso2: Some("FR".into()),
                country_name: Some("France".into()),
            }),
            is_target: true,
            enrichment_time_ms: 1,
            enrichment_error: None,
        }
    }

    #[test]
    fn batch_frame_count_matches_events() {
        let pending: Vec<Arc<EnrichedEvent>> =
            (0..7).map(|i| Arc::new(enriched(&format!("192.0.2.{i}")))).collect();
        let v: serde_json::Value = serde_json::from_str(&encode_batch(&pending)).unwrap();
        assert_eq!(v["type"], "batch");
        assert_eq!(v["count"], 7);
        assert_eq!(v["events"].as_array().unwrap().len(), 7);
        let first = &v["events"][0];
        assert_eq!(first["sourceIP"], "192.0.2.0");
        assert_eq!(first["geo"]["country_code"], "FR");
        assert_eq!(first["attack"]["threat_type"], "malware");
    }

    #[tokio::test]
    async fn sixty_events_split_into_fifty_then_ten() {
        use crate::ws::{ClientHandle, Identity};
        use axum::extract::ws::Message;
        use std::sync::atomic::AtomicBool;
        use uuid::Uuid;

        let bus = Arc::new(EventBus::new());
        let metrics = PipelineMetrics::new();
        let registry = ClientRegistry::new(metrics.clone());
        let (tx, mut client_rx) = tokio::sync::mpsc::channel(64);
        registry.insert(
            Uuid::new_v4(),
            ClientHandle {
                identity: Identity::Anonymous(Uuid::new_v4()),
                is_alive: Arc::new(AtomicBool::new(true)),
                tx,
                cancel: CancellationToken::new(),
            },
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(bus.clone(), registry.clone(), metrics.clone(), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 0..60 {
            bus.publish_enriched(enriched(&format!("198.51.100.{}", i % 250)));
        }

        let first = match client_rx.recv().await.unwrap() {
            Message::Text(t) => serde_json::from_str::<serde_json::Value>(&t).unwrap(),
            other => panic!("expected text, got {other:?}"),
        };
        assert_eq!(first["count"], 50, "size trigger flushes immediately");

        let second = match client_rx.recv().await.unwrap() {
            Message::Text(t) => serde_json::from_str::<serde_json::Value>(&t).unwrap(),
            other => panic!("expected text, got {other:?}"),
        };
        assert_eq!(second["count"], 10, "remainder flushes on the interval");

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(metrics.broadcast_events.load(Ordering::Relaxed), 60);
        assert_eq!(metrics.broadcast_batches.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn shutdown_flushes_the_final_partial_batch() {
        use crate::ws::{ClientHandle, Identity};
        use axum::extract::ws::Message;
        use std::sync::atomic::AtomicBool;
        use uuid::Uuid;

        let bus = Arc::new(EventBus::new());
        let metrics = PipelineMetrics::new();
        let registry = ClientRegistry::new(metrics.clone());
        let (tx, mut client_rx) = tokio::sync::mpsc::channel(8);
        registry.insert(
            Uuid::new_v4(),
            ClientHandle {
                identity: Identity::Anonymous(Uuid::new_v4()),
                is_alive: Arc::new(AtomicBool::new(true)),
                tx,
                cancel: CancellationToken::new(),
            },
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(bus.clone(), registry, metrics, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 0..3 {
            bus.publish_enriched(enriched(&format!("192.0.2.{i}")));
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        task.await.unwrap();

        let frame = match client_rx.recv().await.unwrap() {
            Message::Text(t) => serde_json::from_str::<serde_json::Value>(&t).unwrap(),
            other => panic!("expected text, got {other:?}"),
        };
        assert_eq!(frame["count"], 3);
    }
}
