//! In-process topic broker.
//!
//! One `EventBus` per process, passed by reference to each component at
//! wiring time. Topics are a closed set of typed broadcast channels, so a
//! slow subscriber lags on its own receiver and never blocks a publisher.

use crate::model::{EnrichedEvent, ParsedEvent, ParseFailure, RawMessage, ThreatFeedItem};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::error;

/// Sized to absorb ingest bursts without tripping `Lagged` on healthy
/// subscribers.
const TOPIC_CAPACITY: usize = 4096;

/// Latency-budget violation notice for one enriched event.
#[derive(Debug, Clone)]
pub struct LatencyExceeded {
    pub elapsed_ms: u32,
    pub source_ip: Option<String>,
}

/// Enrichment-stage internal failure notice.
#[derive(Debug, Clone)]
pub struct EnrichmentError {
    pub message: Arc<str>,
}

pub struct EventBus {
    message: broadcast::Sender<Arc<RawMessage>>,
    parsed: broadcast::Sender<Arc<ParsedEvent>>,
    parse_error: broadcast::Sender<Arc<ParseFailure>>,
    enriched: broadcast::Sender<Arc<EnrichedEvent>>,
    threat_feed: broadcast::Sender<Arc<Vec<ThreatFeedItem>>>,
    latency_exceeded: broadcast::Sender<LatencyExceeded>,
    enrichment_error: broadcast::Sender<EnrichmentError>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            message: broadcast::channel(TOPIC_CAPACITY).0,
            parsed: broadcast::channel(TOPIC_CAPACITY).0,
            parse_error: broadcast::channel(TOPIC_CAPACITY).0,
            enriched: broadcast::channel(TOPIC_CAPACITY).0,
            threat_feed: broadcast::channel(TOPIC_CAPACITY).0,
            latency_exceeded: broadcast::channel(TOPIC_CAPACITY).0,
            enrichment_error: broadcast::channel(TOPIC_CAPACITY).0,
        }
    }

    pub fn publish_message(&self, msg: RawMessage) {
        dispatch(&self.message, Arc::new(msg));
    }

    pub fn publish_parsed(&self, event: ParsedEvent) {
        dispatch(&self.parsed, Arc::new(event));
    }

    pub fn publish_parse_error(&self, failure: ParseFailure) {
        dispatch(&self.parse_error, Arc::new(failure));
    }

    pub fn publish_enriched(&self, event: EnrichedEvent) {
        dispatch(&self.enriched, Arc::new(event));
    }

    /// Carries the full active list, not a delta; clients replace wholesale.
    pub fn publish_threat_feed(&self, items: Vec<ThreatFeedItem>) {
        dispatch(&self.threat_feed, Arc::new(items));
    }

    pub fn publish_latency_exceeded(&self, notice: LatencyExceeded) {
        dispatch(&self.latency_exceeded, notice);
    }

    pub fn publish_enrichment_error(&self, notice: EnrichmentError) {
        dispatch(&self.enrichment_error, notice);
    }

    pub fn subscribe_message(&self) -> broadcast::Receiver<Arc<RawMessage>> {
        self.message.subscribe()
    }

    pub fn subscribe_parsed(&self) -> broadcast::Receiver<Arc<ParsedEvent>> {
        self.parsed.subscribe()
    }

    pub fn subscribe_parse_error(&self) -> broadcast::Receiver<Arc<ParseFailure>> {
        self.parse_error.subscribe()
    }

    pub fn subscribe_enriched(&self) -> broadcast::Receiver<Arc<EnrichedEvent>> {
        self.enriched.subscribe()
    }

    pub fn subscribe_threat_feed(&self) -> broadcast::Receiver<Arc<Vec<ThreatFeedItem>>> {
        self.threat_feed.subscribe()
    }

    pub fn subscribe_latency_exceeded(&self) -> broadcast::Receiver<LatencyExceeded> {
        self.latency_exceeded.subscribe()
    }

    pub fn subscribe_enrichment_error(&self) -> broadcast::Receiver<EnrichmentError> {
        self.enrichment_error.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// No subscribers is a normal state (nobody watching the dashboard yet);
/// a closed channel is not, since the bus owns every sender for the
/// process lifetime.
fn dispatch<T: Clone>(sender: &broadcast::Sender<T>, value: T) {
    if sender.receiver_count() == 0 {
        return;
    }
    if sender.send(value).is_err() {
        error!("event bus channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DenyAction, ThreatType};
    use chrono::Utc;

    fn parsed_event(src: &str) -> ParsedEvent {
        ParsedEvent {
            timestamp: Utc::now(),
            source_ip: Some(src.into()),
            destination_ip: None,
            destination_port: None,
            service: None,
            threat_type: ThreatType::Unknown,
            action: DenyAction::Deny,
            raw: String::new(),
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut subs: Vec<_> = (0..20).map(|_| bus.subscribe_parsed()).collect();
        bus.publish_parsed(parsed_event("192.0.2.1"));
        for sub in &mut subs {
            let got = sub.recv().await.unwrap();
            assert_eq!(got.source_ip.as_deref(), Some("192.0.2.1"));
        }
    }

    #[tokio::test]
    async fn publish_order_is_preserved_per_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_parsed();
        for i in 0..100 {
            bus.publish_parsed(parsed_event(&format!("192.0.2.{i}")));
        }
        for i in 0..100 {
            let got = sub.recv().await.unwrap();
            assert_eq!(got.source_ip.as_deref(), Some(format!("192.0.2.{i}").as_str()));
        }
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish_parsed(parsed_event("192.0.2.1"));
        bus.publish_latency_exceeded(LatencyExceeded { elapsed_ms: 6000, source_ip: None });
        // A later subscriber starts clean, unaffected by pre-subscription traffic.
        let mut sub = bus.subscribe_parsed();
        bus.publish_parsed(parsed_event("192.0.2.2"));
        assert_eq!(sub.recv().await.unwrap().source_ip.as_deref(), Some("192.0.2.2"));
    }

    #[tokio::test]
    async fn warning_topics_carry_their_payloads() {
        let bus = EventBus::new();
        let mut lat = bus.subscribe_latency_exceeded();
        let mut err = bus.subscribe_enrichment_error();
        bus.publish_latency_exceeded(LatencyExceeded {
            elapsed_ms: 6001,
            source_ip: Some("192.0.2.1".into()),
        });
        bus.publish_enrichment_error(EnrichmentError { message: Arc::from("lookup blew up") });
        let warning = lat.recv().await.unwrap();
        assert_eq!(warning.elapsed_ms, 6001);
        assert_eq!(warning.source_ip.as_deref(), Some("192.0.2.1"));
        assert_eq!(&*err.recv().await.unwrap().message, "lookup blew up");
    }

    #[tokio::test]
    async fn lagged_subscriber_does_not_poison_others() {
        let bus = EventBus::new();
        let mut laggard = bus.subscribe_parsed();
        let mut healthy = bus.subscribe_parsed();
        // Overflow the laggard's backlog, draining healthy as we go.
        for i in 0..(TOPIC_CAPACITY + 10) {
            bus.publish_parsed(parsed_event(&format!("10.0.{}.{}", i / 256, i % 256)));
            healthy.recv().await.unwrap();
        }
        match laggard.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {other:?}"),
        }
        // After acknowledging the lag, the laggard resumes from what remains.
        assert!(laggard.recv().await.is_ok());
    }
}
