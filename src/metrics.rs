//! Process-wide pipeline counters and the periodic reporter task.

use crate::geo::GeoResolver;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Monotonic counters for every accept/drop path in the pipeline.
#[derive(Default)]
pub struct PipelineMetrics {
    pub datagrams_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub recv_errors: AtomicU64,
    pub parsed: AtomicU64,
    pub filtered: AtomicU64,
    pub parse_errors: AtomicU64,
    /// CSV rows with ≥31 fields that still produced no action — the
    /// calibration signal for version-specific column drift.
    pub csv_no_action: AtomicU64,
    pub enriched: AtomicU64,
    pub enrichment_errors: AtomicU64,
    pub latency_exceeded: AtomicU64,
    pub broadcast_events: AtomicU64,
    pub broadcast_batches: AtomicU64,
    pub dlq_written: AtomicU64,
    pub dlq_dropped: AtomicU64,
    pub ws_connected: AtomicU64,
    pub ws_terminated: AtomicU64,
    pub rate_limited: AtomicU64,
    pub auth_failures: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Logs a counter snapshot and geo-cache health every minute.
pub async fn reporter(
    metrics: Arc<PipelineMetrics>,
    geo: Arc<GeoResolver>,
    cancel: CancellationToken,
) {
    let mut iv = tokio::time::interval(REPORT_INTERVAL);
    iv.tick().await; // immediate first tick carries nothing useful
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = iv.tick() => {}
        }
        let m = &metrics;
        info!(
            datagrams = m.datagrams_received.load(Ordering::Relaxed),
            parsed = m.parsed.load(Ordering::Relaxed),
            filtered = m.filtered.load(Ordering::Relaxed),
            parse_errors = m.parse_errors.load(Ordering::Relaxed),
            csv_no_action = m.csv_no_action.load(Ordering::Relaxed),
            enriched = m.enriched.load(Ordering::Relaxed),
            broadcast = m.broadcast_events.load(Ordering::Relaxed),
            dlq_written = m.dlq_written.load(Ordering::Relaxed),
            dlq_dropped = m.dlq_dropped.load(Ordering::Relaxed),
            rate_limited = m.rate_limited.load(Ordering::Relaxed),
            "pipeline_counters"
        );
        let stats = geo.stats();
        info!(
            hits = stats.hits,
            misses = stats.misses,
            hit_rate = %format!("{:.1}%", stats.hit_rate * 100.0),
            size = stats.size,
            max = stats.capacity,
            "geo_cache"
        );
        if stats.lookups() >= 100 && stats.hit_rate < 0.80 {
            warn!(
                hit_rate = %format!("{:.1}%", stats.hit_rate * 100.0),
                "geo cache hit rate below 80%"
            );
        }
    }
}
