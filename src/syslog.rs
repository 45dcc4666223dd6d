//! UDP syslog receiver.
//!
//! One datagram is one message. Ingestion is lossy at the kernel when
//! the receive buffer is undersized under burst, so the 32 MiB request
//! is the single most important knob here; everything after the socket
//! is backpressure-free.

use crate::bus::EventBus;
use crate::metrics::PipelineMetrics;
use crate::model::RawMessage;
use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Requested kernel receive buffer.
const RECV_BUF_BYTES: usize = 32 * 1024 * 1024;
/// Maximum UDP payload; syslog messages are far smaller in practice.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Bind the ingest socket. A failure here is configuration-fatal; the
/// caller distinguishes `PermissionDenied` (privileged port) in its exit
/// message.
pub fn bind(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    // Best-effort: the kernel clamps to net.core.rmem_max. Warn when we
    // got less than half of what we asked for.
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUF_BYTES) {
        warn!(error = %e, "could not request receive buffer size");
    }
    match socket.recv_buffer_size() {
        Ok(actual) if actual < RECV_BUF_BYTES / 2 => warn!(
            actual_kb = actual / 1024,
            wanted_kb = RECV_BUF_BYTES / 1024,
            "receive buffer clamped; raise net.core.rmem_max to avoid burst loss"
        ),
        Ok(actual) => info!(buffer_kb = actual / 1024, "receive buffer configured"),
        Err(e) => warn!(error = %e, "could not read back receive buffer size"),
    }

    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Receive loop: decode lossily, publish, never die on a socket error.
pub async fn run(
    socket: UdpSocket,
    bus: Arc<EventBus>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
) {
    let local = socket.local_addr().map(|a| a.to_string()).unwrap_or_default();
    info!(addr = %local, "syslog receiver started");
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                info!("syslog receiver stopped");
                return;
            }
            recv = socket.recv_from(&mut buf) => match recv {
                Ok(ok) => ok,
                Err(e) => {
                    // Recoverable: log, count, keep receiving.
                    PipelineMetrics::incr(&metrics.recv_errors);
                    warn!(error = %e, "udp receive error");
                    continue;
                }
            },
        };
        PipelineMetrics::incr(&metrics.datagrams_received);
        metrics.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
        let raw = String::from_utf8_lossy(&buf[..len]).into_owned();
        bus.publish_message(RawMessage {
            raw,
            remote_addr: peer.ip(),
            remote_port: peer.port(),
            received_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn receiver_fixture() -> (SocketAddr, Arc<EventBus>, Arc<PipelineMetrics>, CancellationToken) {
        let socket = bind("127.0.0.1:0".parse().unwrap()).expect("ephemeral bind");
        let addr = socket.local_addr().unwrap();
        let bus = Arc::new(EventBus::new());
        let metrics = PipelineMetrics::new();
        let cancel = CancellationToken::new();
        tokio::spawn(run(socket, bus.clone(), metrics.clone(), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        (addr, bus, metrics, cancel)
    }

    #[tokio::test]
    async fn datagrams_become_raw_messages() {
        let (addr, bus, metrics, cancel) = receiver_fixture().await;
        let mut rx = bus.subscribe_message();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"<14>1 - - - - - [pan@0 action=deny] hit", addr).unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("message within deadline")
            .unwrap();
        assert!(msg.raw.contains("action=deny"));
        assert_eq!(msg.remote_port, sender.local_addr().unwrap().port());
        assert_eq!(metrics.datagrams_received.load(Ordering::Relaxed), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_dropped() {
        let (addr, bus, _metrics, cancel) = receiver_fixture().await;
        let mut rx = bus.subscribe_message();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[0xff, 0xfe, b'a', b'=', b'b'], addr).unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("message within deadline")
            .unwrap();
        assert!(msg.raw.contains('\u{FFFD}'));
        assert!(msg.raw.contains("a=b"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn empty_datagram_still_flows_through() {
        let (addr, bus, metrics, cancel) = receiver_fixture().await;
        let mut rx = bus.subscribe_message();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[], addr).unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("message within deadline")
            .unwrap();
        assert!(msg.raw.is_empty());
        assert_eq!(metrics.datagrams_received.load(Ordering::Relaxed), 1);
        cancel.cancel();
    }
}
