//! Transport statistics — atomic counters and serializable snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::provider::ConnectionInfo;

/// How a handshake ended.
#[derive(Debug, Clone, Copy)]
pub enum HandshakeOutcome {
    Success,
    TlsError,
    TimedOut,
    Error,
}

/// How the demux loop classified an inbound datagram.
#[derive(Debug, Clone, Copy)]
pub enum PacketClass {
    ByEndpoint,
    ByConnectionId,
    NewSession,
    UnknownCid,
    Invalid,
}

#[derive(Debug, Default)]
pub struct TransportCounters {
    handshakes_succeeded: AtomicU64,
    handshakes_tls_error: AtomicU64,
    handshakes_timed_out: AtomicU64,
    handshakes_failed: AtomicU64,
    received_by_endpoint: AtomicU64,
    received_by_connection_id: AtomicU64,
    received_new_session: AtomicU64,
    received_unknown_cid: AtomicU64,
    received_invalid: AtomicU64,
    packets_sent: AtomicU64,
}

impl TransportCounters {
    pub fn record_handshake(&self, outcome: HandshakeOutcome) {
        let counter = match outcome {
            HandshakeOutcome::Success => &self.handshakes_succeeded,
            HandshakeOutcome::TlsError => &self.handshakes_tls_error,
            HandshakeOutcome::TimedOut => &self.handshakes_timed_out,
            HandshakeOutcome::Error => &self.handshakes_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, class: PacketClass) {
        let counter = match class {
            PacketClass::ByEndpoint => &self.received_by_endpoint,
            PacketClass::ByConnectionId => &self.received_by_connection_id,
            PacketClass::NewSession => &self.received_new_session,
            PacketClass::UnknownCid => &self.received_unknown_cid,
            PacketClass::Invalid => &self.received_invalid,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            handshakes: HandshakeCounts {
                success: self.handshakes_succeeded.load(Ordering::Relaxed),
                tls_error: self.handshakes_tls_error.load(Ordering::Relaxed),
                timed_out: self.handshakes_timed_out.load(Ordering::Relaxed),
                error: self.handshakes_failed.load(Ordering::Relaxed),
            },
            packets_received: ReceivedCounts {
                by_endpoint: self.received_by_endpoint.load(Ordering::Relaxed),
                by_connection_id: self.received_by_connection_id.load(Ordering::Relaxed),
                new_session: self.received_new_session.load(Ordering::Relaxed),
                unknown_cid: self.received_unknown_cid.load(Ordering::Relaxed),
                invalid: self.received_invalid.load(Ordering::Relaxed),
            },
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub handshakes: HandshakeCounts,
    pub packets_received: ReceivedCounts,
    pub packets_sent: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandshakeCounts {
    pub success: u64,
    pub tls_error: u64,
    pub timed_out: u64,
    pub error: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceivedCounts {
    pub by_endpoint: u64,
    pub by_connection_id: u64,
    pub new_session: u64,
    pub unknown_cid: u64,
    pub invalid: u64,
}

/// One session as reported by the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub endpoint: String,
    pub connection_info: Option<ConnectionInfo>,
    pub session_start_unix: u64,
    pub last_received_unix: u64,
    pub has_connection_id: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportStats {
    pub sessions: Vec<SessionSnapshot>,
    pub counters: CounterSnapshot,
}

pub(crate) fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_class() {
        let counters = TransportCounters::default();
        counters.record_handshake(HandshakeOutcome::Success);
        counters.record_handshake(HandshakeOutcome::Success);
        counters.record_handshake(HandshakeOutcome::TimedOut);
        counters.record_received(PacketClass::ByConnectionId);
        counters.record_received(PacketClass::UnknownCid);
        counters.record_sent();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.handshakes.success, 2);
        assert_eq!(snapshot.handshakes.timed_out, 1);
        assert_eq!(snapshot.handshakes.tls_error, 0);
        assert_eq!(snapshot.packets_received.by_connection_id, 1);
        assert_eq!(snapshot.packets_received.unknown_cid, 1);
        assert_eq!(snapshot.packets_sent, 1);
    }
}
