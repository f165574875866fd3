//! Bridge traffic counters.
//!
//! Atomic counters replace per-packet logging in the hot paths. Counters
//! are eventually consistent: each is individually atomic, but a snapshot
//! is not a single point in time.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the bridge across sessions.
#[derive(Debug, Default)]
pub struct BridgeStats {
    /// Packets forwarded TUN -> socket.
    pub tun_to_socket_packets: AtomicU64,
    /// Payload bytes forwarded TUN -> socket.
    pub tun_to_socket_bytes: AtomicU64,
    /// Packets forwarded socket -> TUN.
    pub socket_to_tun_packets: AtomicU64,
    /// Payload bytes forwarded socket -> TUN.
    pub socket_to_tun_bytes: AtomicU64,
    /// Frames dropped for framing, HMAC, padding, or pre-auth reasons.
    pub dropped_packets: AtomicU64,
    /// Failed handshake attempts.
    pub auth_failures: AtomicU64,
}

impl BridgeStats {
    /// Create a stats instance with all counters zeroed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tun_to_socket_packets: self.tun_to_socket_packets.load(Ordering::Relaxed),
            tun_to_socket_bytes: self.tun_to_socket_bytes.load(Ordering::Relaxed),
            socket_to_tun_packets: self.socket_to_tun_packets.load(Ordering::Relaxed),
            socket_to_tun_bytes: self.socket_to_tun_bytes.load(Ordering::Relaxed),
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter to zero.
    pub fn reset(&self) {
        self.tun_to_socket_packets.store(0, Ordering::Relaxed);
        self.tun_to_socket_bytes.store(0, Ordering::Relaxed);
        self.socket_to_tun_packets.store(0, Ordering::Relaxed);
        self.socket_to_tun_bytes.store(0, Ordering::Relaxed);
        self.dropped_packets.store(0, Ordering::Relaxed);
        self.auth_failures.store(0, Ordering::Relaxed);
    }
}

/// Plain-value copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tun_to_socket_packets: u64,
    pub tun_to_socket_bytes: u64,
    pub socket_to_tun_packets: u64,
    pub socket_to_tun_bytes: u64,
    pub dropped_packets: u64,
    pub auth_failures: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tun->sock {} pkts / {} bytes, sock->tun {} pkts / {} bytes, \
             dropped {}, auth failures {}",
            self.tun_to_socket_packets,
            self.tun_to_socket_bytes,
            self.socket_to_tun_packets,
            self.socket_to_tun_bytes,
            self.dropped_packets,
            self.auth_failures
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_initial_zero() {
        let stats = BridgeStats::new();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.tun_to_socket_packets, 0);
        assert_eq!(snapshot.socket_to_tun_packets, 0);
        assert_eq!(snapshot.dropped_packets, 0);
        assert_eq!(snapshot.auth_failures, 0);
    }

    #[test]
    fn test_stats_counters_increment_and_reset() {
        let stats = BridgeStats::new();
        stats.tun_to_socket_packets.fetch_add(3, Ordering::Relaxed);
        stats.tun_to_socket_bytes.fetch_add(4200, Ordering::Relaxed);
        stats.dropped_packets.fetch_add(1, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.tun_to_socket_packets, 3);
        assert_eq!(snapshot.tun_to_socket_bytes, 4200);
        assert_eq!(snapshot.dropped_packets, 1);

        stats.reset();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.tun_to_socket_packets, 0);
        assert_eq!(snapshot.tun_to_socket_bytes, 0);
        assert_eq!(snapshot.dropped_packets, 0);
    }

    #[test]
    fn test_snapshot_display() {
        let stats = BridgeStats::new();
        stats.auth_failures.fetch_add(2, Ordering::Relaxed);
        let rendered = stats.snapshot().to_string();
        assert!(rendered.contains("auth failures 2"));
    }
}
