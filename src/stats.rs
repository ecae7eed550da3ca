//! Statistics for the relay stack
//!
//! Counters are updated from the dispatch loop and the worker tasks; reads
//! take a consistent-enough snapshot for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Stack-wide statistics
#[derive(Debug, Default)]
pub struct StackStats {
    start_time: Option<Instant>,

    // Packet counters
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub packets_invalid: AtomicU64,

    // Byte counters
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,

    // Per-protocol counters
    pub tcp_packets: AtomicU64,
    pub udp_packets: AtomicU64,
    pub icmp_packets: AtomicU64,
    pub other_packets: AtomicU64,

    // Flow counters
    pub flows_opened: AtomicU64,
    pub flows_closed: AtomicU64,
    pub flows_active: AtomicU64,
    pub dial_failures: AtomicU64,

    // DNS counters
    pub dns_queries: AtomicU64,
    pub dns_responses: AtomicU64,
    pub dns_failures: AtomicU64,
    pub dns_dropped: AtomicU64,
}

impl StackStats {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.packets_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp(&self) {
        self.tcp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp(&self) {
        self.udp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_icmp(&self) {
        self.icmp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_other(&self) {
        self.other_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flow_opened(&self) {
        self.flows_opened.fetch_add(1, Ordering::Relaxed);
        self.flows_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flow_closed(&self) {
        self.flows_closed.fetch_add(1, Ordering::Relaxed);
        self.flows_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_query(&self) {
        self.dns_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_response(&self) {
        self.dns_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_failure(&self) {
        self.dns_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_dropped(&self) {
        self.dns_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.uptime(),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_invalid: self.packets_invalid.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            tcp_packets: self.tcp_packets.load(Ordering::Relaxed),
            udp_packets: self.udp_packets.load(Ordering::Relaxed),
            icmp_packets: self.icmp_packets.load(Ordering::Relaxed),
            other_packets: self.other_packets.load(Ordering::Relaxed),
            flows_opened: self.flows_opened.load(Ordering::Relaxed),
            flows_closed: self.flows_closed.load(Ordering::Relaxed),
            flows_active: self.flows_active.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            dns_queries: self.dns_queries.load(Ordering::Relaxed),
            dns_responses: self.dns_responses.load(Ordering::Relaxed),
            dns_failures: self.dns_failures.load(Ordering::Relaxed),
            dns_dropped: self.dns_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the counters
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub packets_invalid: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub icmp_packets: u64,
    pub other_packets: u64,
    pub flows_opened: u64,
    pub flows_closed: u64,
    pub flows_active: u64,
    pub dial_failures: u64,
    pub dns_queries: u64,
    pub dns_responses: u64,
    pub dns_failures: u64,
    pub dns_dropped: u64,
}

impl StatsSnapshot {
    /// Received packets per second between two snapshots
    pub fn packets_per_second(&self, previous: &StatsSnapshot, interval: Duration) -> f64 {
        let delta = self.packets_received.saturating_sub(previous.packets_received);
        delta as f64 / interval.as_secs_f64()
    }
}
