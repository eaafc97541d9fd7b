//! Node metrics
//!
//! Thread-safe counters using atomic types, with Prometheus text export.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Global metrics collector for the overlay core.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Identity / hive
    invalid_records: AtomicU64,
    hive_peers_sent: AtomicU64,
    hive_peers_received: AtomicU64,
    hive_peers_stored: AtomicU64,
    hive_rate_limited: AtomicU64,
    hive_ping_failures: AtomicU64,

    // Topology
    peers_connected: AtomicU64,
    peers_disconnected: AtomicU64,
    dial_failures: AtomicU64,

    // Accounting
    reservations: AtomicU64,
    overdraws: AtomicU64,
    threshold_disconnects: AtomicU64,

    // Settlement
    refresh_attempts: AtomicU64,
    refresh_failures: AtomicU64,

    // Feeds
    feed_probes: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    // Identity / hive

    pub fn invalid_record(&self) {
        self.inner.invalid_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalid_records(&self) -> u64 {
        self.inner.invalid_records.load(Ordering::Relaxed)
    }

    pub fn hive_peers_sent(&self, count: u64) {
        self.inner.hive_peers_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn hive_peers_sent_total(&self) -> u64 {
        self.inner.hive_peers_sent.load(Ordering::Relaxed)
    }

    pub fn hive_peer_received(&self) {
        self.inner.hive_peers_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hive_peers_received_total(&self) -> u64 {
        self.inner.hive_peers_received.load(Ordering::Relaxed)
    }

    pub fn hive_peer_stored(&self) {
        self.inner.hive_peers_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hive_peers_stored_total(&self) -> u64 {
        self.inner.hive_peers_stored.load(Ordering::Relaxed)
    }

    pub fn hive_rate_limit_rejection(&self) {
        self.inner.hive_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hive_rate_limit_rejections(&self) -> u64 {
        self.inner.hive_rate_limited.load(Ordering::Relaxed)
    }

    pub fn hive_ping_failure(&self) {
        self.inner.hive_ping_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hive_ping_failures_total(&self) -> u64 {
        self.inner.hive_ping_failures.load(Ordering::Relaxed)
    }

    // Topology

    pub fn peer_connected(&self) {
        self.inner.peers_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peers_connected_total(&self) -> u64 {
        self.inner.peers_connected.load(Ordering::Relaxed)
    }

    pub fn peer_disconnected(&self) {
        self.inner.peers_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peers_disconnected_total(&self) -> u64 {
        self.inner.peers_disconnected.load(Ordering::Relaxed)
    }

    pub fn dial_failure(&self) {
        self.inner.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dial_failures_total(&self) -> u64 {
        self.inner.dial_failures.load(Ordering::Relaxed)
    }

    // Accounting

    pub fn reservation(&self) {
        self.inner.reservations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reservations_total(&self) -> u64 {
        self.inner.reservations.load(Ordering::Relaxed)
    }

    pub fn overdraw(&self) {
        self.inner.overdraws.fetch_add(1, Ordering::Relaxed);
    }

    pub fn overdraws_total(&self) -> u64 {
        self.inner.overdraws.load(Ordering::Relaxed)
    }

    pub fn threshold_disconnect(&self) {
        self.inner.threshold_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn threshold_disconnects_total(&self) -> u64 {
        self.inner.threshold_disconnects.load(Ordering::Relaxed)
    }

    // Settlement

    pub fn refresh_attempt(&self) {
        self.inner.refresh_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn refresh_attempts_total(&self) -> u64 {
        self.inner.refresh_attempts.load(Ordering::Relaxed)
    }

    pub fn refresh_failure(&self) {
        self.inner.refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn refresh_failures_total(&self) -> u64 {
        self.inner.refresh_failures.load(Ordering::Relaxed)
    }

    // Feeds

    pub fn feed_probe(&self) {
        self.inner.feed_probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn feed_probes_total(&self) -> u64 {
        self.inner.feed_probes.load(Ordering::Relaxed)
    }

    /// Generate Prometheus-formatted metrics text.
    pub fn to_prometheus(&self) -> String {
        let counters: [(&str, &str, u64); 15] = [
            ("cluster_invalid_records_total", "Peer records that failed validation", self.invalid_records()),
            ("cluster_hive_peers_sent_total", "Peer records broadcast to peers", self.hive_peers_sent_total()),
            ("cluster_hive_peers_received_total", "Peer records received from peers", self.hive_peers_received_total()),
            ("cluster_hive_peers_stored_total", "Peer records stored after liveness check", self.hive_peers_stored_total()),
            ("cluster_hive_rate_limited_total", "Hive streams rejected by rate limiting", self.hive_rate_limit_rejections()),
            ("cluster_hive_ping_failures_total", "Liveness probes that failed", self.hive_ping_failures_total()),
            ("cluster_peers_connected_total", "Peer connections established", self.peers_connected_total()),
            ("cluster_peers_disconnected_total", "Peer connections lost", self.peers_disconnected_total()),
            ("cluster_dial_failures_total", "Underlay dial attempts that failed", self.dial_failures_total()),
            ("cluster_reservations_total", "Accounting reservations made", self.reservations_total()),
            ("cluster_overdraws_total", "Reservations rejected for overdraw", self.overdraws_total()),
            ("cluster_threshold_disconnects_total", "Peers disconnected over tolerance ceiling", self.threshold_disconnects_total()),
            ("cluster_refresh_attempts_total", "Pseudosettle refresh rounds started", self.refresh_attempts_total()),
            ("cluster_refresh_failures_total", "Pseudosettle refresh rounds failed", self.refresh_failures_total()),
            ("cluster_feed_probes_total", "Feed lookup chunk probes issued", self.feed_probes_total()),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n"
            ));
        }
        out
    }
}
