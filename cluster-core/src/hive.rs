//! Hive peer gossip
//!
//! Peers exchange batches of signed peer records so the overlay stays
//! discoverable without central coordination. Outgoing advertisements
//! are resolved from the address book, filtered for private underlays
//! and chopped into batches. Incoming records are cryptographically
//! validated, rate limited per remote peer with a token bucket, liveness
//! probed, and only then stored and surfaced to the topology driver.

use crate::address::OverlayAddress;
use crate::addressbook::{AddressBook, AddressBookError};
use crate::kademlia::{Kademlia, Underlay};
use crate::messages::{MopAddress, Peers};
use crate::metrics::Metrics;
use crate::peer::PeerRecord;
use futures::stream::{FuturesUnordered, StreamExt};
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Most peer records allowed in one `Peers` message.
pub const MAX_BATCH_SIZE: usize = 32;

/// Token bucket burst: announcements allowed at once per remote peer.
pub const LIMIT_BURST: usize = 4 * MAX_BATCH_SIZE;

/// Token bucket refill window.
pub const LIMIT_RATE: Duration = Duration::from_secs(60);

/// Per-record liveness probe deadline.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Concurrent liveness probes per incoming batch.
const PING_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
pub enum HiveError {
    /// Remote peer exceeded its announcement budget; its stream is closed.
    #[error("announcement rate limit exceeded")]
    RateLimitExceeded,

    #[error("batch exceeds {MAX_BATCH_SIZE} records")]
    BatchTooLarge(usize),

    #[error("underlay not wired")]
    NotReady,

    #[error("address book error: {0}")]
    AddressBook(#[from] AddressBookError),
}

#[derive(Clone, Debug)]
pub struct HiveConfig {
    pub network_id: u64,
    /// Advertise and accept private-range underlays (test networks).
    pub allow_private_cidrs: bool,
    pub limit_burst: usize,
    pub limit_rate: Duration,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            network_id: 1,
            allow_private_cidrs: false,
            limit_burst: LIMIT_BURST,
            limit_rate: LIMIT_RATE,
        }
    }
}

/// Token bucket charged per announced record.
struct RateLimiter {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(burst: usize) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self, cost: usize, burst: usize, window: Duration) -> bool {
        let rate = burst as f64 / window.as_secs_f64();
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst as f64);
        self.last_refill = Instant::now();

        if self.tokens >= cost as f64 {
            self.tokens -= cost as f64;
            true
        } else {
            false
        }
    }
}

struct HiveInner {
    config: HiveConfig,
    addressbook: AddressBook,
    kademlia: Kademlia,
    underlay: RwLock<Option<Arc<dyn Underlay>>>,
    limiters: Mutex<HashMap<OverlayAddress, RateLimiter>>,
    metrics: Metrics,
}

/// The hive protocol engine.
#[derive(Clone)]
pub struct Hive {
    inner: Arc<HiveInner>,
}

impl Hive {
    pub fn new(
        config: HiveConfig,
        addressbook: AddressBook,
        kademlia: Kademlia,
        metrics: Metrics,
    ) -> Self {
        Self {
            inner: Arc::new(HiveInner {
                config,
                addressbook,
                kademlia,
                underlay: RwLock::new(None),
                limiters: Mutex::new(HashMap::new()),
                metrics,
            }),
        }
    }

    pub fn set_underlay(&self, underlay: Arc<dyn Underlay>) {
        *self.inner.underlay.write().unwrap() = Some(underlay);
    }

    /// Build the advertisement batches for the given overlays. Unknown
    /// overlays are skipped; private underlays are filtered unless
    /// configured otherwise. Each returned message is sent on its own
    /// sub-stream by the protocol layer.
    pub fn broadcast_peers(
        &self,
        overlays: &[OverlayAddress],
    ) -> Result<Vec<Peers>, HiveError> {
        let mut records = Vec::new();
        for overlay in overlays {
            let record = match self.inner.addressbook.get(overlay) {
                Ok(record) => record,
                Err(AddressBookError::NotFound(_)) => {
                    trace!(peer = %overlay, "no record to advertise");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if !self.inner.config.allow_private_cidrs && is_private_underlay(&record.underlay) {
                trace!(peer = %overlay, "skipping private underlay");
                continue;
            }
            records.push(record);
        }

        let mut messages = Vec::new();
        for chunk in records.chunks(MAX_BATCH_SIZE) {
            let peers = chunk.iter().map(to_wire).collect::<Vec<_>>();
            self.inner.metrics.hive_peers_sent(peers.len() as u64);
            messages.push(Peers { peers });
        }
        debug!(
            requested = overlays.len(),
            advertised = records.len(),
            batches = messages.len(),
            "built peer advertisement"
        );
        Ok(messages)
    }

    /// Handle one incoming `Peers` message from `from`. Validated and
    /// live records are stored and handed to the topology driver.
    pub async fn handle_peers(
        &self,
        from: &OverlayAddress,
        msg: &Peers,
    ) -> Result<(), HiveError> {
        if msg.peers.len() > MAX_BATCH_SIZE {
            return Err(HiveError::BatchTooLarge(msg.peers.len()));
        }

        if !self.charge_rate(from, msg.peers.len()) {
            self.inner.metrics.hive_rate_limit_rejection();
            warn!(peer = %from, count = msg.peers.len(), "announcement rate limit hit");
            return Err(HiveError::RateLimitExceeded);
        }

        let underlay = self
            .inner
            .underlay
            .read()
            .unwrap()
            .clone()
            .ok_or(HiveError::NotReady)?;

        let mut valid = Vec::new();
        for wire in &msg.peers {
            self.inner.metrics.hive_peer_received();
            match PeerRecord::parse(
                &wire.underlay,
                &wire.overlay,
                &wire.signature,
                &wire.transaction,
                true,
                self.inner.config.network_id,
            ) {
                Ok(record) => {
                    if !self.inner.config.allow_private_cidrs
                        && is_private_underlay(&record.underlay)
                    {
                        trace!(peer = %record.overlay, "dropping private underlay record");
                        continue;
                    }
                    valid.push(record);
                }
                Err(e) => {
                    self.inner.metrics.invalid_record();
                    trace!(peer = %from, error = %e, "invalid peer record dropped");
                }
            }
        }

        // Liveness-gate the survivors with bounded concurrency.
        let mut probes = FuturesUnordered::new();
        let mut pending = valid.into_iter();
        let mut stored = Vec::new();

        for record in pending.by_ref().take(PING_CONCURRENCY) {
            probes.push(self.probe(underlay.clone(), record));
        }
        while let Some((record, alive)) = probes.next().await {
            if let Some(next) = pending.next() {
                probes.push(self.probe(underlay.clone(), next));
            }
            if alive {
                self.inner.addressbook.put(&record.overlay, &record)?;
                self.inner.metrics.hive_peer_stored();
                stored.push(record.overlay);
            } else {
                self.inner.metrics.hive_ping_failure();
            }
        }

        if !stored.is_empty() {
            debug!(peer = %from, stored = stored.len(), "stored gossiped peers");
            self.inner.kademlia.add_peers(&stored);
        }
        Ok(())
    }

    async fn probe(&self, underlay: Arc<dyn Underlay>, record: PeerRecord) -> (PeerRecord, bool) {
        let address = record.underlay.clone();
        let alive = matches!(
            tokio::time::timeout(PING_TIMEOUT, underlay.ping(&address)).await,
            Ok(Ok(()))
        );
        (record, alive)
    }

    /// Charge `cost` announcements against the peer's token bucket.
    fn charge_rate(&self, from: &OverlayAddress, cost: usize) -> bool {
        let burst = self.inner.config.limit_burst;
        let window = self.inner.config.limit_rate;
        let mut limiters = self.inner.limiters.lock().unwrap();
        limiters
            .entry(*from)
            .or_insert_with(|| RateLimiter::new(burst))
            .allow(cost, burst, window)
    }

    /// Drop a peer's rate limiter state when its session ends.
    pub fn disconnect(&self, peer: &OverlayAddress) {
        self.inner.limiters.lock().unwrap().remove(peer);
    }
}

fn to_wire(record: &PeerRecord) -> MopAddress {
    MopAddress {
        overlay: record.overlay.0.to_vec(),
        underlay: record.underlay.to_vec(),
        signature: record.signature.clone(),
        transaction: record.nonce.to_vec(),
    }
}

/// True when the multiaddress points into private, loopback or link-local
/// IP space.
fn is_private_underlay(addr: &Multiaddr) -> bool {
    for protocol in addr.iter() {
        match protocol {
            Protocol::Ip4(ip) => {
                return ip.is_private() || ip.is_loopback() || ip.is_link_local();
            }
            Protocol::Ip6(ip) => {
                let segments = ip.segments();
                let unique_local = (segments[0] & 0xfe00) == 0xfc00;
                let link_local = (segments[0] & 0xffc0) == 0xfe80;
                return ip.is_loopback() || unique_local || link_local;
            }
            _ => {}
        }
    }
    false
}
