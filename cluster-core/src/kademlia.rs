//! Kademlia topology driver
//!
//! Maintains the routing table: per-proximity-order bins of connected
//! peers plus a parallel set of known-but-unconnected peers. A connect
//! loop dials known peers of unsaturated bins through the `Underlay`
//! seam, with exponential backoff on failure. Bins deeper than the
//! neighbourhood depth are pruned back to the over-saturation cap by
//! evicting the least recently seen peers.
//!
//! The table is biased toward peers sharing leading address bits with
//! this node; depth is the shallowest unsaturated bin, gated by a
//! minimum neighbourhood size in the deepest bins.

use crate::accounting::{Clock, SystemClock};
use crate::address::{OverlayAddress, MAX_BINS};
use crate::addressbook::AddressBook;
use crate::metrics::Metrics;
use crate::peer::PeerRecord;
use crate::statestore::{StateStore, StoreError};
use futures::future::BoxFuture;
use libp2p::Multiaddr;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, trace, warn};

/// Connected peers per bin before the bin counts as saturated.
pub const DEFAULT_SATURATION_PEERS: usize = 4;

/// Hard cap of connected peers per bin.
pub const DEFAULT_OVER_SATURATION_PEERS: usize = 16;

/// Relaxed per-bin cap for bootnodes, which serve as everyone's entry point.
pub const DEFAULT_BOOTNODE_OVER_SATURATION_PEERS: usize = 64;

/// Minimum peers in the deepest bins before depth may advance.
pub const DEFAULT_NN_LOW_WATERMARK: usize = 2;

/// Random bits appended to probe targets.
pub const DEFAULT_BIT_SUFFIX_LENGTH: u8 = 4;

/// First retry delay after a failed dial.
const BACKOFF_BASE: Duration = Duration::from_secs(60);

/// Exponential backoff cap.
const TIME_TO_RETRY: Duration = Duration::from_secs(2 * 60 * 60);

/// How often the connect loop wakes without external triggers.
const MANAGE_POLL: Duration = Duration::from_secs(30);

/// Per-dial deadline.
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

const METRICS_PREFIX: &str = "kademlia_metrics_";

#[derive(Debug, Error)]
pub enum KademliaError {
    #[error("address book error: {0}")]
    AddressBook(#[from] crate::addressbook::AddressBookError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// External P2P seam: dialing and liveness probing.
pub trait Underlay: Send + Sync {
    fn dial(
        &self,
        record: &PeerRecord,
    ) -> BoxFuture<'_, Result<(), Box<dyn std::error::Error + Send + Sync>>>;

    fn ping(
        &self,
        underlay: &Multiaddr,
    ) -> BoxFuture<'_, Result<(), Box<dyn std::error::Error + Send + Sync>>>;
}

/// Topology change notifications for subscribers (settlement, hive).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopologyEvent {
    Connected(OverlayAddress),
    Disconnected(OverlayAddress),
}

#[derive(Clone, Debug)]
pub struct KademliaConfig {
    pub saturation_peers: usize,
    pub over_saturation_peers: usize,
    pub bootnode_over_saturation_peers: usize,
    pub nn_low_watermark: usize,
    pub bit_suffix_length: u8,
    /// Bootnode mode relaxes the per-bin cap.
    pub bootnode: bool,
    pub backoff_base: Duration,
    pub time_to_retry: Duration,
}

impl Default for KademliaConfig {
    fn default() -> Self {
        Self {
            saturation_peers: DEFAULT_SATURATION_PEERS,
            over_saturation_peers: DEFAULT_OVER_SATURATION_PEERS,
            bootnode_over_saturation_peers: DEFAULT_BOOTNODE_OVER_SATURATION_PEERS,
            nn_low_watermark: DEFAULT_NN_LOW_WATERMARK,
            bit_suffix_length: DEFAULT_BIT_SUFFIX_LENGTH,
            bootnode: false,
            backoff_base: BACKOFF_BASE,
            time_to_retry: TIME_TO_RETRY,
        }
    }
}

impl KademliaConfig {
    /// The cap applied when deciding whether to take on a new peer.
    fn bin_cap(&self) -> usize {
        if self.bootnode {
            self.bootnode_over_saturation_peers
        } else {
            self.over_saturation_peers
        }
    }
}

#[derive(Clone, Debug)]
struct ConnectedPeer {
    overlay: OverlayAddress,
    since: Instant,
    last_seen: Instant,
}

#[derive(Clone, Copy, Debug)]
struct Backoff {
    until: Instant,
    delay: Duration,
}

/// Persisted per-peer connection statistics, stored as a JSON blob.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PeerSessionMetrics {
    connections: u64,
    total_duration_secs: u64,
    last_seen_secs: u64,
}

struct TopologyState {
    connected: [Vec<ConnectedPeer>; MAX_BINS],
    known: [Vec<OverlayAddress>; MAX_BINS],
    backoff: HashMap<OverlayAddress, Backoff>,
    /// Recently disconnected peers, redialed with priority.
    waitlist: HashSet<OverlayAddress>,
}

impl TopologyState {
    fn new() -> Self {
        Self {
            connected: std::array::from_fn(|_| Vec::new()),
            known: std::array::from_fn(|_| Vec::new()),
            backoff: HashMap::new(),
            waitlist: HashSet::new(),
        }
    }

    fn is_connected(&self, bin: usize, overlay: &OverlayAddress) -> bool {
        self.connected[bin].iter().any(|p| p.overlay == *overlay)
    }

    fn is_known(&self, bin: usize, overlay: &OverlayAddress) -> bool {
        self.known[bin].contains(overlay)
    }
}

/// Counts reported by `stats()`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TopologyStats {
    pub connected: usize,
    pub known: usize,
    pub depth: u8,
}

struct KademliaInner {
    base: OverlayAddress,
    config: KademliaConfig,
    state: Mutex<TopologyState>,
    addressbook: AddressBook,
    store: Arc<dyn StateStore>,
    underlay: RwLock<Option<Arc<dyn Underlay>>>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    events: broadcast::Sender<TopologyEvent>,
    wake: Notify,
    shutdown: AtomicBool,
}

/// The routing table handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Kademlia {
    inner: Arc<KademliaInner>,
}

impl Kademlia {
    pub fn new(
        base: OverlayAddress,
        config: KademliaConfig,
        addressbook: AddressBook,
        store: Arc<dyn StateStore>,
        metrics: Metrics,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(KademliaInner {
                base,
                config,
                state: Mutex::new(TopologyState::new()),
                addressbook,
                store,
                underlay: RwLock::new(None),
                clock: Arc::new(SystemClock),
                metrics,
                events,
                wake: Notify::new(),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_underlay(&self, underlay: Arc<dyn Underlay>) {
        *self.inner.underlay.write().unwrap() = Some(underlay);
    }

    pub fn base(&self) -> OverlayAddress {
        self.inner.base
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.inner.events.subscribe()
    }

    /// Record discovered peers. Peers of bins already at their cap are
    /// discarded; the rest become dial candidates.
    pub fn add_peers(&self, overlays: &[OverlayAddress]) {
        let cap = self.inner.config.bin_cap();
        let mut added = 0usize;
        {
            let mut state = self.inner.state.lock().unwrap();
            for overlay in overlays {
                if *overlay == self.inner.base {
                    continue;
                }
                let bin = self.inner.base.proximity(overlay) as usize;
                if state.connected[bin].len() >= cap {
                    trace!(peer = %overlay, bin, "bin at cap; discarding peer");
                    continue;
                }
                if state.is_connected(bin, overlay) || state.is_known(bin, overlay) {
                    continue;
                }
                state.known[bin].push(*overlay);
                added += 1;
            }
        }
        if added > 0 {
            trace!(added, "recorded known peers");
            self.inner.wake.notify_one();
        }
    }

    /// Connection admission check for inbound peers.
    pub fn pick(&self, record: &PeerRecord) -> bool {
        let bin = self.inner.base.proximity(&record.overlay) as usize;
        let state = self.inner.state.lock().unwrap();
        state.connected[bin].len() < self.inner.config.bin_cap()
    }

    /// Promote a peer to connected. Called after a successful dial or an
    /// accepted inbound connection.
    pub fn connected(&self, overlay: &OverlayAddress) {
        let bin = self.inner.base.proximity(overlay) as usize;
        let now = Instant::now();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.known[bin].retain(|o| o != overlay);
            state.backoff.remove(overlay);
            state.waitlist.remove(overlay);
            if !state.is_connected(bin, overlay) {
                state.connected[bin].push(ConnectedPeer {
                    overlay: *overlay,
                    since: now,
                    last_seen: now,
                });
            }
        }
        self.inner.metrics.peer_connected();
        self.record_session_start(overlay);
        let _ = self.inner.events.send(TopologyEvent::Connected(*overlay));
        debug!(peer = %overlay, bin, "peer connected");
    }

    /// Demote a peer that lost its connection. It stays known and is
    /// redialed with priority.
    pub fn disconnected(&self, overlay: &OverlayAddress) {
        let bin = self.inner.base.proximity(overlay) as usize;
        let session = {
            let mut state = self.inner.state.lock().unwrap();
            let session = state.connected[bin]
                .iter()
                .find(|p| p.overlay == *overlay)
                .map(|p| p.since.elapsed());
            state.connected[bin].retain(|p| p.overlay != *overlay);
            if session.is_some() {
                if !state.is_known(bin, overlay) {
                    state.known[bin].push(*overlay);
                }
                state.waitlist.insert(*overlay);
            }
            session
        };
        if let Some(session) = session {
            self.inner.metrics.peer_disconnected();
            self.record_session_end(overlay, session);
            let _ = self.inner.events.send(TopologyEvent::Disconnected(*overlay));
            debug!(peer = %overlay, bin, "peer disconnected");
            self.inner.wake.notify_one();
        }
    }

    /// Permanent removal: the P2P layer blocklisted the peer.
    pub fn blocklisted(&self, overlay: &OverlayAddress) {
        let bin = self.inner.base.proximity(overlay) as usize;
        let was_connected = {
            let mut state = self.inner.state.lock().unwrap();
            let was_connected = state.is_connected(bin, overlay);
            state.connected[bin].retain(|p| p.overlay != *overlay);
            state.known[bin].retain(|o| o != overlay);
            state.backoff.remove(overlay);
            state.waitlist.remove(overlay);
            was_connected
        };
        if was_connected {
            self.inner.metrics.peer_disconnected();
            let _ = self.inner.events.send(TopologyEvent::Disconnected(*overlay));
        }
        info!(peer = %overlay, "peer blocklisted; removed from topology");
    }

    /// Refresh a connected peer's recency stamp.
    pub fn notify_peer_activity(&self, overlay: &OverlayAddress) {
        let bin = self.inner.base.proximity(overlay) as usize;
        let mut state = self.inner.state.lock().unwrap();
        if let Some(peer) = state.connected[bin]
            .iter_mut()
            .find(|p| p.overlay == *overlay)
        {
            peer.last_seen = Instant::now();
        }
    }

    pub fn is_connected(&self, overlay: &OverlayAddress) -> bool {
        let bin = self.inner.base.proximity(overlay) as usize;
        self.inner.state.lock().unwrap().is_connected(bin, overlay)
    }

    /// Neighbourhood depth: the shallowest unsaturated bin, pulled back
    /// so the bins at and beyond it hold at least the low watermark.
    pub fn neighborhood_depth(&self) -> u8 {
        let state = self.inner.state.lock().unwrap();
        self.depth_locked(&state)
    }

    fn depth_locked(&self, state: &TopologyState) -> u8 {
        let mut shallow = (MAX_BINS - 1) as u8;
        for bin in 0..MAX_BINS {
            if state.connected[bin].len() < self.inner.config.saturation_peers {
                shallow = bin as u8;
                break;
            }
        }

        // Depth may not advance past the point where the cumulative peer
        // count from the deepest bin down drops below the watermark.
        let mut cumulative = 0usize;
        let mut nn_depth = 0u8;
        for bin in (0..MAX_BINS).rev() {
            cumulative += state.connected[bin].len();
            if cumulative >= self.inner.config.nn_low_watermark {
                nn_depth = bin as u8;
                break;
            }
        }

        shallow.min(nn_depth)
    }

    /// Walk connected peers shallowest bin first. Return `false` from the
    /// callback to stop.
    pub fn each_peer(&self, cb: &mut dyn FnMut(&OverlayAddress, u8) -> bool) {
        let snapshot = self.connected_snapshot();
        for (overlay, bin) in snapshot {
            if !cb(&overlay, bin) {
                return;
            }
        }
    }

    /// Walk connected peers deepest bin first.
    pub fn each_peer_rev(&self, cb: &mut dyn FnMut(&OverlayAddress, u8) -> bool) {
        let mut snapshot = self.connected_snapshot();
        snapshot.reverse();
        for (overlay, bin) in snapshot {
            if !cb(&overlay, bin) {
                return;
            }
        }
    }

    fn connected_snapshot(&self) -> Vec<(OverlayAddress, u8)> {
        let state = self.inner.state.lock().unwrap();
        let mut out = Vec::new();
        for (bin, peers) in state.connected.iter().enumerate() {
            for peer in peers {
                out.push((peer.overlay, bin as u8));
            }
        }
        out
    }

    /// Next-hop selection: the connected peer closest to `target`,
    /// excluding entries in `skip`.
    pub fn closest_connected_peer(
        &self,
        target: &OverlayAddress,
        skip: &[OverlayAddress],
    ) -> Option<OverlayAddress> {
        let mut best: Option<(OverlayAddress, u8)> = None;
        self.each_peer(&mut |overlay, _| {
            if skip.contains(overlay) {
                return true;
            }
            let po = target.proximity(overlay);
            match best {
                Some((_, best_po)) if po <= best_po => {}
                _ => best = Some((*overlay, po)),
            }
            true
        });
        best.map(|(overlay, _)| overlay)
    }

    /// Pseudo-random address falling into `bin` relative to our base,
    /// used as a probe target for neighbourhood exploration.
    pub fn probe_target(&self, bin: u8) -> OverlayAddress {
        let mut rng = rand::thread_rng();
        let mut bytes = self.inner.base.0;

        // Flip the bit at `bin`, keep the shared prefix, randomise a short
        // suffix after it.
        let byte = (bin / 8) as usize;
        let bit = 7 - (bin % 8);
        bytes[byte] ^= 1 << bit;

        let suffix_start = u32::from(bin) + 1;
        let suffix_end = (suffix_start + u32::from(self.inner.config.bit_suffix_length)).min(256);
        for pos in suffix_start..suffix_end {
            let byte = (pos / 8) as usize;
            let bit = 7 - (pos % 8);
            if rng.gen_bool(0.5) {
                bytes[byte] ^= 1 << bit;
            }
        }
        OverlayAddress(bytes)
    }

    pub fn stats(&self) -> TopologyStats {
        let state = self.inner.state.lock().unwrap();
        TopologyStats {
            connected: state.connected.iter().map(Vec::len).sum(),
            known: state.known.iter().map(Vec::len).sum(),
            depth: self.depth_locked(&state),
        }
    }

    pub fn backoff_remaining(&self, overlay: &OverlayAddress) -> Option<Duration> {
        let state = self.inner.state.lock().unwrap();
        state
            .backoff
            .get(overlay)
            .map(|b| b.until.saturating_duration_since(Instant::now()))
    }

    /// Run the connect/prune loop until shutdown.
    pub async fn run(self) {
        info!(
            saturation = self.inner.config.saturation_peers,
            cap = self.inner.config.bin_cap(),
            bootnode = self.inner.config.bootnode,
            "starting topology connect loop"
        );
        loop {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                info!("topology connect loop shutting down");
                return;
            }

            self.manage_round().await;

            tokio::select! {
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(MANAGE_POLL) => {}
            }
        }
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    /// One management round: dial candidates, then prune oversaturated
    /// bins beyond depth.
    pub async fn manage_round(&self) {
        let underlay = self.inner.underlay.read().unwrap().clone();
        let Some(underlay) = underlay else {
            return;
        };

        for overlay in self.dial_candidates() {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                return;
            }
            self.dial_one(&underlay, &overlay).await;
        }

        self.prune();
    }

    /// Known, non-backoffed peers of bins below their cap, waitlisted
    /// peers first.
    fn dial_candidates(&self) -> Vec<OverlayAddress> {
        let now = Instant::now();
        let state = self.inner.state.lock().unwrap();
        let cap = self.inner.config.bin_cap();

        let mut waitlisted = Vec::new();
        let mut fresh = Vec::new();
        for bin in 0..MAX_BINS {
            let room = cap.saturating_sub(state.connected[bin].len());
            if room == 0 {
                continue;
            }
            let mut taken = 0usize;
            for overlay in &state.known[bin] {
                if taken >= room {
                    break;
                }
                if let Some(backoff) = state.backoff.get(overlay) {
                    if backoff.until > now {
                        continue;
                    }
                }
                taken += 1;
                if state.waitlist.contains(overlay) {
                    waitlisted.push(*overlay);
                } else {
                    fresh.push(*overlay);
                }
            }
        }
        waitlisted.extend(fresh);
        waitlisted
    }

    async fn dial_one(&self, underlay: &Arc<dyn Underlay>, overlay: &OverlayAddress) {
        let record = match self.inner.addressbook.get(overlay) {
            Ok(record) => record,
            Err(e) => {
                trace!(peer = %overlay, error = %e, "no address book entry; skipping dial");
                self.set_backoff(overlay);
                return;
            }
        };

        let dialed = tokio::time::timeout(DIAL_TIMEOUT, underlay.dial(&record)).await;
        match dialed {
            Ok(Ok(())) => self.connected(overlay),
            Ok(Err(e)) => {
                self.inner.metrics.dial_failure();
                debug!(peer = %overlay, error = %e, "dial failed");
                self.set_backoff(overlay);
            }
            Err(_) => {
                self.inner.metrics.dial_failure();
                debug!(peer = %overlay, "dial timed out");
                self.set_backoff(overlay);
            }
        }
    }

    fn set_backoff(&self, overlay: &OverlayAddress) {
        let mut state = self.inner.state.lock().unwrap();
        let base = self.inner.config.backoff_base;
        let cap = self.inner.config.time_to_retry;
        let delay = match state.backoff.get(overlay) {
            Some(prev) => (prev.delay * 2).min(cap),
            None => base,
        };
        state.backoff.insert(
            *overlay,
            Backoff {
                until: Instant::now() + delay,
                delay,
            },
        );
        state.waitlist.remove(overlay);
    }

    /// Evict least-recently-seen peers from oversaturated bins beyond
    /// depth, returning them to the known set.
    fn prune(&self) {
        let evicted: Vec<OverlayAddress> = {
            let mut state = self.inner.state.lock().unwrap();
            let depth = self.depth_locked(&state) as usize;
            let cap = self.inner.config.over_saturation_peers;
            let mut evicted = Vec::new();

            for bin in (depth + 1)..MAX_BINS {
                while state.connected[bin].len() > cap {
                    let lru = state.connected[bin]
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, p)| p.last_seen)
                        .map(|(i, _)| i);
                    let Some(index) = lru else { break };
                    let peer = state.connected[bin].remove(index);
                    if !state.is_known(bin, &peer.overlay) {
                        state.known[bin].push(peer.overlay);
                    }
                    evicted.push(peer.overlay);
                }
            }
            evicted
        };

        for overlay in evicted {
            self.inner.metrics.peer_disconnected();
            let _ = self.inner.events.send(TopologyEvent::Disconnected(overlay));
            debug!(peer = %overlay, "pruned oversaturated peer");
        }
    }

    fn record_session_start(&self, overlay: &OverlayAddress) {
        let key = metrics_key(overlay);
        let mut record = self.load_session_metrics(&key);
        record.connections += 1;
        record.last_seen_secs = self.inner.clock.now_secs();
        if let Err(e) = self.store_session_metrics(&key, &record) {
            warn!(peer = %overlay, error = %e, "failed to persist peer metrics");
        }
    }

    fn record_session_end(&self, overlay: &OverlayAddress, session: Duration) {
        let key = metrics_key(overlay);
        let mut record = self.load_session_metrics(&key);
        record.total_duration_secs += session.as_secs();
        record.last_seen_secs = self.inner.clock.now_secs();
        if let Err(e) = self.store_session_metrics(&key, &record) {
            warn!(peer = %overlay, error = %e, "failed to persist peer metrics");
        }
    }

    fn load_session_metrics(&self, key: &str) -> PeerSessionMetrics {
        match self.inner.store.get(key) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => PeerSessionMetrics::default(),
        }
    }

    fn store_session_metrics(
        &self,
        key: &str,
        record: &PeerSessionMetrics,
    ) -> Result<(), KademliaError> {
        let bytes = serde_json::to_vec(record).map_err(|e| {
            StoreError::IterationAborted(format!("metrics encode failed: {e}"))
        })?;
        self.inner.store.put(key, &bytes)?;
        Ok(())
    }
}

fn metrics_key(overlay: &OverlayAddress) -> String {
    format!("{METRICS_PREFIX}{}", overlay.to_hex())
}
