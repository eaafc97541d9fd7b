//! Pseudosettle: time-accounted refresh settlement
//!
//! Refreshes are not monetary. A peer grants its counterparty an
//! allowance of `refresh_rate` accounting units per second of
//! uninterrupted session; a refresh round transfers up to the accrued
//! allowance against outstanding debt. The responder sanity-checks the
//! claimed amount against its own clock and the initiator's reported
//! timestamps, truncating or rejecting claims that outrun the session.
//!
//! One round: initiator sends `Payment { amount, timestamp }`, responder
//! answers `PaymentAck { accepted_amount, timestamp }`. Both sides feed
//! the accepted amount into the accounting ledger and stamp the refresh
//! timestamp. Totals are persisted per peer.

use crate::accounting::{Accounting, Clock, Disconnecter, Settlement, SystemClock};
use crate::address::OverlayAddress;
use crate::messages::{Payment, PaymentAck};
use crate::metrics::Metrics;
use crate::statestore::{StateStore, StoreError};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// One settlement round must finish within this window.
const ROUND_TIMEOUT: Duration = Duration::from_secs(30);

/// Tolerated disagreement between the two wall clocks, seconds.
const MAX_CLOCK_SKEW: u64 = 2;

/// Slack granted when comparing the alleged interval against ours, seconds.
const INTERVAL_SLACK: u64 = 3;

/// Below-expected rounds tolerated before the peer is cut off.
const MAX_BELOW_EXPECTED: u32 = 3;

const TOTAL_PAID_PREFIX: &str = "pseudosettle_total_paid_";
const TOTAL_RECEIVED_PREFIX: &str = "pseudosettle_total_received_";

/// Which timestamp relation a `TimeOutOfSync` fault violated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeSyncFault {
    /// Initiator's reported clock disagrees with ours beyond the skew bound.
    Alleged,
    /// Initiator's reported clock moved backwards.
    Recent,
    /// Initiator claims a longer interval than we observed.
    Interval,
}

#[derive(Debug, Error)]
pub enum PseudosettleError {
    /// Claimed amount exceeds the allowance accrued since the last refresh.
    #[error("refreshment above expected allowance")]
    RefreshmentAboveExpected,

    /// Peer settled less than its outstanding debt allowed.
    #[error("refreshment below expected amount")]
    RefreshmentBelowExpected,

    #[error("time out of sync: {0:?}")]
    TimeOutOfSync(TimeSyncFault),

    #[error("settlement round timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(Box<dyn std::error::Error + Send + Sync>),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("accounting error: {0}")]
    Accounting(#[from] crate::accounting::AccountingError),

    #[error("peer not connected")]
    NotConnected,
}

impl PseudosettleError {
    /// Fatal faults close the session; non-fatal ones are counted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RefreshmentAboveExpected | Self::TimeOutOfSync(_) | Self::Transport(_)
        )
    }
}

/// Outbound seam: one payment request/response exchange with a peer.
pub trait PaymentTransport: Send + Sync {
    fn request(
        &self,
        peer: OverlayAddress,
        payment: Payment,
    ) -> BoxFuture<'_, Result<PaymentAck, Box<dyn std::error::Error + Send + Sync>>>;
}

/// Per-peer protocol state, responder and initiator side.
#[derive(Debug)]
struct PeerState {
    full_node: bool,
    /// Our clock at the last accepted refresh from this peer.
    refresh_received_timestamp: u64,
    /// The peer's reported clock at that refresh.
    alleged_timestamp: u64,
    below_expected_count: u32,
}

/// The pseudosettle protocol engine.
#[derive(Clone)]
pub struct Pseudosettle {
    inner: Arc<PseudosettleInner>,
}

struct PseudosettleInner {
    accounting: Accounting,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    peers: Mutex<HashMap<OverlayAddress, PeerState>>,
    transport: RwLock<Option<Arc<dyn PaymentTransport>>>,
    disconnecter: RwLock<Option<Arc<dyn Disconnecter>>>,
}

impl Pseudosettle {
    pub fn new(accounting: Accounting, store: Arc<dyn StateStore>, metrics: Metrics) -> Self {
        Self::with_clock(accounting, store, metrics, Arc::new(SystemClock))
    }

    pub fn with_clock(
        accounting: Accounting,
        store: Arc<dyn StateStore>,
        metrics: Metrics,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(PseudosettleInner {
                accounting,
                store,
                clock,
                metrics,
                peers: Mutex::new(HashMap::new()),
                transport: RwLock::new(None),
                disconnecter: RwLock::new(None),
            }),
        }
    }

    pub fn set_transport(&self, transport: Arc<dyn PaymentTransport>) {
        *self.inner.transport.write().unwrap() = Some(transport);
    }

    pub fn set_disconnecter(&self, disconnecter: Arc<dyn Disconnecter>) {
        *self.inner.disconnecter.write().unwrap() = Some(disconnecter);
    }

    /// Session start: the allowance clock begins now.
    pub fn connect(&self, peer: &OverlayAddress, full_node: bool) {
        let now = self.inner.clock.now_secs();
        let mut peers = self.inner.peers.lock().unwrap();
        peers.insert(
            *peer,
            PeerState {
                full_node,
                refresh_received_timestamp: now,
                alleged_timestamp: now,
                below_expected_count: 0,
            },
        );
        debug!(peer = %peer, full_node, "pseudosettle: session started");
    }

    pub fn disconnect(&self, peer: &OverlayAddress) {
        self.inner.peers.lock().unwrap().remove(peer);
    }

    /// Initiator side: settle up to `amount` of our debt with the peer.
    /// Returns the amount the responder accepted.
    pub async fn pay(
        &self,
        peer: &OverlayAddress,
        amount: u64,
    ) -> Result<u64, PseudosettleError> {
        let transport = self
            .inner
            .transport
            .read()
            .unwrap()
            .clone()
            .ok_or(PseudosettleError::NotConnected)?;

        let now = self.inner.clock.now_secs();
        let payment = Payment {
            amount,
            timestamp: now,
        };

        trace!(peer = %peer, amount, "sending refresh payment");
        let ack = tokio::time::timeout(ROUND_TIMEOUT, transport.request(*peer, payment))
            .await
            .map_err(|_| PseudosettleError::Timeout)?
            .map_err(PseudosettleError::Transport)?;

        if ack.accepted_amount > amount {
            // A responder crediting more than we sent is lying.
            warn!(peer = %peer, sent = amount, accepted = ack.accepted_amount,
                "responder accepted more than offered");
            self.cut_off(peer, "settlement ack above offer");
            return Err(PseudosettleError::RefreshmentAboveExpected);
        }

        if ack.accepted_amount < amount {
            let over_limit = {
                let mut peers = self.inner.peers.lock().unwrap();
                let state = peers.get_mut(peer).ok_or(PseudosettleError::NotConnected)?;
                state.below_expected_count += 1;
                state.below_expected_count > MAX_BELOW_EXPECTED
            };
            debug!(peer = %peer, sent = amount, accepted = ack.accepted_amount,
                "responder truncated refresh");
            if over_limit {
                self.cut_off(peer, "repeated truncated refreshments");
                return Err(PseudosettleError::RefreshmentBelowExpected);
            }
        }

        self.add_total(&total_paid_key(peer), ack.accepted_amount)?;
        debug!(peer = %peer, accepted = ack.accepted_amount, "refresh settled");
        Ok(ack.accepted_amount)
    }

    /// Responder side: handle an incoming `Payment` and produce the ack.
    ///
    /// Fatal errors close the stream and the session; the caller must not
    /// reply on the same stream after one.
    pub fn handle_payment(
        &self,
        peer: &OverlayAddress,
        payment: &Payment,
    ) -> Result<PaymentAck, PseudosettleError> {
        let now = self.inner.clock.now_secs();
        let debt = self.inner.accounting.balance(peer).max(0) as u128;

        // Sanity checks under the peers lock; disconnects happen after
        // the lock is released.
        let checked: Result<(u64, u64), PseudosettleError> = {
            let mut peers = self.inner.peers.lock().unwrap();
            let state = peers.get_mut(peer).ok_or(PseudosettleError::NotConnected)?;

            if payment.timestamp.abs_diff(now) > MAX_CLOCK_SKEW {
                Err(PseudosettleError::TimeOutOfSync(TimeSyncFault::Alleged))
            } else if payment.timestamp < state.alleged_timestamp {
                Err(PseudosettleError::TimeOutOfSync(TimeSyncFault::Recent))
            } else {
                let alleged_interval = payment.timestamp - state.alleged_timestamp;
                let our_interval = now.saturating_sub(state.refresh_received_timestamp);
                if alleged_interval > our_interval + INTERVAL_SLACK {
                    Err(PseudosettleError::TimeOutOfSync(TimeSyncFault::Interval))
                } else {
                    let rate = self
                        .inner
                        .accounting
                        .config()
                        .refresh_rate_for(state.full_node);
                    let allowance = alleged_interval.saturating_mul(rate);
                    if payment.amount > allowance {
                        Err(PseudosettleError::RefreshmentAboveExpected)
                    } else {
                        // What we expect the peer to settle: its debt,
                        // capped by what the session has accrued.
                        let expected = debt.min(u128::from(allowance)) as u64;
                        state.refresh_received_timestamp = now;
                        state.alleged_timestamp = payment.timestamp;
                        if payment.amount < expected {
                            state.below_expected_count += 1;
                            if state.below_expected_count > MAX_BELOW_EXPECTED {
                                Err(PseudosettleError::RefreshmentBelowExpected)
                            } else {
                                Ok((allowance, expected))
                            }
                        } else {
                            Ok((allowance, expected))
                        }
                    }
                }
            }
        };

        let (allowance, expected) = match checked {
            Ok(pair) => pair,
            Err(e) => {
                self.inner.metrics.refresh_failure();
                warn!(peer = %peer, error = %e, "refresh rejected");
                if e.is_fatal() || matches!(e, PseudosettleError::RefreshmentBelowExpected) {
                    self.cut_off(peer, "settlement sanity check failed");
                }
                return Err(e);
            }
        };

        let accepted = payment.amount.min(allowance);
        if payment.amount < expected {
            debug!(peer = %peer, amount = payment.amount, expected,
                "refresh below expected; tolerated");
        }

        if accepted > 0 {
            self.inner
                .accounting
                .notify_refreshment_received(peer, accepted)?;
            self.add_total(&total_received_key(peer), accepted)?;
        }

        trace!(peer = %peer, accepted, "refresh accepted");
        Ok(PaymentAck {
            accepted_amount: accepted,
            timestamp: now,
        })
    }

    /// Total ever paid to the peer across process lifetimes.
    pub fn total_paid(&self, peer: &OverlayAddress) -> u128 {
        self.read_total(&total_paid_key(peer))
    }

    /// Total ever received from the peer across process lifetimes.
    pub fn total_received(&self, peer: &OverlayAddress) -> u128 {
        self.read_total(&total_received_key(peer))
    }

    fn cut_off(&self, peer: &OverlayAddress, reason: &str) {
        let disconnecter = self.inner.disconnecter.read().unwrap().clone();
        if let Some(disconnecter) = disconnecter {
            disconnecter.disconnect(peer, reason);
        }
    }

    fn read_total(&self, key: &str) -> u128 {
        match self.inner.store.get(key) {
            Ok(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn add_total(&self, key: &str, amount: u64) -> Result<(), StoreError> {
        // The peers mutex serialises settlement rounds per peer, so this
        // read-modify-write does not race with itself.
        let total = self.read_total(key) + u128::from(amount);
        self.inner.store.put(key, total.to_string().as_bytes())
    }
}

/// Accounting calls into pseudosettle through the settlement seam.
impl Settlement for Pseudosettle {
    fn settle(
        &self,
        peer: OverlayAddress,
        amount: u64,
    ) -> BoxFuture<'_, Result<u64, Box<dyn std::error::Error + Send + Sync>>> {
        Box::pin(async move {
            let paid = self.pay(&peer, amount).await?;
            Ok(paid)
        })
    }
}

fn total_paid_key(peer: &OverlayAddress) -> String {
    format!("{TOTAL_PAID_PREFIX}{}", peer.to_hex())
}

fn total_received_key(peer: &OverlayAddress) -> String {
    format!("{TOTAL_RECEIVED_PREFIX}{}", peer.to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::AccountingConfig;
    use crate::statestore::MemStateStore;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Manually advanced clock shared between both protocol ends.
    struct TestClock {
        now: AtomicU64,
    }

    impl TestClock {
        fn new(start: u64) -> Arc<Self> {
            Arc::new(Self {
                now: AtomicU64::new(start),
            })
        }

        fn advance(&self, secs: u64) {
            self.now.fetch_add(secs, Ordering::SeqCst);
        }
    }

    impl Clock for TestClock {
        fn now_secs(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    fn setup(rate: u64, start: u64) -> (Pseudosettle, Accounting, Arc<TestClock>) {
        let clock = TestClock::new(start);
        let store: Arc<dyn StateStore> = Arc::new(MemStateStore::new());
        let config = AccountingConfig {
            payment_threshold: 10_000,
            payment_tolerance_pct: 25,
            payment_early_pct: 50,
            min_payment_threshold: 100,
            refresh_rate: rate,
        };
        let accounting =
            Accounting::with_clock(config, store.clone(), Metrics::new(), clock.clone());
        let settle = Pseudosettle::with_clock(
            accounting.clone(),
            store,
            Metrics::new(),
            clock.clone(),
        );
        (settle, accounting, clock)
    }

    #[tokio::test]
    async fn test_refresh_round() {
        let (settle, accounting, clock) = setup(100, 1_000_000);
        let peer = OverlayAddress([1; 32]);
        accounting.connect(&peer, true);
        settle.connect(&peer, true);

        // Peer owes us 800; ten seconds of session accrue allowance 1000.
        accounting.prepare_debit(&peer, 800).apply().unwrap();
        clock.advance(10);

        let ack = settle
            .handle_payment(
                &peer,
                &Payment {
                    amount: 800,
                    timestamp: clock.now_secs(),
                },
            )
            .unwrap();
        assert_eq!(ack.accepted_amount, 800);
        assert_eq!(accounting.balance(&peer), 0);
        assert_eq!(settle.total_received(&peer), 800);
    }

    #[tokio::test]
    async fn test_replay_rejected() {
        let (settle, accounting, clock) = setup(100, 1_000_000);
        let peer = OverlayAddress([2; 32]);
        accounting.connect(&peer, true);
        settle.connect(&peer, true);
        accounting.prepare_debit(&peer, 800).apply().unwrap();
        clock.advance(10);

        let ts = clock.now_secs();
        settle
            .handle_payment(&peer, &Payment { amount: 800, timestamp: ts })
            .unwrap();

        // Immediate replay: no interval has accrued, so any amount is above
        // the allowance.
        let result = settle.handle_payment(&peer, &Payment { amount: 100, timestamp: ts });
        assert!(matches!(
            result,
            Err(PseudosettleError::RefreshmentAboveExpected)
        ));
    }

    #[tokio::test]
    async fn test_amount_capped_by_allowance() {
        let (settle, accounting, clock) = setup(100, 1_000_000);
        let peer = OverlayAddress([3; 32]);
        accounting.connect(&peer, true);
        settle.connect(&peer, true);
        clock.advance(5);

        // Allowance is 500; claiming 501 is a fatal overclaim.
        let result = settle.handle_payment(
            &peer,
            &Payment {
                amount: 501,
                timestamp: clock.now_secs(),
            },
        );
        assert!(matches!(
            result,
            Err(PseudosettleError::RefreshmentAboveExpected)
        ));
    }

    #[tokio::test]
    async fn test_zero_amount_advances_timestamps() {
        let (settle, accounting, clock) = setup(100, 1_000_000);
        let peer = OverlayAddress([4; 32]);
        accounting.connect(&peer, true);
        settle.connect(&peer, true);
        clock.advance(10);

        let ack = settle
            .handle_payment(
                &peer,
                &Payment {
                    amount: 0,
                    timestamp: clock.now_secs(),
                },
            )
            .unwrap();
        assert_eq!(ack.accepted_amount, 0);

        // The allowance window restarted: an immediate claim has nothing
        // to draw on.
        let result = settle.handle_payment(
            &peer,
            &Payment {
                amount: 1,
                timestamp: clock.now_secs(),
            },
        );
        assert!(matches!(
            result,
            Err(PseudosettleError::RefreshmentAboveExpected)
        ));
    }

    #[tokio::test]
    async fn test_clock_skew_rejected() {
        let (settle, accounting, clock) = setup(100, 1_000_000);
        let peer = OverlayAddress([5; 32]);
        accounting.connect(&peer, true);
        settle.connect(&peer, true);
        clock.advance(10);

        let result = settle.handle_payment(
            &peer,
            &Payment {
                amount: 10,
                timestamp: clock.now_secs() + MAX_CLOCK_SKEW + 1,
            },
        );
        assert!(matches!(
            result,
            Err(PseudosettleError::TimeOutOfSync(TimeSyncFault::Alleged))
        ));
    }

    #[tokio::test]
    async fn test_backwards_clock_rejected() {
        let (settle, accounting, clock) = setup(100, 1_000_000);
        let peer = OverlayAddress([6; 32]);
        accounting.connect(&peer, true);
        settle.connect(&peer, true);
        clock.advance(10);

        let ts = clock.now_secs();
        settle
            .handle_payment(&peer, &Payment { amount: 0, timestamp: ts })
            .unwrap();

        clock.advance(1);
        let result = settle.handle_payment(
            &peer,
            &Payment {
                amount: 0,
                timestamp: ts - 1,
            },
        );
        assert!(matches!(
            result,
            Err(PseudosettleError::TimeOutOfSync(TimeSyncFault::Recent))
        ));
    }

    #[tokio::test]
    async fn test_excess_allowance_goes_to_surplus() {
        let (settle, accounting, clock) = setup(100, 1_000_000);
        let peer = OverlayAddress([7; 32]);
        accounting.connect(&peer, true);
        settle.connect(&peer, true);

        accounting.prepare_debit(&peer, 300).apply().unwrap();
        clock.advance(10);

        // Peer settles its full allowance of 1000 against a debt of 300.
        let ack = settle
            .handle_payment(
                &peer,
                &Payment {
                    amount: 1000,
                    timestamp: clock.now_secs(),
                },
            )
            .unwrap();
        assert_eq!(ack.accepted_amount, 1000);
        assert_eq!(accounting.balance(&peer), 0);
        assert_eq!(accounting.surplus_balance(&peer), 700);
    }

    struct LoopbackTransport {
        responder: Pseudosettle,
        self_overlay: OverlayAddress,
    }

    impl PaymentTransport for LoopbackTransport {
        fn request(
            &self,
            _peer: OverlayAddress,
            payment: Payment,
        ) -> BoxFuture<'_, Result<PaymentAck, Box<dyn std::error::Error + Send + Sync>>> {
            let ack = self.responder.handle_payment(&self.self_overlay, &payment);
            Box::pin(async move { ack.map_err(|e| Box::new(e) as _) })
        }
    }

    #[tokio::test]
    async fn test_full_round_between_two_nodes() {
        // Two protocol ends sharing one clock; node A owes node B 800.
        let clock = TestClock::new(1_000_000);
        let config = AccountingConfig {
            payment_threshold: 10_000,
            payment_tolerance_pct: 25,
            payment_early_pct: 50,
            min_payment_threshold: 100,
            refresh_rate: 100,
        };
        let a_overlay = OverlayAddress([0xaa; 32]);
        let b_overlay = OverlayAddress([0xbb; 32]);

        let store_a: Arc<dyn StateStore> = Arc::new(MemStateStore::new());
        let acc_a =
            Accounting::with_clock(config.clone(), store_a.clone(), Metrics::new(), clock.clone());
        let settle_a =
            Pseudosettle::with_clock(acc_a.clone(), store_a, Metrics::new(), clock.clone());

        let store_b: Arc<dyn StateStore> = Arc::new(MemStateStore::new());
        let acc_b =
            Accounting::with_clock(config, store_b.clone(), Metrics::new(), clock.clone());
        let settle_b =
            Pseudosettle::with_clock(acc_b.clone(), store_b, Metrics::new(), clock.clone());

        acc_a.connect(&b_overlay, true);
        settle_a.connect(&b_overlay, true);
        acc_b.connect(&a_overlay, true);
        settle_b.connect(&a_overlay, true);

        settle_a.set_transport(Arc::new(LoopbackTransport {
            responder: settle_b.clone(),
            self_overlay: a_overlay,
        }));

        // A consumed 800 units of B's service.
        acc_b.prepare_debit(&a_overlay, 800).apply().unwrap();
        clock.advance(10);

        let paid = settle_a.pay(&b_overlay, 800).await.unwrap();
        assert_eq!(paid, 800);
        assert_eq!(acc_b.balance(&a_overlay), 0);
        assert_eq!(settle_a.total_paid(&b_overlay), 800);
        assert_eq!(settle_b.total_received(&a_overlay), 800);
    }
}
