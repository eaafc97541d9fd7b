//! Per-peer accounting engine
//!
//! Every priced request passes through this ledger. Outgoing requests
//! reserve credit against the peer's advertised payment threshold before
//! they are sent; incoming requests reserve debit and commit it on
//! delivery. Reservations are guard values: dropping an unconsumed
//! `CreditAction`/`DebitAction` releases its reservation, so cancelled or
//! failed request paths can never leak shadow balance.
//!
//! Crossing the early-payment fraction of the credit envelope triggers a
//! refresh settlement (pseudosettle) before the reservation is granted;
//! crossing the debit tolerance ceiling disconnects the peer.
//!
//! State is partitioned per peer: each entry has its own lock, and the
//! entry map itself is only locked for lookup/insert. Multi-peer
//! operations lock entries one at a time in lexicographic overlay order.

use crate::address::OverlayAddress;
use crate::metrics::Metrics;
use crate::statestore::{StateStore, StoreError};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Default payment threshold for full nodes, in accounting units.
pub const DEFAULT_PAYMENT_THRESHOLD: u64 = 13_500_000;

/// Divisor applied to thresholds and refresh rates for light nodes.
pub const LIGHT_FACTOR: u64 = 10;

/// Default refresh rate for full peers, units per second.
pub const DEFAULT_REFRESH_RATE: u64 = 4_500_000;

/// Timeout for a single refresh settlement round.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a prepare waits for an in-progress refresh on the same peer.
const REFRESH_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive non-fatal refresh failures tolerated before disconnecting.
const MAX_REFRESH_FAILURES: u32 = 3;

const BALANCE_PREFIX: &str = "accounting_balance_";
const SURPLUS_PREFIX: &str = "accounting_surplus_";

#[derive(Debug, Error)]
pub enum AccountingError {
    /// Reservation would exceed the peer's credit envelope. The caller
    /// should back off and retry later.
    #[error("overdraw: reservation exceeds credit envelope")]
    Overdraw,

    /// Peer crossed the debit tolerance ceiling and was disconnected.
    #[error("disconnect threshold exceeded")]
    DisconnectThresholdExceeded,

    /// Unattributable consumption exceeded its allowance.
    #[error("ghost balance overdraw")]
    GhostOverdraw,

    /// Peer advertised a payment threshold below the accepted minimum.
    #[error("payment threshold below minimum: {0}")]
    ThresholdTooLow(u64),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Monotonic-enough wall clock, injectable for tests.
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> u64;
}

/// System time clock used by nodes.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }
}

/// Settlement seam invoked when a peer's debt crosses the early-payment
/// mark. Returns the amount actually accepted by the peer.
pub trait Settlement: Send + Sync {
    fn settle(
        &self,
        peer: OverlayAddress,
        amount: u64,
    ) -> BoxFuture<'_, Result<u64, Box<dyn std::error::Error + Send + Sync>>>;
}

/// Disconnect seam: the topology layer removes peers that cross
/// accounting ceilings.
pub trait Disconnecter: Send + Sync {
    fn disconnect(&self, peer: &OverlayAddress, reason: &str);
}

/// Accounting thresholds, set once at init.
#[derive(Clone, Debug)]
pub struct AccountingConfig {
    pub payment_threshold: u64,
    pub payment_tolerance_pct: u64,
    pub payment_early_pct: u64,
    pub min_payment_threshold: u64,
    pub refresh_rate: u64,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            payment_threshold: DEFAULT_PAYMENT_THRESHOLD,
            payment_tolerance_pct: 25,
            payment_early_pct: 50,
            min_payment_threshold: DEFAULT_PAYMENT_THRESHOLD / (2 * LIGHT_FACTOR),
            refresh_rate: DEFAULT_REFRESH_RATE,
        }
    }
}

impl AccountingConfig {
    /// Threshold applied to a peer according to its node type.
    fn threshold_for(&self, full_node: bool) -> u64 {
        if full_node {
            self.payment_threshold
        } else {
            self.payment_threshold / LIGHT_FACTOR
        }
    }

    /// Refresh rate granted to a peer according to its node type.
    pub fn refresh_rate_for(&self, full_node: bool) -> u64 {
        if full_node {
            self.refresh_rate
        } else {
            self.refresh_rate / LIGHT_FACTOR
        }
    }
}

/// Mutable per-peer ledger state. Guarded by the entry's own lock.
#[derive(Debug)]
struct PeerLedger {
    /// Positive: peer owes us. Negative: we owe the peer.
    balance: i128,
    /// Advance credit we hold for the peer.
    surplus: u128,
    /// Optimistically reserved by in-flight requests.
    shadow_reserved: u128,
    /// Unattributable allowance consumption.
    ghost_balance: u128,
    /// Credit applied with the originated flag; introspection only.
    originated_balance: u128,
    /// Seconds timestamp of the last successful refresh with this peer.
    refresh_timestamp: u64,
    /// Consecutive non-fatal settlement failures.
    refresh_failures: u32,
    last_settlement_failure: Option<u64>,
    payment_ongoing: bool,
    /// Threshold the peer advertised for us (their debit ceiling).
    advertised_threshold: u64,
    full_node: bool,
    connected: bool,
}

struct PeerEntry {
    overlay: OverlayAddress,
    ledger: Mutex<PeerLedger>,
    refresh_done: tokio::sync::Notify,
}

struct AccountingInner {
    config: AccountingConfig,
    entries: RwLock<HashMap<OverlayAddress, Arc<PeerEntry>>>,
    store: Arc<dyn StateStore>,
    settlement: RwLock<Option<Arc<dyn Settlement>>>,
    disconnecter: RwLock<Option<Arc<dyn Disconnecter>>>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

/// The per-peer credit/debit ledger.
#[derive(Clone)]
pub struct Accounting {
    inner: Arc<AccountingInner>,
}

impl Accounting {
    pub fn new(config: AccountingConfig, store: Arc<dyn StateStore>, metrics: Metrics) -> Self {
        Self::with_clock(config, store, metrics, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: AccountingConfig,
        store: Arc<dyn StateStore>,
        metrics: Metrics,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(AccountingInner {
                config,
                entries: RwLock::new(HashMap::new()),
                store,
                settlement: RwLock::new(None),
                disconnecter: RwLock::new(None),
                clock,
                metrics,
            }),
        }
    }

    /// Wire in the settlement protocol. Set once during node bring-up.
    pub fn set_settlement(&self, settlement: Arc<dyn Settlement>) {
        *self.inner.settlement.write().unwrap() = Some(settlement);
    }

    /// Wire in the disconnecter seam.
    pub fn set_disconnecter(&self, disconnecter: Arc<dyn Disconnecter>) {
        *self.inner.disconnecter.write().unwrap() = Some(disconnecter);
    }

    pub fn config(&self) -> &AccountingConfig {
        &self.inner.config
    }

    /// Lifecycle hook: peer connected.
    pub fn connect(&self, peer: &OverlayAddress, full_node: bool) {
        let entry = self.entry(peer);
        let mut ledger = entry.ledger.lock().unwrap();
        ledger.connected = true;
        ledger.full_node = full_node;
        debug!(peer = %peer, full_node, "accounting: peer connected");
    }

    /// Lifecycle hook: peer disconnected. Balances are kept (only zeroed
    /// logically by settlement); reservations of in-flight actions are
    /// released by their guards.
    pub fn disconnect(&self, peer: &OverlayAddress) {
        if let Some(entry) = self.lookup(peer) {
            let mut ledger = entry.ledger.lock().unwrap();
            ledger.connected = false;
        }
    }

    /// Pricing observer: peer advertised its payment threshold.
    ///
    /// Advertisements below the configured minimum disconnect the peer.
    pub fn notify_payment_threshold(
        &self,
        peer: &OverlayAddress,
        threshold: u64,
    ) -> Result<(), AccountingError> {
        if threshold < self.inner.config.min_payment_threshold {
            warn!(peer = %peer, threshold, "advertised threshold below minimum");
            self.force_disconnect(peer, "payment threshold below minimum");
            return Err(AccountingError::ThresholdTooLow(threshold));
        }
        let entry = self.entry(peer);
        let mut ledger = entry.ledger.lock().unwrap();
        ledger.advertised_threshold = threshold;
        trace!(peer = %peer, threshold, "updated advertised payment threshold");
        Ok(())
    }

    /// Reserve `price` against the peer's credit envelope.
    ///
    /// Suspends while a refresh for the same peer is in progress; triggers
    /// a refresh itself when the reservation would cross the early-payment
    /// mark. Fails with `Overdraw` when the envelope cannot cover the
    /// reservation even after a refresh attempt.
    pub async fn prepare_credit(
        &self,
        peer: &OverlayAddress,
        price: u64,
        originated: bool,
    ) -> Result<CreditAction, AccountingError> {
        let entry = self.entry(peer);

        self.wait_refresh_idle(&entry).await?;

        let needs_refresh = {
            let mut ledger = entry.ledger.lock().unwrap();
            let threshold = u128::from(ledger.advertised_threshold);
            let expected = expected_debt(&ledger) + u128::from(price);
            let early =
                threshold - threshold * u128::from(self.inner.config.payment_early_pct) / 100;
            if expected <= early {
                // Within the early mark: reserve immediately.
                ledger.shadow_reserved += u128::from(price);
                self.inner.metrics.reservation();
                return Ok(CreditAction::new(self.clone(), *peer, price, originated));
            }
            expected > early
        };

        if needs_refresh {
            self.refresh(&entry).await;
        }

        let mut ledger = entry.ledger.lock().unwrap();
        let threshold = u128::from(ledger.advertised_threshold);
        let expected = expected_debt(&ledger) + u128::from(price);
        if expected > threshold {
            self.inner.metrics.overdraw();
            return Err(AccountingError::Overdraw);
        }
        ledger.shadow_reserved += u128::from(price);
        self.inner.metrics.reservation();
        Ok(CreditAction::new(self.clone(), *peer, price, originated))
    }

    /// Reserve `price` against the peer's debit envelope. The tolerance
    /// ceiling is enforced at apply time, when the debt actually lands.
    pub fn prepare_debit(&self, peer: &OverlayAddress, price: u64) -> DebitAction {
        let entry = self.entry(peer);
        let mut ledger = entry.ledger.lock().unwrap();
        ledger.shadow_reserved += u128::from(price);
        self.inner.metrics.reservation();
        DebitAction::new(self.clone(), *peer, price)
    }

    /// Record consumption that cannot be attributed to a reservable
    /// request (e.g. a malformed request we still did work for).
    pub fn increase_ghost(&self, peer: &OverlayAddress, amount: u64) -> Result<(), AccountingError> {
        let entry = self.entry(peer);
        let mut ledger = entry.ledger.lock().unwrap();
        ledger.ghost_balance += u128::from(amount);
        if ledger.ghost_balance > self.debit_ceiling(&ledger) {
            drop(ledger);
            self.inner.metrics.threshold_disconnect();
            self.force_disconnect(peer, "ghost balance overdraw");
            return Err(AccountingError::GhostOverdraw);
        }
        Ok(())
    }

    /// Responder-side settlement hook: the peer refreshed `amount` of its
    /// debt towards us. Excess beyond the debt becomes surplus. Returns
    /// the amount actually credited against the debt.
    pub fn notify_refreshment_received(
        &self,
        peer: &OverlayAddress,
        amount: u64,
    ) -> Result<u64, AccountingError> {
        let entry = self.entry(peer);
        let mut ledger = entry.ledger.lock().unwrap();

        let debt = ledger.balance.max(0) as u128;
        let applied = debt.min(u128::from(amount));
        let excess = u128::from(amount) - applied;

        let new_balance = ledger.balance - applied as i128;
        let new_surplus = ledger.surplus + excess;
        self.persist(peer, new_balance, new_surplus)?;
        ledger.balance = new_balance;
        ledger.surplus = new_surplus;
        ledger.refresh_timestamp = self.inner.clock.now_secs();

        trace!(peer = %peer, amount, applied, "refreshment received");
        Ok(applied as u64)
    }

    // Introspection

    pub fn balance(&self, peer: &OverlayAddress) -> i128 {
        self.lookup(peer)
            .map(|e| e.ledger.lock().unwrap().balance)
            .unwrap_or(0)
    }

    /// Balance adjusted for surplus held on the peer's behalf.
    pub fn compensated_balance(&self, peer: &OverlayAddress) -> i128 {
        self.lookup(peer)
            .map(|e| {
                let ledger = e.ledger.lock().unwrap();
                ledger.balance - ledger.surplus as i128
            })
            .unwrap_or(0)
    }

    pub fn surplus_balance(&self, peer: &OverlayAddress) -> u128 {
        self.lookup(peer)
            .map(|e| e.ledger.lock().unwrap().surplus)
            .unwrap_or(0)
    }

    pub fn shadow_balance(&self, peer: &OverlayAddress) -> u128 {
        self.lookup(peer)
            .map(|e| e.ledger.lock().unwrap().shadow_reserved)
            .unwrap_or(0)
    }

    pub fn ghost_balance(&self, peer: &OverlayAddress) -> u128 {
        self.lookup(peer)
            .map(|e| e.ledger.lock().unwrap().ghost_balance)
            .unwrap_or(0)
    }

    pub fn refresh_timestamp(&self, peer: &OverlayAddress) -> u64 {
        self.lookup(peer)
            .map(|e| e.ledger.lock().unwrap().refresh_timestamp)
            .unwrap_or(0)
    }

    /// Snapshot of all known balances, in lexicographic overlay order.
    pub fn balances(&self) -> Vec<(OverlayAddress, i128)> {
        let mut overlays: Vec<Arc<PeerEntry>> = {
            let entries = self.inner.entries.read().unwrap();
            entries.values().cloned().collect()
        };
        overlays.sort_by(|a, b| a.overlay.cmp(&b.overlay));
        overlays
            .into_iter()
            .map(|e| {
                let balance = e.ledger.lock().unwrap().balance;
                (e.overlay, balance)
            })
            .collect()
    }

    // Internal

    fn lookup(&self, peer: &OverlayAddress) -> Option<Arc<PeerEntry>> {
        self.inner.entries.read().unwrap().get(peer).cloned()
    }

    /// Get or lazily create the peer's entry, loading persisted balances.
    fn entry(&self, peer: &OverlayAddress) -> Arc<PeerEntry> {
        if let Some(entry) = self.lookup(peer) {
            return entry;
        }

        let (balance, surplus) = self.load_persisted(peer);
        let mut entries = self.inner.entries.write().unwrap();
        entries
            .entry(*peer)
            .or_insert_with(|| {
                Arc::new(PeerEntry {
                    overlay: *peer,
                    ledger: Mutex::new(PeerLedger {
                        balance,
                        surplus,
                        shadow_reserved: 0,
                        ghost_balance: 0,
                        originated_balance: 0,
                        refresh_timestamp: 0,
                        refresh_failures: 0,
                        last_settlement_failure: None,
                        payment_ongoing: false,
                        advertised_threshold: self.inner.config.payment_threshold,
                        full_node: true,
                        connected: false,
                    }),
                    refresh_done: tokio::sync::Notify::new(),
                })
            })
            .clone()
    }

    fn load_persisted(&self, peer: &OverlayAddress) -> (i128, u128) {
        let balance = match self.inner.store.get(&balance_key(peer)) {
            Ok(bytes) => parse_decimal_i128(&bytes).unwrap_or(0),
            Err(_) => 0,
        };
        let surplus = match self.inner.store.get(&surplus_key(peer)) {
            Ok(bytes) => parse_decimal_u128(&bytes).unwrap_or(0),
            Err(_) => 0,
        };
        (balance, surplus)
    }

    /// Write balance and surplus through to the store. Called with the
    /// entry lock held; in-memory state is only mutated on success.
    fn persist(
        &self,
        peer: &OverlayAddress,
        balance: i128,
        surplus: u128,
    ) -> Result<(), AccountingError> {
        self.inner
            .store
            .put(&balance_key(peer), balance.to_string().as_bytes())?;
        self.inner
            .store
            .put(&surplus_key(peer), surplus.to_string().as_bytes())?;
        Ok(())
    }

    fn debit_ceiling(&self, ledger: &PeerLedger) -> u128 {
        let threshold = u128::from(self.inner.config.threshold_for(ledger.full_node));
        threshold * (100 + u128::from(self.inner.config.payment_tolerance_pct)) / 100
    }

    fn force_disconnect(&self, peer: &OverlayAddress, reason: &str) {
        self.disconnect(peer);
        let disconnecter = self.inner.disconnecter.read().unwrap().clone();
        if let Some(disconnecter) = disconnecter {
            disconnecter.disconnect(peer, reason);
        }
    }

    /// Wait for an in-progress refresh on this peer's entry to clear.
    async fn wait_refresh_idle(&self, entry: &Arc<PeerEntry>) -> Result<(), AccountingError> {
        loop {
            {
                let ledger = entry.ledger.lock().unwrap();
                if !ledger.payment_ongoing {
                    return Ok(());
                }
            }
            let notified = entry.refresh_done.notified();
            // Re-check after arming the notification to avoid a lost wakeup.
            {
                let ledger = entry.ledger.lock().unwrap();
                if !ledger.payment_ongoing {
                    return Ok(());
                }
            }
            if tokio::time::timeout(REFRESH_WAIT_TIMEOUT, notified)
                .await
                .is_err()
            {
                self.inner.metrics.overdraw();
                return Err(AccountingError::Overdraw);
            }
        }
    }

    /// Run one refresh settlement round for the peer, if none is ongoing.
    async fn refresh(&self, entry: &Arc<PeerEntry>) {
        let peer = entry.overlay;

        let amount = {
            let mut ledger = entry.ledger.lock().unwrap();
            if ledger.payment_ongoing {
                drop(ledger);
                // Someone else is settling; wait for them instead.
                let _ = tokio::time::timeout(REFRESH_WAIT_TIMEOUT, entry.refresh_done.notified())
                    .await;
                return;
            }
            ledger.payment_ongoing = true;
            let owed = (-ledger.balance).max(0) as u128;
            owed.saturating_sub(ledger.shadow_reserved) as u64
        };

        let settlement = self.inner.settlement.read().unwrap().clone();
        let Some(settlement) = settlement else {
            let mut ledger = entry.ledger.lock().unwrap();
            ledger.payment_ongoing = false;
            entry.refresh_done.notify_waiters();
            return;
        };

        self.inner.metrics.refresh_attempt();
        let result = tokio::time::timeout(REFRESH_TIMEOUT, settlement.settle(peer, amount)).await;

        let mut ledger = entry.ledger.lock().unwrap();
        match result {
            Ok(Ok(paid)) => {
                let new_balance = ledger.balance + i128::from(paid);
                match self.persist(&peer, new_balance, ledger.surplus) {
                    Ok(()) => {
                        ledger.balance = new_balance;
                    }
                    Err(e) => {
                        error!(peer = %peer, error = %e, "failed to persist settled balance");
                    }
                }
                ledger.refresh_timestamp = self.inner.clock.now_secs();
                ledger.refresh_failures = 0;
                debug!(peer = %peer, paid, "refresh settled");
            }
            Ok(Err(e)) => {
                self.inner.metrics.refresh_failure();
                ledger.refresh_failures += 1;
                ledger.last_settlement_failure = Some(self.inner.clock.now_secs());
                warn!(peer = %peer, error = %e, failures = ledger.refresh_failures, "refresh failed");
                if ledger.refresh_failures > MAX_REFRESH_FAILURES {
                    drop(ledger);
                    self.force_disconnect(&peer, "repeated settlement failures");
                    let ledger = entry.ledger.lock().unwrap();
                    finish_refresh(ledger, entry);
                    return;
                }
            }
            Err(_) => {
                self.inner.metrics.refresh_failure();
                ledger.refresh_failures += 1;
                ledger.last_settlement_failure = Some(self.inner.clock.now_secs());
                warn!(peer = %peer, "refresh timed out");
            }
        }
        finish_refresh(ledger, entry);
    }

    /// Release a reservation without committing it.
    fn release(&self, peer: &OverlayAddress, price: u64) {
        if let Some(entry) = self.lookup(peer) {
            let mut ledger = entry.ledger.lock().unwrap();
            ledger.shadow_reserved = ledger.shadow_reserved.saturating_sub(u128::from(price));
        }
    }

    /// Commit a credit reservation: we now owe the peer `price` more.
    fn apply_credit(
        &self,
        peer: &OverlayAddress,
        price: u64,
        originated: bool,
    ) -> Result<(), AccountingError> {
        let entry = self.entry(peer);
        let mut ledger = entry.ledger.lock().unwrap();

        // The reservation is released no matter how the commit goes.
        ledger.shadow_reserved = ledger.shadow_reserved.saturating_sub(u128::from(price));

        let new_balance = ledger.balance - i128::from(price);
        self.persist(peer, new_balance, ledger.surplus)?;
        ledger.balance = new_balance;
        if originated {
            ledger.originated_balance += u128::from(price);
        }
        trace!(peer = %peer, price, balance = ledger.balance, "credit applied");
        Ok(())
    }

    /// Commit a debit reservation: the peer owes us `price` more. Surplus
    /// held for the peer is consumed first. Crossing the tolerance
    /// ceiling disconnects the peer after the debt is recorded.
    fn apply_debit(&self, peer: &OverlayAddress, price: u64) -> Result<(), AccountingError> {
        let entry = self.entry(peer);
        let mut ledger = entry.ledger.lock().unwrap();

        ledger.shadow_reserved = ledger.shadow_reserved.saturating_sub(u128::from(price));

        let from_surplus = ledger.surplus.min(u128::from(price));
        let to_balance = u128::from(price) - from_surplus;

        let new_balance = ledger.balance + to_balance as i128;
        let new_surplus = ledger.surplus - from_surplus;
        self.persist(peer, new_balance, new_surplus)?;
        ledger.balance = new_balance;
        ledger.surplus = new_surplus;
        trace!(peer = %peer, price, balance = ledger.balance, "debit applied");

        if ledger.balance.max(0) as u128 > self.debit_ceiling(&ledger) {
            drop(ledger);
            self.inner.metrics.threshold_disconnect();
            self.force_disconnect(peer, "debit tolerance ceiling exceeded");
            return Err(AccountingError::DisconnectThresholdExceeded);
        }
        Ok(())
    }
}

fn finish_refresh(mut ledger: std::sync::MutexGuard<'_, PeerLedger>, entry: &Arc<PeerEntry>) {
    ledger.payment_ongoing = false;
    drop(ledger);
    entry.refresh_done.notify_waiters();
}

/// Outstanding debt as seen by the credit envelope check: what we owe
/// plus everything already reserved by in-flight requests.
fn expected_debt(ledger: &PeerLedger) -> u128 {
    let owed = (-ledger.balance).max(0) as u128;
    owed + ledger.shadow_reserved
}

fn balance_key(peer: &OverlayAddress) -> String {
    format!("{BALANCE_PREFIX}{}", peer.to_hex())
}

fn surplus_key(peer: &OverlayAddress) -> String {
    format!("{SURPLUS_PREFIX}{}", peer.to_hex())
}

fn parse_decimal_i128(bytes: &[u8]) -> Option<i128> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

fn parse_decimal_u128(bytes: &[u8]) -> Option<u128> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

/// Scoped credit reservation. Dropping it uncommitted releases the
/// reservation; `apply` commits it exactly once.
pub struct CreditAction {
    accounting: Accounting,
    peer: OverlayAddress,
    price: u64,
    originated: bool,
    done: bool,
}

impl CreditAction {
    fn new(accounting: Accounting, peer: OverlayAddress, price: u64, originated: bool) -> Self {
        Self {
            accounting,
            peer,
            price,
            originated,
            done: false,
        }
    }

    /// Commit the reserved amount to the balance.
    pub fn apply(mut self) -> Result<(), AccountingError> {
        self.done = true;
        self.accounting
            .apply_credit(&self.peer, self.price, self.originated)
    }

    /// Release the reservation without committing.
    pub fn cleanup(mut self) {
        self.done = true;
        self.accounting.release(&self.peer, self.price);
    }

    pub fn price(&self) -> u64 {
        self.price
    }
}

impl Drop for CreditAction {
    fn drop(&mut self) {
        if !self.done {
            self.accounting.release(&self.peer, self.price);
        }
    }
}

/// Scoped debit reservation; same guard contract as `CreditAction`.
pub struct DebitAction {
    accounting: Accounting,
    peer: OverlayAddress,
    price: u64,
    done: bool,
}

impl DebitAction {
    fn new(accounting: Accounting, peer: OverlayAddress, price: u64) -> Self {
        Self {
            accounting,
            peer,
            price,
            done: false,
        }
    }

    /// Commit the reserved amount to the balance. May disconnect the
    /// peer when the resulting debt crosses the tolerance ceiling.
    pub fn apply(mut self) -> Result<(), AccountingError> {
        self.done = true;
        self.accounting.apply_debit(&self.peer, self.price)
    }

    /// Release the reservation without committing.
    pub fn cleanup(mut self) {
        self.done = true;
        self.accounting.release(&self.peer, self.price);
    }

    pub fn price(&self) -> u64 {
        self.price
    }
}

impl Drop for DebitAction {
    fn drop(&mut self) {
        if !self.done {
            self.accounting.release(&self.peer, self.price);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statestore::MemStateStore;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn test_config() -> AccountingConfig {
        AccountingConfig {
            payment_threshold: 1000,
            payment_tolerance_pct: 25,
            payment_early_pct: 50,
            min_payment_threshold: 100,
            refresh_rate: 100,
        }
    }

    fn test_accounting() -> Accounting {
        Accounting::new(test_config(), Arc::new(MemStateStore::new()), Metrics::new())
    }

    fn peer(seed: u8) -> OverlayAddress {
        OverlayAddress([seed; 32])
    }

    struct RecordingDisconnecter {
        count: AtomicU64,
    }

    impl Disconnecter for RecordingDisconnecter {
        fn disconnect(&self, _peer: &OverlayAddress, _reason: &str) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FixedSettlement {
        paid: u64,
        calls: AtomicU64,
    }

    impl Settlement for FixedSettlement {
        fn settle(
            &self,
            _peer: OverlayAddress,
            amount: u64,
        ) -> BoxFuture<'_, Result<u64, Box<dyn std::error::Error + Send + Sync>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let paid = self.paid.min(amount);
            Box::pin(async move { Ok(paid) })
        }
    }

    #[tokio::test]
    async fn test_debit_apply_and_cleanup() {
        let acc = test_accounting();
        let p = peer(1);
        acc.connect(&p, true);

        // Two applied debits of 300.
        acc.prepare_debit(&p, 300).apply().unwrap();
        acc.prepare_debit(&p, 300).apply().unwrap();
        assert_eq!(acc.balance(&p), 600);

        // Reservation beyond the ceiling still succeeds at prepare time.
        let action = acc.prepare_debit(&p, 700);
        assert_eq!(acc.shadow_balance(&p), 700);
        assert_eq!(acc.balance(&p), 600);
        action.cleanup();
        assert_eq!(acc.shadow_balance(&p), 0);
        assert_eq!(acc.balance(&p), 600);

        // Applying it crosses the tolerance ceiling (1250) and disconnects.
        let disconnecter = Arc::new(RecordingDisconnecter {
            count: AtomicU64::new(0),
        });
        acc.set_disconnecter(disconnecter.clone());

        let result = acc.prepare_debit(&p, 700).apply();
        assert!(matches!(
            result,
            Err(AccountingError::DisconnectThresholdExceeded)
        ));
        assert_eq!(acc.balance(&p), 1300);
        assert_eq!(disconnecter.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_debit_exactly_at_ceiling_allowed() {
        let acc = test_accounting();
        let p = peer(2);
        acc.connect(&p, true);

        // Exactly the ceiling is fine; one more unit is not.
        acc.prepare_debit(&p, 1250).apply().unwrap();
        assert!(acc.prepare_debit(&p, 1).apply().is_err());
    }

    #[tokio::test]
    async fn test_credit_reserve_apply() {
        let acc = test_accounting();
        let p = peer(3);
        acc.connect(&p, true);

        let action = acc.prepare_credit(&p, 400, true).await.unwrap();
        assert_eq!(acc.shadow_balance(&p), 400);
        action.apply().unwrap();
        assert_eq!(acc.shadow_balance(&p), 0);
        assert_eq!(acc.balance(&p), -400);
    }

    #[tokio::test]
    async fn test_credit_guard_releases_on_drop() {
        let acc = test_accounting();
        let p = peer(4);
        acc.connect(&p, true);

        {
            let _action = acc.prepare_credit(&p, 400, false).await.unwrap();
            assert_eq!(acc.shadow_balance(&p), 400);
            // Dropped without apply or cleanup.
        }
        assert_eq!(acc.shadow_balance(&p), 0);
        assert_eq!(acc.balance(&p), 0);
    }

    #[tokio::test]
    async fn test_credit_overdraw() {
        let acc = test_accounting();
        let p = peer(5);
        acc.connect(&p, true);

        // No settlement wired: crossing the early mark cannot refresh, and
        // crossing the threshold overdraws.
        let result = acc.prepare_credit(&p, 1001, false).await;
        assert!(matches!(result, Err(AccountingError::Overdraw)));
        assert_eq!(acc.shadow_balance(&p), 0);

        // Exactly at the threshold is allowed.
        let action = acc.prepare_credit(&p, 1000, false).await.unwrap();
        action.cleanup();
    }

    #[tokio::test]
    async fn test_credit_triggers_refresh() {
        let acc = test_accounting();
        let p = peer(6);
        acc.connect(&p, true);

        let settlement = Arc::new(FixedSettlement {
            paid: 600,
            calls: AtomicU64::new(0),
        });
        acc.set_settlement(settlement.clone());

        // Build up debt of 600 (early mark is 500).
        acc.prepare_credit(&p, 600, false)
            .await
            .unwrap()
            .apply()
            .unwrap();
        assert_eq!(acc.balance(&p), -600);

        // The next reservation crosses the early mark and settles first.
        let action = acc.prepare_credit(&p, 100, false).await.unwrap();
        assert_eq!(settlement.calls.load(Ordering::SeqCst), 1);
        assert_eq!(acc.balance(&p), 0);
        action.apply().unwrap();
        assert_eq!(acc.balance(&p), -100);
    }

    #[tokio::test]
    async fn test_refreshment_received() {
        let acc = test_accounting();
        let p = peer(7);
        acc.connect(&p, true);

        acc.prepare_debit(&p, 500).apply().unwrap();
        assert_eq!(acc.balance(&p), 500);

        // Peer refreshes more than it owes; excess becomes surplus.
        let applied = acc.notify_refreshment_received(&p, 700).unwrap();
        assert_eq!(applied, 500);
        assert_eq!(acc.balance(&p), 0);
        assert_eq!(acc.surplus_balance(&p), 200);
        assert_eq!(acc.compensated_balance(&p), -200);

        // Surplus is consumed before new debt accrues.
        acc.prepare_debit(&p, 300).apply().unwrap();
        assert_eq!(acc.balance(&p), 100);
        assert_eq!(acc.surplus_balance(&p), 0);
    }

    #[tokio::test]
    async fn test_ghost_balance_disconnect() {
        let acc = test_accounting();
        let p = peer(8);
        acc.connect(&p, true);
        let disconnecter = Arc::new(RecordingDisconnecter {
            count: AtomicU64::new(0),
        });
        acc.set_disconnecter(disconnecter.clone());

        acc.increase_ghost(&p, 1000).unwrap();
        let result = acc.increase_ghost(&p, 300);
        assert!(matches!(result, Err(AccountingError::GhostOverdraw)));
        assert_eq!(disconnecter.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_threshold_advertisement() {
        let acc = test_accounting();
        let p = peer(9);
        acc.connect(&p, true);

        acc.notify_payment_threshold(&p, 2000).unwrap();
        // The larger envelope now admits a bigger reservation.
        let action = acc.prepare_credit(&p, 1000, false).await.unwrap();
        action.cleanup();

        let result = acc.notify_payment_threshold(&p, 50);
        assert!(matches!(result, Err(AccountingError::ThresholdTooLow(50))));
    }

    #[tokio::test]
    async fn test_balances_persist_across_instances() {
        let store: Arc<dyn StateStore> = Arc::new(MemStateStore::new());
        let p = peer(10);

        {
            let acc = Accounting::new(test_config(), store.clone(), Metrics::new());
            acc.connect(&p, true);
            acc.prepare_debit(&p, 750).apply().unwrap();
        }

        let acc = Accounting::new(test_config(), store, Metrics::new());
        assert_eq!(acc.balance(&p), 750);
    }

    #[tokio::test]
    async fn test_light_peer_ceiling() {
        let acc = test_accounting();
        let p = peer(11);
        acc.connect(&p, false);

        // Light ceiling: (1000 / 10) * 125% = 125.
        acc.prepare_debit(&p, 125).apply().unwrap();
        assert!(acc.prepare_debit(&p, 1).apply().is_err());
    }

    #[tokio::test]
    async fn test_balances_snapshot_sorted() {
        let acc = test_accounting();
        let a = peer(0x20);
        let b = peer(0x10);
        acc.connect(&a, true);
        acc.connect(&b, true);
        acc.prepare_debit(&a, 10).apply().unwrap();
        acc.prepare_debit(&b, 20).apply().unwrap();

        let balances = acc.balances();
        assert_eq!(balances.len(), 2);
        assert_eq!(balances[0].0, b);
        assert_eq!(balances[1].0, a);
    }
}
