//! Integration test for the settlement flow between two Cluster nodes
//!
//! Builds two full accounting + pseudosettle stacks, bridges them with
//! an in-process payment transport, and drives a credit reservation
//! across the early-payment mark so that the refresh settles real debt
//! on both ledgers.

use cluster_core::accounting::Clock;
use cluster_core::{
    Accounting, AccountingConfig, Metrics, OverlayAddress, PaymentTransport, Pseudosettle,
    StateStore,
};
use cluster_core::{MemStateStore, Payment, PaymentAck};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize tracing for tests
fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Manually advanced clock shared by both nodes.
struct SharedClock {
    now: AtomicU64,
}

impl SharedClock {
    fn new(start: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(start),
        })
    }

    fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for SharedClock {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Delivers payment requests straight into the responder's handler.
struct LoopbackTransport {
    responder: Pseudosettle,
    initiator_overlay: OverlayAddress,
}

impl PaymentTransport for LoopbackTransport {
    fn request(
        &self,
        _peer: OverlayAddress,
        payment: Payment,
    ) -> BoxFuture<'_, Result<PaymentAck, Box<dyn std::error::Error + Send + Sync>>> {
        let ack = self.responder.handle_payment(&self.initiator_overlay, &payment);
        Box::pin(async move { ack.map_err(|e| Box::new(e) as _) })
    }
}

struct NodeEnd {
    accounting: Accounting,
    pseudosettle: Pseudosettle,
    metrics: Metrics,
}

fn node_end(clock: Arc<SharedClock>) -> NodeEnd {
    let store: Arc<dyn StateStore> = Arc::new(MemStateStore::new());
    let config = AccountingConfig {
        payment_threshold: 10_000,
        payment_tolerance_pct: 25,
        payment_early_pct: 50,
        min_payment_threshold: 100,
        refresh_rate: 100,
    };
    let metrics = Metrics::new();
    let accounting =
        Accounting::with_clock(config, store.clone(), metrics.clone(), clock.clone());
    let pseudosettle =
        Pseudosettle::with_clock(accounting.clone(), store, metrics.clone(), clock);
    accounting.set_settlement(Arc::new(pseudosettle.clone()));
    NodeEnd {
        accounting,
        pseudosettle,
        metrics,
    }
}

#[tokio::test]
async fn test_credit_crossing_early_mark_settles_debt() {
    init_tracing();

    let clock = SharedClock::new(1_000_000);
    let a_overlay = OverlayAddress([0xaa; 32]);
    let b_overlay = OverlayAddress([0xbb; 32]);

    // Node A consumes service from node B; each node keeps its own
    // ledger for the other.
    let a = node_end(clock.clone());
    let b = node_end(clock.clone());

    a.accounting.connect(&b_overlay, true);
    a.pseudosettle.connect(&b_overlay, true);
    b.accounting.connect(&a_overlay, true);
    b.pseudosettle.connect(&a_overlay, true);

    a.pseudosettle.set_transport(Arc::new(LoopbackTransport {
        responder: b.pseudosettle.clone(),
        initiator_overlay: a_overlay,
    }));

    // A consumes 3000 units of B's service; both ledgers record it.
    let action = a.accounting.prepare_credit(&b_overlay, 3000, false).await.unwrap();
    action.apply().unwrap();
    b.accounting.prepare_debit(&a_overlay, 3000).apply().unwrap();

    assert_eq!(a.accounting.balance(&b_overlay), -3000);
    assert_eq!(b.accounting.balance(&a_overlay), 3000);

    // Let the session accrue a comfortable allowance.
    clock.advance(100);

    // The next reservation pushes A's expected debt past the early mark
    // (threshold 10000, early 50% => mark at 5000), which triggers a
    // refresh before the reservation is granted.
    let action = a.accounting.prepare_credit(&b_overlay, 2500, false).await.unwrap();

    assert_eq!(
        a.accounting.balance(&b_overlay),
        0,
        "refresh settled the outstanding 3000"
    );
    assert_eq!(b.accounting.balance(&a_overlay), 0);
    assert_eq!(a.pseudosettle.total_paid(&b_overlay), 3000);
    assert_eq!(b.pseudosettle.total_received(&a_overlay), 3000);
    assert_eq!(a.metrics.refresh_attempts_total(), 1);
    assert_eq!(a.metrics.refresh_failures_total(), 0);

    // The reservation itself is still pending until applied.
    assert_eq!(a.accounting.shadow_balance(&b_overlay), 2500);
    action.apply().unwrap();
    assert_eq!(a.accounting.balance(&b_overlay), -2500);
    assert_eq!(a.accounting.shadow_balance(&b_overlay), 0);
}

#[tokio::test]
async fn test_refresh_survives_process_restart() {
    init_tracing();

    let clock = SharedClock::new(2_000_000);
    let peer = OverlayAddress([0x11; 32]);
    let store: Arc<dyn StateStore> = Arc::new(MemStateStore::new());
    let config = AccountingConfig {
        payment_threshold: 10_000,
        payment_tolerance_pct: 25,
        payment_early_pct: 50,
        min_payment_threshold: 100,
        refresh_rate: 100,
    };

    {
        let accounting = Accounting::with_clock(
            config.clone(),
            store.clone(),
            Metrics::new(),
            clock.clone(),
        );
        let pseudosettle = Pseudosettle::with_clock(
            accounting.clone(),
            store.clone(),
            Metrics::new(),
            clock.clone(),
        );
        accounting.connect(&peer, true);
        pseudosettle.connect(&peer, true);

        accounting.prepare_debit(&peer, 700).apply().unwrap();
        clock.advance(10);
        let ack = pseudosettle
            .handle_payment(
                &peer,
                &Payment {
                    amount: 700,
                    timestamp: clock.now_secs(),
                },
            )
            .unwrap();
        assert_eq!(ack.accepted_amount, 700);
    }

    // A fresh instance over the same store sees the settled ledger and
    // the lifetime totals.
    let accounting = Accounting::with_clock(config, store.clone(), Metrics::new(), clock.clone());
    let pseudosettle =
        Pseudosettle::with_clock(accounting.clone(), store, Metrics::new(), clock);

    assert_eq!(accounting.balance(&peer), 0);
    assert_eq!(pseudosettle.total_received(&peer), 700);
}
