//! Payment threshold announcement
//!
//! On connect each side sends a one-shot `AnnouncePaymentThreshold` so
//! the counterparty knows how much debt it will carry before expecting a
//! refresh. The handler parses the decimal threshold, enforces the
//! configured minimum and forwards it into accounting.

use crate::accounting::{Accounting, AccountingError};
use crate::address::OverlayAddress;
use crate::messages::AnnouncePaymentThreshold;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("unparseable threshold announcement: {0:?}")]
    MalformedThreshold(String),

    #[error("accounting rejected threshold: {0}")]
    Accounting(#[from] AccountingError),
}

/// Threshold exchange endpoint, both directions.
#[derive(Clone)]
pub struct Pricing {
    accounting: Accounting,
    payment_threshold: u64,
}

impl Pricing {
    pub fn new(accounting: Accounting, payment_threshold: u64) -> Self {
        Self {
            accounting,
            payment_threshold,
        }
    }

    /// The announcement we send to every newly connected peer.
    pub fn announcement(&self) -> AnnouncePaymentThreshold {
        AnnouncePaymentThreshold {
            threshold: self.payment_threshold.to_string(),
        }
    }

    /// Handle a peer's announcement. Thresholds that do not parse or fall
    /// below the minimum end the session.
    pub fn handle_announcement(
        &self,
        peer: &OverlayAddress,
        msg: &AnnouncePaymentThreshold,
    ) -> Result<(), PricingError> {
        let threshold: u64 = msg.threshold.trim().parse().map_err(|_| {
            warn!(peer = %peer, raw = %msg.threshold, "malformed threshold announcement");
            PricingError::MalformedThreshold(msg.threshold.clone())
        })?;

        self.accounting.notify_payment_threshold(peer, threshold)?;
        debug!(peer = %peer, threshold, "peer payment threshold set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::AccountingConfig;
    use crate::metrics::Metrics;
    use crate::statestore::MemStateStore;
    use std::sync::Arc;

    fn pricing() -> (Pricing, Accounting) {
        let config = AccountingConfig {
            payment_threshold: 1000,
            payment_tolerance_pct: 25,
            payment_early_pct: 50,
            min_payment_threshold: 100,
            refresh_rate: 100,
        };
        let accounting =
            Accounting::new(config, Arc::new(MemStateStore::new()), Metrics::new());
        (Pricing::new(accounting.clone(), 1000), accounting)
    }

    #[test]
    fn test_announcement_carries_own_threshold() {
        let (pricing, _) = pricing();
        assert_eq!(pricing.announcement().threshold, "1000");
    }

    #[tokio::test]
    async fn test_valid_announcement_reaches_accounting() {
        let (pricing, accounting) = pricing();
        let peer = OverlayAddress([1; 32]);
        accounting.connect(&peer, true);

        pricing
            .handle_announcement(
                &peer,
                &AnnouncePaymentThreshold {
                    threshold: "2000".into(),
                },
            )
            .unwrap();

        // The larger envelope admits a reservation above our default.
        let action = accounting.prepare_credit(&peer, 1500, false).await.unwrap();
        action.cleanup();
    }

    #[test]
    fn test_below_minimum_rejected() {
        let (pricing, accounting) = pricing();
        let peer = OverlayAddress([2; 32]);
        accounting.connect(&peer, true);

        let result = pricing.handle_announcement(
            &peer,
            &AnnouncePaymentThreshold {
                threshold: "50".into(),
            },
        );
        assert!(matches!(
            result,
            Err(PricingError::Accounting(
                AccountingError::ThresholdTooLow(50)
            ))
        ));
    }

    #[test]
    fn test_malformed_rejected() {
        let (pricing, _) = pricing();
        let peer = OverlayAddress([3; 32]);

        for raw in ["", "abc", "-5", "1e9"] {
            let result = pricing.handle_announcement(
                &peer,
                &AnnouncePaymentThreshold {
                    threshold: raw.into(),
                },
            );
            assert!(matches!(result, Err(PricingError::MalformedThreshold(_))));
        }
    }
}
