//! Deterministic per-chunk pricing
//!
//! The price of serving a chunk grows with the distance between the
//! serving node and the chunk address: peers close to a chunk charge
//! less for it.

use crate::address::{OverlayAddress, MAX_PO};

/// Base price multiplier per proximity step, in accounting units.
pub const BASE_PRICE: u64 = 10_000;

/// Proximity-graded chunk pricer anchored at this node's overlay address.
#[derive(Clone, Debug)]
pub struct Pricer {
    overlay: OverlayAddress,
    base_price: u64,
}

impl Pricer {
    pub fn new(overlay: OverlayAddress) -> Self {
        Self {
            overlay,
            base_price: BASE_PRICE,
        }
    }

    pub fn with_base_price(overlay: OverlayAddress, base_price: u64) -> Self {
        Self {
            overlay,
            base_price,
        }
    }

    /// Price for fetching `chunk` as seen from `peer`.
    pub fn peer_price(&self, peer: &OverlayAddress, chunk: &OverlayAddress) -> u64 {
        price_for(peer, chunk, self.base_price)
    }

    /// Price for serving `chunk` from this node.
    pub fn price(&self, chunk: &OverlayAddress) -> u64 {
        price_for(&self.overlay, chunk, self.base_price)
    }
}

fn price_for(reference: &OverlayAddress, chunk: &OverlayAddress, base_price: u64) -> u64 {
    let po = reference.proximity(chunk);
    (u64::from(MAX_PO) - u64::from(po) + 1) * base_price
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_gradient() {
        let own = OverlayAddress([0u8; 32]);
        let pricer = Pricer::new(own);

        // A chunk at our own address is the cheapest.
        assert_eq!(pricer.price(&own), BASE_PRICE);

        // A chunk differing in the first bit is the most expensive.
        let mut far = [0u8; 32];
        far[0] = 0b1000_0000;
        assert_eq!(
            pricer.price(&OverlayAddress(far)),
            (u64::from(MAX_PO) + 1) * BASE_PRICE
        );
    }

    #[test]
    fn test_price_monotone_in_proximity() {
        let own = OverlayAddress([0u8; 32]);
        let pricer = Pricer::new(own);

        let mut prev = u64::MAX;
        for bit in 0..8 {
            let mut chunk = [0u8; 32];
            chunk[0] = 0b1000_0000 >> bit;
            let price = pricer.price(&OverlayAddress(chunk));
            assert!(price < prev, "price must fall as proximity grows");
            prev = price;
        }
    }

    #[test]
    fn test_peer_price_uses_peer_reference() {
        let own = OverlayAddress([0u8; 32]);
        let mut peer_bytes = [0u8; 32];
        peer_bytes[0] = 0b1000_0000;
        let peer = OverlayAddress(peer_bytes);
        let pricer = Pricer::new(own);

        // The chunk sits at the peer's address: cheap for the peer,
        // expensive for us.
        assert_eq!(pricer.peer_price(&peer, &peer), BASE_PRICE);
        assert!(pricer.price(&peer) > pricer.peer_price(&peer, &peer));
    }

    #[test]
    fn test_price_symmetry() {
        let a = OverlayAddress([0x5au8; 32]);
        let mut b_bytes = [0x5au8; 32];
        b_bytes[2] = 0x00;
        let b = OverlayAddress(b_bytes);
        let pricer = Pricer::new(a);

        assert_eq!(pricer.peer_price(&a, &b), pricer.peer_price(&b, &a));
    }

    #[test]
    fn test_no_overflow_at_bounds() {
        let pricer = Pricer::with_base_price(OverlayAddress([0u8; 32]), u64::MAX / 64);
        let mut far = [0u8; 32];
        far[0] = 0xff;
        // (MAX_PO + 1) * base stays within u64 for the configured base.
        let _ = pricer.price(&OverlayAddress(far));
    }
}
