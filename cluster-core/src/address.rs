//! Overlay addressing and node identity
//!
//! An overlay address is the 32-byte identifier of a node in the DHT
//! keyspace, derived from the node's secp256k1 public key, the network id
//! and a 32-byte nonce (the proof-of-identity anchor):
//!
//! `overlay = SHA3-256(eth_addr || network_id_LE64 || nonce_32)`
//!
//! where `eth_addr` is the bottom 20 bytes of `Keccak256(pubkey[1..])`.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::rand_core::OsRng;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha3::{Digest, Keccak256, Sha3_256};
use std::fmt;
use thiserror::Error;

/// Maximum proximity order between two overlay addresses.
pub const MAX_PO: u8 = 31;

/// Number of proximity-order bins (`MAX_PO + 1`).
pub const MAX_BINS: usize = (MAX_PO as usize) + 1;

#[derive(Debug, Error)]
pub enum AddressError {
    /// The nonce / block hash was not exactly 32 bytes.
    #[error("invalid block hash length: {0}")]
    BadHashLength(usize),

    /// Cryptographic validation of a peer record failed. Callers treat
    /// this as a single outcome; no sub-codes are exposed.
    #[error("invalid address")]
    InvalidAddress,
}

/// 32-byte overlay address in the DHT keyspace.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OverlayAddress(pub [u8; 32]);

impl OverlayAddress {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| AddressError::InvalidAddress)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Proximity order to another address: the number of shared leading
    /// bits, capped at `MAX_PO`.
    pub fn proximity(&self, other: &OverlayAddress) -> u8 {
        proximity(&self.0, &other.0)
    }
}

impl fmt::Display for OverlayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for OverlayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OverlayAddress({})", self.to_hex())
    }
}

/// 20-byte Ethereum-style account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EthAddress(pub [u8; 20]);

impl EthAddress {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        let arr: [u8; 20] = bytes.try_into().map_err(|_| AddressError::InvalidAddress)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for EthAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for EthAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EthAddress(0x{})", self.to_hex())
    }
}

/// Proximity order of two 32-byte values: shared leading bits, capped.
pub fn proximity(a: &[u8; 32], b: &[u8; 32]) -> u8 {
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let xor = x ^ y;
        if xor != 0 {
            let po = (i as u32) * 8 + xor.leading_zeros();
            return (po as u8).min(MAX_PO);
        }
        if (i as u32 + 1) * 8 > MAX_PO as u32 {
            return MAX_PO;
        }
    }
    MAX_PO
}

/// Derive the eth address from a 65-byte uncompressed secp256k1 public key.
pub fn eth_address_from_pubkey(pubkey: &VerifyingKey) -> EthAddress {
    let point = pubkey.to_encoded_point(false);
    let bytes = point.as_bytes();
    // Skip the 0x04 SEC1 prefix byte.
    let hash = Keccak256::digest(&bytes[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&hash[12..]);
    EthAddress(addr)
}

/// Derive an overlay address from a public key, network id and nonce.
///
/// The nonce must be exactly 32 bytes; anything else fails with
/// `BadHashLength`. The derivation is deterministic and depends on every
/// byte of each input.
pub fn derive_overlay(
    pubkey: &VerifyingKey,
    network_id: u64,
    block_hash: &[u8],
) -> Result<OverlayAddress, AddressError> {
    if block_hash.len() != 32 {
        return Err(AddressError::BadHashLength(block_hash.len()));
    }
    let eth = eth_address_from_pubkey(pubkey);
    derive_overlay_from_eth(&eth, network_id, block_hash)
}

/// Overlay derivation step shared with callers that already hold the eth
/// address (e.g. signature recovery paths).
pub fn derive_overlay_from_eth(
    eth: &EthAddress,
    network_id: u64,
    block_hash: &[u8],
) -> Result<OverlayAddress, AddressError> {
    if block_hash.len() != 32 {
        return Err(AddressError::BadHashLength(block_hash.len()));
    }
    let mut hasher = Sha3_256::new();
    hasher.update(eth.as_bytes());
    hasher.update(network_id.to_le_bytes());
    hasher.update(block_hash);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(OverlayAddress(out))
}

/// Node signer wrapping a secp256k1 signing key.
///
/// Signatures are 65 bytes: `r || s || v` with the recovery byte offset
/// by 27, over the Keccak256 digest of the sign data.
#[derive(Clone)]
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    /// Generate a fresh random signer.
    pub fn random() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    /// Build a signer from a 32-byte private scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        let key = SigningKey::from_slice(bytes).map_err(|_| AddressError::InvalidAddress)?;
        Ok(Self { key })
    }

    /// The raw private scalar, for key persistence.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes().into()
    }

    pub fn public_key(&self) -> VerifyingKey {
        *self.key.verifying_key()
    }

    pub fn eth_address(&self) -> EthAddress {
        eth_address_from_pubkey(self.key.verifying_key())
    }

    /// Overlay address of this signer under the given network id and nonce.
    pub fn overlay(&self, network_id: u64, nonce: &[u8]) -> Result<OverlayAddress, AddressError> {
        derive_overlay(self.key.verifying_key(), network_id, nonce)
    }

    /// Produce a recoverable signature over `Keccak256(data)`.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, AddressError> {
        let digest = Keccak256::digest(data);
        let (sig, recid) = self
            .key
            .sign_prehash_recoverable(&digest)
            .map_err(|_| AddressError::InvalidAddress)?;
        let mut out = Vec::with_capacity(65);
        out.extend_from_slice(&sig.to_bytes());
        out.push(recid.to_byte() + 27);
        Ok(out)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signer({})", self.eth_address())
    }
}

/// Recover the public key from a 65-byte recoverable signature over
/// `Keccak256(data)`.
pub fn recover_pubkey(data: &[u8], signature: &[u8]) -> Result<VerifyingKey, AddressError> {
    if signature.len() != 65 {
        return Err(AddressError::InvalidAddress);
    }
    let sig = Signature::from_slice(&signature[..64]).map_err(|_| AddressError::InvalidAddress)?;
    let v = signature[64];
    let recid_byte = v.checked_sub(27).ok_or(AddressError::InvalidAddress)?;
    let recid = RecoveryId::from_byte(recid_byte).ok_or(AddressError::InvalidAddress)?;
    let digest = Keccak256::digest(data);
    VerifyingKey::recover_from_prehash(&digest, &sig, recid).map_err(|_| AddressError::InvalidAddress)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_signer(seed: u8) -> Signer {
        let mut bytes = [0u8; 32];
        bytes[31] = seed;
        Signer::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn test_overlay_derivation_deterministic() {
        let signer = seeded_signer(1);
        let nonce = [2u8; 32];

        let a = signer.overlay(3, &nonce).unwrap();
        let b = signer.overlay(3, &nonce).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_overlay_depends_on_every_input() {
        let signer = seeded_signer(1);
        let other = seeded_signer(2);
        let nonce = [2u8; 32];
        let mut other_nonce = nonce;
        other_nonce[0] ^= 1;

        let base = signer.overlay(3, &nonce).unwrap();
        assert_ne!(base, other.overlay(3, &nonce).unwrap());
        assert_ne!(base, signer.overlay(4, &nonce).unwrap());
        assert_ne!(base, signer.overlay(3, &other_nonce).unwrap());
    }

    #[test]
    fn test_bad_hash_length() {
        let signer = seeded_signer(1);

        assert!(matches!(
            signer.overlay(3, &[0u8; 31]),
            Err(AddressError::BadHashLength(31))
        ));
        assert!(matches!(
            signer.overlay(3, &[0u8; 33]),
            Err(AddressError::BadHashLength(33))
        ));
    }

    #[test]
    fn test_proximity() {
        let zero = [0u8; 32];
        let mut one = [0u8; 32];
        one[0] = 0b1000_0000;
        assert_eq!(proximity(&zero, &one), 0);

        let mut low = [0u8; 32];
        low[0] = 0b0000_0001;
        assert_eq!(proximity(&zero, &low), 7);

        // Identical addresses cap at MAX_PO.
        assert_eq!(proximity(&zero, &zero), MAX_PO);

        // A difference beyond the cap still yields MAX_PO.
        let mut deep = [0u8; 32];
        deep[10] = 1;
        assert_eq!(proximity(&zero, &deep), MAX_PO);
    }

    #[test]
    fn test_proximity_symmetric() {
        let a = [0xabu8; 32];
        let mut b = a;
        b[3] = 0x12;
        assert_eq!(proximity(&a, &b), proximity(&b, &a));
    }

    #[test]
    fn test_sign_and_recover() {
        let signer = seeded_signer(7);
        let data = b"cluster sign data";

        let sig = signer.sign(data).unwrap();
        assert_eq!(sig.len(), 65);

        let recovered = recover_pubkey(data, &sig).unwrap();
        assert_eq!(
            eth_address_from_pubkey(&recovered),
            signer.eth_address()
        );
    }

    #[test]
    fn test_recover_rejects_bad_signature() {
        let signer = seeded_signer(7);
        let data = b"cluster sign data";
        let mut sig = signer.sign(data).unwrap();
        sig[10] ^= 0xff;

        let recovered = recover_pubkey(data, &sig);
        // Recovery either fails outright or yields a different key.
        if let Ok(key) = recovered {
            assert_ne!(eth_address_from_pubkey(&key), signer.eth_address());
        }
    }
}
