//! Signed peer records
//!
//! A peer record binds an underlay multiaddress to an overlay address with
//! a recoverable secp256k1 signature over the canonical handshake sign
//! data:
//!
//! `"mop-handshake-" || underlay_bytes || overlay_bytes || network_id_BE64`
//!
//! Records serialise to JSON with a base64 signature and a hex nonce, and
//! only parse back successfully when the signature recovers a key whose
//! derived overlay matches (when overlay validation is requested).

use crate::address::{
    derive_overlay, eth_address_from_pubkey, recover_pubkey, AddressError, EthAddress,
    OverlayAddress, Signer,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};

/// Prefix of the handshake sign data.
pub const SIGN_PREFIX: &[u8] = b"mop-handshake-";

/// A verified (underlay, overlay) binding with its proof material.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub underlay: Multiaddr,
    pub overlay: OverlayAddress,
    pub signature: Vec<u8>,
    /// Opaque 32-byte proof-of-identity anchor.
    pub nonce: [u8; 32],
    /// Recovered during parse; not part of record equality.
    pub eth_address: EthAddress,
}

impl PartialEq for PeerRecord {
    fn eq(&self, other: &Self) -> bool {
        self.overlay == other.overlay
            && self.underlay == other.underlay
            && self.signature == other.signature
            && self.nonce == other.nonce
    }
}

impl Eq for PeerRecord {}

fn sign_data(underlay: &[u8], overlay: &OverlayAddress, network_id: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(SIGN_PREFIX.len() + underlay.len() + 32 + 8);
    data.extend_from_slice(SIGN_PREFIX);
    data.extend_from_slice(underlay);
    data.extend_from_slice(overlay.as_bytes());
    data.extend_from_slice(&network_id.to_be_bytes());
    data
}

impl PeerRecord {
    /// Produce a signed record for the given underlay/overlay binding.
    pub fn new(
        signer: &Signer,
        underlay: Multiaddr,
        overlay: OverlayAddress,
        network_id: u64,
        nonce: [u8; 32],
    ) -> Result<Self, AddressError> {
        let data = sign_data(&underlay.to_vec(), &overlay, network_id);
        let signature = signer.sign(&data)?;
        Ok(Self {
            underlay,
            overlay,
            signature,
            nonce,
            eth_address: signer.eth_address(),
        })
    }

    /// Parse and verify a record from its raw parts.
    ///
    /// The signature is recovered against the canonical sign data; when
    /// `validate_overlay` is set the overlay is re-derived from the
    /// recovered key and the nonce and must match. Every failure mode is
    /// the single `InvalidAddress` outcome.
    pub fn parse(
        underlay: &[u8],
        overlay: &[u8],
        signature: &[u8],
        nonce: &[u8],
        validate_overlay: bool,
        network_id: u64,
    ) -> Result<Self, AddressError> {
        let underlay =
            Multiaddr::try_from(underlay.to_vec()).map_err(|_| AddressError::InvalidAddress)?;
        let overlay = OverlayAddress::from_bytes(overlay)?;
        let nonce: [u8; 32] = nonce.try_into().map_err(|_| AddressError::InvalidAddress)?;

        let data = sign_data(&underlay.to_vec(), &overlay, network_id);
        let pubkey = recover_pubkey(&data, signature)?;
        let eth_address = eth_address_from_pubkey(&pubkey);

        if validate_overlay {
            let derived = derive_overlay(&pubkey, network_id, &nonce)
                .map_err(|_| AddressError::InvalidAddress)?;
            if derived != overlay {
                return Err(AddressError::InvalidAddress);
            }
        }

        Ok(Self {
            underlay,
            overlay,
            signature: signature.to_vec(),
            nonce,
            eth_address,
        })
    }

    /// JSON encoding used by the address book.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let json = PeerRecordJson {
            overlay: self.overlay.to_hex(),
            underlay: self.underlay.to_string(),
            signature: BASE64.encode(&self.signature),
            transaction: hex::encode(self.nonce),
            eth_address: self.eth_address.to_hex(),
        };
        serde_json::to_vec(&json)
    }

    /// Decode a record previously produced by `to_json`.
    pub fn from_json(bytes: &[u8]) -> Result<Self, AddressError> {
        let json: PeerRecordJson =
            serde_json::from_slice(bytes).map_err(|_| AddressError::InvalidAddress)?;

        let overlay_bytes = hex::decode(&json.overlay).map_err(|_| AddressError::InvalidAddress)?;
        let overlay = OverlayAddress::from_bytes(&overlay_bytes)?;
        let underlay: Multiaddr = json
            .underlay
            .parse()
            .map_err(|_| AddressError::InvalidAddress)?;
        let signature = BASE64
            .decode(&json.signature)
            .map_err(|_| AddressError::InvalidAddress)?;
        let nonce_bytes =
            hex::decode(&json.transaction).map_err(|_| AddressError::InvalidAddress)?;
        let nonce: [u8; 32] = nonce_bytes
            .as_slice()
            .try_into()
            .map_err(|_| AddressError::InvalidAddress)?;
        let eth_bytes =
            hex::decode(&json.eth_address).map_err(|_| AddressError::InvalidAddress)?;
        let eth_address = EthAddress::from_bytes(&eth_bytes)?;

        Ok(Self {
            underlay,
            overlay,
            signature,
            nonce,
            eth_address,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct PeerRecordJson {
    overlay: String,
    underlay: String,
    signature: String,
    transaction: String,
    eth_address: String,
}
