//! Single-owner chunks
//!
//! A single-owner chunk is an addressable content unit whose identifier
//! is chosen by its owner and whose integrity is bound by the owner's
//! signature. The chunk address is derived from the identifier and the
//! owner's eth address, so one owner's chunks can never collide with
//! another's.
//!
//! Feed updates are single-owner chunks whose payload starts with an
//! 8-byte big-endian timestamp.

use crate::address::{
    eth_address_from_pubkey, recover_pubkey, AddressError, EthAddress, OverlayAddress, Signer,
};
use futures::future::BoxFuture;
use sha3::{Digest, Sha3_256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SocError {
    #[error("payload too short for a timestamp")]
    PayloadTooShort,

    #[error("signature does not recover the owner")]
    InvalidSignature,

    #[error("address error: {0}")]
    Address(#[from] AddressError),
}

#[derive(Debug, Error)]
pub enum ChunkStoreError {
    #[error("chunk not found: {0}")]
    NotFound(OverlayAddress),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// A signed single-owner chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocChunk {
    pub id: [u8; 32],
    pub owner: EthAddress,
    pub signature: Vec<u8>,
    /// `ts_BE64 ‖ user_bytes`.
    pub payload: Vec<u8>,
}

impl SocChunk {
    /// Sign a new chunk. `payload` must already carry its leading
    /// timestamp.
    pub fn sign(signer: &Signer, id: [u8; 32], payload: Vec<u8>) -> Result<Self, SocError> {
        if payload.len() < 8 {
            return Err(SocError::PayloadTooShort);
        }
        let signature = signer.sign(&sign_data(&id, &payload))?;
        Ok(Self {
            id,
            owner: signer.eth_address(),
            signature,
            payload,
        })
    }

    /// Build and sign a chunk from a timestamp and user bytes.
    pub fn new(
        signer: &Signer,
        id: [u8; 32],
        timestamp: u64,
        user_bytes: &[u8],
    ) -> Result<Self, SocError> {
        let mut payload = Vec::with_capacity(8 + user_bytes.len());
        payload.extend_from_slice(&timestamp.to_be_bytes());
        payload.extend_from_slice(user_bytes);
        Self::sign(signer, id, payload)
    }

    /// The content address: `SHA3-256(id ‖ owner)`.
    pub fn address(&self) -> OverlayAddress {
        soc_address(&self.id, &self.owner)
    }

    /// Verify the signature recovers the claimed owner.
    pub fn verify(&self) -> Result<(), SocError> {
        let pubkey = recover_pubkey(&sign_data(&self.id, &self.payload), &self.signature)
            .map_err(|_| SocError::InvalidSignature)?;
        if eth_address_from_pubkey(&pubkey) != self.owner {
            return Err(SocError::InvalidSignature);
        }
        Ok(())
    }

    /// The update timestamp from the payload head.
    pub fn timestamp(&self) -> Result<u64, SocError> {
        let head: [u8; 8] = self
            .payload
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or(SocError::PayloadTooShort)?;
        Ok(u64::from_be_bytes(head))
    }

    /// The caller's bytes after the timestamp.
    pub fn user_payload(&self) -> &[u8] {
        self.payload.get(8..).unwrap_or(&[])
    }
}

/// Chunk address for an identifier under an owner.
pub fn soc_address(id: &[u8; 32], owner: &EthAddress) -> OverlayAddress {
    let mut hasher = Sha3_256::new();
    hasher.update(id);
    hasher.update(owner.as_bytes());
    OverlayAddress(hasher.finalize().into())
}

fn sign_data(id: &[u8; 32], payload: &[u8]) -> Vec<u8> {
    let payload_hash: [u8; 32] = Sha3_256::digest(payload).into();
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(id);
    data.extend_from_slice(&payload_hash);
    data
}

/// Content store seam used by the feed finders.
pub trait ChunkStore: Send + Sync {
    fn get(
        &self,
        address: &OverlayAddress,
    ) -> BoxFuture<'_, Result<SocChunk, ChunkStoreError>>;

    fn put(&self, chunk: SocChunk) -> BoxFuture<'_, Result<(), ChunkStoreError>>;
}

/// In-memory chunk store for tests and local pipelines.
#[derive(Clone, Default)]
pub struct MemChunkStore {
    chunks: Arc<Mutex<HashMap<OverlayAddress, SocChunk>>>,
}

impl MemChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChunkStore for MemChunkStore {
    fn get(
        &self,
        address: &OverlayAddress,
    ) -> BoxFuture<'_, Result<SocChunk, ChunkStoreError>> {
        let found = self.chunks.lock().unwrap().get(address).cloned();
        let address = *address;
        Box::pin(async move { found.ok_or(ChunkStoreError::NotFound(address)) })
    }

    fn put(&self, chunk: SocChunk) -> BoxFuture<'_, Result<(), ChunkStoreError>> {
        self.chunks.lock().unwrap().insert(chunk.address(), chunk);
        Box::pin(async { Ok(()) })
    }
}
