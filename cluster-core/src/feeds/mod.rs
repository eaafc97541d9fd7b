//! Authenticated data feeds
//!
//! A feed is a logical stream of updates by one owner under one topic,
//! carried as single-owner chunks. Each update lives at an index within
//! an index scheme; lookup returns the latest update whose timestamp is
//! at or before a query time.
//!
//! Two schemes are provided: a monotone sequence index and a base-2
//! epoch interval tree.

pub mod epoch;
pub mod sequence;

use crate::address::{EthAddress, OverlayAddress};
use crate::metrics::Metrics;
use crate::soc::{soc_address, ChunkStore, SocChunk};
use epoch::EpochIndex;
use sha3::{Digest, Sha3_256};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    /// Unknown index scheme tag on the API boundary.
    #[error("feed type not found: {0:?}")]
    FeedTypeNotFound(String),

    #[error("chunk store error: {0}")]
    Store(#[from] crate::soc::ChunkStoreError),

    #[error("soc error: {0}")]
    Soc(#[from] crate::soc::SocError),
}

/// Index scheme selector, as it appears on the API boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedType {
    Sequence,
    Epoch,
}

impl FromStr for FeedType {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, FeedError> {
        match s.to_ascii_lowercase().as_str() {
            "sequence" => Ok(Self::Sequence),
            "epoch" => Ok(Self::Epoch),
            other => Err(FeedError::FeedTypeNotFound(other.to_string())),
        }
    }
}

/// Position of an update within its scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedIndex {
    Sequence(u64),
    Epoch(EpochIndex),
}

impl FeedIndex {
    /// Canonical serialisation hashed into the chunk identifier.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Sequence(index) => index.to_be_bytes().to_vec(),
            Self::Epoch(epoch) => epoch.to_bytes().to_vec(),
        }
    }
}

/// `(topic, owner)` pair addressing one stream of updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Feed {
    pub topic: [u8; 32],
    pub owner: EthAddress,
}

impl Feed {
    pub fn new(topic: [u8; 32], owner: EthAddress) -> Self {
        Self { topic, owner }
    }

    /// Chunk identifier for an index: `SHA3-256(topic ‖ index_bytes)`.
    pub fn id(&self, index: &FeedIndex) -> [u8; 32] {
        let mut hasher = Sha3_256::new();
        hasher.update(self.topic);
        hasher.update(index.to_bytes());
        hasher.finalize().into()
    }

    /// Content address of the update chunk at an index.
    pub fn chunk_address(&self, index: &FeedIndex) -> OverlayAddress {
        soc_address(&self.id(index), &self.owner)
    }
}

/// A located feed update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedUpdate {
    pub index: FeedIndex,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl FeedUpdate {
    fn from_chunk(index: FeedIndex, chunk: &SocChunk) -> Option<Self> {
        Some(Self {
            index,
            timestamp: chunk.timestamp().ok()?,
            payload: chunk.user_payload().to_vec(),
        })
    }
}

/// Probe for a verified update at an index. Missing chunks, foreign
/// owners and malformed payloads all read as absence.
pub(crate) async fn probe(
    store: &dyn ChunkStore,
    feed: &Feed,
    index: FeedIndex,
    metrics: &Metrics,
) -> Option<FeedUpdate> {
    metrics.feed_probe();
    let address = feed.chunk_address(&index);
    let chunk = store.get(&address).await.ok()?;
    if chunk.verify().is_err() || chunk.owner != feed.owner {
        return None;
    }
    FeedUpdate::from_chunk(index, &chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_type_parsing() {
        assert_eq!("sequence".parse::<FeedType>().unwrap(), FeedType::Sequence);
        assert_eq!("Epoch".parse::<FeedType>().unwrap(), FeedType::Epoch);
        assert!(matches!(
            "merkle".parse::<FeedType>(),
            Err(FeedError::FeedTypeNotFound(_))
        ));
    }

    #[test]
    fn test_index_serialisation() {
        assert_eq!(
            FeedIndex::Sequence(0x0102).to_bytes(),
            vec![0, 0, 0, 0, 0, 0, 1, 2]
        );

        let epoch = FeedIndex::Epoch(EpochIndex::new(16, 4));
        let bytes = epoch.to_bytes();
        assert_eq!(bytes.len(), 9);
        assert_eq!(&bytes[..8], &16u64.to_be_bytes());
        assert_eq!(bytes[8], 4);
    }

    #[test]
    fn test_feed_ids_distinct() {
        let feed = Feed::new([1u8; 32], EthAddress([2u8; 20]));
        let a = feed.id(&FeedIndex::Sequence(0));
        let b = feed.id(&FeedIndex::Sequence(1));
        assert_ne!(a, b);

        let other_topic = Feed::new([9u8; 32], EthAddress([2u8; 20]));
        assert_ne!(a, other_topic.id(&FeedIndex::Sequence(0)));
    }
}
