//! Epoch-indexed feeds
//!
//! Updates live in a sparse base-2 interval tree over time. An index
//! `(start, level)` names the half-open window `[start, start + 2^level)`
//! with `start` aligned to `2^level`; the root `(0, 32)` covers all of
//! time. An update at time `t` is written into the smallest window
//! enclosing both `t` and the previous update's time, which keeps every
//! update reachable from the root by the descent below.
//!
//! Lookup walks the tree from the root. A node holding an update at or
//! before the query time descends along the query; a missing or too-new
//! node explores its right subtree before its left, since any update on
//! the right has a later window than everything on the left.

use super::{probe, Feed, FeedError, FeedIndex, FeedUpdate};
use crate::address::Signer;
use crate::metrics::Metrics;
use crate::soc::{ChunkStore, SocChunk};
use futures::future::{select, BoxFuture, Either};
use std::sync::Arc;

pub const MAX_LEVEL: u8 = 32;

/// One window of the interval tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EpochIndex {
    pub start: u64,
    pub level: u8,
}

impl EpochIndex {
    pub const ROOT: Self = Self {
        start: 0,
        level: MAX_LEVEL,
    };

    /// Clamps the level and aligns the start to the window size.
    pub fn new(start: u64, level: u8) -> Self {
        let level = level.min(MAX_LEVEL);
        let span = 1u64 << level;
        Self {
            start: start & !(span - 1),
            level,
        }
    }

    fn span(&self) -> u64 {
        1u64 << self.level
    }

    /// Exclusive window end. The root covers all non-negative time.
    fn end(&self) -> u128 {
        if self.level >= MAX_LEVEL {
            u128::MAX
        } else {
            self.start as u128 + self.span() as u128
        }
    }

    pub fn contains(&self, t: u64) -> bool {
        self.level >= MAX_LEVEL || (t >= self.start && t - self.start < self.span())
    }

    /// Boundary between the two child windows.
    pub fn mid(&self) -> u64 {
        self.start + self.span() / 2
    }

    pub fn left(&self) -> Option<Self> {
        (self.level > 0).then(|| Self {
            start: self.start,
            level: self.level - 1,
        })
    }

    pub fn right(&self) -> Option<Self> {
        (self.level > 0).then(|| Self {
            start: self.mid(),
            level: self.level - 1,
        })
    }

    pub fn parent(&self) -> Self {
        if self.level >= MAX_LEVEL {
            *self
        } else {
            Self::new(self.start, self.level + 1)
        }
    }

    /// `start_BE64 ‖ level`, hashed into the chunk identifier.
    pub fn to_bytes(&self) -> [u8; 9] {
        let mut bytes = [0u8; 9];
        bytes[..8].copy_from_slice(&self.start.to_be_bytes());
        bytes[8] = self.level;
        bytes
    }
}

/// Index for the update after `prev`: the smallest window enclosing
/// both the previous update time and the new one. A fresh feed starts
/// at the root. If the minimal cover is `prev` itself, the index steps
/// down to the child holding `t` so the previous chunk is not
/// overwritten.
pub fn next_index(prev: Option<(EpochIndex, u64)>, t: u64) -> EpochIndex {
    let Some((prev, last_t)) = prev else {
        return EpochIndex::ROOT;
    };
    let mut level = 0u8;
    while level < MAX_LEVEL && (last_t >> level) != (t >> level) {
        level += 1;
    }
    let next = EpochIndex::new(t, level);
    if next != prev {
        return next;
    }
    match if t >= prev.mid() { prev.right() } else { prev.left() } {
        Some(child) => child,
        None => prev,
    }
}

/// Latest-update lookup over an epoch feed.
#[derive(Clone)]
pub struct EpochFinder {
    store: Arc<dyn ChunkStore>,
    feed: Feed,
    metrics: Metrics,
}

impl EpochFinder {
    pub fn new(store: Arc<dyn ChunkStore>, feed: Feed, metrics: Metrics) -> Self {
        Self {
            store,
            feed,
            metrics,
        }
    }

    /// Latest update with `after <= ts <= at`, walking one branch at a
    /// time.
    pub async fn at(&self, at: u64, after: u64) -> Result<Option<FeedUpdate>, FeedError> {
        Ok(self.walk(EpochIndex::ROOT, at, after).await)
    }

    /// Same result as [`at`](Self::at) with sibling subtrees explored
    /// concurrently. A find in the right subtree cancels the left walk,
    /// which cannot hold a later window.
    pub async fn at_concurrent(
        &self,
        at: u64,
        after: u64,
    ) -> Result<Option<FeedUpdate>, FeedError> {
        Ok(self.walk_concurrent(EpochIndex::ROOT, at, after).await)
    }

    fn walk(&self, node: EpochIndex, at: u64, after: u64) -> BoxFuture<'_, Option<FeedUpdate>> {
        Box::pin(async move {
            if node.start > at || node.end() <= after as u128 {
                return None;
            }
            match self.probe_node(node).await {
                Some(update) if update.timestamp <= at => {
                    let candidate = (update.timestamp >= after).then_some(update);
                    let deeper = match self.child_along(node, at) {
                        Some(child) => self.walk(child, at, after).await,
                        None => None,
                    };
                    deeper.or(candidate)
                }
                _ => {
                    let (Some(left), Some(right)) = (node.left(), node.right()) else {
                        return None;
                    };
                    if let Some(update) = self.walk(right, at, after).await {
                        return Some(update);
                    }
                    self.walk(left, at, after).await
                }
            }
        })
    }

    fn walk_concurrent(
        &self,
        node: EpochIndex,
        at: u64,
        after: u64,
    ) -> BoxFuture<'_, Option<FeedUpdate>> {
        Box::pin(async move {
            if node.start > at || node.end() <= after as u128 {
                return None;
            }
            match self.probe_node(node).await {
                Some(update) if update.timestamp <= at => {
                    let candidate = (update.timestamp >= after).then_some(update);
                    let deeper = match self.child_along(node, at) {
                        Some(child) => self.walk_concurrent(child, at, after).await,
                        None => None,
                    };
                    deeper.or(candidate)
                }
                _ => {
                    let (Some(left), Some(right)) = (node.left(), node.right()) else {
                        return None;
                    };
                    let right_walk = self.walk_concurrent(right, at, after);
                    let left_walk = self.walk_concurrent(left, at, after);
                    futures::pin_mut!(right_walk, left_walk);
                    match select(right_walk, left_walk).await {
                        // Right find wins; dropping the left walk
                        // abandons its whole subtree.
                        Either::Left((Some(update), _)) => Some(update),
                        Either::Left((None, left_rest)) => left_rest.await,
                        Either::Right((left_result, right_rest)) => {
                            right_rest.await.or(left_result)
                        }
                    }
                }
            }
        })
    }

    fn child_along(&self, node: EpochIndex, at: u64) -> Option<EpochIndex> {
        if at >= node.mid() {
            node.right()
        } else {
            node.left()
        }
    }

    async fn probe_node(&self, node: EpochIndex) -> Option<FeedUpdate> {
        probe(
            self.store.as_ref(),
            &self.feed,
            FeedIndex::Epoch(node),
            &self.metrics,
        )
        .await
    }
}

/// Writes updates into an epoch feed.
pub struct EpochUpdater {
    store: Arc<dyn ChunkStore>,
    signer: Signer,
    feed: Feed,
    prev: Option<(EpochIndex, u64)>,
}

impl EpochUpdater {
    pub fn new(store: Arc<dyn ChunkStore>, signer: Signer, topic: [u8; 32]) -> Self {
        let feed = Feed::new(topic, signer.eth_address());
        Self {
            store,
            signer,
            feed,
            prev: None,
        }
    }

    pub fn feed(&self) -> Feed {
        self.feed
    }

    /// Sign and store an update at time `timestamp`. Update times must
    /// not decrease across calls.
    pub async fn update(&mut self, timestamp: u64, data: &[u8]) -> Result<FeedIndex, FeedError> {
        let epoch = next_index(self.prev, timestamp);
        let index = FeedIndex::Epoch(epoch);
        let chunk = SocChunk::new(&self.signer, self.feed.id(&index), timestamp, data)?;
        self.store.put(chunk).await?;
        self.prev = Some((epoch, timestamp));
        Ok(index)
    }
}
