//! Sequence-indexed feeds
//!
//! Updates occupy consecutive indices starting at zero, so the latest
//! update at or before a query time sits just below the first gap. The
//! sequential finder walks the indices one by one; the concurrent
//! finder probes a window of indices at a time and confirms the gap
//! with a second miss before concluding.

use super::{probe, Feed, FeedError, FeedIndex, FeedUpdate};
use crate::address::Signer;
use crate::metrics::Metrics;
use crate::soc::{ChunkStore, SocChunk};
use futures::future::join_all;
use std::sync::Arc;
use tracing::trace;

/// Probes issued per round by the concurrent finder.
const FANOUT: usize = 8;

/// Latest-update lookup over a sequence feed.
#[derive(Clone)]
pub struct SequenceFinder {
    store: Arc<dyn ChunkStore>,
    feed: Feed,
    metrics: Metrics,
}

impl SequenceFinder {
    pub fn new(store: Arc<dyn ChunkStore>, feed: Feed, metrics: Metrics) -> Self {
        Self {
            store,
            feed,
            metrics,
        }
    }

    /// Gallop upward in doubling steps until a probe misses, then
    /// bisect the bracket. Updates carry nondecreasing timestamps and
    /// occupy contiguous indices, so "present with ts at or below the
    /// query" is a monotone predicate.
    pub async fn at(&self, at: u64) -> Result<Option<FeedUpdate>, FeedError> {
        let Some(first) = self.probe_index(0, at).await else {
            return Ok(None);
        };
        let mut best = first;
        let mut low = 0u64;
        let mut step = 1u64;
        let mut high = loop {
            let next = low + step;
            match self.probe_index(next, at).await {
                Some(update) => {
                    best = update;
                    low = next;
                    step = step.saturating_mul(2);
                }
                None => break next,
            }
        };
        while high - low > 1 {
            let mid = low + (high - low) / 2;
            match self.probe_index(mid, at).await {
                Some(update) => {
                    best = update;
                    low = mid;
                }
                None => high = mid,
            }
        }
        trace!(index = low, "sequence lookup done");
        Ok(Some(best))
    }

    /// Same result as [`at`](Self::at), probing `FANOUT` indices per
    /// round. The run ends at the first miss; a second consecutive miss
    /// above it confirms the gap is not a transient store failure.
    pub async fn at_concurrent(&self, at: u64) -> Result<Option<FeedUpdate>, FeedError> {
        let mut best = None;
        let mut base = 0u64;
        loop {
            let probes = (0..FANOUT as u64).map(|offset| self.probe_index(base + offset, at));
            let results = join_all(probes).await;

            let mut gap = None;
            for (offset, result) in results.into_iter().enumerate() {
                match result {
                    Some(update) if gap.is_none() => best = Some(update),
                    Some(_) => {}
                    None => {
                        gap.get_or_insert(offset as u64);
                    }
                }
            }

            let Some(gap) = gap else {
                base += FANOUT as u64;
                continue;
            };

            // Confirm with the probe just past the gap. Inside the
            // window the round already covered it.
            let confirmed = if gap + 1 < FANOUT as u64 {
                true
            } else {
                self.probe_index(base + gap + 1, at).await.is_none()
            };
            if confirmed {
                return Ok(best);
            }
            base += gap;
        }
    }

    async fn probe_index(&self, index: u64, at: u64) -> Option<FeedUpdate> {
        let update = probe(
            self.store.as_ref(),
            &self.feed,
            FeedIndex::Sequence(index),
            &self.metrics,
        )
        .await?;
        (update.timestamp <= at).then_some(update)
    }
}

/// Writes consecutive updates into a sequence feed.
pub struct SequenceUpdater {
    store: Arc<dyn ChunkStore>,
    signer: Signer,
    feed: Feed,
    next: u64,
}

impl SequenceUpdater {
    /// `next` is the first unused index, zero for a fresh feed.
    pub fn new(store: Arc<dyn ChunkStore>, signer: Signer, topic: [u8; 32], next: u64) -> Self {
        let feed = Feed::new(topic, signer.eth_address());
        Self {
            store,
            signer,
            feed,
            next,
        }
    }

    pub fn feed(&self) -> Feed {
        self.feed
    }

    /// Sign and store the update at the next index.
    pub async fn update(&mut self, timestamp: u64, data: &[u8]) -> Result<FeedIndex, FeedError> {
        let index = FeedIndex::Sequence(self.next);
        let chunk = SocChunk::new(&self.signer, self.feed.id(&index), timestamp, data)?;
        self.store.put(chunk).await?;
        self.next += 1;
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soc::MemChunkStore;

    fn signer() -> Signer {
        let mut bytes = [0u8; 32];
        bytes[31] = 7;
        Signer::from_bytes(&bytes).unwrap()
    }

    async fn populated(timestamps: &[u64]) -> (SequenceFinder, Feed) {
        let store = MemChunkStore::new();
        let signer = signer();
        let mut updater = SequenceUpdater::new(Arc::new(store.clone()), signer, [0xaa; 32], 0);
        for (i, ts) in timestamps.iter().enumerate() {
            updater.update(*ts, format!("update-{i}").as_bytes()).await.unwrap();
        }
        let feed = updater.feed();
        (
            SequenceFinder::new(Arc::new(store), feed, Metrics::new()),
            feed,
        )
    }

    #[tokio::test]
    async fn test_empty_feed_finds_nothing() {
        let (finder, _) = populated(&[]).await;
        assert_eq!(finder.at(1000).await.unwrap(), None);
        assert_eq!(finder.at_concurrent(1000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_latest_at_or_before() {
        let (finder, _) = populated(&[10, 20, 30]).await;

        let update = finder.at(25).await.unwrap().unwrap();
        assert_eq!(update.index, FeedIndex::Sequence(1));
        assert_eq!(update.timestamp, 20);
        assert_eq!(update.payload, b"update-1");

        // Exact hit.
        let update = finder.at(30).await.unwrap().unwrap();
        assert_eq!(update.index, FeedIndex::Sequence(2));

        // Before the first update.
        assert_eq!(finder.at(5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_matches_sequential() {
        // Long enough to span several fan-out rounds.
        let timestamps: Vec<u64> = (0..30).map(|i| i * 10).collect();
        let (finder, _) = populated(&timestamps).await;

        for at in [0, 95, 144, 290, 10_000] {
            let sequential = finder.at(at).await.unwrap();
            let concurrent = finder.at_concurrent(at).await.unwrap();
            assert_eq!(sequential, concurrent, "diverged at {at}");
        }
    }

    #[tokio::test]
    async fn test_updater_advances_index() {
        let store = Arc::new(MemChunkStore::new());
        let mut updater = SequenceUpdater::new(store.clone(), signer(), [1; 32], 0);

        assert_eq!(updater.update(1, b"a").await.unwrap(), FeedIndex::Sequence(0));
        assert_eq!(updater.update(2, b"b").await.unwrap(), FeedIndex::Sequence(1));
        assert_eq!(store.len(), 2);
    }
}
