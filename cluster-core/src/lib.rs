//! Cluster Core
//!
//! Overlay-network core for the Cluster storage node: identity and
//! addressing, the persistent address book, Kademlia topology
//! management, hive peer discovery, per-chunk pricing, the credit/debit
//! accounting engine with time-based settlement, and authenticated feed
//! lookup.

pub mod accounting;
pub mod address;
pub mod addressbook;
pub mod config;
pub mod dispatcher;
pub mod feeds;
pub mod hive;
pub mod kademlia;
pub mod messages;
pub mod metrics;
pub mod peer;
pub mod pricer;
pub mod pricing;
pub mod pseudosettle;
pub mod runtime;
pub mod soc;
pub mod statestore;

pub use accounting::{
    Accounting, AccountingConfig, AccountingError, Clock, CreditAction, DebitAction, Disconnecter,
    Settlement,
};
pub use address::{
    derive_overlay, AddressError, EthAddress, OverlayAddress, Signer, MAX_BINS, MAX_PO,
};
pub use addressbook::{AddressBook, AddressBookError};
pub use config::Config;
pub use dispatcher::{Dispatcher, DispatcherError, Job};
pub use feeds::epoch::{EpochFinder, EpochIndex, EpochUpdater};
pub use feeds::sequence::{SequenceFinder, SequenceUpdater};
pub use feeds::{Feed, FeedError, FeedIndex, FeedType, FeedUpdate};
pub use hive::{Hive, HiveConfig, HiveError};
pub use kademlia::{Kademlia, KademliaConfig, TopologyEvent, TopologyStats, Underlay};
pub use messages::{AnnouncePaymentThreshold, MopAddress, Payment, PaymentAck, Peers};
pub use metrics::Metrics;
pub use peer::PeerRecord;
pub use pricer::{Pricer, BASE_PRICE};
pub use pricing::{Pricing, PricingError};
pub use pseudosettle::{PaymentTransport, Pseudosettle, PseudosettleError};
pub use runtime::{build_node, run_node, Node, RuntimeError};
pub use soc::{ChunkStore, ChunkStoreError, MemChunkStore, SocChunk, SocError};
pub use statestore::{MemStateStore, RocksStateStore, StateStore, StoreError};

// Re-export Multiaddr for external use
pub use libp2p::Multiaddr;
