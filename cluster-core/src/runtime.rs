//! Node assembly and event loop
//!
//! Builds the overlay core out of its subsystems, wires their seams
//! together and runs until ctrl-c. The transport layer attaches to the
//! assembled node through the underlay and payment seams.

use crate::accounting::Accounting;
use crate::address::{AddressError, Signer};
use crate::addressbook::AddressBook;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::hive::Hive;
use crate::kademlia::{Kademlia, TopologyEvent};
use crate::metrics::Metrics;
use crate::pricer::Pricer;
use crate::pricing::Pricing;
use crate::pseudosettle::Pseudosettle;
use crate::statestore::{RocksStateStore, StateStore, StoreError};
use libp2p::Multiaddr;
use rand::RngCore;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tracing::{debug, info, warn};

const KEY_KEY: &str = "node_private_key";
const NONCE_KEY: &str = "node_overlay_nonce";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("identity error: {0}")]
    Address(#[from] AddressError),

    #[error("invalid bootnode address {0:?}")]
    BadBootnode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The assembled overlay core.
pub struct Node {
    pub signer: Signer,
    pub overlay: crate::address::OverlayAddress,
    pub store: Arc<dyn StateStore>,
    pub addressbook: AddressBook,
    pub accounting: Accounting,
    pub pseudosettle: Pseudosettle,
    pub pricing: Pricing,
    pub pricer: Pricer,
    pub kademlia: Kademlia,
    pub hive: Hive,
    pub dispatcher: Dispatcher,
    pub metrics: Metrics,
    pub bootnodes: Vec<Multiaddr>,
}

/// Build the node on top of an opened state store. Identity is loaded
/// from the store or created on first run.
pub fn build_node(config: &Config, store: Arc<dyn StateStore>) -> Result<Node, RuntimeError> {
    let (signer, nonce) = load_or_create_identity(store.as_ref())?;
    let overlay = signer.overlay(config.network_id, &nonce)?;
    info!(overlay = %overlay, network_id = config.network_id, "node identity ready");

    let metrics = Metrics::new();
    let addressbook = AddressBook::new(store.clone());
    let accounting = Accounting::new(config.accounting(), store.clone(), metrics.clone());
    let pseudosettle = Pseudosettle::new(accounting.clone(), store.clone(), metrics.clone());
    accounting.set_settlement(Arc::new(pseudosettle.clone()));

    let pricing = Pricing::new(accounting.clone(), config.payment_threshold);
    let pricer = Pricer::with_base_price(overlay, config.base_price);

    let kademlia = Kademlia::new(
        overlay,
        config.kademlia(),
        addressbook.clone(),
        store.clone(),
        metrics.clone(),
    );
    let hive = Hive::new(
        config.hive(),
        addressbook.clone(),
        kademlia.clone(),
        metrics.clone(),
    );
    let dispatcher = Dispatcher::new(num_cpus::get());

    let bootnodes = config
        .bootnodes
        .iter()
        .map(|addr| {
            addr.parse::<Multiaddr>()
                .map_err(|_| RuntimeError::BadBootnode(addr.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Node {
        signer,
        overlay,
        store,
        addressbook,
        accounting,
        pseudosettle,
        pricing,
        pricer,
        kademlia,
        hive,
        dispatcher,
        metrics,
        bootnodes,
    })
}

/// Run the Cluster node with the given configuration
pub async fn run_node(config: Config) -> Result<(), RuntimeError> {
    std::fs::create_dir_all(&config.data_dir)?;
    let store: Arc<dyn StateStore> =
        Arc::new(RocksStateStore::open(config.data_dir.join("statestore"))?);
    let node = build_node(&config, store)?;

    info!("Node started with overlay address: {}", node.overlay);
    info!("P2P port {}, API port {}", config.p2p_port, config.api_port);
    for bootnode in &node.bootnodes {
        info!(bootnode = %bootnode, "configured bootnode");
    }

    let topology = node.kademlia.clone();
    let connect_loop = tokio::spawn(topology.run());

    let mut events = node.kademlia.subscribe();
    let full_node = config.full_node;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(TopologyEvent::Connected(peer)) => {
                        node.accounting.connect(&peer, full_node);
                        node.pseudosettle.connect(&peer, full_node);
                        debug!(peer = %peer, "session accounting started");
                    }
                    Ok(TopologyEvent::Disconnected(peer)) => {
                        node.pseudosettle.disconnect(&peer);
                        node.accounting.disconnect(&peer);
                        debug!(peer = %peer, "session accounting stopped");
                    }
                    Err(err) => {
                        warn!(error = %err, "topology event stream lagged");
                    }
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    node.kademlia.shutdown();
    node.dispatcher.shutdown();
    let _ = connect_loop.await;

    info!("Node stopped");
    Ok(())
}

/// Load the signing key and overlay nonce, creating both on first run.
fn load_or_create_identity(store: &dyn StateStore) -> Result<(Signer, [u8; 32]), RuntimeError> {
    let signer = match store.get(KEY_KEY) {
        Ok(bytes) => Signer::from_bytes(&bytes)?,
        Err(StoreError::NotFound(_)) => {
            let signer = Signer::random();
            store.put(KEY_KEY, &signer.to_bytes())?;
            info!("generated new node key");
            signer
        }
        Err(err) => return Err(err.into()),
    };

    let nonce = match store.get(NONCE_KEY) {
        Ok(bytes) => bytes
            .try_into()
            .map_err(|_| AddressError::InvalidAddress)?,
        Err(StoreError::NotFound(_)) => {
            let mut nonce = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut nonce);
            store.put(NONCE_KEY, &nonce)?;
            nonce
        }
        Err(err) => return Err(err.into()),
    };

    Ok((signer, nonce))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statestore::MemStateStore;

    #[test]
    fn test_identity_persists() {
        let store = MemStateStore::new();

        let (first, first_nonce) = load_or_create_identity(&store).unwrap();
        let (second, second_nonce) = load_or_create_identity(&store).unwrap();

        assert_eq!(first.eth_address(), second.eth_address());
        assert_eq!(first_nonce, second_nonce);
    }

    #[tokio::test]
    async fn test_build_node_wires_subsystems() {
        let config = Config {
            bootnodes: vec!["/ip4/10.0.0.1/tcp/1634".to_string()],
            ..Config::default()
        };
        let store: Arc<dyn StateStore> = Arc::new(MemStateStore::new());

        let node = build_node(&config, store).unwrap();
        assert_eq!(node.kademlia.base(), node.overlay);
        assert_eq!(node.bootnodes.len(), 1);

        // Accounting accepts work for a connected peer, which means the
        // settlement seam behind it is in place.
        let peer = crate::address::OverlayAddress([7; 32]);
        node.accounting.connect(&peer, true);
        let action = node.accounting.prepare_debit(&peer, 100);
        action.cleanup();
    }

    #[tokio::test]
    async fn test_bad_bootnode_rejected() {
        let config = Config {
            bootnodes: vec!["not-a-multiaddr".to_string()],
            ..Config::default()
        };
        let store: Arc<dyn StateStore> = Arc::new(MemStateStore::new());

        assert!(matches!(
            build_node(&config, store),
            Err(RuntimeError::BadBootnode(_))
        ));
    }
}
