//! Address book: persistent overlay → signed peer record mapping
//!
//! Thin wrapper over the state store. One entry per overlay address,
//! last writer wins, keyed `addressbook_entry_<overlay-hex>`.

use crate::address::OverlayAddress;
use crate::peer::PeerRecord;
use crate::statestore::{IterOp, StateStore, StoreError};
use libp2p::Multiaddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

const ENTRY_PREFIX: &str = "addressbook_entry_";

#[derive(Debug, Error)]
pub enum AddressBookError {
    #[error("peer record not found: {0}")]
    NotFound(OverlayAddress),

    #[error("malformed peer record for {0}")]
    Malformed(OverlayAddress),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

fn entry_key(overlay: &OverlayAddress) -> String {
    format!("{ENTRY_PREFIX}{}", overlay.to_hex())
}

/// Persistent mapping from overlay addresses to signed peer records.
#[derive(Clone)]
pub struct AddressBook {
    store: Arc<dyn StateStore>,
}

impl AddressBook {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Look up the record for an overlay address.
    pub fn get(&self, overlay: &OverlayAddress) -> Result<PeerRecord, AddressBookError> {
        let bytes = match self.store.get(&entry_key(overlay)) {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => return Err(AddressBookError::NotFound(*overlay)),
            Err(e) => return Err(e.into()),
        };
        PeerRecord::from_json(&bytes).map_err(|_| AddressBookError::Malformed(*overlay))
    }

    /// Store (or overwrite) the record for an overlay address.
    pub fn put(&self, overlay: &OverlayAddress, record: &PeerRecord) -> Result<(), AddressBookError> {
        let bytes = record.to_json()?;
        self.store.put(&entry_key(overlay), &bytes)?;
        trace!(overlay = %overlay, "stored address book entry");
        Ok(())
    }

    /// Remove the record for an overlay address. Idempotent.
    pub fn remove(&self, overlay: &OverlayAddress) -> Result<(), AddressBookError> {
        self.store.delete(&entry_key(overlay))?;
        Ok(())
    }

    /// All known overlay addresses, in key order.
    pub fn overlays(&self) -> Result<Vec<OverlayAddress>, AddressBookError> {
        let mut overlays = Vec::new();
        self.iterate(&mut |record| {
            overlays.push(record.overlay);
            Ok(IterOp::Continue)
        })?;
        Ok(overlays)
    }

    /// All known underlay multiaddresses, in key order.
    pub fn addresses(&self) -> Result<Vec<Multiaddr>, AddressBookError> {
        let mut addresses = Vec::new();
        self.iterate(&mut |record| {
            addresses.push(record.underlay.clone());
            Ok(IterOp::Continue)
        })?;
        Ok(addresses)
    }

    /// Iterate all records in key order. The callback may stop early;
    /// callback errors abort the scan and surface to the caller.
    pub fn iterate(
        &self,
        cb: &mut dyn FnMut(&PeerRecord) -> Result<IterOp, StoreError>,
    ) -> Result<(), AddressBookError> {
        self.store.iterate(ENTRY_PREFIX, &mut |key, value| {
            let record = PeerRecord::from_json(value).map_err(|_| {
                StoreError::IterationAborted(format!("malformed record at {key}"))
            })?;
            cb(&record)
        })?;
        Ok(())
    }
}
