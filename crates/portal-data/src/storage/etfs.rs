use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::storage::backend::{read_json, write_json, TieredStorage, RECENT_ETFS_KEY};
use crate::storage::now_millis;

/// An ETF the user created from this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentEtf {
    pub address: Address,
    pub name: String,
    pub symbol: String,
    pub chain_id: u64,
    /// Unix milliseconds.
    pub created_at: i64,
}

/// Recently created ETFs, newest first, one entry per address.
pub struct RecentEtfs {
    storage: Arc<TieredStorage>,
    etfs: Mutex<Vec<RecentEtf>>,
    capacity: usize,
}

impl RecentEtfs {
    pub fn load(storage: Arc<TieredStorage>, capacity: usize) -> Self {
        let mut etfs: Vec<RecentEtf> =
            read_json(storage.active().as_ref(), RECENT_ETFS_KEY).unwrap_or_default();
        etfs.truncate(capacity);
        Self {
            storage,
            etfs: Mutex::new(etfs),
            capacity,
        }
    }

    pub fn add_etf(&self, address: Address, name: &str, symbol: &str, chain_id: u64) -> RecentEtf {
        let etf = RecentEtf {
            address,
            name: name.to_string(),
            symbol: symbol.to_string(),
            chain_id,
            created_at: now_millis(),
        };
        let mut etfs = self.etfs.lock();
        etfs.retain(|e| e.address != address);
        etfs.insert(0, etf.clone());
        etfs.truncate(self.capacity);
        // Held across the write so stored snapshots follow update order.
        if let Err(e) = write_json(self.storage.active().as_ref(), RECENT_ETFS_KEY, &*etfs) {
            tracing::warn!(error = %e, "failed to persist recent etfs");
        }
        etf
    }

    pub fn clear_etfs(&self) {
        let mut etfs = self.etfs.lock();
        etfs.clear();
        if let Err(e) = self.storage.active().remove(RECENT_ETFS_KEY) {
            tracing::warn!(error = %e, "failed to clear stored recent etfs");
        }
    }

    pub fn etfs(&self) -> Vec<RecentEtf> {
        self.etfs.lock().clone()
    }
}
