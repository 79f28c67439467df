//! Persistent store collaborator
//!
//! The gateway persists its device table and network information through a
//! narrow key-value interface so the actual NV backend (flash emulation,
//! file, test memory) stays replaceable. Records are addressed by
//! `(system_id, item_id, sub_id)`; multi-record items use the sub id as the
//! slot number and are searched by a bounded linear scan.

pub mod device_store;

pub use device_store::{DeviceRecord, DeviceStore};

use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Application system id on the store
pub const SYSID_APP: u8 = 1;

/// Item id of the persisted network information
pub const ITEM_NETWORK_INFO: u16 = 0x0001;
/// Item id of the device-list entry count
pub const ITEM_DEVICELIST_ENTRIES: u16 = 0x0004;
/// Item id of the device-list records (one sub id per device)
pub const ITEM_DEVICELIST: u16 = 0x0005;
/// Item id of the coordinator frame counter
pub const ITEM_FRAMECOUNTER: u16 = 0x0006;

/// Store record address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NvId {
    pub system_id: u8,
    pub item_id: u16,
    pub sub_id: u16,
}

impl NvId {
    pub fn new(system_id: u8, item_id: u16, sub_id: u16) -> Self {
        Self {
            system_id,
            item_id,
            sub_id,
        }
    }
}

/// Narrow NV interface
pub trait NvStore: Send + Sync {
    /// Read a whole record, `None` when absent.
    fn read_item(&self, id: NvId) -> Option<Vec<u8>>;

    /// Create or overwrite a record.
    fn write_item(&self, id: NvId, data: &[u8]) -> Result<()>;

    /// Remove a record; removing an absent record is not an error.
    fn delete_item(&self, id: NvId) -> Result<()>;

    /// Scan sub ids `0..max_sub` of `(system_id, item_id)` for the first
    /// record whose bytes at `key_offset` equal `key`. Returns the sub id
    /// and the record.
    fn read_item_by_key(
        &self,
        system_id: u8,
        item_id: u16,
        key_offset: usize,
        key: &[u8],
        max_sub: u16,
    ) -> Option<(u16, Vec<u8>)> {
        for sub_id in 0..max_sub {
            if let Some(data) = self.read_item(NvId::new(system_id, item_id, sub_id)) {
                if data.len() >= key_offset + key.len()
                    && &data[key_offset..key_offset + key.len()] == key
                {
                    return Some((sub_id, data));
                }
            }
        }
        None
    }
}

/// In-process store backend
///
/// Carries the full record semantics of the interface without any
/// persistence; the production NV file driver is an external collaborator.
#[derive(Default)]
pub struct MemNvStore {
    items: Mutex<HashMap<NvId, Vec<u8>>>,
}

impl MemNvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NvStore for MemNvStore {
    fn read_item(&self, id: NvId) -> Option<Vec<u8>> {
        self.items.lock().get(&id).cloned()
    }

    fn write_item(&self, id: NvId, data: &[u8]) -> Result<()> {
        self.items.lock().insert(id, data.to_vec());
        Ok(())
    }

    fn delete_item(&self, id: NvId) -> Result<()> {
        self.items.lock().remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_store_roundtrip() {
        let store = MemNvStore::new();
        let id = NvId::new(SYSID_APP, ITEM_FRAMECOUNTER, 0);
        assert!(store.read_item(id).is_none());

        store.write_item(id, &42u32.to_le_bytes()).unwrap();
        assert_eq!(store.read_item(id).unwrap(), 42u32.to_le_bytes());

        store.delete_item(id).unwrap();
        assert!(store.read_item(id).is_none());
    }

    #[test]
    fn key_scan_finds_record() {
        let store = MemNvStore::new();
        for sub in 0..5u16 {
            let mut rec = vec![0u8; 4];
            rec[2..4].copy_from_slice(&(sub * 10).to_le_bytes());
            store
                .write_item(NvId::new(SYSID_APP, ITEM_DEVICELIST, sub), &rec)
                .unwrap();
        }

        let (sub, rec) = store
            .read_item_by_key(SYSID_APP, ITEM_DEVICELIST, 2, &30u16.to_le_bytes(), 10)
            .unwrap();
        assert_eq!(sub, 3);
        assert_eq!(&rec[2..4], &30u16.to_le_bytes());

        assert!(store
            .read_item_by_key(SYSID_APP, ITEM_DEVICELIST, 2, &99u16.to_le_bytes(), 10)
            .is_none());
    }

    #[test]
    fn key_scan_respects_bound() {
        let store = MemNvStore::new();
        let mut rec = vec![0u8; 4];
        rec[2..4].copy_from_slice(&7u16.to_le_bytes());
        store
            .write_item(NvId::new(SYSID_APP, ITEM_DEVICELIST, 20), &rec)
            .unwrap();

        // Record sits beyond the scan bound
        assert!(store
            .read_item_by_key(SYSID_APP, ITEM_DEVICELIST, 2, &7u16.to_le_bytes(), 10)
            .is_none());
    }
}
