//! Device table persistence
//!
//! Each associated device is one sub-record under the device-list item; the
//! record count lives in its own item so enumeration can stop early. Sub
//! ids are not compacted on removal, so every scan is bounded by twice the
//! configured device limit.

use super::{NvId, NvStore, ITEM_DEVICELIST, ITEM_DEVICELIST_ENTRIES, ITEM_NETWORK_INFO, SYSID_APP};
use crate::error::{Error, Result};
use crate::mac::{Address, CapabilityInfo, DeviceDescriptor, ExtAddr, NetworkInfo};
use std::sync::Arc;

/// Serialized record: pan(2) short(2) ext(8) caps(1) frame_counter(4)
const RECORD_LEN: usize = 17;
/// Byte offset of the short address inside a record
const KEY_OFFSET_SHORT: usize = 2;
/// Byte offset of the extended address inside a record
const KEY_OFFSET_EXT: usize = 4;

/// Persisted form of an associated device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device: DeviceDescriptor,
    pub capabilities: CapabilityInfo,
    pub rx_frame_counter: u32,
}

impl DeviceRecord {
    fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0..2].copy_from_slice(&self.device.pan_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.device.short_addr.to_le_bytes());
        out[4..12].copy_from_slice(&self.device.ext_addr);
        out[12] = pack_caps(&self.capabilities);
        out[13..17].copy_from_slice(&self.rx_frame_counter.to_le_bytes());
        out
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < RECORD_LEN {
            return Err(Error::Nv(format!("device record too short: {}", data.len())));
        }
        let mut ext_addr: ExtAddr = [0u8; 8];
        ext_addr.copy_from_slice(&data[4..12]);
        Ok(Self {
            device: DeviceDescriptor {
                pan_id: u16::from_le_bytes([data[0], data[1]]),
                short_addr: u16::from_le_bytes([data[2], data[3]]),
                ext_addr,
            },
            capabilities: unpack_caps(data[12]),
            rx_frame_counter: u32::from_le_bytes([data[13], data[14], data[15], data[16]]),
        })
    }
}

fn pack_caps(caps: &CapabilityInfo) -> u8 {
    (caps.pan_coord as u8)
        | (caps.ffd as u8) << 1
        | (caps.mains_power as u8) << 2
        | (caps.rx_on_when_idle as u8) << 3
        | (caps.security as u8) << 4
        | (caps.alloc_addr as u8) << 5
}

fn unpack_caps(bits: u8) -> CapabilityInfo {
    CapabilityInfo {
        pan_coord: bits & 0x01 != 0,
        ffd: bits & 0x02 != 0,
        mains_power: bits & 0x04 != 0,
        rx_on_when_idle: bits & 0x08 != 0,
        security: bits & 0x10 != 0,
        alloc_addr: bits & 0x20 != 0,
    }
}

/// Device table persistence over an [`NvStore`]
pub struct DeviceStore {
    nv: Arc<dyn NvStore>,
    /// Sub-id scan bound, 2x the device limit
    max_sub_ids: u16,
}

impl DeviceStore {
    pub fn new(nv: Arc<dyn NvStore>, max_devices: usize) -> Self {
        Self {
            nv,
            max_sub_ids: (max_devices * 2) as u16,
        }
    }

    /// Number of stored device records.
    pub fn count(&self) -> u16 {
        self.nv
            .read_item(NvId::new(SYSID_APP, ITEM_DEVICELIST_ENTRIES, 0))
            .filter(|data| data.len() >= 2)
            .map(|data| u16::from_le_bytes([data[0], data[1]]))
            .unwrap_or(0)
    }

    fn save_count(&self, count: u16) -> Result<()> {
        self.nv.write_item(
            NvId::new(SYSID_APP, ITEM_DEVICELIST_ENTRIES, 0),
            &count.to_le_bytes(),
        )
    }

    /// Insert or update a record keyed by extended address. Returns true
    /// when the device was new.
    pub fn put(&self, record: &DeviceRecord) -> Result<bool> {
        if let Some((sub_id, _)) = self.find_sub_by_ext(&record.device.ext_addr) {
            self.nv.write_item(
                NvId::new(SYSID_APP, ITEM_DEVICELIST, sub_id),
                &record.to_bytes(),
            )?;
            return Ok(false);
        }

        // First unused sub id
        let mut slot = None;
        for sub_id in 0..self.max_sub_ids {
            if self
                .nv
                .read_item(NvId::new(SYSID_APP, ITEM_DEVICELIST, sub_id))
                .is_none()
            {
                slot = Some(sub_id);
                break;
            }
        }
        let sub_id = slot.ok_or_else(|| Error::Nv("device list full".into()))?;

        self.nv.write_item(
            NvId::new(SYSID_APP, ITEM_DEVICELIST, sub_id),
            &record.to_bytes(),
        )?;
        self.save_count(self.count() + 1)?;
        Ok(true)
    }

    fn find_sub_by_ext(&self, ext_addr: &ExtAddr) -> Option<(u16, Vec<u8>)> {
        self.nv.read_item_by_key(
            SYSID_APP,
            ITEM_DEVICELIST,
            KEY_OFFSET_EXT,
            ext_addr,
            self.max_sub_ids,
        )
    }

    /// Look a device up by either address form.
    pub fn get(&self, addr: &Address) -> Option<DeviceRecord> {
        let found = match addr {
            Address::Short(short) => self.nv.read_item_by_key(
                SYSID_APP,
                ITEM_DEVICELIST,
                KEY_OFFSET_SHORT,
                &short.to_le_bytes(),
                self.max_sub_ids,
            ),
            Address::Extended(ext) => self.find_sub_by_ext(ext),
        };
        found.and_then(|(_, data)| DeviceRecord::from_bytes(&data).ok())
    }

    /// Short address for an extended address, if known.
    pub fn short_addr_of(&self, ext_addr: &ExtAddr) -> Option<u16> {
        self.get(&Address::Extended(*ext_addr))
            .map(|rec| rec.device.short_addr)
    }

    /// Every stored record, in sub-id order.
    pub fn list(&self) -> Vec<DeviceRecord> {
        let expected = self.count() as usize;
        let mut records = Vec::with_capacity(expected);
        for sub_id in 0..self.max_sub_ids {
            if records.len() >= expected {
                break;
            }
            if let Some(data) = self
                .nv
                .read_item(NvId::new(SYSID_APP, ITEM_DEVICELIST, sub_id))
            {
                if let Ok(record) = DeviceRecord::from_bytes(&data) {
                    records.push(record);
                }
            }
        }
        records
    }

    /// Delete the record for an extended address. Returns the removed
    /// record when one existed.
    pub fn remove(&self, ext_addr: &ExtAddr) -> Result<Option<DeviceRecord>> {
        let Some((sub_id, data)) = self.find_sub_by_ext(ext_addr) else {
            return Ok(None);
        };
        self.nv
            .delete_item(NvId::new(SYSID_APP, ITEM_DEVICELIST, sub_id))?;
        self.save_count(self.count().saturating_sub(1))?;
        Ok(DeviceRecord::from_bytes(&data).ok())
    }

    /// Persist the network information reported at start.
    pub fn save_network_info(&self, info: &NetworkInfo) -> Result<()> {
        let mut data = Vec::with_capacity(14);
        data.extend_from_slice(&info.device.pan_id.to_le_bytes());
        data.extend_from_slice(&info.device.short_addr.to_le_bytes());
        data.extend_from_slice(&info.device.ext_addr);
        data.push(info.channel);
        data.push(info.fh_enabled as u8);
        self.nv
            .write_item(NvId::new(SYSID_APP, ITEM_NETWORK_INFO, 0), &data)
    }

    /// Network information from a previous run, if stored.
    pub fn load_network_info(&self) -> Option<NetworkInfo> {
        let data = self
            .nv
            .read_item(NvId::new(SYSID_APP, ITEM_NETWORK_INFO, 0))?;
        if data.len() < 14 {
            return None;
        }
        let mut ext_addr: ExtAddr = [0u8; 8];
        ext_addr.copy_from_slice(&data[4..12]);
        Some(NetworkInfo {
            device: DeviceDescriptor {
                pan_id: u16::from_le_bytes([data[0], data[1]]),
                short_addr: u16::from_le_bytes([data[2], data[3]]),
                ext_addr,
            },
            channel: data[12],
            fh_enabled: data[13] != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nv::MemNvStore;

    fn record(short: u16, ext_low: u8) -> DeviceRecord {
        DeviceRecord {
            device: DeviceDescriptor {
                pan_id: 0xCAFE,
                short_addr: short,
                ext_addr: [ext_low, 0, 0, 0, 0, 0, 0, 1],
            },
            capabilities: CapabilityInfo {
                ffd: true,
                rx_on_when_idle: true,
                ..Default::default()
            },
            rx_frame_counter: 0,
        }
    }

    fn store() -> DeviceStore {
        DeviceStore::new(Arc::new(MemNvStore::new()), 10)
    }

    #[test]
    fn put_get_remove() {
        let store = store();
        assert!(store.put(&record(1, 0xA0)).unwrap());
        assert!(store.put(&record(2, 0xA1)).unwrap());
        assert_eq!(store.count(), 2);

        let rec = store.get(&Address::Short(2)).unwrap();
        assert_eq!(rec.device.ext_addr[0], 0xA1);
        assert!(rec.capabilities.rx_on_when_idle);

        let removed = store.remove(&[0xA0, 0, 0, 0, 0, 0, 0, 1]).unwrap();
        assert_eq!(removed.unwrap().device.short_addr, 1);
        assert_eq!(store.count(), 1);
        assert!(store.get(&Address::Short(1)).is_none());
    }

    #[test]
    fn put_same_ext_addr_updates_in_place() {
        let store = store();
        assert!(store.put(&record(1, 0xA0)).unwrap());

        let mut updated = record(1, 0xA0);
        updated.rx_frame_counter = 99;
        assert!(!store.put(&updated).unwrap());
        assert_eq!(store.count(), 1);
        assert_eq!(
            store.get(&Address::Short(1)).unwrap().rx_frame_counter,
            99
        );
    }

    #[test]
    fn list_skips_holes() {
        let store = store();
        for i in 0..4u16 {
            store.put(&record(i, i as u8)).unwrap();
        }
        store.remove(&[1, 0, 0, 0, 0, 0, 0, 1]).unwrap();

        let listed = store.list();
        assert_eq!(listed.len(), 3);
        // Sub-id order preserved, hole skipped
        let shorts: Vec<u16> = listed.iter().map(|r| r.device.short_addr).collect();
        assert_eq!(shorts, vec![0, 2, 3]);
    }

    #[test]
    fn network_info_roundtrip() {
        let store = store();
        assert!(store.load_network_info().is_none());
        let info = NetworkInfo {
            device: DeviceDescriptor {
                pan_id: 0x0001,
                short_addr: 0xAABB,
                ext_addr: [9; 8],
            },
            channel: 11,
            fh_enabled: true,
        };
        store.save_network_info(&info).unwrap();
        let loaded = store.load_network_info().unwrap();
        assert_eq!(loaded.device.short_addr, 0xAABB);
        assert!(loaded.fh_enabled);
    }
}
