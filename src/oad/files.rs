//! Firmware image file registry
//!
//! A fixed-capacity rotating list of image files keyed by a small integer
//! id, so clients never pass raw paths across the wire. Registering a path
//! that is already present returns its existing id; once the ring is full
//! the oldest slot is overwritten and the replacement gets a fresh id.

use std::path::{Path, PathBuf};

/// Default registry capacity
pub const MAX_OAD_FILES: usize = 10;

#[derive(Debug, Clone)]
struct FileSlot {
    id: u32,
    path: PathBuf,
}

/// Rotating firmware file registry
pub struct FileRing {
    slots: Vec<FileSlot>,
    capacity: usize,
    /// Monotonic id source, never reused
    next_id: u32,
    /// Slot the next new registration lands in
    next_slot: usize,
}

impl FileRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            next_id: 0,
            next_slot: 0,
        }
    }

    /// Register a file path, idempotently. Returns its id.
    pub fn register(&mut self, path: &Path) -> u32 {
        if let Some(slot) = self.slots.iter().find(|s| s.path == path) {
            log::debug!("Firmware file already registered: id {}", slot.id);
            return slot.id;
        }

        let id = self.next_id;
        self.next_id += 1;

        let slot = FileSlot {
            id,
            path: path.to_path_buf(),
        };
        if self.slots.len() < self.capacity {
            self.slots.push(slot);
        } else {
            self.slots[self.next_slot] = slot;
        }
        log::info!("Registered firmware file id {}: {}", id, path.display());

        self.next_slot = (self.next_slot + 1) % self.capacity;
        id
    }

    /// Path registered under this id.
    pub fn path_for(&self, id: u32) -> Option<&Path> {
        self.slots
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.path.as_path())
    }

    /// Basename of the file registered under this id.
    pub fn file_name_for(&self, id: u32) -> Option<String> {
        self.path_for(id)
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }

    /// Currently retained ids, slot order.
    pub fn ids(&self) -> Vec<u32> {
        self.slots.iter().map(|s| s.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent() {
        let mut ring = FileRing::new(MAX_OAD_FILES);
        let a = ring.register(Path::new("/fw/sensor_a.bin"));
        let b = ring.register(Path::new("/fw/sensor_b.bin"));
        assert_ne!(a, b);
        assert_eq!(ring.register(Path::new("/fw/sensor_a.bin")), a);
        assert_eq!(ring.ids().len(), 2);
    }

    #[test]
    fn eleventh_path_reuses_oldest_slot_with_fresh_id() {
        let mut ring = FileRing::new(MAX_OAD_FILES);
        for i in 0..MAX_OAD_FILES {
            ring.register(Path::new(&format!("/fw/img_{i}.bin")));
        }
        let retained_before = ring.ids();
        assert_eq!(retained_before.len(), MAX_OAD_FILES);

        let eleventh = ring.register(Path::new("/fw/img_10.bin"));
        assert!(!retained_before.contains(&eleventh));
        // Oldest id (0) was evicted, count unchanged
        let retained = ring.ids();
        assert_eq!(retained.len(), MAX_OAD_FILES);
        assert!(!retained.contains(&0));
        assert!(retained.contains(&eleventh));
        // The evicted path no longer resolves
        assert!(ring.path_for(0).is_none());
        assert_eq!(
            ring.path_for(eleventh).unwrap(),
            Path::new("/fw/img_10.bin")
        );
    }

    #[test]
    fn basename_lookup() {
        let mut ring = FileRing::new(4);
        let id = ring.register(Path::new("/srv/images/node_v2.bin"));
        assert_eq!(ring.file_name_for(id).unwrap(), "node_v2.bin");
        assert!(ring.file_name_for(99).is_none());
    }
}
