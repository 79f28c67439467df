//! Operator display collaborator
//!
//! The original deployment mirrored progress onto an LCD/console. The
//! daemon only depends on this narrow sink; the default implementation
//! routes everything through the logger.

use crate::mac::{CoordState, NetworkInfo};
use std::time::Duration;

/// Display update points surfaced by the collector and OAD engine
pub trait DisplaySink: Send + Sync {
    fn network_update(&self, restored: bool, info: &NetworkInfo);
    fn state_change(&self, state: CoordState);
    fn device_joined(&self, short_addr: u16);
    fn config_response(&self, short_addr: u16);
    fn device_not_responding(&self, short_addr: u16);
    fn firmware_version(&self, short_addr: u16, version: &str);
    fn oad_progress(&self, short_addr: u16, block: u16, total: u16, elapsed: Duration);
    fn oad_complete(&self, short_addr: u16, total: u16, elapsed: Duration);
}

/// Log-backed display
pub struct LogDisplay;

impl DisplaySink for LogDisplay {
    fn network_update(&self, restored: bool, info: &NetworkInfo) {
        log::info!(
            "Network {}: pan 0x{:04X} channel {} fh={}",
            if restored { "restored" } else { "started" },
            info.device.pan_id,
            info.channel,
            info.fh_enabled
        );
    }

    fn state_change(&self, state: CoordState) {
        log::info!("Coordinator state: {:?}", state);
    }

    fn device_joined(&self, short_addr: u16) {
        log::info!("Device 0x{:04X} joined", short_addr);
    }

    fn config_response(&self, short_addr: u16) {
        log::info!("Device 0x{:04X} configured", short_addr);
    }

    fn device_not_responding(&self, short_addr: u16) {
        log::warn!("Device 0x{:04X} not responding", short_addr);
    }

    fn firmware_version(&self, short_addr: u16, version: &str) {
        log::info!("Device 0x{:04X} firmware: {}", short_addr, version);
    }

    fn oad_progress(&self, short_addr: u16, block: u16, total: u16, elapsed: Duration) {
        log::info!(
            "OAD 0x{:04X}: block {}/{} ({}s)",
            short_addr,
            block + 1,
            total,
            elapsed.as_secs()
        );
    }

    fn oad_complete(&self, short_addr: u16, total: u16, elapsed: Duration) {
        log::info!(
            "OAD 0x{:04X}: transfer of {} blocks complete in {}s",
            short_addr,
            total,
            elapsed.as_secs()
        );
    }
}
