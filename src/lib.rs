//! setu-gw - gateway daemon for an IEEE 802.15.4 sensor network
//!
//! Bridges a sensor network, reached through a MAC co-processor on a UART,
//! to TCP client applications. The collector tracks every associated
//! device and drives its configuration and liveness cycles; the OAD engine
//! serves firmware images to devices in blocks; the gateway server fans
//! indications out to all connected clients.

pub mod app;
pub mod collector;
pub mod config;
pub mod display;
pub mod error;
pub mod gateway;
pub mod mac;
pub mod nv;
pub mod oad;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
