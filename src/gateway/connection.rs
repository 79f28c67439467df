//! Gateway client connection record
//!
//! One record per accepted socket, owned by the connection registry. The
//! `busy`/`dead` flags drive the broadcast scan and the handler's teardown
//! ordering; both are only flipped through registry methods that hold the
//! registry lock.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};

/// One gateway client connection
pub struct GatewayConnection {
    pub id: u32,
    pub dbg_name: String,
    writer: Mutex<TcpStream>,
    busy: AtomicBool,
    dead: AtomicBool,
}

impl GatewayConnection {
    pub fn new(id: u32, writer: TcpStream) -> Self {
        Self {
            id,
            dbg_name: format!("connection-{id}"),
            writer: Mutex::new(writer),
            busy: AtomicBool::new(false),
            dead: AtomicBool::new(false),
        }
    }

    /// Write a complete frame to the client. Never called under the
    /// registry lock.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(bytes).map_err(|_| Error::TransportDead)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    pub(super) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Relaxed);
    }

    pub(super) fn set_dead(&self) {
        self.dead.store(true, Ordering::Relaxed);
    }
}
