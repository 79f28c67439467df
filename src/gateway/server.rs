//! Gateway connection server
//!
//! Accepts client sockets, runs one handler thread per connection, and
//! broadcasts indications to every live connection. The broadcast restarts
//! its registry scan from the head after every delivery, so connections
//! appearing or dying mid-broadcast never corrupt the walk: each live
//! connection gets at most one copy per call, dead ones are skipped, and a
//! dead connection is only reaped by its own handler once it is no longer
//! the target of an in-flight delivery.

use super::codec::{self, GwFrame, GwRequest, TxDataReq};
use super::connection::GatewayConnection;
use crate::collector::{Collector, IndicationSink, NetworkSnapshot};
use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::mac::{Address, CoordState, DeviceDescriptor};
use crate::nv::{DeviceRecord, DeviceStore};
use crate::oad::OadCoordinator;
use parking_lot::Mutex;
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Shared registry of live gateway connections
///
/// Every flag flip and every scan happens under the one internal lock; the
/// lock is never held across a socket send.
pub struct ConnectionRegistry {
    inner: Mutex<Vec<Arc<GatewayConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, conn: Arc<GatewayConnection>) {
        self.inner.lock().push(conn);
    }

    pub fn remove(&self, id: u32) {
        self.inner.lock().retain(|c| c.id != id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.inner.lock().iter().any(|c| c.id == id)
    }

    pub fn mark_all_idle(&self) {
        for conn in self.inner.lock().iter() {
            conn.set_busy(false);
        }
    }

    pub fn mark_dead(&self, id: u32) {
        for conn in self.inner.lock().iter() {
            if conn.id == id {
                conn.set_dead();
            }
        }
    }

    pub fn mark_all_dead(&self) {
        for conn in self.inner.lock().iter() {
            conn.set_dead();
        }
    }

    pub fn is_busy(&self, id: u32) -> bool {
        self.inner
            .lock()
            .iter()
            .any(|c| c.id == id && c.is_busy())
    }

    /// Scan from the head for the first connection that is neither dead
    /// nor busy, claim it busy, and hand it out.
    fn claim_next_ready(&self) -> Option<Arc<GatewayConnection>> {
        let conns = self.inner.lock();
        for conn in conns.iter() {
            if conn.is_dead() || conn.is_busy() {
                continue;
            }
            conn.set_busy(true);
            return Some(Arc::clone(conn));
        }
        None
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcast fan-out over the registry; also the collector's indication
/// sink.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Arc<Self> {
        Arc::new(Self { registry })
    }

    /// Deliver one frame to every live connection.
    pub fn broadcast(&self, frame: &GwFrame) {
        let bytes = frame.to_bytes();

        // Round starts with everyone idle
        self.registry.mark_all_idle();

        loop {
            // Restart the scan from the head each time: the registry may
            // have gained or lost entries while we were sending.
            let Some(conn) = self.registry.claim_next_ready() else {
                break;
            };
            if let Err(e) = conn.send(&bytes) {
                log::debug!("Broadcast to {} failed: {}", conn.dbg_name, e);
                self.registry.mark_dead(conn.id);
            }
            // The claimed connection stays busy: busy doubles as "done
            // this round" until the final idle sweep.
        }

        self.registry.mark_all_idle();
    }
}

impl IndicationSink for Broadcaster {
    fn network_update(&self, _restored: bool, snapshot: &NetworkSnapshot) {
        self.broadcast(&codec::nwk_info_ind(snapshot));
    }

    fn state_change(&self, state: CoordState) {
        self.broadcast(&codec::state_change_ind(state));
    }

    fn device_joined(&self, record: &DeviceRecord) {
        self.broadcast(&codec::device_joined_ind(record));
    }

    fn device_not_active(&self, device: &DeviceDescriptor, timeout: bool) {
        self.broadcast(&codec::device_not_active_ind(device, timeout));
    }

    fn device_data(&self, src: &Address, rssi: i8, payload: &[u8]) {
        self.broadcast(&codec::device_data_ind(src, rssi, payload));
    }

    fn remove_device_rsp(&self) {
        self.broadcast(&codec::remove_device_rsp());
    }
}

/// Request dispatch context shared by every handler thread
pub struct HandlerCtx {
    pub collector: Arc<Collector>,
    pub oad: Arc<OadCoordinator>,
    pub store: Arc<DeviceStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub registry: Arc<ConnectionRegistry>,
}

/// The gateway TCP server
pub struct GatewayServer {
    cfg: NetworkConfig,
    ctx: Arc<HandlerCtx>,
    shutdown: Arc<AtomicBool>,
}

impl GatewayServer {
    pub fn new(cfg: NetworkConfig, ctx: Arc<HandlerCtx>, shutdown: Arc<AtomicBool>) -> Self {
        Self { cfg, ctx, shutdown }
    }

    /// Accept loop; returns once shutdown is signalled and every handler
    /// has drained (bounded wait). Failing to bind is a startup error.
    pub fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.cfg.bind_address).map_err(|e| {
            Error::Config(format!("cannot bind {}: {}", self.cfg.bind_address, e))
        })?;
        listener.set_nonblocking(true)?;
        log::info!("Gateway server listening on {}", self.cfg.bind_address);

        let mut next_id: u32 = 0;
        while !self.shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = self.spawn_handler(next_id, stream) {
                        log::error!("Failed to start handler for {}: {}", addr, e);
                    } else {
                        log::info!("Gateway client connected: {} (connection-{})", addr, next_id);
                    }
                    next_id += 1;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    log::error!("Accept error: {}", e);
                }
            }
        }

        // Shutdown: mark everything dead, then give the handlers a
        // bounded window to observe it and drain.
        log::info!("Gateway server shutting down");
        self.ctx.registry.mark_all_dead();
        for _ in 0..100 {
            if self.ctx.registry.len() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }
        Ok(())
    }

    fn spawn_handler(&self, id: u32, stream: TcpStream) -> Result<()> {
        stream.set_nonblocking(false)?;
        let writer = stream.try_clone()?;
        let conn = Arc::new(GatewayConnection::new(id, writer));
        self.ctx.registry.insert(Arc::clone(&conn));

        let ctx = Arc::clone(&self.ctx);
        let timeout = Duration::from_millis(self.cfg.read_timeout_ms);
        thread::Builder::new()
            .name(format!("gw-conn-{id}"))
            .spawn(move || {
                connection_loop(&ctx, &conn, stream, timeout);
                reap_connection(&ctx.registry, &conn);
            })?;
        Ok(())
    }
}

/// Per-connection read/dispatch loop. Exits once the connection is dead.
fn connection_loop(
    ctx: &HandlerCtx,
    conn: &Arc<GatewayConnection>,
    mut reader: TcpStream,
    read_timeout: Duration,
) {
    if let Err(e) = reader.set_read_timeout(Some(read_timeout)) {
        log::warn!("{}: cannot set read timeout: {}", conn.dbg_name, e);
    }

    while !conn.is_dead() {
        match codec::read_frame(&mut reader) {
            Ok(Some(frame)) => dispatch(ctx, conn, &frame),
            Ok(None) => {
                // Quiet socket; loop to re-check the dead flag
            }
            Err(e) => {
                log::info!("{}: transport closed ({})", conn.dbg_name, e);
                ctx.registry.mark_dead(conn.id);
            }
        }
    }
}

/// Remove a dead connection from the registry, but only after any
/// in-flight broadcast targeting it has let go of the busy flag.
fn reap_connection(registry: &ConnectionRegistry, conn: &Arc<GatewayConnection>) {
    while registry.is_busy(conn.id) {
        thread::sleep(Duration::from_millis(10));
    }
    registry.remove(conn.id);
    log::info!("{} reaped", conn.dbg_name);
}

/// Handle one decoded client frame.
fn dispatch(ctx: &HandlerCtx, conn: &Arc<GatewayConnection>, frame: &GwFrame) {
    let request = match codec::parse_request(frame) {
        Ok(Some(request)) => request,
        Ok(None) => {
            log::warn!(
                "{}: unknown command 0x{:02X}/0x{:02X}, discarded",
                conn.dbg_name,
                frame.cmd0,
                frame.cmd1
            );
            return;
        }
        Err(e) => {
            log::warn!("{}: malformed request: {}", conn.dbg_name, e);
            return;
        }
    };

    log::debug!("{}: {:?}", conn.dbg_name, request);
    match request {
        GwRequest::GetNwkInfo => {
            let snapshot = ctx.collector.network_snapshot();
            reply(ctx, conn, &codec::nwk_info_cnf(&snapshot));
        }

        GwRequest::GetDeviceArray => {
            let records = ctx.store.list();
            reply(ctx, conn, &codec::device_array_cnf(0, &records));
        }

        GwRequest::SetJoinPermit { duration_ms } => {
            let status = match ctx.collector.set_join_permit(duration_ms) {
                Ok(()) => 0,
                Err(e) => {
                    log::warn!("Join permit failed: {}", e);
                    1
                }
            };
            ctx.broadcaster.broadcast(&codec::join_permit_cnf(status));
        }

        GwRequest::TxData(tx) => {
            let result = match tx {
                TxDataReq::Config {
                    short_addr,
                    frame_control,
                    reporting_interval_ms,
                    polling_interval_ms,
                } => ctx.collector.send_config_request(
                    short_addr,
                    frame_control,
                    reporting_interval_ms,
                    polling_interval_ms,
                ),
                TxDataReq::Custom {
                    short_addr,
                    msg_id,
                    data,
                } => {
                    let mut payload = Vec::with_capacity(data.len() + 1);
                    payload.push(msg_id);
                    payload.extend_from_slice(&data);
                    ctx.collector.send_app_data(short_addr, &payload)
                }
            };
            let status = match result {
                Ok(()) => 0,
                Err(e) => {
                    log::warn!("Tx data request failed: {}", e);
                    1
                }
            };
            ctx.broadcaster.broadcast(&codec::tx_data_cnf(status));
        }

        GwRequest::RemoveDevice { short_addr } => {
            // The response broadcasts once the disassociation round-trips
            if let Err(e) = ctx.collector.remove_device(short_addr) {
                log::warn!("Remove device 0x{:04X} failed: {}", short_addr, e);
            }
        }

        GwRequest::UpdateFwList { path } => {
            let file_id = ctx.oad.register_file(Path::new(&path));
            reply(ctx, conn, &codec::update_fw_list_cnf(0, file_id));
        }

        GwRequest::FwUpdate {
            short_addr,
            file_id,
            on_chip,
        } => {
            let status = match ctx.oad.start_update(short_addr, file_id, on_chip) {
                Ok(()) => 0,
                Err(e) => {
                    log::warn!("Firmware update start failed: {}", e);
                    1
                }
            };
            reply(ctx, conn, &codec::fw_update_cnf(status));
        }
    }
}

fn reply(ctx: &HandlerCtx, conn: &Arc<GatewayConnection>, frame: &GwFrame) {
    if conn.send(&frame.to_bytes()).is_err() {
        ctx.registry.mark_dead(conn.id);
    }
}
