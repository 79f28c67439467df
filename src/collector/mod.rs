//! Association state tracker
//!
//! Owns the device table and drives the two request/response cycles the
//! coordinator runs against every associated sensor: configuration
//! (strictly one request in flight across the whole population) and
//! liveness tracking (round-robin, one retry, then the device is reported
//! not responding).
//!
//! All state transitions happen on the collector thread. Timer callbacks
//! and the MAC reader only post event flags / channel messages; gateway
//! handler threads call the request API, which synchronises on the same
//! device-table lock.

pub mod device;
pub mod events;
pub mod timers;

use crate::config::{CollectorConfig, Config, MacConfig};
use crate::display::DisplaySink;
use crate::error::{Error, Result};
use crate::mac::{
    Address, CapabilityInfo, CoordState, DataRequest, DeviceDescriptor, MacEvent, MacLink, MsduTag,
    NetworkInfo, NetworkMode, TxStatus, INVALID_SHORT_ADDR,
};
use crate::nv::{DeviceRecord, DeviceStore};
use crate::oad::OadCoordinator;
use crossbeam_channel::Receiver;
use device::{ConfigState, DeviceTable, TrackingState};
use events::{
    EventSignal, EVT_BROADCAST, EVT_CONFIG, EVT_OAD_RESET_RETRY, EVT_START, EVT_TRACKING,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use timers::OneShot;

/// Delay before retrying after a failed tracking confirm, ms
const TRACKING_CNF_DELAY_MS: u64 = 2000;

/// Initial delay before broadcast command transmissions in FH mode, ms
const BROADCAST_START_DELAY_MS: u64 = 60_000;

/// Data fields requested from sensors in generated config requests:
/// temperature, light, humidity, message statistics, config settings.
const DEFAULT_CONFIG_FRAME_CONTROL: u16 = 0x001F;

/// 802.15.4 broadcast short address
const BROADCAST_SHORT_ADDR: u16 = 0xFFFF;

/// Application command ids carried in the first byte of sensor payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorCmdId {
    ConfigReq = 1,
    ConfigRsp = 2,
    TrackingReq = 3,
    TrackingRsp = 4,
    SensorData = 5,
    ToggleLedReq = 6,
    ToggleLedRsp = 7,
    RampData = 8,
    Oad = 9,
    BroadcastCtrl = 10,
}

impl SensorCmdId {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => SensorCmdId::ConfigReq,
            2 => SensorCmdId::ConfigRsp,
            3 => SensorCmdId::TrackingReq,
            4 => SensorCmdId::TrackingRsp,
            5 => SensorCmdId::SensorData,
            6 => SensorCmdId::ToggleLedReq,
            7 => SensorCmdId::ToggleLedRsp,
            8 => SensorCmdId::RampData,
            9 => SensorCmdId::Oad,
            10 => SensorCmdId::BroadcastCtrl,
            _ => return None,
        })
    }
}

/// Indications pushed out to the gateway clients
pub trait IndicationSink: Send + Sync {
    fn network_update(&self, restored: bool, snapshot: &NetworkSnapshot);
    fn state_change(&self, state: CoordState);
    fn device_joined(&self, record: &DeviceRecord);
    fn device_not_active(&self, device: &DeviceDescriptor, timeout: bool);
    fn device_data(&self, src: &Address, rssi: i8, payload: &[u8]);
    fn remove_device_rsp(&self);
}

/// Collector statistics, updated on send/confirm/indication edges
#[derive(Debug, Default, Clone)]
pub struct Statistics {
    pub config_request_attempts: u32,
    pub config_requests_sent: u32,
    pub config_responses: u32,
    pub tracking_request_attempts: u32,
    pub tracking_requests_sent: u32,
    pub tracking_responses: u32,
    pub sensor_messages: u32,
    pub channel_access_failures: u32,
    pub ack_failures: u32,
    pub tx_transaction_expired: u32,
    pub tx_transaction_overflow: u32,
    pub other_tx_failures: u32,
    pub broadcast_msgs_sent: u32,
}

/// Point-in-time network view for client queries and indications
#[derive(Debug, Clone, Copy)]
pub struct NetworkSnapshot {
    /// False when the network has not started yet
    pub ok: bool,
    pub info: NetworkInfo,
    pub security_enabled: bool,
    pub mode: NetworkMode,
    pub state: CoordState,
}

struct CollectorState {
    coord_state: CoordState,
    network_info: Option<NetworkInfo>,
    restored: bool,
    fh_enabled: bool,
    msdu_counter: u8,
    stats: Statistics,
}

/// The association state tracker
pub struct Collector {
    cfg: CollectorConfig,
    mac_cfg: MacConfig,
    mac: Arc<dyn MacLink>,
    store: Arc<DeviceStore>,
    display: Arc<dyn DisplaySink>,
    sink: Arc<dyn IndicationSink>,
    signal: Arc<EventSignal>,
    devices: Mutex<DeviceTable>,
    state: Mutex<CollectorState>,
    config_timer: OneShot,
    tracking_timer: OneShot,
    broadcast_timer: OneShot,
    oad: OnceLock<Arc<OadCoordinator>>,
}

impl Collector {
    pub fn new(
        config: &Config,
        mac: Arc<dyn MacLink>,
        store: Arc<DeviceStore>,
        display: Arc<dyn DisplaySink>,
        sink: Arc<dyn IndicationSink>,
        signal: Arc<EventSignal>,
    ) -> Arc<Self> {
        let restored = store.load_network_info().is_some();
        if restored {
            log::info!("Previous network information found, expecting a restore");
        }

        Arc::new(Self {
            cfg: config.collector.clone(),
            mac_cfg: config.mac.clone(),
            mac,
            store,
            display,
            sink,
            signal: Arc::clone(&signal),
            devices: Mutex::new(DeviceTable::new(config.collector.max_devices)),
            state: Mutex::new(CollectorState {
                coord_state: CoordState::InitWaiting,
                network_info: None,
                restored,
                fh_enabled: config.mac.fh_enabled,
                msdu_counter: 0,
                stats: Statistics::default(),
            }),
            config_timer: OneShot::spawn("clk-config", Arc::clone(&signal), EVT_CONFIG),
            tracking_timer: OneShot::spawn("clk-tracking", Arc::clone(&signal), EVT_TRACKING),
            broadcast_timer: OneShot::spawn("clk-broadcast", signal, EVT_BROADCAST),
            oad: OnceLock::new(),
        })
    }

    /// Wire in the OAD coordinator once at startup.
    pub fn attach_oad(&self, oad: Arc<OadCoordinator>) {
        let _ = self.oad.set(oad);
    }

    /// Event-processing loop; runs on the collector thread until shutdown.
    pub fn run(&self, mac_events: &Receiver<MacEvent>, shutdown: &AtomicBool) {
        log::info!("Collector thread running");
        while !shutdown.load(Ordering::Relaxed) {
            let flags = self.signal.take(Duration::from_millis(50));

            if flags & EVT_START != 0 {
                log::info!("Coordinator (re)start pending, waiting for the network");
            }
            if flags & EVT_TRACKING != 0 {
                self.generate_tracking_requests();
            }
            if flags & EVT_CONFIG != 0 {
                self.generate_config_requests();
            }
            if flags & EVT_BROADCAST != 0 {
                self.generate_broadcast_cmd();
            }
            if flags & EVT_OAD_RESET_RETRY != 0 {
                if let Some(oad) = self.oad.get() {
                    oad.process_reset_retry();
                }
            }

            while let Ok(event) = mac_events.try_recv() {
                self.handle_mac_event(event);
            }
        }
        log::info!("Collector thread exiting");
    }

    pub fn handle_mac_event(&self, event: MacEvent) {
        match event {
            MacEvent::DeviceJoined {
                device,
                capabilities,
            } => self.on_device_joined(device, capabilities),
            MacEvent::DataCnf {
                status,
                msdu_handle,
            } => self.on_data_cnf(status, msdu_handle),
            MacEvent::DataInd { src, rssi, payload } => self.on_data_ind(src, rssi, &payload),
            MacEvent::PollInd { src } => {
                if let Some(short) = self.short_of(&src) {
                    self.process_data_retry(short);
                }
            }
            MacEvent::CommStatusInd {
                dst,
                reason,
                success,
            } => self.on_comm_status(dst, reason, success),
            MacEvent::Disassociated { address } => self.on_disassociated(address),
            MacEvent::Started { info } => self.on_started(info),
            MacEvent::StateChange { state } => self.on_state_change(state),
            MacEvent::CoProcessorReset => {
                log::warn!("MAC co-processor reset");
                self.signal.post(EVT_START);
            }
        }
    }

    // ------------------------------------------------------------------
    // Client request surface
    // ------------------------------------------------------------------

    /// Build and send a configuration request to one device.
    pub fn send_config_request(
        &self,
        dst_short: u16,
        frame_control: u16,
        reporting_interval_ms: u32,
        polling_interval_ms: u32,
    ) -> Result<()> {
        if !self.state.lock().coord_state.is_started() {
            return Err(Error::InvalidState);
        }
        let record = self
            .store
            .get(&Address::Short(dst_short))
            .ok_or(Error::DeviceNotFound)?;

        let mut body = Vec::with_capacity(10);
        body.extend_from_slice(&frame_control.to_le_bytes());
        body.extend_from_slice(&reporting_interval_ms.to_le_bytes());
        body.extend_from_slice(&polling_interval_ms.to_le_bytes());

        match self.send_msg(
            SensorCmdId::ConfigReq,
            dst_short,
            record.capabilities.rx_on_when_idle,
            &body,
        ) {
            Ok(()) => {
                self.state.lock().stats.config_request_attempts += 1;
                // Retry clock in case the response never shows up
                self.config_timer
                    .arm(Duration::from_millis(self.cfg.config_delay_ms));
                Ok(())
            }
            Err(e) => {
                self.process_config_retry();
                Err(e)
            }
        }
    }

    /// Relay an opaque application payload to a device.
    pub fn send_app_data(&self, dst_short: u16, payload: &[u8]) -> Result<()> {
        if !self.state.lock().coord_state.is_started() {
            return Err(Error::InvalidState);
        }
        let record = self
            .store
            .get(&Address::Short(dst_short))
            .ok_or(Error::DeviceNotFound)?;

        let handle = self.next_msdu_handle(None);
        self.mac.data_req(&DataRequest {
            dst: Address::Short(dst_short),
            dst_pan_id: record.device.pan_id,
            msdu_handle: handle,
            ack: true,
            indirect: !record.capabilities.rx_on_when_idle,
            payload: payload.to_vec(),
        })
    }

    /// Send an OAD protocol payload, prefixed with the OAD command id.
    pub fn send_oad_data(&self, dst_short: u16, oad_payload: &[u8]) -> Result<()> {
        let record = self
            .store
            .get(&Address::Short(dst_short))
            .ok_or(Error::DeviceNotFound)?;
        self.send_msg(
            SensorCmdId::Oad,
            dst_short,
            record.capabilities.rx_on_when_idle,
            oad_payload,
        )
    }

    /// Open or close the network for joining.
    pub fn set_join_permit(&self, duration_ms: u32) -> Result<()> {
        self.mac.set_join_permit(duration_ms)
    }

    /// Ask a device to leave; table and store cleanup happens when the
    /// disassociation round-trips through the MAC.
    pub fn remove_device(&self, dst_short: u16) -> Result<()> {
        let record = self
            .store
            .get(&Address::Short(dst_short))
            .ok_or(Error::DeviceNotFound)?;
        self.mac.disassociate_req(&record.device, true)
    }

    /// True if the device is known to the association table.
    pub fn find_device(&self, dst_short: u16) -> bool {
        self.store.get(&Address::Short(dst_short)).is_some()
    }

    pub fn network_snapshot(&self) -> NetworkSnapshot {
        let state = self.state.lock();
        let info = state.network_info.unwrap_or(NetworkInfo {
            device: DeviceDescriptor {
                pan_id: 0xFFFF,
                short_addr: 0,
                ext_addr: [0; 8],
            },
            channel: 0,
            fh_enabled: false,
        });
        NetworkSnapshot {
            ok: state.network_info.is_some(),
            info,
            security_enabled: self.mac_cfg.security_enabled,
            mode: NetworkMode::derive(
                state.fh_enabled,
                self.mac_cfg.beacon_order,
                self.mac_cfg.superframe_order,
            ),
            state: state.coord_state,
        }
    }

    pub fn statistics(&self) -> Statistics {
        self.state.lock().stats.clone()
    }

    // ------------------------------------------------------------------
    // Config cycle
    // ------------------------------------------------------------------

    /// One config pass: clear stale delivered-but-unanswered cycles, then,
    /// if nothing is in flight, send to the first unconfigured device.
    fn generate_config_requests(&self) {
        let candidate = {
            let mut devices = self.devices.lock();
            for entry in devices.entries_mut() {
                if entry.alive && entry.config == ConfigState::Delivered {
                    entry.config = ConfigState::Idle;
                }
            }

            if devices.config_sent_index().is_some() {
                // Strictly one config request in flight
                None
            } else {
                devices
                    .entries()
                    .iter()
                    .find(|e| e.alive && e.config == ConfigState::Idle)
                    .map(|e| e.device.short_addr)
            }
        };

        let Some(short) = candidate else { return };

        match self.send_config_request(
            short,
            DEFAULT_CONFIG_FRAME_CONTROL,
            self.cfg.reporting_interval_ms,
            self.cfg.polling_interval_ms,
        ) {
            Ok(()) => {
                if let Some(entry) = self.devices.lock().find_mut(&Address::Short(short)) {
                    entry.config = ConfigState::Sent;
                }
                log::debug!("Config request sent to 0x{:04X}", short);
            }
            Err(e) => {
                // send_config_request already armed the retry clock
                log::debug!("Config request to 0x{:04X} failed: {}", short, e);
            }
        }
    }

    fn process_config_retry(&self) {
        if !self.signal.pending(EVT_CONFIG) && !self.config_timer.is_active() {
            self.config_timer
                .arm(Duration::from_millis(self.cfg.config_delay_ms));
        }
    }

    // ------------------------------------------------------------------
    // Tracking cycle
    // ------------------------------------------------------------------

    /// One tracking pass: retries first, then evaluate the previous round
    /// and advance round-robin to the next alive device.
    fn generate_tracking_requests(&self) {
        let mut notify: Option<(DeviceDescriptor, bool)> = None;
        let mut target: Option<usize> = None;
        let mut had_activity = false;

        {
            let mut devices = self.devices.lock();
            let n = devices.len();
            for x in 0..n {
                let (alive, tracking) = {
                    let entry = &devices.entries()[x];
                    (entry.alive, entry.tracking)
                };
                if !alive {
                    continue;
                }
                match tracking {
                    TrackingState::Retrying => {
                        had_activity = true;
                        target = Some(x);
                        break;
                    }
                    TrackingState::Sent { .. }
                    | TrackingState::Responded
                    | TrackingState::Errored => {
                        had_activity = true;
                        let entry = devices.get_mut(x).expect("scanned index");
                        if tracking != TrackingState::Responded {
                            // No response this round: report once and drop
                            // the device from the alive set
                            notify = Some((entry.device, tracking.is_sent()));
                            entry.alive = false;
                            entry.config = ConfigState::Idle;
                        }
                        entry.tracking = TrackingState::Idle;
                        target = devices.next_alive_after(x);
                        break;
                    }
                    _ => {}
                }
            }

            if !had_activity {
                target = devices.first_alive();
            }
        }

        if let Some((device, timeout)) = notify {
            self.display.device_not_responding(device.short_addr);
            self.sink.device_not_active(&device, timeout);
        }

        match target {
            Some(idx) => self.send_tracking_request(idx),
            None if !had_activity => {
                // Nobody to track yet; try again later
                self.tracking_timer
                    .arm(Duration::from_millis(self.cfg.tracking_delay_ms));
            }
            None => {}
        }
    }

    fn send_tracking_request(&self, index: usize) {
        let Some((short, rx_on_idle, prev)) = ({
            let devices = self.devices.lock();
            devices
                .get(index)
                .map(|e| (e.device.short_addr, e.capabilities.rx_on_when_idle, e.tracking))
        }) else {
            return;
        };

        match self.send_msg(SensorCmdId::TrackingReq, short, rx_on_idle, &[]) {
            Ok(()) => {
                if let Some(entry) = self.devices.lock().get_mut(index) {
                    entry.tracking = TrackingState::Sent {
                        retried: prev == TrackingState::Retrying,
                    };
                }
                self.state.lock().stats.tracking_request_attempts += 1;
                self.tracking_timer
                    .arm(Duration::from_millis(self.cfg.tracking_timeout_ms));
                log::debug!("Tracking request sent to 0x{:04X}", short);
            }
            Err(e) => {
                log::debug!("Tracking request to 0x{:04X} failed: {}", short, e);
                self.fail_tracking_attempt(index, prev);
            }
        }
    }

    /// Shared failure path for a rejected send and a failed data confirm:
    /// one retry, then the round is marked errored.
    fn fail_tracking_attempt(&self, index: usize, prev: TrackingState) {
        if let Some(entry) = self.devices.lock().get_mut(index) {
            entry.tracking = match prev {
                TrackingState::Retrying | TrackingState::Sent { retried: true } => {
                    TrackingState::Errored
                }
                _ => TrackingState::Retrying,
            };
        }
        self.tracking_timer
            .arm(Duration::from_millis(TRACKING_CNF_DELAY_MS));
    }

    // ------------------------------------------------------------------
    // MAC event handling
    // ------------------------------------------------------------------

    fn on_device_joined(&self, device: DeviceDescriptor, capabilities: CapabilityInfo) {
        {
            let state = self.state.lock();
            if let Some(info) = state.network_info {
                if device.pan_id != info.device.pan_id {
                    log::warn!(
                        "Join from foreign PAN 0x{:04X} ignored (ours 0x{:04X})",
                        device.pan_id,
                        info.device.pan_id
                    );
                    return;
                }
            }
        }

        let record = DeviceRecord {
            device,
            capabilities,
            rx_frame_counter: 0,
        };
        if let Err(e) = self.store.put(&record) {
            log::error!("Failed to persist device 0x{:04X}: {}", device.short_addr, e);
        }

        if self.devices.lock().upsert(device, capabilities).is_none() {
            log::warn!(
                "Device table full, cannot track 0x{:04X}",
                device.short_addr
            );
            return;
        }

        self.display.device_joined(device.short_addr);
        self.sink.device_joined(&record);
        self.signal.post(EVT_CONFIG);
    }

    fn on_data_cnf(&self, status: TxStatus, handle: u8) {
        {
            let mut state = self.state.lock();
            match status {
                TxStatus::ChannelAccessFailure => state.stats.channel_access_failures += 1,
                TxStatus::NoAck => state.stats.ack_failures += 1,
                TxStatus::TransactionExpired => state.stats.tx_transaction_expired += 1,
                TxStatus::TransactionOverflow => state.stats.tx_transaction_overflow += 1,
                TxStatus::Success => {}
                TxStatus::Other(_) => state.stats.other_tx_failures += 1,
            }
        }

        if !MsduTag::is_app(handle) {
            return;
        }

        if MsduTag::is_config(handle) {
            {
                let mut devices = self.devices.lock();
                if let Some(idx) = devices.config_sent_index() {
                    let entry = devices.get_mut(idx).expect("config sent index");
                    if status.is_success() {
                        entry.config = ConfigState::Delivered;
                        entry.alive = true;
                        self.config_timer
                            .arm(Duration::from_millis(3 * self.cfg.config_delay_ms));
                    } else {
                        entry.config = ConfigState::Idle;
                        self.config_timer
                            .arm(Duration::from_millis(self.cfg.config_delay_ms));
                    }
                }
            }
            if status.is_success() {
                self.state.lock().stats.config_requests_sent += 1;
            }
        } else if MsduTag::is_broadcast(handle) {
            if status.is_success() {
                self.state.lock().stats.broadcast_msgs_sent += 1;
            }
        } else {
            // Tracking request confirm
            {
                let mut devices = self.devices.lock();
                if let Some(idx) = devices.tracking_sent_index() {
                    let entry = devices.get_mut(idx).expect("tracking sent index");
                    if status.is_success() {
                        entry.tracking = TrackingState::Sent { retried: false };
                    } else {
                        let prev = entry.tracking;
                        drop(devices);
                        self.fail_tracking_attempt(idx, prev);
                    }
                }
            }
            if status.is_success() {
                self.state.lock().stats.tracking_requests_sent += 1;
            }
        }
    }

    fn on_data_ind(&self, src: Address, rssi: i8, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        // Track everything by short address internally
        let Some(short) = self.short_of(&src) else {
            log::debug!("Data from unknown device {:?} ignored", src);
            return;
        };
        let src = Address::Short(short);

        match SensorCmdId::from_byte(payload[0]) {
            Some(SensorCmdId::ConfigRsp) => {
                self.state.lock().stats.config_responses += 1;
                if let Some(entry) = self.devices.lock().find_mut(&src) {
                    entry.config = ConfigState::Responded;
                    entry.alive = true;
                }
                self.display.config_response(short);
                self.signal.post(EVT_CONFIG);
                self.sink.device_data(&src, rssi, payload);
            }
            Some(SensorCmdId::TrackingRsp) => self.on_tracking_response(short),
            Some(SensorCmdId::SensorData) => {
                self.state.lock().stats.sensor_messages += 1;
                self.sink.device_data(&src, rssi, payload);
                self.process_data_retry(short);
            }
            Some(SensorCmdId::Oad) => {
                self.state.lock().stats.sensor_messages += 1;
                if let Some(oad) = self.oad.get() {
                    oad.on_oad_data(short, &payload[1..]);
                }
            }
            Some(SensorCmdId::RampData) => {
                self.state.lock().stats.sensor_messages += 1;
            }
            _ => {
                // Not ours to interpret; forward raw
                log::debug!("Unhandled sensor command 0x{:02X}", payload[0]);
                self.sink.device_data(&src, rssi, payload);
            }
        }
    }

    fn on_tracking_response(&self, short: u16) {
        let responded = {
            let mut devices = self.devices.lock();
            match devices.find_mut(&Address::Short(short)) {
                Some(entry) if entry.tracking.is_sent() => {
                    entry.tracking = TrackingState::Responded;
                    true
                }
                _ => false,
            }
        };
        if responded {
            self.tracking_timer
                .arm(Duration::from_millis(self.cfg.tracking_delay_ms));
            self.process_config_retry();
        }
        self.state.lock().stats.tracking_responses += 1;
    }

    /// Any traffic from a device proves it alive; re-arm whichever cycles
    /// it is missing from.
    fn process_data_retry(&self, short: u16) {
        if short == INVALID_SHORT_ADDR {
            return;
        }
        let (need_config, tracking_idle, nothing_in_flight) = {
            let mut devices = self.devices.lock();
            let Some(entry) = devices.find_mut(&Address::Short(short)) else {
                return;
            };
            entry.alive = true;
            let need_config = entry.config == ConfigState::Idle;
            let tracking_idle =
                !matches!(entry.tracking, TrackingState::Sent { .. } | TrackingState::Retrying);
            (need_config, tracking_idle, devices.tracking_sent_index().is_none())
        };

        if need_config {
            self.process_config_retry();
        }
        if tracking_idle
            && nothing_in_flight
            && !self.signal.pending(EVT_TRACKING)
            && !self.tracking_timer.is_active()
        {
            self.tracking_timer
                .arm(Duration::from_millis(self.cfg.tracking_delay_ms));
        }
    }

    fn on_comm_status(&self, dst: Address, reason: crate::mac::CommStatusReason, success: bool) {
        if reason == crate::mac::CommStatusReason::AssocRsp && !success {
            if let Some(entry) = self.devices.lock().find_mut(&dst) {
                log::info!(
                    "Association response to 0x{:04X} failed, resetting device state",
                    entry.device.short_addr
                );
                entry.reset();
            }
        }
    }

    fn on_disassociated(&self, address: Address) {
        let ext = match address {
            Address::Extended(ext) => Some(ext),
            Address::Short(short) => self
                .store
                .get(&Address::Short(short))
                .map(|rec| rec.device.ext_addr),
        };
        let Some(ext) = ext else { return };

        self.devices.lock().remove_by_ext(&ext);
        match self.store.remove(&ext) {
            Ok(Some(record)) => {
                log::info!("Device 0x{:04X} left the network", record.device.short_addr);
                self.sink.remove_device_rsp();
            }
            Ok(None) => {}
            Err(e) => log::error!("Failed to remove device record: {}", e),
        }
    }

    fn on_started(&self, info: NetworkInfo) {
        let restored = {
            let mut state = self.state.lock();
            state.network_info = Some(info);
            state.fh_enabled = info.fh_enabled;
            if state.coord_state < CoordState::Started {
                state.coord_state = CoordState::Started;
            }
            state.restored
        };

        if let Err(e) = self.store.save_network_info(&info) {
            log::error!("Failed to persist network info: {}", e);
        }

        self.display.network_update(restored, &info);
        self.sink.network_update(restored, &self.network_snapshot());

        self.tracking_timer
            .arm(Duration::from_millis(self.cfg.tracking_delay_ms));

        if info.fh_enabled && self.cfg.broadcast_interval_ms > 0 {
            self.broadcast_timer
                .arm(Duration::from_millis(BROADCAST_START_DELAY_MS));
        }
    }

    fn on_state_change(&self, state: CoordState) {
        self.state.lock().coord_state = state;
        self.display.state_change(state);
        self.sink.state_change(state);
    }

    // ------------------------------------------------------------------
    // Broadcast command generation (FH mode)
    // ------------------------------------------------------------------

    fn generate_broadcast_cmd(&self) {
        let (fh_enabled, count, pan_id) = {
            let state = self.state.lock();
            (
                state.fh_enabled,
                state.stats.broadcast_msgs_sent as u16,
                state.network_info.map(|i| i.device.pan_id).unwrap_or(0xFFFF),
            )
        };
        if !fh_enabled || self.cfg.broadcast_interval_ms == 0 {
            return;
        }

        let mut payload = vec![SensorCmdId::BroadcastCtrl as u8];
        payload.extend_from_slice(&count.to_le_bytes());

        let handle = self.next_msdu_handle(Some(SensorCmdId::BroadcastCtrl));
        let req = DataRequest {
            dst: Address::Short(BROADCAST_SHORT_ADDR),
            dst_pan_id: pan_id,
            msdu_handle: handle,
            ack: false,
            indirect: false,
            payload,
        };
        if let Err(e) = self.mac.data_req(&req) {
            log::debug!("Broadcast command rejected: {}", e);
        }

        self.broadcast_timer
            .arm(Duration::from_millis(self.cfg.broadcast_interval_ms));
    }

    // ------------------------------------------------------------------
    // Send plumbing
    // ------------------------------------------------------------------

    /// Send one application message: `[cmd_id][body...]` with addressing
    /// and delivery options derived from the device's capabilities.
    fn send_msg(
        &self,
        cmd: SensorCmdId,
        dst_short: u16,
        rx_on_idle: bool,
        body: &[u8],
    ) -> Result<()> {
        let (pan_id, fh_enabled) = {
            let state = self.state.lock();
            (
                state.network_info.map(|i| i.device.pan_id).unwrap_or(0xFFFF),
                state.fh_enabled,
            )
        };

        // In FH mode always-on devices are addressed by extended address
        let dst = if fh_enabled && rx_on_idle {
            let record = self
                .store
                .get(&Address::Short(dst_short))
                .ok_or(Error::DeviceNotFound)?;
            Address::Extended(record.device.ext_addr)
        } else {
            Address::Short(dst_short)
        };

        let mut payload = Vec::with_capacity(body.len() + 1);
        payload.push(cmd as u8);
        payload.extend_from_slice(body);

        self.mac.data_req(&DataRequest {
            dst,
            dst_pan_id: pan_id,
            msdu_handle: self.next_msdu_handle(Some(cmd)),
            ack: true,
            indirect: !rx_on_idle,
            payload,
        })
    }

    /// Roll the handle counter and tag the message class into the top bits.
    fn next_msdu_handle(&self, cmd: Option<SensorCmdId>) -> u8 {
        let mut state = self.state.lock();
        let counter = state.msdu_counter;
        state.msdu_counter = (state.msdu_counter + 1) & MsduTag::COUNTER_MASK;
        drop(state);

        if cmd == Some(SensorCmdId::RampData) {
            return counter;
        }

        let mut handle = counter | MsduTag::APP_MARKER;
        match cmd {
            Some(SensorCmdId::ConfigReq) => handle |= MsduTag::CONFIG_MARKER,
            Some(SensorCmdId::BroadcastCtrl) => handle |= MsduTag::BROADCAST_MARKER,
            _ => {}
        }
        handle
    }

    fn short_of(&self, addr: &Address) -> Option<u16> {
        match addr {
            Address::Short(short) => Some(*short),
            Address::Extended(ext) => self.store.short_addr_of(ext),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::LogDisplay;
    use crate::mac::CommStatusReason;
    use crate::nv::MemNvStore;

    struct MockLink {
        requests: Mutex<Vec<DataRequest>>,
        fail: AtomicBool,
    }

    impl MockLink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }

        fn sent(&self) -> Vec<DataRequest> {
            self.requests.lock().clone()
        }

        fn last_handle(&self) -> u8 {
            self.requests.lock().last().expect("no request sent").msdu_handle
        }
    }

    impl MacLink for MockLink {
        fn data_req(&self, req: &DataRequest) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(Error::SendFailure(TxStatus::TransactionOverflow));
            }
            self.requests.lock().push(req.clone());
            Ok(())
        }

        fn set_join_permit(&self, _duration_ms: u32) -> Result<()> {
            Ok(())
        }

        fn disassociate_req(&self, _device: &DeviceDescriptor, _tx_indirect: bool) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        not_active: Mutex<Vec<(u16, bool)>>,
    }

    impl IndicationSink for RecordingSink {
        fn network_update(&self, _restored: bool, _snapshot: &NetworkSnapshot) {}
        fn state_change(&self, _state: CoordState) {}
        fn device_joined(&self, _record: &DeviceRecord) {}
        fn device_not_active(&self, device: &DeviceDescriptor, timeout: bool) {
            self.not_active.lock().push((device.short_addr, timeout));
        }
        fn device_data(&self, _src: &Address, _rssi: i8, _payload: &[u8]) {}
        fn remove_device_rsp(&self) {}
    }

    fn descriptor(short: u16) -> DeviceDescriptor {
        DeviceDescriptor {
            pan_id: 0x1234,
            short_addr: short,
            ext_addr: [short as u8; 8],
        }
    }

    /// Started collector with `n_devices` joined, short addresses 1..=n.
    fn harness(n_devices: u16) -> (Arc<Collector>, Arc<MockLink>, Arc<RecordingSink>) {
        let config = Config::defaults();
        let link = MockLink::new();
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(DeviceStore::new(Arc::new(MemNvStore::new()), 50));
        let link_dyn: Arc<dyn MacLink> = link.clone();
        let sink_dyn: Arc<dyn IndicationSink> = sink.clone();
        let collector = Collector::new(
            &config,
            link_dyn,
            store,
            Arc::new(LogDisplay),
            sink_dyn,
            Arc::new(EventSignal::new()),
        );

        collector.handle_mac_event(MacEvent::Started {
            info: NetworkInfo {
                device: descriptor(0),
                channel: 11,
                fh_enabled: false,
            },
        });
        for short in 1..=n_devices {
            collector.handle_mac_event(MacEvent::DeviceJoined {
                device: descriptor(short),
                capabilities: CapabilityInfo {
                    ffd: true,
                    mains_power: true,
                    rx_on_when_idle: true,
                    ..Default::default()
                },
            });
        }
        (collector, link, sink)
    }

    fn config_sent_count(collector: &Collector) -> usize {
        collector
            .devices
            .lock()
            .entries()
            .iter()
            .filter(|e| e.config == ConfigState::Sent)
            .count()
    }

    fn tracking_of(collector: &Collector, index: usize) -> TrackingState {
        collector.devices.lock().get(index).unwrap().tracking
    }

    #[test]
    fn single_config_request_in_flight() {
        let (collector, link, _sink) = harness(3);

        for _ in 0..5 {
            collector.generate_config_requests();
        }
        // Only the first device was asked, exactly once
        let sent = link.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].dst, Address::Short(1));
        assert!(MsduTag::is_config(sent[0].msdu_handle));
        assert_eq!(config_sent_count(&collector), 1);

        // Delivery confirmed and answered: the next pass moves to device 2
        collector.handle_mac_event(MacEvent::DataCnf {
            status: TxStatus::Success,
            msdu_handle: link.last_handle(),
        });
        collector.handle_mac_event(MacEvent::DataInd {
            src: Address::Short(1),
            rssi: -40,
            payload: vec![SensorCmdId::ConfigRsp as u8, 0],
        });
        collector.generate_config_requests();

        let sent = link.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].dst, Address::Short(2));
        assert_eq!(config_sent_count(&collector), 1);
    }

    #[test]
    fn failed_config_send_leaves_no_in_flight_marker() {
        let (collector, link, _sink) = harness(2);

        link.fail.store(true, Ordering::Relaxed);
        collector.generate_config_requests();
        assert_eq!(config_sent_count(&collector), 0);

        link.fail.store(false, Ordering::Relaxed);
        collector.generate_config_requests();
        assert_eq!(config_sent_count(&collector), 1);
        assert_eq!(link.sent().len(), 1);
    }

    #[test]
    fn stale_delivered_config_cycles_back() {
        let (collector, link, _sink) = harness(1);

        collector.generate_config_requests();
        collector.handle_mac_event(MacEvent::DataCnf {
            status: TxStatus::Success,
            msdu_handle: link.last_handle(),
        });
        assert_eq!(
            collector.devices.lock().get(0).unwrap().config,
            ConfigState::Delivered
        );

        // The response never arrives; the next pass restarts the cycle
        collector.generate_config_requests();
        assert_eq!(config_sent_count(&collector), 1);
        assert_eq!(link.sent().len(), 2);
    }

    #[test]
    fn tracking_round_robin_visits_every_device() {
        let (collector, link, _sink) = harness(3);

        let mut visited = Vec::new();
        for _ in 0..6 {
            collector.generate_tracking_requests();
            let req = link.sent().last().cloned().expect("tracking request sent");
            assert_eq!(req.payload[0], SensorCmdId::TrackingReq as u8);
            let short = req.dst.short().expect("short addressed");
            visited.push(short);

            // The device answers, closing its round
            collector.handle_mac_event(MacEvent::DataCnf {
                status: TxStatus::Success,
                msdu_handle: req.msdu_handle,
            });
            collector.handle_mac_event(MacEvent::DataInd {
                src: Address::Short(short),
                rssi: -40,
                payload: vec![SensorCmdId::TrackingRsp as u8],
            });
        }
        // Every device is visited once before any repeats
        assert_eq!(visited, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn tracking_failure_retries_once_then_reports() {
        let (collector, link, sink) = harness(2);

        link.fail.store(true, Ordering::Relaxed);
        collector.generate_tracking_requests();
        assert_eq!(tracking_of(&collector, 0), TrackingState::Retrying);

        collector.generate_tracking_requests();
        assert_eq!(tracking_of(&collector, 0), TrackingState::Errored);

        // The errored device is reported exactly once, dropped from the
        // alive set, and the round moves on to the next device
        link.fail.store(false, Ordering::Relaxed);
        collector.generate_tracking_requests();
        assert_eq!(sink.not_active.lock().as_slice(), &[(1, false)]);
        assert!(!collector.devices.lock().get(0).unwrap().alive);
        let req = link.sent().last().cloned().unwrap();
        assert_eq!(req.dst, Address::Short(2));

        collector.handle_mac_event(MacEvent::DataInd {
            src: Address::Short(2),
            rssi: -40,
            payload: vec![SensorCmdId::TrackingRsp as u8],
        });
        collector.generate_tracking_requests();
        assert_eq!(sink.not_active.lock().len(), 1);
    }

    #[test]
    fn tracking_timeout_reports_with_timeout_flag() {
        let (collector, link, sink) = harness(2);

        collector.generate_tracking_requests();
        collector.handle_mac_event(MacEvent::DataCnf {
            status: TxStatus::Success,
            msdu_handle: link.last_handle(),
        });
        assert!(tracking_of(&collector, 0).is_sent());

        // No response before the next round: delivered but silent
        collector.generate_tracking_requests();
        assert_eq!(sink.not_active.lock().as_slice(), &[(1, true)]);
        assert_eq!(link.sent().last().unwrap().dst, Address::Short(2));
    }

    #[test]
    fn assoc_comm_status_failure_resets_device() {
        let (collector, link, _sink) = harness(1);

        collector.generate_config_requests();
        assert_eq!(link.sent().len(), 1);

        collector.handle_mac_event(MacEvent::CommStatusInd {
            dst: Address::Short(1),
            reason: CommStatusReason::AssocRsp,
            success: false,
        });
        let devices = collector.devices.lock();
        let entry = devices.get(0).unwrap();
        assert_eq!(entry.config, ConfigState::Idle);
        assert_eq!(entry.tracking, TrackingState::Idle);
        assert!(!entry.alive);
    }

    #[test]
    fn inbound_traffic_marks_device_alive() {
        let (collector, link, sink) = harness(2);

        // Device 1 goes silent and is dropped from the alive set
        collector.generate_tracking_requests();
        collector.handle_mac_event(MacEvent::DataCnf {
            status: TxStatus::Success,
            msdu_handle: link.last_handle(),
        });
        collector.generate_tracking_requests();
        assert!(!collector.devices.lock().get(0).unwrap().alive);
        assert_eq!(sink.not_active.lock().len(), 1);

        // Sensor data from it proves it back alive
        collector.handle_mac_event(MacEvent::DataInd {
            src: Address::Short(1),
            rssi: -40,
            payload: vec![SensorCmdId::SensorData as u8, 1, 2, 3],
        });
        assert!(collector.devices.lock().get(0).unwrap().alive);
    }
}
