//! Serial MAC link
//!
//! Owns the UART to the co-processor. Outbound requests are framed and
//! written under a port lock; a dedicated reader thread parses inbound
//! frames and forwards decoded [`MacEvent`]s over a channel. The reader
//! never mutates application state itself.

use super::npi::{Frame, FrameReader, SUBSYS_MAC};
use super::serial::SerialTransport;
use super::types::{
    Address, CapabilityInfo, CommStatusReason, CoordState, DeviceDescriptor, NetworkInfo, TxStatus,
};
use super::{DataRequest, MacEvent, MacLink};
use crate::error::{Error, Result};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

// Host -> co-processor commands
const CMD_DATA_REQ: u8 = 0x05;
const CMD_JOIN_PERMIT_REQ: u8 = 0x06;
const CMD_DISASSOC_REQ: u8 = 0x07;

// Co-processor -> host indications
const CMD_RESET_IND: u8 = 0x80;
const CMD_JOIN_IND: u8 = 0x81;
const CMD_DATA_CNF: u8 = 0x84;
const CMD_DATA_IND: u8 = 0x85;
const CMD_DISASSOC_IND: u8 = 0x86;
const CMD_DISASSOC_CNF: u8 = 0x87;
const CMD_POLL_IND: u8 = 0x88;
const CMD_COMM_STATUS_IND: u8 = 0x8D;
const CMD_STARTED_IND: u8 = 0x8E;
const CMD_STATE_IND: u8 = 0x8F;

// Address mode bytes on the link
const ADDR_MODE_SHORT: u8 = 2;
const ADDR_MODE_EXT: u8 = 3;

// Capability bitmask, 802.15.4 capability information field layout
const CAP_PAN_COORD: u8 = 0x01;
const CAP_FFD: u8 = 0x02;
const CAP_MAINS: u8 = 0x04;
const CAP_RX_ON: u8 = 0x08;
const CAP_SECURITY: u8 = 0x40;
const CAP_ALLOC: u8 = 0x80;

/// MAC link over the co-processor UART
pub struct SerialMacLink {
    port: Arc<Mutex<SerialTransport>>,
    shutdown: Arc<AtomicBool>,
    reader_handle: Option<JoinHandle<()>>,
}

impl SerialMacLink {
    /// Open the port and start the frame reader thread. Decoded events go
    /// out on `events`.
    pub fn open(
        path: &str,
        baud_rate: u32,
        events: Sender<MacEvent>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let port = Arc::new(Mutex::new(SerialTransport::open(path, baud_rate)?));

        let reader_port = Arc::clone(&port);
        let reader_shutdown = Arc::clone(&shutdown);
        let reader_handle = thread::Builder::new()
            .name("mac-reader".to_string())
            .spawn(move || {
                reader_loop(reader_port, reader_shutdown, events);
            })?;

        Ok(Self {
            port,
            shutdown,
            reader_handle: Some(reader_handle),
        })
    }

    fn send_frame(&self, frame: Frame) -> Result<()> {
        let mut port = self.port.lock();
        port.write_all(&frame.to_bytes())
    }
}

impl MacLink for SerialMacLink {
    fn data_req(&self, req: &DataRequest) -> Result<()> {
        let mut payload = Vec::with_capacity(req.payload.len() + 16);
        encode_address(&mut payload, &req.dst);
        payload.extend_from_slice(&req.dst_pan_id.to_le_bytes());
        payload.push(req.msdu_handle);
        let mut tx_options = 0u8;
        if req.ack {
            tx_options |= 0x01;
        }
        if req.indirect {
            tx_options |= 0x02;
        }
        payload.push(tx_options);
        payload.extend_from_slice(&(req.payload.len() as u16).to_le_bytes());
        payload.extend_from_slice(&req.payload);

        self.send_frame(Frame::areq(SUBSYS_MAC, CMD_DATA_REQ, payload))
    }

    fn set_join_permit(&self, duration_ms: u32) -> Result<()> {
        self.send_frame(Frame::areq(
            SUBSYS_MAC,
            CMD_JOIN_PERMIT_REQ,
            duration_ms.to_le_bytes().to_vec(),
        ))
    }

    fn disassociate_req(&self, device: &DeviceDescriptor, tx_indirect: bool) -> Result<()> {
        let mut payload = Vec::with_capacity(11);
        payload.extend_from_slice(&device.short_addr.to_le_bytes());
        payload.extend_from_slice(&device.ext_addr);
        payload.push(tx_indirect as u8);
        self.send_frame(Frame::areq(SUBSYS_MAC, CMD_DISASSOC_REQ, payload))
    }
}

impl Drop for SerialMacLink {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Reader loop: lock, pull one frame, unlock, sleep briefly.
fn reader_loop(
    port: Arc<Mutex<SerialTransport>>,
    shutdown: Arc<AtomicBool>,
    events: Sender<MacEvent>,
) {
    let mut reader = FrameReader::new();

    while !shutdown.load(Ordering::Relaxed) {
        let frame_result = {
            let mut port = port.lock();
            reader.read_frame(&mut *port)
        };

        match frame_result {
            Ok(Some(frame)) => match decode_event(&frame) {
                Ok(Some(event)) => {
                    if events.send(event).is_err() {
                        // Collector side went away; nothing left to do
                        break;
                    }
                }
                Ok(None) => {
                    log::debug!(
                        "Ignoring frame cmd0=0x{:02X} cmd1=0x{:02X}",
                        frame.cmd0,
                        frame.cmd1
                    );
                }
                Err(e) => log::warn!("Dropping malformed MAC frame: {}", e),
            },
            Ok(None) => {}
            Err(e) => {
                log::error!("Co-processor read error: {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }

        thread::sleep(Duration::from_millis(2));
    }

    log::info!("MAC reader thread exiting");
}

fn encode_address(out: &mut Vec<u8>, addr: &Address) {
    match addr {
        Address::Short(short) => {
            out.push(ADDR_MODE_SHORT);
            out.extend_from_slice(&short.to_le_bytes());
        }
        Address::Extended(ext) => {
            out.push(ADDR_MODE_EXT);
            out.extend_from_slice(ext);
        }
    }
}

fn decode_address(payload: &[u8]) -> Result<(Address, usize)> {
    match payload.first() {
        Some(&ADDR_MODE_SHORT) if payload.len() >= 3 => Ok((
            Address::Short(u16::from_le_bytes([payload[1], payload[2]])),
            3,
        )),
        Some(&ADDR_MODE_EXT) if payload.len() >= 9 => {
            let mut ext = [0u8; 8];
            ext.copy_from_slice(&payload[1..9]);
            Ok((Address::Extended(ext), 9))
        }
        _ => Err(Error::Frame("bad address field".into())),
    }
}

fn decode_capabilities(bits: u8) -> CapabilityInfo {
    CapabilityInfo {
        pan_coord: bits & CAP_PAN_COORD != 0,
        ffd: bits & CAP_FFD != 0,
        mains_power: bits & CAP_MAINS != 0,
        rx_on_when_idle: bits & CAP_RX_ON != 0,
        security: bits & CAP_SECURITY != 0,
        alloc_addr: bits & CAP_ALLOC != 0,
    }
}

fn need(payload: &[u8], len: usize) -> Result<()> {
    if payload.len() < len {
        return Err(Error::Frame(format!(
            "payload too short: {} < {}",
            payload.len(),
            len
        )));
    }
    Ok(())
}

/// Decode one co-processor frame into a [`MacEvent`].
///
/// Unknown commands return `Ok(None)` and are logged by the caller, not
/// treated as fatal.
fn decode_event(frame: &Frame) -> Result<Option<MacEvent>> {
    if frame.subsystem() != SUBSYS_MAC {
        return Ok(None);
    }
    let p = frame.payload.as_slice();

    let event = match frame.cmd1 {
        CMD_RESET_IND => MacEvent::CoProcessorReset,

        CMD_JOIN_IND => {
            need(p, 13)?;
            let mut ext_addr = [0u8; 8];
            ext_addr.copy_from_slice(&p[4..12]);
            MacEvent::DeviceJoined {
                device: DeviceDescriptor {
                    pan_id: u16::from_le_bytes([p[0], p[1]]),
                    short_addr: u16::from_le_bytes([p[2], p[3]]),
                    ext_addr,
                },
                capabilities: decode_capabilities(p[12]),
            }
        }

        CMD_DATA_CNF => {
            need(p, 2)?;
            MacEvent::DataCnf {
                status: TxStatus::from_code(p[0]),
                msdu_handle: p[1],
            }
        }

        CMD_DATA_IND => {
            let (src, used) = decode_address(p)?;
            need(p, used + 3)?;
            let rssi = p[used] as i8;
            let len = u16::from_le_bytes([p[used + 1], p[used + 2]]) as usize;
            need(p, used + 3 + len)?;
            MacEvent::DataInd {
                src,
                rssi,
                payload: p[used + 3..used + 3 + len].to_vec(),
            }
        }

        CMD_DISASSOC_IND => {
            need(p, 8)?;
            let mut ext = [0u8; 8];
            ext.copy_from_slice(&p[..8]);
            MacEvent::Disassociated {
                address: Address::Extended(ext),
            }
        }

        CMD_DISASSOC_CNF => {
            let (address, _) = decode_address(p)?;
            MacEvent::Disassociated { address }
        }

        CMD_POLL_IND => {
            let (src, _) = decode_address(p)?;
            MacEvent::PollInd { src }
        }

        CMD_COMM_STATUS_IND => {
            let (dst, used) = decode_address(p)?;
            need(p, used + 2)?;
            MacEvent::CommStatusInd {
                dst,
                reason: CommStatusReason::from_code(p[used]),
                success: p[used + 1] == 0,
            }
        }

        CMD_STARTED_IND => {
            need(p, 14)?;
            let mut ext_addr = [0u8; 8];
            ext_addr.copy_from_slice(&p[4..12]);
            MacEvent::Started {
                info: NetworkInfo {
                    device: DeviceDescriptor {
                        pan_id: u16::from_le_bytes([p[0], p[1]]),
                        short_addr: u16::from_le_bytes([p[2], p[3]]),
                        ext_addr,
                    },
                    channel: p[12],
                    fh_enabled: p[13] != 0,
                },
            }
        }

        CMD_STATE_IND => {
            need(p, 1)?;
            MacEvent::StateChange {
                state: CoordState::from_code(p[0]),
            }
        }

        _ => return Ok(None),
    };

    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_join_indication() {
        let mut payload = vec![0x34, 0x12, 0x01, 0x00];
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        payload.push(CAP_FFD | CAP_MAINS | CAP_RX_ON);
        let frame = Frame::areq(SUBSYS_MAC, CMD_JOIN_IND, payload);

        let event = decode_event(&frame).unwrap().unwrap();
        match event {
            MacEvent::DeviceJoined {
                device,
                capabilities,
            } => {
                assert_eq!(device.pan_id, 0x1234);
                assert_eq!(device.short_addr, 1);
                assert_eq!(device.ext_addr, [1, 2, 3, 4, 5, 6, 7, 8]);
                assert!(capabilities.ffd);
                assert!(capabilities.rx_on_when_idle);
                assert!(!capabilities.security);
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn decode_data_ind_short_source() {
        let mut payload = vec![ADDR_MODE_SHORT, 0x02, 0x00];
        payload.push(0xD8); // rssi -40
        payload.extend_from_slice(&3u16.to_le_bytes());
        payload.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        let frame = Frame::areq(SUBSYS_MAC, CMD_DATA_IND, payload);

        match decode_event(&frame).unwrap().unwrap() {
            MacEvent::DataInd { src, rssi, payload } => {
                assert_eq!(src, Address::Short(2));
                assert_eq!(rssi, -40);
                assert_eq!(payload, vec![0xAA, 0xBB, 0xCC]);
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn truncated_payload_is_frame_error() {
        let frame = Frame::areq(SUBSYS_MAC, CMD_DATA_CNF, vec![0x00]);
        assert!(decode_event(&frame).is_err());
    }

    #[test]
    fn unknown_command_ignored() {
        let frame = Frame::areq(SUBSYS_MAC, 0x7F, vec![]);
        assert!(decode_event(&frame).unwrap().is_none());
    }
}
