//! Gateway client protocol codec
//!
//! Framing: `[LEN u16 LE] [CMD0] [CMD1] [PAYLOAD]`. `CMD0` carries the
//! frame type in its top bits and the subsystem id in the low five;
//! gateway traffic all rides subsystem 10 as asynchronous requests.
//! Multi-byte payload fields are little-endian.

use crate::collector::NetworkSnapshot;
use crate::error::{Error, Result};
use crate::mac::{Address, CoordState, DeviceDescriptor};
use crate::nv::DeviceRecord;
use std::io::Read;

/// Gateway RPC subsystem id
pub const SUBSYS_APP: u8 = 10;
/// Asynchronous request/indication type bits
pub const TYPE_AREQ: u8 = 0x40;
/// Frame header length on the wire
pub const HEADER_LEN: usize = 4;
/// Upper bound on client payloads
const MAX_PAYLOAD: usize = 16 * 1024;

/// Gateway command ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GwCmdId {
    DeviceJoinedInd = 0,
    DeviceLeftInd = 1,
    NwkInfoInd = 2,
    GetNwkInfoReq = 3,
    GetNwkInfoRsp = 4,
    GetNwkInfoCnf = 5,
    GetDeviceArrayReq = 6,
    GetDeviceArrayCnf = 7,
    DeviceNotActiveInd = 8,
    DeviceDataRxInd = 9,
    StateChangeInd = 10,
    SetJoinPermitReq = 11,
    SetJoinPermitCnf = 12,
    TxDataReq = 13,
    TxDataCnf = 14,
    RemoveDeviceReq = 15,
    RemoveDeviceRsp = 16,
    UpdateFwListReq = 17,
    UpdateFwListCnf = 18,
    FwUpdateReq = 19,
    FwUpdateCnf = 20,
}

impl GwCmdId {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => GwCmdId::DeviceJoinedInd,
            1 => GwCmdId::DeviceLeftInd,
            2 => GwCmdId::NwkInfoInd,
            3 => GwCmdId::GetNwkInfoReq,
            4 => GwCmdId::GetNwkInfoRsp,
            5 => GwCmdId::GetNwkInfoCnf,
            6 => GwCmdId::GetDeviceArrayReq,
            7 => GwCmdId::GetDeviceArrayCnf,
            8 => GwCmdId::DeviceNotActiveInd,
            9 => GwCmdId::DeviceDataRxInd,
            10 => GwCmdId::StateChangeInd,
            11 => GwCmdId::SetJoinPermitReq,
            12 => GwCmdId::SetJoinPermitCnf,
            13 => GwCmdId::TxDataReq,
            14 => GwCmdId::TxDataCnf,
            15 => GwCmdId::RemoveDeviceReq,
            16 => GwCmdId::RemoveDeviceRsp,
            17 => GwCmdId::UpdateFwListReq,
            18 => GwCmdId::UpdateFwListCnf,
            19 => GwCmdId::FwUpdateReq,
            20 => GwCmdId::FwUpdateCnf,
            _ => return None,
        })
    }
}

/// One frame off (or for) the client socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GwFrame {
    pub cmd0: u8,
    pub cmd1: u8,
    pub payload: Vec<u8>,
}

impl GwFrame {
    pub fn new(cmd: GwCmdId, payload: Vec<u8>) -> Self {
        Self {
            cmd0: TYPE_AREQ | SUBSYS_APP,
            cmd1: cmd as u8,
            payload,
        }
    }

    pub fn subsystem(&self) -> u8 {
        self.cmd0 & 0x1F
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.push(self.cmd0);
        out.push(self.cmd1);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Read one frame off a client socket.
///
/// A timeout before the header arrives is a quiet socket, not an error;
/// anything else that truncates the frame kills the connection.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<GwFrame>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }

    let len = u16::from_le_bytes([header[0], header[1]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(Error::Frame(format!("oversized frame: {len} bytes")));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(GwFrame {
        cmd0: header[2],
        cmd1: header[3],
        payload,
    }))
}

// ----------------------------------------------------------------------
// Inbound requests
// ----------------------------------------------------------------------

/// Decoded client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GwRequest {
    GetNwkInfo,
    GetDeviceArray,
    SetJoinPermit {
        duration_ms: u32,
    },
    TxData(TxDataReq),
    RemoveDevice {
        short_addr: u16,
    },
    UpdateFwList {
        path: String,
    },
    FwUpdate {
        short_addr: u16,
        file_id: u32,
        on_chip: bool,
    },
}

/// Payload of a device-data transmit request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxDataReq {
    /// Relay a config request to a device
    Config {
        short_addr: u16,
        frame_control: u16,
        reporting_interval_ms: u32,
        polling_interval_ms: u32,
    },
    /// Opaque application payload
    Custom {
        short_addr: u16,
        msg_id: u8,
        data: Vec<u8>,
    },
}

/// Application command id of a relayed config request
const SMSGS_CONFIG_REQ: u8 = 1;

fn need(payload: &[u8], len: usize) -> Result<()> {
    if payload.len() < len {
        return Err(Error::Frame(format!(
            "request payload too short: {} < {}",
            payload.len(),
            len
        )));
    }
    Ok(())
}

/// Parse a client frame. Unknown or misaddressed commands come back as
/// `None`: logged and discarded by the caller, never fatal.
pub fn parse_request(frame: &GwFrame) -> Result<Option<GwRequest>> {
    if frame.subsystem() != SUBSYS_APP {
        return Ok(None);
    }
    let p = frame.payload.as_slice();

    let request = match GwCmdId::from_byte(frame.cmd1) {
        Some(GwCmdId::GetNwkInfoReq) => GwRequest::GetNwkInfo,
        Some(GwCmdId::GetDeviceArrayReq) => GwRequest::GetDeviceArray,
        Some(GwCmdId::SetJoinPermitReq) => {
            need(p, 4)?;
            GwRequest::SetJoinPermit {
                duration_ms: u32::from_le_bytes([p[0], p[1], p[2], p[3]]),
            }
        }
        Some(GwCmdId::TxDataReq) => {
            need(p, 3)?;
            let msg_id = p[0];
            let short_addr = u16::from_le_bytes([p[1], p[2]]);
            if msg_id == SMSGS_CONFIG_REQ {
                need(p, 9)?;
                GwRequest::TxData(TxDataReq::Config {
                    short_addr,
                    polling_interval_ms: u16::from_le_bytes([p[3], p[4]]) as u32,
                    reporting_interval_ms: u16::from_le_bytes([p[5], p[6]]) as u32,
                    frame_control: u16::from_le_bytes([p[7], p[8]]),
                })
            } else {
                GwRequest::TxData(TxDataReq::Custom {
                    short_addr,
                    msg_id,
                    data: p[3..].to_vec(),
                })
            }
        }
        Some(GwCmdId::RemoveDeviceReq) => {
            need(p, 2)?;
            GwRequest::RemoveDevice {
                short_addr: u16::from_le_bytes([p[0], p[1]]),
            }
        }
        Some(GwCmdId::UpdateFwListReq) => GwRequest::UpdateFwList {
            path: String::from_utf8_lossy(p).trim_end_matches('\0').to_string(),
        },
        Some(GwCmdId::FwUpdateReq) => {
            need(p, 7)?;
            GwRequest::FwUpdate {
                short_addr: u16::from_le_bytes([p[0], p[1]]),
                file_id: u32::from_le_bytes([p[2], p[3], p[4], p[5]]),
                on_chip: p[6] != 0,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(request))
}

// ----------------------------------------------------------------------
// Outbound confirms and indications
// ----------------------------------------------------------------------

fn push_device(out: &mut Vec<u8>, device: &DeviceDescriptor) {
    out.extend_from_slice(&device.pan_id.to_le_bytes());
    out.extend_from_slice(&device.short_addr.to_le_bytes());
    out.extend_from_slice(&device.ext_addr);
}

fn push_capabilities(out: &mut Vec<u8>, record: &DeviceRecord) {
    let caps = &record.capabilities;
    out.push(caps.pan_coord as u8);
    out.push(caps.ffd as u8);
    out.push(caps.mains_power as u8);
    out.push(caps.rx_on_when_idle as u8);
    out.push(caps.security as u8);
    out.push(caps.alloc_addr as u8);
}

fn push_network(out: &mut Vec<u8>, snapshot: &NetworkSnapshot) {
    push_device(out, &snapshot.info.device);
    out.push(snapshot.info.channel);
    out.push(snapshot.info.fh_enabled as u8);
    out.push(snapshot.security_enabled as u8);
    out.push(snapshot.mode as u8);
    out.push(snapshot.state as u8);
}

/// `GetNwkInfo` confirm: status + network description
pub fn nwk_info_cnf(snapshot: &NetworkSnapshot) -> GwFrame {
    let mut payload = Vec::with_capacity(18);
    payload.push(snapshot.ok as u8);
    push_network(&mut payload, snapshot);
    GwFrame::new(GwCmdId::GetNwkInfoCnf, payload)
}

/// Network indication, broadcast on start/restore
pub fn nwk_info_ind(snapshot: &NetworkSnapshot) -> GwFrame {
    let mut payload = Vec::with_capacity(17);
    push_network(&mut payload, snapshot);
    GwFrame::new(GwCmdId::NwkInfoInd, payload)
}

/// `GetDeviceArray` confirm: status, count, then one record per device
pub fn device_array_cnf(status: u8, records: &[DeviceRecord]) -> GwFrame {
    let mut payload = Vec::with_capacity(3 + records.len() * 18);
    payload.push(status);
    payload.extend_from_slice(&(records.len() as u16).to_le_bytes());
    for record in records {
        push_device(&mut payload, &record.device);
        push_capabilities(&mut payload, record);
    }
    GwFrame::new(GwCmdId::GetDeviceArrayCnf, payload)
}

pub fn device_joined_ind(record: &DeviceRecord) -> GwFrame {
    let mut payload = Vec::with_capacity(18);
    push_device(&mut payload, &record.device);
    push_capabilities(&mut payload, record);
    GwFrame::new(GwCmdId::DeviceJoinedInd, payload)
}

pub fn device_not_active_ind(device: &DeviceDescriptor, timeout: bool) -> GwFrame {
    let mut payload = Vec::with_capacity(13);
    push_device(&mut payload, device);
    payload.push(timeout as u8);
    GwFrame::new(GwCmdId::DeviceNotActiveInd, payload)
}

pub fn device_data_ind(src: &Address, rssi: i8, data: &[u8]) -> GwFrame {
    let mut payload = Vec::with_capacity(data.len() + 10);
    match src {
        Address::Short(short) => {
            payload.push(2);
            payload.extend_from_slice(&short.to_le_bytes());
        }
        Address::Extended(ext) => {
            payload.push(3);
            payload.extend_from_slice(ext);
        }
    }
    payload.push(rssi as u8);
    payload.extend_from_slice(data);
    GwFrame::new(GwCmdId::DeviceDataRxInd, payload)
}

pub fn state_change_ind(state: CoordState) -> GwFrame {
    GwFrame::new(GwCmdId::StateChangeInd, vec![state as u8])
}

pub fn tx_data_cnf(status: u32) -> GwFrame {
    GwFrame::new(GwCmdId::TxDataCnf, status.to_le_bytes().to_vec())
}

pub fn join_permit_cnf(status: u32) -> GwFrame {
    GwFrame::new(GwCmdId::SetJoinPermitCnf, status.to_le_bytes().to_vec())
}

pub fn remove_device_rsp() -> GwFrame {
    GwFrame::new(GwCmdId::RemoveDeviceRsp, Vec::new())
}

pub fn update_fw_list_cnf(status: u8, file_id: u32) -> GwFrame {
    let mut payload = Vec::with_capacity(5);
    payload.push(status);
    payload.extend_from_slice(&file_id.to_le_bytes());
    GwFrame::new(GwCmdId::UpdateFwListCnf, payload)
}

pub fn fw_update_cnf(status: u32) -> GwFrame {
    GwFrame::new(GwCmdId::FwUpdateCnf, status.to_le_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::{CapabilityInfo, NetworkInfo, NetworkMode};
    use std::io::Cursor;

    fn snapshot() -> NetworkSnapshot {
        NetworkSnapshot {
            ok: true,
            info: NetworkInfo {
                device: DeviceDescriptor {
                    pan_id: 0x1234,
                    short_addr: 0xAABB,
                    ext_addr: [1, 2, 3, 4, 5, 6, 7, 8],
                },
                channel: 11,
                fh_enabled: false,
            },
            security_enabled: true,
            mode: NetworkMode::NonBeacon,
            state: CoordState::Started,
        }
    }

    #[test]
    fn frame_roundtrip_through_reader() {
        let frame = nwk_info_cnf(&snapshot());
        let bytes = frame.to_bytes();
        let parsed = read_frame(&mut Cursor::new(bytes)).unwrap().unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn nwk_info_cnf_layout() {
        let payload = nwk_info_cnf(&snapshot()).payload;
        assert_eq!(payload.len(), 18);
        assert_eq!(payload[0], 1); // status
        assert_eq!(&payload[1..3], &0x1234u16.to_le_bytes());
        assert_eq!(&payload[3..5], &0xAABBu16.to_le_bytes());
        assert_eq!(&payload[5..13], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(payload[13], 11); // channel
        assert_eq!(payload[14], 0); // fh flag
        assert_eq!(payload[15], 1); // security
        assert_eq!(payload[16], NetworkMode::NonBeacon as u8);
        assert_eq!(payload[17], CoordState::Started as u8);
    }

    #[test]
    fn device_array_cnf_layout() {
        let record = DeviceRecord {
            device: DeviceDescriptor {
                pan_id: 1,
                short_addr: 2,
                ext_addr: [9; 8],
            },
            capabilities: CapabilityInfo {
                ffd: true,
                rx_on_when_idle: true,
                ..Default::default()
            },
            rx_frame_counter: 0,
        };
        let payload = device_array_cnf(0, &[record]).payload;
        assert_eq!(payload.len(), 3 + 18);
        assert_eq!(&payload[1..3], &1u16.to_le_bytes()); // count
        assert_eq!(payload[3 + 12], 0); // pan coordinator flag
        assert_eq!(payload[3 + 13], 1); // ffd
        assert_eq!(payload[3 + 15], 1); // rx on when idle
    }

    #[test]
    fn device_not_active_layout() {
        let device = DeviceDescriptor {
            pan_id: 0x0001,
            short_addr: 0x0002,
            ext_addr: [3; 8],
        };
        let payload = device_not_active_ind(&device, true).payload;
        assert_eq!(payload.len(), 13);
        assert_eq!(payload[12], 1);
    }

    #[test]
    fn parse_tx_data_config_request() {
        let mut payload = vec![SMSGS_CONFIG_REQ];
        payload.extend_from_slice(&0x0005u16.to_le_bytes()); // short
        payload.extend_from_slice(&2000u16.to_le_bytes()); // polling
        payload.extend_from_slice(&9000u16.to_le_bytes()); // reporting
        payload.extend_from_slice(&0x001Fu16.to_le_bytes()); // frame control
        let frame = GwFrame::new(GwCmdId::TxDataReq, payload);

        match parse_request(&frame).unwrap().unwrap() {
            GwRequest::TxData(TxDataReq::Config {
                short_addr,
                frame_control,
                reporting_interval_ms,
                polling_interval_ms,
            }) => {
                assert_eq!(short_addr, 5);
                assert_eq!(frame_control, 0x001F);
                assert_eq!(reporting_interval_ms, 9000);
                assert_eq!(polling_interval_ms, 2000);
            }
            other => panic!("wrong parse: {:?}", other),
        }
    }

    #[test]
    fn parse_fw_update_request() {
        let mut payload = 0x0007u16.to_le_bytes().to_vec();
        payload.extend_from_slice(&3u32.to_le_bytes());
        payload.push(1);
        let frame = GwFrame::new(GwCmdId::FwUpdateReq, payload);
        assert_eq!(
            parse_request(&frame).unwrap().unwrap(),
            GwRequest::FwUpdate {
                short_addr: 7,
                file_id: 3,
                on_chip: true
            }
        );
    }

    #[test]
    fn unknown_command_is_none() {
        let frame = GwFrame {
            cmd0: TYPE_AREQ | SUBSYS_APP,
            cmd1: 0x7E,
            payload: vec![],
        };
        assert!(parse_request(&frame).unwrap().is_none());

        // Wrong subsystem is equally discarded
        let foreign = GwFrame {
            cmd0: TYPE_AREQ | 0x03,
            cmd1: GwCmdId::GetNwkInfoReq as u8,
            payload: vec![],
        };
        assert!(parse_request(&foreign).unwrap().is_none());
    }

    #[test]
    fn truncated_request_is_error() {
        let frame = GwFrame::new(GwCmdId::SetJoinPermitReq, vec![1, 2]);
        assert!(parse_request(&frame).is_err());
    }
}
