//! MAC co-processor interface
//!
//! The 802.15.4 MAC itself runs on an external co-processor reached over a
//! UART. This module owns the narrow boundary to it: the request surface
//! the application is allowed to use ([`MacLink`]), the event stream the
//! co-processor pushes back ([`MacEvent`]), and the frame codec for the
//! serial transport. Association admission, security material and channel
//! hopping all live on the far side of this boundary.

mod link;
pub mod npi;
mod ring_buffer;
mod serial;
pub mod types;

pub use link::SerialMacLink;
pub use serial::SerialTransport;
pub use types::{
    Address, CapabilityInfo, CommStatusReason, CoordState, DeviceDescriptor, ExtAddr, MsduTag,
    NetworkInfo, NetworkMode, TxStatus, INVALID_SHORT_ADDR,
};

use crate::error::Result;

/// Outbound MAC data request
///
/// Mirrors the fields of an MCPS-DATA.request: destination addressing,
/// acknowledgment and indirect (sleepy device) delivery options, and the
/// handle used to match the eventual confirm.
#[derive(Debug, Clone)]
pub struct DataRequest {
    pub dst: Address,
    pub dst_pan_id: u16,
    pub msdu_handle: u8,
    pub ack: bool,
    pub indirect: bool,
    pub payload: Vec<u8>,
}

/// Request surface toward the MAC co-processor
///
/// One implementation frames requests over the UART; tests substitute
/// recording doubles.
pub trait MacLink: Send + Sync {
    /// Issue an MCPS data request. An `Err` here models the co-processor
    /// rejecting the request outright (queue overflow); delivery failures
    /// arrive later as a [`MacEvent::DataCnf`].
    fn data_req(&self, req: &DataRequest) -> Result<()>;

    /// Open or close the network for joining. Duration 0 closes,
    /// 0xFFFFFFFF opens indefinitely.
    fn set_join_permit(&self, duration_ms: u32) -> Result<()>;

    /// Ask a device to leave the network.
    fn disassociate_req(&self, device: &DeviceDescriptor, tx_indirect: bool) -> Result<()>;
}

/// Events pushed by the co-processor
///
/// Decoded by the link's reader thread and handed to the collector over a
/// channel; nothing in here is processed on the reader thread itself.
#[derive(Debug, Clone)]
pub enum MacEvent {
    /// A device joined (or re-joined) the network
    DeviceJoined {
        device: DeviceDescriptor,
        capabilities: CapabilityInfo,
    },
    /// Confirm for an earlier data request
    DataCnf { status: TxStatus, msdu_handle: u8 },
    /// Inbound application payload from a device
    DataInd {
        src: Address,
        rssi: i8,
        payload: Vec<u8>,
    },
    /// A sleepy device polled for pending frames
    PollInd { src: Address },
    /// MLME comm-status report, e.g. the fate of an association response
    CommStatusInd {
        dst: Address,
        reason: CommStatusReason,
        success: bool,
    },
    /// A device left the network (indication or confirm path)
    Disassociated { address: Address },
    /// The coordinator started or restored the network
    Started { info: NetworkInfo },
    /// Coordinator state machine moved
    StateChange { state: CoordState },
    /// The co-processor rebooted and must be restarted
    CoProcessorReset,
}
