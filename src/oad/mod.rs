//! Firmware update (OAD) transfer coordinator
//!
//! Owns the rotating registry of firmware image files and serves the
//! transfer protocol to devices: image identification, block requests, and
//! the on-chip reset handshake. File I/O is synchronous and happens on
//! whichever thread delivered the request; all transfer bookkeeping sits
//! behind small mutexes.

pub mod files;
pub mod image;
pub mod protocol;

use crate::collector::events::{EventSignal, EVT_OAD_RESET_RETRY};
use crate::collector::timers::OneShot;
use crate::collector::Collector;
use crate::config::OadConfig;
use crate::display::DisplaySink;
use crate::error::{Error, Result};
use files::{FileRing, MAX_OAD_FILES};
use image::parse_image;
use parking_lot::Mutex;
use protocol::OadMsg;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

/// Reset handshake bookkeeping for an on-chip update
#[derive(Debug, Clone, Copy)]
struct PendingReset {
    dst_short: u16,
    file_id: u32,
    retries: u32,
}

/// Active transfer bookkeeping
#[derive(Default)]
struct TransferState {
    num_blocks: u16,
    started: Option<Instant>,
}

/// The OAD transfer coordinator
pub struct OadCoordinator {
    cfg: OadConfig,
    display: Arc<dyn DisplaySink>,
    collector: OnceLock<Weak<Collector>>,
    files: Mutex<FileRing>,
    transfer: Mutex<TransferState>,
    pending_reset: Mutex<Option<PendingReset>>,
    reset_timer: OneShot,
}

impl OadCoordinator {
    pub fn new(cfg: OadConfig, display: Arc<dyn DisplaySink>, signal: Arc<EventSignal>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            display,
            collector: OnceLock::new(),
            files: Mutex::new(FileRing::new(MAX_OAD_FILES)),
            transfer: Mutex::new(TransferState::default()),
            pending_reset: Mutex::new(None),
            reset_timer: OneShot::spawn("clk-oad-reset", signal, EVT_OAD_RESET_RETRY),
        })
    }

    /// Wire in the collector once at startup; OAD messages ride its data
    /// request path.
    pub fn attach_collector(&self, collector: &Arc<Collector>) {
        let _ = self.collector.set(Arc::downgrade(collector));
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Register (or find) a firmware file, returning its id.
    pub fn register_file(&self, path: &Path) -> u32 {
        self.files.lock().register(path)
    }

    /// Basename of a registered file.
    pub fn file_name(&self, file_id: u32) -> Result<String> {
        self.files
            .lock()
            .file_name_for(file_id)
            .ok_or(Error::InvalidFileId(file_id))
    }

    // ------------------------------------------------------------------
    // Update entry points
    // ------------------------------------------------------------------

    /// Ask a device for its firmware version.
    pub fn send_fw_version_req(&self, dst_short: u16) -> Result<()> {
        self.send(dst_short, &OadMsg::FwVersionReq)
    }

    /// Start a firmware update. On-chip targets must acknowledge a reset
    /// request before the image identification goes out.
    pub fn start_update(&self, dst_short: u16, file_id: u32, on_chip: bool) -> Result<()> {
        // Fail fast on unknown ids either way
        if self.files.lock().path_for(file_id).is_none() {
            return Err(Error::InvalidFileId(file_id));
        }

        if !on_chip {
            return self.start_transfer(dst_short, file_id);
        }

        log::info!(
            "On-chip update for 0x{:04X}: requesting target reset",
            dst_short
        );
        *self.pending_reset.lock() = Some(PendingReset {
            dst_short,
            file_id,
            retries: 0,
        });
        if let Err(e) = self.send(dst_short, &OadMsg::ResetReq) {
            log::warn!("Reset request send failed, retrying on clock: {}", e);
        }
        self.reset_timer
            .arm(Duration::from_millis(self.cfg.reset_retry_ms));
        Ok(())
    }

    /// True while a reset handshake is outstanding.
    pub fn reset_in_progress(&self) -> bool {
        self.pending_reset.lock().is_some()
    }

    /// Reset retry clock fired: resend, or give up past the retry bound.
    pub fn process_reset_retry(&self) {
        let Some(mut pending) = *self.pending_reset.lock() else {
            return;
        };

        pending.retries += 1;
        if pending.retries >= self.cfg.reset_max_retries {
            log::error!(
                "Target 0x{:04X} never acknowledged reset, aborting update",
                pending.dst_short
            );
            *self.pending_reset.lock() = None;
            return;
        }

        log::info!(
            "Re-sending reset request to 0x{:04X} (attempt {})",
            pending.dst_short,
            pending.retries + 1
        );
        if let Err(e) = self.send(pending.dst_short, &OadMsg::ResetReq) {
            log::warn!("Reset request send failed: {}", e);
        }
        *self.pending_reset.lock() = Some(pending);
        self.reset_timer
            .arm(Duration::from_millis(self.cfg.reset_retry_ms));
    }

    /// Open and classify the image, then send the identify request.
    fn start_transfer(&self, dst_short: u16, file_id: u32) -> Result<()> {
        let path = self
            .files
            .lock()
            .path_for(file_id)
            .ok_or(Error::InvalidFileId(file_id))?
            .to_path_buf();

        let mut file = File::open(&path)
            .map_err(|e| Error::InvalidFile(format!("{}: {}", path.display(), e)))?;
        let header = parse_image(&mut file, self.cfg.legacy_header_addr)?;
        let num_blocks = header.block_count(self.cfg.block_size);

        log::info!(
            "Starting transfer of file {} to 0x{:04X}: len 0x{:X}, {} blocks",
            file_id,
            dst_short,
            header.image_len(),
            num_blocks
        );

        {
            let mut transfer = self.transfer.lock();
            transfer.num_blocks = num_blocks;
            transfer.started = Some(Instant::now());
        }

        self.send(
            dst_short,
            &OadMsg::ImgIdentifyReq {
                img_id: file_id as u8,
                payload: header.identify_payload(),
            },
        )
    }

    // ------------------------------------------------------------------
    // Inbound protocol messages
    // ------------------------------------------------------------------

    /// Entry point for OAD payloads pulled out of MAC data indications.
    pub fn on_oad_data(&self, src_short: u16, bytes: &[u8]) {
        let msg = match OadMsg::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Bad OAD message from 0x{:04X}: {}", src_short, e);
                return;
            }
        };

        match msg {
            OadMsg::FwVersionRsp { version } => {
                self.display.firmware_version(src_short, &version);
            }
            OadMsg::ImgIdentifyRsp { status } => {
                log::info!(
                    "Image identify response from 0x{:04X}: status {}",
                    src_short,
                    status
                );
            }
            OadMsg::BlockReq {
                img_id, block_num, ..
            } => self.on_block_req(src_short, img_id as u32, block_num),
            OadMsg::ResetRsp => self.on_reset_rsp(src_short),
            other => {
                log::debug!("Unexpected OAD message from 0x{:04X}: {:?}", src_short, other);
            }
        }
    }

    /// Serve one block. Short reads near EOF are logged and the bytes that
    /// were read are still sent.
    fn on_block_req(&self, src_short: u16, img_id: u32, block_num: u16) {
        let (num_blocks, started) = {
            let transfer = self.transfer.lock();
            (transfer.num_blocks, transfer.started)
        };
        let elapsed = started.map(|t| t.elapsed()).unwrap_or_default();
        self.display
            .oad_progress(src_short, block_num, num_blocks, elapsed);

        let Some(path) = self.files.lock().path_for(img_id).map(Path::to_path_buf) else {
            log::warn!("Block request for unknown file id {}", img_id);
            return;
        };

        let data = match read_block(&path, block_num, self.cfg.block_size) {
            Ok(data) => data,
            Err(e) => {
                log::error!("Block read {}:{} failed: {}", img_id, block_num, e);
                return;
            }
        };
        if (data.len() as u32) < self.cfg.block_size {
            log::debug!(
                "Short read on block {} ({} of {} bytes)",
                block_num,
                data.len(),
                self.cfg.block_size
            );
        }

        let rsp = OadMsg::BlockRsp {
            img_id: img_id as u8,
            block_num,
            data,
        };
        if let Err(e) = self.send(src_short, &rsp) {
            log::warn!("Block response to 0x{:04X} failed: {}", src_short, e);
            return;
        }

        if num_blocks > 0 && block_num + 1 >= num_blocks {
            self.display.oad_complete(src_short, num_blocks, elapsed);
        }
    }

    fn on_reset_rsp(&self, src_short: u16) {
        let pending = {
            let mut guard = self.pending_reset.lock();
            match *guard {
                Some(p) if p.dst_short == src_short => guard.take(),
                _ => None,
            }
        };
        let Some(pending) = pending else {
            log::debug!("Unsolicited reset response from 0x{:04X}", src_short);
            return;
        };

        self.reset_timer.cancel();
        log::info!("Target 0x{:04X} reset, sending image identification", src_short);
        if let Err(e) = self.start_transfer(pending.dst_short, pending.file_id) {
            log::error!("Transfer start after reset failed: {}", e);
        }
    }

    fn send(&self, dst_short: u16, msg: &OadMsg) -> Result<()> {
        let collector = self
            .collector
            .get()
            .and_then(Weak::upgrade)
            .ok_or(Error::InvalidState)?;
        collector.send_oad_data(dst_short, &msg.encode())
    }
}

/// Read one transfer block from the image file; the last block may be
/// short.
fn read_block(path: &Path, block_num: u16, block_size: u32) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(block_num as u64 * block_size as u64))?;

    let mut data = vec![0u8; block_size as usize];
    let mut filled = 0;
    while filled < data.len() {
        match file.read(&mut data[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    data.truncate(filled);
    Ok(data)
}
