// src/bridge/flasher.rs - ROM loader flashing protocol (SLIP framed commands)
use super::slip::{self, SlipDecoder};
use super::BridgeError;
use crate::config::{FlashConfig, FlashTuning};
use crate::firmware::verify_transfer_size;
use crate::hardware::{self, Transport, TransportError};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const SYNC: u8 = 0x08;
pub const FLASH_BEGIN: u8 = 0x02;
pub const FLASH_DATA: u8 = 0x03;
pub const FLASH_END: u8 = 0x04;
pub const SPI_SET_PARAMS: u8 = 0x0B;
pub const SPI_ATTACH: u8 = 0x0D;
pub const CHANGE_BAUDRATE: u8 = 0x0F;

pub const DIRECTION_REQUEST: u8 = 0x00;
pub const DIRECTION_RESPONSE: u8 = 0x01;
pub const CHECKSUM_SEED: u8 = 0xEF;
pub const IMAGE_MAGIC: u8 = 0xE9;

const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const ERASE_TIMEOUT_PER_MB: Duration = Duration::from_secs(10);
const FLASH_BLOCK_64K: u32 = 0x1_0000;
const FLASH_SECTOR: u32 = 0x1000;
const FLASH_PAGE: u32 = 0x100;

/// SYNC payload: 0x07 0x07 0x12 0x20 followed by 32 bytes of 0x55.
pub fn sync_payload() -> Vec<u8> {
    let mut data = vec![0x07, 0x07, 0x12, 0x20];
    data.extend(std::iter::repeat_n(0x55, 32));
    data
}

/// XOR checksum over FLASH_DATA payloads.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(CHECKSUM_SEED, |acc, b| acc ^ b) as u32
}

pub fn command_packet(op: u8, data: &[u8], checksum: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + data.len());
    packet.push(DIRECTION_REQUEST);
    packet.push(op);
    packet.extend_from_slice(&(data.len() as u16).to_le_bytes());
    packet.extend_from_slice(&checksum.to_le_bytes());
    packet.extend_from_slice(data);
    packet
}

fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub op: u8,
    pub value: u32,
    pub data: Vec<u8>,
}

pub fn parse_response(frame: &[u8]) -> Option<Response> {
    if frame.len() < 8 || frame[0] != DIRECTION_RESPONSE {
        return None;
    }
    let size = u16::from_le_bytes([frame[2], frame[3]]) as usize;
    let data = frame.get(8..8 + size)?.to_vec();
    Some(Response {
        op: frame[1],
        value: u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]),
        data,
    })
}

/// Rewrite flash mode, size and clock in an application image header.
///
/// Returns false when the image does not start with the image magic byte.
pub fn patch_image_header(image: &mut [u8], device: &FlashConfig) -> bool {
    if image.len() < 4 || image[0] != IMAGE_MAGIC {
        return false;
    }
    image[2] = device.flash_mode.header_byte();
    image[3] = (device.flash_size.header_nibble() << 4) | device.flash_freq.header_nibble();
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlashProgress {
    pub written: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashReport {
    pub written: u64,
    pub expected: u64,
    pub blocks: u32,
    pub address: u32,
}

/// Cancels a flash that has not yet erased the target region.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Flasher<'a> {
    transport: &'a mut dyn Transport,
    device: &'a FlashConfig,
    tuning: &'a FlashTuning,
    decoder: SlipDecoder,
    frames: VecDeque<Vec<u8>>,
}

impl<'a> Flasher<'a> {
    pub fn new(transport: &'a mut dyn Transport, device: &'a FlashConfig, tuning: &'a FlashTuning) -> Self {
        Self { transport, device, tuning, decoder: SlipDecoder::new(), frames: VecDeque::new() }
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.tuning.command_timeout_ms)
    }

    /// Write `image` at the configured flash address and reboot the board.
    pub async fn flash(
        mut self,
        image: &[u8],
        expected: u64,
        progress: &watch::Sender<FlashProgress>,
        cancel: &CancelToken,
    ) -> Result<FlashReport, BridgeError> {
        let total = image.len() as u64;
        progress.send_replace(FlashProgress { written: 0, total });
        verify_transfer_size(total, expected, self.tuning.min_transfer_ratio)?;
        check_cancel(cancel)?;

        tracing::info!("Resetting {} into the ROM loader", self.transport.name());
        self.transport.enter_bootloader().await?;
        self.sync().await?;
        check_cancel(cancel)?;

        self.command(SPI_ATTACH, &[0u8; 8], 0, self.command_timeout()).await?;
        let params = words(&[0, self.device.flash_size.bytes(), FLASH_BLOCK_64K, FLASH_SECTOR, FLASH_PAGE, 0xFFFF]);
        self.command(SPI_SET_PARAMS, &params, 0, self.command_timeout()).await?;
        check_cancel(cancel)?;

        self.change_baud(self.device.flash_baud).await?;
        if let Err(e) = check_cancel(cancel) {
            // The session reboots the board, which comes back at the handshake rate.
            self.transport.set_baud_rate(self.device.handshake_baud).await?;
            return Err(e);
        }

        let mut image = image.to_vec();
        if patch_image_header(&mut image, self.device) {
            tracing::debug!("Patched image header for {:?} {:?}", self.device.flash_mode, self.device.flash_size);
        }

        let block_size = self.tuning.block_size as usize;
        let blocks = image.len().div_ceil(block_size) as u32;
        let address = self.device.flash_address;
        let erase_timeout = ERASE_TIMEOUT_PER_MB * (image.len() as u32 / 0x10_0000 + 1);
        let begin = words(&[image.len() as u32, blocks, block_size as u32, address, 0]);
        tracing::info!("Erasing {} bytes at {:#x} ({} blocks)", image.len(), address, blocks);
        // FLASH_BEGIN erases the region: from here on the flash must run to the end.
        self.command(FLASH_BEGIN, &begin, 0, erase_timeout.max(self.command_timeout())).await?;
        if cancel.is_cancelled() {
            tracing::warn!("Ignoring cancel: flash region already erased");
        }

        let mut written = 0u64;
        for (seq, chunk) in image.chunks(block_size).enumerate() {
            let mut block = chunk.to_vec();
            block.resize(block_size, 0xFF);
            let mut data = words(&[block_size as u32, seq as u32, 0, 0]);
            data.extend_from_slice(&block);
            self.command(FLASH_DATA, &data, checksum(&block), self.command_timeout())
                .await
                .map_err(|e| interrupted(e, written))?;
            written += chunk.len() as u64;
            progress.send_replace(FlashProgress { written, total });
            tracing::trace!("Flashed block {}/{}", seq + 1, blocks);
        }

        verify_transfer_size(written, expected, self.tuning.min_transfer_ratio)?;

        self.change_baud(self.device.handshake_baud).await.map_err(|e| interrupted(e, written))?;
        self.command(FLASH_END, &words(&[1]), 0, self.command_timeout())
            .await
            .map_err(|e| interrupted(e, written))?;
        self.transport.hard_reset().await.map_err(|e| interrupted(e.into(), written))?;
        tracing::info!("Flashed {} of {} bytes; board rebooted", written, expected);

        Ok(FlashReport { written, expected, blocks, address })
    }

    async fn sync(&mut self) -> Result<(), BridgeError> {
        let payload = sync_payload();
        for attempt in 1..=self.tuning.sync_attempts {
            match self.command(SYNC, &payload, 0, SYNC_TIMEOUT).await {
                Ok(_) => {
                    // The ROM answers one SYNC with several responses.
                    hardware::drain(self.transport, Duration::from_millis(50)).await?;
                    self.decoder.reset();
                    self.frames.clear();
                    tracing::debug!("ROM loader synced after {} attempt(s)", attempt);
                    return Ok(());
                }
                Err(BridgeError::Transport(TransportError::Timeout(_))) => {
                    tracing::debug!("SYNC attempt {} timed out", attempt);
                }
                Err(e) => return Err(e),
            }
        }
        Err(BridgeError::Protocol(format!(
            "ROM loader did not answer SYNC after {} attempts",
            self.tuning.sync_attempts
        )))
    }

    async fn change_baud(&mut self, baud: u32) -> Result<(), BridgeError> {
        self.command(CHANGE_BAUDRATE, &words(&[baud, 0]), 0, self.command_timeout()).await?;
        self.transport.set_baud_rate(baud).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        hardware::drain(self.transport, Duration::from_millis(10)).await?;
        self.decoder.reset();
        self.frames.clear();
        Ok(())
    }

    async fn command(&mut self, op: u8, data: &[u8], checksum: u32, timeout: Duration) -> Result<Response, BridgeError> {
        let packet = command_packet(op, data, checksum);
        tracing::debug!("ROM <- op {:#04x}, {} bytes", op, data.len());
        self.transport.write_all(&slip::encode(&packet)).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frame = self.next_frame(deadline, timeout).await?;
            let Some(response) = parse_response(&frame) else {
                continue;
            };
            if response.op != op {
                continue;
            }
            let status = response.data.first().copied();
            let error = response.data.get(1).copied();
            return match (status, error) {
                (Some(0), _) => Ok(response),
                (Some(_), Some(error)) => Err(BridgeError::Protocol(format!(
                    "command {:#04x} failed with ROM error {:#04x}",
                    op, error
                ))),
                _ => Err(BridgeError::Protocol(format!("command {:#04x} returned no status", op))),
            };
        }
    }

    async fn next_frame(&mut self, deadline: tokio::time::Instant, timeout: Duration) -> Result<Vec<u8>, BridgeError> {
        let mut buf = [0u8; 512];
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Ok(frame);
            }
            let n = tokio::time::timeout_at(deadline, self.transport.read(&mut buf))
                .await
                .map_err(|_| TransportError::Timeout(timeout))??;
            if n == 0 {
                return Err(TransportError::Closed.into());
            }
            self.frames.extend(self.decoder.feed(&buf[..n]));
        }
    }
}

fn check_cancel(cancel: &CancelToken) -> Result<(), BridgeError> {
    if cancel.is_cancelled() {
        tracing::info!("Flash cancelled before the region was erased");
        return Err(BridgeError::Cancelled);
    }
    Ok(())
}

/// Transport failures once data has started flowing leave a partial image.
fn interrupted(e: BridgeError, written: u64) -> BridgeError {
    match e {
        BridgeError::Transport(source) => {
            tracing::error!("Transport lost after {} bytes of firmware: {}", written, source);
            BridgeError::FlashInterrupted { written, source }
        }
        other => other,
    }
}
