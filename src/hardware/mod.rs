// src/hardware/mod.rs - Byte transports to the board (serial port or simulator)
pub mod serial;
pub mod sim;

use crate::config::FlashConfig;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use serial::{SerialConnector, SerialTransport};
pub use sim::{SimConnector, SimOptions, SimulatedDevice};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no serial port matches the configured USB ids")]
    NoDevice,
    #[error("serial port enumeration failed: {0}")]
    Enumerate(String),
    #[error("transport closed")]
    Closed,
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

/// An open, exclusive, duplex byte channel to the board.
#[async_trait]
pub trait Transport: Send {
    /// Wait for and read available bytes. Cancel-safe: dropping the future loses nothing.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    async fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError>;

    /// Reset the chip with the boot strap held low so it starts the ROM loader.
    async fn enter_bootloader(&mut self) -> Result<(), TransportError>;

    /// Reset the chip into its normal boot path.
    async fn hard_reset(&mut self) -> Result<(), TransportError>;

    fn name(&self) -> &str;
}

/// Finds and opens the board's transport.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, device: &FlashConfig) -> Result<Box<dyn Transport>, TransportError>;
}

/// Read until `pattern` appears in the accumulated bytes; returns everything read.
pub async fn read_until(
    transport: &mut dyn Transport,
    pattern: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    read_more_until(transport, Vec::new(), pattern, timeout).await
}

/// Like [`read_until`], continuing from bytes already received.
pub async fn read_more_until(
    transport: &mut dyn Transport,
    mut collected: Vec<u8>,
    pattern: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = [0u8; 256];
    while !contains(&collected, pattern) {
        let n = tokio::time::timeout_at(deadline, transport.read(&mut buf))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        collected.extend_from_slice(&buf[..n]);
    }
    Ok(collected)
}

/// Discard whatever arrives within `quiet`.
pub async fn drain(transport: &mut dyn Transport, quiet: Duration) -> Result<usize, TransportError> {
    let mut buf = [0u8; 256];
    let mut total = 0;
    loop {
        match tokio::time::timeout(quiet, transport.read(&mut buf)).await {
            Err(_) => return Ok(total),
            Ok(Ok(0)) => return Err(TransportError::Closed),
            Ok(Ok(n)) => total += n,
            Ok(Err(e)) => return Err(e),
        }
    }
}

pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
