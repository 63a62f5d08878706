// src/firmware/transfer.rs - Firmware image retrieval and size verification
use super::{FirmwareRelease, FirmwareSource};
use reqwest::Client;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer truncated: {actual} of {expected} bytes")]
    Truncated { actual: u64, expected: u64 },
    #[error("transfer oversized: {actual} bytes, expected {expected}")]
    Oversized { actual: u64, expected: u64 },
    #[error("firmware download returned HTTP {0}")]
    Status(u16),
    #[error("firmware download failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bundled firmware unreadable: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Byte counts for size failures.
    pub fn sizes(&self) -> Option<(u64, u64)> {
        match self {
            TransferError::Truncated { actual, expected } | TransferError::Oversized { actual, expected } => {
                Some((*actual, *expected))
            }
            _ => None,
        }
    }
}

/// Check a transferred byte count against the declared size.
///
/// Passes when `actual` is at least `min_ratio` of `expected` and not above it.
/// A ratio of 1.0 demands an exact count.
pub fn verify_transfer_size(actual: u64, expected: u64, min_ratio: f64) -> Result<(), TransferError> {
    if actual > expected {
        return Err(TransferError::Oversized { actual, expected });
    }
    if (actual as f64) < (expected as f64) * min_ratio {
        return Err(TransferError::Truncated { actual, expected });
    }
    if actual < expected {
        tracing::warn!("Transfer short by {} bytes ({} of {}), within tolerance", expected - actual, actual, expected);
    }
    Ok(())
}

/// Read a release's image from its source and verify the size.
pub async fn fetch_image(http: &Client, release: &FirmwareRelease, min_ratio: f64) -> Result<Vec<u8>, TransferError> {
    let bytes = match &release.source {
        FirmwareSource::Bundled { path } => {
            tracing::info!("Reading bundled firmware {} from {}", release.version, path.display());
            tokio::fs::read(path).await?
        }
        FirmwareSource::Remote { url } => {
            tracing::info!("Downloading firmware {} from {}", release.version, url);
            let resp = http.get(url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(TransferError::Status(status.as_u16()));
            }
            resp.bytes().await?.to_vec()
        }
    };
    verify_transfer_size(bytes.len() as u64, release.size, min_ratio)?;
    Ok(bytes)
}
