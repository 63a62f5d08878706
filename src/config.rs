//! # Bridge Configuration
//!
//! Device flash parameters, firmware catalog source, terminal and web settings.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [device]
//! flash_address = 0
//! flash_size = "8MB"
//! flash_mode = "dio"
//! flash_freq = "80m"
//! flash_baud = 921600
//! handshake_baud = 115200
//! usb_ids = [[0x303a, 0x1001], [0x10c4, 0xea60]]
//!
//! [catalog]
//! repository = "blocklink-labs/board-firmware"
//! ttl_secs = 3600
//! ```
//!
//! Every key is optional; missing keys fall back to the defaults below.

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct for the device, flasher, firmware catalog, terminal and web API.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub device: FlashConfig,
    #[serde(default)]
    pub flash: FlashTuning,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub web: WebConfig,
}

/// SPI flash access mode written into the image header.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlashMode {
    Qio,
    Qout,
    Dio,
    Dout,
}

impl FlashMode {
    pub fn header_byte(self) -> u8 {
        match self {
            FlashMode::Qio => 0x00,
            FlashMode::Qout => 0x01,
            FlashMode::Dio => 0x02,
            FlashMode::Dout => 0x03,
        }
    }
}

/// SPI flash clock.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum FlashFreq {
    #[serde(rename = "20m")]
    Mhz20,
    #[serde(rename = "26m")]
    Mhz26,
    #[serde(rename = "40m")]
    Mhz40,
    #[serde(rename = "80m")]
    Mhz80,
}

impl FlashFreq {
    pub fn header_nibble(self) -> u8 {
        match self {
            FlashFreq::Mhz40 => 0x0,
            FlashFreq::Mhz26 => 0x1,
            FlashFreq::Mhz20 => 0x2,
            FlashFreq::Mhz80 => 0xf,
        }
    }
}

/// SPI flash chip size.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum FlashSize {
    #[serde(rename = "1MB")]
    Mb1,
    #[serde(rename = "2MB")]
    Mb2,
    #[serde(rename = "4MB")]
    Mb4,
    #[serde(rename = "8MB")]
    Mb8,
    #[serde(rename = "16MB")]
    Mb16,
}

impl FlashSize {
    pub fn bytes(self) -> u32 {
        match self {
            FlashSize::Mb1 => 0x10_0000,
            FlashSize::Mb2 => 0x20_0000,
            FlashSize::Mb4 => 0x40_0000,
            FlashSize::Mb8 => 0x80_0000,
            FlashSize::Mb16 => 0x100_0000,
        }
    }

    pub fn header_nibble(self) -> u8 {
        match self {
            FlashSize::Mb1 => 0x0,
            FlashSize::Mb2 => 0x1,
            FlashSize::Mb4 => 0x2,
            FlashSize::Mb8 => 0x3,
            FlashSize::Mb16 => 0x4,
        }
    }
}

/// Device constants used to select, handshake with and flash the board.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlashConfig {
    /// Explicit serial port; when unset the vid/pid allowlist picks one.
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub flash_address: u32,
    #[serde(default = "default_flash_size")]
    pub flash_size: FlashSize,
    #[serde(default = "default_flash_mode")]
    pub flash_mode: FlashMode,
    #[serde(default = "default_flash_freq")]
    pub flash_freq: FlashFreq,
    #[serde(default = "default_flash_baud")]
    pub flash_baud: u32,
    #[serde(default = "default_handshake_baud")]
    pub handshake_baud: u32,
    #[serde(default = "default_usb_ids")]
    pub usb_ids: Vec<(u16, u16)>,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            port: None,
            flash_address: 0,
            flash_size: default_flash_size(),
            flash_mode: default_flash_mode(),
            flash_freq: default_flash_freq(),
            flash_baud: default_flash_baud(),
            handshake_baud: default_handshake_baud(),
            usb_ids: default_usb_ids(),
        }
    }
}

impl FlashConfig {
    pub fn allows(&self, vid: u16, pid: u16) -> bool {
        self.usb_ids.iter().any(|&(v, p)| v == vid && p == pid)
    }
}

/// Flasher knobs that are not properties of the device itself.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlashTuning {
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_sync_attempts")]
    pub sync_attempts: u32,
    /// Fraction of the declared image size that must be acknowledged.
    #[serde(default = "default_min_transfer_ratio")]
    pub min_transfer_ratio: f64,
}

impl Default for FlashTuning {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            command_timeout_ms: default_command_timeout_ms(),
            sync_attempts: default_sync_attempts(),
            min_transfer_ratio: default_min_transfer_ratio(),
        }
    }
}

/// Where firmware releases come from.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_repository")]
    pub repository: String,
    #[serde(default = "default_asset_pattern")]
    pub asset_pattern: String,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_fallback_ttl_secs")]
    pub fallback_ttl_secs: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub bundled: BundledFirmware,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            repository: default_repository(),
            asset_pattern: default_asset_pattern(),
            ttl_secs: default_ttl_secs(),
            fallback_ttl_secs: default_fallback_ttl_secs(),
            per_page: default_per_page(),
            max_pages: default_max_pages(),
            request_timeout_secs: default_request_timeout_secs(),
            bundled: BundledFirmware::default(),
        }
    }
}

/// The firmware image shipped alongside the application.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BundledFirmware {
    #[serde(default = "default_bundled_version")]
    pub version: String,
    #[serde(default = "default_bundled_title")]
    pub title: String,
    #[serde(default = "default_bundled_path")]
    pub path: PathBuf,
    #[serde(default = "default_bundled_size")]
    pub size: u64,
    #[serde(default = "default_bundled_published")]
    pub published_at: chrono::DateTime<chrono::Utc>,
}

impl Default for BundledFirmware {
    fn default() -> Self {
        Self {
            version: default_bundled_version(),
            title: default_bundled_title(),
            path: default_bundled_path(),
            size: default_bundled_size(),
            published_at: default_bundled_published(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TerminalConfig {
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self { max_lines: default_max_lines() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

impl Config {
    /// Reject values that would make flashing or catalog lookups misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratio = self.flash.min_transfer_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "flash.min_transfer_ratio must be in (0, 1], got {}",
                ratio
            )));
        }
        // FLASH_DATA carries a 16-byte header in a u16-sized packet.
        if self.flash.block_size == 0 || self.flash.block_size % 4 != 0 || self.flash.block_size > 0xFFE0 {
            return Err(ConfigError::Invalid(
                "flash.block_size must be a non-zero multiple of 4, at most 0xFFE0".to_string(),
            ));
        }
        if self.device.flash_baud == 0 || self.device.handshake_baud == 0 {
            return Err(ConfigError::Invalid("baud rates must be > 0".to_string()));
        }
        if self.device.port.is_none() && self.device.usb_ids.is_empty() {
            return Err(ConfigError::Invalid(
                "device.usb_ids is empty and no explicit device.port is set".to_string(),
            ));
        }
        if let Err(e) = regex::Regex::new(&self.catalog.asset_pattern) {
            return Err(ConfigError::Invalid(format!("catalog.asset_pattern: {}", e)));
        }
        if self.catalog.per_page == 0 || self.catalog.max_pages == 0 {
            return Err(ConfigError::Invalid(
                "catalog.per_page and catalog.max_pages must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

// Default value functions
fn default_flash_size() -> FlashSize { FlashSize::Mb8 }
fn default_flash_mode() -> FlashMode { FlashMode::Dio }
fn default_flash_freq() -> FlashFreq { FlashFreq::Mhz80 }
fn default_flash_baud() -> u32 { 921_600 }
fn default_handshake_baud() -> u32 { 115_200 }
fn default_usb_ids() -> Vec<(u16, u16)> {
    vec![(0x303a, 0x1001), (0x10c4, 0xea60), (0x1a86, 0x7523), (0x1a86, 0x55d4)]
}
fn default_block_size() -> u32 { 0x4000 }
fn default_command_timeout_ms() -> u64 { 3000 }
fn default_sync_attempts() -> u32 { 7 }
fn default_min_transfer_ratio() -> f64 { 0.9 }
fn default_api_base() -> String { "https://api.github.com".to_string() }
fn default_repository() -> String { "blocklink-labs/board-firmware".to_string() }
fn default_asset_pattern() -> String { r"^board-micropython-.*\.bin$".to_string() }
fn default_ttl_secs() -> u64 { 3600 }
fn default_fallback_ttl_secs() -> u64 { 60 }
fn default_per_page() -> u32 { 30 }
fn default_max_pages() -> u32 { 5 }
fn default_request_timeout_secs() -> u64 { 10 }
fn default_bundled_version() -> String { "1.24.1".to_string() }
fn default_bundled_title() -> String { "MicroPython 1.24.1 (bundled)".to_string() }
fn default_bundled_path() -> PathBuf { PathBuf::from("firmware/board-micropython-1.24.1.bin") }
fn default_bundled_size() -> u64 { 8_384_512 }
fn default_bundled_published() -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(1_732_000_000, 0).unwrap_or_default()
}
fn default_max_lines() -> usize { 1000 }
fn default_bind() -> String { "127.0.0.1:3000".to_string() }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}
