// src/hardware/sim.rs - In-process simulated board speaking the ROM loader and raw REPL
use super::{Connector, Transport, TransportError};
use crate::bridge::flasher::{self as rom, checksum};
use crate::bridge::repl::{CTRL_A, CTRL_B, CTRL_C, CTRL_D, MAIN_FILE, RAW_REPL_BANNER};
use crate::bridge::slip::{self, SlipDecoder};
use crate::config::FlashConfig;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

const BOOT_BANNER: &str = "MicroPython v1.24.1 on 2024-11-29; Board with ESP32S3\r\nType \"help()\" for more information.\r\n";
const LOADER_BANNER: &str = "rst:0x1 (POWERON),boot:0x0 (DOWNLOAD(USB/UART0))\r\nwaiting for download\r\n";
const KEYBOARD_INTERRUPT: &str = "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\nKeyboardInterrupt: \r\n";

/// Fault injection and identity for a simulated board.
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub usb_id: (u16, u16),
    /// Unplug the board once this many FLASH_DATA blocks were accepted.
    pub disconnect_after_blocks: Option<u32>,
    /// The ROM loader never answers SYNC.
    pub silent_loader: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self { usb_id: (0x303a, 0x1001), disconnect_after_blocks: None, silent_loader: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Repl { raw: bool },
    Loader,
}

#[derive(Debug)]
struct SimState {
    options: SimOptions,
    plugged: bool,
    connected: bool,
    mode: Mode,
    outbox: VecDeque<u8>,
    slip: SlipDecoder,
    raw_input: Vec<u8>,
    host_bauds: Vec<u32>,
    flash: Vec<u8>,
    flash_offset: u32,
    flash_block_size: u32,
    blocks_received: u32,
    flash_finished: bool,
    files: BTreeMap<String, Vec<u8>>,
    open_file: Option<(String, Vec<u8>)>,
    programs: Vec<String>,
    running: bool,
    host_input: Vec<u8>,
    resets: u32,
}

impl SimState {
    fn new(options: SimOptions) -> Self {
        Self {
            options,
            plugged: true,
            connected: false,
            mode: Mode::Repl { raw: false },
            outbox: VecDeque::new(),
            slip: SlipDecoder::new(),
            raw_input: Vec::new(),
            host_bauds: Vec::new(),
            flash: Vec::new(),
            flash_offset: 0,
            flash_block_size: 0,
            blocks_received: 0,
            flash_finished: false,
            files: BTreeMap::new(),
            open_file: None,
            programs: Vec::new(),
            running: false,
            host_input: Vec::new(),
            resets: 0,
        }
    }

    fn out(&mut self, bytes: impl AsRef<[u8]>) {
        self.outbox.extend(bytes.as_ref());
    }

    fn receive(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if !self.connected {
                return;
            }
            match self.mode {
                Mode::Loader => {
                    if let Some(frame) = self.slip.push(b) {
                        self.handle_rom(&frame);
                    }
                }
                Mode::Repl { raw: false } => self.handle_friendly(b),
                Mode::Repl { raw: true } => self.handle_raw(b),
            }
        }
    }

    fn respond(&mut self, op: u8, status: u8, error: u8) {
        let frame = [rom::DIRECTION_RESPONSE, op, 4, 0, 0, 0, 0, 0, status, error, 0, 0];
        let encoded = slip::encode(&frame);
        self.out(encoded);
    }

    fn handle_rom(&mut self, frame: &[u8]) {
        if frame.len() < 8 || frame[0] != rom::DIRECTION_REQUEST {
            return;
        }
        let op = frame[1];
        let size = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        let sum = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let Some(data) = frame.get(8..8 + size) else {
            return;
        };
        let word = |i: usize| {
            data.get(i * 4..i * 4 + 4)
                .map_or(0, |w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        };
        match op {
            rom::SYNC => {
                if self.options.silent_loader {
                    return;
                }
                for _ in 0..4 {
                    self.respond(op, 0, 0);
                }
            }
            rom::SPI_ATTACH | rom::SPI_SET_PARAMS | rom::CHANGE_BAUDRATE => self.respond(op, 0, 0),
            rom::FLASH_BEGIN => {
                self.flash.clear();
                self.flash_block_size = word(2);
                self.flash_offset = word(3);
                self.blocks_received = 0;
                self.flash_finished = false;
                self.respond(op, 0, 0);
            }
            rom::FLASH_DATA => {
                let len = word(0) as usize;
                let seq = word(1);
                let payload = data.get(16..).unwrap_or_default();
                if payload.len() != len || checksum(payload) != sum {
                    self.respond(op, 1, 0x07);
                    return;
                }
                if seq != self.blocks_received {
                    self.respond(op, 1, 0x08);
                    return;
                }
                let start = seq as usize * self.flash_block_size as usize;
                if self.flash.len() < start + len {
                    self.flash.resize(start + len, 0xFF);
                }
                self.flash[start..start + len].copy_from_slice(payload);
                self.blocks_received += 1;
                if self.options.disconnect_after_blocks.is_some_and(|n| self.blocks_received >= n) {
                    self.unplug();
                    return;
                }
                self.respond(op, 0, 0);
            }
            rom::FLASH_END => {
                self.flash_finished = true;
                self.respond(op, 0, 0);
            }
            _ => self.respond(op, 1, 0x05),
        }
    }

    fn handle_friendly(&mut self, b: u8) {
        match b {
            CTRL_C => {
                if self.running {
                    self.running = false;
                    self.out(KEYBOARD_INTERRUPT);
                }
                self.out("\r\n>>> ");
            }
            CTRL_A => {
                self.mode = Mode::Repl { raw: true };
                self.raw_input.clear();
                self.out("\r\n");
                self.out(RAW_REPL_BANNER);
            }
            CTRL_D if !self.running => {
                self.out("MPY: soft reboot\r\n");
                self.boot();
            }
            b if self.running => self.host_input.push(b),
            b => self.out([b]),
        }
    }

    fn handle_raw(&mut self, b: u8) {
        match b {
            CTRL_C if self.running => {
                self.running = false;
                self.out([CTRL_D]);
                self.out(KEYBOARD_INTERRUPT);
                self.out([CTRL_D, b'>']);
            }
            CTRL_C => self.raw_input.clear(),
            b if self.running => self.host_input.push(b),
            CTRL_A => {
                self.raw_input.clear();
                self.out("\r\n");
                self.out(RAW_REPL_BANNER);
            }
            CTRL_B => {
                self.mode = Mode::Repl { raw: false };
                self.out("\r\n");
                self.out(BOOT_BANNER);
                self.out(">>> ");
            }
            CTRL_D => {
                let code = String::from_utf8_lossy(&std::mem::take(&mut self.raw_input)).into_owned();
                self.out("OK");
                match self.file_ops(&code) {
                    Some(Ok(())) => self.out([CTRL_D, CTRL_D, b'>']),
                    Some(Err(message)) => {
                        self.out([CTRL_D]);
                        self.out(message);
                        self.out([CTRL_D, b'>']);
                    }
                    None => self.start_program(code),
                }
            }
            b => self.raw_input.push(b),
        }
    }

    /// Interpret the file-writing statements the bridge sends; `None` for anything else.
    fn file_ops(&mut self, code: &str) -> Option<Result<(), String>> {
        let lines: Vec<&str> = code.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        let recognized = |l: &&str| {
            (l.starts_with("f=open('") && l.ends_with("','wb')"))
                || (l.starts_with("w(u('") && l.ends_with("'))"))
                || matches!(*l, "w=f.write" | "import binascii" | "u=binascii.unhexlify" | "f.close()")
        };
        if lines.is_empty() || !lines.iter().all(recognized) {
            return None;
        }
        for line in lines {
            if let Some(name) = line.strip_prefix("f=open('").and_then(|l| l.strip_suffix("','wb')")) {
                self.open_file = Some((name.to_string(), Vec::new()));
            } else if let Some(hex_text) = line.strip_prefix("w(u('").and_then(|l| l.strip_suffix("'))")) {
                let Some((_, contents)) = self.open_file.as_mut() else {
                    return Some(Err("NameError: name 'w' isn't defined\r\n".to_string()));
                };
                match hex::decode(hex_text) {
                    Ok(bytes) => contents.extend(bytes),
                    Err(_) => return Some(Err("ValueError: invalid hex\r\n".to_string())),
                }
            } else if line == "f.close()" {
                if let Some((name, contents)) = self.open_file.take() {
                    self.files.insert(name, contents);
                }
            }
        }
        Some(Ok(()))
    }

    /// Record a program and echo its top-level string prints.
    fn start_program(&mut self, code: String) {
        for line in code.lines() {
            if let Some(text) = line.strip_prefix("print(\"").and_then(|l| l.strip_suffix("\")")) {
                self.out(text);
                self.out("\r\n");
            }
        }
        self.running = code.contains("while True:");
        self.programs.push(code);
        if !self.running {
            match self.mode {
                Mode::Repl { raw: true } => self.out([CTRL_D, CTRL_D, b'>']),
                _ => self.out(">>> "),
            }
        }
    }

    fn boot(&mut self) {
        self.mode = Mode::Repl { raw: false };
        self.running = false;
        self.out(BOOT_BANNER);
        match self.files.get(MAIN_FILE) {
            Some(main) => {
                let code = String::from_utf8_lossy(main).into_owned();
                self.start_program(code);
            }
            None => self.out(">>> "),
        }
    }

    fn unplug(&mut self) {
        self.plugged = false;
        self.connected = false;
        self.running = false;
    }
}

struct Inner {
    state: Mutex<SimState>,
    notify: Notify,
}

/// A simulated board; clones share the same device.
#[derive(Clone)]
pub struct SimulatedDevice {
    inner: Arc<Inner>,
}

impl SimulatedDevice {
    pub fn new(options: SimOptions) -> Self {
        Self {
            inner: Arc::new(Inner { state: Mutex::new(SimState::new(options)), notify: Notify::new() }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connector(&self) -> SimConnector {
        SimConnector { device: self.clone() }
    }

    /// Flash contents written since the last FLASH_BEGIN, block padding included.
    pub fn flash_image(&self) -> Vec<u8> {
        self.state().flash.clone()
    }

    pub fn flash_offset(&self) -> u32 {
        self.state().flash_offset
    }

    pub fn blocks_received(&self) -> u32 {
        self.state().blocks_received
    }

    pub fn flash_finished(&self) -> bool {
        self.state().flash_finished
    }

    /// Baud rates the host switched to, in order.
    pub fn host_bauds(&self) -> Vec<u32> {
        self.state().host_bauds.clone()
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.state().files.get(name).cloned()
    }

    /// Every program started, in order.
    pub fn programs(&self) -> Vec<String> {
        self.state().programs.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Bytes typed by the host while a program was running.
    pub fn host_input(&self) -> Vec<u8> {
        self.state().host_input.clone()
    }

    pub fn resets(&self) -> u32 {
        self.state().resets
    }

    /// Emit bytes as if the running program printed them.
    pub fn emit(&self, bytes: &[u8]) {
        self.state().out(bytes);
        self.inner.notify.notify_one();
    }

    /// Pull the cable.
    pub fn unplug(&self) {
        self.state().unplug();
        self.inner.notify.notify_one();
    }

    pub fn plug_in(&self) {
        self.state().plugged = true;
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(SimOptions::default())
    }
}

pub struct SimTransport {
    device: SimulatedDevice,
    name: String,
}

#[async_trait]
impl Transport for SimTransport {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        loop {
            let notified = self.device.inner.notify.notified();
            {
                let mut state = self.device.state();
                if !state.outbox.is_empty() {
                    let n = buf.len().min(state.outbox.len());
                    for (slot, b) in buf.iter_mut().zip(state.outbox.drain(..n)) {
                        *slot = b;
                    }
                    return Ok(n);
                }
                if !state.connected {
                    return Err(TransportError::Closed);
                }
            }
            notified.await;
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        {
            let mut state = self.device.state();
            if !state.connected {
                return Err(TransportError::Closed);
            }
            state.receive(data);
        }
        self.device.inner.notify.notify_one();
        Ok(())
    }

    async fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        let mut state = self.device.state();
        if !state.connected {
            return Err(TransportError::Closed);
        }
        state.host_bauds.push(baud);
        Ok(())
    }

    async fn enter_bootloader(&mut self) -> Result<(), TransportError> {
        {
            let mut state = self.device.state();
            if !state.connected {
                return Err(TransportError::Closed);
            }
            state.resets += 1;
            state.running = false;
            state.mode = Mode::Loader;
            state.slip.reset();
            state.outbox.clear();
            state.out(LOADER_BANNER);
        }
        self.device.inner.notify.notify_one();
        Ok(())
    }

    async fn hard_reset(&mut self) -> Result<(), TransportError> {
        {
            let mut state = self.device.state();
            if !state.connected {
                return Err(TransportError::Closed);
            }
            state.resets += 1;
            state.boot();
        }
        self.device.inner.notify.notify_one();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Opens the simulated board when its USB ids pass the allowlist.
#[derive(Clone)]
pub struct SimConnector {
    device: SimulatedDevice,
}

#[async_trait]
impl Connector for SimConnector {
    async fn open(&self, device: &FlashConfig) -> Result<Box<dyn Transport>, TransportError> {
        let name = {
            let mut state = self.device.state();
            let (vid, pid) = state.options.usb_id;
            if !state.plugged || (device.port.is_none() && !device.allows(vid, pid)) {
                return Err(TransportError::NoDevice);
            }
            state.connected = true;
            state.outbox.clear();
            device.port.clone().unwrap_or_else(|| "sim0".to_string())
        };
        tracing::info!("Opened simulated board as {}", name);
        Ok(Box::new(SimTransport { device: self.device.clone(), name }))
    }
}
