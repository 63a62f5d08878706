// src/bridge/repl.rs - MicroPython raw REPL driver
use super::BridgeError;
use crate::hardware::{self, Transport};
use std::time::Duration;

pub const CTRL_A: u8 = 0x01;
pub const CTRL_B: u8 = 0x02;
pub const CTRL_C: u8 = 0x03;
pub const CTRL_D: u8 = 0x04;

pub const RAW_REPL_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
pub const MAIN_FILE: &str = "main.py";

/// Bytes per write while uploading code; the device's input buffer is small.
const UPLOAD_CHUNK: usize = 256;
/// Source bytes per hex-encoded file write statement.
const FILE_CHUNK: usize = 128;
const INTERRUPT_SETTLE: Duration = Duration::from_millis(100);

pub struct RawRepl<'a> {
    transport: &'a mut dyn Transport,
    timeout: Duration,
}

impl<'a> RawRepl<'a> {
    pub fn new(transport: &'a mut dyn Transport, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Stop whatever program is running.
    pub async fn interrupt(&mut self) -> Result<(), BridgeError> {
        self.transport.write_all(&[b'\r', CTRL_C, CTRL_C]).await?;
        hardware::drain(self.transport, INTERRUPT_SETTLE).await?;
        Ok(())
    }

    pub async fn enter(&mut self) -> Result<(), BridgeError> {
        self.interrupt().await?;
        self.transport.write_all(&[b'\r', CTRL_A]).await?;
        hardware::read_until(self.transport, RAW_REPL_BANNER, self.timeout).await?;
        tracing::debug!("Entered raw REPL on {}", self.transport.name());
        Ok(())
    }

    /// Upload `code` and start it. Returns device output that followed the `OK`.
    pub async fn send(&mut self, code: &[u8]) -> Result<Vec<u8>, BridgeError> {
        for chunk in code.chunks(UPLOAD_CHUNK) {
            self.transport.write_all(chunk).await?;
        }
        self.transport.write_all(&[CTRL_D]).await?;
        let reply = hardware::read_until(self.transport, b"OK", self.timeout).await?;
        let start = hardware::find(&reply, b"OK").map_or(reply.len(), |i| i + 2);
        Ok(reply[start..].to_vec())
    }

    /// Run `code` to completion, returning its stdout.
    pub async fn exec(&mut self, code: &str) -> Result<String, BridgeError> {
        let leftover = self.send(code.as_bytes()).await?;
        let reply = hardware::read_more_until(self.transport, leftover, &[CTRL_D, b'>'], self.timeout).await?;
        let mut parts = reply.split(|b| *b == CTRL_D);
        let stdout = String::from_utf8_lossy(parts.next().unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(parts.next().unwrap_or_default()).into_owned();
        if !stderr.trim().is_empty() {
            return Err(BridgeError::Protocol(format!("device raised: {}", stderr.trim())));
        }
        Ok(stdout)
    }

    /// Leave raw mode for the friendly prompt.
    pub async fn exit(&mut self) -> Result<(), BridgeError> {
        self.transport.write_all(&[b'\r', CTRL_B]).await?;
        Ok(())
    }

    /// Soft-reboot from the friendly prompt, which runs `main.py`.
    pub async fn soft_reset(&mut self) -> Result<(), BridgeError> {
        self.transport.write_all(&[CTRL_D]).await?;
        Ok(())
    }

    /// Replace `name` on the device filesystem with `contents`.
    pub async fn write_file(&mut self, name: &str, contents: &[u8]) -> Result<(), BridgeError> {
        self.exec(&format!(
            "f=open('{}','wb')\nw=f.write\nimport binascii\nu=binascii.unhexlify",
            name
        ))
        .await?;
        for chunk in contents.chunks(FILE_CHUNK) {
            self.exec(&format!("w(u('{}'))", hex::encode(chunk))).await?;
        }
        self.exec("f.close()").await?;
        tracing::info!("Wrote {} bytes to {}", contents.len(), name);
        Ok(())
    }
}
