// src/hardware/serial.rs - USB serial transport with vid/pid device selection
use super::{Connector, Transport, TransportError};
use crate::config::FlashConfig;
use async_trait::async_trait;
use serial2_tokio::SerialPort;
use serialport::SerialPortType;
use std::time::Duration;

/// Serial connection to a board's USB-UART or native USB CDC port
pub struct SerialTransport {
    port: SerialPort,
    name: String,
}

impl SerialTransport {
    pub fn open(path: &str, baud: u32) -> Result<Self, TransportError> {
        let port = SerialPort::open(path, baud)?;
        tracing::info!("Opened serial port {} at {} baud", path, baud);
        Ok(Self { port, name: path.to_string() })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = self.port.read(buf).await?;
        tracing::trace!("Serial RX {} bytes", n);
        Ok(n)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        tracing::trace!("Serial TX {} bytes", data.len());
        self.port.write_all(data).await?;
        Ok(())
    }

    async fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        let mut settings = self.port.get_configuration()?;
        settings.set_baud_rate(baud)?;
        self.port.set_configuration(&settings)?;
        tracing::debug!("{} now at {} baud", self.name, baud);
        Ok(())
    }

    async fn enter_bootloader(&mut self) -> Result<(), TransportError> {
        // DTR drives IO0 and RTS drives EN through the usual auto-reset transistors.
        self.port.set_dtr(false)?;
        self.port.set_rts(true)?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.port.set_dtr(true)?;
        self.port.set_rts(false)?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.port.set_dtr(false)?;
        self.port.discard_buffers()?;
        Ok(())
    }

    async fn hard_reset(&mut self) -> Result<(), TransportError> {
        self.port.set_rts(true)?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.port.set_rts(false)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Picks the configured port, or the first USB port whose ids are allowlisted.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialConnector;

impl SerialConnector {
    pub fn find_port(device: &FlashConfig) -> Result<String, TransportError> {
        if let Some(port) = &device.port {
            return Ok(port.clone());
        }
        let ports = serialport::available_ports().map_err(|e| TransportError::Enumerate(e.to_string()))?;
        for info in ports {
            if let SerialPortType::UsbPort(usb) = &info.port_type {
                if device.allows(usb.vid, usb.pid) {
                    tracing::info!(
                        "Found board on {} ({:04x}:{:04x})",
                        info.port_name,
                        usb.vid,
                        usb.pid
                    );
                    return Ok(info.port_name);
                }
                tracing::debug!("Skipping {} ({:04x}:{:04x})", info.port_name, usb.vid, usb.pid);
            }
        }
        Err(TransportError::NoDevice)
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self, device: &FlashConfig) -> Result<Box<dyn Transport>, TransportError> {
        let path = Self::find_port(device)?;
        Ok(Box::new(SerialTransport::open(&path, device.handshake_baud)?))
    }
}
