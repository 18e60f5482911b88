use std::io::{Read, Write};
use std::time::Duration;

use log::{debug, info};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use super::LinkDriver;
use crate::error::LinkError;

/// Port name, baud rate and read timeout of one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl SerialSettings {
    pub fn new(port: impl Into<String>, baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            read_timeout,
        }
    }
}

/// Serial port link, 8N1 without flow control
pub struct SerialLink {
    settings: SerialSettings,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialLink {
    #[must_use]
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            port: None,
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, LinkError> {
        self.port.as_mut().ok_or(LinkError::NotOpen)
    }
}

fn clear_error(e: serialport::Error) -> LinkError {
    LinkError::from(std::io::Error::from(e))
}

impl LinkDriver for SerialLink {
    fn name(&self) -> &str {
        &self.settings.port
    }

    fn open(&mut self) -> Result<(), LinkError> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.settings.port, self.settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.settings.read_timeout)
            .open()
            .map_err(|e| LinkError::Open {
                port: self.settings.port.clone(),
                message: e.to_string(),
            })?;
        info!(
            "Opened {} at {} baud (timeout: {}ms)",
            self.settings.port,
            self.settings.baud_rate,
            self.settings.read_timeout.as_millis()
        );
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Closed {}", self.settings.port);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        match self.port()?.read(buf) {
            // A serial port has no end-of-stream; zero bytes means nothing arrived
            Ok(0) => Err(LinkError::Timeout {
                expected: buf.len(),
                received: 0,
            }),
            Ok(n) => Ok(n),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), LinkError> {
        self.port()?.clear(ClearBuffer::Input).map_err(clear_error)
    }

    fn discard_output(&mut self) -> Result<(), LinkError> {
        debug!("Discarding output buffer of {}", self.settings.port);
        self.port()?.clear(ClearBuffer::Output).map_err(clear_error)
    }
}
