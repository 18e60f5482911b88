//! Physical link drivers.
//!
//! A [`LinkDriver`] is a thin blocking byte pipe with a fixed read timeout.
//! The communication loop owns exactly one driver and is the only code that
//! touches it, so drivers need `Send` but not `Sync`.

mod scripted;
mod serial;
mod tcp;

pub use scripted::{ScriptHandle, ScriptedLink};
pub use serial::{SerialLink, SerialSettings};
pub use tcp::TcpLink;

use crate::error::{FrameError, LinkError};

/// Prefix selecting the TCP transport in a port string
pub const TCP_PREFIX: &str = "tcp://";

/// Longest line [`LinkDriver::read_line`] accepts, terminator excluded
pub const MAX_LINE_LEN: usize = 32;

/// Blocking transport used by a communication loop.
pub trait LinkDriver: Send {
    /// Port name used in log messages
    fn name(&self) -> &str;

    fn open(&mut self) -> Result<(), LinkError>;

    /// Close the link. Closing a closed link does nothing.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Read whatever is available, waiting at most the link's read timeout.
    ///
    /// Returns [`LinkError::Timeout`] if nothing arrived in time.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;

    fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError>;

    /// Throw away anything received but not yet read
    fn discard_input(&mut self) -> Result<(), LinkError>;

    /// Throw away anything written but not yet sent
    fn discard_output(&mut self) -> Result<(), LinkError>;

    /// Fill `buf` completely. Each underlying read gets the full read timeout.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), LinkError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) => return Err(LinkError::Disconnected),
                Ok(n) => filled += n,
                Err(LinkError::Timeout { .. }) => {
                    return Err(LinkError::Timeout {
                        expected: buf.len(),
                        received: filled,
                    })
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read one `\n`-terminated line, without the terminator or a trailing `\r`.
    ///
    /// Gives up with [`FrameError::LineTooLong`] once [`MAX_LINE_LEN`] bytes
    /// arrive without a terminator.
    fn read_line(&mut self) -> Result<String, LinkError> {
        let mut line = Vec::with_capacity(16);
        let mut byte = [0u8; 1];
        loop {
            match self.read(&mut byte) {
                Ok(0) => return Err(LinkError::Disconnected),
                Ok(_) => {}
                Err(LinkError::Timeout { .. }) => {
                    return Err(LinkError::Timeout {
                        expected: line.len() + 1,
                        received: line.len(),
                    })
                }
                Err(e) => return Err(e),
            }
            if byte[0] == b'\n' {
                break;
            }
            if line.len() == MAX_LINE_LEN {
                return Err(FrameError::LineTooLong {
                    limit: MAX_LINE_LEN,
                }
                .into());
            }
            line.push(byte[0]);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Build a driver from a port string: `tcp://host:port` or a serial device path.
#[must_use]
pub fn from_port(settings: SerialSettings) -> Box<dyn LinkDriver> {
    match settings.port.strip_prefix(TCP_PREFIX) {
        Some(addr) => Box::new(TcpLink::new(addr, settings.read_timeout)),
        None => Box::new(SerialLink::new(settings)),
    }
}
