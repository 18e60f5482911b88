use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, info, warn};

use super::LinkDriver;
use crate::error::LinkError;

/// Link to a serial-over-TCP bridge or the mock ECU
pub struct TcpLink {
    addr: String,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpLink {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            stream: None,
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream, LinkError> {
        self.stream.as_mut().ok_or(LinkError::NotOpen)
    }

    fn open_error(&self, message: impl ToString) -> LinkError {
        LinkError::Open {
            port: self.addr.clone(),
            message: message.to_string(),
        }
    }
}

impl LinkDriver for TcpLink {
    fn name(&self) -> &str {
        &self.addr
    }

    fn open(&mut self) -> Result<(), LinkError> {
        if self.stream.is_some() {
            return Ok(());
        }
        info!(
            "Connecting to {} (timeout: {}ms)",
            self.addr,
            self.timeout.as_millis()
        );

        let addr = self
            .addr
            .to_socket_addrs()
            .map_err(|e| self.open_error(e))?
            .next()
            .ok_or_else(|| self.open_error("address did not resolve"))?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout).map_err(|e| self.open_error(e))?;

        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| self.open_error(e))?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(|e| self.open_error(e))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {e}", self.addr);
        }

        info!("Connected to {}", self.addr);
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            info!("Disconnected from {}", self.addr);
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        Ok(self.stream()?.read(buf)?)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
        Ok(self.stream()?.write_all(data)?)
    }

    fn discard_input(&mut self) -> Result<(), LinkError> {
        let stream = self.stream()?;
        stream.set_nonblocking(true)?;
        let mut scratch = [0u8; 256];
        let mut discarded = 0usize;
        let result = loop {
            match stream.read(&mut scratch) {
                Ok(0) => break Err(LinkError::Disconnected),
                Ok(n) => discarded += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };
        stream.set_nonblocking(false)?;
        if discarded > 0 {
            debug!("Discarded {discarded} stale bytes from {}", self.addr);
        }
        result
    }

    fn discard_output(&mut self) -> Result<(), LinkError> {
        // Written data is already in the kernel's hands
        self.stream().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_roundtrip_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 3];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
            stream.write_all(b"S40\n").unwrap();
        });

        let mut link = TcpLink::new(addr.to_string(), Duration::from_secs(2));
        link.open().unwrap();
        link.write_all(b"abc").unwrap();
        let mut echo = [0u8; 3];
        link.read_exact(&mut echo).unwrap();
        assert_eq!(&echo, b"abc");
        assert_eq!(link.read_line().unwrap(), "S40");
        server.join().unwrap();
        link.close();
        assert!(!link.is_open());
    }

    #[test]
    fn test_read_without_open_fails() {
        let mut link = TcpLink::new("127.0.0.1:9", Duration::from_millis(10));
        let mut buf = [0u8; 1];
        assert!(matches!(link.read(&mut buf), Err(LinkError::NotOpen)));
    }
}
