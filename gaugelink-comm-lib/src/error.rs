//! Error types shared by the codecs, transports and communication loop.

use derive_more::{Display, Error};

/// A frame or line that could not be encoded or decoded.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// An SSM response ended before all expected bytes were present
    #[display("SSM response too short: expected {expected} bytes, got {actual}")]
    ShortResponse { expected: usize, actual: usize },
    /// An SSM query frame did not start with the `80 10 F0` header
    #[display("bad SSM frame header")]
    BadHeader,
    /// An SSM query frame carried a command other than `A8`
    #[display("unsupported SSM command 0x{command:02X}")]
    UnsupportedCommand { command: u8 },
    /// An SSM frame's size byte disagrees with its length
    #[display("SSM size byte {declared} does not match frame length {actual}")]
    SizeMismatch { declared: usize, actual: usize },
    /// An SSM frame's trailing checksum did not match the byte sum
    #[display("SSM checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    BadChecksum { expected: u8, actual: u8 },
    /// An Arduino line's value field was not a decimal integer
    #[display("invalid Arduino value {text:?} for header '{header}'")]
    InvalidNumber { header: char, text: String },
    /// An Arduino line was empty, so no header character could be read
    #[display("empty Arduino line")]
    EmptyLine,
    /// No line terminator arrived within `limit` bytes
    #[display("line longer than {limit} bytes")]
    LineTooLong { limit: usize },
}

/// Errors from a physical link or from the communication loop running on it.
#[derive(Debug, Display, Error)]
pub enum LinkError {
    /// The port could not be opened
    #[display("failed to open {port}: {message}")]
    Open { port: String, message: String },
    /// An operation was attempted on a closed link
    #[display("link is not open")]
    NotOpen,
    /// No data arrived before the read timeout fired
    #[display("read timed out after {received} of {expected} bytes")]
    Timeout { expected: usize, received: usize },
    /// The peer closed the connection
    #[display("link disconnected")]
    Disconnected,
    #[display("I/O error: {source}")]
    Io { source: std::io::Error },
    /// Data arrived but could not be decoded
    #[display("malformed frame: {source}")]
    Malformed { source: FrameError },
    /// The consecutive-failure ceiling was exceeded and the loop stopped itself
    #[display("giving up after {resets} consecutive link resets")]
    RetriesExhausted { resets: u32 },
    #[display("link {name} is already running")]
    AlreadyRunning { name: String },
    /// The link driver was lost because the loop thread panicked or failed to spawn
    #[display("link {name} has no driver to run")]
    Unavailable { name: String },
}

impl LinkError {
    /// Whether the recovery procedure should handle this error.
    ///
    /// Transport and decode faults are recoverable. Lifecycle errors and the
    /// reset ceiling are not.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::RetriesExhausted { .. } | Self::AlreadyRunning { .. } | Self::Unavailable { .. }
        )
    }
}

impl From<std::io::Error> for LinkError {
    fn from(source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout {
                expected: 0,
                received: 0,
            },
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Self::Disconnected,
            _ => Self::Io { source },
        }
    }
}

impl From<FrameError> for LinkError {
    fn from(source: FrameError) -> Self {
        Self::Malformed { source }
    }
}

/// A rejected configuration call. Never affects a loop that is already running.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[display("slow read interval must be at least 1 cycle, got {interval}")]
    InvalidInterval { interval: u32 },
    #[display("unknown link kind {kind:?}")]
    UnknownLinkKind { kind: String },
    #[display("unknown parameter code {name:?}")]
    UnknownCode { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_timeout_maps_to_timeout() {
        let err = LinkError::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(matches!(err, LinkError::Timeout { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_io_eof_maps_to_disconnected() {
        let err = LinkError::from(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(matches!(err, LinkError::Disconnected));
    }

    #[test]
    fn test_retries_exhausted_is_fatal() {
        let err = LinkError::RetriesExhausted { resets: 21 };
        assert!(!err.is_recoverable());
        assert_eq!(err.to_string(), "giving up after 21 consecutive link resets");
    }

    #[test]
    fn test_frame_error_source() {
        use std::error::Error as _;
        let err = LinkError::from(FrameError::EmptyLine);
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "malformed frame: empty Arduino line");
    }
}
