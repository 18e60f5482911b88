//! Serial link communication engine for SSM ECUs and Arduino sensor boards.
//!
//! Each physical link gets a [`CommLink`]: a parameter table, a protocol
//! codec, a link driver and a polling thread. Callers enable parameters,
//! subscribe to per-cycle notifications, and read values from the table.
//!
//! ```no_run
//! use gaugelink_comm_lib::link::{self, SerialSettings};
//! use gaugelink_comm_lib::ssm::{self, SsmCode, SsmLink};
//! use gaugelink_comm_lib::{Cadence, LinkEvent};
//!
//! let driver = link::from_port(SerialSettings::new("/dev/ttyUSB0", ssm::BAUD_RATE, ssm::READ_TIMEOUT));
//! let mut ecu = SsmLink::ssm(driver);
//! ecu.set_enabled(SsmCode::EngineSpeed, Cadence::Fast, true);
//! let events = ecu.subscribe();
//! ecu.start()?;
//! while let Some(LinkEvent::Received(_)) = events.recv() {
//!     println!("{} {}", ecu.value(SsmCode::EngineSpeed), ecu.unit(SsmCode::EngineSpeed));
//! }
//! # Ok::<(), gaugelink_comm_lib::LinkError>(())
//! ```

use std::fmt;
use std::str::FromStr;

pub mod arduino;
pub mod comm;
pub mod error;
pub mod link;
pub mod notify;
pub mod ssm;
pub mod table;
mod thread_util;

pub use comm::{CommLink, CycleOutcome, LinkEvent, LinkHandle, LinkState, Protocol, RecoveryTiming};
pub use error::{ConfigError, FrameError, LinkError};
pub use notify::Subscription;
pub use table::{Cadence, CodeList, ParameterCode, ParameterTable, Reading};

/// The protocols a link can speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    Ssm,
    Arduino,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ssm => write!(f, "ssm"),
            Self::Arduino => write!(f, "arduino"),
        }
    }
}

impl FromStr for LinkKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ssm" => Ok(Self::Ssm),
            "arduino" => Ok(Self::Arduino),
            _ => Err(ConfigError::UnknownLinkKind { kind: s.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_kind_parse() {
        assert_eq!("ssm".parse::<LinkKind>(), Ok(LinkKind::Ssm));
        assert_eq!("Arduino".parse::<LinkKind>(), Ok(LinkKind::Arduino));
        assert_eq!(
            "obd2".parse::<LinkKind>(),
            Err(ConfigError::UnknownLinkKind {
                kind: "obd2".to_string()
            })
        );
        assert_eq!(LinkKind::Arduino.to_string(), "arduino");
    }
}
