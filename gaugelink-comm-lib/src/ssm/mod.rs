//! Subaru Select Monitor (SSM) protocol.
//!
//! The host sends a read query listing ECU RAM addresses; the K-line echoes
//! the query back and the ECU then replies with one data byte per address:
//!
//! ```text
//! query:    80 10 F0 <size> A8 00 <address block> <checksum>
//! reply:    80 F0 10 <size> E8 <data bytes> <checksum>
//! ```
//!
//! `<size>` counts the bytes between it and the checksum, and the checksum
//! is the low byte of the sum of every byte before it.

mod codes;

use std::str::FromStr;
use std::time::Duration;

use log::debug;
use smallvec::SmallVec;

pub use codes::{SsmCode, SsmSwitch};

use crate::comm::{CommLink, CycleOutcome, LinkHandle, Protocol};
use crate::error::{ConfigError, FrameError, LinkError};
use crate::link::LinkDriver;
use crate::table::{Cadence, CodeList, ParameterCode, ParameterTable};

pub const BAUD_RATE: u32 = 4800;
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Header of a host to ECU frame
pub const QUERY_HEADER: [u8; 3] = [0x80, 0x10, 0xF0];
/// Header of an ECU to host frame
pub const REPLY_HEADER: [u8; 3] = [0x80, 0xF0, 0x10];
pub const READ_COMMAND: u8 = 0xA8;
pub const READ_REPLY_COMMAND: u8 = 0xE8;
/// Single-response mode
const READ_PADDING: u8 = 0x00;

/// Address bytes sent per data byte returned
pub const ADDRESS_BYTES_PER_DATA_BYTE: usize = 3;

/// Query frame length without its address block
const QUERY_OVERHEAD: usize = 7;
/// Reply header, size and command bytes before the data block
const REPLY_PREFIX_LEN: usize = 5;

pub type FrameBuffer = SmallVec<[u8; 64]>;

/// Decoded `(code, raw value)` pairs of one reply, in query order
pub type RawValues = SmallVec<[(SsmCode, i32); 16]>;

/// Low byte of the sum of `bytes`
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// A read query for one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsmQuery {
    cadence: Cadence,
    codes: CodeList<SsmCode>,
    frame: FrameBuffer,
}

impl SsmQuery {
    /// Query every code enabled for `cadence`, or `None` if there are none
    #[must_use]
    pub fn build(table: &ParameterTable<SsmCode>, cadence: Cadence) -> Option<Self> {
        let codes = table.enabled_codes(cadence);
        if codes.is_empty() {
            None
        } else {
            Some(Self::from_codes(cadence, codes))
        }
    }

    /// Query `codes` in the given order
    #[must_use]
    pub fn from_codes(cadence: Cadence, codes: CodeList<SsmCode>) -> Self {
        let address_len: usize = codes.iter().map(|code| code.address_len()).sum();
        let mut frame = FrameBuffer::with_capacity(QUERY_OVERHEAD + address_len);
        frame.extend_from_slice(&QUERY_HEADER);
        // Every code listed at most once keeps this well under 255
        frame.push((address_len + 2) as u8);
        frame.push(READ_COMMAND);
        frame.push(READ_PADDING);
        for code in &codes {
            frame.extend_from_slice(code.address());
        }
        frame.push(checksum(&frame));
        Self {
            cadence,
            codes,
            frame,
        }
    }

    #[must_use]
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    #[must_use]
    pub fn codes(&self) -> &[SsmCode] {
        &self.codes
    }

    #[must_use]
    pub const fn cadence(&self) -> Cadence {
        self.cadence
    }

    /// Bytes to read back: the echoed query plus the ECU's reply
    #[must_use]
    pub fn expected_response_len(&self) -> usize {
        let echo = self.frame.len();
        echo + REPLY_PREFIX_LEN + 1 + (echo - QUERY_OVERHEAD) / ADDRESS_BYTES_PER_DATA_BYTE
    }

    /// Split a response (echo included) into raw values, in query order.
    ///
    /// Multi-byte values are big-endian.
    pub fn decode(&self, response: &[u8]) -> Result<RawValues, FrameError> {
        let expected = self.expected_response_len();
        if response.len() < expected {
            return Err(FrameError::ShortResponse {
                expected,
                actual: response.len(),
            });
        }

        let mut data = &response[self.frame.len() + REPLY_PREFIX_LEN..];
        let mut values = RawValues::new();
        for &code in &self.codes {
            let (bytes, rest) = data.split_at(code.data_len());
            let raw = bytes
                .iter()
                .fold(0i32, |acc, &b| (acc << 8) + i32::from(b));
            values.push((code, raw));
            data = rest;
        }
        Ok(values)
    }
}

/// Validate a read query and return its address block.
pub fn parse_query(frame: &[u8]) -> Result<&[u8], FrameError> {
    if frame.len() < QUERY_OVERHEAD || frame[..3] != QUERY_HEADER {
        return Err(FrameError::BadHeader);
    }
    let declared = usize::from(frame[3]);
    if declared != frame.len() - 5 {
        return Err(FrameError::SizeMismatch {
            declared,
            actual: frame.len() - 5,
        });
    }
    let (body, &[actual]) = frame.split_at(frame.len() - 1) else {
        return Err(FrameError::BadHeader);
    };
    let expected = checksum(body);
    if expected != actual {
        return Err(FrameError::BadChecksum { expected, actual });
    }
    if frame[4] != READ_COMMAND {
        return Err(FrameError::UnsupportedCommand { command: frame[4] });
    }
    let addresses = &body[6..];
    if addresses.len() % ADDRESS_BYTES_PER_DATA_BYTE != 0 {
        return Err(FrameError::SizeMismatch {
            declared,
            actual: addresses.len() + 2,
        });
    }
    Ok(addresses)
}

/// Build the ECU's reply to `query`, carrying one `data` byte per address.
pub fn build_response(query: &[u8], data: &[u8]) -> Result<FrameBuffer, FrameError> {
    let addresses = parse_query(query)?;
    let expected = addresses.len() / ADDRESS_BYTES_PER_DATA_BYTE;
    if data.len() != expected {
        return Err(FrameError::SizeMismatch {
            declared: expected,
            actual: data.len(),
        });
    }
    let mut reply = FrameBuffer::with_capacity(REPLY_PREFIX_LEN + data.len() + 1);
    reply.extend_from_slice(&REPLY_HEADER);
    // One data byte per three address bytes, so smaller than the query's size byte
    reply.push((data.len() + 1) as u8);
    reply.push(READ_REPLY_COMMAND);
    reply.extend_from_slice(data);
    reply.push(checksum(&reply));
    Ok(reply)
}

/// Published after every successful SSM cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsmDataReceived {
    pub cadence: Cadence,
    /// Codes updated by this cycle, in query order
    pub codes: CodeList<SsmCode>,
}

/// SSM request/response codec
#[derive(Debug, Default)]
pub struct SsmProtocol;

impl Protocol for SsmProtocol {
    type Code = SsmCode;
    type Data = SsmDataReceived;
    const NAME: &'static str = "ssm";
    const HAS_SLOW_CADENCE: bool = true;

    fn run_cycle(
        &mut self,
        link: &mut dyn LinkDriver,
        table: &ParameterTable<SsmCode>,
        cadence: Cadence,
    ) -> Result<CycleOutcome<SsmDataReceived>, LinkError> {
        let Some(query) = SsmQuery::build(table, cadence) else {
            return Ok(CycleOutcome::Idle);
        };

        link.discard_input()?;
        debug!("SSM > {}", hex::encode(query.frame()));
        link.write_all(query.frame())?;

        let mut response: FrameBuffer = smallvec::smallvec![0; query.expected_response_len()];
        link.read_exact(&mut response)?;
        debug!("SSM < {}", hex::encode(&response));

        let values = query.decode(&response)?;
        table.commit(&values);
        Ok(CycleOutcome::Received(SsmDataReceived {
            cadence,
            codes: query.codes,
        }))
    }
}

pub type SsmLink = CommLink<SsmProtocol>;

impl SsmLink {
    /// A stopped SSM link on `link`
    pub fn ssm(link: Box<dyn LinkDriver>) -> Self {
        Self::new(SsmProtocol, link)
    }
}

impl LinkHandle<SsmProtocol> {
    /// Latest state of a switch, as of the last read of its backing parameter
    #[must_use]
    pub fn switch(&self, switch: SsmSwitch) -> bool {
        switch.is_set(self.raw_value(switch.parameter()))
    }
}

impl FromStr for SsmCode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|code| code.to_string() == s)
            .ok_or_else(|| ConfigError::UnknownCode { name: s.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ScriptedLink;
    use smallvec::smallvec;

    #[test]
    fn test_single_code_frame_layout() {
        let query = SsmQuery::from_codes(Cadence::Fast, smallvec![SsmCode::CoolantTemperature]);
        assert_eq!(
            query.frame(),
            &[0x80, 0x10, 0xF0, 0x05, 0xA8, 0x00, 0x00, 0x00, 0x08, 0x35]
        );
        assert_eq!(query.expected_response_len(), 17);
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
        assert_eq!(checksum(&[]), 0x00);
    }

    #[test]
    fn test_build_uses_declaration_order() {
        let table = ParameterTable::<SsmCode>::new();
        table.set_enabled(SsmCode::VehicleSpeed, Cadence::Fast, true);
        table.set_enabled(SsmCode::CoolantTemperature, Cadence::Fast, true);
        table.set_enabled(SsmCode::BatteryVoltage, Cadence::Slow, true);

        let fast = SsmQuery::build(&table, Cadence::Fast).unwrap();
        assert_eq!(fast.codes(), &[SsmCode::CoolantTemperature, SsmCode::VehicleSpeed]);
        assert_eq!(&fast.frame()[6..12], &[0x00, 0x00, 0x08, 0x00, 0x00, 0x10]);

        let slow = SsmQuery::build(&table, Cadence::Slow).unwrap();
        assert_eq!(slow.codes(), &[SsmCode::BatteryVoltage]);
        assert_eq!(slow.cadence(), Cadence::Slow);
    }

    #[test]
    fn test_build_with_nothing_enabled() {
        let table = ParameterTable::<SsmCode>::new();
        assert!(SsmQuery::build(&table, Cadence::Fast).is_none());
    }

    #[test]
    fn test_decode_mixed_widths() {
        let query = SsmQuery::from_codes(
            Cadence::Fast,
            smallvec![SsmCode::CoolantTemperature, SsmCode::EngineSpeed],
        );
        assert_eq!(query.frame().len(), 16);
        assert_eq!(query.expected_response_len(), 25);

        let mut response = query.frame().to_vec();
        response.extend(build_response(query.frame(), &[0x82, 0x1A, 0xF8]).unwrap());
        let values = query.decode(&response).unwrap();
        assert_eq!(
            values.as_slice(),
            &[(SsmCode::CoolantTemperature, 130), (SsmCode::EngineSpeed, 0x1AF8)]
        );
    }

    #[test]
    fn test_decode_short_response() {
        let query = SsmQuery::from_codes(Cadence::Fast, smallvec![SsmCode::EngineSpeed]);
        let err = query.decode(&[0u8; 10]).unwrap_err();
        assert_eq!(
            err,
            FrameError::ShortResponse {
                expected: query.expected_response_len(),
                actual: 10,
            }
        );
    }

    #[test]
    fn test_parse_query_rejects_corruption() {
        let query = SsmQuery::from_codes(Cadence::Fast, smallvec![SsmCode::EngineLoad]);
        assert_eq!(parse_query(query.frame()).unwrap(), &[0x00, 0x00, 0x07]);

        let mut bad_sum = query.frame().to_vec();
        *bad_sum.last_mut().unwrap() ^= 0xFF;
        assert!(matches!(parse_query(&bad_sum), Err(FrameError::BadChecksum { .. })));

        let mut bad_header = query.frame().to_vec();
        bad_header[1] = 0x11;
        assert_eq!(parse_query(&bad_header), Err(FrameError::BadHeader));

        let mut bad_command = query.frame().to_vec();
        bad_command[4] = 0xB8;
        let last = bad_command.len() - 1;
        bad_command[last] = checksum(&bad_command[..last]);
        assert_eq!(
            parse_query(&bad_command),
            Err(FrameError::UnsupportedCommand { command: 0xB8 })
        );
    }

    #[test]
    fn test_build_response_layout() {
        let query = SsmQuery::from_codes(Cadence::Fast, smallvec![SsmCode::CoolantTemperature]);
        let reply = build_response(query.frame(), &[0x82]).unwrap();
        assert_eq!(reply.as_slice(), &[0x80, 0xF0, 0x10, 0x02, 0xE8, 0x82, 0xEC]);
        assert!(matches!(
            build_response(query.frame(), &[1, 2]),
            Err(FrameError::SizeMismatch { declared: 1, actual: 2 })
        ));
    }

    #[test]
    fn test_run_cycle_commits_and_reports() {
        let (mut link, script) = ScriptedLink::new("ecu");
        link.open().unwrap();
        let table = ParameterTable::<SsmCode>::new();
        table.set_enabled(SsmCode::EngineSpeed, Cadence::Fast, true);

        let query = SsmQuery::build(&table, Cadence::Fast).unwrap();
        script.push_data(query.frame());
        script.push_data(&build_response(query.frame(), &[0x1A, 0xF8]).unwrap());

        let outcome = SsmProtocol
            .run_cycle(&mut link, &table, Cadence::Fast)
            .unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Received(SsmDataReceived {
                cadence: Cadence::Fast,
                codes: smallvec![SsmCode::EngineSpeed],
            })
        );
        assert_eq!(script.writes(), vec![query.frame().to_vec()]);
        assert_eq!(script.input_discards(), 1);
        assert_eq!(table.raw_value(SsmCode::EngineSpeed), 0x1AF8);
        assert!(
            (table.value(SsmCode::EngineSpeed) - SsmCode::EngineSpeed.convert(0x1AF8)).abs()
                < f64::EPSILON
        );
    }

    #[test]
    fn test_run_cycle_timeout_leaves_table_untouched() {
        let (mut link, script) = ScriptedLink::new("ecu");
        link.open().unwrap();
        let table = ParameterTable::<SsmCode>::new();
        table.set_enabled(SsmCode::CoolantTemperature, Cadence::Fast, true);
        table.set_raw(SsmCode::CoolantTemperature, 100);

        let query = SsmQuery::build(&table, Cadence::Fast).unwrap();
        script.push_data(query.frame());
        script.push_data(&[0x80, 0xF0, 0x10]);
        script.push_timeout();

        let err = SsmProtocol
            .run_cycle(&mut link, &table, Cadence::Fast)
            .unwrap_err();
        assert!(matches!(err, LinkError::Timeout { expected: 17, received: 13 }));
        assert_eq!(table.raw_value(SsmCode::CoolantTemperature), 100);
    }

    #[test]
    fn test_idle_cycle_writes_nothing() {
        let (mut link, script) = ScriptedLink::new("ecu");
        link.open().unwrap();
        let table = ParameterTable::<SsmCode>::new();
        let outcome = SsmProtocol
            .run_cycle(&mut link, &table, Cadence::Slow)
            .unwrap();
        assert_eq!(outcome, CycleOutcome::Idle);
        assert!(script.writes().is_empty());
    }

    #[test]
    fn test_code_from_str() {
        assert_eq!("VehicleSpeed".parse::<SsmCode>(), Ok(SsmCode::VehicleSpeed));
        assert_eq!(
            "Warp".parse::<SsmCode>(),
            Err(ConfigError::UnknownCode {
                name: "Warp".to_string()
            })
        );
    }
}
