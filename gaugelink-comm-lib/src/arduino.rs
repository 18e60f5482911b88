//! Arduino sensor interface protocol.
//!
//! The Arduino pushes one text line per channel, `<header><decimal>\n`,
//! for [`LINES_PER_CYCLE`] channels in a row. The host never writes.

use std::str::FromStr;
use std::time::Duration;

use derive_more::Display;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::comm::{CommLink, CycleOutcome, Protocol};
use crate::error::{ConfigError, FrameError, LinkError};
use crate::link::LinkDriver;
use crate::table::{Cadence, CodeList, ParameterCode, ParameterTable};

pub const BAUD_RATE: u32 = 19200;
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Tachometer, speed, and six analog channels
pub const LINES_PER_CYCLE: usize = 8;

/// ADC full scale
const ADC_STEPS: f64 = 1024.0;
const ADC_REFERENCE_VOLTS: f64 = 5.0;

/// Tachometer pulses per crankshaft revolution
const TACHO_PULSES_PER_REV: f64 = 2.0;
/// Speed sensor pulses per kilometre
const SPEED_PULSES_PER_KM: f64 = 2548.0;

/// Coolant/oil thermistor: 10k at 25 degC with a 10k pull-up
const THERMISTOR_R25: f64 = 10_000.0;
const THERMISTOR_PULLUP: f64 = 10_000.0;
const THERMISTOR_BETA: f64 = 3380.0;
const KELVIN_25C: f64 = 298.15;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArduinoCode {
    EngineSpeed,
    VehicleSpeed,
    Boost,
    WaterTemperature,
    OilTemperature,
    OilTemperature2,
    OilPressure,
    FuelRailPressure,
}

impl ArduinoCode {
    /// Line header carrying this channel
    #[must_use]
    pub const fn header(self) -> char {
        match self {
            Self::EngineSpeed => 'T',
            Self::VehicleSpeed => 'S',
            Self::Boost => 'A',
            Self::WaterTemperature => 'B',
            Self::OilTemperature => 'C',
            Self::OilTemperature2 => 'D',
            Self::OilPressure => 'E',
            Self::FuelRailPressure => 'F',
        }
    }

    #[must_use]
    pub fn from_header(header: char) -> Option<Self> {
        Self::ALL.iter().copied().find(|code| code.header() == header)
    }
}

fn adc_volts(raw: i32) -> f64 {
    f64::from(raw) * ADC_REFERENCE_VOLTS / ADC_STEPS
}

fn thermistor_celsius(raw: i32) -> f64 {
    // Keep the divider away from 0 and full scale
    let raw = raw.clamp(1, ADC_STEPS as i32 - 2);
    let volts = adc_volts(raw);
    let resistance = THERMISTOR_PULLUP * volts / (ADC_REFERENCE_VOLTS - volts);
    1.0 / (1.0 / KELVIN_25C + (resistance / THERMISTOR_R25).ln() / THERMISTOR_BETA) - 273.15
}

impl ParameterCode for ArduinoCode {
    const ALL: &'static [Self] = &[
        Self::EngineSpeed,
        Self::VehicleSpeed,
        Self::Boost,
        Self::WaterTemperature,
        Self::OilTemperature,
        Self::OilTemperature2,
        Self::OilPressure,
        Self::FuelRailPressure,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn unit(self) -> &'static str {
        match self {
            Self::EngineSpeed => "rpm",
            Self::VehicleSpeed => "km/h",
            Self::Boost | Self::OilPressure | Self::FuelRailPressure => "kPa",
            Self::WaterTemperature | Self::OilTemperature | Self::OilTemperature2 => "degC",
        }
    }

    fn convert(self, raw: i32) -> f64 {
        match self {
            // Pulse period in microseconds
            Self::EngineSpeed => {
                if raw <= 0 {
                    0.0
                } else {
                    60.0e6 / (TACHO_PULSES_PER_REV * f64::from(raw))
                }
            }
            Self::VehicleSpeed => {
                if raw <= 0 {
                    0.0
                } else {
                    3600.0e6 / (SPEED_PULSES_PER_KM * f64::from(raw))
                }
            }
            // Absolute pressure sensor, reported relative to one atmosphere
            Self::Boost => (adc_volts(raw) / ADC_REFERENCE_VOLTS + 0.04) / 0.004 - 101.325,
            Self::WaterTemperature | Self::OilTemperature | Self::OilTemperature2 => {
                thermistor_celsius(raw)
            }
            // 0.5 V to 4.5 V over 0 to 1000 kPa
            Self::OilPressure | Self::FuelRailPressure => (adc_volts(raw) - 0.5) * 250.0,
        }
    }
}

impl FromStr for ArduinoCode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|code| code.to_string() == s)
            .ok_or_else(|| ConfigError::UnknownCode { name: s.to_string() })
    }
}

/// One decoded line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArduinoLine {
    Value(ArduinoCode, i32),
    /// Header character no channel uses
    Unknown(char),
}

/// Decode one line (without its terminator).
pub fn parse_line(line: &str) -> Result<ArduinoLine, FrameError> {
    let mut chars = line.chars();
    let header = chars.next().ok_or(FrameError::EmptyLine)?;
    let Some(code) = ArduinoCode::from_header(header) else {
        return Ok(ArduinoLine::Unknown(header));
    };
    let text = chars.as_str().trim();
    let raw = text.parse().map_err(|_| FrameError::InvalidNumber {
        header,
        text: text.to_string(),
    })?;
    Ok(ArduinoLine::Value(code, raw))
}

/// Published after every complete Arduino cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArduinoDataReceived {
    /// Codes updated by this cycle, in arrival order
    pub codes: CodeList<ArduinoCode>,
}

/// Arduino line reader
#[derive(Debug, Default)]
pub struct ArduinoProtocol;

impl Protocol for ArduinoProtocol {
    type Code = ArduinoCode;
    type Data = ArduinoDataReceived;
    const NAME: &'static str = "arduino";
    const HAS_SLOW_CADENCE: bool = false;

    fn run_cycle(
        &mut self,
        link: &mut dyn LinkDriver,
        table: &ParameterTable<ArduinoCode>,
        _cadence: Cadence,
    ) -> Result<CycleOutcome<ArduinoDataReceived>, LinkError> {
        let mut updates: CodeList<(ArduinoCode, i32)> = CodeList::new();
        for _ in 0..LINES_PER_CYCLE {
            let line = link.read_line()?;
            debug!("Arduino < {line:?}");
            match parse_line(&line) {
                Ok(ArduinoLine::Value(code, raw)) => updates.push((code, raw)),
                Ok(ArduinoLine::Unknown(header)) => {
                    warn!("Unknown Arduino header {header:?} in line {line:?}");
                }
                Err(FrameError::EmptyLine) => {
                    warn!("Empty Arduino line, abandoning cycle");
                    return Ok(CycleOutcome::Aborted);
                }
                Err(e) => return Err(e.into()),
            }
        }

        table.commit(&updates);
        Ok(CycleOutcome::Received(ArduinoDataReceived {
            codes: updates.iter().map(|&(code, _)| code).collect(),
        }))
    }
}

pub type ArduinoLink = CommLink<ArduinoProtocol>;

impl ArduinoLink {
    /// A stopped Arduino link on `link`
    pub fn arduino(link: Box<dyn LinkDriver>) -> Self {
        Self::new(ArduinoProtocol, link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ScriptedLink;

    fn push_cycle(script: &crate::link::ScriptHandle, lines: &[&str]) {
        for line in lines {
            script.push_line(line);
        }
    }

    #[test]
    fn test_headers_are_unique() {
        for &code in ArduinoCode::ALL {
            assert_eq!(ArduinoCode::from_header(code.header()), Some(code));
            assert_eq!(code.index(), ArduinoCode::ALL.iter().position(|&c| c == code).unwrap());
        }
        assert_eq!(ArduinoCode::from_header('Z'), None);
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse_line("T15000"),
            Ok(ArduinoLine::Value(ArduinoCode::EngineSpeed, 15000))
        );
        assert_eq!(parse_line("B512 "), Ok(ArduinoLine::Value(ArduinoCode::WaterTemperature, 512)));
        assert_eq!(parse_line("Q12"), Ok(ArduinoLine::Unknown('Q')));
        assert_eq!(parse_line(""), Err(FrameError::EmptyLine));
        assert_eq!(
            parse_line("S4x"),
            Err(FrameError::InvalidNumber {
                header: 'S',
                text: "4x".to_string()
            })
        );
    }

    #[test]
    fn test_conversions() {
        assert!((ArduinoCode::EngineSpeed.convert(10_000) - 3000.0).abs() < 1e-9);
        assert!(ArduinoCode::EngineSpeed.convert(0).abs() < f64::EPSILON);
        assert!(ArduinoCode::VehicleSpeed.convert(-1).abs() < f64::EPSILON);
        // Divider midpoint is the thermistor's 25 degC point
        assert!((ArduinoCode::WaterTemperature.convert(512) - 25.0).abs() < 1e-6);
        assert!(ArduinoCode::OilTemperature.convert(0).is_finite());
        assert!(ArduinoCode::OilTemperature.convert(1023).is_finite());
        assert!((ArduinoCode::OilPressure.convert(0) + 125.0).abs() < 1e-9);
    }

    #[test]
    fn test_full_cycle_updates_each_code_once() {
        let (mut link, script) = ScriptedLink::new("arduino");
        link.open().unwrap();
        push_cycle(
            &script,
            &["T10000", "S2000", "A300", "B512", "C500", "D510", "E400", "F600"],
        );
        let table = ParameterTable::<ArduinoCode>::new();

        let outcome = ArduinoProtocol
            .run_cycle(&mut link, &table, Cadence::Fast)
            .unwrap();
        let CycleOutcome::Received(data) = outcome else {
            panic!("expected data, got {outcome:?}");
        };
        assert_eq!(data.codes.as_slice(), ArduinoCode::ALL);
        assert_eq!(table.raw_value(ArduinoCode::EngineSpeed), 10_000);
        assert_eq!(table.raw_value(ArduinoCode::FuelRailPressure), 600);
        assert!(script.writes().is_empty());
    }

    #[test]
    fn test_unknown_header_is_skipped() {
        let (mut link, script) = ScriptedLink::new("arduino");
        link.open().unwrap();
        push_cycle(&script, &["T10000", "Z1", "A300", "B512", "C500", "D510", "E400", "F600"]);
        let table = ParameterTable::<ArduinoCode>::new();

        let CycleOutcome::Received(data) = ArduinoProtocol
            .run_cycle(&mut link, &table, Cadence::Fast)
            .unwrap()
        else {
            panic!("expected data");
        };
        assert_eq!(data.codes.len(), 7);
        assert!(!data.codes.contains(&ArduinoCode::VehicleSpeed));
    }

    #[test]
    fn test_empty_line_aborts_without_update() {
        let (mut link, script) = ScriptedLink::new("arduino");
        link.open().unwrap();
        push_cycle(&script, &["T10000", "S2000", "", "B512"]);
        let table = ParameterTable::<ArduinoCode>::new();

        let outcome = ArduinoProtocol
            .run_cycle(&mut link, &table, Cadence::Fast)
            .unwrap();
        assert_eq!(outcome, CycleOutcome::Aborted);
        assert_eq!(table.raw_value(ArduinoCode::EngineSpeed), 0);
        assert_eq!(table.raw_value(ArduinoCode::VehicleSpeed), 0);
        // The rest of the cycle is left unread
        assert!(!script.is_drained());
    }

    #[test]
    fn test_bad_number_is_a_link_error() {
        let (mut link, script) = ScriptedLink::new("arduino");
        link.open().unwrap();
        push_cycle(&script, &["T10000", "S20#0"]);
        let table = ParameterTable::<ArduinoCode>::new();

        let err = ArduinoProtocol
            .run_cycle(&mut link, &table, Cadence::Fast)
            .unwrap_err();
        assert!(matches!(
            err,
            LinkError::Malformed {
                source: FrameError::InvalidNumber { header: 'S', .. }
            }
        ));
        assert_eq!(table.raw_value(ArduinoCode::EngineSpeed), 0);
    }
}
