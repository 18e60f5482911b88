//! SSM parameter and switch definitions.
//!
//! Addresses are ECU RAM locations. Each 3-byte address returns one data
//! byte, so two-byte parameters list two consecutive addresses and their
//! bytes are combined big-endian.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::table::ParameterCode;

/// SSM parameters, in query order
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SsmCode {
    EngineLoad,
    CoolantTemperature,
    AfCorrection1,
    AfLearning1,
    AfCorrection2,
    AfLearning2,
    ManifoldAbsolutePressure,
    EngineSpeed,
    VehicleSpeed,
    IgnitionTiming,
    IntakeAirTemperature,
    MassAirFlow,
    ThrottleOpeningAngle,
    FrontO2Sensor1,
    RearO2Sensor,
    FrontO2Sensor2,
    BatteryVoltage,
    AirFlowSensorVoltage,
    ThrottleSensorVoltage,
    DifferentialPressureSensorVoltage,
    FuelInjection1PulseWidth,
    FuelInjection2PulseWidth,
    KnockCorrection,
    AtmosphericPressure,
    ManifoldRelativePressure,
    PressureDifferentialSensor,
    PrimaryWastegateDutyCycle,
    AirFuelSensor1,
    SwitchP0x061,
    SwitchP0x062,
    SwitchP0x063,
}

impl SsmCode {
    /// Concatenated 3-byte ECU addresses read for this parameter
    #[must_use]
    pub const fn address(self) -> &'static [u8] {
        match self {
            Self::EngineLoad => &[0x00, 0x00, 0x07],
            Self::CoolantTemperature => &[0x00, 0x00, 0x08],
            Self::AfCorrection1 => &[0x00, 0x00, 0x09],
            Self::AfLearning1 => &[0x00, 0x00, 0x0A],
            Self::AfCorrection2 => &[0x00, 0x00, 0x0B],
            Self::AfLearning2 => &[0x00, 0x00, 0x0C],
            Self::ManifoldAbsolutePressure => &[0x00, 0x00, 0x0D],
            Self::EngineSpeed => &[0x00, 0x00, 0x0E, 0x00, 0x00, 0x0F],
            Self::VehicleSpeed => &[0x00, 0x00, 0x10],
            Self::IgnitionTiming => &[0x00, 0x00, 0x11],
            Self::IntakeAirTemperature => &[0x00, 0x00, 0x12],
            Self::MassAirFlow => &[0x00, 0x00, 0x13, 0x00, 0x00, 0x14],
            Self::ThrottleOpeningAngle => &[0x00, 0x00, 0x15],
            Self::FrontO2Sensor1 => &[0x00, 0x00, 0x16, 0x00, 0x00, 0x17],
            Self::RearO2Sensor => &[0x00, 0x00, 0x18, 0x00, 0x00, 0x19],
            Self::FrontO2Sensor2 => &[0x00, 0x00, 0x1A, 0x00, 0x00, 0x1B],
            Self::BatteryVoltage => &[0x00, 0x00, 0x1C],
            Self::AirFlowSensorVoltage => &[0x00, 0x00, 0x1D],
            Self::ThrottleSensorVoltage => &[0x00, 0x00, 0x1E],
            Self::DifferentialPressureSensorVoltage => &[0x00, 0x00, 0x1F],
            Self::FuelInjection1PulseWidth => &[0x00, 0x00, 0x20],
            Self::FuelInjection2PulseWidth => &[0x00, 0x00, 0x21],
            Self::KnockCorrection => &[0x00, 0x00, 0x22],
            Self::AtmosphericPressure => &[0x00, 0x00, 0x23],
            Self::ManifoldRelativePressure => &[0x00, 0x00, 0x24],
            Self::PressureDifferentialSensor => &[0x00, 0x00, 0x25],
            Self::PrimaryWastegateDutyCycle => &[0x00, 0x00, 0x30],
            Self::AirFuelSensor1 => &[0x00, 0x00, 0x46],
            Self::SwitchP0x061 => &[0x00, 0x00, 0x61],
            Self::SwitchP0x062 => &[0x00, 0x00, 0x62],
            Self::SwitchP0x063 => &[0x00, 0x00, 0x63],
        }
    }

    #[must_use]
    pub const fn address_len(self) -> usize {
        self.address().len()
    }

    /// Number of data bytes the ECU returns for this parameter
    #[must_use]
    pub const fn data_len(self) -> usize {
        self.address_len() / super::ADDRESS_BYTES_PER_DATA_BYTE
    }
}

impl ParameterCode for SsmCode {
    const ALL: &'static [Self] = &[
        Self::EngineLoad,
        Self::CoolantTemperature,
        Self::AfCorrection1,
        Self::AfLearning1,
        Self::AfCorrection2,
        Self::AfLearning2,
        Self::ManifoldAbsolutePressure,
        Self::EngineSpeed,
        Self::VehicleSpeed,
        Self::IgnitionTiming,
        Self::IntakeAirTemperature,
        Self::MassAirFlow,
        Self::ThrottleOpeningAngle,
        Self::FrontO2Sensor1,
        Self::RearO2Sensor,
        Self::FrontO2Sensor2,
        Self::BatteryVoltage,
        Self::AirFlowSensorVoltage,
        Self::ThrottleSensorVoltage,
        Self::DifferentialPressureSensorVoltage,
        Self::FuelInjection1PulseWidth,
        Self::FuelInjection2PulseWidth,
        Self::KnockCorrection,
        Self::AtmosphericPressure,
        Self::ManifoldRelativePressure,
        Self::PressureDifferentialSensor,
        Self::PrimaryWastegateDutyCycle,
        Self::AirFuelSensor1,
        Self::SwitchP0x061,
        Self::SwitchP0x062,
        Self::SwitchP0x063,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn unit(self) -> &'static str {
        match self {
            Self::EngineLoad
            | Self::AfCorrection1
            | Self::AfLearning1
            | Self::AfCorrection2
            | Self::AfLearning2
            | Self::ThrottleOpeningAngle
            | Self::PrimaryWastegateDutyCycle => "%",
            Self::CoolantTemperature | Self::IntakeAirTemperature => "C",
            Self::ManifoldAbsolutePressure
            | Self::AtmosphericPressure
            | Self::ManifoldRelativePressure
            | Self::PressureDifferentialSensor => "kPa",
            Self::EngineSpeed => "rpm",
            Self::VehicleSpeed => "km/h",
            Self::IgnitionTiming | Self::KnockCorrection => "deg",
            Self::MassAirFlow => "g/s",
            Self::FrontO2Sensor1
            | Self::RearO2Sensor
            | Self::FrontO2Sensor2
            | Self::BatteryVoltage
            | Self::AirFlowSensorVoltage
            | Self::ThrottleSensorVoltage
            | Self::DifferentialPressureSensorVoltage => "V",
            Self::FuelInjection1PulseWidth | Self::FuelInjection2PulseWidth => "ms",
            Self::AirFuelSensor1 => "AFR",
            Self::SwitchP0x061 | Self::SwitchP0x062 | Self::SwitchP0x063 => "",
        }
    }

    fn convert(self, raw: i32) -> f64 {
        let x = f64::from(raw);
        match self {
            Self::EngineLoad | Self::ThrottleOpeningAngle | Self::PrimaryWastegateDutyCycle => {
                x * 100.0 / 255.0
            }
            Self::CoolantTemperature | Self::IntakeAirTemperature => x - 40.0,
            Self::AfCorrection1 | Self::AfLearning1 | Self::AfCorrection2 | Self::AfLearning2 => {
                (x - 128.0) * 100.0 / 128.0
            }
            Self::ManifoldAbsolutePressure | Self::AtmosphericPressure => x,
            Self::ManifoldRelativePressure | Self::PressureDifferentialSensor => x - 128.0,
            Self::EngineSpeed => x / 4.0,
            Self::VehicleSpeed => x,
            Self::IgnitionTiming | Self::KnockCorrection => (x - 128.0) / 2.0,
            Self::MassAirFlow => x / 100.0,
            Self::FrontO2Sensor1 | Self::RearO2Sensor | Self::FrontO2Sensor2 => x / 200.0,
            Self::BatteryVoltage => x * 8.0 / 100.0,
            Self::AirFlowSensorVoltage
            | Self::ThrottleSensorVoltage
            | Self::DifferentialPressureSensorVoltage => x / 50.0,
            Self::FuelInjection1PulseWidth | Self::FuelInjection2PulseWidth => x * 256.0 / 1000.0,
            Self::AirFuelSensor1 => x / 128.0 * 14.7,
            Self::SwitchP0x061 | Self::SwitchP0x062 | Self::SwitchP0x063 => x,
        }
    }
}

/// Single-bit switch states packed into the `SwitchP0x06*` parameters
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SsmSwitch {
    AtVehicleId,
    TestModeConnector,
    ReadMemoryConnector,
    NeutralPositionSwitch,
    IdleSwitch,
    IntercoolerAutowashSwitch,
    IgnitionSwitch,
    PowerSteeringOilPressureSwitch,
    AirConditioningSwitch,
    HandleBrakeSwitch,
    BrakeSwitch,
    ClutchSwitch,
    RearDefogSwitch,
}

impl SsmSwitch {
    pub const ALL: &'static [Self] = &[
        Self::AtVehicleId,
        Self::TestModeConnector,
        Self::ReadMemoryConnector,
        Self::NeutralPositionSwitch,
        Self::IdleSwitch,
        Self::IntercoolerAutowashSwitch,
        Self::IgnitionSwitch,
        Self::PowerSteeringOilPressureSwitch,
        Self::AirConditioningSwitch,
        Self::HandleBrakeSwitch,
        Self::BrakeSwitch,
        Self::ClutchSwitch,
        Self::RearDefogSwitch,
    ];

    /// Byte-wide parameter holding this switch
    #[must_use]
    pub const fn parameter(self) -> SsmCode {
        match self {
            Self::AtVehicleId | Self::TestModeConnector | Self::ReadMemoryConnector => {
                SsmCode::SwitchP0x061
            }
            Self::NeutralPositionSwitch
            | Self::IdleSwitch
            | Self::IntercoolerAutowashSwitch
            | Self::IgnitionSwitch
            | Self::PowerSteeringOilPressureSwitch
            | Self::AirConditioningSwitch => SsmCode::SwitchP0x062,
            Self::HandleBrakeSwitch
            | Self::BrakeSwitch
            | Self::ClutchSwitch
            | Self::RearDefogSwitch => SsmCode::SwitchP0x063,
        }
    }

    /// Bit position (0 = LSB) within the parameter byte
    #[must_use]
    pub const fn bit(self) -> u8 {
        match self {
            Self::AtVehicleId | Self::NeutralPositionSwitch | Self::HandleBrakeSwitch => 7,
            Self::TestModeConnector | Self::IdleSwitch | Self::BrakeSwitch => 6,
            Self::ReadMemoryConnector | Self::IntercoolerAutowashSwitch | Self::ClutchSwitch => 5,
            Self::IgnitionSwitch | Self::RearDefogSwitch => 4,
            Self::PowerSteeringOilPressureSwitch => 3,
            Self::AirConditioningSwitch => 2,
        }
    }

    /// Test this switch's bit in a raw parameter value
    #[must_use]
    pub const fn is_set(self, raw: i32) -> bool {
        (raw >> self.bit()) & 1 == 1
    }
}
