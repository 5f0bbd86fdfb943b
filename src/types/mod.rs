// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Domain types shared by both channels and the service.
//!
//! The numeric ordinals of [`AlarmState`] and [`AlarmMode`] are part of the
//! wire protocol (payload-coded events carry them as single base-32 digits)
//! and must not be reordered.

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Current state of the alarm system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum AlarmState {
    /// System idle, ready to arm.
    Ready = 0,
    /// System explicitly disarmed.
    Disarmed = 1,
    /// Exit delay running.
    Leaving = 2,
    /// System armed.
    Armed = 3,
    /// Entry delay running.
    Entering = 4,
    /// An alarm has fired.
    Alarmed = 5,
    /// Controller is in programming mode.
    Programming = 6,
}

impl TryFrom<u8> for AlarmState {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ready),
            1 => Ok(Self::Disarmed),
            2 => Ok(Self::Leaving),
            3 => Ok(Self::Armed),
            4 => Ok(Self::Entering),
            5 => Ok(Self::Alarmed),
            6 => Ok(Self::Programming),
            other => Err(ParseError::InvalidValue {
                field: "state".to_string(),
                message: format!("unknown alarm state ordinal {other}"),
            }),
        }
    }
}

impl From<AlarmState> for u8 {
    fn from(state: AlarmState) -> Self {
        state as Self
    }
}

/// Arming mode of the alarm system.
///
/// Commands send the numeric ordinal on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum AlarmMode {
    /// All sensor groups active.
    Away = 0,
    /// Perimeter only, occupants inside.
    Stay = 1,
    /// Maximum protection, no entry delay exceptions.
    Maximum = 2,
    /// Night-time stay profile.
    NightStay = 3,
    /// Instant trigger, no entry delay.
    Instant = 4,
    /// Chime only, no alarm.
    Chime = 5,
}

impl TryFrom<u8> for AlarmMode {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Away),
            1 => Ok(Self::Stay),
            2 => Ok(Self::Maximum),
            3 => Ok(Self::NightStay),
            4 => Ok(Self::Instant),
            5 => Ok(Self::Chime),
            other => Err(ParseError::InvalidValue {
                field: "mode".to_string(),
                message: format!("unknown alarm mode ordinal {other}"),
            }),
        }
    }
}

impl From<AlarmMode> for u8 {
    fn from(mode: AlarmMode) -> Self {
        mode as Self
    }
}

/// Kind of hardware sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum SensorType {
    /// Passive infrared motion detector.
    PirMotion = 0,
    /// Magnetic door/window switch.
    MagneticSwitch = 1,
    /// Infrared beam switch.
    IrSwitch = 2,
}

impl TryFrom<u8> for SensorType {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::PirMotion),
            1 => Ok(Self::MagneticSwitch),
            2 => Ok(Self::IrSwitch),
            other => Err(ParseError::InvalidValue {
                field: "type".to_string(),
                message: format!("unknown sensor type ordinal {other}"),
            }),
        }
    }
}

impl From<SensorType> for u8 {
    fn from(sensor_type: SensorType) -> Self {
        sensor_type as Self
    }
}

/// Protection group a sensor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum SensorGroup {
    /// Inside the protected area.
    Interior = 0,
    /// Doors and windows on the boundary.
    Perimeter = 1,
    /// Outside the protected area.
    Exterior = 2,
    /// Entry/exit points.
    Access = 3,
}

impl TryFrom<u8> for SensorGroup {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Interior),
            1 => Ok(Self::Perimeter),
            2 => Ok(Self::Exterior),
            3 => Ok(Self::Access),
            other => Err(ParseError::InvalidValue {
                field: "group".to_string(),
                message: format!("unknown sensor group ordinal {other}"),
            }),
        }
    }
}

impl From<SensorGroup> for u8 {
    fn from(group: SensorGroup) -> Self {
        group as Self
    }
}

/// Physical address of a sensor: device MAC plus GPIO pin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorLocation {
    /// MAC address of the sensor device.
    pub mac: String,
    /// Pin number on the device.
    pub pin: u8,
}

impl SensorLocation {
    /// Creates a new sensor location.
    #[must_use]
    pub fn new(mac: impl Into<String>, pin: u8) -> Self {
        Self {
            mac: mac.into(),
            pin,
        }
    }

    /// Composite id (`mac:pin`) used by consumers to reconcile sensors.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}:{}", self.mac, self.pin)
    }
}

impl std::fmt::Display for SensorLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.mac, self.pin)
    }
}

/// A registered sensor in the controller's roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sensor {
    /// Physical address of the sensor.
    pub location: SensorLocation,
    /// Hardware kind.
    #[serde(rename = "type")]
    pub sensor_type: SensorType,
    /// Human-readable name.
    pub name: String,
    /// Protection group.
    pub group: SensorGroup,
    /// Whether the sensor is currently bypassed.
    #[serde(default)]
    pub bypassed: bool,
    /// Whether the sensor is currently reachable.
    #[serde(default)]
    pub online: bool,
}

/// Immutable snapshot of the whole system state.
///
/// Snapshots are replaced wholesale on every update, never patched
/// field-by-field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemState {
    /// Current alarm state.
    pub state: AlarmState,
    /// Current arming mode.
    pub mode: AlarmMode,
    /// Indices into the sensor roster of currently active sensors.
    #[serde(rename = "activedSensors", default)]
    pub active_sensors: Vec<u16>,
    /// Remaining entry/exit time in milliseconds.
    #[serde(default)]
    pub left_time_millis: i64,
    /// Controller uptime in milliseconds.
    #[serde(default)]
    pub uptime_millis: i64,
}
