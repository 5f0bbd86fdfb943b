// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoder for payload-coded domain events.
//!
//! State-changed, armed, disarmed, alarmed and alert events carry a compact
//! fixed-width string of base-32 digits instead of JSON:
//!
//! ```text
//! offset  width  field
//! 0       1      alarm state ordinal
//! 1       1      alarm mode ordinal
//! 2       2      remaining entry/exit timeout (seconds)
//! 4       2      count of active sensors
//! 6       2*n    active sensor indices
//! ```

use crate::error::ParseError;
use crate::event::StatePayload;
use crate::types::SystemState;

fn digit(payload: &str, index: usize) -> Result<u32, ParseError> {
    let c = payload
        .as_bytes()
        .get(index)
        .copied()
        .ok_or_else(|| ParseError::UnexpectedFormat(format!(
            "payload truncated at offset {index}"
        )))?;
    (c as char)
        .to_digit(32)
        .ok_or_else(|| ParseError::InvalidValue {
            field: format!("payload[{index}]"),
            message: format!("{:?} is not a base-32 digit", c as char),
        })
}

fn field(payload: &str, index: usize) -> Result<u32, ParseError> {
    Ok(digit(payload, index)? * 32 + digit(payload, index + 1)?)
}

/// Decodes a payload-coded event body into a state snapshot plus timeout.
///
/// # Errors
///
/// Returns [`ParseError`] if the string is truncated, contains a non-digit,
/// or carries an unknown state/mode ordinal.
///
/// # Examples
///
/// ```
/// use atslink::event::decode_state_payload;
/// use atslink::types::{AlarmMode, AlarmState};
///
/// let payload = decode_state_payload("310C020509").unwrap();
/// assert_eq!(payload.system.state, AlarmState::Armed);
/// assert_eq!(payload.system.mode, AlarmMode::Stay);
/// assert_eq!(payload.left_timeout, 12);
/// assert_eq!(payload.system.active_sensors, vec![5, 9]);
/// ```
pub fn decode_state_payload(payload: &str) -> Result<StatePayload, ParseError> {
    let state = u8::try_from(digit(payload, 0)?).map_err(|_| ParseError::InvalidValue {
        field: "state".to_string(),
        message: "ordinal out of range".to_string(),
    })?;
    let mode = u8::try_from(digit(payload, 1)?).map_err(|_| ParseError::InvalidValue {
        field: "mode".to_string(),
        message: "ordinal out of range".to_string(),
    })?;
    let left_timeout = field(payload, 2)?;
    let count = field(payload, 4)? as usize;

    let mut active_sensors = Vec::with_capacity(count);
    for i in 0..count {
        let value = field(payload, 6 + i * 2)?;
        active_sensors.push(value as u16);
    }

    Ok(StatePayload {
        system: SystemState {
            state: state.try_into()?,
            mode: mode.try_into()?,
            active_sensors,
            left_time_millis: i64::from(left_timeout) * 1000,
            uptime_millis: 0,
        },
        left_timeout,
    })
}
