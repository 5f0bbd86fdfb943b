// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Domain events and the public event bus.
//!
//! Every event the service can emit is a variant of the closed [`AtsEvent`]
//! sum type. Subscription is keyed by [`EventKind`], the fieldless
//! discriminant of the same set, so an unknown event name cannot be silently
//! dropped the way a typo in a string-keyed registry would be.

mod bus;
mod payload;

pub use bus::{EventBus, SubscriptionId};
pub use payload::decode_state_payload;

use serde::{Deserialize, Serialize};

use crate::types::{Sensor, SystemState};

/// A state snapshot bundled with the remaining entry/exit timeout, as
/// carried by payload-coded events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePayload {
    /// The new system state snapshot.
    pub system: SystemState,
    /// Remaining entry/exit timeout in seconds.
    pub left_timeout: u32,
}

/// All events published on the [`EventBus`].
#[derive(Debug, Clone, PartialEq)]
pub enum AtsEvent {
    /// The system state changed.
    SystemStateChanged(StatePayload),
    /// The system was armed.
    SystemArmed(StatePayload),
    /// The system was disarmed.
    SystemDisarmed(StatePayload),
    /// An alarm fired.
    SystemAlarmed(StatePayload),
    /// The system raised an alert.
    SystemAlert(StatePayload),
    /// A sensor was activated; payload is the raw controller message.
    SensorActived(serde_json::Value),
    /// The bypass configuration changed.
    BypassChange(serde_json::Value),
    /// The siren turned on.
    SirenActived,
    /// The siren was silenced.
    SirenSilenced,
    /// The controller hit its alert limit.
    MaxAlerts,
    /// Too many commands with bad credentials.
    MaxUnauthorizedIntents,
    /// A command was rejected for bad credentials.
    NotAuthorized,
    /// The sensor roster was replaced; carries the full new roster.
    SensorsUpdated(Vec<Sensor>),
    /// The local (socket) channel connected or disconnected.
    LocalConnectionChanged(bool),
    /// The remote (broker) channel connected or disconnected.
    RemoteConnectionChanged(bool),
    /// Broker last-will reports the controller reachable.
    ServerOnline,
    /// Broker last-will reports the controller unreachable.
    ServerOffline,
}

/// Topic key for [`EventBus`] subscriptions: one per [`AtsEvent`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// See [`AtsEvent::SystemStateChanged`].
    SystemStateChanged,
    /// See [`AtsEvent::SystemArmed`].
    SystemArmed,
    /// See [`AtsEvent::SystemDisarmed`].
    SystemDisarmed,
    /// See [`AtsEvent::SystemAlarmed`].
    SystemAlarmed,
    /// See [`AtsEvent::SystemAlert`].
    SystemAlert,
    /// See [`AtsEvent::SensorActived`].
    SensorActived,
    /// See [`AtsEvent::BypassChange`].
    BypassChange,
    /// See [`AtsEvent::SirenActived`].
    SirenActived,
    /// See [`AtsEvent::SirenSilenced`].
    SirenSilenced,
    /// See [`AtsEvent::MaxAlerts`].
    MaxAlerts,
    /// See [`AtsEvent::MaxUnauthorizedIntents`].
    MaxUnauthorizedIntents,
    /// See [`AtsEvent::NotAuthorized`].
    NotAuthorized,
    /// See [`AtsEvent::SensorsUpdated`].
    SensorsUpdated,
    /// See [`AtsEvent::LocalConnectionChanged`].
    LocalConnectionChanged,
    /// See [`AtsEvent::RemoteConnectionChanged`].
    RemoteConnectionChanged,
    /// See [`AtsEvent::ServerOnline`].
    ServerOnline,
    /// See [`AtsEvent::ServerOffline`].
    ServerOffline,
}

impl AtsEvent {
    /// Returns the topic key this event is delivered under.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SystemStateChanged(_) => EventKind::SystemStateChanged,
            Self::SystemArmed(_) => EventKind::SystemArmed,
            Self::SystemDisarmed(_) => EventKind::SystemDisarmed,
            Self::SystemAlarmed(_) => EventKind::SystemAlarmed,
            Self::SystemAlert(_) => EventKind::SystemAlert,
            Self::SensorActived(_) => EventKind::SensorActived,
            Self::BypassChange(_) => EventKind::BypassChange,
            Self::SirenActived => EventKind::SirenActived,
            Self::SirenSilenced => EventKind::SirenSilenced,
            Self::MaxAlerts => EventKind::MaxAlerts,
            Self::MaxUnauthorizedIntents => EventKind::MaxUnauthorizedIntents,
            Self::NotAuthorized => EventKind::NotAuthorized,
            Self::SensorsUpdated(_) => EventKind::SensorsUpdated,
            Self::LocalConnectionChanged(_) => EventKind::LocalConnectionChanged,
            Self::RemoteConnectionChanged(_) => EventKind::RemoteConnectionChanged,
            Self::ServerOnline => EventKind::ServerOnline,
            Self::ServerOffline => EventKind::ServerOffline,
        }
    }
}

impl EventKind {
    /// Parses a logical event name from the controller's `Events` config
    /// message.
    ///
    /// Returns `None` for names this client does not model; the caller
    /// decides whether to ignore or log them.
    #[must_use]
    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "SYSTEM_STATE_CHANGED" => Some(Self::SystemStateChanged),
            "SYSTEM_ARMED" => Some(Self::SystemArmed),
            "SYSTEM_DISARMED" => Some(Self::SystemDisarmed),
            "SYSTEM_ALARMED" => Some(Self::SystemAlarmed),
            "SYSTEM_ALERT" => Some(Self::SystemAlert),
            "SENSOR_ACTIVED" => Some(Self::SensorActived),
            "BYPASS_CHANGE" => Some(Self::BypassChange),
            "SIREN_ACTIVED" => Some(Self::SirenActived),
            "SIREN_SILENCED" => Some(Self::SirenSilenced),
            "MAX_ALERTS" => Some(Self::MaxAlerts),
            "MAX_UNAUTHORIZED_INTENTS" => Some(Self::MaxUnauthorizedIntents),
            "NOT_AUTHORIZED" => Some(Self::NotAuthorized),
            _ => None,
        }
    }

    /// Whether this kind's wire payload is the compact fixed-width encoding
    /// decoded by [`decode_state_payload`].
    #[must_use]
    pub fn is_payload_coded(self) -> bool {
        matches!(
            self,
            Self::SystemStateChanged
                | Self::SystemArmed
                | Self::SystemDisarmed
                | Self::SystemAlarmed
                | Self::SystemAlert
        )
    }
}
