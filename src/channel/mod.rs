// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transport channels to the alarm controller.
//!
//! Two interchangeable transports implement the [`Channel`] contract:
//!
//! - [`SocketChannel`]: a long-lived WebSocket push stream plus plain
//!   authenticated HTTP requests, for when the controller is reachable on
//!   the local network.
//! - [`BrokerChannel`]: MQTT publish/subscribe through a broker, with
//!   request/response correlation synthesized over fire-and-forget topics.
//!
//! Both variants demultiplex inbound controller messages into a shared
//! [`ChannelEvent`] stream consumed by the service.

mod broker;
mod correlation;
mod socket;

pub use broker::BrokerChannel;
pub use socket::SocketChannel;

use std::collections::HashMap;
use std::future::Future;

use tokio::sync::broadcast;

use crate::error::{ParseError, Result};
use crate::event::{AtsEvent, EventKind, decode_state_payload};
use crate::types::{AlarmMode, Sensor, SensorLocation, SystemState};

/// Connection state of a channel.
///
/// Transitions happen only in response to transport-level signals, never
/// from command logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport session.
    Disconnected,
    /// A reconnect loop is running.
    Connecting,
    /// Transport session established.
    Connected,
}

/// Events a channel pushes to its observers.
///
/// Any number of observers may subscribe via [`Channel::events`]; each gets
/// an independent copy of every event.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Transport session established.
    Connected,
    /// Transport session lost (or given up for the slow retry interval).
    Disconnected,
    /// Server time broadcast, in epoch seconds.
    Time(i64),
    /// The controller asked this client to identify itself.
    WhoAmI,
    /// Map of logical event names to the wire topics carrying them.
    EventTopics(HashMap<String, String>),
    /// Full replacement sensor roster.
    Sensors(Vec<Sensor>),
    /// A decoded domain event.
    Event(AtsEvent),
    /// Broker last-will presence for the controller (broker channel only).
    PeerPresence(bool),
}

/// Capability contract shared by both transports.
///
/// All commands are authenticated with a caller-supplied one-time token and
/// resolve to a single eventual result; channels never retry commands.
///
/// Methods return explicit `Send` futures so generic service code can run
/// them from spawned tasks; implementations still write plain `async fn`.
pub trait Channel: Clone + Send + Sync + 'static {
    /// Begins asynchronous session establishment. No-op when already
    /// connected or already retrying.
    fn connect(&self) -> impl Future<Output = ()> + Send;

    /// Whether a transport session is currently established.
    fn is_connected(&self) -> bool;

    /// Current connection state, including the implicit `Connecting` phase
    /// while a retry loop is running.
    fn state(&self) -> ConnectionState;

    /// Subscribes to connection transitions and inbound events.
    fn events(&self) -> broadcast::Receiver<ChannelEvent>;

    /// Fetches the controller's current time in epoch seconds.
    fn server_time(&self) -> impl Future<Output = Result<i64>> + Send;

    /// Fire-and-forget identity announcement in reply to a `Who` request.
    fn send_handshake(&self, token: &str) -> impl Future<Output = Result<()>> + Send;

    /// Queries the current system state snapshot.
    fn query_state(&self, token: &str) -> impl Future<Output = Result<SystemState>> + Send;

    /// Arms the system in the given mode.
    fn arm(
        &self,
        token: &str,
        mode: AlarmMode,
        code: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Disarms the system.
    fn disarm(&self, token: &str, code: &str) -> impl Future<Output = Result<()>> + Send;

    /// Bypasses a single sensor.
    fn bypass_one(
        &self,
        token: &str,
        location: &SensorLocation,
        code: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Bypasses a set of sensors.
    fn bypass_all(
        &self,
        token: &str,
        locations: &[SensorLocation],
        code: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Clears every bypass.
    fn clear_bypass(&self, token: &str, code: &str) -> impl Future<Output = Result<()>> + Send;

    /// Clears the bypass of a single sensor.
    fn clear_bypass_one(
        &self,
        token: &str,
        location: &SensorLocation,
        code: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Puts the controller into programming mode.
    fn program(&self, token: &str, code: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Builds a domain event from a wire topic's payload.
///
/// Payload-coded kinds get the fixed-width decode; the rest carry their
/// payload as JSON (or a bare string when the payload is not JSON).
pub(crate) fn decode_wire_event(
    kind: EventKind,
    payload: &str,
) -> std::result::Result<AtsEvent, ParseError> {
    if kind.is_payload_coded() {
        let decoded = decode_state_payload(payload)?;
        return Ok(match kind {
            EventKind::SystemStateChanged => AtsEvent::SystemStateChanged(decoded),
            EventKind::SystemArmed => AtsEvent::SystemArmed(decoded),
            EventKind::SystemDisarmed => AtsEvent::SystemDisarmed(decoded),
            EventKind::SystemAlarmed => AtsEvent::SystemAlarmed(decoded),
            EventKind::SystemAlert => AtsEvent::SystemAlert(decoded),
            // is_payload_coded() admits exactly the five kinds above.
            _ => unreachable!(),
        });
    }

    let json = |payload: &str| {
        serde_json::from_str::<serde_json::Value>(payload)
            .unwrap_or_else(|_| serde_json::Value::String(payload.to_string()))
    };

    match kind {
        EventKind::SensorActived => Ok(AtsEvent::SensorActived(json(payload))),
        EventKind::BypassChange => Ok(AtsEvent::BypassChange(json(payload))),
        EventKind::SirenActived => Ok(AtsEvent::SirenActived),
        EventKind::SirenSilenced => Ok(AtsEvent::SirenSilenced),
        EventKind::MaxAlerts => Ok(AtsEvent::MaxAlerts),
        EventKind::MaxUnauthorizedIntents => Ok(AtsEvent::MaxUnauthorizedIntents),
        EventKind::NotAuthorized => Ok(AtsEvent::NotAuthorized),
        other => Err(ParseError::UnexpectedFormat(format!(
            "{other:?} is not carried on a wire event topic"
        ))),
    }
}
