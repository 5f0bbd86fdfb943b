// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT broker transport to the alarm controller.
//!
//! The controller publishes its broadcasts (`TIME`, `SENSORS`, `EVENTS`,
//! per-event `STATE/<name>` topics and an `LWT` presence will) under a
//! shared prefix, and accepts commands as JSON on `<prefix>/cmnd/<COMMAND>`.
//! Every command carries a message id; the controller answers on
//! `<prefix>/RESULT/<id>`, which this channel correlates back to the
//! caller.
//!
//! # Examples
//!
//! ```no_run
//! use atslink::channel::{BrokerChannel, Channel};
//! use atslink::config::BrokerConfig;
//!
//! # async fn example() -> atslink::Result<()> {
//! let config = BrokerConfig::new("192.168.1.20").with_credentials("ats", "secret");
//! let broker = BrokerChannel::new(&config, "phone-1");
//! broker.connect().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::json;
use tokio::sync::broadcast;

use crate::channel::correlation::{CorrelationTable, RESPONSE_TIMEOUT, message_id};
use crate::channel::{Channel, ChannelEvent, ConnectionState, decode_wire_event};
use crate::config::BrokerConfig;
use crate::error::{CommandError, Error, ParseError, ProtocolError, Result};
use crate::event::EventKind;
use crate::types::{AlarmMode, Sensor, SensorLocation, SystemState};

/// Global counter for generating unique MQTT client ids.
static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Pacing between poll attempts after an event loop error.
const RECONNECT_PACING: Duration = Duration::from_secs(3);

/// Capacity of the channel event broadcast.
const EVENT_CAPACITY: usize = 64;

/// Reply payload signalling boolean success.
const TRUE_SENTINEL: &str = "TRUE";

/// MQTT transport to the alarm controller.
///
/// Cheaply cloneable (via `Arc`); all clones share one broker session.
#[derive(Clone)]
pub struct BrokerChannel {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    client: AsyncClient,
    /// Taken by the first `connect()`; the poll task owns it afterwards.
    event_loop: Mutex<Option<EventLoop>>,
    prefix: String,
    connected: AtomicBool,
    started: AtomicBool,
    events: broadcast::Sender<ChannelEvent>,
    replies: CorrelationTable,
    /// Wire topic name to event kind, announced on the `EVENTS` topic.
    wire_topics: RwLock<HashMap<String, EventKind>>,
}

impl BrokerChannel {
    /// Creates the channel without touching the network. Call
    /// [`connect`](Channel::connect) to start the session.
    #[must_use]
    pub fn new(config: &BrokerConfig, client_id: &str) -> Self {
        let counter = CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mqtt_id = format!("{client_id}-{}-{counter}", std::process::id());

        let mut options = MqttOptions::new(&mqtt_id, config.host(), config.port());
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(true);
        if let Some((username, password)) = config.credentials() {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, 10);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(BrokerInner {
                client,
                event_loop: Mutex::new(Some(event_loop)),
                prefix: config.topic_prefix().to_string(),
                connected: AtomicBool::new(false),
                started: AtomicBool::new(false),
                events,
                replies: CorrelationTable::default(),
                wire_topics: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn emit(&self, event: ChannelEvent) {
        // Send only fails when nobody is subscribed, which is fine.
        let _ = self.inner.events.send(event);
    }

    /// Subscribes to the controller's broadcast topics. Re-run after every
    /// ConnAck since the session is clean.
    async fn subscribe_all(&self) -> std::result::Result<(), rumqttc::ClientError> {
        let prefix = &self.inner.prefix;
        for suffix in ["TIME", "SENSORS", "EVENTS", "LWT", "RESULT/#", "STATE/#"] {
            self.inner
                .client
                .subscribe(format!("{prefix}/{suffix}"), QoS::AtLeastOnce)
                .await?;
        }
        Ok(())
    }

    /// Demultiplexes one inbound publish.
    fn handle_message(&self, topic: &str, payload: &str) {
        let Some(route) = topic.strip_prefix(&format!("{}/", self.inner.prefix)) else {
            tracing::trace!(topic = %topic, "Ignoring message outside topic prefix");
            return;
        };

        if let Some(id) = route.strip_prefix("RESULT/") {
            if !self.inner.replies.complete(id, payload) {
                tracing::trace!(id = %id, "Stray reply with no waiter");
            }
            return;
        }

        if let Some(wire) = route.strip_prefix("STATE/") {
            self.handle_state_topic(wire, payload);
            return;
        }

        match route {
            "TIME" => match payload.trim().parse::<i64>() {
                Ok(seconds) => self.emit(ChannelEvent::Time(seconds)),
                Err(_) => {
                    tracing::warn!(payload = %payload, "Unparseable server time broadcast");
                }
            },
            "SENSORS" => match serde_json::from_str::<Vec<Sensor>>(payload) {
                Ok(sensors) => self.emit(ChannelEvent::Sensors(sensors)),
                Err(e) => tracing::warn!(error = %e, "Unparseable sensor roster"),
            },
            "EVENTS" => match serde_json::from_str::<HashMap<String, String>>(payload) {
                Ok(map) => {
                    let mut wire_topics = self.inner.wire_topics.write();
                    wire_topics.clear();
                    for (logical, wire) in &map {
                        match EventKind::from_wire_name(logical) {
                            Some(kind) => {
                                wire_topics.insert(wire.clone(), kind);
                            }
                            None => {
                                tracing::debug!(name = %logical, "Unknown event name announced");
                            }
                        }
                    }
                    drop(wire_topics);
                    self.emit(ChannelEvent::EventTopics(map));
                }
                Err(e) => tracing::warn!(error = %e, "Unparseable event topic map"),
            },
            "LWT" => {
                self.emit(ChannelEvent::PeerPresence(
                    payload.trim().eq_ignore_ascii_case("online"),
                ));
            }
            other => tracing::trace!(topic = %other, "Unhandled broadcast topic"),
        }
    }

    fn handle_state_topic(&self, wire: &str, payload: &str) {
        let kind = self
            .inner
            .wire_topics
            .read()
            .get(wire)
            .copied()
            .or_else(|| EventKind::from_wire_name(wire));
        let Some(kind) = kind else {
            tracing::debug!(topic = %wire, "State message on unannounced topic");
            return;
        };
        match decode_wire_event(kind, payload) {
            Ok(event) => self.emit(ChannelEvent::Event(event)),
            Err(e) => tracing::warn!(topic = %wire, error = %e, "Undecodable event payload"),
        }
    }

    /// Publishes a command and waits for its correlated reply.
    async fn command(
        &self,
        name: &str,
        token: Option<&str>,
        mut params: serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        if let Some(token) = token {
            params.insert("token".to_string(), json!(token));
        }
        let id = message_id(token, now_millis());
        let payload = json!({
            "command": name,
            "id": id,
            "params": params,
        });
        let topic = format!("{}/cmnd/{}", self.inner.prefix, name.to_uppercase());

        let rx = self.inner.replies.register(&id);
        tracing::debug!(command = %name, id = %id, "Publishing command");
        self.inner
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_string())
            .await
            .map_err(|e| Error::Protocol(ProtocolError::Mqtt(e)))?;

        let reply = self
            .inner
            .replies
            .wait_registered(&id, rx, RESPONSE_TIMEOUT)
            .await?;
        Ok(reply)
    }

    /// Runs a command whose reply is the boolean-success sentinel.
    async fn bool_command(
        &self,
        name: &str,
        token: &str,
        params: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let reply = self.command(name, Some(token), params).await?;
        if reply.trim() == TRUE_SENTINEL {
            Ok(())
        } else {
            Err(Error::Command(CommandError::Rejected(reply)))
        }
    }
}

impl Channel for BrokerChannel {
    async fn connect(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            tracing::debug!("Broker channel already started");
            return;
        }
        let Some(event_loop) = self.inner.event_loop.lock().take() else {
            return;
        };
        let channel = self.clone();
        tokio::spawn(async move {
            run_event_loop(channel, event_loop).await;
        });
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else if self.inner.started.load(Ordering::Acquire) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    async fn server_time(&self) -> Result<i64> {
        let reply = self.command("time", None, serde_json::Map::new()).await?;
        reply.trim().parse::<i64>().map_err(|_| {
            Error::Parse(ParseError::InvalidValue {
                field: "time".to_string(),
                message: format!("not an epoch second count: {reply}"),
            })
        })
    }

    async fn send_handshake(&self, _token: &str) -> Result<()> {
        // The broker identifies this client by its MQTT client id; there is
        // no identity envelope to answer on this transport.
        tracing::debug!("Handshake is implicit on the broker transport");
        Ok(())
    }

    async fn query_state(&self, token: &str) -> Result<SystemState> {
        let reply = self
            .command("state", Some(token), serde_json::Map::new())
            .await?;
        if reply.trim().is_empty() {
            return Err(Error::Command(CommandError::EmptyResponse));
        }
        let state: SystemState = serde_json::from_str(&reply)?;
        Ok(state)
    }

    async fn arm(&self, token: &str, mode: AlarmMode, code: Option<&str>) -> Result<()> {
        let mut params = serde_json::Map::new();
        params.insert("mode".to_string(), json!(u8::from(mode)));
        if let Some(code) = code {
            params.insert("code".to_string(), json!(code));
        }
        self.bool_command("arm", token, params).await
    }

    async fn disarm(&self, token: &str, code: &str) -> Result<()> {
        let mut params = serde_json::Map::new();
        params.insert("code".to_string(), json!(code));
        self.bool_command("disarm", token, params).await
    }

    async fn bypass_one(
        &self,
        token: &str,
        location: &SensorLocation,
        code: Option<&str>,
    ) -> Result<()> {
        let mut params = serde_json::Map::new();
        params.insert("location".to_string(), serde_json::to_value(location)?);
        if let Some(code) = code {
            params.insert("code".to_string(), json!(code));
        }
        self.bool_command("bypass", token, params).await
    }

    async fn bypass_all(
        &self,
        token: &str,
        locations: &[SensorLocation],
        code: Option<&str>,
    ) -> Result<()> {
        let mut params = serde_json::Map::new();
        params.insert("locations".to_string(), serde_json::to_value(locations)?);
        if let Some(code) = code {
            params.insert("code".to_string(), json!(code));
        }
        self.bool_command("bypassall", token, params).await
    }

    async fn clear_bypass(&self, token: &str, code: &str) -> Result<()> {
        let mut params = serde_json::Map::new();
        params.insert("code".to_string(), json!(code));
        self.bool_command("clearbypass", token, params).await
    }

    async fn clear_bypass_one(
        &self,
        token: &str,
        location: &SensorLocation,
        code: Option<&str>,
    ) -> Result<()> {
        let mut params = serde_json::Map::new();
        params.insert("location".to_string(), serde_json::to_value(location)?);
        if let Some(code) = code {
            params.insert("code".to_string(), json!(code));
        }
        self.bool_command("clearbypassone", token, params).await
    }

    async fn program(&self, token: &str, code: &str) -> Result<()> {
        let mut params = serde_json::Map::new();
        params.insert("code".to_string(), json!(code));
        self.bool_command("program", token, params).await
    }
}

impl std::fmt::Debug for BrokerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerChannel")
            .field("prefix", &self.inner.prefix)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Drives the MQTT event loop until the channel is dropped.
///
/// rumqttc reconnects by itself on the next poll after an error; this loop
/// only paces those attempts and keeps the connection flag and subscriptions
/// in step.
async fn run_event_loop(channel: BrokerChannel, mut event_loop: EventLoop) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                tracing::info!(?ack, "Broker session established");
                if let Err(e) = channel.subscribe_all().await {
                    tracing::error!(error = %e, "Broadcast topic subscription failed");
                }
                channel.inner.connected.store(true, Ordering::Release);
                channel.emit(ChannelEvent::Connected);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match String::from_utf8(publish.payload.to_vec()) {
                    Ok(payload) => channel.handle_message(&publish.topic, &payload),
                    Err(_) => {
                        tracing::warn!(topic = %publish.topic, "Non-UTF-8 payload dropped");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Broker event loop error");
                if channel.inner.connected.swap(false, Ordering::AcqRel) {
                    channel.emit(ChannelEvent::Disconnected);
                }
                tokio::time::sleep(RECONNECT_PACING).await;
            }
        }
    }
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AtsEvent;
    use crate::types::AlarmState;

    fn channel() -> BrokerChannel {
        BrokerChannel::new(&BrokerConfig::new("127.0.0.1"), "test-client")
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let broker = channel();
        assert!(!broker.is_connected());
        assert_eq!(broker.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn commands_fail_fast_when_disconnected() {
        let broker = channel();
        let result = broker.query_state("123456").await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn time_broadcast_is_demultiplexed() {
        let broker = channel();
        let mut events = broker.events();
        broker.handle_message("ats/TIME", "1700000000");
        match events.recv().await.unwrap() {
            ChannelEvent::Time(t) => assert_eq!(t, 1_700_000_000),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn lwt_payload_maps_to_presence() {
        let broker = channel();
        let mut events = broker.events();
        broker.handle_message("ats/LWT", "Online");
        broker.handle_message("ats/LWT", "offline");
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::PeerPresence(true)
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::PeerPresence(false)
        ));
    }

    #[tokio::test]
    async fn state_topic_uses_announced_wire_names() {
        let broker = channel();
        let mut events = broker.events();
        broker.handle_message("ats/EVENTS", r#"{"SYSTEM_ARMED": "armed"}"#);
        // Topic map announcement itself is observable.
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::EventTopics(_)
        ));
        broker.handle_message("ats/STATE/armed", "310C020509");
        match events.recv().await.unwrap() {
            ChannelEvent::Event(AtsEvent::SystemArmed(payload)) => {
                assert_eq!(payload.system.state, AlarmState::Armed);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn state_topic_falls_back_to_logical_names() {
        let broker = channel();
        let mut events = broker.events();
        broker.handle_message("ats/STATE/SIREN_SILENCED", "");
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::Event(AtsEvent::SirenSilenced)
        ));
    }

    #[tokio::test]
    async fn reply_topic_resolves_correlation() {
        let broker = channel();
        let rx = broker.inner.replies.register("abc1234");
        broker.handle_message("ats/RESULT/abc1234", "TRUE");
        let reply = broker
            .inner
            .replies
            .wait_registered("abc1234", rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, "TRUE");
    }

    #[tokio::test]
    async fn messages_outside_prefix_are_ignored() {
        let broker = channel();
        let mut events = broker.events();
        broker.handle_message("other/TIME", "1700000000");
        assert!(events.try_recv().is_err());
    }
}
