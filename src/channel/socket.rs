// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Direct socket transport to the alarm controller.
//!
//! Used when the controller is reachable on the local network. Commands go
//! out as authenticated HTTP requests; a long-lived WebSocket carries the
//! push stream of JSON envelopes `{"event": <name>, "data": <payload>}`
//! covering server time, identity requests, the event topic map, the sensor
//! roster and the dynamically announced event topics.
//!
//! # Examples
//!
//! ```no_run
//! use atslink::channel::{Channel, SocketChannel};
//!
//! # async fn example() -> atslink::Result<()> {
//! let socket = SocketChannel::new("http://192.168.1.20:3000", "phone-1")?;
//! socket.connect().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use reqwest::{Method, StatusCode, header};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::channel::{Channel, ChannelEvent, ConnectionState, decode_wire_event};
use crate::error::{CommandError, Error, ParseError, ProtocolError, Result};
use crate::event::EventKind;
use crate::types::{AlarmMode, Sensor, SensorLocation, SystemState};

/// Fast retry interval while the connection is freshly lost.
const RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Slow retry interval after the fast attempts are exhausted.
const SLOW_RETRY_INTERVAL: Duration = Duration::from_secs(300);

/// Fast attempts before falling back to the slow interval.
const MAX_FAST_ATTEMPTS: u32 = 5;

/// Timeout for individual HTTP commands.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the channel event broadcast.
const EVENT_CAPACITY: usize = 64;

/// Push envelope framing on the WebSocket.
#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Socket transport to the alarm controller.
///
/// Cheaply cloneable (via `Arc`); all clones share one push session.
#[derive(Clone)]
pub struct SocketChannel {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    /// Base URL for HTTP commands, without a trailing slash.
    server_url: String,
    /// Derived WebSocket URL for the push stream.
    ws_url: String,
    client_id: String,
    http: reqwest::Client,
    connected: AtomicBool,
    events: broadcast::Sender<ChannelEvent>,
    /// Outbound side of the live WebSocket, present only while connected.
    writer: Mutex<Option<mpsc::Sender<Message>>>,
    /// Wire topic name to event kind, announced in the `Events` envelope.
    wire_topics: RwLock<HashMap<String, EventKind>>,
    session: Mutex<Option<JoinHandle<()>>>,
}

impl SocketChannel {
    /// Creates the channel without touching the network. Call
    /// [`connect`](Channel::connect) to start the push session; HTTP
    /// commands are stateless and work regardless.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidAddress`] when the server URL is not
    /// `http://` or `https://`.
    pub fn new(server_url: impl Into<String>, client_id: impl Into<String>) -> Result<Self> {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        let ws_url = websocket_url(&server_url)?;
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(ProtocolError::Http)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(SocketInner {
                server_url,
                ws_url,
                client_id: client_id.into(),
                http,
                connected: AtomicBool::new(false),
                events,
                writer: Mutex::new(None),
                wire_topics: RwLock::new(HashMap::new()),
                session: Mutex::new(None),
            }),
        })
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Reads and demultiplexes one push session until it ends.
    async fn drive_stream(&self, stream: WebSocketStream<MaybeTlsStream<TcpStream>>) {
        let (mut sink, mut reader) = stream.split();
        let (tx, mut rx) = mpsc::channel::<Message>(16);
        *self.inner.writer.lock() = Some(tx);

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        while let Some(message) = reader.next().await {
            match message {
                Ok(Message::Text(text)) => self.handle_envelope(&text),
                Ok(Message::Close(_)) => {
                    tracing::info!("Push stream closed by the controller");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Push stream read error");
                    break;
                }
            }
        }

        *self.inner.writer.lock() = None;
        writer.abort();
    }

    fn handle_envelope(&self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed push envelope");
                return;
            }
        };

        match envelope.event.as_str() {
            "Time" => match envelope.data.as_i64() {
                Some(seconds) => self.emit(ChannelEvent::Time(seconds)),
                None => tracing::warn!(data = %envelope.data, "Unparseable time envelope"),
            },
            "Who" => self.emit(ChannelEvent::WhoAmI),
            "Events" => {
                match serde_json::from_value::<HashMap<String, String>>(envelope.data) {
                    Ok(map) => {
                        let mut wire_topics = self.inner.wire_topics.write();
                        wire_topics.clear();
                        for (logical, wire) in &map {
                            match EventKind::from_wire_name(logical) {
                                Some(kind) => {
                                    wire_topics.insert(wire.clone(), kind);
                                }
                                None => {
                                    tracing::debug!(
                                        name = %logical,
                                        "Unknown event name announced"
                                    );
                                }
                            }
                        }
                        drop(wire_topics);
                        self.emit(ChannelEvent::EventTopics(map));
                    }
                    Err(e) => tracing::warn!(error = %e, "Unparseable event topic map"),
                }
            }
            "Sensors" => match serde_json::from_value::<Vec<Sensor>>(envelope.data) {
                Ok(sensors) => self.emit(ChannelEvent::Sensors(sensors)),
                Err(e) => tracing::warn!(error = %e, "Unparseable sensor roster"),
            },
            wire => self.handle_wire_event(wire, &envelope.data),
        }
    }

    fn handle_wire_event(&self, wire: &str, data: &serde_json::Value) {
        let kind = self
            .inner
            .wire_topics
            .read()
            .get(wire)
            .copied()
            .or_else(|| EventKind::from_wire_name(wire));
        let Some(kind) = kind else {
            tracing::debug!(event = %wire, "Envelope for unannounced event");
            return;
        };
        let payload = match data {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
        match decode_wire_event(kind, &payload) {
            Ok(event) => self.emit(ChannelEvent::Event(event)),
            Err(e) => tracing::warn!(event = %wire, error = %e, "Undecodable event payload"),
        }
    }

    /// Sends an authenticated HTTP command and applies the controller's
    /// status conventions.
    async fn request(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<String>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{path}", self.inner.server_url);
        let mut request = self.inner.http.request(method, &url);
        if let Some(token) = token {
            request = request.header(
                header::AUTHORIZATION,
                format!("{} {token}", self.inner.client_id),
            );
        }
        if let Some(body) = body {
            request = request
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(body);
        }

        let response = request.send().await.map_err(ProtocolError::Http)?;
        check_status(response.status())?;
        Ok(response)
    }

    /// Command whose success carries no body.
    async fn put_command(&self, path: &str, token: &str, body: String) -> Result<()> {
        self.request(Method::PUT, path, Some(token), Some(body))
            .await?;
        Ok(())
    }
}

impl Channel for SocketChannel {
    async fn connect(&self) {
        let mut session = self.inner.session.lock();
        if let Some(handle) = session.as_ref()
            && !handle.is_finished()
        {
            tracing::debug!("Push session already running");
            return;
        }
        let channel = self.clone();
        *session = Some(tokio::spawn(async move {
            run_session(channel).await;
        }));
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else if self
            .inner
            .session
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    async fn server_time(&self) -> Result<i64> {
        let response = self.request(Method::GET, "/uptime", None, None).await?;
        let text = response.text().await.map_err(ProtocolError::Http)?;
        text.trim().parse::<i64>().map_err(|_| {
            Error::Parse(ParseError::InvalidValue {
                field: "uptime".to_string(),
                message: format!("not an epoch second count: {text}"),
            })
        })
    }

    async fn send_handshake(&self, token: &str) -> Result<()> {
        let code: i64 = token.parse().map_err(|_| {
            Error::Parse(ParseError::InvalidValue {
                field: "token".to_string(),
                message: "token is not numeric".to_string(),
            })
        })?;
        let envelope = json!({
            "event": "is",
            "data": { "code": code, "clientId": self.inner.client_id },
        });

        let writer = self.inner.writer.lock().clone();
        let Some(writer) = writer else {
            return Err(Error::NotConnected);
        };
        writer
            .send(Message::Text(envelope.to_string()))
            .await
            .map_err(|_| {
                Error::Protocol(ProtocolError::ChannelClosed(
                    "push stream writer dropped".to_string(),
                ))
            })
    }

    async fn query_state(&self, token: &str) -> Result<SystemState> {
        let response = self.request(Method::GET, "/state", Some(token), None).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Err(Error::Command(CommandError::EmptyResponse));
        }
        let text = response.text().await.map_err(ProtocolError::Http)?;
        if text.trim().is_empty() {
            return Err(Error::Command(CommandError::EmptyResponse));
        }
        let state: SystemState = serde_json::from_str(&text)?;
        Ok(state)
    }

    async fn arm(&self, token: &str, mode: AlarmMode, code: Option<&str>) -> Result<()> {
        let mut pairs = vec![("mode".to_string(), u8::from(mode).to_string())];
        if let Some(code) = code {
            pairs.push(("code".to_string(), code.to_string()));
        }
        self.put_command("/arm", token, form_body(&pairs)).await
    }

    async fn disarm(&self, token: &str, code: &str) -> Result<()> {
        let pairs = vec![("code".to_string(), code.to_string())];
        self.put_command("/disarm", token, form_body(&pairs)).await
    }

    async fn bypass_one(
        &self,
        token: &str,
        location: &SensorLocation,
        code: Option<&str>,
    ) -> Result<()> {
        let mut pairs = vec![("location".to_string(), serde_json::to_string(location)?)];
        if let Some(code) = code {
            pairs.push(("code".to_string(), code.to_string()));
        }
        self.put_command("/bypass/one", token, form_body(&pairs)).await
    }

    async fn bypass_all(
        &self,
        token: &str,
        locations: &[SensorLocation],
        code: Option<&str>,
    ) -> Result<()> {
        let mut pairs = vec![("locations".to_string(), serde_json::to_string(locations)?)];
        if let Some(code) = code {
            pairs.push(("code".to_string(), code.to_string()));
        }
        self.put_command("/bypass/all", token, form_body(&pairs)).await
    }

    async fn clear_bypass(&self, token: &str, code: &str) -> Result<()> {
        let pairs = vec![("code".to_string(), code.to_string())];
        self.put_command("/unbypass/all", token, form_body(&pairs))
            .await
    }

    async fn clear_bypass_one(
        &self,
        token: &str,
        location: &SensorLocation,
        code: Option<&str>,
    ) -> Result<()> {
        let mut pairs = vec![("location".to_string(), serde_json::to_string(location)?)];
        if let Some(code) = code {
            pairs.push(("code".to_string(), code.to_string()));
        }
        self.put_command("/unbypass/one", token, form_body(&pairs))
            .await
    }

    async fn program(&self, token: &str, code: &str) -> Result<()> {
        let pairs = vec![("code".to_string(), code.to_string())];
        self.put_command("/config/programm", token, form_body(&pairs))
            .await
    }
}

impl std::fmt::Debug for SocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketChannel")
            .field("server_url", &self.inner.server_url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Runs the push session with its reconnect ladder.
///
/// On loss the session retries every 3 s; after 5 consecutive failures it
/// announces the disconnection once and falls back to a 5-minute interval
/// until a connect succeeds, which resets the ladder.
async fn run_session(channel: SocketChannel) {
    let mut attempts: u32 = 0;
    let mut slow = false;

    loop {
        match connect_async(channel.inner.ws_url.as_str()).await {
            Ok((stream, _)) => {
                tracing::info!(url = %channel.inner.ws_url, "Push stream connected");
                attempts = 0;
                slow = false;
                channel.inner.connected.store(true, Ordering::Release);
                channel.emit(ChannelEvent::Connected);

                channel.drive_stream(stream).await;

                channel.inner.connected.store(false, Ordering::Release);
                channel.emit(ChannelEvent::Disconnected);
            }
            Err(e) => {
                tracing::warn!(error = %e, attempts, "Push stream connect failed");
                if !slow {
                    attempts += 1;
                    if attempts >= MAX_FAST_ATTEMPTS {
                        slow = true;
                        channel.emit(ChannelEvent::Disconnected);
                    }
                }
            }
        }

        let delay = if slow { SLOW_RETRY_INTERVAL } else { RETRY_INTERVAL };
        tokio::time::sleep(delay).await;
    }
}

/// Maps the controller's HTTP status conventions onto command errors.
fn check_status(status: StatusCode) -> Result<()> {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(Error::Command(CommandError::NotAuthorized))
        }
        StatusCode::CONFLICT => Err(Error::Command(CommandError::InvalidSystemState)),
        s if s.is_success() => Ok(()),
        _ => Err(Error::Command(CommandError::BadRequest)),
    }
}

/// Percent-encodes key/value pairs into a form body.
fn form_body(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Derives the push stream URL from the HTTP base URL.
fn websocket_url(server_url: &str) -> Result<String> {
    if let Some(rest) = server_url.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else if let Some(rest) = server_url.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else {
        Err(Error::Protocol(ProtocolError::InvalidAddress(format!(
            "expected an http(s) URL, got {server_url}"
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AtsEvent;
    use crate::types::AlarmState;

    fn channel() -> SocketChannel {
        SocketChannel::new("http://127.0.0.1:9", "test-client").unwrap()
    }

    #[test]
    fn websocket_url_swaps_scheme() {
        assert_eq!(
            websocket_url("http://192.168.1.20:3000").unwrap(),
            "ws://192.168.1.20:3000"
        );
        assert_eq!(
            websocket_url("https://ats.example").unwrap(),
            "wss://ats.example"
        );
    }

    #[test]
    fn websocket_url_rejects_other_schemes() {
        assert!(websocket_url("ftp://192.168.1.20").is_err());
        assert!(websocket_url("192.168.1.20").is_err());
    }

    #[test]
    fn form_body_percent_encodes_values() {
        let body = form_body(&[
            ("mode".to_string(), "1".to_string()),
            ("location".to_string(), r#"{"mac":"AA:BB","pin":2}"#.to_string()),
        ]);
        assert_eq!(
            body,
            "mode=1&location=%7B%22mac%22%3A%22AA%3ABB%22%2C%22pin%22%3A2%7D"
        );
    }

    #[test]
    fn status_conventions() {
        assert!(check_status(StatusCode::NO_CONTENT).is_ok());
        assert!(check_status(StatusCode::OK).is_ok());
        assert!(matches!(
            check_status(StatusCode::UNAUTHORIZED),
            Err(Error::Command(CommandError::NotAuthorized))
        ));
        assert!(matches!(
            check_status(StatusCode::FORBIDDEN),
            Err(Error::Command(CommandError::NotAuthorized))
        ));
        assert!(matches!(
            check_status(StatusCode::CONFLICT),
            Err(Error::Command(CommandError::InvalidSystemState))
        ));
        assert!(matches!(
            check_status(StatusCode::INTERNAL_SERVER_ERROR),
            Err(Error::Command(CommandError::BadRequest))
        ));
    }

    #[tokio::test]
    async fn envelope_time_is_demultiplexed() {
        let socket = channel();
        let mut events = socket.events();
        socket.handle_envelope(r#"{"event":"Time","data":1700000000}"#);
        match events.recv().await.unwrap() {
            ChannelEvent::Time(t) => assert_eq!(t, 1_700_000_000),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn envelope_who_requests_identity() {
        let socket = channel();
        let mut events = socket.events();
        socket.handle_envelope(r#"{"event":"Who"}"#);
        assert!(matches!(events.recv().await.unwrap(), ChannelEvent::WhoAmI));
    }

    #[tokio::test]
    async fn envelope_events_announces_wire_topics() {
        let socket = channel();
        let mut events = socket.events();
        socket.handle_envelope(r#"{"event":"Events","data":{"SYSTEM_ALARMED":"alarm"}}"#);
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::EventTopics(_)
        ));
        socket.handle_envelope(r#"{"event":"alarm","data":"510C020509"}"#);
        match events.recv().await.unwrap() {
            ChannelEvent::Event(AtsEvent::SystemAlarmed(payload)) => {
                assert_eq!(payload.system.state, AlarmState::Alarmed);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn envelope_sensors_carries_roster() {
        let socket = channel();
        let mut events = socket.events();
        socket.handle_envelope(
            r#"{"event":"Sensors","data":[{"location":{"mac":"AA:BB:CC:DD:EE:FF","pin":4},"type":0,"name":"Hall","group":0}]}"#,
        );
        match events.recv().await.unwrap() {
            ChannelEvent::Sensors(sensors) => {
                assert_eq!(sensors.len(), 1);
                assert_eq!(sensors[0].name, "Hall");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_envelope_is_dropped() {
        let socket = channel();
        let mut events = socket.events();
        socket.handle_envelope("not json");
        socket.handle_envelope(r#"{"event":"nobody-knows-this","data":1}"#);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn handshake_without_session_fails() {
        let socket = channel();
        let result = socket.send_handshake("482913").await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn handshake_rejects_non_numeric_token() {
        let socket = channel();
        let result = socket.send_handshake("not-a-token").await;
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    // Real clock: paused time auto-advances past the timeout while the
    // real TCP connect attempts are still pending on the I/O driver.
    #[tokio::test]
    async fn reconnect_ladder_announces_backoff_once() {
        // Port 9 (discard) has no listener; every attempt is refused.
        let socket = channel();
        let mut events = socket.events();
        socket.connect().await;
        // The fast attempts make no announcement; the fallback transition
        // is the first observable event.
        let event = tokio::time::timeout(Duration::from_secs(120), events.recv())
            .await
            .expect("backoff announcement")
            .unwrap();
        assert!(matches!(event, ChannelEvent::Disconnected));
        assert!(!socket.is_connected());
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let socket = channel();
        assert_eq!(socket.state(), ConnectionState::Disconnected);
        socket.connect().await;
        socket.connect().await;
        assert_eq!(socket.state(), ConnectionState::Connecting);
    }
}
