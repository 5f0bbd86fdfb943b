// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Orchestration over the two transport channels.
//!
//! [`AtsService`] owns a socket channel and a broker channel, keeps the
//! client clock aligned with the controller, mints a fresh TOTP token per
//! command and dispatches each command over the preferred connected
//! channel. Inbound channel events are republished on a callback
//! [`EventBus`] for the embedding application.
//!
//! # Examples
//!
//! ```no_run
//! use atslink::config::{AtsConfig, BrokerConfig};
//! use atslink::event::EventKind;
//! use atslink::service::{AtsService, NetworkKind};
//!
//! # async fn example() -> atslink::Result<()> {
//! let config = AtsConfig::new(
//!     "http://192.168.1.20:3000",
//!     "phone-1",
//!     "64P36D1L6ORJGE9G",
//!     BrokerConfig::new("broker.example"),
//! );
//! let service = AtsService::start(&config)?;
//! service.subscribe(EventKind::SystemAlarmed, |event| {
//!     println!("alarm: {event:?}");
//! });
//! service.network_changed(NetworkKind::Local).await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::channel::{BrokerChannel, Channel, ChannelEvent, SocketChannel};
use crate::config::AtsConfig;
use crate::error::{Error, Result};
use crate::event::{AtsEvent, EventBus, EventKind, SubscriptionId};
use crate::totp::{TotpOptions, generate_code};
use crate::types::{AlarmMode, Sensor, SensorLocation, SystemState};

/// How often the clock is realigned with the controller.
const SYNC_INTERVAL: Duration = Duration::from_secs(600);

/// Delay before the fallback channel is brought up after a network change.
const FALLBACK_DELAY: Duration = Duration::from_secs(5);

/// Reachability of the alarm controller as seen by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    /// No connectivity; channels keep retrying on their own.
    None,
    /// Same network as the controller, the socket channel is preferred.
    Local,
    /// Internet-only reachability, the broker channel is preferred.
    Mobile,
}

/// Last known difference between the local clock and the controller's.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockOffset {
    /// `local now - server now`, in milliseconds.
    pub offset_millis: i64,
    /// When the offset was last measured.
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Client-side control service for the alarm system.
///
/// Cheaply cloneable (via `Arc`). Generic over its channels so tests can
/// substitute fakes; production code uses the defaults.
pub struct AtsService<L = SocketChannel, R = BrokerChannel> {
    inner: Arc<ServiceInner<L, R>>,
}

impl<L, R> Clone for AtsService<L, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ServiceInner<L, R> {
    local: L,
    remote: R,
    secret: String,
    totp: TotpOptions,
    bus: EventBus,
    sensors: RwLock<Vec<Sensor>>,
    clock: Mutex<ClockOffset>,
    sync_running: AtomicBool,
    fallback: Mutex<Option<JoinHandle<()>>>,
}

impl AtsService {
    /// Builds the service with its production channels. Neither channel
    /// touches the network until [`network_changed`](Self::network_changed)
    /// is called.
    ///
    /// # Errors
    ///
    /// Returns an error when the server URL cannot be turned into a push
    /// stream address or the HTTP client cannot be constructed.
    pub fn start(config: &AtsConfig) -> Result<Self> {
        let local = SocketChannel::new(config.server_url(), config.client_id())?;
        let remote = BrokerChannel::new(config.broker(), config.client_id());
        Ok(Self::with_channels(config.secret(), local, remote))
    }
}

impl<L: Channel, R: Channel> AtsService<L, R> {
    /// Builds the service over caller-supplied channels and starts the
    /// event pumps.
    pub fn with_channels(secret: impl Into<String>, local: L, remote: R) -> Self {
        let inner = Arc::new(ServiceInner {
            local: local.clone(),
            remote: remote.clone(),
            secret: secret.into(),
            totp: TotpOptions::default(),
            bus: EventBus::new(),
            sensors: RwLock::new(Vec::new()),
            clock: Mutex::new(ClockOffset::default()),
            sync_running: AtomicBool::new(false),
            fallback: Mutex::new(None),
        });

        spawn_pump(Arc::downgrade(&inner), local, true);
        spawn_pump(Arc::downgrade(&inner), remote, false);

        Self { inner }
    }

    /// Registers a handler for one event kind.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&AtsEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(kind, handler)
    }

    /// Removes a previously registered handler.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(id)
    }

    /// Whether any channel currently has a transport session.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.local.is_connected() || self.inner.remote.is_connected()
    }

    /// Snapshot of the cached sensor roster.
    #[must_use]
    pub fn sensors(&self) -> Vec<Sensor> {
        self.inner.sensors.read().clone()
    }

    /// One sensor from the cached roster, by roster index.
    #[must_use]
    pub fn sensor(&self, index: usize) -> Option<Sensor> {
        self.inner.sensors.read().get(index).cloned()
    }

    /// Last measured clock offset against the controller.
    #[must_use]
    pub fn clock_offset(&self) -> ClockOffset {
        *self.inner.clock.lock()
    }

    /// Reacts to a change of the host platform's network reachability.
    ///
    /// The preferred channel for the new network connects immediately; the
    /// other follows after a short delay so the preferred one wins the
    /// race. A later call cancels a still-pending fallback.
    pub async fn network_changed(&self, kind: NetworkKind) {
        tracing::info!(?kind, "Network reachability changed");
        match kind {
            NetworkKind::None => {}
            NetworkKind::Local => {
                self.inner.local.connect().await;
                self.spawn_fallback(FallbackTarget::Remote);
            }
            NetworkKind::Mobile => {
                self.inner.remote.connect().await;
                self.spawn_fallback(FallbackTarget::Local);
            }
        }
    }

    fn spawn_fallback(&self, target: FallbackTarget) {
        let mut slot = self.inner.fallback.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(FALLBACK_DELAY).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match target {
                FallbackTarget::Local => inner.local.connect().await,
                FallbackTarget::Remote => inner.remote.connect().await,
            }
        }));
    }

    /// Queries the current system state over the preferred channel.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] when no channel has a session; otherwise the
    /// channel's command error.
    pub async fn get_state(&self) -> Result<SystemState> {
        let token = self.inner.token()?;
        if self.inner.local.is_connected() {
            self.inner.local.query_state(&token).await
        } else if self.inner.remote.is_connected() {
            self.inner.remote.query_state(&token).await
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Arms the system in the given mode.
    pub async fn arm(&self, mode: AlarmMode, code: Option<&str>) -> Result<()> {
        let token = self.inner.token()?;
        if self.inner.local.is_connected() {
            self.inner.local.arm(&token, mode, code).await
        } else if self.inner.remote.is_connected() {
            self.inner.remote.arm(&token, mode, code).await
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Disarms the system.
    pub async fn disarm(&self, code: &str) -> Result<()> {
        let token = self.inner.token()?;
        if self.inner.local.is_connected() {
            self.inner.local.disarm(&token, code).await
        } else if self.inner.remote.is_connected() {
            self.inner.remote.disarm(&token, code).await
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Bypasses one sensor.
    pub async fn bypass(&self, location: &SensorLocation, code: Option<&str>) -> Result<()> {
        let token = self.inner.token()?;
        if self.inner.local.is_connected() {
            self.inner.local.bypass_one(&token, location, code).await
        } else if self.inner.remote.is_connected() {
            self.inner.remote.bypass_one(&token, location, code).await
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Bypasses a set of sensors.
    pub async fn bypass_all(
        &self,
        locations: &[SensorLocation],
        code: Option<&str>,
    ) -> Result<()> {
        let token = self.inner.token()?;
        if self.inner.local.is_connected() {
            self.inner.local.bypass_all(&token, locations, code).await
        } else if self.inner.remote.is_connected() {
            self.inner.remote.bypass_all(&token, locations, code).await
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Clears every bypass.
    pub async fn clear_bypass(&self, code: &str) -> Result<()> {
        let token = self.inner.token()?;
        if self.inner.local.is_connected() {
            self.inner.local.clear_bypass(&token, code).await
        } else if self.inner.remote.is_connected() {
            self.inner.remote.clear_bypass(&token, code).await
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Clears the bypass of one sensor.
    pub async fn clear_bypass_one(
        &self,
        location: &SensorLocation,
        code: Option<&str>,
    ) -> Result<()> {
        let token = self.inner.token()?;
        if self.inner.local.is_connected() {
            self.inner.local.clear_bypass_one(&token, location, code).await
        } else if self.inner.remote.is_connected() {
            self.inner.remote.clear_bypass_one(&token, location, code).await
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Puts the controller into programming mode.
    pub async fn program(&self, code: &str) -> Result<()> {
        let token = self.inner.token()?;
        if self.inner.local.is_connected() {
            self.inner.local.program(&token, code).await
        } else if self.inner.remote.is_connected() {
            self.inner.remote.program(&token, code).await
        } else {
            Err(Error::NotConnected)
        }
    }
}

enum FallbackTarget {
    Local,
    Remote,
}

impl<L, R> ServiceInner<L, R> {
    /// Mints a token against the server-aligned clock.
    fn token(&self) -> Result<String> {
        let offset = self.clock.lock().offset_millis;
        let now = Utc::now().timestamp_millis();
        let epoch = u64::try_from((now - offset) / 1000).unwrap_or(0);
        Ok(generate_code(&self.secret, epoch, &self.totp)?)
    }

    fn update_clock(&self, server_seconds: i64) {
        let now = Utc::now();
        let mut clock = self.clock.lock();
        clock.offset_millis = now.timestamp_millis() - server_seconds * 1000;
        clock.last_synced_at = Some(now);
        tracing::debug!(offset_millis = clock.offset_millis, "Clock realigned");
    }

    fn sync_is_stale(&self) -> bool {
        let clock = self.clock.lock();
        match clock.last_synced_at {
            Some(at) => {
                let age = Utc::now().signed_duration_since(at);
                age.num_seconds() >= i64::try_from(SYNC_INTERVAL.as_secs()).unwrap_or(i64::MAX)
            }
            None => true,
        }
    }
}

impl<L: Channel, R: Channel> ServiceInner<L, R> {
    /// Periodic clock realignment while any channel is connected.
    fn ensure_sync_task(self: &Arc<Self>) {
        if self.sync_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SYNC_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.local.is_connected() && !inner.remote.is_connected() {
                    inner.sync_running.store(false, Ordering::Release);
                    break;
                }
                inner.sync_clock().await;
            }
        });
    }

    async fn sync_clock(&self) {
        let result = if self.local.is_connected() {
            self.local.server_time().await
        } else {
            self.remote.server_time().await
        };
        match result {
            Ok(seconds) => self.update_clock(seconds),
            Err(e) => tracing::warn!(error = %e, "Clock sync failed"),
        }
    }
}

/// Forwards one channel's event stream into the service.
fn spawn_pump<L, R, C>(weak: std::sync::Weak<ServiceInner<L, R>>, channel: C, local: bool)
where
    L: Channel,
    R: Channel,
    C: Channel,
{
    tokio::spawn(async move {
        let mut events = channel.events();
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    handle_channel_event(&inner, &channel, local, event).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, local, "Channel event pump lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn handle_channel_event<L, R, C>(
    inner: &Arc<ServiceInner<L, R>>,
    channel: &C,
    local: bool,
    event: ChannelEvent,
) where
    L: Channel,
    R: Channel,
    C: Channel,
{
    match event {
        ChannelEvent::Connected => {
            inner.ensure_sync_task();
            inner.bus.publish(&if local {
                AtsEvent::LocalConnectionChanged(true)
            } else {
                AtsEvent::RemoteConnectionChanged(true)
            });
        }
        ChannelEvent::Disconnected => {
            inner.bus.publish(&if local {
                AtsEvent::LocalConnectionChanged(false)
            } else {
                AtsEvent::RemoteConnectionChanged(false)
            });
        }
        ChannelEvent::Time(seconds) => inner.update_clock(seconds),
        ChannelEvent::WhoAmI => {
            if inner.sync_is_stale() {
                match channel.server_time().await {
                    Ok(seconds) => inner.update_clock(seconds),
                    Err(e) => tracing::warn!(error = %e, "Resync before handshake failed"),
                }
            }
            match inner.token() {
                Ok(token) => {
                    if let Err(e) = channel.send_handshake(&token).await {
                        tracing::warn!(error = %e, "Handshake failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Cannot mint handshake token"),
            }
        }
        ChannelEvent::EventTopics(map) => {
            tracing::debug!(topics = map.len(), "Event topic map announced");
        }
        ChannelEvent::Sensors(roster) => {
            *inner.sensors.write() = roster.clone();
            inner.bus.publish(&AtsEvent::SensorsUpdated(roster));
        }
        ChannelEvent::Event(event) => inner.bus.publish(&event),
        ChannelEvent::PeerPresence(online) => {
            inner.bus.publish(&if online {
                AtsEvent::ServerOnline
            } else {
                AtsEvent::ServerOffline
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Shared TOTP test secret (RFC 6238 SHA-1 key in the wire alphabet).
    const SECRET: &str = "64P36D1L6ORJGE9G64P36D1L6ORJGE9G";

    #[derive(Clone)]
    struct FakeChannel {
        connected: Arc<AtomicBool>,
        calls: Arc<Mutex<Vec<String>>>,
        events: broadcast::Sender<ChannelEvent>,
    }

    impl FakeChannel {
        fn new(connected: bool) -> Self {
            let (events, _) = broadcast::channel(16);
            Self {
                connected: Arc::new(AtomicBool::new(connected)),
                calls: Arc::new(Mutex::new(Vec::new())),
                events,
            }
        }

        fn push(&self, event: ChannelEvent) {
            let _ = self.events.send(event);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }
    }

    impl Channel for FakeChannel {
        async fn connect(&self) {
            self.record("connect");
            self.connected.store(true, Ordering::Release);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Acquire)
        }

        fn state(&self) -> crate::channel::ConnectionState {
            if self.is_connected() {
                crate::channel::ConnectionState::Connected
            } else {
                crate::channel::ConnectionState::Disconnected
            }
        }

        fn events(&self) -> broadcast::Receiver<ChannelEvent> {
            self.events.subscribe()
        }

        async fn server_time(&self) -> Result<i64> {
            self.record("time");
            Ok(Utc::now().timestamp())
        }

        async fn send_handshake(&self, token: &str) -> Result<()> {
            self.record(format!("is {token}"));
            Ok(())
        }

        async fn query_state(&self, _token: &str) -> Result<SystemState> {
            self.record("state");
            Ok(SystemState {
                state: crate::types::AlarmState::Ready,
                mode: AlarmMode::Away,
                active_sensors: Vec::new(),
                left_time_millis: 0,
                uptime_millis: 0,
            })
        }

        async fn arm(&self, _token: &str, _mode: AlarmMode, _code: Option<&str>) -> Result<()> {
            self.record("arm");
            Ok(())
        }

        async fn disarm(&self, _token: &str, _code: &str) -> Result<()> {
            self.record("disarm");
            Ok(())
        }

        async fn bypass_one(
            &self,
            _token: &str,
            _location: &SensorLocation,
            _code: Option<&str>,
        ) -> Result<()> {
            self.record("bypass_one");
            Ok(())
        }

        async fn bypass_all(
            &self,
            _token: &str,
            _locations: &[SensorLocation],
            _code: Option<&str>,
        ) -> Result<()> {
            self.record("bypass_all");
            Ok(())
        }

        async fn clear_bypass(&self, _token: &str, _code: &str) -> Result<()> {
            self.record("clear_bypass");
            Ok(())
        }

        async fn clear_bypass_one(
            &self,
            _token: &str,
            _location: &SensorLocation,
            _code: Option<&str>,
        ) -> Result<()> {
            self.record("clear_bypass_one");
            Ok(())
        }

        async fn program(&self, _token: &str, _code: &str) -> Result<()> {
            self.record("program");
            Ok(())
        }
    }

    fn service(
        local_connected: bool,
        remote_connected: bool,
    ) -> (AtsService<FakeChannel, FakeChannel>, FakeChannel, FakeChannel) {
        let local = FakeChannel::new(local_connected);
        let remote = FakeChannel::new(remote_connected);
        let service = AtsService::with_channels(SECRET, local.clone(), remote.clone());
        (service, local, remote)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn prefers_the_socket_channel() {
        let (service, local, remote) = service(true, true);
        service.get_state().await.unwrap();
        assert_eq!(local.calls(), vec!["state"]);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_the_broker_channel() {
        let (service, local, remote) = service(false, true);
        service.arm(AlarmMode::Stay, Some("1234")).await.unwrap();
        assert!(local.calls().is_empty());
        assert_eq!(remote.calls(), vec!["arm"]);
    }

    #[tokio::test]
    async fn fails_fast_when_nothing_is_connected() {
        let (service, local, remote) = service(false, false);
        let result = service.disarm("1234").await;
        assert!(matches!(result, Err(Error::NotConnected)));
        assert!(local.calls().is_empty());
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn sensors_roster_is_cached_and_republished() {
        let (service, local, _remote) = service(true, false);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = Arc::clone(&seen);
        service.subscribe(EventKind::SensorsUpdated, move |_| {
            seen_in_handler.fetch_add(1, Ordering::SeqCst);
        });

        local.push(ChannelEvent::Sensors(vec![Sensor {
            location: SensorLocation::new("AA:BB:CC:DD:EE:FF", 4),
            sensor_type: crate::types::SensorType::PirMotion,
            name: "Hall".to_string(),
            group: crate::types::SensorGroup::Interior,
            bypassed: false,
            online: true,
        }]));
        settle().await;

        assert_eq!(service.sensors().len(), 1);
        assert_eq!(service.sensor(0).unwrap().name, "Hall");
        assert!(service.sensor(1).is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn who_triggers_resync_and_handshake() {
        let (_service, local, _remote) = service(true, false);
        local.push(ChannelEvent::WhoAmI);
        settle().await;

        let calls = local.calls();
        // Never synced before, so the identity request forces a resync.
        assert_eq!(calls[0], "time");
        assert!(calls[1].starts_with("is "));
        let token = calls[1].trim_start_matches("is ");
        assert_eq!(token.len(), 6);
        assert!(token.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn channel_events_reach_the_bus() {
        let (service, local, remote) = service(true, true);
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        for kind in [
            EventKind::LocalConnectionChanged,
            EventKind::RemoteConnectionChanged,
            EventKind::ServerOnline,
            EventKind::SirenActived,
        ] {
            let log = Arc::clone(&log);
            service.subscribe(kind, move |event| {
                log.lock().push(format!("{event:?}"));
            });
        }

        local.push(ChannelEvent::Disconnected);
        remote.push(ChannelEvent::PeerPresence(true));
        remote.push(ChannelEvent::Event(AtsEvent::SirenActived));
        settle().await;

        let log = log.lock().clone();
        assert!(log.contains(&"LocalConnectionChanged(false)".to_string()));
        assert!(log.contains(&"ServerOnline".to_string()));
        assert!(log.contains(&"SirenActived".to_string()));
    }

    #[tokio::test]
    async fn time_broadcast_updates_the_clock() {
        let (service, local, _remote) = service(true, false);
        let past = Utc::now().timestamp() - 3600;
        local.push(ChannelEvent::Time(past));
        settle().await;

        let clock = service.clock_offset();
        assert!(clock.last_synced_at.is_some());
        // Server clock is an hour behind, so the offset is about +1h.
        assert!((clock.offset_millis - 3_600_000).abs() < 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn network_change_staggers_the_fallback_channel() {
        let (service, local, remote) = service(false, false);
        service.network_changed(NetworkKind::Local).await;
        assert_eq!(local.calls(), vec!["connect"]);
        assert!(remote.calls().is_empty());

        tokio::time::sleep(FALLBACK_DELAY + Duration::from_millis(100)).await;
        assert_eq!(remote.calls(), vec!["connect"]);
    }

    #[tokio::test]
    async fn network_none_connects_nothing() {
        let (service, local, remote) = service(false, false);
        service.network_changed(NetworkKind::None).await;
        assert!(local.calls().is_empty());
        assert!(remote.calls().is_empty());
    }
}
