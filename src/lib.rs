// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `ATSLink` - A Rust client library for an anti-theft alarm system.
//!
//! This library provides async APIs to monitor and control an alarm
//! controller over two interchangeable transports: a direct socket channel
//! (WebSocket push stream plus HTTP commands) for the local network, and an
//! MQTT broker channel for everything else. Commands are authenticated with
//! time-based one-time tokens minted from a shared secret against a clock
//! kept in sync with the controller.
//!
//! # Supported Features
//!
//! - **System control**: arm, disarm, sensor bypass, programming mode
//! - **State queries**: live system state and the full sensor roster
//! - **Event stream**: armed/disarmed/alarmed transitions, sensor activity,
//!   siren and presence events, delivered through a callback event bus
//! - **Resilience**: automatic reconnect per channel and transparent
//!   failover between the two transports
//!
//! # Quick Start
//!
//! ```no_run
//! use atslink::config::{AtsConfig, BrokerConfig};
//! use atslink::event::EventKind;
//! use atslink::service::{AtsService, NetworkKind};
//! use atslink::types::AlarmMode;
//!
//! #[tokio::main]
//! async fn main() -> atslink::Result<()> {
//!     let config = AtsConfig::new(
//!         "http://192.168.1.20:3000",
//!         "phone-1",
//!         "64P36D1L6ORJGE9G",
//!         BrokerConfig::new("broker.example").with_credentials("ats", "secret"),
//!     );
//!
//!     let service = AtsService::start(&config)?;
//!
//!     service.subscribe(EventKind::SystemAlarmed, |event| {
//!         println!("alarm fired: {event:?}");
//!     });
//!
//!     // Bring the channels up for the current network.
//!     service.network_changed(NetworkKind::Local).await;
//!
//!     service.arm(AlarmMode::Away, None).await?;
//!     let state = service.get_state().await?;
//!     println!("system: {state:?}");
//!
//!     Ok(())
//! }
//! ```
//!
//! # Working with a single channel
//!
//! The [`channel::Channel`] trait is public, so a single transport can be
//! driven directly when the orchestration layer is not wanted:
//!
//! ```no_run
//! use atslink::channel::{BrokerChannel, Channel};
//! use atslink::config::BrokerConfig;
//!
//! # async fn example() -> atslink::Result<()> {
//! let broker = BrokerChannel::new(&BrokerConfig::new("192.168.1.20"), "phone-1");
//! broker.connect().await;
//! let server_time = broker.server_time().await?;
//! println!("controller clock: {server_time}");
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod service;
pub mod totp;
pub mod types;

pub use channel::{BrokerChannel, Channel, ChannelEvent, ConnectionState, SocketChannel};
pub use config::{AtsConfig, BrokerConfig};
pub use error::{CommandError, Error, ParseError, ProtocolError, Result, SecretError};
pub use event::{AtsEvent, EventBus, EventKind, StatePayload, SubscriptionId};
pub use service::{AtsService, ClockOffset, NetworkKind};
pub use totp::{TotpOptions, decode_secret, generate_code};
pub use types::{
    AlarmMode, AlarmState, Sensor, SensorGroup, SensorLocation, SensorType, SystemState,
};
