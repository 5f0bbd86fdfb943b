// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static configuration for the service and its channels.
//!
//! All configuration is supplied by the caller at construction time; the
//! library reads no files and no environment variables.

use std::time::Duration;

/// Configuration for the MQTT broker channel.
///
/// # Examples
///
/// ```
/// use atslink::config::BrokerConfig;
///
/// let config = BrokerConfig::new("192.168.0.142")
///     .with_port(9001)
///     .with_credentials("user", "password");
/// assert_eq!(config.port(), 9001);
/// ```
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    keep_alive: Duration,
    topic_prefix: String,
}

impl BrokerConfig {
    /// Default MQTT port.
    pub const DEFAULT_PORT: u16 = 1883;
    /// Default keep-alive interval.
    pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
    /// Default root of the controller's topic namespace.
    pub const DEFAULT_TOPIC_PREFIX: &'static str = "ats";

    /// Creates a broker configuration for the given host.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: Self::DEFAULT_PORT,
            credentials: None,
            keep_alive: Self::DEFAULT_KEEP_ALIVE,
            topic_prefix: Self::DEFAULT_TOPIC_PREFIX.to_string(),
        }
    }

    /// Sets a custom port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets authentication credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Sets the keep-alive interval.
    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Sets a custom topic prefix.
    #[must_use]
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// Returns the broker host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the broker port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the credentials if configured.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.credentials
            .as_ref()
            .map(|(u, p)| (u.as_str(), p.as_str()))
    }

    /// Returns the keep-alive interval.
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// Returns the topic prefix.
    #[must_use]
    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }
}

/// Top-level configuration for an [`AtsService`](crate::service::AtsService).
#[derive(Debug, Clone)]
pub struct AtsConfig {
    server_url: String,
    client_id: String,
    secret: String,
    broker: BrokerConfig,
}

impl AtsConfig {
    /// Creates a configuration.
    ///
    /// # Arguments
    ///
    /// * `server_url` - Base URL of the controller's HTTP/WebSocket server
    ///   (e.g. `http://192.168.137.1:3000`)
    /// * `client_id` - Identity announced in handshakes and command headers
    /// * `secret` - Base32-encoded shared TOTP secret
    /// * `broker` - Broker channel configuration
    #[must_use]
    pub fn new(
        server_url: impl Into<String>,
        client_id: impl Into<String>,
        secret: impl Into<String>,
        broker: BrokerConfig,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            client_id: client_id.into(),
            secret: secret.into(),
            broker,
        }
    }

    /// Returns the controller server URL.
    #[must_use]
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Returns the client identity.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Returns the shared TOTP secret.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Returns the broker configuration.
    #[must_use]
    pub fn broker(&self) -> &BrokerConfig {
        &self.broker
    }
}
