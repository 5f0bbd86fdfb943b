// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `atslink` library.
//!
//! This module provides the error hierarchy for failures across the library:
//! rejected commands, transport communication, payload parsing, and TOTP
//! secret handling.

use thiserror::Error;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// A command was rejected by the alarm controller.
    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// Error occurred during transport communication.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Error occurred while parsing a message or response.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The shared TOTP secret is malformed.
    #[error("secret error: {0}")]
    Secret(#[from] SecretError),

    /// No channel is currently connected.
    #[error("no channel is connected")]
    NotConnected,
}

/// Failures reported by the alarm controller for an individual command.
///
/// These never affect the channel's connection state; the caller decides
/// whether to retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The token or client id was not accepted (HTTP 401/403).
    #[error("not authorized")]
    NotAuthorized,

    /// The system is in a state that forbids the command, e.g. arming an
    /// already armed system (HTTP 409).
    #[error("invalid system state for this command")]
    InvalidSystemState,

    /// The controller could not understand the request.
    #[error("bad request")]
    BadRequest,

    /// A success status arrived without the expected body.
    #[error("empty response")]
    EmptyResponse,

    /// The controller reported a failure without further detail.
    #[error("command rejected: {0}")]
    Rejected(String),
}

/// Errors related to transport communication (HTTP/WebSocket/MQTT).
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// MQTT connection or communication failed.
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// No correlated reply arrived within the deadline.
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// Invalid URL or address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Internal channel was closed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

/// Errors related to parsing controller messages.
#[derive(Debug, Error)]
pub enum ParseError {
    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unexpected message format.
    #[error("unexpected message format: {0}")]
    UnexpectedFormat(String),

    /// Failed to parse a specific value.
    #[error("failed to parse {field}: {message}")]
    InvalidValue {
        /// The field that failed to parse.
        field: String,
        /// Description of the parsing failure.
        message: String,
    },
}

/// Errors related to the shared TOTP secret.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecretError {
    /// The secret contains a character outside the base32 alphabet.
    #[error("invalid base32 character {0:?} in secret")]
    InvalidSecret(char),

    /// The secret is empty.
    #[error("secret is empty")]
    EmptySecret,
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(ParseError::Json(err))
    }
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
