// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request/response correlation over fire-and-forget topics.
//!
//! The broker transport has no native request/response: a command goes out
//! on one topic and its reply comes back on a result topic carrying the
//! command's message id. [`CorrelationTable`] bridges the two by parking a
//! oneshot per waiter until the matching reply (or a timeout) arrives.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::ProtocolError;

/// How long a command waits for its correlated reply.
pub(crate) const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pending replies keyed by message id.
///
/// Several waiters may share one id; a reply resolves all of them. A waiter
/// that times out is pruned without disturbing the others.
#[derive(Debug, Default)]
pub(crate) struct CorrelationTable {
    pending: Mutex<HashMap<String, Vec<oneshot::Sender<String>>>>,
}

impl CorrelationTable {
    /// Parks a waiter for the given message id.
    ///
    /// Register before publishing the command so a fast reply cannot slip
    /// past the waiter.
    pub(crate) fn register(&self, id: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().entry(id.to_string()).or_default().push(tx);
        rx
    }

    /// Resolves every waiter parked on `id`. Returns `false` for a stray
    /// reply nobody is waiting for.
    pub(crate) fn complete(&self, id: &str, payload: &str) -> bool {
        let Some(waiters) = self.pending.lock().remove(id) else {
            return false;
        };
        for tx in waiters {
            // A waiter that already timed out has dropped its receiver.
            let _ = tx.send(payload.to_string());
        }
        true
    }

    /// Drops waiters whose receiver side is gone, removing the entry once
    /// empty.
    fn prune(&self, id: &str) {
        let mut pending = self.pending.lock();
        if let Some(waiters) = pending.get_mut(id) {
            waiters.retain(|tx| !tx.is_closed());
            if waiters.is_empty() {
                pending.remove(id);
            }
        }
    }

    /// Waits up to `timeout` for the reply correlated to `id`.
    pub(crate) async fn wait(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<String, ProtocolError> {
        let rx = self.register(id);
        self.wait_registered(id, rx, timeout).await
    }

    /// Waits on a receiver obtained from [`register`](Self::register).
    pub(crate) async fn wait_registered(
        &self,
        id: &str,
        rx: oneshot::Receiver<String>,
        timeout: Duration,
    ) -> Result<String, ProtocolError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(ProtocolError::ChannelClosed(format!(
                "reply channel for message {id} dropped"
            ))),
            Err(_) => {
                self.prune(id);
                Err(ProtocolError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    #[cfg(test)]
    fn pending_ids(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Builds a correlation id for an outbound command.
///
/// Authenticated commands prefix the current token so the controller can
/// verify the sender; the trailing digits of the clock keep ids from two
/// commands in the same token window distinct enough in practice. Commands
/// sent before authentication carry a bare clock-derived id.
pub(crate) fn message_id(token: Option<&str>, now_millis: u64) -> String {
    let millis = now_millis.to_string();
    match token {
        Some(token) => {
            let suffix = &millis[millis.len().saturating_sub(4)..];
            format!("{token}{suffix}")
        }
        None => millis[millis.len().min(3)..].to_string(),
    }
}
