//! Live connection lifecycle
//!
//! Every connection starts unauthenticated and gets exactly one chance to authenticate with a
//! session token. Authenticated connections are registered as the live connection of their user
//! until they are closed.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::model::auth::{Identity, TokenCodec};
use crate::presence::{Connection, PresenceRegistry, ServerEvent};

/// Message received from the connected client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Handshake carrying the raw session token
    Authenticate(String),
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated(Identity),
    Closed,
}

/// What the transport should do after the event was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Close,
}

/// Drives a single connection through its states
///
/// Transport independent - the transport feeds it with received messages and closes the
/// underlying connection when asked to. Dropping the lifecycle closes it.
pub struct ConnectionLifecycle {
    connection: Arc<dyn Connection>,
    codec: TokenCodec,
    presence: Arc<PresenceRegistry>,
    state: ConnectionState,
}

impl ConnectionLifecycle {
    pub fn new(
        connection: Arc<dyn Connection>,
        codec: TokenCodec,
        presence: Arc<PresenceRegistry>,
    ) -> Self {
        Self {
            connection,
            codec,
            presence,
            state: ConnectionState::Unauthenticated,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Handles raw text frame received from the client
    ///
    /// Frames which are not valid client events are ignored.
    pub fn handle_text(&mut self, text: &str) -> Step {
        match serde_json::from_str(text) {
            Ok(event) => self.handle(event),
            Err(err) => {
                warn!(connection = %self.connection.id(), %err, "Ignoring invalid client frame");
                Step::Continue
            }
        }
    }

    /// Handles event received from the client
    pub fn handle(&mut self, event: ClientEvent) -> Step {
        match (self.state, event) {
            (ConnectionState::Unauthenticated, ClientEvent::Authenticate(token)) => {
                self.authenticate(&token)
            }
            (ConnectionState::Authenticated(identity), ClientEvent::Authenticate(_)) => {
                debug!(
                    connection = %self.connection.id(),
                    user_id = %identity.id,
                    "Connection already authenticated"
                );
                Step::Continue
            }
            (ConnectionState::Closed, _) => Step::Close,
        }
    }

    fn authenticate(&mut self, token: &str) -> Step {
        let connection_id = self.connection.id();

        match self.codec.verify(token) {
            Ok(identity) => {
                self.presence.register(identity.id, self.connection.clone());
                self.state = ConnectionState::Authenticated(identity);
                info!(
                    connection = %connection_id,
                    user_id = %identity.id,
                    online = self.presence.len(),
                    "Connection authenticated"
                );
                Step::Continue
            }
            Err(err) => {
                info!(connection = %connection_id, %err, "Connection authentication failed");
                self.connection.deliver(&ServerEvent::AuthError {
                    message: "Authentication failed".to_owned(),
                });
                self.state = ConnectionState::Closed;
                Step::Close
            }
        }
    }

    /// Closes the connection, removing it from the presence registry if it was registered
    pub fn close(&mut self) {
        if let ConnectionState::Authenticated(identity) = self.state {
            let removed = self.presence.unregister(self.connection.id());
            debug!(
                connection = %self.connection.id(),
                user_id = %identity.id,
                removed,
                "Authenticated connection closed"
            );
        }

        self.state = ConnectionState::Closed;
    }
}

impl Drop for ConnectionLifecycle {
    fn drop(&mut self) {
        self.close();
    }
}
