//! Live connections registry
//!
//! Maps authenticated users to the live connection events should be pushed to. There is at most
//! one connection per user - the last authenticated one. Registry lives only in the process memory,
//! after restart all the clients have to authenticate their connections again.

pub mod lifecycle;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::chat::ChatMessage;
use crate::model::users::UserId;

/// Live connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event pushed from the service to a live connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Chat message was just persisted
    NewMessage(ChatMessage),
    /// Connection handshake failed, connection is about to be closed
    AuthError { message: String },
}

/// Target events can be delivered to
///
/// Delivery never blocks - it only queues the event for the connection writer. Returns `false`
/// if the event could not be queued.
pub trait Connection: Send + Sync {
    /// Identifier of this connection
    fn id(&self) -> ConnectionId;

    /// Queues event for delivery
    fn deliver(&self, event: &ServerEvent) -> bool;
}

/// Connection delivering serialized events over a bounded channel to the connection writer
pub struct ChannelConnection {
    id: ConnectionId,
    /// Send channel to the connection write task
    tx: mpsc::Sender<String>,
    /// Count of events dropped due to full or closed channel
    dropped: AtomicU64,
}

impl ChannelConnection {
    /// Creates new connection with fresh id
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Total events dropped for this connection
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Connection for ChannelConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn deliver(&self, event: &ServerEvent) -> bool {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(connection = %self.id, %err, "Cannot serialize event");
                return false;
            }
        };

        if self.tx.try_send(payload).is_ok() {
            true
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

#[derive(Default)]
struct Entries {
    /// Live connection of every present user
    connections: HashMap<UserId, Arc<dyn Connection>>,
    /// User every registered connection was registered for
    owners: HashMap<ConnectionId, UserId>,
}

/// Users presence registry
///
/// All the operations are performed under a single lock, which is never held while delivering
/// events.
#[derive(Default)]
pub struct PresenceRegistry {
    entries: Mutex<Entries>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the connection the live connection of the user
    ///
    /// Previous connection of the user is not closed, it just stops receiving events.
    pub fn register(&self, user_id: UserId, connection: Arc<dyn Connection>) {
        let connection_id = connection.id();
        let mut entries = self.entries.lock();

        if let Some(previous) = entries.connections.insert(user_id, connection) {
            let previous = previous.id();
            if previous != connection_id {
                entries.owners.remove(&previous);
                debug!(%user_id, %previous, connection = %connection_id, "Connection replaced");
            }
        }

        if let Some(owner) = entries.owners.insert(connection_id, user_id)
            && owner != user_id
            && entries
                .connections
                .get(&owner)
                .is_some_and(|connection| connection.id() == connection_id)
        {
            entries.connections.remove(&owner);
        }
    }

    /// Removes the connection from the registry
    ///
    /// The entry is removed only if the connection is still the live connection of its user, so
    /// closing a replaced connection never evicts the newer one. Returns `true` if the entry was
    /// removed.
    pub fn unregister(&self, connection_id: ConnectionId) -> bool {
        let mut entries = self.entries.lock();

        let Some(user_id) = entries.owners.remove(&connection_id) else {
            return false;
        };

        let live = entries
            .connections
            .get(&user_id)
            .is_some_and(|connection| connection.id() == connection_id);
        if live {
            entries.connections.remove(&user_id);
        }
        live
    }

    /// Live connection id of the user
    pub fn lookup(&self, user_id: UserId) -> Option<ConnectionId> {
        self.entries
            .lock()
            .connections
            .get(&user_id)
            .map(|connection| connection.id())
    }

    /// Live connection of the user
    pub fn connection(&self, user_id: UserId) -> Option<Arc<dyn Connection>> {
        self.entries.lock().connections.get(&user_id).cloned()
    }

    /// Pushes event to the user live connection if there is one
    ///
    /// Returns `true` if the event was queued for delivery.
    pub fn push(&self, user_id: UserId, event: &ServerEvent) -> bool {
        let Some(connection) = self.connection(user_id) else {
            debug!(%user_id, "User offline, skipping push");
            return false;
        };

        let delivered = connection.deliver(event);
        if !delivered {
            warn!(%user_id, connection = %connection.id(), "Failed to push event");
        }
        delivered
    }

    /// Number of present users
    pub fn len(&self) -> usize {
        self.entries.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
