//! Chat messages dispatching
//!
//! Messages are always persisted first - the stored conversation is the source of truth. Only
//! after that the message is pushed to live connections of the sender and the receiver. Pushing is
//! best effort: offline users get the message when they fetch the conversation.

use thiserror::Error;
use tracing::{debug, instrument};

use crate::model::chat::ChatMessage;
use crate::model::users::{self, UserId};
use crate::presence::{PresenceRegistry, ServerEvent};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Message cannot be empty")]
    EmptyMessage,
    #[error("Receiver not found")]
    ReceiverNotFound,
    #[error("{0}")]
    Forbidden(&'static str),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl From<users::Error> for Error {
    fn from(err: users::Error) -> Self {
        match err {
            users::Error::Db(err) => Self::Db(err),
            // Other users errors never come from lookups
            _ => Self::ReceiverNotFound,
        }
    }
}

/// Chat operations accessor
pub struct MessageDispatcher<'a> {
    /// Database connection
    db: &'a sqlx::SqlitePool,
    /// Live connections
    presence: &'a PresenceRegistry,
}

impl<'a> MessageDispatcher<'a> {
    pub fn new(db: &'a sqlx::SqlitePool, presence: &'a PresenceRegistry) -> Self {
        Self { db, presence }
    }

    /// Persists the message and pushes it to the live connections of both parties
    #[instrument(skip(self, body))]
    pub async fn send(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        body: String,
    ) -> Result<ChatMessage, Error> {
        if body.trim().is_empty() {
            return Err(Error::EmptyMessage);
        }

        if !receiver_id.exists(self.db).await? {
            return Err(Error::ReceiverNotFound);
        }

        let message = ChatMessage::create(self.db, sender_id, receiver_id, body).await?;
        let event = ServerEvent::NewMessage(message.clone());

        let to_receiver = self.presence.push(receiver_id, &event);
        let to_sender = sender_id != receiver_id && self.presence.push(sender_id, &event);
        debug!(message_id = %message.id, to_receiver, to_sender, "Message dispatched");

        Ok(message)
    }

    /// Marks all the messages from `counterparty_id` to `receiver_id` as read
    ///
    /// Only the receiver can mark messages as read. Returns number of messages marked.
    #[instrument(skip(self))]
    pub async fn mark_read(
        &self,
        caller_id: UserId,
        receiver_id: UserId,
        counterparty_id: UserId,
    ) -> Result<u64, Error> {
        if caller_id != receiver_id {
            return Err(Error::Forbidden(
                "Only the receiver can mark messages as read",
            ));
        }

        let marked = ChatMessage::mark_read(self.db, receiver_id, counterparty_id).await?;
        debug!(marked, "Messages marked as read");
        Ok(marked)
    }

    /// Number of unread messages addressed to the user
    pub async fn unread_count(&self, user_id: UserId) -> Result<i64, Error> {
        Ok(ChatMessage::unread_count(self.db, user_id).await?)
    }

    /// Conversation between two users
    ///
    /// Caller has to be one of the conversation parties.
    #[instrument(skip(self))]
    pub async fn conversation(
        &self,
        caller_id: UserId,
        user1: UserId,
        user2: UserId,
    ) -> Result<Vec<ChatMessage>, Error> {
        if caller_id != user1 && caller_id != user2 {
            return Err(Error::Forbidden("You can only view your own conversations"));
        }

        Ok(ChatMessage::conversation(self.db, user1, user2).await?)
    }
}
