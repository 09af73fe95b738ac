//! Chat messages storage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::{FromRow, Type};
use uuid::Uuid;

use crate::model::users::UserId;

/// Chat message ID newtype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted chat message
///
/// Messages are ordered within a conversation by their creation time. Once the message is read,
/// it never becomes unread again.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(rename = "message")]
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

impl ChatMessage {
    /// Stores a new unread message
    pub async fn create(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        sender_id: UserId,
        receiver_id: UserId,
        body: impl Into<String>,
    ) -> Result<Self, sqlx::Error> {
        let message = Self {
            id: MessageId(Uuid::new_v4()),
            sender_id,
            receiver_id,
            body: body.into(),
            created_at: Utc::now(),
            is_read: false,
        };

        sqlx::query(
            "insert into chat(id, sender_id, receiver_id, body, created_at, is_read) \
             values (?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id)
        .bind(message.sender_id)
        .bind(message.receiver_id)
        .bind(&message.body)
        .bind(message.created_at)
        .bind(message.is_read)
        .execute(db)
        .await?;

        Ok(message)
    }

    /// Fetches single message by it's id
    #[cfg(test)]
    pub async fn fetch(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        id: MessageId,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            "select id, sender_id, receiver_id, body, created_at, is_read from chat where id = ?",
        )
        .bind(id)
        .fetch_optional(db)
        .await
    }

    /// All messages exchanged between two users, in creation order
    pub async fn conversation(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        user1: UserId,
        user2: UserId,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            "select id, sender_id, receiver_id, body, created_at, is_read from chat \
             where (sender_id = ?1 and receiver_id = ?2) or (sender_id = ?2 and receiver_id = ?1) \
             order by created_at, rowid",
        )
        .bind(user1)
        .bind(user2)
        .fetch_all(db)
        .await
    }

    /// Marks all unread messages from `sender_id` to `receiver_id` as read
    ///
    /// Returns number of messages that changed their state.
    pub async fn mark_read(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        receiver_id: UserId,
        sender_id: UserId,
    ) -> Result<u64, sqlx::Error> {
        let update = sqlx::query(
            "update chat set is_read = true \
             where receiver_id = ? and sender_id = ? and is_read = false",
        )
        .bind(receiver_id)
        .bind(sender_id)
        .execute(db)
        .await?;

        Ok(update.rows_affected())
    }

    /// Number of unread messages addressed to the user
    pub async fn unread_count(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        receiver_id: UserId,
    ) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) =
            sqlx::query_as("select count(*) from chat where receiver_id = ? and is_read = false")
                .bind(receiver_id)
                .fetch_one(db)
                .await?;

        Ok(count)
    }
}
