//! Chat endpoints
//!
//! All the endpoints require an authenticated caller.

use actix_web::web::{Data, Json, Query};
use actix_web::{HttpResponse, get, post};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::model::Model;
use crate::model::auth::Identity;
use crate::model::chat::ChatMessage;
use crate::model::users::UserId;
use crate::service::error::ApiError;

#[derive(Debug, Deserialize)]
struct SendMessage {
    receiver_id: UserId,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ConversationQuery {
    sender_id: UserId,
    receiver_id: UserId,
}

#[derive(Debug, Deserialize)]
struct MarkRead {
    receiver_id: UserId,
    counterparty_id: UserId,
}

#[derive(Debug, Serialize)]
struct Updated {
    updated: u64,
}

#[derive(Debug, Serialize)]
struct Unread {
    count: i64,
}

/// Sends message to another user
#[post("")]
#[instrument(skip_all, fields(sender_id = %identity.id, receiver_id = %req.receiver_id))]
async fn send(
    model: Data<Model>,
    identity: Identity,
    req: Json<SendMessage>,
) -> Result<HttpResponse, ApiError> {
    let SendMessage {
        receiver_id,
        message,
    } = req.into_inner();

    let message = model
        .dispatcher()
        .send(identity.id, receiver_id, message)
        .await?;

    Ok(HttpResponse::Created().json(message))
}

/// Messages exchanged between two users
#[get("")]
#[instrument(skip_all, fields(caller_id = %identity.id))]
async fn conversation(
    model: Data<Model>,
    identity: Identity,
    query: Query<ConversationQuery>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let messages = model
        .dispatcher()
        .conversation(identity.id, query.sender_id, query.receiver_id)
        .await?;

    Ok(Json(messages))
}

/// Marks messages from the counterparty as read
#[post("/read")]
#[instrument(skip_all, fields(caller_id = %identity.id))]
async fn mark_read(
    model: Data<Model>,
    identity: Identity,
    req: Json<MarkRead>,
) -> Result<Json<Updated>, ApiError> {
    let updated = model
        .dispatcher()
        .mark_read(identity.id, req.receiver_id, req.counterparty_id)
        .await?;

    Ok(Json(Updated { updated }))
}

/// Number of unread messages of the caller
#[get("/unread")]
#[instrument(skip_all, fields(caller_id = %identity.id))]
async fn unread(model: Data<Model>, identity: Identity) -> Result<Json<Unread>, ApiError> {
    let count = model.dispatcher().unread_count(identity.id).await?;
    Ok(Json(Unread { count }))
}
