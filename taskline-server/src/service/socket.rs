//! Live connections endpoint
//!
//! The WebSocket is accepted unauthenticated - the client has to send the `authenticate` event
//! with its session token first. Events pushed to the connection are queued in a bounded outbox
//! drained by the connection task. Clients which stop responding to pings are disconnected.

use std::sync::Arc;
use std::time::Duration;

use actix_web::web::{Data, Payload};
use actix_web::{HttpRequest, HttpResponse, get};
use actix_ws::{Message, MessageStream, Session};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{Instrument, debug, info_span, warn};

use crate::model::Model;
use crate::presence::lifecycle::{ConnectionLifecycle, Step};
use crate::presence::{ChannelConnection, Connection};
use crate::service::error::ApiError;

/// Maximum number of events waiting to be written to a single connection
const OUTBOX_CAPACITY: usize = 64;

/// How often the client is pinged
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long the client may stay silent before it is disconnected
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// Client liveness tracking
///
/// Every frame received from the client counts as a sign of life. The client is considered dead
/// after it missed `timeout / interval` heartbeats in a row.
#[derive(Debug)]
struct Heartbeat {
    max_missed: u32,
    missed: u32,
}

impl Heartbeat {
    fn new(interval: Duration, timeout: Duration) -> Self {
        let interval = interval.as_millis().max(1);
        let max_missed = (timeout.as_millis() / interval).max(1);

        Self {
            max_missed: u32::try_from(max_missed).unwrap_or(u32::MAX),
            missed: 0,
        }
    }

    /// Client just showed a sign of life
    fn alive(&mut self) {
        self.missed = 0;
    }

    /// Heartbeat period elapsed. Returns `false` once the client is considered dead.
    fn tick(&mut self) -> bool {
        self.missed += 1;
        self.missed <= self.max_missed
    }
}

#[get("/ws")]
async fn socket(
    req: HttpRequest,
    body: Payload,
    model: Data<Model>,
) -> Result<HttpResponse, ApiError> {
    let (response, session, stream) =
        actix_ws::handle(&req, body).map_err(|err| ApiError::Validation(err.to_string()))?;

    let (tx, outbox) = mpsc::channel(OUTBOX_CAPACITY);
    let connection = Arc::new(ChannelConnection::new(tx));
    let span = info_span!("connection", id = %connection.id());

    let lifecycle = ConnectionLifecycle::new(
        connection.clone(),
        model.codec().clone(),
        model.presence().clone(),
    );

    actix_web::rt::spawn(run(lifecycle, connection, session, stream, outbox).instrument(span));
    Ok(response)
}

/// Connection task, lives until either side closes the connection
async fn run(
    mut lifecycle: ConnectionLifecycle,
    connection: Arc<ChannelConnection>,
    mut session: Session,
    mut stream: MessageStream,
    mut outbox: mpsc::Receiver<String>,
) {
    debug!("Connection opened");

    let mut heartbeat = Heartbeat::new(HEARTBEAT_INTERVAL, CLIENT_TIMEOUT);
    let mut ticks = time::interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            frame = stream.recv() => {
                if matches!(frame, Some(Ok(_))) {
                    heartbeat.alive();
                }

                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if lifecycle.handle_text(&text) == Step::Close {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(bytes))) => {
                        if session.pong(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(reason))) => {
                        debug!(?reason, "Connection closed by the client");
                        break;
                    }
                    Some(Ok(_)) => (),
                    Some(Err(err)) => {
                        warn!(%err, "Connection protocol error");
                        break;
                    }
                    None => break,
                }
            }
            Some(payload) = outbox.recv() => {
                if session.text(payload).await.is_err() {
                    break;
                }
            }
            _ = ticks.tick() => {
                if !heartbeat.tick() {
                    warn!("Client stopped responding");
                    break;
                }
                if session.ping(b"").await.is_err() {
                    break;
                }
            }
        }
    }

    debug!(state = ?lifecycle.state(), "Closing connection");
    lifecycle.close();

    // Flush whatever was queued before closing, the auth error in particular
    while let Ok(payload) = outbox.try_recv() {
        if session.text(payload).await.is_err() {
            break;
        }
    }

    if let Err(err) = session.close(None).await {
        debug!(?err, "Connection already closed");
    }
    debug!(dropped = connection.drop_count(), "Connection closed");
}
