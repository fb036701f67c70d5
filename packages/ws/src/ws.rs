//! Core WebSocket message processing for dice sessions.
//!
//! Handles connection lifecycle, validates and persists rolls, and broadcasts
//! updates to the other connections in the same session. Durability precedes
//! visibility: a roll is broadcast only after its persistence write returns.

use core::fmt;
use std::{
    collections::BTreeMap,
    sync::{Arc, LazyLock, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use dicebox_session::{
    models::{
        CheckRoll, DamageRoll, GmRoll, NewRollRecord, Player, PlayerId, RollType, SessionId,
    },
    SessionDb, SessionDbError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{
    ErrorPayload, HistoryPayload, InboundPayload, OutboundPayload, PlayerJoinedPayload,
    PlayerLeftPayload, RollRequest, RollResultPayload, WelcomePayload,
};

/// Most records a welcome/history replay will carry.
pub const REPLAY_LIMIT: usize = 50;

/// Oldest a record may be and still appear in a replay.
pub const REPLAY_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Display name used until a `JOIN` message names the player.
pub const DEFAULT_PLAYER_NAME: &str = "Player";

/// Response for websocket operations.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// HTTP-style status code indicating operation result.
    pub status_code: u16,
    /// Response message body.
    pub body: String,
}

/// Context for a websocket connection.
#[derive(Clone, Debug)]
pub struct WebsocketContext {
    /// Unique identifier for this connection.
    pub connection_id: String,
    /// The session this connection belongs to.
    pub session_id: SessionId,
}

/// Errors that can occur when sending websocket messages.
#[derive(Debug, Error)]
pub enum WebsocketSendError {
    /// Database error
    #[error(transparent)]
    Db(#[from] SessionDbError),
    /// JSON serialization/deserialization error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// Unknown error with details
    #[error("Unknown: {0}")]
    Unknown(String),
}

/// Trait for sending messages via websocket.
#[async_trait]
pub trait WebsocketSender: Send + Sync {
    /// Sends a message to a specific connection.
    ///
    /// # Errors
    ///
    /// * If the websocket message fails to send
    async fn send(&self, connection_id: &str, data: &str) -> Result<(), WebsocketSendError>;

    /// Sends a message to all connections in the session.
    ///
    /// # Errors
    ///
    /// * If the websocket message fails to send
    async fn send_all(&self, data: &str) -> Result<(), WebsocketSendError>;

    /// Sends a message to all connections in the session except the specified
    /// one.
    ///
    /// # Errors
    ///
    /// * If the websocket message fails to send
    async fn send_all_except(
        &self,
        connection_id: &str,
        data: &str,
    ) -> Result<(), WebsocketSendError>;
}

impl fmt::Debug for dyn WebsocketSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{WebsocketSender}}")
    }
}

/// Live player attribution for a connection.
#[derive(Debug, Clone)]
struct ActivePlayer {
    player_id: PlayerId,
    name: String,
}

static ACTIVE_PLAYERS: LazyLock<Arc<RwLock<BTreeMap<String, ActivePlayer>>>> =
    LazyLock::new(|| Arc::new(RwLock::new(BTreeMap::new())));

/// Errors that can occur when connecting to a websocket.
#[derive(Debug, Error)]
pub enum WebsocketConnectError {
    /// Database error
    #[error(transparent)]
    Db(#[from] SessionDbError),
    /// Websocket send error
    #[error(transparent)]
    WebsocketSend(#[from] WebsocketSendError),
    /// JSON serialization/deserialization error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Handles a new websocket connection: upserts a fresh player row, sends the
/// welcome snapshot (assigned player id, live roster, replay window) to the
/// new connection, then notifies the rest of the session.
///
/// # Errors
///
/// * If a database error occurs
/// * If the welcome or join messages fail to serialize or send
///
/// # Panics
///
/// * If the active player `RwLock` panics
pub async fn connect(
    db: &SessionDb,
    sender: &impl WebsocketSender,
    context: &WebsocketContext,
) -> Result<Response, WebsocketConnectError> {
    dicebox_session::create_session(db, &context.session_id).await?;

    let player =
        dicebox_session::upsert_player(db, &context.session_id, None, DEFAULT_PLAYER_NAME).await?;

    ACTIVE_PLAYERS.write().unwrap().insert(
        context.connection_id.clone(),
        ActivePlayer {
            player_id: player.id,
            name: player.name.clone(),
        },
    );

    let roster = active_roster(db, &context.session_id).await?;
    let recent_rolls =
        dicebox_session::list_recent_rolls(db, &context.session_id, REPLAY_LIMIT, REPLAY_MAX_AGE)
            .await?;

    let welcome = serde_json::to_value(OutboundPayload::Welcome(WelcomePayload {
        player_id: player.id,
        roster,
        recent_rolls,
    }))?
    .to_string();
    sender.send(&context.connection_id, &welcome).await?;

    let joined = serde_json::to_value(OutboundPayload::PlayerJoined(PlayerJoinedPayload {
        player: player.clone(),
    }))?
    .to_string();
    sender
        .send_all_except(&context.connection_id, &joined)
        .await?;

    log::debug!(
        "Connected {} to session {} as player {}",
        context.connection_id,
        context.session_id,
        player.id
    );

    Ok(Response {
        status_code: 200,
        body: "Connected".into(),
    })
}

/// Errors that can occur when disconnecting from a websocket.
#[derive(Debug, Error)]
pub enum WebsocketDisconnectError {
    /// Database error
    #[error(transparent)]
    Db(#[from] SessionDbError),
    /// Websocket send error
    #[error(transparent)]
    WebsocketSend(#[from] WebsocketSendError),
    /// JSON serialization/deserialization error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Handles a websocket disconnection: marks the player inactive and notifies
/// the remaining connections. Idempotent after an explicit `LEAVE`.
///
/// # Errors
///
/// * If a database error occurs
/// * If the player-left notification fails to serialize or send
///
/// # Panics
///
/// * If the active player `RwLock` panics
pub async fn disconnect(
    db: &SessionDb,
    sender: &impl WebsocketSender,
    context: &WebsocketContext,
) -> Result<Response, WebsocketDisconnectError> {
    let player = ACTIVE_PLAYERS.write().unwrap().remove(&context.connection_id);

    if let Some(player) = player {
        dicebox_session::mark_inactive(db, player.player_id).await?;

        let left = serde_json::to_value(OutboundPayload::PlayerLeft(PlayerLeftPayload {
            player_id: player.player_id,
        }))?
        .to_string();
        sender.send_all(&left).await?;
    }

    log::debug!("Disconnected {}", context.connection_id);

    Ok(Response {
        status_code: 200,
        body: "Disconnected".into(),
    })
}

/// Errors that can occur when processing a websocket message.
#[derive(Debug, Error)]
pub enum WebsocketMessageError {
    /// Message type is not recognized or invalid
    #[error("Invalid message type")]
    InvalidMessageType,
    /// Message payload is invalid or malformed
    #[error("Invalid payload: '{0}' ({1})")]
    InvalidPayload(String, String),
    /// Connection has no player attribution
    #[error("Unknown connection")]
    UnknownConnection,
    /// Roll failed to persist; no id was assigned and nothing was broadcast
    #[error("Failed to record roll: {0}")]
    Persist(SessionDbError),
    /// Database fetch error
    #[error(transparent)]
    Db(#[from] SessionDbError),
    /// Websocket send error
    #[error(transparent)]
    WebsocketSend(#[from] WebsocketSendError),
    /// JSON serialization/deserialization error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Processes an incoming websocket message and routes it to the appropriate
/// handler.
///
/// # Errors
///
/// * If the message is an invalid type
/// * If the message fails to process
pub async fn process_message(
    db: &SessionDb,
    body: Value,
    context: WebsocketContext,
    sender: &impl WebsocketSender,
) -> Result<Response, WebsocketMessageError> {
    let payload: InboundPayload =
        serde_json::from_value(body).map_err(|_| WebsocketMessageError::InvalidMessageType)?;

    message(db, sender, payload, &context).await
}

/// Routes a parsed websocket message to its appropriate handler.
///
/// # Errors
///
/// * If the message fails to process
pub async fn message(
    db: &SessionDb,
    sender: &impl WebsocketSender,
    message: InboundPayload,
    context: &WebsocketContext,
) -> Result<Response, WebsocketMessageError> {
    let message_type = message.to_string();
    log::debug!(
        "Received message type {message_type} from {}",
        context.connection_id
    );

    match message {
        InboundPayload::Join(payload) => {
            join(db, sender, context, &payload.player_name).await?;
        }
        InboundPayload::Roll(payload) => {
            roll(db, sender, context, &payload).await?;
        }
        InboundPayload::Ping(_) => {
            ping(db, sender, context).await?;
        }
        InboundPayload::Leave(_) => {
            disconnect(db, sender, context)
                .await
                .map_err(|e| WebsocketSendError::Unknown(e.to_string()))?;
        }
        InboundPayload::GetHistory(_) => {
            send_history(db, sender, context).await?;
        }
    }

    log::debug!(
        "Successfully processed message type {message_type} from {}",
        context.connection_id
    );

    Ok(Response {
        status_code: 200,
        body: "Received".into(),
    })
}

fn active_player(connection_id: &str) -> Result<ActivePlayer, WebsocketMessageError> {
    ACTIVE_PLAYERS
        .read()
        .unwrap()
        .get(connection_id)
        .cloned()
        .ok_or(WebsocketMessageError::UnknownConnection)
}

async fn active_roster(
    db: &SessionDb,
    session_id: &SessionId,
) -> Result<Vec<Player>, SessionDbError> {
    Ok(dicebox_session::list_roster(db, session_id)
        .await?
        .into_iter()
        .filter(|player| player.is_active)
        .collect())
}

/// Names (or renames) the connection's player and re-broadcasts the
/// `PLAYER_JOINED` upsert event.
async fn join(
    db: &SessionDb,
    sender: &impl WebsocketSender,
    context: &WebsocketContext,
    player_name: &str,
) -> Result<(), WebsocketMessageError> {
    let active = active_player(&context.connection_id)?;

    let player = dicebox_session::upsert_player(
        db,
        &context.session_id,
        Some(active.player_id),
        player_name,
    )
    .await?;

    ACTIVE_PLAYERS.write().unwrap().insert(
        context.connection_id.clone(),
        ActivePlayer {
            player_id: player.id,
            name: player.name.clone(),
        },
    );

    let joined = serde_json::to_value(OutboundPayload::PlayerJoined(PlayerJoinedPayload {
        player,
    }))?
    .to_string();
    sender.send_all(&joined).await?;

    Ok(())
}

/// Validates the declared roll type's required fields, persists the record,
/// then broadcasts it to every other connection in commit order. Private gm
/// rolls are persisted but not broadcast.
async fn roll(
    db: &SessionDb,
    sender: &impl WebsocketSender,
    context: &WebsocketContext,
    request: &RollRequest,
) -> Result<(), WebsocketMessageError> {
    let active = active_player(&context.connection_id)?;

    let invalid = |e: serde_json::Error| {
        WebsocketMessageError::InvalidPayload(
            request.roll_type.as_ref().to_owned(),
            e.to_string(),
        )
    };

    let (total, result_text, private) = match request.roll_type {
        RollType::Check => {
            let view: CheckRoll =
                serde_json::from_value(request.fields.clone()).map_err(invalid)?;
            (view.total(), view.result_text(), false)
        }
        RollType::Damage => {
            let view: DamageRoll =
                serde_json::from_value(request.fields.clone()).map_err(invalid)?;
            (view.total(), view.result_text(), false)
        }
        RollType::Gm => {
            let view: GmRoll = serde_json::from_value(request.fields.clone()).map_err(invalid)?;
            (view.total(), view.result_text(), view.private)
        }
    };

    let record = dicebox_session::append_roll(
        db,
        &context.session_id,
        &NewRollRecord {
            player_id: active.player_id,
            player_name: active.name,
            roll_type: request.roll_type,
            payload: request.fields.clone(),
            total,
            result_text,
        },
    )
    .await
    .map_err(WebsocketMessageError::Persist)?;

    log::debug!(
        "Committed roll {} in session {} (total {total})",
        record.id,
        context.session_id
    );

    // persistence completed above; only now does the record become visible
    if !private {
        let result = serde_json::to_value(OutboundPayload::RollResult(RollResultPayload {
            record,
        }))?
        .to_string();
        sender
            .send_all_except(&context.connection_id, &result)
            .await?;
    }

    Ok(())
}

/// Answers an application-level ping and refreshes the player's `last_seen`.
/// Never mutates roster membership or roll history.
async fn ping(
    db: &SessionDb,
    sender: &impl WebsocketSender,
    context: &WebsocketContext,
) -> Result<(), WebsocketMessageError> {
    let active = active_player(&context.connection_id)?;

    dicebox_session::touch_player(db, active.player_id).await?;

    let pong =
        serde_json::to_value(OutboundPayload::Pong(crate::models::EmptyPayload::default()))?
            .to_string();
    sender.send(&context.connection_id, &pong).await?;

    Ok(())
}

async fn send_history(
    db: &SessionDb,
    sender: &impl WebsocketSender,
    context: &WebsocketContext,
) -> Result<(), WebsocketMessageError> {
    let records =
        dicebox_session::list_recent_rolls(db, &context.session_id, REPLAY_LIMIT, REPLAY_MAX_AGE)
            .await?;

    let history =
        serde_json::to_value(OutboundPayload::History(HistoryPayload { records }))?.to_string();
    sender.send(&context.connection_id, &history).await?;

    Ok(())
}

/// Builds the `ERROR` message for a processing failure. The connection stays
/// open; the client may correct and resend.
///
/// # Errors
///
/// * If the error message fails to serialize
pub fn error_message(error: &WebsocketMessageError) -> Result<String, serde_json::Error> {
    Ok(serde_json::to_value(OutboundPayload::Error(ErrorPayload {
        message: error.to_string(),
    }))?
    .to_string())
}
