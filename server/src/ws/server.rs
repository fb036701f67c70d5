//! Per-session WebSocket coordinator.
//!
//! One [`SessionServer`] instance is the sole writer and broadcaster for its
//! session identifier. Every event for the session — joins, inbound messages,
//! disconnects, timers — flows through one command channel and is processed
//! strictly serially, which is what makes the persist-then-broadcast ordering
//! correct without explicit locking. Connections in different sessions never
//! share state.

use std::{collections::BTreeMap, fmt, io, time::Duration};

use async_trait::async_trait;
use dicebox_session::{models::SessionId, SessionDb, SessionDbError};
use dicebox_ws::{
    WebsocketConnectError, WebsocketContext, WebsocketDisconnectError, WebsocketMessageError,
    WebsocketSendError, WebsocketSender,
};
use rand::Rng as _;
use serde_json::Value;
use strum_macros::AsRefStr;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::ws::{ConnId, Msg};

/// A command received by the [`SessionServer`].
#[derive(Debug, AsRefStr)]
pub enum Command {
    /// Registers a new WebSocket connection.
    Connect {
        /// Channel sender for messages to this connection.
        conn_tx: mpsc::UnboundedSender<Msg>,
        /// Channel to send back the assigned connection ID.
        res_tx: oneshot::Sender<ConnId>,
    },

    /// Removes a WebSocket connection.
    Disconnect {
        /// Connection ID to disconnect.
        conn: ConnId,
    },

    /// Processes an incoming message from a connection.
    Message {
        /// The received message.
        msg: Msg,
        /// Connection ID that sent the message.
        conn: ConnId,
        /// Channel to signal completion.
        res_tx: oneshot::Sender<()>,
    },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Coordinator for one session's live connections.
///
/// Owns the connection set and mediates the protocol between clients and the
/// record store. Call and spawn [`run`](Self::run) to start processing
/// commands.
#[derive(Debug)]
pub struct SessionServer {
    session_id: SessionId,

    db: SessionDb,

    /// Map of connection IDs to their message senders.
    connections: BTreeMap<ConnId, mpsc::UnboundedSender<Msg>>,

    /// Command receiver.
    cmd_rx: mpsc::UnboundedReceiver<Command>,

    /// How long the session may sit with no connections before the instance
    /// tears itself down.
    eviction_timeout: Duration,

    token: CancellationToken,
}

#[async_trait]
impl WebsocketSender for SessionServer {
    async fn send(&self, connection_id: &str, data: &str) -> Result<(), WebsocketSendError> {
        let id = connection_id
            .parse::<ConnId>()
            .map_err(|e| WebsocketSendError::Unknown(format!("Bad connection id: {e}")))?;
        self.send_message_to(id, data.to_string());
        Ok(())
    }

    async fn send_all(&self, data: &str) -> Result<(), WebsocketSendError> {
        self.send_system_message(None, data.to_string());
        Ok(())
    }

    async fn send_all_except(
        &self,
        connection_id: &str,
        data: &str,
    ) -> Result<(), WebsocketSendError> {
        let id = connection_id
            .parse::<ConnId>()
            .map_err(|e| WebsocketSendError::Unknown(format!("Bad connection id: {e}")))?;
        self.send_system_message(Some(id), data.to_string());
        Ok(())
    }
}

impl SessionServer {
    /// Creates the coordinator for `session_id`, rehydrating from the record
    /// store before any connection is accepted: the durable session row is
    /// ensured and stale active flags from a previous instance are cleared.
    ///
    /// # Errors
    ///
    /// * If rehydration from the record store fails
    pub async fn new(
        session_id: SessionId,
        db: SessionDb,
        eviction_timeout: Duration,
    ) -> Result<(Self, SessionServerHandle), SessionDbError> {
        dicebox_session::create_session(&db, &session_id).await?;
        dicebox_session::mark_session_inactive(&db, &session_id).await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = SessionServerHandle {
            cmd_tx,
            token: token.clone(),
        };

        Ok((
            Self {
                session_id,
                db,
                connections: BTreeMap::new(),
                cmd_rx,
                eviction_timeout,
                token,
            },
            handle,
        ))
    }

    /// Send message to the session's connections, skipping `skip` so a
    /// message triggered by a connection is not also received by it.
    fn send_system_message(&self, skip: Option<ConnId>, msg: impl Into<String>) {
        let msg = msg.into();

        for (conn_id, sender) in &self.connections {
            if Some(*conn_id) != skip {
                // errors if client disconnected abruptly and hasn't been timed-out yet
                let _ = sender.send(msg.clone());
            }
        }
    }

    /// Send message directly to one connection.
    fn send_message_to(&self, id: ConnId, msg: impl Into<String>) {
        if let Some(sender) = self.connections.get(&id) {
            // errors if client disconnected abruptly and hasn't been timed-out yet
            let _ = sender.send(msg.into());
        }
    }

    fn context_for(&self, id: ConnId) -> WebsocketContext {
        WebsocketContext {
            connection_id: id.to_string(),
            session_id: self.session_id.clone(),
        }
    }

    /// Register a new connection, assign it a connection ID, and run the
    /// welcome flow.
    async fn connect(
        &mut self,
        tx: mpsc::UnboundedSender<Msg>,
    ) -> Result<ConnId, WebsocketConnectError> {
        let id = rand::rng().random::<ConnId>();
        self.connections.insert(id, tx);

        let db = self.db.clone();
        let context = self.context_for(id);

        if let Err(error) = dicebox_ws::connect(&db, &*self, &context).await {
            self.connections.remove(&id);
            return Err(error);
        }

        Ok(id)
    }

    /// Unregister a connection and run the player-left flow, unless an
    /// explicit `LEAVE` already did.
    async fn disconnect(&mut self, conn_id: ConnId) -> Result<(), WebsocketDisconnectError> {
        log::debug!("Connection {conn_id} disconnected from session {}", self.session_id);

        if self.connections.remove(&conn_id).is_some() {
            let db = self.db.clone();
            let context = self.context_for(conn_id);
            dicebox_ws::disconnect(&db, &*self, &context).await?;
        }

        Ok(())
    }

    async fn on_message(
        &mut self,
        id: ConnId,
        msg: impl Into<String> + Send,
    ) -> Result<(), WebsocketMessageError> {
        let payload = msg.into();
        let body = serde_json::from_str::<Value>(&payload)
            .map_err(|e| WebsocketMessageError::InvalidPayload(payload, e.to_string()))?;

        let message: dicebox_ws::models::InboundPayload = serde_json::from_value(body)
            .map_err(|_| WebsocketMessageError::InvalidMessageType)?;
        let is_leave = matches!(message, dicebox_ws::models::InboundPayload::Leave(_));

        let db = self.db.clone();
        let context = self.context_for(id);
        dicebox_ws::message(&db, &*self, message, &context).await?;

        if is_leave {
            // dropping the sender unwinds the connection's handler loop,
            // which closes the transport
            self.connections.remove(&id);
        }

        Ok(())
    }

    /// Surface a processing failure to the offending connection as an `ERROR`
    /// message. The connection stays open.
    fn send_error_to(&self, conn: ConnId, error: &WebsocketMessageError) {
        match dicebox_ws::error_message(error) {
            Ok(msg) => self.send_message_to(conn, msg),
            Err(e) => log::error!("Failed to serialize error message: {e:?}"),
        }
    }

    async fn process_command(&mut self, cmd: Command) {
        log::trace!("process_command: cmd={cmd}");

        match cmd {
            Command::Connect { conn_tx, res_tx } => match self.connect(conn_tx).await {
                Ok(conn_id) => {
                    let _ = res_tx.send(conn_id);
                }
                Err(error) => {
                    log::error!("Failed to connect: {error:?}");
                }
            },

            Command::Disconnect { conn } => {
                if let Err(error) = self.disconnect(conn).await {
                    log::error!("Failed to disconnect connection {conn}: {error:?}");
                }
            }

            Command::Message { msg, conn, res_tx } => {
                if let Err(error) = self.on_message(conn, msg.clone()).await {
                    log::error!("Failed to process message from {conn}: {msg:?}: {error:?}");
                    self.send_error_to(conn, &error);
                }
                let _ = res_tx.send(());
            }
        }
    }

    /// Process commands until cancelled or evicted.
    ///
    /// While the connection set is empty an inactivity timer is armed; if it
    /// elapses before a new connection arrives, the instance tears itself
    /// down. Durable rows are untouched, so a later connection to the same
    /// identifier rehydrates from the store.
    ///
    /// # Errors
    ///
    /// * Infallible today; the signature matches the spawned task shape
    pub async fn run(mut self) -> io::Result<()> {
        log::debug!("Session {} coordinator started", self.session_id);

        loop {
            let idle = self.connections.is_empty();

            tokio::select! {
                biased;

                () = self.token.cancelled() => {
                    log::debug!("Session {} coordinator was cancelled", self.session_id);
                    break;
                }

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.process_command(cmd).await,
                    None => break,
                },

                () = tokio::time::sleep(self.eviction_timeout), if idle => {
                    log::debug!(
                        "Session {} idle for {:?}; evicting coordinator",
                        self.session_id,
                        self.eviction_timeout
                    );
                    break;
                }
            }
        }

        log::debug!("Stopped session {} coordinator", self.session_id);

        Ok(())
    }
}

/// Handle and command sender for a session coordinator.
///
/// Reduces boilerplate of setting up response channels in `WebSocket`
/// handlers.
#[derive(Debug, Clone)]
pub struct SessionServerHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    token: CancellationToken,
}

impl SessionServerHandle {
    /// Register client message sender and obtain connection ID.
    ///
    /// Returns `None` if the coordinator is gone (evicted or cancelled); the
    /// caller should re-resolve through the registry.
    pub async fn connect(&self, conn_tx: mpsc::UnboundedSender<Msg>) -> Option<ConnId> {
        let (res_tx, res_rx) = oneshot::channel();

        self.cmd_tx.send(Command::Connect { conn_tx, res_tx }).ok()?;

        res_rx.await.ok()
    }

    /// Hand an inbound frame to the coordinator and wait for it to be
    /// processed, preserving per-connection ordering.
    pub async fn send_message(&self, conn: ConnId, msg: impl Into<String> + Send) {
        let (res_tx, res_rx) = oneshot::channel();

        if self
            .cmd_tx
            .send(Command::Message {
                msg: msg.into(),
                conn,
                res_tx,
            })
            .is_err()
        {
            log::error!("Failed to send command: session coordinator is gone");
            return;
        }

        let _ = res_rx.await;
    }

    /// Unregister message sender and notify the session's remaining
    /// connections.
    pub fn disconnect(&self, conn: ConnId) {
        let _ = self.cmd_tx.send(Command::Disconnect { conn });
    }

    /// Whether the coordinator behind this handle has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    const EVICTION: Duration = Duration::from_secs(600);

    fn session(id: &str) -> SessionId {
        SessionId::parse(id).expect("valid session id")
    }

    async fn spawn_session(session_id: &SessionId, db: &SessionDb) -> SessionServerHandle {
        let (server, handle) = SessionServer::new(session_id.clone(), db.clone(), EVICTION)
            .await
            .expect("coordinator");
        tokio::spawn(server.run());
        handle
    }

    async fn join(handle: &SessionServerHandle) -> (ConnId, UnboundedReceiver<Msg>) {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let conn_id = handle.connect(conn_tx).await.expect("connect");
        (conn_id, conn_rx)
    }

    async fn next_frame(rx: &mut UnboundedReceiver<Msg>) -> Value {
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame within timeout")
            .expect("connection still open");
        serde_json::from_str(&msg).expect("valid json frame")
    }

    fn check_roll(hope: i64, fear: i64) -> String {
        json!({
            "type": "ROLL",
            "rollType": "check",
            "hopeValue": hope,
            "fearValue": fear,
            "modifier": 0,
        })
        .to_string()
    }

    #[tokio::test]
    async fn two_observers_see_rolls_in_identical_commit_order() {
        let db = SessionDb::open_in_memory().unwrap();
        let session_id = session("AB12CD");
        let handle = spawn_session(&session_id, &db).await;

        let (one, mut rx_one) = join(&handle).await;
        let (two, mut rx_two) = join(&handle).await;
        let (_three, mut rx_three) = join(&handle).await;

        // drain the welcome + join notifications
        assert_eq!(next_frame(&mut rx_one).await["type"], "WELCOME");
        assert_eq!(next_frame(&mut rx_one).await["type"], "PLAYER_JOINED");
        assert_eq!(next_frame(&mut rx_one).await["type"], "PLAYER_JOINED");
        assert_eq!(next_frame(&mut rx_two).await["type"], "WELCOME");
        assert_eq!(next_frame(&mut rx_two).await["type"], "PLAYER_JOINED");
        assert_eq!(next_frame(&mut rx_three).await["type"], "WELCOME");

        handle.send_message(one, check_roll(8, 7)).await;
        handle.send_message(two, check_roll(3, 9)).await;
        handle.send_message(one, check_roll(5, 5)).await;

        let mut three_ids = vec![];
        for _ in 0..3 {
            let frame = next_frame(&mut rx_three).await;
            assert_eq!(frame["type"], "ROLL_RESULT");
            three_ids.push(frame["record"]["id"].as_i64().unwrap());
        }
        assert_eq!(three_ids, vec![1, 2, 3]);

        // the other observers skip their own rolls but agree on the order
        let frame = next_frame(&mut rx_one).await;
        assert_eq!(frame["record"]["id"], 2);
        let first = next_frame(&mut rx_two).await;
        let second = next_frame(&mut rx_two).await;
        assert_eq!(first["record"]["id"], 1);
        assert_eq!(second["record"]["id"], 3);
    }

    #[tokio::test]
    async fn check_roll_scenario_reaches_other_connection_with_total_fifteen() {
        let db = SessionDb::open_in_memory().unwrap();
        let session_id = session("AB12CD");
        let handle = spawn_session(&session_id, &db).await;

        let (one, mut rx_one) = join(&handle).await;
        let (_two, mut rx_two) = join(&handle).await;
        assert_eq!(next_frame(&mut rx_one).await["type"], "WELCOME");
        assert_eq!(next_frame(&mut rx_one).await["type"], "PLAYER_JOINED");
        assert_eq!(next_frame(&mut rx_two).await["type"], "WELCOME");

        handle.send_message(one, check_roll(8, 7)).await;

        let result = next_frame(&mut rx_two).await;
        assert_eq!(result["type"], "ROLL_RESULT");
        assert_eq!(result["record"]["total"], 15);
        let broadcast_id = result["record"]["id"].as_i64().unwrap();

        // a history fetch returns the same record id
        handle
            .send_message(one, json!({"type": "GET_HISTORY"}).to_string())
            .await;
        let history = next_frame(&mut rx_one).await;
        assert_eq!(history["type"], "HISTORY");
        assert_eq!(history["records"][0]["id"].as_i64().unwrap(), broadcast_id);
        assert_eq!(history["records"][0]["total"], 15);
    }

    #[tokio::test]
    async fn late_joiner_replays_history_before_new_broadcasts() {
        let db = SessionDb::open_in_memory().unwrap();
        let session_id = session("EF34GH");
        let handle = spawn_session(&session_id, &db).await;

        let (one, mut rx_one) = join(&handle).await;
        assert_eq!(next_frame(&mut rx_one).await["type"], "WELCOME");
        handle.send_message(one, check_roll(4, 2)).await;
        handle.send_message(one, check_roll(6, 1)).await;

        let (_two, mut rx_two) = join(&handle).await;
        handle.send_message(one, check_roll(9, 3)).await;

        let welcome = next_frame(&mut rx_two).await;
        assert_eq!(welcome["type"], "WELCOME");
        let replay: Vec<i64> = welcome["recentRolls"]
            .as_array()
            .unwrap()
            .iter()
            .map(|record| record["id"].as_i64().unwrap())
            .collect();
        assert_eq!(replay, vec![1, 2]);

        let live = next_frame(&mut rx_two).await;
        assert_eq!(live["type"], "ROLL_RESULT");
        assert_eq!(live["record"]["id"], 3);
    }

    #[tokio::test]
    async fn session_state_survives_coordinator_restart() {
        let db = SessionDb::open_in_memory().unwrap();
        let session_id = session("IJ56KL");

        let handle = spawn_session(&session_id, &db).await;
        let (one, mut rx_one) = join(&handle).await;
        assert_eq!(next_frame(&mut rx_one).await["type"], "WELCOME");
        handle
            .send_message(one, json!({"type": "JOIN", "playerName": "Rowan"}).to_string())
            .await;
        handle.send_message(one, check_roll(8, 7)).await;
        handle.shutdown();

        // a fresh coordinator over the same store rehydrates roster and log
        let handle = spawn_session(&session_id, &db).await;
        let (_conn, mut rx) = join(&handle).await;
        let welcome = next_frame(&mut rx).await;

        assert_eq!(welcome["type"], "WELCOME");
        assert_eq!(welcome["recentRolls"][0]["id"], 1);
        assert_eq!(welcome["recentRolls"][0]["playerName"], "Rowan");
        // previously active players resolve as already inactive: the live
        // roster contains only the new connection
        assert_eq!(welcome["roster"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_payload_yields_error_and_connection_stays_joined() {
        let db = SessionDb::open_in_memory().unwrap();
        let session_id = session("MN78OP");
        let handle = spawn_session(&session_id, &db).await;

        let (one, mut rx_one) = join(&handle).await;
        assert_eq!(next_frame(&mut rx_one).await["type"], "WELCOME");

        handle
            .send_message(
                one,
                json!({"type": "ROLL", "rollType": "check", "hopeValue": 8}).to_string(),
            )
            .await;

        let error = next_frame(&mut rx_one).await;
        assert_eq!(error["type"], "ERROR");

        // still joined: a corrected roll commits and a history fetch sees it
        handle.send_message(one, check_roll(8, 7)).await;
        handle
            .send_message(one, json!({"type": "GET_HISTORY"}).to_string())
            .await;
        let history = next_frame(&mut rx_one).await;
        assert_eq!(history["type"], "HISTORY");
        assert_eq!(history["records"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_message_type_does_not_close_the_connection() {
        let db = SessionDb::open_in_memory().unwrap();
        let session_id = session("QR90ST");
        let handle = spawn_session(&session_id, &db).await;

        let (one, mut rx_one) = join(&handle).await;
        assert_eq!(next_frame(&mut rx_one).await["type"], "WELCOME");

        handle
            .send_message(one, json!({"type": "DANCE"}).to_string())
            .await;
        let error = next_frame(&mut rx_one).await;
        assert_eq!(error["type"], "ERROR");
        assert_eq!(error["message"], "Invalid message type");

        handle
            .send_message(one, json!({"type": "PING"}).to_string())
            .await;
        assert_eq!(next_frame(&mut rx_one).await["type"], "PONG");
    }

    #[tokio::test]
    async fn leave_drops_the_connection_and_notifies_peers() {
        let db = SessionDb::open_in_memory().unwrap();
        let session_id = session("UV12WX");
        let handle = spawn_session(&session_id, &db).await;

        let (one, mut rx_one) = join(&handle).await;
        let (_two, mut rx_two) = join(&handle).await;
        assert_eq!(next_frame(&mut rx_one).await["type"], "WELCOME");
        assert_eq!(next_frame(&mut rx_one).await["type"], "PLAYER_JOINED");
        assert_eq!(next_frame(&mut rx_two).await["type"], "WELCOME");

        handle
            .send_message(one, json!({"type": "LEAVE"}).to_string())
            .await;

        let left = next_frame(&mut rx_two).await;
        assert_eq!(left["type"], "PLAYER_LEFT");

        // the leaver sees the notification too, then its sender is dropped
        assert_eq!(next_frame(&mut rx_one).await["type"], "PLAYER_LEFT");
        assert!(rx_one.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_coordinator_evicts_itself() {
        let db = SessionDb::open_in_memory().unwrap();
        let session_id = session("YZ34AB");

        let (server, handle) =
            SessionServer::new(session_id, db, Duration::from_millis(50)).await.unwrap();
        tokio::spawn(server.run());

        let (conn_tx, _conn_rx) = mpsc::unbounded_channel();
        let conn_id = handle.connect(conn_tx).await.expect("connect");
        assert!(!handle.is_closed());

        handle.disconnect(conn_id);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(handle.is_closed());
    }
}
