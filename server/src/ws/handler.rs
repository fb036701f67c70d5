use std::time::{Duration, Instant};

use actix_ws::Message;
use dicebox_session::models::SessionId;
use futures_util::{
    future::{select, Either},
    StreamExt as _,
};
use tokio::{pin, sync::mpsc, time::interval};

use crate::ws::registry::SessionRegistry;

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Relay frames between one client connection and its session coordinator,
/// respond to ping messages, and monitor connection health to detect network
/// issues and free up resources.
///
/// Any traffic counts as liveness; a connection quiet for longer than the
/// configured client timeout is closed, which the coordinator treats as an
/// implicit leave.
#[allow(clippy::future_not_send)]
pub async fn session_ws(
    registry: SessionRegistry,
    session_id: SessionId,
    mut session: actix_ws::Session,
    mut msg_stream: actix_ws::MessageStream,
) {
    let client_timeout = registry.client_timeout();
    let mut last_heartbeat = Instant::now();
    let mut interval = interval(HEARTBEAT_INTERVAL);

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();

    // registering is retried once: the coordinator can evict itself between
    // resolution and the connect command, in which case the registry replaces
    // it with a fresh instance
    let mut registered = None;
    for _ in 0..2 {
        match registry.get_or_create(&session_id).await {
            Ok(handle) => {
                if let Some(conn_id) = handle.connect(conn_tx.clone()).await {
                    registered = Some((handle, conn_id));
                    break;
                }
            }
            Err(error) => {
                log::error!("Failed to resolve session {session_id}: {error:?}");
                break;
            }
        }
    }

    let Some((server_handle, conn_id)) = registered else {
        let _ = session.close(None).await;
        return;
    };

    log::debug!("Connection {conn_id} joined session {session_id}");

    let close_reason = loop {
        // most of the futures we process need to be stack-pinned to work with select()

        let tick = interval.tick();
        pin!(tick);

        let msg_rx = conn_rx.recv();
        pin!(msg_rx);

        let messages = select(msg_stream.next(), msg_rx);
        pin!(messages);

        match select(messages, tick).await {
            // commands & messages received from client
            Either::Left((Either::Left((Some(Ok(msg)), _)), _)) => match msg {
                Message::Ping(bytes) => {
                    last_heartbeat = Instant::now();
                    if session.pong(&bytes).await.is_err() {
                        break None;
                    }
                }

                Message::Pong(_) => {
                    last_heartbeat = Instant::now();
                }

                Message::Text(text) => {
                    last_heartbeat = Instant::now();
                    server_handle.send_message(conn_id, text.to_string()).await;
                }

                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => {
                        last_heartbeat = Instant::now();
                        server_handle.send_message(conn_id, text).await;
                    }
                    Err(e) => {
                        log::warn!("unexpected binary message: {e:?}");
                    }
                },

                Message::Close(reason) => break reason,

                _ => {
                    break None;
                }
            },

            // client WebSocket stream error
            Either::Left((Either::Left((Some(Err(err)), _)), _)) => {
                log::error!("{err}");
                break None;
            }

            // client WebSocket stream ended
            Either::Left((Either::Left((None, _)), _)) => break None,

            // messages fanned out by the session coordinator
            Either::Left((Either::Right((Some(ws_msg), _)), _)) => {
                if let Err(err) = session.text(ws_msg).await {
                    log::error!("Failed to send text message: {err:?}");
                    break None;
                }
            }

            // the coordinator dropped our sender: explicit LEAVE acknowledged
            // or the session was evicted
            Either::Left((Either::Right((None, _)), _)) => break None,

            // heartbeat interval tick
            Either::Right((_inst, _)) => {
                // if no traffic received recently, close the connection
                if Instant::now().duration_since(last_heartbeat) > client_timeout {
                    log::info!(
                        "client has not sent heartbeat in over {client_timeout:?}; disconnecting"
                    );
                    break None;
                }

                // send heartbeat ping
                let _ = session.ping(b"").await;
            }
        };
    };

    server_handle.disconnect(conn_id);

    // attempt to close connection gracefully
    let _ = session.close(close_reason).await;
}
