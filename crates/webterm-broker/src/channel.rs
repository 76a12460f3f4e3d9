use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, SessionCommand, SessionStatus};
use crate::models::{ClientEvent, DisconnectReason, ServerEvent};

/// Server→client ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// A peer silent for this long is considered dead.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Drive one browser channel for its whole life: register a session,
/// drain outbound events, parse and dispatch inbound ones, and tear the
/// session down when the socket goes away.
pub async fn handle_socket(broker: std::sync::Arc<Broker>, socket: WebSocket) {
    let socket_id = Uuid::new_v4();
    info!(%socket_id, "terminal channel opened");

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let session = broker.register(socket_id, outbound_tx.clone());

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Outbound drain: serialized events plus periodic pings. Ends when the
    // sink errors or the session's sender side is gone.
    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping.tick().await; // immediate first tick

        loop {
            tokio::select! {
                event = outbound_rx.recv() => {
                    let Some(event) = event else { break };
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(err) => {
                            warn!(%err, "failed to serialize event");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Inbound loop. `timeout` doubles as the heartbeat cutoff: a healthy
    // browser answers the pings above well inside the window.
    loop {
        let message = match timeout(LIVENESS_TIMEOUT, ws_rx.next()).await {
            Err(_) => {
                debug!(%socket_id, "channel silent past liveness window");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(%socket_id, %err, "channel read error");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => dispatch(&session, &outbound_tx, event),
                Err(err) => {
                    let _ = outbound_tx.send(ServerEvent::Error {
                        message: format!("Invalid message: {err}"),
                    });
                }
            },
            Message::Close(_) => break,
            // axum answers pings itself; pongs only refresh the timeout.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {}
        }
    }

    broker.destroy(socket_id, DisconnectReason::ClientDisconnect);
    send_task.abort();
    info!(%socket_id, "terminal channel closed");
}

/// Route one parsed event. Input and resize are gated on the live status
/// here so bytes sent before `terminal:connected` can never be queued up
/// and replayed into a later shell.
fn dispatch(
    session: &crate::broker::SessionHandle,
    outbound: &mpsc::UnboundedSender<ServerEvent>,
    event: ClientEvent,
) {
    match event {
        ClientEvent::Ping => {
            let _ = outbound.send(ServerEvent::Pong);
        }
        ClientEvent::Input { data } => {
            if session.status() == SessionStatus::Connected {
                session.send(SessionCommand::Input(data));
            }
        }
        ClientEvent::Resize {
            cols,
            rows,
            width,
            height,
        } => {
            if session.status() == SessionStatus::Connected && cols > 0 && rows > 0 {
                session.send(SessionCommand::Resize {
                    cols,
                    rows,
                    width,
                    height,
                });
            }
        }
        ClientEvent::Connect(credentials) => {
            session.send(SessionCommand::Connect(credentials));
        }
        ClientEvent::CreateContainer => {
            session.send(SessionCommand::CreateContainer);
        }
        ClientEvent::Disconnect => {
            session.send(SessionCommand::Disconnect);
        }
    }
}
