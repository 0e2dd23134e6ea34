//! JSON-over-WebSocket gateway onto [`SessionManager`].
//!
//! A client must open with `hello`, which carries its locally stored profile.
//! Every later frame is one command; every session event is one frame back.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::engine::events::SessionEvent;
use crate::engine::identity::{LocalProfile, MemoryProfileStore};
use crate::engine::session::SessionManager;
use crate::error::SessionResult;
use crate::store::StoreConnection;

use super::app_state::AppState;

/// A frame sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Hello {
        #[serde(default)]
        uid: Option<String>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        saved_servers: Vec<String>,
    },
    JoinServer {
        server_id: String,
    },
    LeaveServer,
    CreateServer {
        server_id: String,
    },
    CreateChannel {
        name: String,
    },
    SwitchChannel {
        channel_id: String,
    },
    SendMessage {
        text: String,
    },
    SetName {
        username: String,
    },
}

fn protocol_error(code: &str, message: impl Into<String>) -> SessionEvent {
    SessionEvent::Error {
        code: code.to_string(),
        message: message.into(),
    }
}

/// Decode one text frame, or produce the error event to send back.
pub fn parse_command(text: &str) -> Result<ClientCommand, SessionEvent> {
    serde_json::from_str(text).map_err(|e| protocol_error("bad_request", e.to_string()))
}

/// Run one post-hello command against the session.
pub fn apply_command(session: &mut SessionManager, command: ClientCommand) -> SessionResult<()> {
    match command {
        ClientCommand::Hello { .. } => {
            debug!(uid = %session.uid(), "ignoring repeated hello");
            Ok(())
        }
        ClientCommand::JoinServer { server_id } => session.join_server(&server_id),
        ClientCommand::LeaveServer => session.leave_server(),
        ClientCommand::CreateServer { server_id } => session.create_server(&server_id),
        ClientCommand::CreateChannel { name } => session.create_channel(&name).map(|_| ()),
        ClientCommand::SwitchChannel { channel_id } => session.switch_channel(&channel_id),
        ClientCommand::SendMessage { text } => session.post_message(&text).map(|_| ()),
        ClientCommand::SetName { username } => session.set_display_name(&username).map(|_| ()),
    }
}

/// WebSocket upgrade handler.
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Outbound frames, from the hello phase and the session alike
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let write_handle = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!("failed to serialize event: {e}");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let Some((mut session, mut events_rx)) = await_hello(&mut ws_rx, &state, &out_tx).await
    else {
        drop(out_tx);
        let _ = write_handle.await;
        return;
    };
    let conn = session.connection().clone();
    info!(uid = %session.uid(), connection = %conn.id(), "gateway session opened");

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let result = match parse_command(text.as_str()) {
                    Ok(command) => apply_command(&mut session, command)
                        .map_err(|e| SessionEvent::error(&e)),
                    Err(event) => Err(event),
                };
                if let Err(event) = result
                    && out_tx.send(event).is_err()
                {
                    break;
                }
            }
            Some(event) = session.next_store_event() => {
                session.handle_store_event(event);
            }
            Some(event) = events_rx.recv() => {
                if out_tx.send(event).is_err() {
                    break;
                }
            }
        }
    }

    if let Err(e) = session.shutdown() {
        debug!("session shutdown: {e}");
    }
    drop(session);
    conn.disconnect();
    info!(connection = %conn.id(), "gateway session closed");

    drop(out_tx);
    let _ = write_handle.await;
}

/// Read frames until a `hello` arrives, then open the session.
async fn await_hello(
    ws_rx: &mut SplitStream<WebSocket>,
    state: &AppState,
    out_tx: &mpsc::UnboundedSender<SessionEvent>,
) -> Option<(SessionManager, mpsc::UnboundedReceiver<SessionEvent>)> {
    while let Some(Ok(frame)) = ws_rx.next().await {
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => return None,
            _ => continue,
        };
        match parse_command(text.as_str()) {
            Ok(ClientCommand::Hello {
                uid,
                username,
                saved_servers,
            }) => {
                let profile = LocalProfile {
                    uid,
                    username,
                    saved_servers,
                };
                let conn = Arc::new(StoreConnection::open(state.store.clone()));
                return match SessionManager::new(
                    conn,
                    Box::new(MemoryProfileStore::new(profile)),
                    state.settings.clone(),
                ) {
                    Ok(opened) => Some(opened),
                    Err(e) => {
                        let _ = out_tx.send(SessionEvent::error(&e));
                        None
                    }
                };
            }
            Ok(_) => {
                let _ = out_tx.send(protocol_error("hello_required", "send hello first"));
            }
            Err(event) => {
                let _ = out_tx.send(event);
            }
        }
    }
    None
}
