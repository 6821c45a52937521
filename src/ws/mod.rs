//! Live tally feed for one room over WebSocket

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::error::RoomResult;
use crate::protocol::ServerMessage;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub room: String,
}

/// Current room view and tally, sent on connect and after lagging
pub async fn room_snapshot(state: &AppState, code: &str) -> RoomResult<ServerMessage> {
    let room = state.get_room(code).await?;
    let words = state.list_words(code).await?;
    Ok(ServerMessage::Welcome {
        room,
        words,
        server_now: chrono::Utc::now().to_rfc3339(),
    })
}

/// WebSocket upgrade handler. Unknown rooms are rejected before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let room_code = match state.resolve_room(&params.room).await {
        Ok(room) => room.record.code,
        Err(e) => return e.into_response(),
    };

    tracing::info!(room_code = %room_code, "Live feed connection request");
    ws.on_upgrade(move |socket| handle_socket(socket, room_code, state))
}

async fn send_json(sender: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize live feed message");
            true
        }
    }
}

async fn send_snapshot(
    sender: &mut SplitSink<WebSocket, Message>,
    state: &AppState,
    room_code: &str,
) -> bool {
    let msg = room_snapshot(state, room_code)
        .await
        .unwrap_or_else(|e| ServerMessage::Error {
            code: e.code().to_string(),
            msg: e.to_string(),
        });
    send_json(sender, &msg).await
}

async fn handle_socket(socket: WebSocket, room_code: String, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe first so nothing published during the snapshot read is lost
    let mut updates = state.broadcast.subscribe();
    if !send_snapshot(&mut sender, &state, &room_code).await {
        return;
    }

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(msg) if msg.room_code() == Some(room_code.as_str()) => {
                    let deleted = matches!(msg, ServerMessage::RoomDeleted { .. });
                    if !send_json(&mut sender, &msg).await || deleted {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(room_code = %room_code, skipped, "Live feed lagged, resending snapshot");
                    if !send_snapshot(&mut sender, &state, &room_code).await {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },

            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(data))) => {
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                // The feed is read-only
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "WebSocket error");
                    break;
                }
            },
        }
    }

    tracing::info!(room_code = %room_code, "Live feed connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RoomError;
    use crate::protocol::{CreateRoomRequest, JoinRoomRequest, SubmitWordRequest};

    #[tokio::test]
    async fn test_room_snapshot() {
        let state = AppState::in_memory();
        let code = state
            .create_room(
                "owner-1",
                CreateRoomRequest {
                    title: "Retro".to_string(),
                    requires_confirmation: false,
                    time_limit: None,
                },
            )
            .await
            .unwrap()
            .room_code;
        for token in ["tok-1", "tok-2"] {
            let joined = state
                .join_room(JoinRoomRequest {
                    room_code: code.clone(),
                    participant_name: None,
                    identity_token: token.to_string(),
                })
                .await
                .unwrap();
            if token == "tok-1" {
                state
                    .submit_word(SubmitWordRequest {
                        participant_id: joined.participant_id,
                        text: "Calm".to_string(),
                    })
                    .await
                    .unwrap();
            }
        }

        match room_snapshot(&state, &code).await.unwrap() {
            ServerMessage::Welcome { room, words, .. } => {
                assert_eq!(room.room_code, code);
                assert_eq!(room.participant_count, 2);
                assert_eq!(words.len(), 1);
                assert_eq!(words[0].display_text, "Calm");
            }
            other => panic!("unexpected message {other:?}"),
        }

        assert!(matches!(
            room_snapshot(&state, "NOPE00").await,
            Err(RoomError::RoomNotFound)
        ));
    }
}
