use crate::{
    controller::SessionEvent,
    overlay::OverlayFrame,
    protocol::Envelope,
    server::SharedState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Json},
};
use futures::StreamExt;
use serde::Serialize;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream, WatchStream};

const OVERLAY_EVENT: &str = "overlay";
const SESSION_EVENT: &str = "session";

pub async fn overlay_snapshot(State(state): State<SharedState>) -> Json<OverlayFrame> {
    Json(state.canvas.snapshot())
}

pub async fn overlay_ws(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| forward_overlay(socket, state))
}

/// Pushes every overlay change and session event to one viewer until it
/// disconnects.
async fn forward_overlay(mut socket: WebSocket, state: SharedState) {
    let mut frames = WatchStream::new(state.canvas.subscribe());
    let mut events = BroadcastStream::new(state.controller.subscribe_events());

    loop {
        let text = tokio::select! {
            frame = frames.next() => match frame {
                Some(frame) => envelope(OVERLAY_EVENT, &frame),
                None => break,
            },
            event = events.next() => match event {
                Some(Ok(event)) => envelope::<SessionEvent>(SESSION_EVENT, &event),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::debug!("Viewer lagged, skipped {} session events", skipped);
                    continue;
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        };

        let Some(text) = text else {
            continue;
        };
        if socket.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    tracing::debug!("Overlay viewer disconnected");
}

fn envelope<T: Serialize>(event: &str, data: &T) -> Option<String> {
    let envelope = Envelope {
        event: event.to_string(),
        data,
    };
    match serde_json::to_string(&envelope) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::warn!("Failed to serialize {} event: {}", event, e);
            None
        }
    }
}
