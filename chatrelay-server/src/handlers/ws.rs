//! WebSocket transport for relay sessions.
//!
//! One socket maps to one registered session. Inbound frames are handed to
//! the session machine in arrival order; outbound events flow through the
//! session's queue to a dedicated writer task.

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};

use shared::models::OutboundEvent;

use crate::{app_state::AppState, session::registry::SessionHandle};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (tx, rx) = mpsc::channel(state.outbound_buffer);
    let session = state.registry.create(tx);
    metrics::counter!("chatrelay_ws_connections_total").increment(1);

    let span = info_span!("ws_connection", connection = %session.id());
    async {
        info!("connection opened");
        let (sink, stream) = socket.split();
        let mut writer = tokio::spawn(forward_events(sink, rx).in_current_span());

        tokio::select! {
            _ = &mut writer => debug!("outbound side closed"),
            () = read_frames(stream, &state, &session) => {}
        }

        // Cancels any in-flight turn; the close and error paths both land here.
        state.registry.remove(session.id());
        writer.abort();
        info!("connection closed");
    }
    .instrument(span)
    .await;
}

async fn read_frames(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    session: &Arc<SessionHandle>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                state.machine.handle_text(session, text.as_str()).await;
            }
            Ok(Message::Binary(bytes)) => {
                let text = String::from_utf8_lossy(&bytes);
                state.machine.handle_text(session, &text).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(err) => {
                warn!(error = %err, "websocket transport error");
                break;
            }
        }
    }
}

async fn forward_events(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundEvent>,
) {
    while let Some(event) = rx.recv().await {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(event = event.name(), error = %err, "failed to encode event");
                continue;
            }
        };
        if sink.send(Message::Text(payload.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
