//! Controller socket: one `RpcEnvelope` per text frame, responses correlated
//! by request id. Verbs run concurrently, so a slow capture does not block a
//! ping behind it.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tabrelay_core_types::{RpcEnvelope, RpcResponse};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::state::ServeState;

pub(crate) fn router() -> Router<ServeState> {
    Router::new().route("/ws", get(websocket_handler))
}

#[derive(Deserialize)]
struct WsParams {
    caller: Option<String>,
}

async fn websocket_handler(
    State(state): State<ServeState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let caller = params
        .caller
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| format!("anon-{}", Uuid::new_v4()));
    ws.on_upgrade(move |socket| handle_socket(socket, state, caller))
}

async fn handle_socket(socket: WebSocket, state: ServeState, caller: String) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        use futures::SinkExt;
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let welcome = json!({
        "type": "connected",
        "caller": caller,
        "serverVersion": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().timestamp_millis(),
    });
    if out_tx.send(welcome.to_string()).await.is_err() {
        return;
    }

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let envelope = match serde_json::from_str::<RpcEnvelope>(&text) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(target: "ws", %caller, %err, "unparseable controller frame");
                        let response = RpcResponse::err(
                            "unknown",
                            format!("unparseable request: {err}"),
                            "VALIDATION_ERROR",
                        );
                        let _ = out_tx
                            .send(serde_json::to_string(&response).unwrap_or_default())
                            .await;
                        continue;
                    }
                };

                let state = state.clone();
                let caller = caller.clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let response = state.dispatcher.handle(envelope, &caller).await;
                    match serde_json::to_string(&response) {
                        Ok(text) => {
                            let _ = out_tx.send(text).await;
                        }
                        Err(err) => warn!(target: "ws", %err, "failed to encode response"),
                    }
                });
            }
            Ok(Message::Close(frame)) => {
                debug!(target: "ws", %caller, ?frame, "controller disconnected");
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {}
            Err(err) => {
                warn!(target: "ws", %caller, %err, "websocket error");
                break;
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
}
