//! WebSocket transport
//!
//! `GET /bridge` upgrades to a socket carrying JSON text frames. Each frame
//! from the client is a command, optionally with an `id` that is echoed in
//! its reply. Engine events are pushed on the same socket as they happen.
//! `GET /health` reports liveness.

use crate::command::Command;
use crate::engine::BridgeHandle;
use crate::response::Response;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use trawl_core::ErrorCode;

/// Frames queued for one client before its writers wait.
const OUTBOX: usize = 1024;

pub fn router(handle: BridgeHandle) -> Router {
    Router::new()
        .route("/bridge", get(upgrade))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

/// Serve the bridge until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, handle: BridgeHandle, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "bridge listening");
    axum::serve(listener, router(handle)).with_graceful_shutdown(shutdown).await
}

async fn health(State(handle): State<BridgeHandle>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "subscribers": handle.subscriber_count(),
    }))
}

async fn upgrade(ws: WebSocketUpgrade, State(handle): State<BridgeHandle>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session(socket, handle))
}

/// Decode one text frame, run it and build the reply.
pub async fn answer(handle: &BridgeHandle, text: &str) -> Response {
    let mut value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => return Response::error(ErrorCode::InvalidInput, format!("not JSON: {err}")),
    };
    let id = value.as_object_mut().and_then(|object| object.remove("id"));
    let response = match Command::from_value(value) {
        Ok(command) => handle.call(command).await,
        Err(err) => Response::error(ErrorCode::InvalidInput, format!("bad command: {err}")),
    };
    match id {
        Some(id) => response.with_id(id),
        None => response,
    }
}

async fn session(socket: WebSocket, handle: BridgeHandle) {
    let (mut sink, mut stream) = socket.split();
    let (outbox, mut pending) = mpsc::channel::<String>(OUTBOX);
    let mut events = handle.subscribe();
    tracing::info!("bridge client connected");

    let writer = tokio::spawn(async move {
        while let Some(text) = pending.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let pusher = {
        let outbox = outbox.clone();
        tokio::spawn(async move {
            loop {
                let text = match events.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(err) => {
                            tracing::warn!(event = event.name(), error = %err, "cannot encode event");
                            continue;
                        }
                    },
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "bridge client fell behind");
                        json!({"event": "events-lagged", "data": {"missed": missed}}).to_string()
                    }
                    Err(RecvError::Closed) => break,
                };
                if outbox.send(text).await.is_err() {
                    break;
                }
            }
        })
    };

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                tracing::debug!(error = %err, "bridge socket error");
                break;
            }
        };
        let handle = handle.clone();
        let outbox = outbox.clone();
        tokio::spawn(async move {
            let reply = answer(&handle, &text).await;
            let _ = outbox.send(reply.into_value().to_string()).await;
        });
    }

    pusher.abort();
    writer.abort();
    tracing::info!("bridge client disconnected");
}
