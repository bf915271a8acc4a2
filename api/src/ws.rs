// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The multiplexed websocket: one connection, topic subscriptions, events
//! fanned out from the supervisor's broadcast via the RPC event stream.

use crate::routes::authorize;
use crate::ApiState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;
use mgmt::RpcClient;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

pub async fn upgrade(
    State(state): State<Arc<ApiState>>,
    jar: CookieJar,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(denied) = authorize(&state.auth, &jar, &headers) {
        return denied;
    }
    ws.on_upgrade(move |socket| serve(state, socket))
}

async fn serve(state: Arc<ApiState>, mut socket: WebSocket) {
    // First client frame names the topics; absence means everything.
    let topics: Vec<String> = match socket.recv().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| {
                v["subscribe"].as_array().map(|array| {
                    array
                        .iter()
                        .filter_map(|t| t.as_str().map(str::to_string))
                        .collect()
                })
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    let client = match RpcClient::connect(&state.socket_path).await {
        Ok(client) => client,
        Err(error) => {
            debug!(%error, "ws: supervisor unreachable");
            let _ = socket
                .send(Message::Text(
                    json!({ "error": { "kind": "transient-io" } }).to_string().into(),
                ))
                .await;
            return;
        }
    };
    let mut events = match client.subscribe(topics).await {
        Ok(events) => events,
        Err(_) => return,
    };

    loop {
        tokio::select! {
            event = events.next() => {
                let Ok(event) = event else { return };
                let frame = event.to_string();
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    return;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // Pings and topic changes are tolerated; a close or a
                    // dropped peer ends the stream.
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(_)) => return,
                    _ => {}
                }
            }
        }
    }
}
