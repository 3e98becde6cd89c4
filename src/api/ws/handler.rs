//! WebSocket connection handler

use crate::api::server::AppState;
use crate::types::Alert;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// WebSocket message from server to client
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum WsServerMessage {
    #[serde(rename = "alert")]
    Alert(Box<Alert>),
    #[serde(rename = "connected")]
    Connected { message: String },
    #[serde(rename = "lagged")]
    Lagged { skipped: u64 },
    #[serde(rename = "pong")]
    Pong,
}

/// WebSocket message from client to server
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum WsClientMessage {
    #[serde(rename = "ping")]
    Ping,
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

fn encode(msg: &WsServerMessage) -> Option<Message> {
    serde_json::to_string(msg).ok().map(Message::Text)
}

/// Stream every emitted alert to one client
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut alert_rx = state.runner.subscribe_alerts();
    let (pong_tx, mut pong_rx) = tokio::sync::mpsc::channel::<()>(8);

    info!("WebSocket client connected");

    let connected = WsServerMessage::Connected {
        message: "Connected to Polymarket Sentinel".to_string(),
    };
    if let Some(msg) = encode(&connected) {
        let _ = sender.send(msg).await;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                result = alert_rx.recv() => match result {
                    Ok(alert) => WsServerMessage::Alert(Box::new(alert)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("WebSocket client lagged by {} alerts", skipped);
                        WsServerMessage::Lagged { skipped }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(()) = pong_rx.recv() => WsServerMessage::Pong,
            };
            if let Some(msg) = encode(&msg) {
                if sender.send(msg).await.is_err() {
                    debug!("WebSocket send failed, client disconnected");
                    break;
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    if let Ok(WsClientMessage::Ping) = serde_json::from_str::<WsClientMessage>(&text) {
                        let _ = pong_tx.try_send(());
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket client sent close");
                    break;
                }
                Err(e) => {
                    error!("WebSocket receive error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("WebSocket client disconnected");
}
