//! Subscription Bus websocket upgrade: clients authenticate once, then
//! subscribe/unsubscribe to `book:{symbol}`, `trades:{symbol}`,
//! `orders:{user}`, `balances:{user}` channels and receive
//! `{channel, seq, ts_ns, payload}` frames.
//!
//! One `tokio::select!` loop over the client socket plus one `broadcast`
//! receiver per subscription, generalized from a fixed set of
//! matching-engine receivers to the bus's dynamic per-channel
//! `Bus::subscribe` calls, since this core has an open channel namespace
//! instead of a handful of hardcoded feeds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::AppState;
use crate::metrics;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Auth { token: String },
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage<'a> {
    AuthResult { success: bool, message: Option<&'a str> },
    Subscribed { channel: &'a str },
    Unsubscribed { channel: &'a str },
    Error { code: &'a str, message: &'a str },
    Pong { ts_ns: u64 },
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_nanos() as u64
}

pub async fn ws_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);

    let mut authenticated_user: Option<String> = None;
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();
    metrics::set_ws_connections(1);

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        if sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&text, &state, &mut authenticated_user, &mut forwarders, &out_tx).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "websocket connection error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    for (_, handle) in forwarders.drain() {
        handle.abort();
    }
    metrics::set_ws_connections(0);
}

async fn handle_client_message(
    text: &str,
    state: &Arc<AppState>,
    authenticated_user: &mut Option<String>,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
    out_tx: &mpsc::Sender<Message>,
) {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
    let message = match parsed {
        Ok(m) => m,
        Err(_) => {
            let _ = send_json(out_tx, &ServerMessage::Error {
                code: "BAD_MESSAGE",
                message: "could not parse client message",
            }).await;
            return;
        }
    };

    match message {
        ClientMessage::Auth { token } => match state.auth.verify(&token).await {
            Ok(user) => {
                *authenticated_user = Some(user);
                let _ = send_json(out_tx, &ServerMessage::AuthResult { success: true, message: None }).await;
            }
            Err(_) => {
                let _ = send_json(out_tx, &ServerMessage::AuthResult {
                    success: false,
                    message: Some("invalid token"),
                }).await;
            }
        },
        ClientMessage::Subscribe { channel } => {
            if forwarders.contains_key(&channel) {
                let _ = send_json(out_tx, &ServerMessage::Subscribed { channel: &channel }).await;
                return;
            }
            let caller = authenticated_user.clone().unwrap_or_default();
            match state.bus.subscribe(&channel, &caller, now_ns()) {
                Ok(mut subscription) => {
                    let _ = send_json(out_tx, &ServerMessage::Subscribed { channel: &channel }).await;
                    if let Some(snapshot) = subscription.snapshot.take() {
                        let _ = out_tx
                            .send(Message::Text(serde_json::to_string(&snapshot).expect("frame serializes")))
                            .await;
                    }
                    let forward_tx = out_tx.clone();
                    let forward_channel = channel.clone();
                    let handle = tokio::spawn(async move {
                        loop {
                            match subscription.recv().await {
                                Ok(frame) => {
                                    metrics::record_ws_message_sent(&forward_channel);
                                    let text = serde_json::to_string(&frame).expect("frame serializes");
                                    if forward_tx.send(Message::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_lagged) => {
                                    metrics::record_ws_subscription_lagged(&forward_channel);
                                    let _ = send_json(&forward_tx, &ServerMessage::Error {
                                        code: "LAGGED",
                                        message: "subscription fell behind and was closed",
                                    }).await;
                                    break;
                                }
                            }
                        }
                    });
                    forwarders.insert(channel, handle);
                }
                Err(_) => {
                    let _ = send_json(out_tx, &ServerMessage::Error {
                        code: "SUBSCRIBE_FAILED",
                        message: "unknown or unauthorized channel",
                    }).await;
                }
            }
        }
        ClientMessage::Unsubscribe { channel } => {
            if let Some(handle) = forwarders.remove(&channel) {
                handle.abort();
            }
            let _ = send_json(out_tx, &ServerMessage::Unsubscribed { channel: &channel }).await;
        }
        ClientMessage::Ping => {
            let _ = send_json(out_tx, &ServerMessage::Pong { ts_ns: now_ns() }).await;
        }
    }
}

async fn send_json(out_tx: &mpsc::Sender<Message>, msg: &ServerMessage<'_>) -> Result<(), ()> {
    let text = serde_json::to_string(msg).expect("server message serializes");
    out_tx.send(Message::Text(text)).await.map_err(|_| ())
}
