//! WebSocket endpoint: one connection per browser client, any number of
//! per-agent subscriptions multiplexed over it.
//!
//! Architecture mirrors the session pool's fan-out: a central writer task
//! drains an mpsc queue onto the socket, so pool subscriber callbacks and
//! server broadcasts never block on a slow client; the read loop parses and
//! dispatches client frames and tears every subscription down on close.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use libptyhub::SubscriberId;
use ptyhub_protocol::{
    ClientFrame, MAX_CLIENTS, MAX_WS_PAYLOAD_BYTES, ServerFrame, parse_client_frame,
};

use crate::auth::{self, TokenQuery};
use crate::projection;
use crate::server::AppState;

/// Outbound queue depth per client before frames are dropped.
const CLIENT_QUEUE_DEPTH: usize = 256;

/// One connected client as seen by the broadcast side.
pub struct ClientHandle {
    pub tx: mpsc::Sender<Message>,
    pub subscriptions: Arc<Mutex<HashMap<String, SubscriberId>>>,
}

/// Releases the client's capacity slot even when the upgrade callback is
/// dropped before running.
struct ClientSlot {
    state: Arc<AppState>,
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        self.state.client_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// `GET /ws` — upgrade guard: capacity first, then authentication.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let previous = state.client_count.fetch_add(1, Ordering::SeqCst);
    if previous >= MAX_CLIENTS {
        state.client_count.fetch_sub(1, Ordering::SeqCst);
        return (StatusCode::TOO_MANY_REQUESTS, "Too many connections").into_response();
    }
    let slot = ClientSlot {
        state: Arc::clone(&state),
    };

    if !auth::request_authorized(&state.token, &headers, query.token.as_deref()) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    ws.max_message_size(MAX_WS_PAYLOAD_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, slot))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, slot: ClientSlot) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed);
    let (mut socket_tx, mut socket_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_QUEUE_DEPTH);

    let write_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if socket_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let subscriptions: Arc<Mutex<HashMap<String, SubscriberId>>> =
        Arc::new(Mutex::new(HashMap::new()));
    state
        .clients
        .lock()
        .expect("client registry poisoned")
        .insert(
            client_id,
            ClientHandle {
                tx: tx.clone(),
                subscriptions: Arc::clone(&subscriptions),
            },
        );
    debug!(client_id, "websocket client connected");

    // Every client starts with the current agent list.
    let list = projection::build_agent_list(&state.pool, state.directory.as_ref()).await;
    send_frame(&tx, &ServerFrame::Agents { list }).await;

    loop {
        let message = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            next = socket_rx.next() => match next {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    debug!(client_id, %err, "websocket read error");
                    break;
                }
                None => break,
            },
        };

        match message {
            Message::Text(text) => {
                // Invalid frames are dropped without a reply.
                let Some(frame) = parse_client_frame(&text) else {
                    continue;
                };
                dispatch(frame, &state, &tx, &subscriptions).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Teardown: forget the client, then detach every pool subscription it
    // still holds.
    state
        .clients
        .lock()
        .expect("client registry poisoned")
        .remove(&client_id);
    let drained: Vec<(String, SubscriberId)> = subscriptions
        .lock()
        .expect("subscription map poisoned")
        .drain()
        .collect();
    for (agent_id, subscriber_id) in drained {
        state.pool.unsubscribe(&agent_id, subscriber_id).await;
    }

    drop(tx);
    let _ = write_task.await;
    debug!(client_id, "websocket client disconnected");
    drop(slot);
}

async fn dispatch(
    frame: ClientFrame,
    state: &Arc<AppState>,
    tx: &mpsc::Sender<Message>,
    subscriptions: &Arc<Mutex<HashMap<String, SubscriberId>>>,
) {
    match frame {
        // Session-level failures are swallowed: the agent may simply have
        // exited between frames.
        ClientFrame::Input { agent_id, data } => {
            let _ = state.pool.write(&agent_id, data.as_bytes()).await;
        }
        ClientFrame::Resize {
            agent_id,
            cols,
            rows,
        } => {
            let _ = state.pool.resize(&agent_id, cols, rows).await;
        }
        ClientFrame::Kill { agent_id } => {
            state.pool.kill(&agent_id).await;
        }
        ClientFrame::Subscribe { agent_id } => {
            subscribe(agent_id, state, tx, subscriptions).await;
        }
        ClientFrame::Unsubscribe { agent_id } => {
            let removed = subscriptions
                .lock()
                .expect("subscription map poisoned")
                .remove(&agent_id);
            if let Some(subscriber_id) = removed {
                state.pool.unsubscribe(&agent_id, subscriber_id).await;
            }
        }
    }
}

async fn subscribe(
    agent_id: String,
    state: &Arc<AppState>,
    tx: &mpsc::Sender<Message>,
    subscriptions: &Arc<Mutex<HashMap<String, SubscriberId>>>,
) {
    // Repeat subscriptions are idempotent; the first callback stays.
    if subscriptions
        .lock()
        .expect("subscription map poisoned")
        .contains_key(&agent_id)
    {
        return;
    }

    // Scrollback snapshot first, strictly before any live output frame.
    if let Some(data) = state.pool.scrollback(&agent_id).await {
        let cols = state.pool.cols(&agent_id).await.unwrap_or(80);
        send_frame(
            tx,
            &ServerFrame::Scrollback {
                agent_id: agent_id.clone(),
                data,
                cols,
            },
        )
        .await;
    }

    let callback_tx = tx.clone();
    let callback_agent = agent_id.clone();
    let subscriber_id = state
        .pool
        .subscribe(&agent_id, move |chunk: &str| {
            let frame = ServerFrame::Output {
                agent_id: callback_agent.clone(),
                data: chunk.to_string(),
            };
            if let Ok(json) = serde_json::to_string(&frame) {
                // try_send: a closed or saturated client just misses out.
                let _ = callback_tx.try_send(Message::text(json));
            }
        })
        .await;

    if let Some(subscriber_id) = subscriber_id {
        subscriptions
            .lock()
            .expect("subscription map poisoned")
            .insert(agent_id, subscriber_id);
    }
}

pub(crate) async fn send_frame(tx: &mpsc::Sender<Message>, frame: &ServerFrame) {
    if let Ok(json) = serde_json::to_string(frame) {
        let _ = tx.send(Message::text(json)).await;
    }
}
