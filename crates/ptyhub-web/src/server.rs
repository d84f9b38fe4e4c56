//! Server assembly: router, security headers, lifecycle broadcasting, and
//! graceful shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::extract::ws::Message;
use axum::http::{HeaderValue, header};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{error, info};

use libptyhub::{AgentDirectory, LifecycleEvent, ListenerId, SessionPool, SubscriberId};
use ptyhub_protocol::{AgentRunState, ServerFrame};

use crate::assets::{self, StaticAssets};
use crate::auth::AuthToken;
use crate::netinfo::{self, AdvertisedUrls};
use crate::projection;
use crate::routes;
use crate::ws::{self, ClientHandle};

pub const DEFAULT_PORT: u16 = 7777;

/// Delay between an exit event and the refreshed agent-list broadcast; the
/// pool removes the session after the event, and the new list must not be
/// built before that removal lands.
const AGENTS_REBROADCAST_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RemoteServerConfig {
    pub port: u16,
    pub static_dir: PathBuf,
}

impl Default for RemoteServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            static_dir: PathBuf::from("web-dist"),
        }
    }
}

/// Shared state behind every handler.
pub struct AppState {
    pub pool: SessionPool,
    pub directory: Arc<dyn AgentDirectory>,
    pub token: AuthToken,
    pub assets: StaticAssets,
    pub clients: Mutex<HashMap<u64, ClientHandle>>,
    pub next_client_id: AtomicU64,
    pub client_count: AtomicUsize,
    pub shutdown: CancellationToken,
}

/// Running server. Dropping the handle leaves the server running; call
/// [`ServerHandle::shutdown`] for an orderly stop.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    pub urls: AdvertisedUrls,
    state: Arc<AppState>,
    listener_id: ListenerId,
    shutdown: CancellationToken,
    serve_task: JoinHandle<()>,
    broadcast_task: JoinHandle<()>,
}

impl ServerHandle {
    /// The access token for this server instance.
    pub fn token(&self) -> &str {
        self.state.token.expose()
    }

    /// Unregister from the event bus, close every client, stop listening.
    /// Resolves only once the HTTP listener has fully closed.
    pub async fn shutdown(self) {
        self.state.pool.events().unsubscribe(self.listener_id);
        {
            let mut clients = self.state.clients.lock().expect("client registry poisoned");
            for (_, client) in clients.drain() {
                let _ = client.tx.try_send(Message::Close(None));
            }
        }
        self.shutdown.cancel();
        let _ = self.serve_task.await;
        let _ = self.broadcast_task.await;
        info!("remote access server stopped");
    }
}

/// Bind the listener, wire the lifecycle listeners, and start serving.
pub async fn start(
    config: RemoteServerConfig,
    pool: SessionPool,
    directory: Arc<dyn AgentDirectory>,
) -> anyhow::Result<ServerHandle> {
    let token = AuthToken::generate();
    let urls = netinfo::discover(config.port, token.expose());
    let shutdown = CancellationToken::new();

    let state = Arc::new(AppState {
        pool: pool.clone(),
        directory,
        token,
        assets: StaticAssets::new(config.static_dir),
        clients: Mutex::new(HashMap::new()),
        next_client_id: AtomicU64::new(1),
        client_count: AtomicUsize::new(0),
        shutdown: shutdown.clone(),
    });

    // Lifecycle events hop from the bus (synchronous listener context) onto
    // a channel drained by the broadcast task.
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let listener_id = pool.events().subscribe(move |event| {
        let _ = event_tx.send(event.clone());
    });
    let broadcast_task = tokio::spawn(broadcast_loop(Arc::clone(&state), event_rx));

    let app = Router::new()
        .route("/api/agents", get(routes::list_agents))
        .route("/api/agents/{id}", get(routes::agent_detail))
        .route("/api", get(routes::api_not_found))
        .route("/api/{*rest}", get(routes::api_not_found))
        .route("/ws", get(ws::ws_handler))
        .fallback(assets::serve_spa)
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .with_state(Arc::clone(&state));

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind 0.0.0.0:{}", config.port))?;
    let local_addr = listener.local_addr().context("failed to read local addr")?;
    info!(%local_addr, "remote access server listening");

    let serve_shutdown = shutdown.clone();
    let serve_task = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
            .await;
        if let Err(err) = result {
            error!(%err, "http server terminated abnormally");
        }
    });

    Ok(ServerHandle {
        local_addr,
        urls,
        state,
        listener_id,
        shutdown,
        serve_task,
        broadcast_task,
    })
}

async fn broadcast_loop(
    state: Arc<AppState>,
    mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            maybe = events.recv() => {
                let Some(event) = maybe else { break };
                event
            }
        };

        match event {
            LifecycleEvent::Spawn { .. } | LifecycleEvent::ListChanged => {
                broadcast_agents(&state).await;
            }
            LifecycleEvent::Exit { agent_id, exit } => {
                // The exited status goes out first, so every client sees it
                // before any agent list that omits the agent.
                broadcast_frame(
                    &state,
                    &ServerFrame::Status {
                        agent_id: agent_id.clone(),
                        status: AgentRunState::Exited,
                        exit_code: exit.exit_code,
                    },
                );
                prune_subscriptions(&state, &agent_id).await;

                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    tokio::time::sleep(AGENTS_REBROADCAST_DELAY).await;
                    broadcast_agents(&state).await;
                });
            }
        }
    }
}

async fn broadcast_agents(state: &AppState) {
    let list = projection::build_agent_list(&state.pool, state.directory.as_ref()).await;
    broadcast_frame(state, &ServerFrame::Agents { list });
}

fn broadcast_frame(state: &AppState, frame: &ServerFrame) {
    let Ok(json) = serde_json::to_string(frame) else {
        return;
    };
    let clients = state.clients.lock().expect("client registry poisoned");
    for client in clients.values() {
        // Closed or saturated clients are skipped silently.
        let _ = client.tx.try_send(Message::text(json.clone()));
    }
}

/// Drop every client's subscription entry for an exited agent.
async fn prune_subscriptions(state: &AppState, agent_id: &str) {
    let stale: Vec<SubscriberId> = {
        let clients = state.clients.lock().expect("client registry poisoned");
        clients
            .values()
            .filter_map(|client| {
                client
                    .subscriptions
                    .lock()
                    .expect("subscription map poisoned")
                    .remove(agent_id)
            })
            .collect()
    };
    for subscriber_id in stale {
        state.pool.unsubscribe(agent_id, subscriber_id).await;
    }
}
