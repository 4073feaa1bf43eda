//! Outward-facing endpoint for debugger clients
//!
//! Serves the discovery responders over HTTP and accepts WebSocket clients
//! at `/<adapter>/<target>`. Each client is relayed through the adapter
//! until either side goes away; a device-side close also closes the client.

use crate::adapter::Adapter;
use crate::discovery::{DiscoveryCache, VersionInfo};
use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::http::header::HOST;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use devbridge_core::config::ProxyConfig;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
struct AppState {
    adapter: Arc<dyn Adapter>,
    discovery: Arc<DiscoveryCache>,
    default_host: String,
}

/// Proxy server configuration plus the adapter it fronts
pub struct ProxyServer {
    config: ProxyConfig,
    adapter: Arc<dyn Adapter>,
}

/// A server accepting connections in the background
pub struct RunningServer {
    local_addr: SocketAddr,
    adapter: Arc<dyn Adapter>,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<std::io::Result<()>>,
    refresher: JoinHandle<()>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig, adapter: Arc<dyn Adapter>) -> Self {
        Self { config, adapter }
    }

    /// Start the adapter, bind the listener and begin serving
    pub async fn start(self) -> Result<RunningServer> {
        self.adapter
            .start()
            .await
            .context("Failed to start adapters")?;

        let address = self.config.listen_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind proxy to {}", address))?;
        let local_addr = listener.local_addr()?;
        info!("Proxy listening on {}", local_addr);

        let discovery = Arc::new(DiscoveryCache::new(
            self.adapter.clone(),
            self.config.refresh_interval(),
        ));
        let refresher = spawn_refresher(discovery.clone(), self.config.refresh_interval());

        let state = AppState {
            adapter: self.adapter.clone(),
            discovery,
            default_host: local_addr.to_string(),
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, router(state))
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(RunningServer {
            local_addr,
            adapter: self.adapter,
            shutdown: Some(shutdown_tx),
            server,
            refresher,
        })
    }
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(mut self) -> Result<()> {
        info!("Stopping proxy server");
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.refresher.abort();
        self.adapter.stop().await;
        self.server
            .await
            .context("Proxy server task failed")?
            .context("Proxy server failed")
    }
}

/// Keep the discovery snapshot warm so enumerate failures surface promptly
fn spawn_refresher(discovery: Arc<DiscoveryCache>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            discovery.refresh().await;
        }
    })
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/json", get(list_targets))
        .route("/json/list", get(list_targets))
        .route("/json/version", get(version))
        .route("/{adapter}/{*target}", get(attach_client))
        .with_state(state)
}

async fn list_targets(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(&state.default_host);
    Json(state.discovery.targets_for_host(host).await).into_response()
}

async fn version() -> Json<VersionInfo> {
    Json(VersionInfo::default())
}

async fn attach_client(
    State(state): State<AppState>,
    Path((adapter, target)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    let route = format!("{}/{}", adapter, target);
    info!(route = %route, "Debugger client connecting");
    ws.on_upgrade(move |socket| relay_client(socket, state.adapter, route))
}

async fn relay_client(socket: WebSocket, adapter: Arc<dyn Adapter>, route: String) {
    let (mut sink, mut stream) = socket.split();
    let (tools, mut to_client) = mpsc::unbounded_channel::<String>();
    let mut closed = adapter.subscribe_socket_closed();

    let client = match adapter.connect_to(&route, tools).await {
        Ok(client) => client,
        Err(e) => {
            warn!(route = %route, "Failed to attach client: {}", e);
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    let mut device_closed = false;
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    adapter.forward_to(&route, text.as_str().to_owned()).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(route = %route, "Debugger client disconnected");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(route = %route, "Debugger client read failed: {}", e);
                    break;
                }
            },
            outgoing = to_client.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!(route = %route, "Debugger client write failed: {}", e);
                        break;
                    }
                }
                None => {
                    debug!(route = %route, "Session moved to a newer client");
                    break;
                }
            },
            id = closed.recv() => match id {
                Ok(id) if id == route => {
                    device_closed = true;
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    error!(route = %route, missed, "Missed socket-closed notifications");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    if device_closed {
        info!(route = %route, "Device socket closed, closing debugger client");
        while let Ok(text) = to_client.try_recv() {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    } else {
        adapter.close_connection_to(&route, client).await;
    }
}
