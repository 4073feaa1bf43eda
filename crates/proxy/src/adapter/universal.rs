//! Routing between platform adapters

use super::{Adapter, CLOSED_CAPACITY, ClientToken, TargetInfo};
use async_trait::async_trait;
use devbridge_core::error::TransportError;
use devbridge_core::{Result, ToolsSink};
use futures_util::future::join_all;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Dispatches `<adapter>/<target>` ids to the adapter owning the prefix
pub struct UniversalAdapter {
    adapters: Vec<Arc<dyn Adapter>>,
    closed: broadcast::Sender<String>,
    relays: Mutex<Vec<JoinHandle<()>>>,
}

impl UniversalAdapter {
    pub fn new(adapters: Vec<Arc<dyn Adapter>>) -> Self {
        let (closed, _) = broadcast::channel(CLOSED_CAPACITY);
        Self {
            adapters,
            closed,
            relays: Mutex::new(Vec::new()),
        }
    }

    pub fn adapters(&self) -> &[Arc<dyn Adapter>] {
        &self.adapters
    }

    /// Split a routed id into its adapter and the adapter-local id
    pub fn resolve<'a>(&self, target_id: &'a str) -> Option<(&Arc<dyn Adapter>, &'a str)> {
        let (prefix, rest) = target_id.trim_start_matches('/').split_once('/')?;
        if rest.is_empty() {
            return None;
        }
        self.adapters
            .iter()
            .find(|adapter| adapter.id() == prefix)
            .map(|adapter| (adapter, rest))
    }

    fn route<'a>(&self, target_id: &'a str) -> Result<(&Arc<dyn Adapter>, &'a str)> {
        self.resolve(target_id).ok_or_else(|| {
            TransportError::InvalidAddress {
                address: target_id.to_string(),
            }
            .into()
        })
    }
}

#[async_trait]
impl Adapter for UniversalAdapter {
    fn id(&self) -> &str {
        ""
    }

    async fn start(&self) -> Result<()> {
        for adapter in &self.adapters {
            adapter.start().await?;

            let mut closed_rx = adapter.subscribe_socket_closed();
            let closed = self.closed.clone();
            let prefix = adapter.id().to_string();
            let relay = tokio::spawn(async move {
                loop {
                    match closed_rx.recv().await {
                        Ok(id) => {
                            let _ = closed.send(format!("{}/{}", prefix, id));
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(adapter = %prefix, missed, "Missed socket-closed notifications");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            if let Ok(mut relays) = self.relays.lock() {
                relays.push(relay);
            }
        }
        Ok(())
    }

    async fn stop(&self) {
        if let Ok(mut relays) = self.relays.lock() {
            for relay in relays.drain(..) {
                relay.abort();
            }
        }
        for adapter in &self.adapters {
            adapter.stop().await;
        }
    }

    async fn get_targets(&self) -> Vec<TargetInfo> {
        let per_adapter = join_all(self.adapters.iter().map(|adapter| async move {
            adapter
                .get_targets()
                .await
                .into_iter()
                .map(|mut info| {
                    info.id = format!("{}/{}", adapter.id(), info.id);
                    info
                })
                .collect::<Vec<_>>()
        }))
        .await;
        per_adapter.into_iter().flatten().collect()
    }

    async fn connect_to(&self, target_id: &str, tools: ToolsSink) -> Result<ClientToken> {
        let (adapter, id) = self.route(target_id)?;
        debug!(adapter = adapter.id(), target_id = id, "Routing client");
        adapter.connect_to(id, tools).await
    }

    async fn forward_to(&self, target_id: &str, message: String) {
        match self.resolve(target_id) {
            Some((adapter, id)) => adapter.forward_to(id, message).await,
            None => warn!(target_id, "No adapter for message"),
        }
    }

    async fn close_connection_to(&self, target_id: &str, client: ClientToken) {
        if let Some((adapter, id)) = self.resolve(target_id) {
            adapter.close_connection_to(id, client).await;
        }
    }

    async fn force_refresh(&self) {
        join_all(self.adapters.iter().map(|adapter| adapter.force_refresh())).await;
    }

    fn subscribe_socket_closed(&self) -> broadcast::Receiver<String> {
        self.closed.subscribe()
    }
}
