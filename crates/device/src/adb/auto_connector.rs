//! # ADB auto-connector
//!
//! Polls ADB on a fixed interval because device attach and detach have no
//! reliable push notification. Each tick:
//!
//! 1. diffs attached devices against the previous snapshot,
//! 2. opens reload and debugger tunnels for devices lacking a reload tunnel,
//! 3. diffs the open tunnels, stopping connections for vanished tunnels and
//!    starting a [`DaemonConnection`] for each new reload tunnel,
//! 4. publishes the debugger tunnels as [`DebuggableTarget`]s.
//!
//! Tunnels opened through [`AdbAutoConnector::request_tunnel`] belong to the
//! device's daemon session and are closed when that session stops.

use super::client::DeviceBridge;
use super::connection::{DaemonConnection, DaemonEvent};
use super::tunnel::{Tunnel, TunnelDiff, TunnelSet};
use devbridge_core::config::AdbConfig;
use devbridge_core::error::{BridgeError, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DAEMON_EVENT_CAPACITY: usize = 256;

/// A device whose debugger channel is reachable locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebuggableTarget {
    pub device_id: String,
    /// `localhost:<port>` of the debugger tunnel
    pub address: String,
}

impl From<&Tunnel> for DebuggableTarget {
    fn from(tunnel: &Tunnel) -> Self {
        Self {
            device_id: tunnel.device_id.clone(),
            address: tunnel.local_address(),
        }
    }
}

enum Command {
    RequestTunnel {
        device_id: String,
        device_port: u16,
        reply: oneshot::Sender<Result<u16>>,
    },
    Refresh,
}

/// Result of an `adb forward` issued for a requested tunnel
struct Opened {
    device_id: String,
    device_port: u16,
    session: u64,
    result: Result<u16>,
    reply: oneshot::Sender<Result<u16>>,
}

/// Tunnels requested on behalf of one device's daemon session
#[derive(Debug, Default)]
struct RequestedTunnels {
    /// Bumped whenever the session stops; stale opens are closed on arrival
    session: u64,
    pending: usize,
    local_ports: BTreeSet<u16>,
}

/// Handle to the polling task
#[derive(Debug)]
pub struct AdbAutoConnector {
    commands: mpsc::UnboundedSender<Command>,
    targets: watch::Receiver<Vec<DebuggableTarget>>,
    daemon_events: broadcast::Sender<DaemonEvent>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AdbAutoConnector {
    pub fn start(bridge: Arc<dyn DeviceBridge>, config: AdbConfig) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (targets_tx, targets) = watch::channel(Vec::new());
        let (daemon_events, _) = broadcast::channel(DAEMON_EVENT_CAPACITY);
        let (stop, stop_rx) = watch::channel(false);
        let (daemon_tx, daemon_rx) = mpsc::unbounded_channel();
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();

        let connector = Connector {
            bridge,
            config,
            devices: BTreeSet::new(),
            tunnels: TunnelSet::new(),
            connections: HashMap::new(),
            requested: HashMap::new(),
            targets: targets_tx,
            daemon_events: daemon_events.clone(),
            daemon_tx,
            opened_tx,
        };
        let task = tokio::spawn(connector.run(commands_rx, stop_rx, daemon_rx, opened_rx));

        Self {
            commands,
            targets,
            daemon_events,
            stop,
            task,
        }
    }

    /// Current debuggable targets; changes only when the set changes
    pub fn debuggable_targets(&self) -> watch::Receiver<Vec<DebuggableTarget>> {
        self.targets.clone()
    }

    /// Connect, data and disconnect events from every daemon session
    pub fn subscribe_daemon_events(&self) -> broadcast::Receiver<DaemonEvent> {
        self.daemon_events.subscribe()
    }

    /// Open an extra tunnel owned by the device's daemon session
    pub async fn request_tunnel(&self, device_id: &str, device_port: u16) -> Result<u16> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::RequestTunnel {
                device_id: device_id.to_string(),
                device_port,
                reply,
            })
            .map_err(|_| BridgeError::internal("ADB auto-connector has stopped"))?;
        rx.await
            .map_err(|_| BridgeError::internal("ADB auto-connector has stopped"))?
    }

    /// Run a tick now instead of waiting for the next interval
    pub fn refresh(&self) {
        let _ = self.commands.send(Command::Refresh);
    }

    /// Stop polling, stop every daemon connection and close requested tunnels
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!("ADB auto-connector task failed: {}", e);
        }
    }
}

struct Connector {
    bridge: Arc<dyn DeviceBridge>,
    config: AdbConfig,
    devices: BTreeSet<String>,
    tunnels: TunnelSet,
    connections: HashMap<Tunnel, DaemonConnection>,
    requested: HashMap<String, RequestedTunnels>,
    targets: watch::Sender<Vec<DebuggableTarget>>,
    daemon_events: broadcast::Sender<DaemonEvent>,
    daemon_tx: mpsc::UnboundedSender<DaemonEvent>,
    opened_tx: mpsc::UnboundedSender<Opened>,
}

impl Connector {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut stop: watch::Receiver<bool>,
        mut daemon_rx: mpsc::UnboundedReceiver<DaemonEvent>,
        mut opened_rx: mpsc::UnboundedReceiver<Opened>,
    ) {
        info!(
            reload_port = self.config.reload_device_port,
            debugger_port = self.config.debugger_device_port,
            "ADB auto-connector started"
        );

        'ticks: while !*stop.borrow() {
            self.tick().await;

            let sleep = tokio::time::sleep(self.config.poll_interval());
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    _ = stop.changed() => break 'ticks,
                    Some(command) = commands.recv() => match command {
                        Command::RequestTunnel { device_id, device_port, reply } => {
                            self.request_tunnel(device_id, device_port, reply);
                        }
                        Command::Refresh => break,
                    },
                    Some(event) = daemon_rx.recv() => self.on_daemon_event(event),
                    Some(opened) = opened_rx.recv() => self.on_tunnel_opened(opened),
                }
            }
        }

        self.shutdown(&mut daemon_rx).await;
    }

    async fn tick(&mut self) {
        self.refresh_devices().await;

        let reload_port = self.config.reload_device_port;
        let debugger_port = self.config.debugger_device_port;
        let mut reload = self.query_tunnels(reload_port).await;
        let mut debugger = self.query_tunnels(debugger_port).await;

        let tunnelled: BTreeSet<&str> = reload.iter().map(|t| t.device_id.as_str()).collect();
        let missing: Vec<String> = self
            .devices
            .iter()
            .filter(|id| !tunnelled.contains(id.as_str()))
            .cloned()
            .collect();

        for device_id in missing {
            match self.open_device_tunnels(&device_id).await {
                Ok((reload_tunnel, debugger_tunnel)) => {
                    info!(device_id = %device_id, "Opened {} and {}", reload_tunnel, debugger_tunnel);
                    reload.insert(reload_tunnel);
                    debugger.insert(debugger_tunnel);
                }
                Err(e) => {
                    warn!(device_id = %device_id, category = e.category(), "Failed to open tunnels: {}", e);
                }
            }
        }

        let current: TunnelSet = reload.union(&debugger).cloned().collect();
        let diff = TunnelDiff::between(&self.tunnels, &current);
        self.apply(diff).await;
        self.tunnels = current;

        let published: Vec<DebuggableTarget> = debugger.iter().map(DebuggableTarget::from).collect();
        self.targets.send_if_modified(|targets| {
            if *targets == published {
                return false;
            }
            *targets = published;
            true
        });
    }

    /// A failed listing keeps the previous snapshot
    async fn refresh_devices(&mut self) {
        let current: BTreeSet<String> = match self.bridge.list_devices().await {
            Ok(devices) => devices.into_iter().collect(),
            Err(e) => {
                debug!(category = e.category(), "Failed to list devices: {}", e);
                return;
            }
        };

        for attached in current.difference(&self.devices) {
            info!(device_id = %attached, "Device attached");
        }
        for detached in self.devices.difference(&current) {
            info!(device_id = %detached, "Device detached");
        }
        self.devices = current;
    }

    /// A failed query counts as no tunnels
    async fn query_tunnels(&self, device_port: u16) -> TunnelSet {
        match self.bridge.list_tunnels(device_port).await {
            Ok(tunnels) => tunnels.into_iter().collect(),
            Err(e) => {
                debug!(device_port, category = e.category(), "Failed to list tunnels: {}", e);
                TunnelSet::new()
            }
        }
    }

    async fn open_device_tunnels(&self, device_id: &str) -> Result<(Tunnel, Tunnel)> {
        let reload_port = self.config.reload_device_port;
        let debugger_port = self.config.debugger_device_port;

        let local = self.bridge.open_tunnel(device_id, reload_port, None).await?;
        let reload = Tunnel::new(device_id, local, reload_port);
        let local = self.bridge.open_tunnel(device_id, debugger_port, None).await?;
        let debugger = Tunnel::new(device_id, local, debugger_port);
        Ok((reload, debugger))
    }

    async fn apply(&mut self, diff: TunnelDiff) {
        for tunnel in &diff.removed {
            if let Some(connection) = self.connections.remove(tunnel) {
                info!(tunnel = %tunnel.key(), "Tunnel closed, stopping daemon connection");
                connection.stop().await;
            }
        }

        for tunnel in diff.added {
            if tunnel.device_port != self.config.reload_device_port
                || self.connections.contains_key(&tunnel)
            {
                continue;
            }
            debug!(tunnel = %tunnel.key(), "Starting daemon connection");
            let connection = DaemonConnection::start(
                tunnel.clone(),
                DaemonConnection::reconnect_policy(self.config.reconnect_delay()),
                self.daemon_tx.clone(),
            );
            self.connections.insert(tunnel, connection);
        }
    }

    fn request_tunnel(&mut self, device_id: String, device_port: u16, reply: oneshot::Sender<Result<u16>>) {
        let entry = self.requested.entry(device_id.clone()).or_default();
        entry.pending += 1;
        let session = entry.session;

        let bridge = self.bridge.clone();
        let opened = self.opened_tx.clone();
        tokio::spawn(async move {
            let result = bridge.open_tunnel(&device_id, device_port, None).await;
            let _ = opened.send(Opened {
                device_id,
                device_port,
                session,
                result,
                reply,
            });
        });
    }

    fn on_tunnel_opened(&mut self, opened: Opened) {
        let Opened {
            device_id,
            device_port,
            session,
            result,
            reply,
        } = opened;

        let entry = self.requested.entry(device_id.clone()).or_default();
        entry.pending = entry.pending.saturating_sub(1);

        let result = match result {
            Ok(local_port) if entry.session == session => {
                info!(device_id = %device_id, local_port, device_port, "Opened requested tunnel");
                entry.local_ports.insert(local_port);
                Ok(local_port)
            }
            Ok(local_port) => {
                debug!(device_id = %device_id, local_port, "Daemon session ended before tunnel opened");
                self.close_tunnels(vec![local_port]);
                Err(BridgeError::internal(format!(
                    "Daemon session for {} ended while opening tunnel",
                    device_id
                )))
            }
            Err(e) => Err(e),
        };

        let _ = reply.send(result);
    }

    fn on_daemon_event(&mut self, event: DaemonEvent) {
        if let DaemonEvent::Disconnected { tunnel, .. } = &event {
            self.release_requested(&tunnel.device_id);
        }
        let _ = self.daemon_events.send(event);
    }

    /// End the device's session for requested tunnels and close what it opened
    fn release_requested(&mut self, device_id: &str) {
        let Some(entry) = self.requested.get_mut(device_id) else {
            return;
        };
        entry.session += 1;
        let ports: Vec<u16> = std::mem::take(&mut entry.local_ports).into_iter().collect();
        if entry.pending == 0 {
            self.requested.remove(device_id);
        }
        if !ports.is_empty() {
            info!(device_id = %device_id, count = ports.len(), "Closing requested tunnels");
            self.close_tunnels(ports);
        }
    }

    fn close_tunnels(&self, local_ports: Vec<u16>) {
        let bridge = self.bridge.clone();
        tokio::spawn(async move {
            for port in local_ports {
                if let Err(e) = bridge.close_tunnel(port).await {
                    warn!(local_port = port, category = e.category(), "Failed to close tunnel: {}", e);
                }
            }
        });
    }

    async fn shutdown(mut self, daemon_rx: &mut mpsc::UnboundedReceiver<DaemonEvent>) {
        for (_, connection) in self.connections.drain() {
            connection.stop().await;
        }
        while let Ok(event) = daemon_rx.try_recv() {
            let _ = self.daemon_events.send(event);
        }

        let ports: Vec<u16> = self
            .requested
            .drain()
            .flat_map(|(_, entry)| entry.local_ports)
            .collect();
        for port in ports {
            if let Err(e) = self.bridge.close_tunnel(port).await {
                warn!(local_port = port, category = e.category(), "Failed to close tunnel: {}", e);
            }
        }
        info!("ADB auto-connector stopped");
    }
}
