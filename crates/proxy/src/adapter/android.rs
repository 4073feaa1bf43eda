//! # Android adapter
//!
//! Follows the debuggable tunnels published by the ADB auto-connector. Each
//! device gets one long-lived enumerator target that only issues proxy calls
//! (`Valdi.enumerateDebuggableDevices`) to list the JavaScript runtimes on it.
//! Each attached client gets its own session target, with the configured
//! protocol adapter layered on top.
//!
//! A device whose enumerator socket closes, or whose enumeration fails, is
//! dropped along with the runtimes it advertised.

use super::{Adapter, CLOSED_CAPACITY, ClientToken, TargetInfo};
use async_trait::async_trait;
use devbridge_core::config::TargetConfig;
use devbridge_core::error::TransportError;
use devbridge_core::{
    AndroidTarget, ProtocolAdapter, ProtocolKind, Result, Target, TargetEvent, TargetOptions,
    ToolsSink,
};
use devbridge_device::DebuggableTarget;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const ADAPTER_ID: &str = "android";
pub const ENUMERATE_METHOD: &str = "Valdi.enumerateDebuggableDevices";
const ENUMERATE_TIMEOUT: Duration = Duration::from_secs(5);

/// A JavaScript runtime advertised by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    pub device_id: String,
    pub address: String,
    pub runtime_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl RuntimeInfo {
    /// Adapter-local target id
    pub fn target_id(&self) -> String {
        format!("{}_{}", self.device_id, self.runtime_id)
    }

    fn to_target_info(&self) -> TargetInfo {
        TargetInfo {
            id: self.target_id(),
            title: self.runtime_id.clone(),
            description: String::new(),
            kind: "javascript".to_string(),
            url: self.address.clone(),
            adapter_type: ADAPTER_ID.to_string(),
            app_id: Some(self.runtime_id.clone()),
            web_socket_debugger_url: String::new(),
            devtools_frontend_url: String::new(),
            metadata: serde_json::to_value(self).ok(),
        }
    }
}

/// Parse the enumerate result, `[{id, protocol, version}, ...]`
pub fn parse_runtimes(device_id: &str, address: &str, result: &Value) -> Vec<RuntimeInfo> {
    let Some(entries) = result.as_array() else {
        warn!(device_id, "Unexpected enumerate result: {}", result);
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let runtime_id = match entry.get("id")? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            Some(RuntimeInfo {
                device_id: device_id.to_string(),
                address: address.to_string(),
                runtime_id,
                protocol: entry.get("protocol").map(text),
                version: entry.get("version").map(text),
            })
        })
        .collect()
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct Device {
    address: String,
    enumerator: Arc<dyn Target>,
}

struct Session {
    serial: u64,
    client: ClientToken,
    target: Arc<dyn Target>,
    protocol: Box<dyn ProtocolAdapter>,
}

struct Inner {
    options: TargetOptions,
    protocol: ProtocolKind,
    devices: RwLock<HashMap<String, Device>>,
    runtimes: RwLock<HashMap<String, RuntimeInfo>>,
    sessions: RwLock<HashMap<String, Session>>,
    session_serial: AtomicU64,
    client_serial: AtomicU64,
    closed: broadcast::Sender<String>,
}

/// Adapter for Android devices reached through ADB debugger tunnels
pub struct AndroidAdapter {
    inner: Arc<Inner>,
    known: watch::Receiver<Vec<DebuggableTarget>>,
    follower: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AndroidAdapter {
    pub fn new(
        known: watch::Receiver<Vec<DebuggableTarget>>,
        options: TargetOptions,
        protocol: ProtocolKind,
    ) -> Self {
        let (closed, _) = broadcast::channel(CLOSED_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                options,
                protocol,
                devices: RwLock::new(HashMap::new()),
                runtimes: RwLock::new(HashMap::new()),
                sessions: RwLock::new(HashMap::new()),
                session_serial: AtomicU64::new(0),
                client_serial: AtomicU64::new(0),
                closed,
            }),
            known,
            follower: std::sync::Mutex::new(None),
        }
    }

    pub fn from_config(known: watch::Receiver<Vec<DebuggableTarget>>, config: &TargetConfig) -> Self {
        Self::new(known, TargetOptions::from(config), config.protocol)
    }

    /// Device ids with a live enumerator
    pub async fn known_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.devices.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Inner {
    async fn update_known_devices(self: &Arc<Self>, known: Vec<DebuggableTarget>) {
        let listed: HashSet<&str> = known.iter().map(|t| t.device_id.as_str()).collect();

        let stale: Vec<String> = {
            let devices = self.devices.read().await;
            devices
                .iter()
                .filter(|(id, device)| {
                    !listed.contains(id.as_str())
                        || known
                            .iter()
                            .any(|t| &t.device_id == *id && t.address != device.address)
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for device_id in stale {
            self.target_close(&device_id).await;
        }

        let mut devices = self.devices.write().await;
        for target in known {
            if devices.contains_key(&target.device_id) {
                continue;
            }

            info!(device_id = %target.device_id, address = %target.address, "Tracking debuggable device");
            let enumerator: Arc<dyn Target> = Arc::new(AndroidTarget::spawn(
                format!("{}_enumerator", target.device_id),
                target.address.clone(),
                self.options.clone(),
            ));
            self.watch_device(&target.device_id, enumerator.subscribe());
            enumerator.direct_connect_to(&target.address);

            devices.insert(
                target.device_id,
                Device {
                    address: target.address,
                    enumerator,
                },
            );
        }
    }

    fn watch_device(self: &Arc<Self>, device_id: &str, mut events: broadcast::Receiver<TargetEvent>) {
        let inner: Weak<Self> = Arc::downgrade(self);
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TargetEvent::SocketClosed { .. }) => break,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            if let Some(inner) = inner.upgrade() {
                inner.target_close(&device_id).await;
            }
        });
    }

    fn watch_session(self: &Arc<Self>, target_id: &str, serial: u64, mut events: broadcast::Receiver<TargetEvent>) {
        let inner: Weak<Self> = Arc::downgrade(self);
        let target_id = target_id.to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TargetEvent::SocketClosed { .. }) => break,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            let Some(inner) = inner.upgrade() else {
                return;
            };

            let mut sessions = inner.sessions.write().await;
            if sessions.get(&target_id).is_some_and(|s| s.serial == serial) {
                sessions.remove(&target_id);
                drop(sessions);
                info!(target_id = %target_id, "Debug session ended by device");
                let _ = inner.closed.send(target_id);
            }
        });
    }

    /// Forget a device and everything it advertised
    async fn target_close(&self, device_id: &str) {
        let Some(device) = self.devices.write().await.remove(device_id) else {
            return;
        };
        warn!(device_id, address = %device.address, "Closing debuggable device");
        device.enumerator.kill();
        self.runtimes
            .write()
            .await
            .retain(|_, runtime| runtime.device_id != device_id);
    }

    async fn enumerate(&self, device_id: &str, address: &str, enumerator: &Arc<dyn Target>) -> Option<Vec<RuntimeInfo>> {
        let call = enumerator.call_target(ENUMERATE_METHOD, json!({}));
        match tokio::time::timeout(ENUMERATE_TIMEOUT, call).await {
            Ok(Ok(result)) => Some(parse_runtimes(device_id, address, &result)),
            Ok(Err(e)) => {
                error!(device_id, "{} returned error: {}", ENUMERATE_METHOD, e);
                None
            }
            Err(_) => {
                error!(device_id, "{} timed out", ENUMERATE_METHOD);
                None
            }
        }
    }

    async fn refresh_runtimes(&self) -> Vec<RuntimeInfo> {
        let snapshot: Vec<(String, String, Arc<dyn Target>)> = self
            .devices
            .read()
            .await
            .iter()
            .map(|(id, device)| (id.clone(), device.address.clone(), device.enumerator.clone()))
            .collect();

        let results = join_all(snapshot.iter().map(|(id, address, enumerator)| async move {
            (id.as_str(), self.enumerate(id, address, enumerator).await)
        }))
        .await;

        let mut runtimes = Vec::new();
        for (device_id, found) in results {
            match found {
                Some(found) => runtimes.extend(found),
                None => self.target_close(device_id).await,
            }
        }
        runtimes.sort_by_key(|runtime| runtime.target_id());

        let mut table = self.runtimes.write().await;
        table.clear();
        table.extend(runtimes.iter().map(|r| (r.target_id(), r.clone())));
        runtimes
    }
}

#[async_trait]
impl Adapter for AndroidAdapter {
    fn id(&self) -> &str {
        ADAPTER_ID
    }

    async fn start(&self) -> Result<()> {
        let mut known = self.known.clone();
        let initial = known.borrow_and_update().clone();
        self.inner.update_known_devices(initial).await;

        let inner = self.inner.clone();
        let follower = tokio::spawn(async move {
            while known.changed().await.is_ok() {
                let current = known.borrow_and_update().clone();
                inner.update_known_devices(current).await;
            }
            debug!("Debuggable device feed closed");
        });
        if let Ok(mut slot) = self.follower.lock() {
            if let Some(previous) = slot.replace(follower) {
                previous.abort();
            }
        }
        Ok(())
    }

    async fn stop(&self) {
        let follower = self.follower.lock().ok().and_then(|mut slot| slot.take());
        if let Some(follower) = follower {
            follower.abort();
        }
        for (_, session) in self.inner.sessions.write().await.drain() {
            session.target.kill();
        }
        for (_, device) in self.inner.devices.write().await.drain() {
            device.enumerator.kill();
        }
        self.inner.runtimes.write().await.clear();
    }

    async fn get_targets(&self) -> Vec<TargetInfo> {
        debug!("Enumerating Android runtimes");
        self.inner
            .refresh_runtimes()
            .await
            .iter()
            .map(RuntimeInfo::to_target_info)
            .collect()
    }

    async fn connect_to(&self, target_id: &str, tools: ToolsSink) -> Result<ClientToken> {
        let client = ClientToken(self.inner.client_serial.fetch_add(1, Ordering::Relaxed));
        if let Some(session) = self.inner.sessions.write().await.get_mut(target_id) {
            info!(target_id, "Rebinding client to existing session");
            session.client = client;
            session.target.update_client(tools);
            return Ok(client);
        }

        let mut runtime = self.inner.runtimes.read().await.get(target_id).cloned();
        if runtime.is_none() {
            self.inner.refresh_runtimes().await;
            runtime = self.inner.runtimes.read().await.get(target_id).cloned();
        }
        let runtime = runtime.ok_or_else(|| TransportError::InvalidAddress {
            address: format!("{}/{}", ADAPTER_ID, target_id),
        })?;

        let serial = self.inner.session_serial.fetch_add(1, Ordering::Relaxed);
        let target: Arc<dyn Target> = Arc::new(AndroidTarget::spawn(
            target_id,
            runtime.address.clone(),
            self.inner.options.clone(),
        ));
        self.inner.watch_session(target_id, serial, target.subscribe());
        target.connect_to(&format!("/{}/{}", ADAPTER_ID, target_id), tools);
        let protocol = self.inner.protocol.attach(target.clone(), &runtime.runtime_id);
        info!(target_id, protocol = protocol.name(), "Debug session started");

        let replaced = self.inner.sessions.write().await.insert(
            target_id.to_string(),
            Session {
                serial,
                client,
                target,
                protocol,
            },
        );
        if let Some(replaced) = replaced {
            replaced.protocol.target().kill();
        }
        Ok(client)
    }

    async fn forward_to(&self, target_id: &str, message: String) {
        match self.inner.sessions.read().await.get(target_id) {
            Some(session) => session.target.forward(message),
            None => warn!(target_id, "No session for client message"),
        }
    }

    async fn close_connection_to(&self, target_id: &str, client: ClientToken) {
        let mut sessions = self.inner.sessions.write().await;
        match sessions.get(target_id).map(|session| session.client) {
            Some(current) if current == client => {
                if let Some(session) = sessions.remove(target_id) {
                    debug!(target_id, "Closing debug session");
                    session.target.kill();
                }
            }
            Some(_) => debug!(target_id, "Session belongs to a newer client, keeping it"),
            None => {}
        }
    }

    async fn force_refresh(&self) {
        let current = self.known.borrow().clone();
        self.inner.update_known_devices(current).await;
    }

    fn subscribe_socket_closed(&self) -> broadcast::Receiver<String> {
        self.inner.closed.subscribe()
    }
}
