//! iOS simulator inspector socket discovery
//!
//! Simulators expose a WebKit remote-inspector unix socket owned by
//! `launchd_sim`. [`SimulatorSocketFinder`] polls for those sockets and
//! publishes the sorted, deduplicated set only when it changes.

use async_trait::async_trait;
use devbridge_core::config::SimulatorConfig;
use devbridge_core::error::{BridgeError, Result, ToolError};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const INSPECTOR_SOCKET_MARKER: &str = "com.apple.webinspectord_sim.socket";

/// Where socket paths come from
#[async_trait]
pub trait SocketSource: Send + Sync + 'static {
    async fn list_sockets(&self) -> Result<Vec<String>>;
}

/// Finds inspector sockets with `lsof -aUc launchd_sim -Fn`
#[derive(Debug, Clone)]
pub struct LsofSocketSource {
    binary: PathBuf,
}

impl LsofSocketSource {
    pub fn new<P: Into<PathBuf>>(binary: P) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn from_config(config: &SimulatorConfig) -> Self {
        Self::new(config.lsof_binary.clone())
    }
}

#[async_trait]
impl SocketSource for LsofSocketSource {
    async fn list_sockets(&self) -> Result<Vec<String>> {
        let output = Command::new(&self.binary)
            .args(["-aUc", "launchd_sim", "-Fn"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ToolError::Spawn {
                tool: "lsof".to_string(),
                reason: e.to_string(),
            })?;

        // lsof exits non-zero when nothing matches
        if !output.status.success() && output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                return Err(BridgeError::tool("lsof", stderr.trim()));
            }
        }

        Ok(parse_lsof_sockets(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Keep `n<path>` records that name an inspector socket
pub fn parse_lsof_sockets(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix('n'))
        .filter(|path| path.contains(INSPECTOR_SOCKET_MARKER))
        .map(str::to_string)
        .collect()
}

/// Argument form consumed by the WebKit inspector proxy, `unix:a,unix:b`
pub fn proxy_socket_argument(sockets: &[String]) -> String {
    sockets
        .iter()
        .map(|socket| format!("unix:{}", socket))
        .collect::<Vec<_>>()
        .join(",")
}

/// Sorted and deduplicated
fn normalize(mut sockets: Vec<String>) -> Vec<String> {
    sockets.sort();
    sockets.dedup();
    sockets
}

/// Polls a [`SocketSource`] until stopped
#[derive(Debug)]
pub struct SimulatorSocketFinder {
    sockets: watch::Receiver<Option<Vec<String>>>,
    waiters: mpsc::UnboundedSender<oneshot::Sender<Vec<String>>>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SimulatorSocketFinder {
    pub fn start<S: SocketSource>(source: S, interval: Duration) -> Self {
        let (sockets_tx, sockets) = watch::channel(None);
        let (waiters, waiters_rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(poll(source, interval, sockets_tx, waiters_rx, stop_rx));
        Self {
            sockets,
            waiters,
            stop,
            task,
        }
    }

    /// Observe the socket set; `None` until the first poll completes
    pub fn watch_sockets(&self) -> watch::Receiver<Option<Vec<String>>> {
        self.sockets.clone()
    }

    /// Current socket set, waiting for the first poll if needed
    pub async fn list_known_sockets(&self) -> Result<Vec<String>> {
        if let Some(sockets) = self.sockets.borrow().as_ref() {
            return Ok(sockets.clone());
        }
        let (tx, rx) = oneshot::channel();
        self.waiters
            .send(tx)
            .map_err(|_| BridgeError::internal("Simulator socket finder has stopped"))?;
        rx.await
            .map_err(|_| BridgeError::internal("Simulator socket finder has stopped"))
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!("Simulator socket finder task failed: {}", e);
        }
    }
}

async fn poll<S: SocketSource>(
    source: S,
    interval: Duration,
    sockets: watch::Sender<Option<Vec<String>>>,
    mut waiters_rx: mpsc::UnboundedReceiver<oneshot::Sender<Vec<String>>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut waiters: Vec<oneshot::Sender<Vec<String>>> = Vec::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            Some(waiter) = waiters_rx.recv() => {
                match sockets.borrow().as_ref() {
                    Some(current) => { let _ = waiter.send(current.clone()); }
                    None => waiters.push(waiter),
                }
            }
            _ = ticker.tick() => {
                let found = match source.list_sockets().await {
                    Ok(found) => normalize(found),
                    Err(e) => {
                        debug!(category = e.category(), "Failed to list simulator sockets: {}", e);
                        continue;
                    }
                };

                let changed = sockets.send_if_modified(|current| {
                    if current.as_ref() == Some(&found) {
                        return false;
                    }
                    *current = Some(found.clone());
                    true
                });
                if changed {
                    info!(count = found.len(), "Simulator inspector sockets changed");
                }

                for waiter in waiters.drain(..) {
                    let _ = waiter.send(found.clone());
                }
            }
        }
    }
    debug!("Simulator socket finder stopped");
}
