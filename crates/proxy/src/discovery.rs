//! Discovery responders backing `/json`, `/json/list` and `/json/version`

use crate::adapter::{Adapter, TargetInfo};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// DevTools protocol version advertised by `/json/version`
pub const PROTOCOL_VERSION: &str = "1.1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    #[serde(rename = "Browser")]
    pub browser: String,
    #[serde(rename = "Protocol-Version")]
    pub protocol_version: String,
    #[serde(rename = "User-Agent")]
    pub user_agent: String,
}

impl Default for VersionInfo {
    fn default() -> Self {
        let product = format!("devbridge/{}", env!("CARGO_PKG_VERSION"));
        Self {
            browser: product.clone(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            user_agent: product,
        }
    }
}

struct Snapshot {
    taken: Instant,
    targets: Vec<TargetInfo>,
}

/// Target list cached for `max_age`
///
/// Enumerating targets costs a device round trip per device, so responders
/// read the snapshot and a background refresher keeps it current.
pub struct DiscoveryCache {
    adapter: Arc<dyn Adapter>,
    max_age: Duration,
    snapshot: Mutex<Option<Snapshot>>,
}

impl DiscoveryCache {
    pub fn new(adapter: Arc<dyn Adapter>, max_age: Duration) -> Self {
        Self {
            adapter,
            max_age,
            snapshot: Mutex::new(None),
        }
    }

    /// Cached targets, enumerating again once the snapshot is stale
    pub async fn targets(&self) -> Vec<TargetInfo> {
        let mut snapshot = self.snapshot.lock().await;
        if let Some(current) = snapshot.as_ref() {
            if current.taken.elapsed() < self.max_age {
                return current.targets.clone();
            }
        }

        let targets = self.adapter.get_targets().await;
        debug!(count = targets.len(), "Refreshed discovery targets");
        *snapshot = Some(Snapshot {
            taken: Instant::now(),
            targets: targets.clone(),
        });
        targets
    }

    /// Enumerate now regardless of age
    pub async fn refresh(&self) -> Vec<TargetInfo> {
        self.invalidate().await;
        self.targets().await
    }

    pub async fn invalidate(&self) {
        *self.snapshot.lock().await = None;
    }

    /// Targets with client URLs pointing at `host`
    pub async fn targets_for_host(&self, host: &str) -> Vec<TargetInfo> {
        self.targets()
            .await
            .into_iter()
            .map(|target| target.with_endpoint(host))
            .collect()
    }
}
