//! Thin wrapper around the `adb` executable

use super::tunnel::Tunnel;
use async_trait::async_trait;
use devbridge_core::config::AdbConfig;
use devbridge_core::error::{BridgeError, Result, ToolError};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

const TOOL: &str = "adb";

/// Operations the tunnel subsystem needs from ADB
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Serials of devices in the `device` state
    async fn list_devices(&self) -> Result<Vec<String>>;

    /// Open tunnels whose device side is `device_port`
    async fn list_tunnels(&self, device_port: u16) -> Result<Vec<Tunnel>>;

    /// Forward a local port to `device_port`, returning the bound local port
    ///
    /// With `local_port` unset ADB picks a free port.
    async fn open_tunnel(
        &self,
        device_id: &str,
        device_port: u16,
        local_port: Option<u16>,
    ) -> Result<u16>;

    async fn close_tunnel(&self, local_port: u16) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct AdbClient {
    binary: PathBuf,
}

impl AdbClient {
    pub fn new<P: Into<PathBuf>>(binary: P) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn from_config(config: &AdbConfig) -> Self {
        Self::new(config.binary.clone())
    }

    /// Run adb and return stdout; anything on stderr is an error
    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!("Running {} {}", self.binary.display(), args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ToolError::Spawn {
                tool: TOOL.to_string(),
                reason: e.to_string(),
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            return Err(BridgeError::tool(TOOL, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DeviceBridge for AdbClient {
    async fn list_devices(&self) -> Result<Vec<String>> {
        let output = self.run(&["devices", "-l"]).await?;
        Ok(parse_devices(&output))
    }

    async fn list_tunnels(&self, device_port: u16) -> Result<Vec<Tunnel>> {
        let output = self.run(&["forward", "--list"]).await?;
        Ok(parse_forwards(&output, device_port))
    }

    async fn open_tunnel(
        &self,
        device_id: &str,
        device_port: u16,
        local_port: Option<u16>,
    ) -> Result<u16> {
        let local = format!("tcp:{}", local_port.unwrap_or(0));
        let remote = format!("tcp:{}", device_port);
        let output = self
            .run(&["-s", device_id, "forward", &local, &remote])
            .await?;
        parse_bound_port(&output, local_port)
    }

    async fn close_tunnel(&self, local_port: u16) -> Result<()> {
        let local = format!("tcp:{}", local_port);
        self.run(&["forward", "--remove", &local]).await?;
        Ok(())
    }
}

/// Parse `adb devices -l`
pub fn parse_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            (fields.next()? == "device").then(|| serial.to_string())
        })
        .collect()
}

/// Parse `adb forward --list`, keeping tunnels to `device_port`
///
/// Lines look like `emulator-5554 tcp:40123 tcp:13592`.
pub fn parse_forwards(output: &str, device_port: u16) -> Vec<Tunnel> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device_id = fields.next()?;
            let local_port = tcp_port(fields.next()?)?;
            let remote_port = tcp_port(fields.next()?)?;
            (remote_port == device_port).then(|| Tunnel::new(device_id, local_port, remote_port))
        })
        .collect()
}

fn tcp_port(spec: &str) -> Option<u16> {
    spec.strip_prefix("tcp:")?.parse().ok()
}

/// Port adb bound for a forward
///
/// adb only prints the port when it picked one itself.
pub fn parse_bound_port(output: &str, requested: Option<u16>) -> Result<u16> {
    let printed = output.trim();
    if printed.is_empty() {
        return requested.ok_or_else(|| {
            ToolError::UnexpectedOutput {
                tool: TOOL.to_string(),
                output: "no port printed for tcp:0 forward".to_string(),
            }
            .into()
        });
    }
    printed.parse().map_err(|_| {
        ToolError::UnexpectedOutput {
            tool: TOOL.to_string(),
            output: printed.to_string(),
        }
        .into()
    })
}
