use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devbridge_core::DevBridgeConfig;
use devbridge_core::LogLevel;
use devbridge_core::logging::{apply_env_overrides, init_logging};
use devbridge_device::simulator::proxy_socket_argument;
use devbridge_device::{
    AdbAutoConnector, AdbClient, DebuggableTarget, DeviceBridge, LsofSocketSource,
    SimulatorSocketFinder,
};
use devbridge_proxy::{Adapter, AndroidAdapter, ProxyServer, UniversalAdapter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the debugging proxy until interrupted
    Serve {
        /// Port to listen on (overrides configuration)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides configuration)
        #[arg(short, long)]
        bind: Option<String>,

        /// Don't discover Android devices through adb
        #[arg(long)]
        no_adb: bool,

        /// Don't watch for iOS simulator sockets
        #[arg(long)]
        no_simulator: bool,
    },
    /// List attached Android devices
    Devices,
    /// List open adb tunnels to the reload and debugger ports
    Tunnels,
    /// List iOS simulator inspector sockets
    Simulators,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Generate default configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long, default_value = "devbridge.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    init_logging(logging_config(&config, cli.verbose)?)?;
    debug!("Configuration loaded and validated successfully");

    match cli.command {
        Commands::Serve {
            port,
            bind,
            no_adb,
            no_simulator,
        } => {
            let mut config = config;
            if let Some(port) = port {
                config.proxy.port = port;
            }
            if let Some(bind) = bind {
                config.proxy.bind_address = bind;
            }
            if no_adb {
                config.adb.enabled = false;
            }
            if no_simulator {
                config.simulator.enabled = false;
            }
            serve(config).await?;
        }
        Commands::Devices => {
            let adb = AdbClient::from_config(&config.adb);
            let devices = adb.list_devices().await?;
            if devices.is_empty() {
                println!("No devices attached");
            } else {
                for device in devices {
                    println!("{}", device);
                }
            }
        }
        Commands::Tunnels => {
            let adb = AdbClient::from_config(&config.adb);
            for (label, device_port) in [
                ("reload", config.adb.reload_device_port),
                ("debugger", config.adb.debugger_device_port),
            ] {
                let tunnels = adb.list_tunnels(device_port).await?;
                println!("{} ({}):", label, device_port);
                if tunnels.is_empty() {
                    println!("  none");
                }
                for tunnel in tunnels {
                    println!("  {}", tunnel);
                }
            }
        }
        Commands::Simulators => {
            let finder = SimulatorSocketFinder::start(
                LsofSocketSource::from_config(&config.simulator),
                config.simulator.poll_interval(),
            );
            let sockets = finder.list_known_sockets().await;
            finder.stop().await;

            let sockets = sockets?;
            if sockets.is_empty() {
                println!("No simulator inspector sockets found");
            } else {
                for socket in &sockets {
                    println!("{}", socket);
                }
                println!();
                println!("Proxy argument: {}", proxy_socket_argument(&sockets));
            }
        }
        Commands::Config { action } => handle_config_command(action, &config)?,
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<DevBridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => DevBridgeConfig::load_from_file(path)?,
        None => DevBridgeConfig::load_with_fallback(),
    };
    config.merge_with_env();
    config.validate()?;
    Ok(config)
}

/// Logging settings after env overrides; `--verbose` wins over both
fn logging_config(
    config: &DevBridgeConfig,
    verbose: bool,
) -> Result<devbridge_core::LoggingConfig> {
    let mut logging = apply_env_overrides(config.logging.clone())?;
    if verbose {
        logging.level = LogLevel::Debug;
    }
    Ok(logging)
}

/// Start discovery and the proxy, then wait for Ctrl-C
async fn serve(config: DevBridgeConfig) -> Result<()> {
    info!("devbridge {} starting", env!("CARGO_PKG_VERSION"));

    // Without adb the Android adapter sees a fixed empty device list
    let (connector, known, _idle) = if config.adb.enabled {
        let bridge: Arc<dyn DeviceBridge> = Arc::new(AdbClient::from_config(&config.adb));
        let connector = AdbAutoConnector::start(bridge, config.adb.clone());
        let known = connector.debuggable_targets();
        (Some(connector), known, None)
    } else {
        info!("Android discovery disabled");
        let (tx, rx) = watch::channel(Vec::<DebuggableTarget>::new());
        (None, rx, Some(tx))
    };

    let (finder, follower) = if config.simulator.enabled {
        let finder = SimulatorSocketFinder::start(
            LsofSocketSource::from_config(&config.simulator),
            config.simulator.poll_interval(),
        );
        let follower = spawn_socket_logger(finder.watch_sockets());
        (Some(finder), Some(follower))
    } else {
        (None, None)
    };

    let android = AndroidAdapter::from_config(known, &config.target);
    let universal = UniversalAdapter::new(vec![Arc::new(android) as Arc<dyn Adapter>]);
    let server = ProxyServer::new(config.proxy.clone(), Arc::new(universal))
        .start()
        .await
        .context("Failed to start proxy")?;

    println!("devbridge listening on {}", server.local_addr());
    println!("Targets: http://{}/json/list", server.local_addr());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    let result = server.stop().await;
    if let Some(follower) = follower {
        follower.abort();
    }
    if let Some(finder) = finder {
        finder.stop().await;
    }
    if let Some(connector) = connector {
        connector.stop().await;
    }
    result
}

/// Log the simulator proxy argument whenever the socket set changes
fn spawn_socket_logger(mut sockets: watch::Receiver<Option<Vec<String>>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while sockets.changed().await.is_ok() {
            let current = sockets.borrow_and_update().clone();
            match current {
                Some(list) if list.is_empty() => info!("No simulator inspector sockets"),
                Some(list) => info!(
                    count = list.len(),
                    "Simulator inspector sockets: {}",
                    proxy_socket_argument(&list)
                ),
                None => warn!("Simulator socket state reset"),
            }
        }
    })
}

fn handle_config_command(action: ConfigAction, config: &DevBridgeConfig) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("Current Configuration:");
            println!("{}", toml::to_string_pretty(config)?);
        }
        ConfigAction::Init { output } => {
            DevBridgeConfig::default().save_to_file(&output)?;
            println!("Default configuration saved to: {}", output.display());
        }
    }
    Ok(())
}
