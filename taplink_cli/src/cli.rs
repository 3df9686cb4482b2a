//! Command-line front end for taplink.
//!
//! Loads the configuration, applies command-line overrides and hands off to
//! the core's server or client entry points. Reconnecting after a dropped
//! link is decided here, not in the core.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use taplink_core::acceptor::PeerTargets;
use taplink_core::config::{Config, ConfigError, ConfigManager, EngineMode, Role};
use taplink_core::device::{AsyncOpener, TapOpener};
use taplink_core::link::NoopObserver;
use taplink_core::logging::{self, LogFormat, LogOptions};
use taplink_core::server::{self, cancel_on_ctrl_c, connect_once};
use taplink_core::TunnelError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bridge a local TAP/TUN interface with a remote peer over TCP
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file (defaults apply if it does not exist)
    #[arg(short, long, value_name = "FILE", default_value = "taplink.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept peers and bridge each one to its own interface
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind to
        #[arg(short, long)]
        bind: Option<String>,

        /// Forwarding engine: threaded or multiplexed
        #[arg(short, long)]
        mode: Option<EngineMode>,
    },
    /// Connect to a server and bridge the link to a local interface
    Client {
        /// Server address (host or host:port)
        #[arg(short, long)]
        address: Option<String>,

        /// Server port when the address has none
        #[arg(short, long)]
        port: Option<u16>,

        /// Reconnect after the link drops
        #[arg(short, long)]
        reconnect: bool,
    },
    /// Start the component named by the `role` in the config file
    Start,
}

/// Error type for CLI operations
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

pub type CliResult<T> = Result<T, CliError>;

/// Run the CLI application
pub async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    let manager = load_config(&cli)?;
    let config = manager.config();
    let _guard = logging::init_logging(LogOptions {
        level: logging::parse_level(&config.log_level),
        format: if cli.json {
            LogFormat::Json
        } else {
            LogFormat::Text
        },
        ..Default::default()
    });
    debug!(path = ?manager.config_path(), "Configuration loaded");

    match config.role {
        Role::Server => start_server(config).await,
        Role::Client => start_client(config).await,
    }
}

/// Load the file (or defaults), apply the flags, then validate the result.
fn load_config(cli: &Cli) -> CliResult<ConfigManager> {
    let mut manager = ConfigManager::load_or_default(&cli.config)?;
    apply_overrides(manager.config_mut(), cli);
    manager.config().validate()?;
    Ok(manager)
}

/// Fold command-line flags into the loaded configuration.
fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    match &cli.command {
        Some(Commands::Server { port, bind, mode }) => {
            config.role = Role::Server;
            if let Some(port) = port {
                config.network.port = *port;
            }
            if let Some(bind) = bind {
                config.network.bind_address = bind.clone();
            }
            if let Some(mode) = mode {
                config.engine.mode = *mode;
            }
        }
        Some(Commands::Client {
            address,
            port,
            reconnect,
        }) => {
            config.role = Role::Client;
            if let Some(address) = address {
                config.client.server_address = Some(address.clone());
            }
            if let Some(port) = port {
                config.network.port = *port;
            }
            if *reconnect {
                config.client.auto_reconnect = true;
            }
        }
        Some(Commands::Start) | None => {}
    }
}

async fn start_server(config: &Config) -> CliResult<()> {
    info!(
        port = config.network.port,
        mode = ?config.engine.mode,
        "Starting taplink server"
    );
    server::serve(config).await?;
    info!("Server stopped");
    Ok(())
}

async fn start_client(config: &Config) -> CliResult<()> {
    let addr = config
        .client
        .peer_address(config.network.port)
        .ok_or_else(|| ConfigError::MissingValue("client.server_address".to_string()))?;
    info!(peer = %addr, reconnect = config.client.auto_reconnect, "Starting taplink client");

    let targets = PeerTargets::new(addr);
    let mut connector = targets.connector();
    let opener = AsyncOpener::new(TapOpener::new(config.device.name.clone(), config.device.kind));

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(&shutdown);

    loop {
        let result = connect_once(&mut connector, &opener, Arc::new(NoopObserver), &shutdown).await;
        match &result {
            Ok(stats) => info!(
                frames_up = stats.frames_up,
                frames_down = stats.frames_down,
                "Link ended"
            ),
            Err(e) => warn!(peer = %connector.target(), error = %e, "Link failed"),
        }

        if shutdown.is_cancelled() || !config.client.auto_reconnect {
            return result.map(|_| ()).map_err(CliError::from);
        }
        if let Err(e) = result {
            if !e.is_link_local() {
                return Err(e.into());
            }
        }

        let delay = config.client.reconnect_delay();
        info!(delay_secs = delay.as_secs(), "Reconnecting");
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> (Config, Cli) {
        let cli = Cli::try_parse_from(args).unwrap();
        let mut config = Config::default();
        apply_overrides(&mut config, &cli);
        (config, cli)
    }

    #[test]
    fn test_server_overrides() {
        let (config, _) = parse(&["taplink", "server", "--port", "7000", "--mode", "multiplexed"]);
        assert_eq!(config.role, Role::Server);
        assert_eq!(config.network.port, 7000);
        assert_eq!(config.engine.mode, EngineMode::Multiplexed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_overrides() {
        let (config, cli) = parse(&[
            "taplink",
            "-c",
            "custom.toml",
            "-l",
            "debug",
            "client",
            "--address",
            "192.0.2.10",
            "--reconnect",
        ]);
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        assert_eq!(config.role, Role::Client);
        assert_eq!(config.log_level, "debug");
        assert!(config.client.auto_reconnect);
        assert_eq!(
            config.client.peer_address(config.network.port).as_deref(),
            Some("192.0.2.10:9981")
        );
    }

    #[test]
    fn test_flags_complete_partial_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[network]\nport = 7000\n").unwrap();
        let path = file.path().to_str().unwrap();

        let cli = Cli::try_parse_from(["taplink", "-c", path, "server"]).unwrap();
        let manager = load_config(&cli).unwrap();
        assert_eq!(manager.config().role, Role::Server);
        assert_eq!(manager.config().network.port, 7000);

        // Without a role the file describes a client with no server address
        let cli = Cli::try_parse_from(["taplink", "-c", path, "start"]).unwrap();
        assert!(matches!(
            load_config(&cli),
            Err(CliError::Config(ConfigError::MissingValue(_)))
        ));
    }

    #[test]
    fn test_start_keeps_config_role() {
        let (config, _) = parse(&["taplink", "start"]);
        assert_eq!(config.role, Role::Client);
        assert!(Cli::try_parse_from(["taplink", "server", "--mode", "poll"]).is_err());
    }
}
