//! Duplex relay - TCP pairing host
//!
//! Accepts TCP connections on a listen address, dials a target address for
//! each one, and relays the two connections into each other.

mod forwarder;

use anyhow::{Context, Result};
use clap::Parser;
use duplex_relay::{CloseMode, RelayConfig};
use forwarder::{Forwarder, ForwarderConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Duplex relay - forwards every accepted TCP connection to a target address
#[derive(Parser, Debug)]
#[command(name = "duplex-relay")]
#[command(about = "Duplex relay - forwards every accepted TCP connection to a target address")]
#[command(version)]
#[command(long_about = r#"
Duplex relay accepts TCP connections, dials the target address for each one,
and relays bytes in both directions until both sides have closed.

EXAMPLES:
  # Relay local port 9000 to an SSH server
  duplex-relay --listen 0.0.0.0:9000 --target 10.0.0.5:22

  # Use a config file
  duplex-relay --config relay.yaml

  # Keep the reverse direction open after one side's EOF
  duplex-relay --listen 127.0.0.1:8080 --target backend:80 --half-close

ENVIRONMENT VARIABLES:
  DUPLEX_RELAY_LISTEN       Listen address (host:port)
  DUPLEX_RELAY_TARGET       Target address (host:port)
  DUPLEX_RELAY_MAX_PAIRS    Maximum number of live pairs
"#)]
struct Args {
    /// Address to accept connections on (e.g., 0.0.0.0:9000)
    #[arg(long, env = "DUPLEX_RELAY_LISTEN")]
    listen: Option<String>,

    /// Target address to relay connections to (e.g., 10.0.0.5:22)
    #[arg(long, env = "DUPLEX_RELAY_TARGET")]
    target: Option<String>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DUPLEX_RELAY_LOG_LEVEL")]
    log_level: String,

    /// Maximum number of live pairs
    #[arg(long, env = "DUPLEX_RELAY_MAX_PAIRS")]
    max_pairs: Option<usize>,

    /// Chunks queued per direction before reading pauses
    #[arg(long, env = "DUPLEX_RELAY_QUEUE_DEPTH")]
    queue_depth: Option<usize>,

    /// Maximum chunk size in bytes
    #[arg(long, env = "DUPLEX_RELAY_READ_SIZE")]
    read_size: Option<usize>,

    /// Seconds a closing pair may take to flush before it is force-closed (0 = never)
    #[arg(long, env = "DUPLEX_RELAY_DRAIN_TIMEOUT_SECS")]
    drain_timeout_secs: Option<u64>,

    /// Keep the other direction open when one side reaches EOF
    #[arg(long, env = "DUPLEX_RELAY_HALF_CLOSE")]
    half_close: bool,

    /// Skip the liveness flush on pair start
    #[arg(long, env = "DUPLEX_RELAY_NO_PROBE")]
    no_probe: bool,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    listen: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    max_pairs: Option<usize>,

    /// Relay pair tuning
    #[serde(default)]
    relay: RelayConfigFile,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RelayConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    read_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    queue_depth: Option<usize>,

    /// `full` or `half_close`
    #[serde(skip_serializing_if = "Option::is_none")]
    close_mode: Option<CloseModeFile>,

    /// 0 disables the drain timeout
    #[serde(skip_serializing_if = "Option::is_none")]
    drain_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    probe_on_start: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CloseModeFile {
    Full,
    HalfClose,
}

impl From<CloseModeFile> for CloseMode {
    fn from(mode: CloseModeFile) -> Self {
        match mode {
            CloseModeFile::Full => CloseMode::Full,
            CloseModeFile::HalfClose => CloseMode::HalfClose,
        }
    }
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with config file, giving precedence to CLI args
fn build_forwarder_config(args: Args, file: ConfigFile) -> Result<ForwarderConfig> {
    let listen = args
        .listen
        .or(file.listen)
        .ok_or_else(|| anyhow::anyhow!("Listen address is required (use --listen or config file)"))?;
    let target = args
        .target
        .or(file.target)
        .ok_or_else(|| anyhow::anyhow!("Target address is required (use --target or config file)"))?;

    validate_address(&listen, "listen")?;
    validate_address(&target, "target")?;

    let mut relay = RelayConfig::default();
    if let Some(read_size) = args.read_size.or(file.relay.read_size) {
        relay = relay.with_read_size(read_size);
    }
    if let Some(queue_depth) = args.queue_depth.or(file.relay.queue_depth) {
        relay = relay.with_queue_depth(queue_depth);
    }
    if args.half_close {
        relay = relay.with_close_mode(CloseMode::HalfClose);
    } else if let Some(mode) = file.relay.close_mode {
        relay = relay.with_close_mode(mode.into());
    }
    if let Some(secs) = args.drain_timeout_secs.or(file.relay.drain_timeout_secs) {
        let timeout = (secs > 0).then(|| Duration::from_secs(secs));
        relay = relay.with_drain_timeout(timeout);
    }
    if args.no_probe {
        relay = relay.with_probe_on_start(false);
    } else if let Some(probe) = file.relay.probe_on_start {
        relay = relay.with_probe_on_start(probe);
    }

    relay.validate().context("Invalid relay configuration")?;

    let max_pairs = args.max_pairs.or(file.max_pairs);
    if max_pairs == Some(0) {
        anyhow::bail!("max_pairs must be greater than zero");
    }

    Ok(ForwarderConfig {
        listen,
        target,
        max_pairs,
        relay,
    })
}

/// Validate address format (should be host:port)
fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            addr_type,
            addr
        );
    };

    if host.is_empty() {
        anyhow::bail!(
            "Invalid {} address format: '{}' (host cannot be empty)",
            addr_type,
            addr
        );
    }

    port.parse::<u16>()
        .with_context(|| format!("Invalid port in {} address: {}", addr_type, addr))?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    info!("Duplex relay starting...");

    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };
    let config =
        build_forwarder_config(args, file).context("Failed to build relay configuration")?;

    info!("Listen: {}", config.listen);
    info!("Target: {}", config.target);
    info!(
        read_size = config.relay.read_size,
        queue_depth = config.relay.queue_depth,
        close_mode = ?config.relay.close_mode,
        drain_timeout = ?config.relay.drain_timeout,
        max_pairs = ?config.max_pairs,
        "Relay settings"
    );

    let forwarder = Forwarder::new(config);
    let listener = forwarder.bind().await.context("Failed to start listener")?;

    let shutdown = CancellationToken::new();
    let ctrl_c = {
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
        }
    };
    tokio::spawn(ctrl_c);

    if let Err(e) = forwarder.serve(listener, shutdown).await {
        error!("Forwarder error: {}", e);
        return Err(e.into());
    }

    info!("Duplex relay stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("duplex-relay").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn test_validate_address() {
        // Valid addresses
        assert!(validate_address("0.0.0.0:9000", "listen").is_ok());
        assert!(validate_address("localhost:8080", "target").is_ok());
        assert!(validate_address("[::1]:22", "target").is_ok());

        // Invalid addresses
        assert!(validate_address("localhost", "target").is_err());
        assert!(validate_address("localhost:", "target").is_err());
        assert!(validate_address("localhost:http", "target").is_err());
        assert!(validate_address(":9000", "listen").is_err());
        assert!(validate_address("", "listen").is_err());
    }

    #[test]
    fn test_cli_args_build_config() {
        let config = build_forwarder_config(
            args(&[
                "--listen",
                "127.0.0.1:9000",
                "--target",
                "10.0.0.5:22",
                "--queue-depth",
                "4",
                "--drain-timeout-secs",
                "0",
                "--half-close",
                "--no-probe",
            ]),
            ConfigFile::default(),
        )
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.target, "10.0.0.5:22");
        assert_eq!(config.max_pairs, None);
        assert_eq!(config.relay.queue_depth, 4);
        assert_eq!(config.relay.read_size, 16 * 1024);
        assert_eq!(config.relay.close_mode, CloseMode::HalfClose);
        assert_eq!(config.relay.drain_timeout, None);
        assert!(!config.relay.probe_on_start);
    }

    #[test]
    fn test_cli_args_override_config_file() {
        let file: ConfigFile = serde_yaml::from_str(
            r#"
listen: 0.0.0.0:7000
target: backend:80
max_pairs: 100
relay:
  read_size: 8192
  close_mode: half_close
  drain_timeout_secs: 10
"#,
        )
        .unwrap();

        let config = build_forwarder_config(args(&["--target", "other:81"]), file).unwrap();
        assert_eq!(config.listen, "0.0.0.0:7000");
        assert_eq!(config.target, "other:81");
        assert_eq!(config.max_pairs, Some(100));
        assert_eq!(config.relay.read_size, 8192);
        assert_eq!(config.relay.close_mode, CloseMode::HalfClose);
        assert_eq!(config.relay.drain_timeout, Some(Duration::from_secs(10)));
        assert!(config.relay.probe_on_start);
    }

    #[test]
    fn test_missing_target_is_rejected() {
        let result = build_forwarder_config(
            args(&["--listen", "127.0.0.1:9000"]),
            ConfigFile::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_relay_settings_are_rejected() {
        let result = build_forwarder_config(
            args(&[
                "--listen",
                "127.0.0.1:9000",
                "--target",
                "127.0.0.1:22",
                "--read-size",
                "0",
            ]),
            ConfigFile::default(),
        );
        assert!(result.is_err());

        let result = build_forwarder_config(
            args(&[
                "--listen",
                "127.0.0.1:9000",
                "--target",
                "127.0.0.1:22",
                "--max-pairs",
                "0",
            ]),
            ConfigFile::default(),
        );
        assert!(result.is_err());
    }
}
