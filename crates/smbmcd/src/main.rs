// # smbmcd - SMB Multichannel Daemon
//
// The smbmcd daemon is a thin integration layer. It is responsible for:
// 1. Reading configuration from a JSON file and environment overrides
// 2. Initializing logging and the runtime
// 3. Registering transports and NIC sources
// 4. Running the multichannel engine until SIGTERM/SIGINT
//
// Channel selection logic lives in smb-mc-core; nothing here decides
// which channels exist.
//
// ## Configuration
//
// - `SMBMC_CONFIG_PATH`: JSON configuration file (optional, defaults apply)
// - `SMBMC_MAX_CHANNELS`: Override `selector.max_channels`
// - `SMBMC_CONNECT_TIMEOUT_MS`: Override the TCP connect timeout
// - `SMBMC_LOG_LEVEL`: trace, debug, info, warn or error
//
// ## Example
//
// ```bash
// export SMBMC_CONFIG_PATH=/etc/smbmc/config.json
// export SMBMC_MAX_CHANNELS=8
//
// smbmcd
// ```

use anyhow::{Context, Result};
use smb_mc_core::{EngineEvent, MultichannelConfig, MultichannelEngine, PluginRegistry, TransportConfig};
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes, following systemd conventions
#[derive(Debug, Clone, Copy)]
enum SmbmcExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<SmbmcExitCode> for ExitCode {
    fn from(code: SmbmcExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Daemon settings read from the environment
struct Settings {
    config_path: Option<String>,
    max_channels: Option<usize>,
    connect_timeout_ms: Option<u64>,
    log_level: String,
}

impl Settings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            config_path: env::var("SMBMC_CONFIG_PATH").ok().filter(|p| !p.is_empty()),
            max_channels: parse_var("SMBMC_MAX_CHANNELS")?,
            connect_timeout_ms: parse_var("SMBMC_CONNECT_TIMEOUT_MS")?,
            log_level: env::var("SMBMC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    fn validate(&self) -> Result<()> {
        if let Some(max_channels) = self.max_channels
            && !(1..=64).contains(&max_channels)
        {
            anyhow::bail!(
                "SMBMC_MAX_CHANNELS must be between 1 and 64. Got: {}",
                max_channels
            );
        }

        if let Some(timeout) = self.connect_timeout_ms
            && !(100..=60_000).contains(&timeout)
        {
            anyhow::bail!(
                "SMBMC_CONNECT_TIMEOUT_MS must be between 100 and 60000. Got: {}",
                timeout
            );
        }

        if let Some(ref path) = self.config_path
            && !std::path::Path::new(path).is_file()
        {
            anyhow::bail!("SMBMC_CONFIG_PATH does not point to a file: {}", path);
        }

        log_level(&self.log_level).map(|_| ())
    }

    /// Load the file configuration and apply environment overrides
    fn build_config(&self) -> Result<MultichannelConfig> {
        let mut config = match &self.config_path {
            Some(path) => MultichannelConfig::from_json_file(path)
                .with_context(|| format!("failed to load {}", path))?,
            None => MultichannelConfig::default(),
        };

        if let Some(max_channels) = self.max_channels {
            config.selector.max_channels = max_channels;
        }
        if let Some(timeout) = self.connect_timeout_ms {
            match &mut config.transport {
                TransportConfig::Tcp {
                    connect_timeout_ms, ..
                } => *connect_timeout_ms = timeout,
                TransportConfig::Custom { factory, .. } => {
                    anyhow::bail!(
                        "SMBMC_CONNECT_TIMEOUT_MS only applies to the tcp transport, not '{}'",
                        factory
                    );
                }
            }
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} is not a valid number: {}", name, raw)),
        Err(_) => Ok(None),
    }
}

fn log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!(
            "SMBMC_LOG_LEVEL '{}' is not valid. \
            Valid levels: trace, debug, info, warn, error",
            level
        ),
    }
}

fn main() -> ExitCode {
    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return SmbmcExitCode::ConfigError.into();
        }
    };

    if let Err(e) = settings.validate() {
        eprintln!("Configuration validation error: {}", e);
        return SmbmcExitCode::ConfigError.into();
    }

    let config = match settings.build_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return SmbmcExitCode::ConfigError.into();
        }
    };

    let level = log_level(&settings.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return SmbmcExitCode::ConfigError.into();
    }

    info!("Starting smbmcd daemon");
    info!(
        "Configuration loaded: {} client NIC(s), {} server NIC(s), up to {} channel(s)",
        config.client_nics.len(),
        config.server_nics.len(),
        config.selector.max_channels
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return SmbmcExitCode::RuntimeError.into();
        }
    };

    rt.block_on(async {
        match run_daemon(config).await {
            Ok(()) => SmbmcExitCode::CleanShutdown,
            Err(e) => {
                error!("Daemon error: {:#}", e);
                SmbmcExitCode::RuntimeError
            }
        }
    })
    .into()
}

/// Run the daemon
async fn run_daemon(config: MultichannelConfig) -> Result<()> {
    let registry = PluginRegistry::with_builtins();

    #[cfg(feature = "tcp")]
    {
        info!("Registering TCP transport");
        smb_mc_transport_tcp::register(&registry);
    }

    info!("Transports: {:?}", registry.list_transports());
    info!("NIC sources: {:?}", registry.list_nic_sources());

    let transport = registry.create_transport(&config.transport)?;
    let client_source = registry.create_nic_source("static", &config.client_nics)?;
    let server_source = registry.create_nic_source("static", &config.server_nics)?;

    let (engine, mut event_rx) =
        MultichannelEngine::new(client_source, server_source, transport, config)?;
    let engine = Arc::new(engine);

    let events = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            log_event(&event);
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let runner = Arc::clone(&engine);
    let mut engine_task =
        tokio::spawn(async move { runner.run_with_shutdown(Some(shutdown_rx)).await });

    info!("Engine running");

    tokio::select! {
        signal = wait_for_shutdown() => {
            info!("Received shutdown signal: {}", signal?);
        }
        result = &mut engine_task => {
            // The engine only returns on its own when startup failed
            result??;
            anyhow::bail!("engine stopped without a shutdown request");
        }
    }

    let status = engine.channels().await;
    match serde_json::to_string_pretty(&status) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!("Failed to render channel status: {}", e),
    }

    if shutdown_tx.send(()).is_err() {
        warn!("Engine already stopped");
    }
    engine_task.await??;

    // The engine owned the only sender
    drop(engine);
    if let Err(e) = events.await {
        warn!("Event logger ended abnormally: {}", e);
    }

    info!("Shutting down daemon");
    Ok(())
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::Started {
            client_nics,
            server_nics,
        } => info!("Engine started with {} client / {} server NIC(s)", client_nics, server_nics),
        EngineEvent::NicChanged { peer, index } => info!("{:?} NIC {} changed", peer, index),
        EngineEvent::ConnectStarted { pair } => info!("Connecting {}", pair),
        EngineEvent::ChannelUp { pair, handle } => info!("Channel {} up ({})", pair, handle),
        EngineEvent::ConnectFailed { pair, error } => warn!("Connect {} failed: {}", pair, error),
        EngineEvent::ChannelDown { pair } => info!("Channel {} down", pair),
        EngineEvent::ReconcileFailed { error } => error!("Reconciliation failed: {}", error),
        EngineEvent::Stopped { reason } => info!("Engine stopped: {}", reason),
    }
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for CTRL-C
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
