use anyhow::{Context, Result};
use clap::Parser;
use lib_feedmux::{MultiplexerSettings, ProviderConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "server_feedmux.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Realtime feed multiplexer WebSocket server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "FEEDMUX_PORT", help = "Port to listen on for consumer connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "FEEDMUX_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "FEEDMUX_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "FEEDMUX_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "FEEDMUX_PROVIDERS_PATH", help = "JSON array of provider configurations registered at startup.")]
    pub providers_path: Option<PathBuf>,

    #[clap(long, env = "FEEDMUX_SEND_TIMEOUT_MS", help = "Milliseconds a write to one consumer may block before it is dropped.")]
    pub send_timeout_ms: Option<u64>,

    #[clap(long, env = "FEEDMUX_BATCH_SIZE", help = "Snapshot batch size for providers that set none.")]
    pub batch_size: Option<usize>,

    #[clap(long, env = "FEEDMUX_SNAPSHOT_DEBOUNCE_MS", help = "Quiet period before a partial snapshot batch is flushed.")]
    pub snapshot_debounce_ms: Option<u64>,

    #[clap(long, env = "FEEDMUX_CONFLATION_WINDOW_MS", help = "Realtime conflation window for providers that set no message rate.")]
    pub conflation_window_ms: Option<u64>,
}

impl Config {
    // Fields set in `other` win
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            providers_path: other.providers_path.or(self.providers_path),
            send_timeout_ms: other.send_timeout_ms.or(self.send_timeout_ms),
            batch_size: other.batch_size.or(self.batch_size),
            snapshot_debounce_ms: other.snapshot_debounce_ms.or(self.snapshot_debounce_ms),
            conflation_window_ms: other.conflation_window_ms.or(self.conflation_window_ms),
        }
    }

    fn defaults() -> Config {
        let mux = MultiplexerSettings::default();
        Config {
            port: Some(9010),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            send_timeout_ms: Some(5_000),
            batch_size: Some(mux.batch_size),
            snapshot_debounce_ms: Some(mux.snapshot_debounce.as_millis() as u64),
            conflation_window_ms: Some(mux.conflation_window.as_millis() as u64),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(9010)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.unwrap_or(5_000))
    }

    pub fn mux_settings(&self) -> MultiplexerSettings {
        let defaults = MultiplexerSettings::default();
        MultiplexerSettings {
            batch_size: self.batch_size.unwrap_or(defaults.batch_size).max(1),
            snapshot_debounce: self
                .snapshot_debounce_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.snapshot_debounce),
            conflation_window: self
                .conflation_window_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.conflation_window),
        }
    }
}

/// Defaults, then `.env`, then the JSON config file, then env and CLI.
pub fn load_config() -> Config {
    if let Err(e) = dotenvy::dotenv() {
        log::debug!("No .env file loaded: {}", e);
    }
    layer_config(Config::parse())
}

fn layer_config(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
                Ok(file_config) => current_config = current_config.merge(file_config),
                Err(e) => log::warn!(
                    "Failed to parse config file {}: {}. Falling back to other sources.",
                    config_file_path.display(),
                    e
                ),
            },
            Err(e) => log::warn!(
                "Failed to read config file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                e
            ),
        }
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    current_config.merge(cli)
}

/// Reads and validates the providers file.
pub fn load_providers(path: &Path) -> Result<Vec<ProviderConfig>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading providers file {}", path.display()))?;
    let providers: Vec<ProviderConfig> = serde_json::from_str(&text)
        .with_context(|| format!("parsing providers file {}", path.display()))?;
    for provider in &providers {
        provider
            .validate()
            .with_context(|| format!("provider '{}' in {}", provider.id, path.display()))?;
    }
    Ok(providers)
}
