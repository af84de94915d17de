use crate::errors::{MonitorError, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default Moonraker API port on the printer host
pub const DEFAULT_STATUS_PORT: u16 = 7125;

/// How the monitor obtains live status from each printer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Persistent WebSocket with `printer.objects.subscribe`
    Push,
    /// Fixed-interval HTTP `printer/objects/query`
    Poll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store_path: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub mode: ConnectionMode,
    pub status_port: u16,
    /// Base URL template, `{host}` and `{port}` are substituted
    pub channel_template: String,
    /// Host → base URL, for printers reachable only through a reverse proxy
    pub endpoint_overrides: HashMap<String, String>,
    pub reconnect_delay_secs: u64,
    pub connect_timeout_secs: u64,
    pub api_bind: Option<String>,
    pub notifications: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            log_dir: None,
            mode: ConnectionMode::Push,
            status_port: DEFAULT_STATUS_PORT,
            channel_template: "http://{host}:{port}".to_string(),
            endpoint_overrides: HashMap::new(),
            reconnect_delay_secs: 5,
            connect_timeout_secs: 10,
            api_bind: Some("127.0.0.1:7380".to_string()),
            notifications: true,
        }
    }
}

/// Command line flags, applied on top of the config file
#[derive(Debug, Parser)]
#[command(name = "moonraker-fleet-monitor", version, about)]
pub struct CliArgs {
    /// JSON config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the connection mode
    #[arg(long, value_enum)]
    pub mode: Option<ConnectionMode>,

    /// Registry store file
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Address for the local command API
    #[arg(long)]
    pub api_bind: Option<String>,

    /// Do not start the local command API
    #[arg(long)]
    pub no_api: bool,

    /// Log completions instead of raising desktop notifications
    #[arg(long)]
    pub no_notifications: bool,
}

impl AppConfig {
    /// Read a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| MonitorError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_cli(args: &CliArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(mode) = args.mode {
            config.mode = mode;
        }
        if let Some(store) = &args.store {
            config.store_path = Some(store.clone());
        }
        if let Some(bind) = &args.api_bind {
            config.api_bind = Some(bind.clone());
        }
        if args.no_api {
            config.api_bind = None;
        }
        if args.no_notifications {
            config.notifications = false;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.channel_template.contains("{host}") {
            return Err(MonitorError::Config(
                "channel_template must contain {host}".to_string(),
            ));
        }
        if self.reconnect_delay_secs == 0 {
            return Err(MonitorError::Config(
                "reconnect_delay_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn registry_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| app_dir(dirs::config_dir()).join("registry.json"))
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| app_dir(dirs::data_dir()).join("logs"))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// API bind address, `None` when the API is switched off
    pub fn api_address(&self) -> Option<&str> {
        self.api_bind.as_deref().filter(|b| !b.trim().is_empty())
    }
}

fn app_dir(base: Option<PathBuf>) -> PathBuf {
    base.map(|p| p.join("moonraker-fleet-monitor"))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.json");
        std::fs::write(&path, r#"{"mode": "poll", "status_port": 7200}"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.mode, ConnectionMode::Poll);
        assert_eq!(config.status_port, 7200);
        assert_eq!(config.reconnect_delay_secs, 5);
        assert!(config.notifications);
    }

    #[test]
    fn test_missing_config_file_is_default() {
        let config = AppConfig::load(Path::new("/nonexistent/monitor.json")).unwrap();
        assert_eq!(config.mode, ConnectionMode::Push);
        assert_eq!(config.status_port, DEFAULT_STATUS_PORT);
    }

    #[test]
    fn test_unparsable_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(MonitorError::Config(_))));
    }

    #[test]
    fn test_cli_overrides() {
        let args = CliArgs::parse_from([
            "moonraker-fleet-monitor",
            "--mode",
            "poll",
            "--no-api",
            "--no-notifications",
        ]);
        let config = AppConfig::from_cli(&args).unwrap();
        assert_eq!(config.mode, ConnectionMode::Poll);
        assert!(config.api_address().is_none());
        assert!(!config.notifications);
    }
}
