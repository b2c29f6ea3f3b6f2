//! Configuration for the L402 gate server.
//!
//! Values come from an optional JSON config file; fields not present there
//! fall back to environment variables, then to hardcoded defaults.

use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// CLI arguments for the gate server.
#[derive(Parser, Debug)]
#[command(name = "l402-gate")]
#[command(about = "L402 payment gate HTTP server")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

/// Server configuration.
///
/// Fields use serde defaults that fall back to environment variables,
/// then to hardcoded defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "config_defaults::default_port")]
    port: u16,
    #[serde(default = "config_defaults::default_host")]
    host: IpAddr,
    /// Token-signing secret. When absent a random per-process secret is
    /// generated; a restart then invalidates all outstanding tokens.
    #[serde(default = "config_defaults::default_secret")]
    secret: Option<String>,
    #[serde(default = "config_defaults::default_store_path")]
    store_path: PathBuf,
    #[serde(default = "config_defaults::default_content_dir")]
    content_dir: PathBuf,
    /// Optional catalog file; the built-in catalog is used when absent.
    #[serde(default = "config_defaults::default_catalog_path")]
    catalog_path: Option<PathBuf>,
    /// Serve simulated invoices instead of calling the backend.
    #[serde(default = "config_defaults::default_mock_mode")]
    mock_mode: bool,
    #[serde(default)]
    backend: BackendConfig,
}

/// LNbits connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "config_defaults::default_backend_url")]
    url: Url,
    /// Admin key, used to create invoices.
    #[serde(default = "config_defaults::default_admin_key")]
    admin_key: String,
    /// Invoice/read key, used to check settlement.
    #[serde(default = "config_defaults::default_invoice_key")]
    invoice_key: String,
    #[serde(default = "config_defaults::default_backend_timeout_secs")]
    timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            url: config_defaults::default_backend_url(),
            admin_key: config_defaults::default_admin_key(),
            invoice_key: config_defaults::default_invoice_key(),
            timeout_secs: config_defaults::default_backend_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: config_defaults::default_port(),
            host: config_defaults::default_host(),
            secret: config_defaults::default_secret(),
            store_path: config_defaults::default_store_path(),
            content_dir: config_defaults::default_content_dir(),
            catalog_path: config_defaults::default_catalog_path(),
            mock_mode: config_defaults::default_mock_mode(),
            backend: BackendConfig::default(),
        }
    }
}

mod config_defaults {
    use std::env;
    use std::net::IpAddr;
    use std::path::PathBuf;
    use url::Url;

    pub const DEFAULT_PORT: u16 = 8402;
    pub const DEFAULT_HOST: &str = "0.0.0.0";
    pub const DEFAULT_BACKEND_URL: &str = "http://lnbits:5000";
    pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 10;

    /// $PORT env var -> 8402
    pub fn default_port() -> u16 {
        env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// $HOST env var -> "0.0.0.0"
    pub fn default_host() -> IpAddr {
        env::var("HOST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(IpAddr::V4(DEFAULT_HOST.parse().unwrap()))
    }

    pub fn default_secret() -> Option<String> {
        env::var("SERVER_SECRET").ok().filter(|s| !s.is_empty())
    }

    pub fn default_store_path() -> PathBuf {
        env::var("PAYMENT_STORE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/payments.json"))
    }

    pub fn default_content_dir() -> PathBuf {
        env::var("CONTENT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("content"))
    }

    pub fn default_catalog_path() -> Option<PathBuf> {
        env::var("CATALOG_FILE").ok().map(PathBuf::from)
    }

    pub fn default_mock_mode() -> bool {
        env::var("MOCK_MODE")
            .map(|s| s.eq_ignore_ascii_case("true") || s == "1")
            .unwrap_or(false)
    }

    pub fn default_backend_url() -> Url {
        env::var("LNBITS_URL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.parse().unwrap())
    }

    pub fn default_admin_key() -> String {
        env::var("LNBITS_ADMIN_KEY").unwrap_or_default()
    }

    pub fn default_invoice_key() -> String {
        env::var("LNBITS_API_KEY").unwrap_or_default()
    }

    pub fn default_backend_timeout_secs() -> u64 {
        env::var("LNBITS_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BACKEND_TIMEOUT_SECS)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// The configured signing secret, if any.
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn content_dir(&self) -> &Path {
        &self.content_dir
    }

    pub fn catalog_path(&self) -> Option<&Path> {
        self.catalog_path.as_deref()
    }

    pub fn mock_mode(&self) -> bool {
        self.mock_mode
    }

    pub fn backend(&self) -> &BackendConfig {
        &self.backend
    }

    /// Load configuration from CLI arguments and JSON file.
    ///
    /// The config file path comes from `--config <path>` or `$CONFIG`,
    /// defaulting to `./config.json`. A missing file is not an error:
    /// everything resolves via environment variables or defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        Self::load_from_path(cli_args.config)
    }

    fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}

impl BackendConfig {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn admin_key(&self) -> &str {
        &self.admin_key
    }

    pub fn invoice_key(&self) -> &str {
        &self.invoice_key
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load_from_path(PathBuf::from("/definitely/not/here.json")).unwrap();
        assert_eq!(config.port(), config_defaults::DEFAULT_PORT);
        assert!(!config.mock_mode());
        assert_eq!(
            config.backend().timeout(),
            Duration::from_secs(config_defaults::DEFAULT_BACKEND_TIMEOUT_SECS)
        );
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "port": 9000,
                "mock_mode": true,
                "store_path": "/tmp/p.json",
                "backend": { "url": "http://localhost:5001/", "timeout_secs": 3 }
            }"#,
        )
        .unwrap();
        let config = Config::load_from_path(path).unwrap();
        assert_eq!(config.port(), 9000);
        assert!(config.mock_mode());
        assert_eq!(config.store_path(), Path::new("/tmp/p.json"));
        assert_eq!(config.backend().url().as_str(), "http://localhost:5001/");
        assert_eq!(config.backend().timeout(), Duration::from_secs(3));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{nope").unwrap();
        assert!(matches!(
            Config::load_from_path(path),
            Err(ConfigError::JsonParse(_))
        ));
    }
}
