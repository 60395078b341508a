//! Environment-driven configuration.
//!
//! All recognized keys share the `MODULAR_API_` prefix. `from_env` reads a
//! `.env` file when present, then the process environment; parse failures
//! name the offending key.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{bail, Context};
use semver::Version;

pub const DEFAULT_PORT: u16 = 8085;
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_RATE_LIMIT: u32 = 10;

/// Which document backend family the deployment runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Hosted,
    SelfHosted,
}

#[derive(Clone)]
pub struct Config {
    /// Signs bearer tokens and integrity fingerprints.
    pub secret_key: String,
    pub mode: StoreMode,
    /// `None` disables the limiter.
    pub calls_per_second_limit: Option<u32>,
    pub min_cli_version: Option<Version>,
    pub private_mode: bool,
    pub server_log_level: String,
    pub cli_log_level: String,
    pub log_path: Option<PathBuf>,
    /// Root of the document collections for the bundled file backend.
    pub data_path: PathBuf,
    /// Directory the registry scans for installed modules.
    pub modules_path: PathBuf,
    pub bind_addr: SocketAddr,
    pub upstream_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let secret_key = std::env::var("MODULAR_API_SECRET_KEY")
            .context("MODULAR_API_SECRET_KEY is required")?;
        if secret_key.len() < 16 {
            bail!("MODULAR_API_SECRET_KEY must be at least 16 bytes");
        }

        let mode = match std::env::var("MODULAR_API_MODE").as_deref() {
            Err(_) | Ok("self-hosted") => StoreMode::SelfHosted,
            Ok("hosted") => StoreMode::Hosted,
            Ok(other) => bail!("MODULAR_API_MODE must be 'hosted' or 'self-hosted', got {other:?}"),
        };

        let calls_per_second_limit = match std::env::var("MODULAR_API_CALLS_PER_SECOND_LIMIT") {
            Err(_) => Some(DEFAULT_RATE_LIMIT),
            Ok(raw) if raw.eq_ignore_ascii_case("disabled") => None,
            Ok(raw) => Some(
                raw.parse::<u32>()
                    .with_context(|| format!("invalid MODULAR_API_CALLS_PER_SECOND_LIMIT {raw:?}"))?,
            ),
        };

        let min_cli_version = match std::env::var("MODULAR_API_MIN_CLI_VERSION") {
            Err(_) => None,
            Ok(raw) => Some(
                raw.parse::<Version>()
                    .with_context(|| format!("invalid MODULAR_API_MIN_CLI_VERSION {raw:?}"))?,
            ),
        };

        let private_mode = std::env::var("MODULAR_API_ENABLE_PRIVATE_MODE")
            .map(|raw| matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);

        let server_log_level =
            std::env::var("MODULAR_API_SERVER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let cli_log_level =
            std::env::var("MODULAR_API_CLI_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
        let log_path = std::env::var("MODULAR_API_LOG_PATH").ok().map(PathBuf::from);

        let data_path = std::env::var("MODULAR_API_DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let modules_path = std::env::var("MODULAR_API_MODULES_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./modules"));

        let host: IpAddr = match std::env::var("MODULAR_API_HOST") {
            Err(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid MODULAR_API_HOST {raw:?}"))?,
        };
        let port: u16 = match std::env::var("MODULAR_API_PORT") {
            Err(_) => DEFAULT_PORT,
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid MODULAR_API_PORT {raw:?}"))?,
        };

        let upstream_timeout_secs = match std::env::var("MODULAR_API_UPSTREAM_TIMEOUT_SECS") {
            Err(_) => DEFAULT_UPSTREAM_TIMEOUT_SECS,
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid MODULAR_API_UPSTREAM_TIMEOUT_SECS {raw:?}"))?,
        };

        let config = Self {
            secret_key,
            mode,
            calls_per_second_limit,
            min_cli_version,
            private_mode,
            server_log_level,
            cli_log_level,
            log_path,
            data_path,
            modules_path,
            bind_addr: SocketAddr::new(host, port),
            upstream_timeout_secs,
        };
        tracing::info!(
            mode = ?config.mode,
            bind = %config.bind_addr,
            rate_limit = ?config.calls_per_second_limit,
            "configuration loaded"
        );
        Ok(config)
    }
}

// The secret key must never end up in logs through a stray {:?}.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("secret_key", &"<redacted>")
            .field("mode", &self.mode)
            .field("calls_per_second_limit", &self.calls_per_second_limit)
            .field("min_cli_version", &self.min_cli_version)
            .field("private_mode", &self.private_mode)
            .field("data_path", &self.data_path)
            .field("modules_path", &self.modules_path)
            .field("bind_addr", &self.bind_addr)
            .field("upstream_timeout_secs", &self.upstream_timeout_secs)
            .finish_non_exhaustive()
    }
}
