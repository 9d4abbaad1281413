//! Server configuration sourced from the environment.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Defaults applied when the corresponding variable is absent.
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7700";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_LOG_BUFFER_LINES: usize = 1024;
const DEFAULT_TEST_FAN_OUT: usize = 1;

/// Connection settings for the relational store.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
}

impl DbConfig {
    /// Connection string for the Postgres pool.
    pub fn connection_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Log filter, from `ROCKETSHIP_LOG`, then `RUST_LOG`, then `info`.
    pub log_filter: String,
    /// OIDC issuer; enables JWT validation when set.
    pub oidc_issuer: Option<String>,
    /// Expected audience for OIDC tokens.
    pub oidc_client_id: Option<String>,
    /// Static API tokens accepted as bearer credentials.
    pub api_tokens: Vec<String>,
    /// Relational store; presence makes authentication mandatory.
    pub db: Option<DbConfig>,
    /// Directory for ephemeral session files shared with external runners.
    pub run_dir: PathBuf,
    /// Default per-run test fan-out.
    pub test_fan_out: usize,
    /// Lines retained per run for late subscribers.
    pub log_buffer_lines: usize,
}

impl ServerConfig {
    /// Build configuration from `ROCKETSHIP_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = env_or("ROCKETSHIP_LISTEN_ADDR", DEFAULT_LISTEN_ADDR)
            .parse()
            .context("invalid ROCKETSHIP_LISTEN_ADDR")?;
        let log_filter = std::env::var("ROCKETSHIP_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());

        let db = match std::env::var("ROCKETSHIP_DB_HOST") {
            Ok(host) if !host.trim().is_empty() => Some(DbConfig {
                host,
                port: env_or("ROCKETSHIP_DB_PORT", "5432")
                    .parse()
                    .context("invalid ROCKETSHIP_DB_PORT")?,
                user: env_or("ROCKETSHIP_DB_USER", "rocketship"),
                password: env_or("ROCKETSHIP_DB_PASSWORD", ""),
                name: env_or("ROCKETSHIP_DB_NAME", "rocketship"),
            }),
            _ => None,
        };

        let run_dir = std::env::var("ROCKETSHIP_RUN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("rocketship"));

        let api_tokens = std::env::var("ROCKETSHIP_API_TOKENS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|token| !token.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            listen_addr,
            log_filter,
            oidc_issuer: non_empty_env("ROCKETSHIP_OIDC_ISSUER"),
            oidc_client_id: non_empty_env("ROCKETSHIP_OIDC_CLIENT_ID"),
            api_tokens,
            db,
            run_dir,
            test_fan_out: env_or("ROCKETSHIP_TEST_FAN_OUT", "")
                .parse()
                .unwrap_or(DEFAULT_TEST_FAN_OUT),
            log_buffer_lines: env_or("ROCKETSHIP_LOG_BUFFER_LINES", "")
                .parse()
                .unwrap_or(DEFAULT_LOG_BUFFER_LINES),
        })
    }

    /// Authentication is mandatory exactly when a relational store is
    /// configured; without one the server runs in local development mode.
    pub fn auth_required(&self) -> bool {
        self.db.is_some()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7700)),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            oidc_issuer: None,
            oidc_client_id: None,
            api_tokens: Vec::new(),
            db: None,
            run_dir: std::env::temp_dir().join("rocketship"),
            test_fan_out: DEFAULT_TEST_FAN_OUT,
            log_buffer_lines: DEFAULT_LOG_BUFFER_LINES,
        }
    }
}

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| fallback.to_string())
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
