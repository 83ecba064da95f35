use std::net::SocketAddr;

use clap::Parser;
use serde::Deserialize;

use remitdesk_core::DeskSettings;

#[derive(Parser, Debug)]
#[command(name = "remitdesk", about = "RemitDesk - multi-currency staff ledger for a remittance desk")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "remitdesk.toml")]
    pub config: String,

    /// Port to listen on (overrides config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// SQLite database path; selects the sqlite backend (overrides config file)
    #[arg(short, long)]
    pub database: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub desk: DeskSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageKind,

    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageKind::Memory,
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// When true, all API endpoints (except /health and /metrics) require authentication.
    #[serde(default)]
    pub enabled: bool,

    /// Static API keys. Each key has a name (for audit) and a role.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Day-to-day desk work: customer transactions, deposits, expenses, transfers.
    Clerk,
    /// Everything a clerk can do, plus staff registration, rates and deletions.
    Admin,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiKeyEntry {
    pub name: String,
    pub key: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::Clerk
}

fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_path() -> String {
    "remitdesk.db".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: default_server(),
            logging: default_logging(),
            auth: AuthConfig::default(),
            storage: StorageConfig::default(),
            desk: DeskSettings::default(),
        }
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Config::default()
            }),
            Err(_) => Config::default(),
        };

        // CLI overrides
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }
        if let Some(ref path) = cli.database {
            config.storage.backend = StorageKind::Sqlite;
            config.storage.path = path.clone();
        }

        config
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.storage.backend, StorageKind::Memory);
        assert_eq!(config.desk.currencies.primary.as_ref(), "SAR");
        assert_eq!(config.desk.house_accounts.secondary.as_ref(), "9");
        assert!(!config.auth.enabled);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [server]
            host = "127.0.0.1"
            port = 8080

            [logging]
            level = "debug"
            json = true

            [storage]
            backend = "sqlite"
            path = "/var/lib/remitdesk/desk.db"

            [desk.currencies]
            home = "PKR"
            primary = "SAR"
            secondary = "AED"

            [desk.house_accounts]
            primary = "101"
            secondary = "102"

            [auth]
            enabled = true

            [[auth.api_keys]]
            name = "front-desk"
            key = "k1"

            [[auth.api_keys]]
            name = "owner"
            key = "k2"
            role = "admin"
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr().unwrap().port(), 8080);
        assert!(config.logging.json);
        assert_eq!(config.storage.backend, StorageKind::Sqlite);
        assert_eq!(config.desk.currencies.home.as_ref(), "PKR");
        assert_eq!(config.desk.house_accounts.primary.as_ref(), "101");
        assert_eq!(config.auth.api_keys[0].role, Role::Clerk);
        assert_eq!(config.auth.api_keys[1].role, Role::Admin);
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(Config::parse("[storage]\nbackend = \"postgres\"").is_err());
    }

    #[test]
    fn test_bad_listen_addr() {
        let mut config = Config::default();
        config.server.host = "not a host".to_string();
        assert!(config.listen_addr().is_err());
    }
}
