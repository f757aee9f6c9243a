use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;

use crate::constants::{DEFAULT_DEVICE_TYPE, DEFAULT_ENDPOINT_PATH, DEFAULT_PROTOCOL_VERSION};
use crate::pending::AccountId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    /// Retry, timeout and scheduling knobs
    #[serde(default)]
    pub engine: EngineConfig,
    /// Desktop notification settings
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Raise desktop notifications for failures that need the user
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Stable local id; keys every persisted record of the account
    pub id: AccountId,
    pub email: String,
    /// Login name, if different from the email address
    #[serde(default)]
    pub username: Option<String>,
    pub server: ServerConfig,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    /// Per-account notification override (None = use global setting)
    #[serde(default)]
    pub notifications: Option<bool>,
    /// Folder server ids the long-poll watches for changes
    #[serde(default)]
    pub watch_folders: Vec<String>,
}

impl AccountConfig {
    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.email)
    }

    /// Device id derived from the account, stable across restarts.
    pub fn device_id(&self) -> String {
        let digest = Sha256::digest(format!("{}:{}", self.email, self.server.host).as_bytes());
        digest[..16].iter().map(|b| format!("{:02X}", b)).collect()
    }

    #[cfg(test)]
    pub fn for_tests(id: AccountId, email: &str) -> Self {
        Self {
            id,
            email: email.to_string(),
            username: None,
            server: ServerConfig {
                host: "mail.example.com".to_string(),
                port: default_port(),
                path: default_path(),
                tls: true,
            },
            device_type: default_device_type(),
            notifications: None,
            watch_folders: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_true")]
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Transport attempts per exchange, including the first
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Each transport retry waits this much longer than the previous attempt
    #[serde(default = "default_timeout_expander")]
    pub timeout_expander: f64,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,
    /// Longer server back-off requests fail the exchange instead of waiting
    #[serde(default = "default_max_retry_after_secs")]
    pub max_retry_after_secs: u64,
    /// Defers a new pending operation may consume before it fails
    #[serde(default = "default_defers")]
    pub default_defers: u32,
    /// Items per MoveItems request
    #[serde(default = "default_move_batch")]
    pub move_batch: usize,
    /// Added to the heartbeat to get the long-poll request timeout
    #[serde(default = "default_ping_slack_secs")]
    pub ping_slack_secs: u64,
    #[serde(default = "default_heartbeat_min_secs")]
    pub heartbeat_min_secs: u32,
    #[serde(default = "default_heartbeat_max_secs")]
    pub heartbeat_max_secs: u32,
    /// Idle wait between passes when no folders are watched
    #[serde(default = "default_wait_interval_secs")]
    pub wait_interval_secs: u64,
    /// Protocol version an account starts with, before discovery negotiates one
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            command_timeout_secs: default_command_timeout_secs(),
            timeout_expander: default_timeout_expander(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            max_retry_after_secs: default_max_retry_after_secs(),
            default_defers: default_defers(),
            move_batch: default_move_batch(),
            ping_slack_secs: default_ping_slack_secs(),
            heartbeat_min_secs: default_heartbeat_min_secs(),
            heartbeat_max_secs: default_heartbeat_max_secs(),
            wait_interval_secs: default_wait_interval_secs(),
            protocol_version: default_protocol_version(),
        }
    }
}

fn default_port() -> u16 {
    443
}

fn default_path() -> String {
    DEFAULT_ENDPOINT_PATH.to_string()
}

fn default_device_type() -> String {
    DEFAULT_DEVICE_TYPE.to_string()
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_tries() -> u32 {
    3
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_timeout_expander() -> f64 {
    1.2
}

fn default_retry_initial_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_secs() -> u64 {
    30
}

fn default_max_retry_after_secs() -> u64 {
    120
}

fn default_defers() -> u32 {
    3
}

fn default_move_batch() -> usize {
    16
}

fn default_ping_slack_secs() -> u64 {
    30
}

fn default_heartbeat_min_secs() -> u32 {
    60
}

fn default_heartbeat_max_secs() -> u32 {
    1680
}

fn default_wait_interval_secs() -> u64 {
    300
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("airsync");
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let dir = dirs::data_local_dir()
            .context("Could not find data directory")?
            .join("airsync");
        Ok(dir)
    }

    pub fn database_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("airsync.db"))
    }

    pub fn account(&self, id: AccountId) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == id)
    }

    /// Check if notifications are enabled for an account
    pub fn notifications_enabled_for(&self, account: &AccountConfig) -> bool {
        // Per-account setting overrides global
        account.notifications.unwrap_or(self.notifications.enabled)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            anyhow::bail!(
                "Configuration file not found at {}\n\
                 Please create a config file. Example:\n\n\
                 [[accounts]]\n\
                 id = 1\n\
                 email = \"you@example.com\"\n\n\
                 [accounts.server]\n\
                 host = \"mail.example.com\"",
                path.display()
            );
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;

        let mut ids = std::collections::HashSet::new();
        for account in &config.accounts {
            if !ids.insert(account.id) {
                anyhow::bail!("Duplicate account id {}", account.id);
            }
        }

        Ok(config)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(Self::config_dir()?)?;
        fs::create_dir_all(Self::data_dir()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multi_account_config() {
        let toml = r#"
            [[accounts]]
            id = 1
            email = "test@example.com"

            [accounts.server]
            host = "mail.example.com"

            [[accounts]]
            id = 2
            email = "work@example.com"
            username = "DOMAIN\\work"
            notifications = false
            watch_folders = ["5", "7"]

            [accounts.server]
            host = "eas.work.com"
            port = 8443
            tls = false

            [engine]
            max_tries = 5
            default_defers = 1

            [notifications]
            enabled = true
        "#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[0].server.port, 443);
        assert_eq!(config.accounts[0].server.path, "/Microsoft-Server-ActiveSync");
        assert_eq!(config.accounts[0].username(), "test@example.com");
        assert_eq!(config.accounts[1].username(), "DOMAIN\\work");
        assert_eq!(config.accounts[1].watch_folders, vec!["5", "7"]);
        assert!(!config.accounts[1].server.tls);
        assert_eq!(config.engine.max_tries, 5);
        assert_eq!(config.engine.default_defers, 1);
        assert_eq!(config.engine.timeout_expander, 1.2);
        assert!(!config.notifications_enabled_for(&config.accounts[1]));
        assert!(config.notifications_enabled_for(&config.accounts[0]));
    }

    #[test]
    fn test_duplicate_account_ids_rejected() {
        let toml = r#"
            [[accounts]]
            id = 1
            email = "a@example.com"
            [accounts.server]
            host = "mail.example.com"

            [[accounts]]
            id = 1
            email = "b@example.com"
            [accounts.server]
            host = "mail.example.com"
        "#;

        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_device_id_is_stable() {
        let account = AccountConfig::for_tests(1, "a@example.com");
        let other = AccountConfig::for_tests(1, "b@example.com");
        assert_eq!(account.device_id(), account.device_id());
        assert_eq!(account.device_id().len(), 32);
        assert_ne!(account.device_id(), other.device_id());
    }
}
