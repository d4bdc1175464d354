use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Upper bound for every configured lifetime (codes, links, sessions)
pub const MAX_TTL_DAYS: i64 = 3650;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Name of the document file inside `server.data_dir`
    #[serde(default = "default_file_name")]
    pub file_name: String,
    /// How long a `.bak` copy survives after a successful save (default: 300)
    #[serde(default = "default_backup_grace_secs")]
    pub backup_grace_secs: u64,
    /// Maximum number of save requests waiting on the writer
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Interval between sweeps of expired one-time codes (default: 60)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            file_name: default_file_name(),
            backup_grace_secs: default_backup_grace_secs(),
            queue_capacity: default_queue_capacity(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl StorageConfig {
    pub fn backup_grace(&self) -> Duration {
        Duration::from_secs(self.backup_grace_secs)
    }
}

fn default_file_name() -> String {
    "db.json".to_string()
}

fn default_backup_grace_secs() -> u64 {
    5 * 60
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for bearer tokens. Generated per process when absent,
    /// which invalidates every session on restart.
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: i64,
    /// Seed account created at boot, pre-verified and pre-approved
    #[serde(default)]
    pub superadmin_email: Option<String>,
    #[serde(default)]
    pub superadmin_password: Option<String>,
    #[serde(default = "default_superadmin_first_name")]
    pub superadmin_first_name: String,
    #[serde(default = "default_superadmin_last_name")]
    pub superadmin_last_name: String,
    /// Accounts that receive a token directly instead of a 2FA challenge
    #[serde(default)]
    pub two_factor_bypass: Vec<String>,
    #[serde(default = "default_code_ttl_minutes")]
    pub code_ttl_minutes: i64,
    #[serde(default = "default_two_factor_ttl_minutes")]
    pub two_factor_ttl_minutes: i64,
    #[serde(default = "default_link_ttl_days")]
    pub link_ttl_days: i64,
    #[serde(default = "default_password_min_length")]
    pub password_min_length: usize,
    /// Upper bound for a single password hash comparison
    #[serde(default = "default_password_timeout_secs")]
    pub password_timeout_secs: u64,
    /// Base URL used to build faculty verification links
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_ttl_hours: default_token_ttl_hours(),
            superadmin_email: None,
            superadmin_password: None,
            superadmin_first_name: default_superadmin_first_name(),
            superadmin_last_name: default_superadmin_last_name(),
            two_factor_bypass: Vec::new(),
            code_ttl_minutes: default_code_ttl_minutes(),
            two_factor_ttl_minutes: default_two_factor_ttl_minutes(),
            link_ttl_days: default_link_ttl_days(),
            password_min_length: default_password_min_length(),
            password_timeout_secs: default_password_timeout_secs(),
            public_url: default_public_url(),
        }
    }
}

impl AuthConfig {
    pub fn bypasses_two_factor(&self, email: &str) -> bool {
        self.two_factor_bypass
            .iter()
            .any(|e| e.eq_ignore_ascii_case(email))
    }

    pub fn password_timeout(&self) -> Duration {
        Duration::from_secs(self.password_timeout_secs)
    }
}

fn default_token_ttl_hours() -> i64 {
    24
}

fn default_superadmin_first_name() -> String {
    "Super".to_string()
}

fn default_superadmin_last_name() -> String {
    "Admin".to_string()
}

fn default_code_ttl_minutes() -> i64 {
    10
}

fn default_two_factor_ttl_minutes() -> i64 {
    10
}

fn default_link_ttl_days() -> i64 {
    7
}

fn default_password_min_length() -> usize {
    6
}

fn default_password_timeout_secs() -> u64 {
    5
}

fn default_public_url() -> String {
    "http://localhost:3000".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    #[serde(default = "default_smtp_tls")]
    pub smtp_tls: bool,
    pub from_address: Option<String>,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    /// Upper bound for one outbound delivery attempt
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: None,
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            smtp_tls: default_smtp_tls(),
            from_address: None,
            from_name: default_from_name(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

impl EmailConfig {
    /// Delivery needs at least a relay host and a sender address
    pub fn is_configured(&self) -> bool {
        self.smtp_host.as_deref().is_some_and(|h| !h.is_empty())
            && self.from_address.as_deref().is_some_and(|a| !a.is_empty())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_tls() -> bool {
    true
}

fn default_from_name() -> String {
    "Scheduling Portal".to_string()
}

fn default_send_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| "Failed to parse configuration file")?;
            config.validate()?;
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    /// Reject lifetimes that would overflow a timestamp
    pub fn validate(&self) -> Result<()> {
        let auth = &self.auth;
        let max_minutes = MAX_TTL_DAYS * 24 * 60;
        ensure!(
            (1..=MAX_TTL_DAYS * 24).contains(&auth.token_ttl_hours),
            "auth.token_ttl_hours must be between 1 and {}",
            MAX_TTL_DAYS * 24
        );
        ensure!(
            (1..=max_minutes).contains(&auth.code_ttl_minutes),
            "auth.code_ttl_minutes must be between 1 and {}",
            max_minutes
        );
        ensure!(
            (1..=max_minutes).contains(&auth.two_factor_ttl_minutes),
            "auth.two_factor_ttl_minutes must be between 1 and {}",
            max_minutes
        );
        ensure!(
            (1..=MAX_TTL_DAYS).contains(&auth.link_ttl_days),
            "auth.link_ttl_days must be between 1 and {}",
            MAX_TTL_DAYS
        );
        Ok(())
    }

    /// Full path of the persisted document
    pub fn store_path(&self) -> PathBuf {
        self.server.data_dir.join(&self.storage.file_name)
    }
}
