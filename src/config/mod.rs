use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

use crate::types::error::SyncError;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Address used for the account owner in From/To headers
    pub identity: Option<String>,

    /// Display name for the account owner
    pub identity_name: Option<String>,

    /// Message databases or backup directories to read
    #[serde(default)]
    pub sources: Vec<String>,

    /// IMAP destination
    pub imap: Option<ImapConfig>,

    #[serde(default)]
    pub sync: SyncSettings,

    /// Contact overrides keyed by phone number or email
    #[serde(default)]
    pub contacts: HashMap<String, ContactEntry>,
}

/// IMAP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    /// IMAP server hostname
    pub host: String,

    /// IMAP server port (TLS)
    #[serde(default = "default_imap_port")]
    pub port: u16,

    /// Authentication method
    pub auth: AuthConfig,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Username (usually email address)
    pub user: String,
    /// Password (can use command for keychain integration)
    pub password: PasswordSource,
}

/// Password source - can be raw value or command to execute
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PasswordSource {
    /// Raw password value
    Raw(String),
    /// Command to execute to get password
    Command { command: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    Windowed,
    Full,
}

/// Sync behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Destination mailbox
    #[serde(default = "default_mailbox")]
    pub mailbox: String,

    /// Documents per FETCH when reading provenance headers
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: u32,

    /// Upper bound for one APPENDed document in bytes, 0 = unbounded
    #[serde(default = "default_max_document_size")]
    pub max_document_size: usize,

    /// How to discover already delivered messages
    #[serde(default = "default_index_mode")]
    pub index: IndexMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactEntry {
    pub name: Option<String>,
    pub email: Option<String>,
}

fn default_imap_port() -> u16 {
    993
}

fn default_mailbox() -> String {
    "iMessage".to_string()
}

fn default_fetch_batch_size() -> u32 {
    1000
}

fn default_max_document_size() -> usize {
    25_000_000
}

fn default_index_mode() -> IndexMode {
    IndexMode::Windowed
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            mailbox: default_mailbox(),
            fetch_batch_size: default_fetch_batch_size(),
            max_document_size: default_max_document_size(),
            index: default_index_mode(),
        }
    }
}

impl AppConfig {
    pub fn imap(&self) -> Result<&ImapConfig, SyncError> {
        self.imap
            .as_ref()
            .ok_or_else(|| SyncError::Config("No [imap] section in configuration".to_string()))
    }

    /// Owner address, defaulting to the IMAP login
    pub fn identity_email(&self) -> Option<String> {
        self.identity
            .clone()
            .or_else(|| self.imap.as_ref().map(|i| i.auth.user.clone()))
    }
}

impl PasswordSource {
    pub fn resolve(&self) -> Result<String, SyncError> {
        match self {
            PasswordSource::Raw(password) => Ok(password.clone()),
            PasswordSource::Command { command } => {
                info!("Executing password command");
                let output = Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .output()
                    .map_err(|e| {
                        SyncError::Config(format!("Failed to run password command: {}", e))
                    })?;

                if !output.status.success() {
                    return Err(SyncError::Config("Password command failed".to_string()));
                }

                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
        }
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // XDG config path
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("imessage-sync").join("config.toml"));
    }

    // Home directory fallback
    if let Some(home_dir) = dirs::home_dir() {
        paths.push(
            home_dir
                .join(".config")
                .join("imessage-sync")
                .join("config.toml"),
        );
        paths.push(home_dir.join(".imessage_sync"));
    }

    paths
}

/// Load configuration from `path`, or the first default path that exists
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, SyncError> {
    if let Some(path) = path {
        return load_config_from_path(path);
    }

    for path in default_config_paths() {
        if path.exists() {
            info!("Found config at: {:?}", path);
            return load_config_from_path(&path);
        }
    }

    info!("No config file found, using empty config");
    Ok(AppConfig::default())
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<AppConfig, SyncError> {
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("Failed to read config: {}", e)))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<AppConfig, SyncError> {
    toml::from_str(content).map_err(|e| SyncError::Config(format!("Failed to parse config: {}", e)))
}
