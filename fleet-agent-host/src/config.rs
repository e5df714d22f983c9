//! Configuration management
//!
//! Handles:
//! - Control store account credentials (environment)
//! - Agent settings file (`settings.toml` in the agent home)
//! - Persistent node identity (`nodeid.json`)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const USER_VAR: &str = "FLEET_AGENT_STORE_USER";
pub const PASS_VAR: &str = "FLEET_AGENT_STORE_PASS";
pub const HOME_VAR: &str = "FLEET_AGENT_HOME";

pub const SETTINGS_FILE: &str = "settings.toml";
pub const NODE_ID_FILE: &str = "nodeid.json";

const SETTINGS_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is missing or empty")]
    MissingCredential(&'static str),
    #[error("could not determine the agent home directory (set FLEET_AGENT_HOME)")]
    NoHome,
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid settings in {}: {source}", .path.display())]
    Invalid {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid node identity in {}: {source}", .path.display())]
    Identity {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Control store account, never written to disk
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |name: &'static str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .ok_or(ConfigError::MissingCredential(name))
        };
        Ok(Self {
            user: read(USER_VAR)?,
            password: read(PASS_VAR)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub store: StoreSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub pools: PoolSettings,
    #[serde(default)]
    pub console: ConsoleSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_root_topic")]
    pub root_topic: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub shell: String,
    pub command_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub audit_interval_secs: u64,
    pub stale_after_days: i64,
    pub refresh_batch: usize,
    pub virsh: String,
    pub rbd: String,
    pub connect_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSettings {
    pub channel_label: String,
    pub cols: u16,
    pub rows: u16,
    /// Falls back to `agent.shell`
    pub shell: Option<String>,
}

fn default_port() -> u16 {
    1883
}

fn default_root_topic() -> String {
    "fleet".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            command_timeout_secs: 600,
            heartbeat_interval_secs: 30,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            audit_interval_secs: 300,
            stale_after_days: 7,
            refresh_batch: 1,
            virsh: "virsh".to_string(),
            rbd: "rbd".to_string(),
            connect_uri: None,
        }
    }
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            channel_label: "console".to_string(),
            cols: 80,
            rows: 30,
            shell: None,
        }
    }
}

impl Settings {
    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Invalid {
            path: path.to_path_buf(),
            source,
        })
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(path, &content)
    }

    /// Wait until the settings file exists, then load it
    pub async fn wait_and_load(path: &Path) -> Result<Self, ConfigError> {
        wait_for(path, SETTINGS_POLL).await;
        Self::load(path).await
    }
}

/// `$FLEET_AGENT_HOME`, or `fleet-agent` under the OS config directory
pub fn agent_home() -> Result<PathBuf, ConfigError> {
    if let Some(home) = std::env::var_os(HOME_VAR).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    let mut path = dirs::config_dir().ok_or(ConfigError::NoHome)?;
    path.push("fleet-agent");
    Ok(path)
}

/// Poll until `path` exists, logging once
pub async fn wait_for(path: &Path, every: Duration) {
    let mut logged = false;
    while !tokio::fs::try_exists(path).await.unwrap_or(false) {
        if !logged {
            warn!(
                "Settings file {} not found - waiting for it to be provisioned",
                path.display()
            );
            logged = true;
        }
        tokio::time::sleep(every).await;
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeIdFile {
    nodeid: String,
}

/// This host's stable node id
#[derive(Debug, Clone, PartialEq)]
pub struct NodeIdentity {
    pub id: String,
    /// The id file did not exist before this run
    pub created: bool,
}

impl NodeIdentity {
    pub async fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let file: NodeIdFile = serde_json::from_str(&content).map_err(|source| ConfigError::Identity {
                    path: path.to_path_buf(),
                    source,
                })?;
                Ok(Self {
                    id: file.nodeid,
                    created: false,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let id = Uuid::new_v4().to_string();
                let write_err = |source| ConfigError::Write {
                    path: path.to_path_buf(),
                    source,
                };
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
                }
                let content = serde_json::json!({ "nodeid": id }).to_string();
                tokio::fs::write(path, content).await.map_err(write_err)?;
                info!("Generated node id {} in {}", id, path.display());
                Ok(Self { id, created: true })
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}
