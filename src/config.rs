use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::auth::{AccessLevel, ClientKey};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Display name shown on the interactive welcome screen.
    #[serde(default = "default_name")]
    pub name: String,
    /// Root directory for all server state (repositories, host key).
    pub data_path: PathBuf,
    /// Repository store directory, relative to `data_path`.
    #[serde(default = "default_repos_dir")]
    pub repos_dir: String,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub access: AccessConfig,
}

fn default_name() -> String {
    "Forgegate".to_string()
}

fn default_repos_dir() -> String {
    "repos".to_string()
}

impl Config {
    /// Absolute-or-relative root of the repository store.
    pub fn repos_path(&self) -> PathBuf {
        self.data_path.join(&self.repos_dir)
    }

    /// Host key location; relative paths are resolved against `data_path`.
    pub fn host_key_path(&self) -> PathBuf {
        let key_path = Path::new(&self.ssh.key_path);
        if key_path.is_absolute() {
            key_path.to_path_buf()
        } else {
            self.data_path.join(key_path)
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents).context("failed to parse config")?;
        validate_config(&config)?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// SSH
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Socket address for the SSH listener (e.g. `0.0.0.0:23231`).
    pub listen_addr: String,
    /// Host key file.  Generated on first start when missing.
    pub key_path: String,
    /// Maximum absolute session duration in seconds (0 = unlimited).
    pub max_timeout: u64,
    /// Maximum idle time between bytes in seconds (0 = unlimited).
    pub idle_timeout: u64,
    pub max_auth_attempts: usize,
    /// How long (seconds) a graceful shutdown waits for in-flight sessions.
    pub shutdown_grace: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:23231".to_string(),
            key_path: "ssh/forgegate_host_ed25519".to_string(),
            max_timeout: 0,
            idle_timeout: 0,
            max_auth_attempts: 6,
            shutdown_grace: 30,
        }
    }
}

impl SshConfig {
    pub fn max_timeout(&self) -> Option<Duration> {
        (self.max_timeout > 0).then(|| Duration::from_secs(self.max_timeout))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout > 0).then(|| Duration::from_secs(self.idle_timeout))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

// ---------------------------------------------------------------------------
// Access policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Level granted to sessions whose key matches no user.
    pub anon_access: AccessLevel,
    /// Accept sessions that present no public key at all.
    pub allow_keyless: bool,
    /// `authorized_keys` lines granted [`AccessLevel::Admin`] everywhere.
    pub admin_keys: Vec<String>,
    pub users: Vec<UserConfig>,
    /// Per-repository settings keyed by repository name.
    pub repos: HashMap<String, RepoConfig>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            anon_access: AccessLevel::ReadOnly,
            allow_keyless: true,
            admin_keys: Vec::new(),
            users: Vec::new(),
            repos: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub name: String,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default = "default_user_access")]
    pub access: AccessLevel,
}

fn default_user_access() -> AccessLevel {
    AccessLevel::ReadOnly
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub private: bool,
    /// User names granted read-write access.
    pub collaborators: Vec<String>,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    Config::from_yaml(&contents).with_context(|| format!("invalid config file: {}", path.display()))
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    let repos_dir = Path::new(&config.repos_dir);
    anyhow::ensure!(
        !config.repos_dir.is_empty()
            && repos_dir
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir)),
        "repos_dir must be a relative path inside data_path: {:?}",
        config.repos_dir
    );
    config
        .ssh
        .listen_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid ssh.listen_addr: {:?}", config.ssh.listen_addr))?;
    anyhow::ensure!(!config.ssh.key_path.is_empty(), "ssh.key_path must not be empty");
    anyhow::ensure!(config.ssh.max_auth_attempts > 0, "ssh.max_auth_attempts must be at least 1");

    for line in &config.access.admin_keys {
        ClientKey::parse_authorized(line).context("invalid entry in access.admin_keys")?;
    }
    for user in &config.access.users {
        anyhow::ensure!(!user.name.is_empty(), "access.users entries need a name");
        for line in &user.keys {
            ClientKey::parse_authorized(line)
                .with_context(|| format!("invalid key for user {:?}", user.name))?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
