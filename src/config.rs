use anyhow::{Context, Result};
use rand::{Rng, distributions::Alphanumeric, rngs::OsRng};
use ipnet::IpNet;
use serde::{Deserialize, Deserializer, de};
use std::{fs, path::Path, time::Duration};

use crate::address::Address;
use crate::security::parse_allowlist;

pub const CONFIG_FILE: &str = "config.toml";
const GENERATED_KEY_LEN: usize = 25;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub hub: HubConfig,
    pub status: StatusConfig,
    pub control_plane: ControlPlaneConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub bind: String,
    pub port: u16,
    pub xbox_authentication: bool,
    pub handshake_timeout_secs: u64,
    pub duplicate_login: DuplicateLogin,
}

/// What happens when a second login arrives with an identity that already
/// has a live session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateLogin {
    /// The new session takes over the table entry; the old one keeps
    /// running until its own connections end.
    #[default]
    Replace,
    DisconnectPrevious,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub server_name: String,
    pub max_players: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    pub key: String,
    /// Single addresses or CIDR ranges, validated when the file is loaded.
    #[serde(deserialize_with = "deserialize_allowlist")]
    pub allowed_ips: Option<Vec<IpNet>>,
    pub max_attempts: u32,
    pub cooldown_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 19132,
            xbox_authentication: false,
            handshake_timeout_secs: 10,
            duplicate_login: DuplicateLogin::default(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 19133,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            server_name: "Game Relay".to_string(),
            max_players: 50,
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "0.0.0.0".to_string(),
            port: 42069,
            key: String::new(),
            allowed_ips: None,
            max_attempts: 3,
            cooldown_secs: 300,
        }
    }
}

impl Config {
    #[must_use]
    pub fn hub_address(&self) -> Address {
        Address::new(self.hub.host.clone(), self.hub.port)
    }

    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.proxy.bind, self.proxy.port)
    }

    #[must_use]
    pub fn control_address(&self) -> String {
        format!("{}:{}", self.control_plane.bind, self.control_plane.port)
    }

    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.handshake_timeout_secs)
    }

    /// Fills in a random control-plane key when none is configured.
    /// Returns true if a key was generated.
    pub fn ensure_control_key(&mut self) -> bool {
        if !self.control_plane.key.is_empty() {
            return false;
        }
        self.control_plane.key = generate_key();
        true
    }
}

/// Random alphanumeric secret drawn from the operating system's CSPRNG.
#[must_use]
pub fn generate_key() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(GENERATED_KEY_LEN)
        .map(char::from)
        .collect()
}

fn deserialize_allowlist<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<IpNet>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Vec<String>>::deserialize(deserializer)?
        .map(|entries| parse_allowlist(&entries).map_err(de::Error::custom))
        .transpose()
}

pub fn load_config() -> Result<Config> {
    load_config_from(CONFIG_FILE)
}

pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}
