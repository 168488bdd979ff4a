//! Configuration for bonjou.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BONJOU_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/bonjou/config.toml
//!   3. ~/.config/bonjou/config.toml
//!
//! The file is only ever read. bonjou keeps no state across restarts.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::frame::MAX_FRAME_LEN;
use crate::transfer::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::wire::{BEACON_INTERVAL_MS, DISCOVERY_PORT, PEER_TTL_FACTOR, SESSION_PORT};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BonjouConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name shown to other peers. Clamped to 64 bytes.
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port for beacons. 0 = OS-assigned (tests).
    pub discovery_port: u16,
    /// TCP port for sessions. 0 = OS-assigned (tests).
    pub session_port: u16,
    /// Local address both sockets bind to.
    pub bind_addr: IpAddr,
    /// Beacon destinations. A bare IP uses `discovery_port`.
    pub broadcast_addrs: Vec<String>,
    /// Also beacon to every up IPv4 interface's directed broadcast address.
    pub interface_broadcast: bool,
    /// Ignore beacons from outside the local subnet.
    pub same_subnet_only: bool,
    pub beacon_interval_ms: u64,
    /// Peer TTL. 0 = PEER_TTL_FACTOR × beacon interval.
    pub peer_ttl_ms: u64,
    pub sweep_interval_ms: u64,
    /// Largest frame body accepted on a session.
    pub max_frame_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Where accepted files land.
    pub download_dir: PathBuf,
    pub chunk_size: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        let display_name = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "bonjou".to_string());
        Self { display_name }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: DISCOVERY_PORT,
            session_port: SESSION_PORT,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_addrs: vec![Ipv4Addr::BROADCAST.to_string()],
            interface_broadcast: true,
            same_subnet_only: true,
            beacon_interval_ms: BEACON_INTERVAL_MS,
            peer_ttl_ms: 0,
            sweep_interval_ms: 1000,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: download_dir(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("bonjou")
}

fn download_dir() -> PathBuf {
    std::env::var("XDG_DOWNLOAD_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join("Downloads"))
        .join("bonjou")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("invalid broadcast address {0:?}")]
    InvalidTarget(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BonjouConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            BonjouConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BONJOU_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply BONJOU_* overrides. Values that fail to parse are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("BONJOU_IDENTITY__DISPLAY_NAME") {
            self.identity.display_name = v;
        }
        if let Some(p) = lookup("BONJOU_NETWORK__DISCOVERY_PORT").and_then(|v| v.parse().ok()) {
            self.network.discovery_port = p;
        }
        if let Some(p) = lookup("BONJOU_NETWORK__SESSION_PORT").and_then(|v| v.parse().ok()) {
            self.network.session_port = p;
        }
        if let Some(a) = lookup("BONJOU_NETWORK__BIND_ADDR").and_then(|v| v.parse().ok()) {
            self.network.bind_addr = a;
        }
        if let Some(v) = lookup("BONJOU_NETWORK__BROADCAST_ADDRS") {
            let addrs: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !addrs.is_empty() {
                self.network.broadcast_addrs = addrs;
            }
        }
        if let Some(b) = lookup("BONJOU_NETWORK__INTERFACE_BROADCAST").and_then(|v| v.parse().ok()) {
            self.network.interface_broadcast = b;
        }
        if let Some(b) = lookup("BONJOU_NETWORK__SAME_SUBNET_ONLY").and_then(|v| v.parse().ok()) {
            self.network.same_subnet_only = b;
        }
        if let Some(ms) = lookup("BONJOU_NETWORK__BEACON_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            if ms > 0 {
                self.network.beacon_interval_ms = ms;
            }
        }
        if let Some(v) = lookup("BONJOU_TRANSFER__DOWNLOAD_DIR") {
            self.transfer.download_dir = PathBuf::from(v);
        }
        if let Some(size) = lookup("BONJOU_TRANSFER__CHUNK_SIZE").and_then(|v| v.parse::<u32>().ok()) {
            if size > 0 && size <= MAX_CHUNK_SIZE {
                self.transfer.chunk_size = size;
            }
        }
    }
}

impl NetworkConfig {
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms.max(1))
    }

    pub fn peer_ttl(&self) -> Duration {
        if self.peer_ttl_ms == 0 {
            self.beacon_interval() * PEER_TTL_FACTOR
        } else {
            Duration::from_millis(self.peer_ttl_ms)
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Resolve `broadcast_addrs` into socket addresses.
    pub fn broadcast_targets(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.broadcast_addrs
            .iter()
            .map(|raw| {
                if let Ok(addr) = raw.parse::<SocketAddr>() {
                    return Ok(addr);
                }
                raw.parse::<IpAddr>()
                    .map(|ip| SocketAddr::new(ip, self.discovery_port))
                    .map_err(|_| ConfigError::InvalidTarget(raw.clone()))
            })
            .collect()
    }
}
