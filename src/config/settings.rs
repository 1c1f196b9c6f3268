use crate::{DccError, Result};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub network: NetworkSettings,
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Local address listening sockets bind to.
    pub bind_address: Ipv4Addr,
    /// Address advertised to peers in offers. Detected when unset.
    pub public_address: Option<Ipv4Addr>,
    /// Restricts listening sockets to this inclusive port range.
    pub port_range: Option<PortRange>,
    /// Offer files passively (peer listens, we connect) by default.
    pub passive_send: bool,
    /// How long a transfer may sit in `WaitingRemote`.
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub download_dir: Option<PathBuf>,
    pub create_folder: bool,
    pub auto_accept: bool,
    pub auto_resume: bool,
    pub chunk_size: usize,
    pub write_cache_ceiling: usize,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bind_address: Ipv4Addr::UNSPECIFIED,
            public_address: None,
            port_range: None,
            passive_send: false,
            timeout_seconds: 180,
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            download_dir: None,
            create_folder: true,
            auto_accept: false,
            auto_resume: true,
            chunk_size: 8 * 1024,
            write_cache_ceiling: 1024 * 1024,
        }
    }
}

impl Settings {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = match config_path {
            Some(path) => PathBuf::from(path),
            None => Self::default_config_path()?,
        };

        if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| DccError::Config(format!("Failed to read config: {}", e)))?;

            let settings: Settings = toml::from_str(&content)
                .map_err(|e| DccError::Config(format!("Failed to parse config: {}", e)))?;

            settings.validate()?;
            Ok(settings)
        } else {
            let settings = Self::default();
            settings.save(Some(&path))?;
            Ok(settings)
        }
    }

    pub fn save(&self, config_path: Option<&Path>) -> Result<()> {
        let path = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DccError::Config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| DccError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(&path, content)
            .map_err(|e| DccError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(range) = self.network.port_range {
            if range.first == 0 || range.first > range.last {
                return Err(DccError::Config(format!(
                    "Invalid port range {}-{}",
                    range.first, range.last
                )));
            }
        }
        if self.transfer.chunk_size == 0 {
            return Err(DccError::Config("chunk_size must be positive".to_string()));
        }
        if self.transfer.write_cache_ceiling < self.transfer.chunk_size {
            return Err(DccError::Config(
                "write_cache_ceiling must be at least one chunk".to_string(),
            ));
        }
        Ok(())
    }

    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("org", "dcc", "dcc-transfer")
            .ok_or_else(|| DccError::Config("Failed to get project directories".to_string()))?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.network.timeout_seconds)
    }

    /// Folder incoming files are saved to.
    pub fn download_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.transfer.download_dir {
            return dir.clone();
        }
        UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(|d| d.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// IPv4 address put into the numeric-ip field of outgoing offers.
    pub fn advertised_address(&self) -> Ipv4Addr {
        if let Some(addr) = self.network.public_address {
            return addr;
        }
        if !self.network.bind_address.is_unspecified() {
            return self.network.bind_address;
        }
        match local_ip_address::local_ip() {
            Ok(IpAddr::V4(addr)) => {
                debug!("Detected local address {}", addr);
                addr
            }
            Ok(other) => {
                warn!("Local address {} is not IPv4, advertising loopback", other);
                Ipv4Addr::LOCALHOST
            }
            Err(e) => {
                warn!("Could not detect local address ({}), advertising loopback", e);
                Ipv4Addr::LOCALHOST
            }
        }
    }
}
