//! Server configuration.
//!
//! Usually read from a TOML file; every field has a default, so an empty
//! file is a valid configuration:
//!
//! ```toml
//! module_id = "6f1d8c7e-2a4b-4c1e-9d3f-0a1b2c3d4e5f"
//! name = "sensor-hub"
//! listen = ["0.0.0.0:5000"]
//! announce_interval_secs = 5
//!
//! [[multicast]]
//! interface = "0.0.0.0"
//! group = "225.0.0.1:5000"
//! ```

use modnet_core::{ModuleId, MulticastGroup};
use modnet_transport::ConnectionOptions;
use modnet_transport::frame::DEFAULT_MAX_FRAME_LENGTH;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors from loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything a server needs to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub module_id: ModuleId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub listen: Vec<SocketAddr>,
    /// Addresses put in beacons and gossip. Derived from the bound listen
    /// addresses when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announce: Option<Vec<SocketAddr>>,
    pub multicast: Vec<MulticastGroup>,
    pub announce_interval_secs: u64,
    pub max_frame_length: usize,
    /// `0` disables the timeout.
    pub connect_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            module_id: ModuleId::random(),
            name: None,
            location: None,
            listen: vec![SocketAddr::from((Ipv4Addr::UNSPECIFIED, 5000))],
            announce: None,
            multicast: vec![MulticastGroup::any_interface(SocketAddrV4::new(
                Ipv4Addr::new(225, 0, 0, 1),
                5000,
            ))],
            announce_interval_secs: 5,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            connect_timeout_ms: 10_000,
            request_timeout_ms: None,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

impl ServerConfig {
    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), module = %config.module_id, "loaded config");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.is_empty() {
            return Err(ConfigError::Invalid("no listen address".into()));
        }
        if let Some(group) = self.multicast.iter().find(|g| !g.group.ip().is_multicast()) {
            return Err(ConfigError::Invalid(format!(
                "{} is not a multicast address",
                group.group.ip()
            )));
        }
        if self.announce_interval_secs == 0 {
            return Err(ConfigError::Invalid("announce_interval_secs must be positive".into()));
        }
        if self.max_frame_length == 0 {
            return Err(ConfigError::Invalid("max_frame_length must be positive".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be positive".into()));
        }
        Ok(())
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            max_frame_length: self.max_frame_length,
            connect_timeout: self.connect_timeout(),
            request_timeout: self.request_timeout(),
            ..ConnectionOptions::default()
        }
    }

    /// The configured announce addresses, or ones derived from `bound`.
    pub fn announce_addresses(&self, bound: &[SocketAddr]) -> Vec<SocketAddr> {
        match &self.announce {
            Some(announce) => announce.clone(),
            None => derive_announce(bound),
        }
    }
}

/// Turn bound listen addresses into addresses other hosts can dial.
///
/// A wildcard address stands for every non-loopback interface of its
/// family, or for loopback if there are no others.
pub fn derive_announce(bound: &[SocketAddr]) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for addr in bound {
        if addr.ip().is_unspecified() {
            for ip in interface_addresses(addr.is_ipv4()) {
                out.push(SocketAddr::new(ip, addr.port()));
            }
        } else {
            out.push(*addr);
        }
    }
    out.sort();
    out.dedup();
    out
}

fn interface_addresses(v4: bool) -> Vec<IpAddr> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            tracing::warn!("failed to list network interfaces: {}", e);
            Vec::new()
        }
    };
    let ips: Vec<IpAddr> = interfaces
        .iter()
        .filter(|iface| !iface.is_loopback())
        .map(|iface| iface.ip())
        .filter(|ip| ip.is_ipv4() == v4)
        .collect();
    if !ips.is_empty() {
        return ips;
    }
    if v4 {
        vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
    } else {
        vec![IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)]
    }
}
