//! Persisted tunnel registry.
//!
//! A single JSON file maps tunnel name to its full parameter record and is
//! the sole source of truth for which tunnels exist. `save` always rewrites
//! the whole mapping, pretty-printed with sorted keys so diffs stay
//! readable. Single-writer access is assumed; there is no file locking, so
//! concurrent invocations must be serialized by the caller.
//!
//! Losing this file orphans any remote artifacts the tunnels deployed; there
//! is no remote-side registry to reconcile against.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Lowest port a tunnel may bind (unprivileged range).
pub const PORT_MIN: u16 = 1024;
/// Highest port a tunnel may bind (below the ephemeral range).
pub const PORT_MAX: u16 = 49151;

/// Connection topology of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Point-to-point link between one server and one client
    P2p,
    /// Routed subnet topology
    Subnet,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::P2p => write!(f, "p2p"),
            ConnectionType::Subnet => write!(f, "subnet"),
        }
    }
}

/// Transport protocol of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Full parameter record for one tunnel.
///
/// Addressing fields are immutable once registered; changing them means
/// delete and recreate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub connection_type: ConnectionType,
    pub server_public_ip: String,
    pub server_private_ip: String,
    pub client_private_ip: String,
    pub interface_name: String,
    pub port_number: u16,
    pub protocol: Protocol,
}

impl TunnelRecord {
    /// Validate the record's constrained fields.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(PORT_MIN..=PORT_MAX).contains(&self.port_number) {
            return Err(EngineError::InvalidRecord(format!(
                "port {} outside the unprivileged range {}-{}",
                self.port_number, PORT_MIN, PORT_MAX
            )));
        }
        if self.interface_name.is_empty() {
            return Err(EngineError::InvalidRecord(
                "interface name must not be empty".to_string(),
            ));
        }
        for (field, value) in [
            ("server_public_ip", &self.server_public_ip),
            ("server_private_ip", &self.server_private_ip),
            ("client_private_ip", &self.client_private_ip),
        ] {
            if value.parse::<std::net::IpAddr>().is_err() {
                return Err(EngineError::InvalidRecord(format!(
                    "{} `{}` is not a valid IP address",
                    field, value
                )));
            }
        }
        Ok(())
    }
}

/// Durable name → record mapping backed by one JSON file.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Registry {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the full mapping. A missing file is an empty registry; a file
    /// that exists but does not parse is reported as corrupt rather than
    /// silently discarded.
    pub async fn load(&self) -> Result<BTreeMap<String, TunnelRecord>, EngineError> {
        let contents = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(file = %self.path.display(), "registry file absent, starting empty");
                return Ok(BTreeMap::new());
            }
            Err(err) => return Err(EngineError::from_io(err, &self.path)),
        };

        serde_json::from_slice(&contents).map_err(|err| EngineError::RegistryCorrupt {
            path: self.path.clone(),
            detail: err.to_string(),
        })
    }

    /// Rewrite the whole mapping. Written to a sibling temp file first and
    /// renamed into place so a crash mid-write cannot truncate the registry.
    pub async fn save(&self, map: &BTreeMap<String, TunnelRecord>) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::from_io(e, parent))?;
        }

        let serialized = serde_json::to_vec_pretty(map).map_err(|err| {
            EngineError::RegistryCorrupt {
                path: self.path.clone(),
                detail: err.to_string(),
            }
        })?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &serialized)
            .await
            .map_err(|e| EngineError::from_io(e, &tmp))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| EngineError::from_io(e, &self.path))?;

        debug!(file = %self.path.display(), entries = map.len(), "registry saved");
        Ok(())
    }

    /// Register a new tunnel, enforcing name uniqueness.
    pub async fn insert(&self, name: &str, record: TunnelRecord) -> Result<(), EngineError> {
        record.validate()?;

        let mut map = self.load().await?;
        if map.contains_key(name) {
            return Err(EngineError::DuplicateTunnel(name.to_string()));
        }
        map.insert(name.to_string(), record);
        self.save(&map).await?;

        info!(tunnel = %name, "tunnel registered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(port: u16) -> TunnelRecord {
        TunnelRecord {
            connection_type: ConnectionType::P2p,
            server_public_ip: "203.0.113.10".to_string(),
            server_private_ip: "10.2.0.1".to_string(),
            client_private_ip: "10.2.0.2".to_string(),
            interface_name: "tun0".to_string(),
            port_number: port,
            protocol: Protocol::Udp,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_registry() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new(dir.path().join("tunnels.json"));
        assert!(registry.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new(dir.path().join("tunnels.json"));

        let mut map = BTreeMap::new();
        map.insert("office".to_string(), record(1194));
        // Names differing only by case are distinct keys
        map.insert("Tunnel1".to_string(), record(4433));
        map.insert("tunnel1".to_string(), record(4434));
        registry.save(&map).await.unwrap();

        let loaded = registry.load().await.unwrap();
        assert_eq!(loaded, map);
        assert_eq!(loaded["Tunnel1"].port_number, 4433);
        assert_eq!(loaded["tunnel1"].port_number, 4434);
    }

    #[tokio::test]
    async fn test_saved_file_has_sorted_keys() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new(dir.path().join("tunnels.json"));

        let mut map = BTreeMap::new();
        map.insert("zeta".to_string(), record(2000));
        map.insert("alpha".to_string(), record(3000));
        registry.save(&map).await.unwrap();

        let raw = std::fs::read_to_string(registry.path()).unwrap();
        let alpha = raw.find("alpha").unwrap();
        let zeta = raw.find("zeta").unwrap();
        assert!(alpha < zeta, "keys must serialize in sorted order");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tunnels.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let err = Registry::new(&path).load().await.unwrap_err();
        assert!(matches!(err, EngineError::RegistryCorrupt { .. }));
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new(dir.path().join("tunnels.json"));

        registry.insert("office", record(1194)).await.unwrap();
        let err = registry.insert("office", record(1195)).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateTunnel(_)));
    }

    #[test]
    fn test_validate_port_range() {
        assert!(record(1024).validate().is_ok());
        assert!(record(49151).validate().is_ok());
        assert!(record(1023).validate().is_err());
        assert!(record(49152).validate().is_err());
    }

    #[test]
    fn test_validate_addresses() {
        let mut rec = record(1194);
        rec.server_public_ip = "not-an-ip".to_string();
        assert!(matches!(
            rec.validate().unwrap_err(),
            EngineError::InvalidRecord(_)
        ));
    }
}
