//! Read-only server-list file.
//!
//! A JSON document mapping a human-readable server label to its addresses.
//! Provisioning reads this to resolve `--server-label`; nothing here writes
//! the file.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One entry in the server-list file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub public_ip: String,
    pub private_ip: String,
}

/// Load the server list, keyed by label.
pub fn load_servers(path: impl AsRef<Path>) -> Result<BTreeMap<String, ServerEntry>, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }

    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::JsonError {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_servers() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"{
                "frankfurt": {"public_ip": "203.0.113.10", "private_ip": "10.2.0.1"},
                "oslo": {"public_ip": "198.51.100.7", "private_ip": "10.3.0.1"}
            }"#,
        )
        .unwrap();

        let servers = load_servers(file.path()).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers["frankfurt"].public_ip, "203.0.113.10");
        assert_eq!(servers["oslo"].private_ip, "10.3.0.1");
    }

    #[test]
    fn test_missing_file() {
        let err = load_servers("/no/such/servers.json").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_malformed_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not json at all").unwrap();

        let err = load_servers(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::JsonError { .. }));
    }
}
