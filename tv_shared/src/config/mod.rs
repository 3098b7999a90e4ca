//! Configuration management for Tunnel Vision.
//!
//! Every component receives an explicit [`Settings`] value at construction;
//! nothing in the pipeline reads ambient global state. Settings are loaded
//! from a TOML file with serde defaults so a partial file is enough to get
//! a working setup.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Error parsing a JSON document (server list)
    #[error("Failed to parse JSON file {path}: {source}")]
    JsonError {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Remote host access settings.
///
/// The deployer authenticates as a root-equivalent account with a password
/// over sshpass; host-key verification is disabled for automation. Operator
/// trust in the remote host is assumed to be established out of band.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteSettings {
    /// Account used for secure-copy and remote commands (default: "root")
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    /// Password for the remote account
    #[serde(default)]
    pub ssh_password: String,

    /// SSH port on the remote host (default: 22)
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Staging directory artifacts are copied into before relocation
    /// (default: "/tmp")
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Service-config install directory on the remote host
    /// (default: "/etc/openvpn")
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    /// Boot-time firewall rules file on the remote host
    /// (default: "/etc/iptables/rules.v4")
    #[serde(default = "default_rules_path")]
    pub rules_path: PathBuf,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_install_dir() -> PathBuf {
    PathBuf::from("/etc/openvpn")
}

fn default_rules_path() -> PathBuf {
    PathBuf::from("/etc/iptables/rules.v4")
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            ssh_user: default_ssh_user(),
            ssh_password: String::new(),
            ssh_port: default_ssh_port(),
            staging_dir: default_staging_dir(),
            install_dir: default_install_dir(),
            rules_path: default_rules_path(),
        }
    }
}

/// PKI toolchain settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PkiSettings {
    /// Git URL the easy-rsa toolchain is fetched from
    #[serde(default = "default_easy_rsa_url")]
    pub easy_rsa_url: String,

    /// Previously fetched easy-rsa checkout to symlink per tunnel instead
    /// of cloning again. Optional; cloning is the fallback.
    #[serde(default)]
    pub shared_checkout: Option<PathBuf>,
}

fn default_easy_rsa_url() -> String {
    "https://github.com/OpenVPN/easy-rsa.git".to_string()
}

impl Default for PkiSettings {
    fn default() -> Self {
        PkiSettings {
            easy_rsa_url: default_easy_rsa_url(),
            shared_checkout: None,
        }
    }
}

/// Settings for the provisioning engine and CLI.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Directory tunnel workspaces are created under
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    /// Path of the persisted tunnel registry
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,

    /// Path of the read-only server-list file
    #[serde(default = "default_servers_path")]
    pub servers_path: PathBuf,

    /// Local service-config directory client configs are copied into
    /// (default: "/etc/openvpn")
    #[serde(default = "default_install_dir")]
    pub local_service_dir: PathBuf,

    /// Name of the host's primary egress interface (default: "eth0")
    #[serde(default = "default_egress_interface")]
    pub egress_interface: String,

    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub remote: RemoteSettings,

    #[serde(default)]
    pub pki: PkiSettings,
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunnelvision")
}

fn default_workspace_dir() -> PathBuf {
    data_dir().join("tunnels")
}

fn default_registry_path() -> PathBuf {
    data_dir().join("tunnels.json")
}

fn default_servers_path() -> PathBuf {
    data_dir().join("servers.json")
}

fn default_egress_interface() -> String {
    "eth0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            workspace_dir: default_workspace_dir(),
            registry_path: default_registry_path(),
            servers_path: default_servers_path(),
            local_service_dir: default_install_dir(),
            egress_interface: default_egress_interface(),
            log_level: default_log_level(),
            remote: RemoteSettings::default(),
            pki: PkiSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let contents = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the given path, falling back to defaults when the
    /// file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Ok(settings) => Ok(settings),
            Err(ConfigError::FileNotFound(_)) => Ok(Settings::default()),
            Err(e) => Err(e),
        }
    }

    /// Save settings to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.egress_interface.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "egress_interface".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.remote.ssh_user.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "remote.ssh_user".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.egress_interface, "eth0");
        assert_eq!(settings.remote.ssh_user, "root");
        assert_eq!(settings.remote.ssh_port, 22);
        assert_eq!(settings.remote.install_dir, PathBuf::from("/etc/openvpn"));
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn test_load_settings() {
        let mut file = NamedTempFile::new().unwrap();

        let settings_str = r#"
            workspace_dir = "/var/lib/tv/tunnels"
            egress_interface = "ens3"
            log_level = "debug"

            [remote]
            ssh_user = "root"
            ssh_password = "hunter2"
            ssh_port = 2222

            [pki]
            shared_checkout = "/opt/easy-rsa"
        "#;

        file.write_all(settings_str.as_bytes()).unwrap();

        let settings = Settings::load(file.path()).unwrap();

        assert_eq!(settings.workspace_dir, PathBuf::from("/var/lib/tv/tunnels"));
        assert_eq!(settings.egress_interface, "ens3");
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.remote.ssh_password, "hunter2");
        assert_eq!(settings.remote.ssh_port, 2222);
        assert_eq!(
            settings.pki.shared_checkout,
            Some(PathBuf::from("/opt/easy-rsa"))
        );
        // Fields absent from the file fall back to defaults
        assert_eq!(settings.remote.staging_dir, PathBuf::from("/tmp"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Settings::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));

        let settings = Settings::load_or_default("/definitely/not/here.toml").unwrap();
        assert_eq!(settings.egress_interface, "eth0");
    }

    #[test]
    fn test_save_and_reload() {
        let mut settings = Settings::default();
        settings.egress_interface = "ens5".to_string();
        settings.remote.ssh_password = "secret".to_string();

        let file = NamedTempFile::new().unwrap();
        settings.save(file.path()).unwrap();

        let loaded = Settings::load(file.path()).unwrap();
        assert_eq!(loaded.egress_interface, "ens5");
        assert_eq!(loaded.remote.ssh_password, "secret");
    }

    #[test]
    fn test_invalid_value_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"egress_interface = \"\"").unwrap();

        let err = Settings::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
