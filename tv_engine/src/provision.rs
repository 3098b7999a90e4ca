//! Provisioning orchestrator.
//!
//! Linear pipeline with short-circuit failure: workspace → certificate
//! authority → server/client assembly → jail → artifact relocation → PKI
//! tree removal → deployment → firewall rules → registration. The registry
//! gains an entry only after every stage succeeded; on failure the stage and
//! cause are surfaced and the registry is left untouched. The workspace
//! directory is not removed automatically on failure — [`Provisioner::cleanup`]
//! is the explicit path for that.

use crate::assemble::{self, Role};
use crate::deploy::Deployer;
use crate::directives;
use crate::error::EngineError;
use crate::jail;
use crate::pki::{CaManager, PkiStage};
use crate::registry::{Registry, TunnelRecord};
use crate::rules;
use crate::runner::CommandRunner;
use crate::workspace::TunnelPaths;
use std::fmt;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use tv_shared::config::Settings;

/// Tools provisioning shells out to on the local host.
const REQUIRED_TOOLS: [&str; 4] = ["curl", "git", "openvpn", "sshpass"];

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Workspace,
    CertificateAuthority(PkiStage),
    ServerConfig,
    ClientConfig,
    Jail,
    Relocate,
    PkiCleanup,
    Deploy,
    FirewallRules,
    Register,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Validate => write!(f, "validate parameters"),
            Stage::Workspace => write!(f, "create workspace"),
            Stage::CertificateAuthority(s) => write!(f, "certificate authority: {}", s),
            Stage::ServerConfig => write!(f, "assemble server configuration"),
            Stage::ClientConfig => write!(f, "assemble client configuration"),
            Stage::Jail => write!(f, "build jail"),
            Stage::Relocate => write!(f, "relocate artifacts"),
            Stage::PkiCleanup => write!(f, "remove PKI working tree"),
            Stage::Deploy => write!(f, "deploy to remote host"),
            Stage::FirewallRules => write!(f, "push firewall rules"),
            Stage::Register => write!(f, "register tunnel"),
        }
    }
}

/// A provisioning failure, tagged with the stage that produced it.
#[derive(Debug, Error)]
#[error("provisioning stage `{stage}` failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: EngineError,
}

fn stage_err(stage: Stage) -> impl FnOnce(EngineError) -> StageError {
    move |source| StageError { stage, source }
}

pub struct Provisioner<'a> {
    runner: &'a dyn CommandRunner,
    settings: &'a Settings,
    registry: Registry,
}

impl<'a> Provisioner<'a> {
    pub fn new(runner: &'a dyn CommandRunner, settings: &'a Settings) -> Self {
        Provisioner {
            runner,
            settings,
            registry: Registry::new(&settings.registry_path),
        }
    }

    /// Check that every external tool the pipeline shells out to is
    /// available, naming all the missing ones at once.
    pub async fn preflight(&self) -> Result<(), EngineError> {
        let mut missing = Vec::new();
        for tool in REQUIRED_TOOLS {
            if !self.runner.tool_available(tool).await {
                missing.push(tool);
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(EngineError::ToolUnavailable(missing.join(", ")))
        }
    }

    /// Run the full pipeline for one tunnel. On success the tunnel is
    /// registered and its artifacts are live on the remote host.
    pub async fn provision(&self, name: &str, record: &TunnelRecord) -> Result<(), StageError> {
        info!(tunnel = %name, host = %record.server_public_ip, "provisioning tunnel");

        record.validate().map_err(stage_err(Stage::Validate))?;
        let existing = self
            .registry
            .load()
            .await
            .map_err(stage_err(Stage::Validate))?;
        if existing.contains_key(name) {
            return Err(StageError {
                stage: Stage::Validate,
                source: EngineError::DuplicateTunnel(name.to_string()),
            });
        }

        let paths = TunnelPaths::new(&self.settings.workspace_dir, name);
        fs::create_dir_all(paths.root())
            .await
            .map_err(|e| EngineError::from_io(e, paths.root()))
            .map_err(stage_err(Stage::Workspace))?;

        CaManager::new(self.runner, &self.settings.pki)
            .generate(&paths)
            .await
            .map_err(|e| StageError {
                stage: Stage::CertificateAuthority(e.stage),
                source: e.source,
            })?;

        let server_lines = directives::server_directives(name, record);
        assemble::assemble(&paths, Role::Server, &server_lines)
            .await
            .map_err(stage_err(Stage::ServerConfig))?;

        let client_lines = directives::client_directives(name, record);
        assemble::assemble(&paths, Role::Client, &client_lines)
            .await
            .map_err(stage_err(Stage::ClientConfig))?;

        jail::build(&paths).await.map_err(stage_err(Stage::Jail))?;

        self.relocate_artifacts(&paths)
            .await
            .map_err(stage_err(Stage::Relocate))?;

        self.remove_pki_tree(&paths)
            .await
            .map_err(stage_err(Stage::PkiCleanup))?;

        let deployer = Deployer::new(self.runner, &self.settings.remote);
        deployer
            .copy_artifacts(&record.server_public_ip, &paths)
            .await
            .map_err(stage_err(Stage::Deploy))?;

        let rule_set = rules::build(
            record.protocol,
            record.port_number,
            &record.interface_name,
            &self.settings.egress_interface,
        );
        deployer
            .push_firewall_rules(&record.server_public_ip, &rule_set)
            .await
            .map_err(stage_err(Stage::FirewallRules))?;

        self.registry
            .insert(name, record.clone())
            .await
            .map_err(stage_err(Stage::Register))?;

        info!(tunnel = %name, workspace = %paths.root().display(), "tunnel provisioned");
        Ok(())
    }

    /// Explicitly remove a tunnel's local workspace. Offered for cleaning up
    /// after a failed provisioning attempt; never invoked automatically.
    pub async fn cleanup(&self, name: &str) -> Result<(), EngineError> {
        let paths = TunnelPaths::new(&self.settings.workspace_dir, name);
        warn!(tunnel = %name, workspace = %paths.root().display(), "removing workspace");
        match fs::remove_dir_all(paths.root()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::FileNotFound(paths.root().to_path_buf()))
            }
            Err(e) => Err(EngineError::from_io(e, paths.root())),
        }
    }

    /// Move the assembled `.conf` artifacts out of the PKI tool's working
    /// tree to the top of the tunnel workspace.
    async fn relocate_artifacts(&self, paths: &TunnelPaths) -> Result<(), EngineError> {
        for role in ["server", "client"] {
            let from = paths.assembled_artifact(role);
            let to = paths.final_artifact(role);
            fs::rename(&from, &to)
                .await
                .map_err(|e| EngineError::from_io(e, &from))?;
        }
        Ok(())
    }

    /// Remove the easy-rsa tree once key material is embedded; the raw
    /// key-generation workspace must not outlive assembly. A symlinked
    /// shared checkout only has its link removed.
    async fn remove_pki_tree(&self, paths: &TunnelPaths) -> Result<(), EngineError> {
        let tree = paths.easy_rsa();
        let meta = match fs::symlink_metadata(&tree).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(EngineError::from_io(e, &tree)),
        };

        if meta.file_type().is_symlink() {
            fs::remove_file(&tree)
                .await
                .map_err(|e| EngineError::from_io(e, &tree))?;
        } else {
            fs::remove_dir_all(&tree)
                .await
                .map_err(|e| EngineError::from_io(e, &tree))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionType, Protocol};
    use crate::runner::{FakeRunner, SideEffectRunner};
    use tempfile::TempDir;

    fn record() -> TunnelRecord {
        TunnelRecord {
            connection_type: ConnectionType::P2p,
            server_public_ip: "203.0.113.10".to_string(),
            server_private_ip: "10.2.0.1".to_string(),
            client_private_ip: "10.2.0.2".to_string(),
            interface_name: "tun0".to_string(),
            port_number: 1194,
            protocol: Protocol::Udp,
        }
    }

    fn settings(dir: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.workspace_dir = dir.path().join("tunnels");
        settings.registry_path = dir.path().join("tunnels.json");
        settings.remote.ssh_password = "secret".to_string();
        settings
    }

    /// Fake runner that materializes the files the external PKI toolchain
    /// would have produced.
    fn pki_runner(
        inner: FakeRunner,
        paths: TunnelPaths,
    ) -> SideEffectRunner<impl Fn(&str) + Send + Sync> {
        SideEffectRunner::new(inner, move |command: &str| {
            if command.starts_with("git clone") {
                std::fs::create_dir_all(paths.inline_dir()).unwrap();
            } else if command.contains("build-server-full") {
                std::fs::write(
                    paths.inline_artifact("server"),
                    "# easyrsa inline\n# server bundle\n<ca>\nX\n</ca>\n",
                )
                .unwrap();
            } else if command.contains("build-client-full") {
                std::fs::write(
                    paths.inline_artifact("client"),
                    "# easyrsa inline\n# client bundle\n<ca>\nX\n</ca>\n",
                )
                .unwrap();
            } else if command.contains("--genkey") {
                std::fs::write(paths.ta_key(), "-----BEGIN OpenVPN Static key-----\nk\n")
                    .unwrap();
            }
        })
    }

    #[tokio::test]
    async fn test_full_pipeline_registers_and_cleans_intermediates() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let paths = TunnelPaths::new(&settings.workspace_dir, "office");
        let runner = pki_runner(FakeRunner::new(), paths.clone());

        Provisioner::new(&runner, &settings)
            .provision("office", &record())
            .await
            .unwrap();

        // Final layout: workspace with both configs and the jail, no PKI tree
        assert!(paths.final_artifact("server").is_file());
        assert!(paths.final_artifact("client").is_file());
        assert!(paths.jail_tmp().is_dir());
        assert!(!paths.easy_rsa().exists());

        // Registered
        let map = Registry::new(&settings.registry_path).load().await.unwrap();
        assert!(map.contains_key("office"));
    }

    #[tokio::test]
    async fn test_pki_failure_names_stage_and_skips_registration() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let paths = TunnelPaths::new(&settings.workspace_dir, "office");
        let runner = pki_runner(FakeRunner::new().fail_on("build-ca"), paths);

        let err = Provisioner::new(&runner, &settings)
            .provision("office", &record())
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::CertificateAuthority(PkiStage::CaBuilt));

        let map = Registry::new(&settings.registry_path).load().await.unwrap();
        assert!(map.is_empty());
        // Workspace is intentionally left for explicit cleanup
        assert!(settings.workspace_dir.join("office").exists());
    }

    #[tokio::test]
    async fn test_deploy_failure_skips_registration() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let paths = TunnelPaths::new(&settings.workspace_dir, "office");
        let runner = pki_runner(FakeRunner::new().fail_on("scp"), paths);

        let err = Provisioner::new(&runner, &settings)
            .provision("office", &record())
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Deploy);
        let map = Registry::new(&settings.registry_path).load().await.unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected_before_any_work() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        Registry::new(&settings.registry_path)
            .insert("office", record())
            .await
            .unwrap();

        let runner = FakeRunner::new();
        let err = Provisioner::new(&runner, &settings)
            .provision("office", &record())
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Validate);
        assert!(matches!(err.source, EngineError::DuplicateTunnel(_)));
        assert!(runner.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_port_rejected() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let mut rec = record();
        rec.port_number = 80;

        let runner = FakeRunner::new();
        let err = Provisioner::new(&runner, &settings)
            .provision("office", &rec)
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Validate);
    }

    #[tokio::test]
    async fn test_preflight_names_missing_tools() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let runner = FakeRunner::new().without_tool("sshpass").without_tool("git");

        let err = Provisioner::new(&runner, &settings)
            .preflight()
            .await
            .unwrap_err();
        match err {
            EngineError::ToolUnavailable(missing) => {
                assert!(missing.contains("git"));
                assert!(missing.contains("sshpass"));
            }
            other => panic!("expected ToolUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cleanup_removes_workspace() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let paths = TunnelPaths::new(&settings.workspace_dir, "office");
        std::fs::create_dir_all(paths.jail_tmp()).unwrap();

        let runner = FakeRunner::new();
        let provisioner = Provisioner::new(&runner, &settings);
        provisioner.cleanup("office").await.unwrap();
        assert!(!paths.root().exists());

        // Cleaning a workspace that is not there names the missing path
        let err = provisioner.cleanup("office").await.unwrap_err();
        assert!(matches!(err, EngineError::FileNotFound(_)));
    }
}
