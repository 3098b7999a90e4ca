//! Certificate authority manager.
//!
//! Drives the external easy-rsa toolchain through a fixed sequence of
//! invocations to produce a CA, server and client certificate/key pairs,
//! and a shared pre-authentication key. One external command per stage; any
//! failure halts the machine and names the offending stage. Cleanup after a
//! failure is the orchestrator's job, not ours.

use crate::error::EngineError;
use crate::runner::CommandRunner;
use crate::workspace::TunnelPaths;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};
use tv_shared::config::PkiSettings;

/// Stages of the key-generation machine, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkiStage {
    /// easy-rsa checkout present (cloned, or symlinked from a shared copy)
    ToolAvailable,
    /// `easyrsa init-pki` completed
    PkiInitialized,
    /// CA built (the one interactive step: the CA identity prompt)
    CaBuilt,
    /// `<tunnel>-server` certificate and key issued
    ServerCertIssued,
    /// `<tunnel>-client` certificate and key issued
    ClientCertIssued,
    /// Shared pre-authentication key (ta.key) generated
    AuthKeyGenerated,
}

impl fmt::Display for PkiStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PkiStage::ToolAvailable => "fetch PKI tool",
            PkiStage::PkiInitialized => "initialize PKI",
            PkiStage::CaBuilt => "build CA",
            PkiStage::ServerCertIssued => "issue server certificate",
            PkiStage::ClientCertIssued => "issue client certificate",
            PkiStage::AuthKeyGenerated => "generate pre-authentication key",
        };
        write!(f, "{}", name)
    }
}

/// A PKI failure, tagged with the stage that produced it.
#[derive(Debug, Error)]
#[error("PKI stage `{stage}` failed: {source}")]
pub struct PkiError {
    pub stage: PkiStage,
    #[source]
    pub source: EngineError,
}

/// Drives easy-rsa for one tunnel.
pub struct CaManager<'a> {
    runner: &'a dyn CommandRunner,
    settings: &'a PkiSettings,
}

impl<'a> CaManager<'a> {
    pub fn new(runner: &'a dyn CommandRunner, settings: &'a PkiSettings) -> Self {
        CaManager { runner, settings }
    }

    /// Run every stage for the tunnel. On success the inline bundles for
    /// `<name>-server` and `<name>-client` plus `ta.key` exist under the
    /// tunnel's easy-rsa tree.
    pub async fn generate(&self, paths: &TunnelPaths) -> Result<(), PkiError> {
        let name = paths.name();
        info!(tunnel = %name, "generating certificates");

        self.ensure_tool(paths)
            .await
            .map_err(|source| PkiError {
                stage: PkiStage::ToolAvailable,
                source,
            })?;

        let workdir = paths.easyrsa3();

        self.runner
            .run("./easyrsa", &["init-pki"], Some(&workdir))
            .await
            .map_err(|source| PkiError {
                stage: PkiStage::PkiInitialized,
                source,
            })?;

        // build-ca asks for the CA's Common Name; answer with the tunnel name
        self.runner
            .run_interactive(
                "./easyrsa",
                &["build-ca", "nopass"],
                Some(&workdir),
                "Common Name",
                name,
            )
            .await
            .map_err(|source| PkiError {
                stage: PkiStage::CaBuilt,
                source,
            })?;

        let server_id = format!("{}-server", name);
        self.runner
            .run(
                "./easyrsa",
                &["build-server-full", &server_id, "nopass"],
                Some(&workdir),
            )
            .await
            .map_err(|source| PkiError {
                stage: PkiStage::ServerCertIssued,
                source,
            })?;

        let client_id = format!("{}-client", name);
        self.runner
            .run(
                "./easyrsa",
                &["build-client-full", &client_id, "nopass"],
                Some(&workdir),
            )
            .await
            .map_err(|source| PkiError {
                stage: PkiStage::ClientCertIssued,
                source,
            })?;

        self.runner
            .run("openvpn", &["--genkey", "secret", "ta.key"], Some(&workdir))
            .await
            .map_err(|source| PkiError {
                stage: PkiStage::AuthKeyGenerated,
                source,
            })?;

        info!(tunnel = %name, "certificates generated");
        Ok(())
    }

    /// Make the easy-rsa checkout available under the tunnel workspace.
    /// A configured shared checkout is symlinked instead of cloning again;
    /// that is an optimization, cloning is the fallback.
    async fn ensure_tool(&self, paths: &TunnelPaths) -> Result<(), EngineError> {
        let target = paths.easy_rsa();
        if target.exists() {
            debug!(path = %target.display(), "easy-rsa checkout already present");
            return Ok(());
        }

        if let Some(shared) = &self.settings.shared_checkout {
            if shared.exists() {
                debug!(
                    shared = %shared.display(),
                    target = %target.display(),
                    "linking shared easy-rsa checkout"
                );
                tokio::fs::symlink(shared, &target)
                    .await
                    .map_err(|e| EngineError::from_io(e, &target))?;
                return Ok(());
            }
        }

        let target_str = target.display().to_string();
        self.runner
            .run(
                "git",
                &["clone", &self.settings.easy_rsa_url, &target_str],
                None,
            )
            .await?;
        Ok(())
    }
}
