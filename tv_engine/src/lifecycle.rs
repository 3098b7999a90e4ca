//! Tunnel lifecycle manager.
//!
//! Connect, disconnect, and delete against registered tunnels. Operations
//! iterate the registry (optionally narrowed to one name); a failure on one
//! tunnel is recorded in the batch report and does not abort the remaining
//! tunnels, and nothing done to an earlier tunnel is rolled back.
//!
//! Service units follow the `openvpn@<tunnel>-server` / `openvpn@<tunnel>-client`
//! naming convention on both ends.

use crate::deploy::Deployer;
use crate::error::EngineError;
use crate::registry::{Registry, TunnelRecord};
use crate::runner::CommandRunner;
use crate::workspace::TunnelPaths;
use std::collections::BTreeMap;
use tokio::fs;
use tracing::{error, info, warn};
use tv_shared::config::Settings;

/// Result of one tunnel within a batch operation.
#[derive(Debug)]
pub struct TunnelOutcome {
    pub name: String,
    pub result: Result<(), EngineError>,
}

/// Per-tunnel success/failure accounting for a batch operation.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<TunnelOutcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &EngineError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.name.as_str(), e)))
    }

    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}

pub struct LifecycleManager<'a> {
    runner: &'a dyn CommandRunner,
    settings: &'a Settings,
    registry: Registry,
}

impl<'a> LifecycleManager<'a> {
    pub fn new(runner: &'a dyn CommandRunner, settings: &'a Settings) -> Self {
        LifecycleManager {
            runner,
            settings,
            registry: Registry::new(&settings.registry_path),
        }
    }

    fn server_unit(name: &str) -> String {
        format!("openvpn@{}-server", name)
    }

    fn client_unit(name: &str) -> String {
        format!("openvpn@{}-client", name)
    }

    fn deployer(&self) -> Deployer<'_> {
        Deployer::new(self.runner, &self.settings.remote)
    }

    /// Select the tunnels an operation applies to: all registered entries,
    /// or just `only` when given.
    async fn select(
        &self,
        only: Option<&str>,
    ) -> Result<BTreeMap<String, TunnelRecord>, EngineError> {
        let mut map = self.registry.load().await?;
        if let Some(name) = only {
            let record = map
                .remove(name)
                .ok_or_else(|| EngineError::UnknownTunnel(name.to_string()))?;
            map = BTreeMap::from([(name.to_string(), record)]);
        }
        Ok(map)
    }

    /// Connect every selected tunnel: start the remote server unit, install
    /// the client configuration locally, start the local client unit. An
    /// already-active client unit is disconnected first (forced reconnect).
    pub async fn connect(&self, only: Option<&str>) -> Result<BatchReport, EngineError> {
        let mut report = BatchReport::default();

        for (name, record) in self.select(only).await? {
            let result = self.connect_one(&name, &record).await;
            if let Err(e) = &result {
                error!(tunnel = %name, "connect failed: {e}");
            } else {
                info!(tunnel = %name, "tunnel connected");
            }
            report.outcomes.push(TunnelOutcome { name, result });
        }

        Ok(report)
    }

    /// Disconnect every selected tunnel: stop the local client unit, then
    /// the remote server unit.
    pub async fn disconnect(&self, only: Option<&str>) -> Result<BatchReport, EngineError> {
        let mut report = BatchReport::default();

        for (name, record) in self.select(only).await? {
            let result = self.disconnect_one(&name, &record).await;
            if let Err(e) = &result {
                error!(tunnel = %name, "disconnect failed: {e}");
            } else {
                info!(tunnel = %name, "tunnel disconnected");
            }
            report.outcomes.push(TunnelOutcome { name, result });
        }

        Ok(report)
    }

    /// Delete every selected tunnel: disconnect, remove remote and local
    /// artifacts, remove the workspace, then drop the registry entry. The
    /// registry is persisted once after the whole batch.
    ///
    /// A failed remote removal is recorded in the report but does not keep
    /// the entry: local teardown proceeds and the orphaned remote files are
    /// the operator's to clean up (the registry is the only link to them).
    pub async fn delete(&self, only: Option<&str>) -> Result<BatchReport, EngineError> {
        let mut report = BatchReport::default();
        let mut map = self.registry.load().await?;
        let selected: Vec<String> = match only {
            Some(name) => {
                if !map.contains_key(name) {
                    return Err(EngineError::UnknownTunnel(name.to_string()));
                }
                vec![name.to_string()]
            }
            None => map.keys().cloned().collect(),
        };

        for name in selected {
            let record = match map.get(&name) {
                Some(r) => r.clone(),
                None => continue,
            };

            let mut failure: Option<EngineError> = None;

            if let Err(e) = self.disconnect_one(&name, &record).await {
                warn!(tunnel = %name, "disconnect during delete failed, continuing teardown: {e}");
                failure = Some(e);
            }

            if let Err(e) = self
                .deployer()
                .remove_artifacts(&record.server_public_ip, &name)
                .await
            {
                warn!(tunnel = %name, "remote removal failed, continuing local teardown: {e}");
                failure = Some(e);
            }

            match self.remove_local(&name).await {
                Ok(()) => {
                    map.remove(&name);
                    info!(tunnel = %name, "tunnel deleted");
                }
                Err(e) => {
                    // Local teardown failed: keep the entry so the operator
                    // can retry the delete.
                    error!(tunnel = %name, "local teardown failed, entry kept: {e}");
                    failure = Some(e);
                }
            }

            report.outcomes.push(TunnelOutcome {
                name,
                result: failure.map_or(Ok(()), Err),
            });
        }

        self.registry.save(&map).await?;
        Ok(report)
    }

    async fn connect_one(&self, name: &str, record: &TunnelRecord) -> Result<(), EngineError> {
        let client_unit = Self::client_unit(name);

        // A running client unit means a stale or duplicate session; force a
        // clean reconnect. `is-active` exits non-zero when inactive.
        let active = self
            .runner
            .run("systemctl", &["is-active", "--quiet", &client_unit], None)
            .await
            .is_ok();
        if active {
            info!(tunnel = %name, "client unit already active, reconnecting");
            self.disconnect_one(name, record).await?;
        }

        self.deployer()
            .remote_command(
                &record.server_public_ip,
                &format!("systemctl start {}", Self::server_unit(name)),
            )
            .await?;

        let paths = TunnelPaths::new(&self.settings.workspace_dir, name);
        let source = paths.final_artifact("client");
        let dest = self
            .settings
            .local_service_dir
            .join(format!("{}-client.conf", name));
        fs::copy(&source, &dest)
            .await
            .map_err(|e| EngineError::from_io(e, &source))?;

        self.runner
            .run("systemctl", &["start", &client_unit], None)
            .await?;

        Ok(())
    }

    async fn disconnect_one(&self, name: &str, record: &TunnelRecord) -> Result<(), EngineError> {
        self.runner
            .run("systemctl", &["stop", &Self::client_unit(name)], None)
            .await?;

        self.deployer()
            .remote_command(
                &record.server_public_ip,
                &format!("systemctl stop {}", Self::server_unit(name)),
            )
            .await?;

        Ok(())
    }

    /// Remove local client configuration files matching the tunnel's name
    /// prefix and the tunnel's workspace directory. Already-absent paths are
    /// not an error.
    async fn remove_local(&self, name: &str) -> Result<(), EngineError> {
        let prefix = format!("{}-", name);

        match fs::read_dir(&self.settings.local_service_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| EngineError::from_io(e, &self.settings.local_service_dir))?
                {
                    let file_name = entry.file_name();
                    let file_name = file_name.to_string_lossy();
                    if file_name.starts_with(&prefix) {
                        let path = entry.path();
                        fs::remove_file(&path)
                            .await
                            .map_err(|e| EngineError::from_io(e, &path))?;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(EngineError::from_io(e, &self.settings.local_service_dir)),
        }

        let workspace = TunnelPaths::new(&self.settings.workspace_dir, name);
        match fs::remove_dir_all(workspace.root()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::from_io(e, workspace.root())),
        }
    }
}
