//! Remote deployer.
//!
//! Transfers assembled artifacts to the remote host over an authenticated
//! secure-copy channel and relocates them into the service-config install
//! directory; separately pushes firewall rules into the host's boot-time
//! rules file. Authentication is password-based against a root-equivalent
//! account via sshpass, with host-key verification disabled for automation
//! (operator trust is assumed pre-established). No retries anywhere: the
//! first failure aborts and is the caller's pipeline failure.

use crate::error::EngineError;
use crate::rules::FirewallRuleSet;
use crate::runner::CommandRunner;
use crate::workspace::TunnelPaths;
use std::path::Path;
use tracing::{info, warn};
use tv_shared::config::RemoteSettings;

pub struct Deployer<'a> {
    runner: &'a dyn CommandRunner,
    remote: &'a RemoteSettings,
}

impl<'a> Deployer<'a> {
    pub fn new(runner: &'a dyn CommandRunner, remote: &'a RemoteSettings) -> Self {
        Deployer { runner, remote }
    }

    /// Copy the server configuration and the jail tree to the remote host:
    /// each is staged over scp, then relocated into the install directory by
    /// a remote move. Both steps must succeed per artifact; the first
    /// failure aborts the remaining transfers.
    pub async fn copy_artifacts(
        &self,
        host: &str,
        paths: &TunnelPaths,
    ) -> Result<(), EngineError> {
        let name = paths.name();
        info!(tunnel = %name, host = %host, "deploying artifacts");

        let server_conf = paths.final_artifact("server");
        let jail = paths.jail_dir();
        let items: [(&Path, bool); 2] = [(&server_conf, false), (&jail, true)];

        for (local, recursive) in items {
            let item_name = local
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| EngineError::FileNotFound(local.to_path_buf()))?;

            self.secure_copy(host, local, recursive).await?;

            let staged = self.remote.staging_dir.join(item_name);
            let move_cmd = format!(
                "mv {} {}/",
                staged.display(),
                self.remote.install_dir.display()
            );
            self.remote_command(host, &move_cmd).await?;

            info!(tunnel = %name, host = %host, item = %item_name, "artifact installed");
        }

        Ok(())
    }

    /// Render the rule set and write it to the remote host's boot-time
    /// firewall rules file in a single remote command.
    pub async fn push_firewall_rules(
        &self,
        host: &str,
        rules: &FirewallRuleSet,
    ) -> Result<(), EngineError> {
        info!(host = %host, rules_file = %self.remote.rules_path.display(), "pushing firewall rules");

        let script = format!(
            "cat > {} <<'EOF'\n{}\nEOF",
            self.remote.rules_path.display(),
            rules.render()
        );
        self.remote_command(host, &script).await?;
        Ok(())
    }

    /// Remove every installed remote file matching the tunnel's name prefix.
    pub async fn remove_artifacts(&self, host: &str, name: &str) -> Result<(), EngineError> {
        warn!(tunnel = %name, host = %host, "removing remote artifacts");
        let rm_cmd = format!("rm -rf {}/{}*", self.remote.install_dir.display(), name);
        self.remote_command(host, &rm_cmd).await?;
        Ok(())
    }

    /// Run one command on the remote host over ssh.
    pub async fn remote_command(&self, host: &str, command: &str) -> Result<String, EngineError> {
        let port = self.remote.ssh_port.to_string();
        let target = format!("{}@{}", self.remote.ssh_user, host);
        let args = [
            "-p",
            self.remote.ssh_password.as_str(),
            "ssh",
            "-o",
            "StrictHostKeyChecking=no",
            "-p",
            port.as_str(),
            target.as_str(),
            command,
        ];

        self.runner
            .run("sshpass", &args, None)
            .await
            .map_err(|e| self.as_remote_failure(host, e))
    }

    async fn secure_copy(
        &self,
        host: &str,
        local: &Path,
        recursive: bool,
    ) -> Result<(), EngineError> {
        let port = self.remote.ssh_port.to_string();
        let local_str = local.display().to_string();
        let dest = format!(
            "{}@{}:{}/",
            self.remote.ssh_user,
            host,
            self.remote.staging_dir.display()
        );

        let mut args = vec![
            "-p",
            self.remote.ssh_password.as_str(),
            "scp",
            "-P",
            port.as_str(),
            "-C",
            "-o",
            "StrictHostKeyChecking=no",
        ];
        if recursive {
            args.push("-r");
        }
        args.push(local_str.as_str());
        args.push(dest.as_str());

        self.runner
            .run("sshpass", &args, None)
            .await
            .map(|_| ())
            .map_err(|e| self.as_remote_failure(host, e))
    }

    /// Non-zero exits on the secure channel become RemoteCommandFailed so
    /// callers can tell a broken channel from a missing local artifact.
    fn as_remote_failure(&self, host: &str, err: EngineError) -> EngineError {
        match err {
            EngineError::CommandFailed {
                command,
                status,
                stderr,
            } => EngineError::RemoteCommandFailed {
                host: host.to_string(),
                detail: format!("`{}` exited with {}: {}", command, status, stderr),
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Protocol;
    use crate::rules;
    use crate::runner::FakeRunner;
    use tempfile::TempDir;

    fn remote() -> RemoteSettings {
        RemoteSettings {
            ssh_password: "secret".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_copy_artifacts_stages_then_relocates() {
        let dir = TempDir::new().unwrap();
        let paths = TunnelPaths::new(dir.path(), "office");
        let runner = FakeRunner::new();
        let remote = remote();

        Deployer::new(&runner, &remote)
            .copy_artifacts("203.0.113.10", &paths)
            .await
            .unwrap();

        let recorded = runner.recorded();
        assert_eq!(recorded.len(), 4);
        assert!(recorded[0].contains("scp"));
        assert!(recorded[0].contains("office-server.conf"));
        assert!(recorded[1].contains("ssh"));
        assert!(recorded[1].contains("mv /tmp/office-server.conf /etc/openvpn/"));
        assert!(recorded[2].contains("scp") && recorded[2].contains("-r"));
        assert!(recorded[2].contains("office-jail"));
        assert!(recorded[3].contains("mv /tmp/office-jail /etc/openvpn/"));
    }

    #[tokio::test]
    async fn test_first_failure_aborts_remaining_transfers() {
        let dir = TempDir::new().unwrap();
        let paths = TunnelPaths::new(dir.path(), "office");
        let runner = FakeRunner::new().fail_on("office-server.conf");
        let remote = remote();

        let err = Deployer::new(&runner, &remote)
            .copy_artifacts("203.0.113.10", &paths)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::RemoteCommandFailed { .. }));
        // The jail transfer never started
        assert!(!runner.recorded().iter().any(|c| c.contains("office-jail")));
    }

    #[tokio::test]
    async fn test_push_firewall_rules_is_one_remote_command() {
        let runner = FakeRunner::new();
        let remote = remote();
        let rules = rules::build(Protocol::Udp, 1194, "tun0", "eth0");

        Deployer::new(&runner, &remote)
            .push_firewall_rules("203.0.113.10", &rules)
            .await
            .unwrap();

        let recorded = runner.recorded();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].contains("cat > /etc/iptables/rules.v4"));
        assert!(recorded[0].contains("*filter"));
        assert!(recorded[0].contains("COMMIT"));
    }

    #[tokio::test]
    async fn test_remove_artifacts_uses_name_prefix() {
        let runner = FakeRunner::new();
        let remote = remote();

        Deployer::new(&runner, &remote)
            .remove_artifacts("203.0.113.10", "office")
            .await
            .unwrap();

        assert!(runner.recorded()[0].contains("rm -rf /etc/openvpn/office*"));
    }
}
