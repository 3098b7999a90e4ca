//! Per-tunnel filesystem layout.
//!
//! Every path convention the pipeline relies on lives here. Once
//! provisioning completes only the top-level workspace with the final
//! `.conf` files and the jail subtree remains; the easy-rsa tree is an
//! intermediate and is removed.

use std::path::{Path, PathBuf};

/// Resolved paths for one tunnel's local workspace.
#[derive(Debug, Clone)]
pub struct TunnelPaths {
    name: String,
    root: PathBuf,
}

impl TunnelPaths {
    pub fn new(workspace_dir: impl AsRef<Path>, name: &str) -> Self {
        TunnelPaths {
            name: name.to_string(),
            root: workspace_dir.as_ref().join(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<workspace>/<name>`
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<workspace>/<name>/easy-rsa` — the PKI tool checkout (or symlink)
    pub fn easy_rsa(&self) -> PathBuf {
        self.root.join("easy-rsa")
    }

    /// Directory the easy-rsa commands run in
    pub fn easyrsa3(&self) -> PathBuf {
        self.easy_rsa().join("easyrsa3")
    }

    /// Directory the PKI tool writes inline bundles into
    pub fn inline_dir(&self) -> PathBuf {
        self.easyrsa3().join("pki").join("inline")
    }

    /// `.inline` precursor for a role, before assembly
    pub fn inline_artifact(&self, role: &str) -> PathBuf {
        self.inline_dir()
            .join(format!("{}-{}.inline", self.name, role))
    }

    /// Assembled `.conf` for a role, still inside the inline dir
    pub fn assembled_artifact(&self, role: &str) -> PathBuf {
        self.inline_dir()
            .join(format!("{}-{}.conf", self.name, role))
    }

    /// Final deployable `.conf` for a role, at the top of the workspace
    pub fn final_artifact(&self, role: &str) -> PathBuf {
        self.root.join(format!("{}-{}.conf", self.name, role))
    }

    /// Shared pre-authentication key produced by the PKI stage
    pub fn ta_key(&self) -> PathBuf {
        self.easyrsa3().join("ta.key")
    }

    /// Jail root for the server process
    pub fn jail_dir(&self) -> PathBuf {
        self.root.join(format!("{}-jail", self.name))
    }

    /// World-writable sticky tmp directory inside the jail
    pub fn jail_tmp(&self) -> PathBuf {
        self.jail_dir().join("tmp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_namespaced_by_tunnel() {
        let paths = TunnelPaths::new("/var/lib/tv/tunnels", "office");
        assert_eq!(paths.root(), Path::new("/var/lib/tv/tunnels/office"));
        assert_eq!(
            paths.inline_artifact("server"),
            Path::new("/var/lib/tv/tunnels/office/easy-rsa/easyrsa3/pki/inline/office-server.inline")
        );
        assert_eq!(
            paths.final_artifact("client"),
            Path::new("/var/lib/tv/tunnels/office/office-client.conf")
        );
        assert_eq!(
            paths.jail_tmp(),
            Path::new("/var/lib/tv/tunnels/office/office-jail/tmp")
        );
    }
}
