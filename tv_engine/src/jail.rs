//! Sandbox builder.
//!
//! Constructs the restricted-root directory tree the server process is
//! chrooted into: `<tunnel>-jail/tmp` with world-rwx plus the sticky bit.
//! Idempotent; a permission failure is reported to the caller, which decides
//! whether to abort.

use crate::error::EngineError;
use crate::workspace::TunnelPaths;
use std::os::unix::fs::PermissionsExt;
use tokio::fs;
use tracing::info;

/// Permission mode of the jail tmp directory: world read/write/execute with
/// the sticky bit, matching a regular /tmp.
const JAIL_TMP_MODE: u32 = 0o1777;

/// Build the jail tree for a tunnel. Safe to call when it already exists.
pub async fn build(paths: &TunnelPaths) -> Result<(), EngineError> {
    let tmp = paths.jail_tmp();
    info!(tunnel = %paths.name(), jail = %paths.jail_dir().display(), "building jail");

    fs::create_dir_all(&tmp)
        .await
        .map_err(|e| EngineError::from_io(e, &tmp))?;

    fs::set_permissions(&tmp, std::fs::Permissions::from_mode(JAIL_TMP_MODE))
        .await
        .map_err(|e| EngineError::from_io(e, &tmp))?;

    Ok(())
}
