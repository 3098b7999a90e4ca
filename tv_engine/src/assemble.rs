//! Configuration assembler.
//!
//! Merges a directive sequence and the generated key material into the
//! role-tagged inline artifact the PKI stage produced, then renames it to
//! its final `.conf` extension to mark it deployable. The transformation is
//! one-way: the `.inline` precursor ceases to exist afterwards, so a second
//! assembly of the same artifact fails with FileNotFound.

use crate::error::EngineError;
use crate::workspace::TunnelPaths;
use std::fmt;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info};

/// Role a configuration artifact is assembled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Header lines the upstream inline format places before the key blocks.
/// Directives are inserted immediately after them.
const HEADER_LINES: usize = 2;

const KEY_BLOCK_START: &str = "<tls-crypt>";
const KEY_BLOCK_END: &str = "</tls-crypt>";

/// Assemble the artifact for `role`.
///
/// Preconditions: the `.inline` precursor and `ta.key` must already exist at
/// their well-known paths under the tunnel workspace; a missing file fails
/// with [`EngineError::FileNotFound`] naming the path, with no recovery
/// attempted. Returns the path of the renamed `.conf` artifact.
pub async fn assemble(
    paths: &TunnelPaths,
    role: Role,
    directives: &[String],
) -> Result<PathBuf, EngineError> {
    let role_tag = role.to_string();
    let inline_path = paths.inline_artifact(&role_tag);
    let ta_key_path = paths.ta_key();

    info!(tunnel = %paths.name(), role = %role, "assembling configuration");

    for required in [&inline_path, &ta_key_path] {
        if !required.is_file() {
            return Err(EngineError::FileNotFound(required.clone()));
        }
    }

    let template = fs::read_to_string(&inline_path)
        .await
        .map_err(|e| EngineError::from_io(e, &inline_path))?;
    let ta_key = fs::read_to_string(&ta_key_path)
        .await
        .map_err(|e| EngineError::from_io(e, &ta_key_path))?;

    let mut lines: Vec<String> = template.lines().map(str::to_string).collect();
    let offset = HEADER_LINES.min(lines.len());

    // Directive block after the header, followed by a blank separator line
    let mut block = directives.join("\n");
    block.push('\n');
    lines.insert(offset, block);

    // Key block appended last, wrapped in its delimiters
    lines.push(format!("{}\n{}{}", KEY_BLOCK_START, ta_key, KEY_BLOCK_END));

    let mut assembled = lines.join("\n");
    assembled.push('\n');

    fs::write(&inline_path, assembled)
        .await
        .map_err(|e| EngineError::from_io(e, &inline_path))?;

    // Rename marks the artifact deployable; the precursor is gone after this
    let final_path = paths.assembled_artifact(&role_tag);
    fs::rename(&inline_path, &final_path)
        .await
        .map_err(|e| EngineError::from_io(e, &inline_path))?;

    debug!(artifact = %final_path.display(), "configuration assembled");
    Ok(final_path)
}
