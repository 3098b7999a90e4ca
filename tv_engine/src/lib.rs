//! Provisioning and lifecycle core for Tunnel Vision.
//!
//! The engine takes a tunnel parameter record, bootstraps a private CA,
//! assembles server/client configuration artifacts with embedded key
//! material, builds a jail for the server process, deploys everything to a
//! remote host, and registers the tunnel in a persisted local registry.
//! Connect/disconnect/delete operate against registered tunnels.
//!
//! Cryptography and the VPN data plane are delegated to external tools
//! (easy-rsa, openvpn) invoked through the [`runner::CommandRunner`] seam.

pub mod assemble;
pub mod deploy;
pub mod directives;
pub mod error;
pub mod jail;
pub mod lifecycle;
pub mod pki;
pub mod provision;
pub mod registry;
pub mod rules;
pub mod runner;
pub mod workspace;

pub use error::EngineError;
pub use registry::{ConnectionType, Protocol, Registry, TunnelRecord};
pub use runner::{CommandRunner, SystemRunner};
