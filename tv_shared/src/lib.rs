//! Shared utilities for Tunnel Vision components.
//!
//! This crate provides common functionality used by the provisioning engine
//! and the CLI: configuration loading, structured logging, and the read-only
//! server-list file.

pub mod config;
pub mod logging;
pub mod servers;

// Re-export commonly used items for convenience
pub use config::{ConfigError, Settings};
pub use servers::ServerEntry;
