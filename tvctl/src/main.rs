//! Command-line frontend for Tunnel Vision.
//!
//! Collects operator input, gates destructive operations behind a
//! confirmation prompt, and drives the provisioning and lifecycle engine.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::distr::Alphanumeric;
use rand::Rng;
use std::io::{BufRead, Write};
use std::net::UdpSocket;
use std::path::PathBuf;
use tracing::{info, warn};
use tv_engine::lifecycle::{BatchReport, LifecycleManager};
use tv_engine::provision::Provisioner;
use tv_engine::registry::{ConnectionType, Protocol, Registry, TunnelRecord};
use tv_engine::runner::{CommandRunner, SystemRunner};
use tv_shared::logging::{init_logging, level_from_str, LogOptions};
use tv_shared::{servers, Settings};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for tracing::Level {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => tracing::Level::TRACE,
            LogLevelArg::Debug => tracing::Level::DEBUG,
            LogLevelArg::Info => tracing::Level::INFO,
            LogLevelArg::Warn => tracing::Level::WARN,
            LogLevelArg::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum TopologyArg {
    P2p,
    Subnet,
}

impl From<TopologyArg> for ConnectionType {
    fn from(arg: TopologyArg) -> Self {
        match arg {
            TopologyArg::P2p => ConnectionType::P2p,
            TopologyArg::Subnet => ConnectionType::Subnet,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ProtocolArg {
    Tcp,
    Udp,
}

impl From<ProtocolArg> for Protocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Tcp => Protocol::Tcp,
            ProtocolArg::Udp => Protocol::Udp,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Provision and manage VPN tunnels", long_about = None, after_help = "Examples:\n  tvctl create --name office --server-label frankfurt --client-private-ip 10.8.0.2\n  tvctl connect office\n  tvctl delete office --yes\n  tvctl list")]
struct Args {
    /// Log level (overrides the settings file; defaults to its value)
    #[arg(short, long, value_enum, env = "TV_LOG_LEVEL")]
    log_level: Option<LogLevelArg>,

    /// Emit JSON logs
    #[arg(long, env = "TV_JSON_LOGS")]
    json_logs: bool,

    /// Path of the settings file (default: the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision a new tunnel and deploy it to its server
    Create {
        /// Tunnel name (generated from the login name when omitted)
        #[arg(long)]
        name: Option<String>,

        /// Pick the server from the server-list file by label
        #[arg(long, conflicts_with_all = ["server_public_ip", "server_private_ip"])]
        server_label: Option<String>,

        /// Public IP of the server
        #[arg(long, requires = "server_private_ip")]
        server_public_ip: Option<String>,

        /// Private IP of the server end of the tunnel
        #[arg(long)]
        server_private_ip: Option<String>,

        /// Private IP of the client end (defaults to this host's private IP)
        #[arg(long)]
        client_private_ip: Option<String>,

        /// Connection topology
        #[arg(long, value_enum, default_value = "p2p")]
        topology: TopologyArg,

        /// Tunnel interface name
        #[arg(long, default_value = "tun0")]
        interface: String,

        /// Port in the unprivileged range 1024-49151
        #[arg(long, default_value_t = 1194)]
        port: u16,

        /// Transport protocol
        #[arg(long, value_enum, default_value = "udp")]
        protocol: ProtocolArg,

        /// Connect the tunnel once provisioning succeeds
        #[arg(long)]
        connect: bool,
    },

    /// Connect one tunnel, or every registered tunnel
    Connect {
        /// Tunnel name (all tunnels when omitted)
        name: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Disconnect one tunnel, or every registered tunnel
    Disconnect {
        /// Tunnel name (all tunnels when omitted)
        name: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Delete one tunnel, or every registered tunnel, tearing down remote
    /// and local artifacts
    Delete {
        /// Tunnel name (all tunnels when omitted)
        name: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// List registered tunnels
    List,

    /// Remove the local workspace left behind by a failed provisioning run
    Cleanup {
        /// Tunnel name
        name: String,
    },

    /// Show this host's public IP as seen from the outside
    IpInfo,
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunnelvision")
        .join("config.toml")
}

/// Ask before proceeding unless `--yes` was passed.
fn confirm(prompt: &str, skip: bool) -> Result<bool> {
    if skip {
        return Ok(true);
    }
    print!("{} [y/N] ", prompt);
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

/// Best-effort detection of this host's private address: the address a UDP
/// socket would source from toward a non-local peer. No traffic is sent.
fn local_private_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("10.255.255.255:1").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

/// Login name plus a random suffix, for when `create` is given no name.
fn generate_tunnel_name() -> String {
    let login = std::env::var("USER").unwrap_or_else(|_| "operator".to_string());
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{}_{}", login, suffix)
}

fn report_batch(operation: &str, report: &BatchReport) -> Result<()> {
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(()) => println!("{}: {} ok", operation, outcome.name),
            Err(e) => println!("{}: {} FAILED: {}", operation, outcome.name, e),
        }
    }
    if report.outcomes.is_empty() {
        println!("{}: no tunnels registered", operation);
    }
    if !report.is_clean() {
        bail!(
            "{} failed for {} of {} tunnel(s)",
            operation,
            report.outcomes.len() - report.succeeded(),
            report.outcomes.len()
        );
    }
    Ok(())
}

async fn ip_info(runner: &dyn CommandRunner) -> Result<()> {
    let raw = runner
        .run("curl", &["-s", "https://ipinfo.io"], None)
        .await
        .context("failed to query ipinfo.io")?;
    let parsed: serde_json::Value = serde_json::from_str(&raw).context("unexpected response")?;

    let field = |key: &str| {
        parsed
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("N/A")
            .to_string()
    };
    println!(
        "Your current IP Address is {} ({}, {}, {})",
        field("ip"),
        field("city"),
        field("region"),
        field("country")
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn create(
    runner: &dyn CommandRunner,
    settings: &Settings,
    name: Option<String>,
    server_label: Option<String>,
    server_public_ip: Option<String>,
    server_private_ip: Option<String>,
    client_private_ip: Option<String>,
    topology: TopologyArg,
    interface: String,
    port: u16,
    protocol: ProtocolArg,
    connect_after: bool,
) -> Result<()> {
    let name = name.unwrap_or_else(generate_tunnel_name);

    let (server_public_ip, server_private_ip) = match (server_label, server_public_ip) {
        (Some(label), _) => {
            let list = servers::load_servers(&settings.servers_path)
                .with_context(|| format!("cannot read server list for label `{}`", label))?;
            let entry = list
                .get(&label)
                .with_context(|| format!("server label `{}` not in the server list", label))?;
            (entry.public_ip.clone(), entry.private_ip.clone())
        }
        (None, Some(public)) => {
            let private = server_private_ip
                .context("--server-private-ip is required with --server-public-ip")?;
            (public, private)
        }
        (None, None) => bail!("either --server-label or --server-public-ip is required"),
    };

    let client_private_ip = match client_private_ip {
        Some(ip) => ip,
        None => local_private_ip().context("could not detect a local private IP; pass --client-private-ip")?,
    };

    let record = TunnelRecord {
        connection_type: topology.into(),
        server_public_ip,
        server_private_ip,
        client_private_ip,
        interface_name: interface,
        port_number: port,
        protocol: protocol.into(),
    };

    let provisioner = Provisioner::new(runner, settings);
    provisioner.preflight().await?;

    if let Err(e) = provisioner.provision(&name, &record).await {
        warn!(tunnel = %name, "provisioning failed; workspace kept for inspection");
        bail!("{e}\nRun `tvctl cleanup {name}` to remove the partial workspace.");
    }

    println!(
        "Tunnel `{}` provisioned. Configuration files are in {}",
        name,
        settings.workspace_dir.join(&name).display()
    );

    if connect_after {
        let report = LifecycleManager::new(runner, settings)
            .connect(Some(&name))
            .await?;
        report_batch("connect", &report)?;
    }

    Ok(())
}

async fn list(settings: &Settings) -> Result<()> {
    let map = Registry::new(&settings.registry_path).load().await?;
    if map.is_empty() {
        println!("No tunnels registered.");
        return Ok(());
    }
    for (name, record) in map {
        println!(
            "{}  {}  {}://{}:{}  {} -> {}  dev {}",
            name,
            record.connection_type,
            record.protocol,
            record.server_public_ip,
            record.port_number,
            record.client_private_ip,
            record.server_private_ip,
            record.interface_name,
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let settings = Settings::load_or_default(&config_path)
        .with_context(|| format!("failed to load settings from {}", config_path.display()))?;

    // An explicit flag (or TV_LOG_LEVEL) wins over the settings file
    let level = match args.log_level {
        Some(arg) => arg.into(),
        None => level_from_str(&settings.log_level),
    };
    let _guard = init_logging(LogOptions {
        level,
        json_format: args.json_logs,
        ..Default::default()
    });

    if !nix::unistd::Uid::effective().is_root() {
        warn!("not running as root; local service control and config installs will likely fail");
    }

    let runner = SystemRunner::new();

    match args.command {
        Command::Create {
            name,
            server_label,
            server_public_ip,
            server_private_ip,
            client_private_ip,
            topology,
            interface,
            port,
            protocol,
            connect,
        } => {
            create(
                &runner,
                &settings,
                name,
                server_label,
                server_public_ip,
                server_private_ip,
                client_private_ip,
                topology,
                interface,
                port,
                protocol,
                connect,
            )
            .await?;
        }
        Command::Connect { name, yes } => {
            if !confirm("Connect?", yes)? {
                println!("Aborted.");
                return Ok(());
            }
            let report = LifecycleManager::new(&runner, &settings)
                .connect(name.as_deref())
                .await?;
            report_batch("connect", &report)?;
        }
        Command::Disconnect { name, yes } => {
            // Mention any live daemons in the prompt so a batch disconnect
            // is an informed choice
            let active = runner.run("pgrep", &["openvpn"], None).await.is_ok();
            let prompt = if active {
                "Active VPN processes found. Disconnect?"
            } else {
                "Disconnect?"
            };
            if !confirm(prompt, yes)? {
                println!("Aborted.");
                return Ok(());
            }
            let report = LifecycleManager::new(&runner, &settings)
                .disconnect(name.as_deref())
                .await?;
            report_batch("disconnect", &report)?;
        }
        Command::Delete { name, yes } => {
            if !confirm(
                "Delete tunnel(s) and tear down remote artifacts?",
                yes,
            )? {
                println!("Aborted.");
                return Ok(());
            }
            let report = LifecycleManager::new(&runner, &settings)
                .delete(name.as_deref())
                .await?;
            report_batch("delete", &report)?;
        }
        Command::List => list(&settings).await?,
        Command::Cleanup { name } => {
            Provisioner::new(&runner, &settings).cleanup(&name).await?;
            println!("Workspace for `{}` removed.", name);
        }
        Command::IpInfo => ip_info(&runner).await?,
    }

    info!("tvctl command completed");
    Ok(())
}
