//! WolfMesh - Peer-to-Peer Mesh VPN
//!
//! Runs either the rendezvous service or a mesh member bound to a TUN
//! device.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfmesh::config::{LoggingConfig, WolfMeshConfig};
use wolfmesh::rendezvous::RendezvousServer;

/// WolfMesh - Peer-to-Peer Mesh VPN
#[derive(Parser)]
#[command(name = "wolfmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfmesh.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rendezvous service
    Rendezvous {
        /// Address to listen on (host:port)
        #[arg(short, long)]
        listen: Option<String>,

        /// Network map broadcast interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Evict members silent for this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Join a mesh network through a TUN device
    Member {
        /// Mesh network name
        #[arg(short, long)]
        network: Option<String>,

        /// Pre-shared key for the mesh
        #[arg(long)]
        psk: Option<String>,

        /// Rendezvous address (host:port)
        #[arg(short, long)]
        rendezvous: Option<String>,

        /// TUN interface name
        #[arg(long)]
        tun_name: Option<String>,

        /// Inside address with prefix (e.g. 192.168.50.2/24)
        #[arg(long)]
        tun_ip: Option<String>,

        /// TUN interface MTU
        #[arg(long)]
        mtu: Option<u16>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfmesh.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { output } = &cli.command {
        return run_init(output);
    }

    let mut config = WolfMeshConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging);

    match cli.command {
        Commands::Rendezvous {
            listen,
            interval_ms,
            timeout_secs,
        } => {
            if let Some(listen) = listen {
                config.rendezvous.bind_address = listen;
            }
            if let Some(interval_ms) = interval_ms {
                config.rendezvous.broadcast_interval_ms = interval_ms;
            }
            if let Some(timeout_secs) = timeout_secs {
                config.rendezvous.member_timeout_secs = timeout_secs;
            }
            run_rendezvous(config).await
        }
        Commands::Member {
            network,
            psk,
            rendezvous,
            tun_name,
            tun_ip,
            mtu,
        } => {
            if let Some(network) = network {
                config.member.network_name = network;
            }
            if let Some(psk) = psk {
                config.member.psk = psk;
            }
            if let Some(rendezvous) = rendezvous {
                config.member.rendezvous_address = rendezvous;
            }
            if let Some(tun_name) = tun_name {
                config.interface.name = tun_name;
            }
            if let Some(tun_ip) = tun_ip {
                config.interface.address = tun_ip;
            }
            if let Some(mtu) = mtu {
                config.interface.mtu = mtu;
            }
            run_member(config).await
        }
        Commands::Validate => run_validate(&config),
        Commands::Init { .. } => Ok(()),
    }
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Run the rendezvous service until interrupted
async fn run_rendezvous(config: WolfMeshConfig) -> anyhow::Result<()> {
    config.validate()?;

    let listen = config
        .rendezvous
        .bind_address
        .parse()
        .with_context(|| format!("Invalid rendezvous address {}", config.rendezvous.bind_address))?;

    let server = Arc::new(
        RendezvousServer::bind(listen, config.broadcast_interval(), config.member_timeout())
            .await
            .with_context(|| format!("Failed to bind rendezvous to {}", listen))?,
    );

    let task = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down rendezvous...");
    server.stop();
    task.await??;

    Ok(())
}

/// Join the configured mesh through a TUN device until interrupted
#[cfg(target_os = "linux")]
async fn run_member(config: WolfMeshConfig) -> anyhow::Result<()> {
    use wolfmesh::interface::TunDevice;
    use wolfmesh::member::{MemberOptions, MeshMember};

    if unsafe { libc::geteuid() } != 0 {
        anyhow::bail!("wolfmesh member must run as root to create a TUN device");
    }

    let options = MemberOptions::from_config(&config).await?;
    let (address, prefix) = config.interface.inside_address()?;

    let tun = TunDevice::create(&config.interface.name)
        .with_context(|| format!("Failed to create TUN device {}", config.interface.name))?;
    tun.configure(address, prefix, config.interface.mtu)?;
    tracing::info!(
        "Interface {} up with {}/{} (mtu {})",
        tun.name(),
        address,
        prefix,
        config.interface.mtu
    );

    let member = Arc::new(MeshMember::new(Arc::new(tun), options).await?);
    let task = tokio::spawn({
        let member = Arc::clone(&member);
        async move { member.run().await }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Leaving mesh {}...", member.network_name());
    member.stop();

    match tokio::time::timeout(std::time::Duration::from_secs(5), task).await {
        Ok(result) => result??,
        Err(_) => tracing::warn!("Member did not stop within 5s"),
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run_member(_config: WolfMeshConfig) -> anyhow::Result<()> {
    anyhow::bail!("wolfmesh member requires a Linux TUN device")
}

/// Write a default configuration file
fn run_init(output: &Path) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{:?} already exists", output);
    }

    let rendered = WolfMeshConfig::default().to_toml()?;
    let content = format!(
        "# WolfMesh Configuration\n# Set member.network_name and member.psk before joining a mesh\n\n{}",
        rendered
    );
    std::fs::write(output, content)
        .with_context(|| format!("Failed to write {:?}", output))?;

    println!("Configuration written to {:?}", output);
    Ok(())
}

/// Validate configuration file
fn run_validate(config: &WolfMeshConfig) -> anyhow::Result<()> {
    config.validate()?;
    println!("✓ Configuration is valid");
    println!("  Rendezvous:     {}", config.rendezvous.bind_address);
    println!("  Broadcast:      {} ms", config.rendezvous.broadcast_interval_ms);
    println!("  Member Timeout: {} s", config.rendezvous.member_timeout_secs);

    match config.validate_member() {
        Ok(()) => {
            println!("  Network:        {}", config.member.network_name);
            println!("  Rendezvous At:  {}", config.member.rendezvous_address);
            println!("  Interface:      {} {}", config.interface.name, config.interface.address);
        }
        Err(e) => println!("  Member settings incomplete: {}", e),
    }

    Ok(())
}
