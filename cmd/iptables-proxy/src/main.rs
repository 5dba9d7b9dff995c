use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pkg_constants::network::{DEFAULT_API_ADDR, DEFAULT_HEALTH_BIND_ADDR, DEFAULT_MASQUERADE_BIT};
use pkg_constants::paths::DEFAULT_PROXY_CONFIG;
use pkg_constants::proxy::{
    DEFAULT_BURST_SYNCS, DEFAULT_MIN_SYNC_PERIOD_SECS, DEFAULT_POLL_INTERVAL_SECS,
    DEFAULT_SYNC_PERIOD_SECS,
};
use pkg_metrics::MetricsRegistry;
use pkg_network::addresses::InterfaceAddresses;
use pkg_network::conntrack::ConntrackRunner;
use pkg_network::iptables::{Iptables, IptablesRunner};
use pkg_network::ports::ListenPortOpener;
use pkg_proxy::cleanup::cleanup_leftovers;
use pkg_proxy::{KernelHandles, Proxier, ProxierConfig};
use pkg_types::config::{ProxyConfigFile, load_config_file};
use pkg_types::validate::{validate_cidr, validate_ip, validate_masquerade_bit, validate_sync_periods};

mod health;
mod source;

#[derive(Parser, Debug)]
#[command(name = "iptables-proxy", about = "iptables-mode service proxy")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_PROXY_CONFIG)]
    config: String,

    /// API server the Services and Endpoints are polled from
    #[arg(long)]
    server: Option<String>,

    /// Bearer token for the API server
    #[arg(long)]
    token: Option<String>,

    /// Node name used to decide which endpoints are local (defaults to the system hostname)
    #[arg(long)]
    hostname: Option<String>,

    /// This node's IP, used to allow hairpin traffic through load balancer source ranges
    #[arg(long)]
    node_ip: Option<String>,

    /// Pod CIDR; traffic from outside it is masqueraded
    #[arg(long)]
    cluster_cidr: Option<String>,

    /// SNAT all service traffic
    #[arg(long)]
    masquerade_all: bool,

    /// fwmark bit for SNAT; the drop mark uses the next bit
    #[arg(long)]
    masquerade_bit: Option<u32>,

    /// CIDRs whose local addresses accept node port traffic (comma separated)
    #[arg(long, value_delimiter = ',')]
    nodeport_addresses: Vec<String>,

    /// Minimum seconds between rule syncs
    #[arg(long)]
    min_sync_period: Option<u64>,

    /// Seconds between forced rule syncs
    #[arg(long)]
    sync_period: Option<u64>,

    /// Syncs allowed back-to-back before the minimum period applies
    #[arg(long)]
    burst_syncs: Option<u32>,

    /// Seconds between API server polls
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Address for /healthz and /metrics
    #[arg(long)]
    health_bind_address: Option<String>,

    /// Program ip6tables instead of iptables
    #[arg(long)]
    ipv6: bool,

    /// Remove every chain and jump rule the proxy installs, then exit
    #[arg(long)]
    cleanup: bool,
}

/// Fully merged settings.
#[derive(Debug)]
struct Settings {
    server: String,
    token: Option<String>,
    poll_interval: Duration,
    health_addr: SocketAddr,
    proxier: ProxierConfig,
}

fn system_hostname() -> anyhow::Result<String> {
    nix::unistd::gethostname()
        .context("failed to read the system hostname")?
        .into_string()
        .map_err(|_| anyhow::anyhow!("system hostname is not valid UTF-8"))
}

/// Merge: CLI args > config file > defaults, then validate.
fn resolve(cli: Cli, file: ProxyConfigFile) -> anyhow::Result<Settings> {
    let hostname = match cli.hostname.or(file.hostname) {
        Some(h) => h,
        None => system_hostname()?,
    };
    let node_ip = cli
        .node_ip
        .or(file.node_ip)
        .map(|ip| validate_ip(&ip))
        .transpose()?;
    let cluster_cidr = cli
        .cluster_cidr
        .or(file.cluster_cidr)
        .map(|c| validate_cidr(&c))
        .transpose()?;
    let nodeport_addresses = if cli.nodeport_addresses.is_empty() {
        file.nodeport_addresses.unwrap_or_default()
    } else {
        cli.nodeport_addresses
    };
    let nodeport_addresses = nodeport_addresses
        .iter()
        .map(|c| validate_cidr(c))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let masquerade_bit = cli
        .masquerade_bit
        .or(file.masquerade_bit)
        .unwrap_or(DEFAULT_MASQUERADE_BIT);
    validate_masquerade_bit(masquerade_bit)?;

    let min_sync_period = Duration::from_secs(
        cli.min_sync_period
            .or(file.min_sync_period)
            .unwrap_or(DEFAULT_MIN_SYNC_PERIOD_SECS),
    );
    let sync_period = Duration::from_secs(
        cli.sync_period
            .or(file.sync_period)
            .unwrap_or(DEFAULT_SYNC_PERIOD_SECS),
    );
    validate_sync_periods(min_sync_period, sync_period)?;

    let health_addr = cli
        .health_bind_address
        .or(file.health_bind_address)
        .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDR.to_string());
    let health_addr: SocketAddr = health_addr
        .parse()
        .with_context(|| format!("invalid health bind address '{}'", health_addr))?;

    let poll_interval = Duration::from_secs(
        cli.poll_interval
            .or(file.poll_interval)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS)
            .max(1),
    );

    Ok(Settings {
        server: cli
            .server
            .or(file.server)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
        token: cli.token.or(file.token),
        poll_interval,
        health_addr,
        proxier: ProxierConfig {
            hostname,
            node_ip,
            cluster_cidr,
            masquerade_all: cli.masquerade_all || file.masquerade_all.unwrap_or(false),
            masquerade_bit,
            nodeport_addresses,
            min_sync_period,
            sync_period,
            burst_syncs: cli
                .burst_syncs
                .or(file.burst_syncs)
                .unwrap_or(DEFAULT_BURST_SYNCS),
        },
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let ipv6 = cli.ipv6;
    let iptables: Arc<dyn Iptables> = Arc::new(IptablesRunner::new(ipv6));

    if cli.cleanup {
        info!("Removing proxy rules (ipv6={})", ipv6);
        if cleanup_leftovers(&*iptables).await {
            anyhow::bail!("cleanup finished with errors");
        }
        info!("Cleanup complete");
        return Ok(());
    }

    // Load config file (returns defaults if file not found)
    let file_cfg: ProxyConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);
    let settings = resolve(cli, file_cfg)?;

    info!("Starting iptables-proxy");
    info!("  Server:        {}", settings.server);
    info!("  Hostname:      {}", settings.proxier.hostname);
    info!(
        "  Cluster CIDR:  {}",
        settings
            .proxier
            .cluster_cidr
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    info!(
        "  Sync period:   {:?} (min {:?}, burst {})",
        settings.proxier.sync_period,
        settings.proxier.min_sync_period,
        settings.proxier.burst_syncs
    );
    info!("  Health:        {}", settings.health_addr);

    let metrics = Arc::new(MetricsRegistry::new());
    let proxier = Arc::new(Proxier::new(
        settings.proxier,
        KernelHandles {
            iptables,
            conntrack: Arc::new(ConntrackRunner::new()),
            ports: Arc::new(ListenPortOpener::new(ipv6)),
            node_addresses: Arc::new(InterfaceAddresses),
        },
        metrics.clone(),
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health_task = tokio::spawn(health::serve(
        settings.health_addr,
        proxier.health(),
        metrics,
        shutdown_rx.clone(),
    ));

    let events = source::EventSource::new(&settings.server, settings.token, settings.poll_interval)?;
    let source_task = tokio::spawn({
        let proxier = proxier.clone();
        let shutdown = shutdown_rx.clone();
        async move { events.run(&proxier, shutdown).await }
    });

    let sync_task = tokio::spawn({
        let proxier = proxier.clone();
        async move { proxier.sync_loop(shutdown_rx).await }
    });

    // Block until Ctrl-C
    info!("Proxy is running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down proxy");
    if shutdown_tx.send(true).is_err() {
        warn!("All tasks already stopped");
    }

    if let Err(e) = sync_task.await {
        error!("Sync loop panicked: {}", e);
    }
    if let Err(e) = source_task.await {
        error!("Event source panicked: {}", e);
    }
    match health_task.await {
        Ok(Err(e)) => error!("Health server failed: {:#}", e),
        Err(e) => error!("Health server panicked: {}", e),
        Ok(Ok(())) => {}
    }
    Ok(())
}
