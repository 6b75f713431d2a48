use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use bethrou::{
    config::{Config, RelayClientMode},
    daemon::Daemon,
    identity::Keypair,
    membrane::PreSharedKey,
    routing::StrategyKind,
};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_IDENTITY: &str = "identity.key";
const DEFAULT_NETWORK_KEY: &str = "swarm.key";

#[derive(Parser)]
#[command(name = "bethrou")]
#[command(
    about = "Decentralized SOCKS5 proxy over a private peer-to-peer network",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an overlay node serving as exit and/or relay
    Node(NodeArgs),
    /// Run a local SOCKS5 proxy that tunnels through the overlay
    Client(ClientArgs),
    /// Generate a private network key
    Keygen {
        #[arg(short, long, default_value = DEFAULT_NETWORK_KEY)]
        out: PathBuf,
        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },
    /// Print the peer id of an identity key, creating the key if missing
    Identity {
        #[arg(short, long, default_value = DEFAULT_IDENTITY)]
        key: PathBuf,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Identity key file, created when missing
    #[arg(long)]
    identity: Option<PathBuf>,
    /// Private network key file
    #[arg(long)]
    network_key: Option<PathBuf>,
    /// Peer to dial on start, `[peer-id@]host:port`; repeatable
    #[arg(short, long)]
    bootstrap: Vec<String>,
    /// Peer listen address; repeatable
    #[arg(short, long)]
    listen: Vec<SocketAddr>,
}

#[derive(Args)]
struct NodeArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Do not serve as exit
    #[arg(long)]
    no_exit: bool,
    /// Serve as relay for peers behind NAT
    #[arg(long)]
    relay: bool,
    #[arg(long)]
    region: Option<String>,
    /// Publicly reachable address to advertise; repeatable
    #[arg(long)]
    external: Vec<String>,
}

#[derive(Args)]
struct ClientArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// SOCKS5 listen address
    #[arg(short, long)]
    socks: Option<SocketAddr>,
    /// Exit peer id to use first
    #[arg(short, long)]
    exit: Option<String>,
    /// static, round-robin or latency
    #[arg(long, value_parser = parse_strategy)]
    strategy: Option<StrategyKind>,
    /// Preferred exit region
    #[arg(long)]
    region: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Node(args) => cmd_node(args).await,
        Commands::Client(args) => cmd_client(args).await,
        Commands::Keygen { out, force } => cmd_keygen(&out, force),
        Commands::Identity { key } => cmd_identity(&key),
    }
}

async fn cmd_node(args: NodeArgs) -> Result<()> {
    let mut config = load_config(args.common.config.as_deref(), Config::node())?;
    apply_common(&mut config, &args.common);
    if args.no_exit {
        config.exit.enabled = false;
    }
    if args.relay {
        config.relay.server.enabled = true;
    }
    if args.region.is_some() {
        config.network.region = args.region;
    }
    config.network.external_addrs.extend(args.external);
    run(config).await
}

async fn cmd_client(args: ClientArgs) -> Result<()> {
    let mut config = load_config(args.common.config.as_deref(), Config::client())?;
    apply_common(&mut config, &args.common);
    config.socks.enabled = true;
    if let Some(socks) = args.socks {
        config.socks.listen = socks;
    }
    if args.exit.is_some() {
        config.routing.exit = args.exit;
    }
    if let Some(strategy) = args.strategy {
        config.routing.strategy = strategy;
    }
    if args.region.is_some() {
        config.routing.region = args.region;
    }
    run(config).await
}

fn cmd_keygen(out: &Path, force: bool) -> Result<()> {
    if out.exists() && !force {
        bail!("{} already exists, pass --force to replace it", out.display());
    }
    let key = PreSharedKey::generate();
    key.save(out)
        .with_context(|| format!("writing network key to {}", out.display()))?;
    println!("network key written to {}", out.display());
    println!("fingerprint {}", key.fingerprint());
    Ok(())
}

fn cmd_identity(path: &Path) -> Result<()> {
    let identity = Keypair::load_or_generate(path)
        .with_context(|| format!("loading identity from {}", path.display()))?;
    println!("{}", identity.peer_id());
    Ok(())
}

/// Reads the YAML file over `defaults`. Sections the file names replace the
/// defaults field by field.
fn load_config(path: Option<&Path>, defaults: Config) -> Result<Config> {
    let Some(path) = path else {
        return Ok(defaults);
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let mut merged = serde_yaml::to_value(&defaults).context("encoding default config")?;
    let overrides: serde_yaml::Value =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    merge_yaml(&mut merged, overrides);
    let config: Config = serde_yaml::from_value(merged)
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

fn merge_yaml(base: &mut serde_yaml::Value, overrides: serde_yaml::Value) {
    match (base, overrides) {
        (serde_yaml::Value::Mapping(base), serde_yaml::Value::Mapping(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(slot) => merge_yaml(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, value) if !value.is_null() => *base = value,
        _ => {}
    }
}

fn apply_common(config: &mut Config, args: &CommonArgs) {
    if let Some(identity) = &args.identity {
        config.network.identity_key = Some(identity.clone());
    }
    if let Some(key) = &args.network_key {
        config.network.network_key = Some(key.clone());
    }
    config.discovery.bootstrap.extend(args.bootstrap.iter().cloned());
    if !args.listen.is_empty() {
        config.network.listen = args.listen.clone();
    }
}

async fn run(config: Config) -> Result<()> {
    let identity_path = config
        .network
        .identity_key
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_IDENTITY));
    let identity = Keypair::load_or_generate(&identity_path)
        .with_context(|| format!("loading identity from {}", identity_path.display()))?;
    let psk = match &config.network.network_key {
        Some(path) => Some(
            PreSharedKey::load(path)
                .with_context(|| format!("loading network key from {}", path.display()))?,
        ),
        None => {
            warn!("no network key configured, joining the open network");
            None
        }
    };
    if config.relay.client.mode == RelayClientMode::Always && config.network.listen.is_empty() {
        warn!("relay client mode is always but the node has no listener");
    }

    let daemon = Daemon::start(config, identity, psk)
        .await
        .context("starting node")?;
    for addr in daemon.listen_addrs() {
        info!(%addr, "accepting peers");
    }
    if let Some(socks) = daemon.socks_addr() {
        info!(%socks, "SOCKS5 proxy ready");
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for ctrl-c")?;
            info!("shutting down");
            daemon.shutdown();
        }
        _ = daemon.stopped() => {}
    }
    Ok(())
}

fn parse_strategy(value: &str) -> Result<StrategyKind, String> {
    match value {
        "static" => Ok(StrategyKind::Static),
        "round-robin" => Ok(StrategyKind::RoundRobin),
        "latency" => Ok(StrategyKind::Latency),
        other => Err(format!("unknown strategy {other:?}")),
    }
}
