//! anneal - declarative Kubernetes control plane operator for bare-metal nodes

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use anneal::agent::SshConfig;
use anneal::cluster::Cluster;
use anneal::pki::CertificateAuthority;
use anneal::reconcile::etcd_decide_to_do;
use anneal::server::{Server, ServerConfig};
use anneal::status::ClusterStatus;
use anneal::storage::{CaKind, MemStorage, Storage};

/// anneal - drive bare-metal nodes toward a desired cluster state
#[derive(Parser, Debug)]
#[command(name = "anneal", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconciliation loop against a cluster manifest
    Serve(ServeArgs),

    /// Run the decision function once against a status snapshot and print
    /// the chosen operation (dry run)
    Decide(DecideArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Cluster manifest (YAML)
    #[arg(long)]
    config: PathBuf,

    /// Seconds between successful ticks
    #[arg(long, default_value = "10")]
    interval: u64,

    /// SSH login user
    #[arg(long, default_value = "root")]
    ssh_user: String,

    /// SSH port
    #[arg(long, default_value = "22")]
    ssh_port: u16,

    /// SSH private key used for every node
    #[arg(long)]
    ssh_key: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct DecideArgs {
    /// Cluster manifest (YAML)
    #[arg(long)]
    config: PathBuf,

    /// Observed status snapshot (YAML)
    #[arg(long)]
    status: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Decide(args) => run_decide(args).await,
    }
}

async fn load_cluster(path: &PathBuf) -> anyhow::Result<Cluster> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let cluster = load_cluster(&args.config).await?;
    tracing::info!(cluster = %cluster.name, nodes = cluster.nodes.len(), "manifest loaded");

    let storage = Arc::new(MemStorage::new());
    storage.put_cluster(&cluster, None).await?;
    ensure_ca_material(storage.as_ref()).await?;

    let config = ServerConfig {
        interval: Duration::from_secs(args.interval),
        ssh: SshConfig {
            user: args.ssh_user,
            port: args.ssh_port,
            key_path: args.ssh_key,
            ..Default::default()
        },
    };

    let ct = CancellationToken::new();
    let signal_ct = ct.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            signal_ct.cancel();
        }
    });

    Server::new(storage, config).run(ct).await?;
    Ok(())
}

/// Generate and store self-signed CAs on first start.
///
/// Deployments with an external certificate authority seed the store
/// themselves; this keeps the single-binary path working out of the box.
async fn ensure_ca_material(storage: &dyn Storage) -> anyhow::Result<()> {
    for kind in [CaKind::Server, CaKind::EtcdPeer, CaKind::EtcdClient] {
        if storage.get(&kind.cert_key()).await?.is_none() {
            let ca = CertificateAuthority::new(&format!("anneal-ca-{kind}"))?;
            storage.put_ca(kind, ca.ca_cert_pem(), ca.ca_key_pem()).await?;
            tracing::info!(ca = %kind, "generated self-signed CA");
        }
    }
    Ok(())
}

async fn run_decide(args: DecideArgs) -> anyhow::Result<()> {
    let cluster = load_cluster(&args.config).await?;
    let raw = tokio::fs::read_to_string(&args.status)
        .await
        .with_context(|| format!("reading {}", args.status.display()))?;
    let status: ClusterStatus =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", args.status.display()))?;

    match etcd_decide_to_do(&cluster, &status) {
        None => println!("steady state"),
        Some(mut op) => {
            println!("{}", op.name());
            while let Some(commander) = op.next_command() {
                println!("  {}", commander.command());
            }
        }
    }
    Ok(())
}
