//! Gangway CLI - connect a workstation to a cluster's network

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tonic::transport::Endpoint;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gangway::cluster::{Cluster, ClusterConfig};
use gangway::install::{InstallParams, Installer, KubeBrokerApi};
use gangway::netd::GrpcNetDaemon;
use gangway::proto::broker::broker_client::BrokerClient;
use gangway::session::{
    default_broker_address, ClusterIdentity, ConnectRequest, GrpcBroker, InterceptRequest,
    Session, SessionDeps, TcpDialer, UninstallScope,
};
use gangway::workloads::{KubeWorkloadLister, WorkloadInfo, WorkloadWatcher};
use gangway::{DEFAULT_NETD_PORT, PRODUCT_NAME, VERSION};

/// Gangway - route cluster traffic to and from this workstation
#[derive(Parser, Debug)]
#[command(name = "gangway", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to a cluster and serve the session until interrupted
    Connect(ConnectArgs),

    /// List workloads in the mapped namespaces as JSON
    List(ListArgs),

    /// Remove agents and, optionally, the broker from the cluster
    Uninstall(UninstallArgs),

    /// Print version information
    Version,
}

#[derive(Parser, Debug)]
struct ConnectArgs {
    /// Kubeconfig context to use; defaults to the current context
    #[arg(long)]
    context: Option<String>,

    /// Namespaces to map into the workstation's network ("all" maps every one)
    #[arg(long = "namespace", short = 'n')]
    namespaces: Vec<String>,

    /// Extra CIDRs to route into the cluster
    #[arg(long = "also-proxy")]
    also_proxy_subnets: Vec<String>,

    /// Broker endpoint as seen from the workstation
    #[arg(long, default_value_t = default_broker_address())]
    broker_address: String,

    /// Broker image override (defaults to this build's matching image)
    #[arg(long, env = "GANGWAY_BROKER_IMAGE")]
    broker_image: Option<String>,

    /// Bound on installing and waiting for the broker, in seconds
    #[arg(long, default_value = "120")]
    install_timeout_secs: u64,

    /// Localhost port of the net daemon's gRPC API
    #[arg(long, default_value_t = DEFAULT_NETD_PORT)]
    netd_port: u16,

    /// Intercepts to set up once connected, as workload:local-port[:namespace]
    #[arg(long = "intercept")]
    intercepts: Vec<String>,
}

#[derive(Parser, Debug)]
struct ListArgs {
    /// Kubeconfig context to use; defaults to the current context
    #[arg(long)]
    context: Option<String>,

    /// Namespace to list; defaults to all
    #[arg(long, short = 'n')]
    namespace: Option<String>,
}

#[derive(Parser, Debug)]
struct UninstallArgs {
    /// Kubeconfig context to use; defaults to the current context
    #[arg(long)]
    context: Option<String>,

    /// Agent names to remove
    #[arg(long = "agent")]
    agents: Vec<String>,

    /// Remove every installed agent
    #[arg(long)]
    all_agents: bool,

    /// Remove every agent and the broker itself
    #[arg(long)]
    everything: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Connect(args) => run_connect(args).await,
        Commands::List(args) => run_list(args).await,
        Commands::Uninstall(args) => run_uninstall(args).await,
        Commands::Version => {
            println!("{PRODUCT_NAME} {VERSION}");
            Ok(())
        }
    }
}

/// Connect, apply any requested intercepts, and serve until Ctrl-C
async fn run_connect(args: ConnectArgs) -> anyhow::Result<()> {
    let requested = parse_intercepts(&args.intercepts)?;

    let cluster_config = ClusterConfig {
        context: args.context.clone(),
        mapped_namespaces: args.namespaces.clone(),
        also_proxy_subnets: args.also_proxy_subnets.clone(),
    };
    let cluster = Cluster::connect(&cluster_config).await?;
    let identity = ClusterIdentity {
        context: cluster.context().to_string(),
        server: cluster.server().to_string(),
        cluster_id: cluster.cluster_id().await,
    };

    // Lazy channel: the broker may not be installed yet; the installer runs
    // before the first RPC goes out.
    let channel = Endpoint::from_shared(args.broker_address.clone())
        .with_context(|| format!("invalid broker address {}", args.broker_address))?
        .connect_timeout(Duration::from_secs(5))
        .connect_lazy();

    let netd = GrpcNetDaemon::connect_to(args.netd_port)
        .await
        .with_context(|| {
            format!(
                "net daemon not reachable on 127.0.0.1:{}; is it running?",
                args.netd_port
            )
        })?;

    let deps = SessionDeps {
        broker: Arc::new(GrpcBroker::new(channel.clone())),
        netd: Arc::new(netd),
        installer: Arc::new(Installer::new(
            Arc::new(KubeBrokerApi::new(cluster.client())),
            InstallParams {
                image: args.broker_image.clone(),
                ..Default::default()
            },
        )),
        lister: Arc::new(KubeWorkloadLister::new(cluster.client())),
        dialer: Arc::new(TcpDialer::new(BrokerClient::new(channel))),
        token_source: None,
    };
    let request = ConnectRequest {
        cluster: cluster_config,
        broker_address: args.broker_address,
        install: InstallParams {
            image: args.broker_image,
            ..Default::default()
        },
        install_timeout: Duration::from_secs(args.install_timeout_secs),
    };

    let session = Session::establish(deps, &request, identity).await?;
    let status = session.status().await;
    tracing::info!(
        session = %status.session_id,
        context = %status.context,
        "Connected"
    );

    if !requested.is_empty() {
        let session = session.clone();
        session
            .clone()
            .register_task("initial-intercepts", async move {
                for intercept in requested {
                    let info = session.add_intercept(&intercept).await?;
                    tracing::info!(
                        intercept = %info.spec.as_ref().map(|s| s.name.as_str()).unwrap_or(""),
                        "Intercept active"
                    );
                }
                Ok(())
            })
            .await;
    }

    let mut run = tokio::spawn(session.clone().run());
    tokio::select! {
        result = &mut run => return Ok(result??),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received, disconnecting");
            session.cancel();
        }
    }
    // Let the heartbeat loop finish its ordered teardown before exiting
    run.await??;
    Ok(())
}

/// One-shot workload listing, printed as JSON
async fn run_list(args: ListArgs) -> anyhow::Result<()> {
    let cluster = Cluster::connect(&ClusterConfig {
        context: args.context,
        mapped_namespaces: args.namespace.iter().cloned().collect(),
        also_proxy_subnets: Vec::new(),
    })
    .await?;

    let lister = Arc::new(KubeWorkloadLister::new(cluster.client()));
    let namespaces: Vec<String> = args.namespace.iter().cloned().collect();
    let watcher = WorkloadWatcher::new(lister, &namespaces);
    watcher.refresh().await?;

    let infos: Vec<WorkloadInfo> = watcher
        .snapshot()
        .await
        .into_iter()
        .map(|workload| WorkloadInfo {
            workload,
            agent: None,
            intercept: None,
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&infos)?);
    Ok(())
}

/// One-shot agent/broker removal, without a session
async fn run_uninstall(args: UninstallArgs) -> anyhow::Result<()> {
    let scope = match (args.everything, args.all_agents, args.agents.is_empty()) {
        (true, _, _) => UninstallScope::Everything,
        (false, true, _) => UninstallScope::AllAgents,
        (false, false, false) => UninstallScope::NamedAgents(args.agents.clone()),
        (false, false, true) => {
            anyhow::bail!("nothing to uninstall: pass --agent, --all-agents, or --everything")
        }
    };

    let cluster = Cluster::connect(&ClusterConfig {
        context: args.context,
        ..Default::default()
    })
    .await?;
    let installer = Installer::new(
        Arc::new(KubeBrokerApi::new(cluster.client())),
        InstallParams::default(),
    );

    let installed = installer.installed_agents().await?;
    let targets: Vec<(String, String)> = match &scope {
        UninstallScope::NamedAgents(names) => installed
            .into_iter()
            .filter(|(name, _)| names.contains(name))
            .collect(),
        _ => installed,
    };

    match scope {
        UninstallScope::Everything => {
            installer.remove_broker_and_agents(true, &targets).await?;
            tracing::info!("Broker and agents removed");
        }
        _ => {
            let count = targets.len();
            installer.remove_agents(&targets).await?;
            tracing::info!(count, "Agents removed");
        }
    }
    Ok(())
}

/// Parse `workload:local-port[:namespace]` intercept flags
fn parse_intercepts(specs: &[String]) -> anyhow::Result<Vec<InterceptRequest>> {
    specs
        .iter()
        .map(|spec| {
            let parts: Vec<&str> = spec.split(':').collect();
            let (workload, port, namespace) = match parts.as_slice() {
                [workload, port] => (*workload, *port, "default"),
                [workload, port, namespace] => (*workload, *port, *namespace),
                _ => anyhow::bail!(
                    "invalid intercept {spec}: expected workload:local-port[:namespace]"
                ),
            };
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid local port in intercept {spec}"))?;
            Ok(InterceptRequest::new(workload, namespace, port))
        })
        .collect()
}
