use clap::{Args, Parser, Subcommand};
use ethers::middleware::NonceManagerMiddleware;
use ethers::prelude::{Http, LocalWallet, Provider, SignerMiddleware};
use ethers::providers::Middleware;
use ethers::signers::Signer;
use ethers::types::U256;
use eyre::{eyre, Result};
use fs2::FileExt;
use infernet_node::chain::InfernetChain;
use infernet_node::config::Config;
use infernet_node::container_lookup::ContainerLookup;
use infernet_node::coordinator::CoordinatorClient;
use infernet_node::guardian::AllowlistGuardian;
use infernet_node::listener::ChainListener;
use infernet_node::orchestrator::{self, Orchestrator};
use infernet_node::processor::ChainProcessor;
use infernet_node::reader::ReaderClient;
use infernet_node::registry;
use infernet_node::rpc;
use infernet_node::store::{DataStore, StatsReporter, StoreSweeper};
use infernet_node::task::{AsyncTask, Shutdown};
use infernet_node::wallet::{NodeWallet, WalletChecker};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

type NodeClient = NonceManagerMiddleware<SignerMiddleware<Provider<Http>, LocalWallet>>;

#[derive(Parser, Debug)]
#[command(name = "infernet-node", version, about = "Infernet off-chain compute node")]
struct Cli {
    #[command(subcommand)]
    cmd: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node (default).
    Run(RunArgs),

    /// Approve the coordinator to draw a token from the node's payment
    /// wallet. The signing key must own the wallet contract.
    Approve(ApproveArgs),
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Path to the node configuration JSON.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Override the chain RPC URL from the config file.
    #[arg(long, env = "INFERNET_RPC_URL")]
    rpc_url: Option<String>,

    /// Run a single snapshot sync and scheduler pass, then exit.
    #[arg(long)]
    once: bool,

    /// Simulate everything but never submit a transaction.
    #[arg(long)]
    dry_run: bool,

    /// Lock file guarding against a second node racing the same key.
    #[arg(long, default_value = "infernet-node.lock")]
    lock_file: PathBuf,
}

#[derive(Args, Debug)]
struct ApproveArgs {
    /// Path to the node configuration JSON.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Override the chain RPC URL from the config file.
    #[arg(long, env = "INFERNET_RPC_URL")]
    rpc_url: Option<String>,

    /// Payment wallet contract to approve from.
    #[arg(long)]
    wallet: String,

    /// Spender, normally the coordinator address.
    #[arg(long)]
    spender: String,

    /// Token to approve; zero address for native.
    #[arg(long)]
    token: String,

    /// Amount in token base units.
    #[arg(long)]
    amount: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match cli.cmd {
        Some(Command::Approve(args)) => approve(args).await,
        Some(Command::Run(args)) => run(args).await,
        None => run(cli.run).await,
    }
}

/// Connects the signing middleware stack. Refuses to run against the
/// wrong network or an empty registry address.
async fn connect(
    cfg: &Config,
    rpc_override: Option<String>,
) -> Result<(Arc<NodeClient>, u64, ethers::types::Address)> {
    let rpc_url = rpc_override
        .or_else(|| cfg.chain.rpc_url.clone())
        .ok_or_else(|| eyre!("no rpc url configured"))?;

    let private_key = cfg.resolve_private_key()?;
    let provider =
        Provider::<Http>::try_from(rpc_url.as_str())?.interval(Duration::from_millis(800));

    let chain_id = provider.get_chainid().await?.as_u64();
    if let Some(expected) = cfg.chain.chain_id {
        if chain_id != expected {
            return Err(eyre!(
                "RPC chainId mismatch: config expects {expected}, RPC reports {chain_id}. Refusing to run."
            ));
        }
    }

    let wallet: LocalWallet = private_key
        .parse::<LocalWallet>()
        .map_err(|e| eyre!("invalid private key: {e}"))?
        .with_chain_id(chain_id);

    let registry_address = cfg
        .chain
        .registry_address
        .ok_or_else(|| eyre!("no registry address configured"))?;
    let code = provider.get_code(registry_address, None).await?;
    if code.0.is_empty() {
        return Err(eyre!(
            "no contract code at registry address {registry_address:?}; check config and RPC"
        ));
    }

    let address = wallet.address();
    let signer = SignerMiddleware::new(provider, wallet);
    let client = Arc::new(NonceManagerMiddleware::new(signer, address));
    Ok((client, chain_id, address))
}

async fn run(args: RunArgs) -> Result<()> {
    let cfg = Config::load(&args.config)?;

    let shutdown = Shutdown::new();
    let store = DataStore::new();
    let endpoints = orchestrator::resolve_endpoints(&cfg.containers, orchestrator::running_in_docker());
    tracing::info!(
        containers = endpoints.len(),
        manage_containers = cfg.manage_containers,
        forward_stats = cfg.forward_stats,
        "container endpoints resolved"
    );
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), endpoints));

    if !cfg.chain.enabled {
        tracing::warn!("chain is disabled; serving off-chain jobs only");
        return run_chainless(store, cfg.forward_stats, shutdown).await;
    }

    // Single-instance guard: two nodes sharing one signing key would race
    // nonces.
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&args.lock_file)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", args.lock_file.display()))?;
    lock_file.try_lock_exclusive().map_err(|e| {
        eyre!(
            "node already running or lock unavailable ({}): {e}",
            args.lock_file.display()
        )
    })?;
    let _lock_guard = lock_file;

    let (client, chain_id, node_address) = connect(&cfg, args.rpc_url.clone()).await?;

    let registry_address = cfg
        .chain
        .registry_address
        .ok_or_else(|| eyre!("no registry address configured"))?;
    let addresses = registry::resolve_registry(client.clone(), registry_address).await?;

    let lookup = Arc::new(ContainerLookup::new(&cfg.container_ids()));
    let coordinator = Arc::new(CoordinatorClient::new(
        addresses.coordinator,
        client.clone(),
        lookup.clone(),
        chain_id,
    ));
    let reader = ReaderClient::new(addresses.reader, client.clone(), coordinator.clone());
    let node_wallet = Arc::new(NodeWallet::new(
        client.clone(),
        node_address,
        cfg.chain.wallet.payment_address,
        cfg.chain.wallet.max_gas_limit,
    ));
    let checker = WalletChecker::new(
        client.clone(),
        addresses.wallet_factory,
        &cfg.containers,
        node_wallet.has_payment_address(),
    );
    let infernet_chain = Arc::new(InfernetChain::new(
        client,
        coordinator,
        reader,
        node_wallet,
        checker,
        cfg.chain.wallet.allowed_sim_errors.clone(),
    ));

    let guardian = Arc::new(AllowlistGuardian::new(&cfg.containers, lookup.clone()));
    let processor = Arc::new(ChainProcessor::new(
        infernet_chain.clone(),
        orchestrator.clone(),
        lookup,
        shutdown.clone(),
        cfg.chain.snapshot_sync.sync_period_duration(),
        args.dry_run,
    ));
    let chain_listener = Arc::new(ChainListener::new(
        infernet_chain,
        processor.clone(),
        guardian,
        cfg.chain.trail_head_blocks,
        cfg.chain.snapshot_sync.clone(),
        shutdown.clone(),
    ));

    tracing::info!(
        chain_id,
        node = ?node_address,
        coordinator = ?addresses.coordinator,
        dry_run = args.dry_run,
        once = args.once,
        "node starting"
    );

    if let Some(wait) = cfg.startup_wait {
        tracing::info!(seconds = wait, "waiting for containers to come up");
        shutdown.sleep(Duration::from_secs_f64(wait.max(0.0))).await;
    }

    chain_listener.setup().await?;
    processor.setup().await?;

    if args.once {
        processor.process_once().await;
        processor.cleanup().await?;
        chain_listener.cleanup().await?;
        tracing::info!("single pass complete");
        return Ok(());
    }

    let mut tasks: Vec<(&'static str, Arc<dyn AsyncTask>)> = vec![
        ("listener", chain_listener),
        ("processor", processor),
        ("sweeper", Arc::new(StoreSweeper::new(store.clone(), shutdown.clone()))),
    ];
    if cfg.forward_stats {
        tasks.push(("stats", Arc::new(StatsReporter::new(store, shutdown.clone()))));
    }
    run_until_interrupted(tasks, shutdown).await
}

/// Chain-disabled mode: only the job store (fed by the REST ingress) needs
/// maintenance.
async fn run_chainless(store: DataStore, forward_stats: bool, shutdown: Shutdown) -> Result<()> {
    let mut tasks: Vec<(&'static str, Arc<dyn AsyncTask>)> = vec![(
        "sweeper",
        Arc::new(StoreSweeper::new(store.clone(), shutdown.clone())),
    )];
    if forward_stats {
        tasks.push(("stats", Arc::new(StatsReporter::new(store, shutdown.clone()))));
    }
    run_until_interrupted(tasks, shutdown).await
}

/// Spawns the long-running tasks, wires SIGINT to the shared shutdown
/// flag, and propagates the first task failure as a non-zero exit.
async fn run_until_interrupted(
    tasks: Vec<(&'static str, Arc<dyn AsyncTask>)>,
    shutdown: Shutdown,
) -> Result<()> {
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; shutting down");
            signal_shutdown.stop();
        }
    });

    let mut handles = Vec::new();
    for (name, task) in &tasks {
        let task = task.clone();
        let shutdown = shutdown.clone();
        let name = *name;
        handles.push((
            name,
            tokio::spawn(async move {
                let result = task.run_forever().await;
                // Any task exiting, cleanly or not, takes the node down.
                shutdown.stop();
                if let Err(err) = &result {
                    tracing::error!(task = name, error = %err, "task exited with error");
                }
                result
            }),
        ));
    }

    let mut failure: Option<eyre::Report> = None;
    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                failure.get_or_insert(err);
            }
            Err(err) => {
                failure.get_or_insert_with(|| eyre!("task '{name}' panicked: {err}"));
            }
        }
    }

    for (name, task) in &tasks {
        if let Err(err) = task.cleanup().await {
            tracing::warn!(task = name, error = %err, "cleanup failed");
        }
    }

    match failure {
        None => {
            tracing::info!("shutdown complete");
            Ok(())
        }
        Some(err) => Err(err),
    }
}

/// `approve` subcommand: one-shot PaymentWallet approval.
async fn approve(args: ApproveArgs) -> Result<()> {
    let cfg = Config::load(&args.config)?;
    let (client, _, node_address) = connect(&cfg, args.rpc_url).await?;

    let wallet_addr = rpc::get_checksum_address(&args.wallet)?;
    let spender = rpc::get_checksum_address(&args.spender)?;
    let token = rpc::get_checksum_address(&args.token)?;
    let amount = U256::from_dec_str(&args.amount).map_err(|e| eyre!("invalid amount: {e}"))?;

    let node_wallet = NodeWallet::new(
        client.clone(),
        node_address,
        cfg.chain.wallet.payment_address,
        cfg.chain.wallet.max_gas_limit,
    );
    let tx = node_wallet.approve(wallet_addr, spender, token, amount).await?;

    let (found, success) =
        rpc::get_tx_success_with_retries(client.as_ref(), tx, 30, Duration::from_secs(2)).await;
    if !found {
        tracing::warn!(tx = ?tx, "approve tx not yet mined; check it manually");
    } else if !success {
        return Err(eyre!("approve tx {tx:?} reverted"));
    } else {
        tracing::info!(tx = ?tx, "approve confirmed");
    }
    Ok(())
}
