use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::Rng;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use notary::notary::KeyDirectory;
use notary::{ClusterClient, CommitOutcome, CommitRequest, LocalCluster, NotaryConfig, SecureHash, StateRef};

const REQUESTER: &str = "O=Bank A, L=London, C=GB";

#[derive(Parser)]
#[command(name = "notary", about = "Replicated uniqueness provider")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Notarise a stream of generated transactions on an in-process cluster.
    Simulate(RunArgs),
    /// As `simulate`, killing the leader half way through.
    Failover(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of transactions to submit.
    #[arg(long, default_value_t = 100)]
    transactions: usize,

    /// Log filter, e.g. `notary=debug`. Overrides RUST_LOG.
    #[arg(long)]
    log: Option<String>,
}

#[derive(Default)]
struct Summary {
    notarised: usize,
    conflicts: usize,
    window_rejections: usize,
    failures: usize,
}

fn main() {
    let cli = Cli::parse();
    let (args, failover) = match &cli.command {
        Command::Simulate(args) => (args, false),
        Command::Failover(args) => (args, true),
    };

    init_tracing(args.log.as_deref());

    if let Err(e) = run(args, failover) {
        error!(error = %e, "run failed");
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn init_tracing(directive: Option<&str>) {
    let filter = match directive {
        Some(d) => EnvFilter::new(d),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("notary=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn run(args: &RunArgs, failover: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => NotaryConfig::load(path)?,
        None => NotaryConfig::default(),
    };

    let key = SigningKey::generate(&mut OsRng);
    let mut keys = KeyDirectory::new();
    keys.register(REQUESTER, key.verifying_key());

    let cluster = LocalCluster::start(&config, Arc::new(keys))?;
    let settle = config.cluster.election_timeout() * 5;
    let leader = cluster.wait_for_leader(settle).ok_or("no leader elected")?;
    info!(leader, members = cluster.size(), "cluster ready");

    let mut client = ClusterClient::new(&cluster, &config.client);
    let mut summary = Summary::default();
    let mut unspent: Vec<StateRef> = Vec::new();
    let mut spent: Vec<StateRef> = Vec::new();
    let mut rng = rand::thread_rng();
    let kill_at = args.transactions / 2;
    let started = Instant::now();

    for n in 0..args.transactions {
        if failover && n == kill_at {
            if let Some(leader) = cluster.leader() {
                warn!(leader, "killing leader");
                cluster.kill(leader);
            }
        }

        let tx_id = SecureHash::random();
        // Every fifth transaction tries to spend an output that is already gone.
        let double_spend = n % 5 == 4 && !spent.is_empty();
        let inputs = if double_spend {
            vec![spent[rng.gen_range(0..spent.len())]]
        } else if unspent.is_empty() {
            Vec::new()
        } else {
            let take = rng.gen_range(1..=unspent.len().min(3));
            unspent.drain(..take).collect()
        };

        let request = CommitRequest::new(inputs.clone(), tx_id, REQUESTER).signed(&key);
        match client.commit(&request) {
            Ok(CommitOutcome::Success) => {
                summary.notarised += 1;
                spent.extend(inputs);
                unspent.extend((0..2).map(|i| StateRef::new(tx_id, i)));
            }
            Ok(CommitOutcome::Conflict(conflicts)) => {
                summary.conflicts += 1;
                for (state, consumed) in &conflicts {
                    info!(
                        tx_id = %tx_id.short(),
                        %state,
                        held_by = %consumed.record.consuming_tx_id.short(),
                        "double spend rejected"
                    );
                }
            }
            Ok(CommitOutcome::TimeWindowInvalid { .. }) => summary.window_rejections += 1,
            Err(e) => {
                summary.failures += 1;
                warn!(tx_id = %tx_id.short(), error = %e, "commit failed");
                if !double_spend {
                    unspent.extend(inputs);
                }
            }
        }
    }

    if !cluster.wait_for_sync(settle) {
        warn!("replicas did not converge before the deadline");
    }

    println!("transactions:  {}", args.transactions);
    println!("notarised:     {}", summary.notarised);
    println!("double spends: {}", summary.conflicts);
    println!("window errors: {}", summary.window_rejections);
    println!("failed:        {}", summary.failures);
    println!("leader:        {:?}", client.last_known_leader());
    println!("elapsed:       {:?}", started.elapsed());
    for id in 0..cluster.size() {
        if let Some(replica) = cluster.replica(id) {
            let status = if cluster.is_alive(id) { "up" } else { "down" };
            println!(
                "replica {}: {:>4} states consumed, {:>4} requests logged ({})",
                id,
                replica.store().len(),
                replica.store().request_log().len(),
                status
            );
        }
    }
    Ok(())
}
