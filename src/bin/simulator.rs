//! Meridian Network Simulator
//!
//! A standalone binary that runs a committee of round kernels in one process,
//! connected by the in-process channel transport. It feeds deposit and mint
//! transactions through the signing pipeline, waits for every node to
//! finalize them, and then tries a few invalid submissions.
//!
//! Usage: cargo run --bin simulator -- --nodes 4 --transactions 20

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use colored::Colorize;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use meridian::config::{ConsensusConfig, MeridianConfig};
use meridian::consensus::{ConsensusNode, NodeId};
use meridian::crypto::keys::SigningKeypair;
use meridian::network::ChannelTransport;
use meridian::node::{Clock, KernelError, Node, SystemClock};
use meridian::storage::{Domain, RoundStore, SledStore};
use meridian::transaction::deposit::DepositData;
use meridian::transaction::mint::MintData;
use meridian::transaction::{SignedTransaction, Transaction};
use meridian::Hash;

type SimNode = Node<SledStore, ChannelTransport>;

/// In-process Meridian committee simulator.
#[derive(Parser, Debug)]
#[command(name = "simulator", version, about = "Run a Meridian committee in one process")]
struct Cli {
    /// Number of consensus nodes.
    #[arg(long, default_value_t = 4)]
    nodes: usize,

    /// Number of deposit transactions to finalize.
    #[arg(long, default_value_t = 20)]
    transactions: usize,

    /// Round gap in milliseconds. Ignored when a config file is loaded.
    #[arg(long, default_value_t = 500)]
    round_gap_ms: u64,

    /// Directory holding a `meridian.toml` with consensus parameters.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Seconds to wait for finalization before giving up.
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Log kernel activity at info level.
    #[arg(long)]
    verbose: bool,
}

/// Result of a single test scenario.
struct TestResult {
    name: String,
    passed: bool,
    detail: String,
}

impl TestResult {
    fn pass(name: &str, detail: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            detail: detail.to_string(),
        }
    }
    fn fail(name: &str, detail: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            detail: detail.to_string(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::INFO
        } else {
            tracing::Level::WARN
        })
        .init();

    println!(
        "\n{}",
        "========================================".bright_cyan()
    );
    println!("{}", "    MERIDIAN NETWORK SIMULATOR".bright_cyan().bold());
    println!(
        "{}\n",
        "========================================".bright_cyan()
    );

    let mut results: Vec<TestResult> = Vec::new();
    let shutdown = CancellationToken::new();
    let timeout = Duration::from_secs(cli.timeout_secs);

    // ── Phase 1: Bootstrap ──
    println!("{}", "[Phase 1] Bootstrapping committee...".yellow());

    let config = consensus_config(&cli);
    let domain = SigningKeypair::generate();
    let nodes = match bootstrap(cli.nodes, config, &domain, shutdown.clone()) {
        Ok(nodes) => {
            println!("  {} {} nodes started", "OK".green().bold(), nodes.len());
            results.push(TestResult::pass(
                "Committee Bootstrap",
                &format!("{} nodes online", nodes.len()),
            ));
            nodes
        }
        Err(e) => {
            println!("  {} {}", "FAIL".red().bold(), e);
            results.push(TestResult::fail("Committee Bootstrap", &e));
            print_summary(&results);
            std::process::exit(1);
        }
    };

    // ── Phase 2: Deposits ──
    println!(
        "\n{}",
        format!("[Phase 2] Submitting {} deposits...", cli.transactions).yellow()
    );

    let mut rng = rand::thread_rng();
    let mut submitted = Vec::new();
    for i in 0..cli.transactions {
        let author = rng.gen_range(0..nodes.len());
        let tx = deposit(&domain, i as u64, rng.gen());
        match nodes[author].submit_transaction(tx) {
            Ok(hash) => submitted.push(hash),
            Err(e) => println!("  {} deposit {}: {}", "WARN".yellow().bold(), i, e),
        }
        tokio::time::sleep(Duration::from_millis(rng.gen_range(5..50))).await;
    }
    results.push(check_count(
        "Deposit Submission",
        submitted.len(),
        cli.transactions,
    ));

    println!("  Waiting for transactions to finalize...");
    let started = Instant::now();
    let finalized = wait_for_finalization(&nodes, &submitted, timeout).await;
    if finalized {
        println!(
            "  {} finalized on every node in {:.2?}",
            "OK".green().bold(),
            started.elapsed()
        );
        results.push(TestResult::pass(
            "Deposit Finalization",
            &format!("{} deposits on {} nodes", submitted.len(), nodes.len()),
        ));
    } else {
        println!("  {} finalization timed out", "FAIL".red().bold());
        results.push(TestResult::fail(
            "Deposit Finalization",
            "not every node finalized every deposit",
        ));
    }

    // ── Phase 3: Mint ──
    println!("\n{}", "[Phase 3] Minting through node 0...".yellow());
    match nodes[0].submit_transaction(mint(1, 1_000)) {
        Ok(hash) => {
            if wait_for_finalization(&nodes, &[hash], timeout).await {
                println!("  {} mint batch 1 finalized", "OK".green().bold());
                results.push(TestResult::pass("Mint Finalization", "batch 1"));
            } else {
                results.push(TestResult::fail("Mint Finalization", "timed out"));
            }
        }
        Err(e) => results.push(TestResult::fail("Mint Finalization", &e.to_string())),
    }

    // ── Phase 4: Consistency ──
    println!("\n{}", "[Phase 4] Checking ledger consistency...".yellow());
    results.push(check_topology(&nodes));
    results.push(check_rounds(&nodes).await);

    // ── Phase 5: Invalid Submissions ──
    println!("\n{}", "[Phase 5] Submitting invalid transactions...".yellow());

    match nodes[1 % nodes.len()].submit_transaction(deposit(&domain, 0, [0xee; 32])) {
        Err(KernelError::Lock(_)) => {
            results.push(TestResult::pass("Double Deposit", "rejected by input lock"))
        }
        Err(e) => results.push(TestResult::fail("Double Deposit", &e.to_string())),
        Ok(_) => results.push(TestResult::fail("Double Deposit", "accepted")),
    }

    let impostor = SigningKeypair::generate();
    match nodes[0].submit_transaction(deposit(&impostor, u64::MAX, [0xee; 32])) {
        Err(KernelError::Rejected(e)) => {
            results.push(TestResult::pass("Unknown Domain Signature", &e.to_string()))
        }
        Err(e) => results.push(TestResult::fail("Unknown Domain Signature", &e.to_string())),
        Ok(_) => results.push(TestResult::fail("Unknown Domain Signature", "accepted")),
    }

    match nodes[0].submit_transaction(mint(1, 1_000)) {
        Err(KernelError::Rejected(e)) => {
            results.push(TestResult::pass("Replayed Mint Batch", &e.to_string()))
        }
        Err(e) => results.push(TestResult::fail("Replayed Mint Batch", &e.to_string())),
        Ok(_) => results.push(TestResult::fail("Replayed Mint Batch", "accepted")),
    }

    // ── Phase 6: Summary ──
    shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;
    print_summary(&results);

    let all_passed = results.iter().all(|r| r.passed);
    std::process::exit(if all_passed { 0 } else { 1 });
}

fn consensus_config(cli: &Cli) -> ConsensusConfig {
    let mut config = match &cli.config_dir {
        Some(dir) => MeridianConfig::load(dir).consensus,
        None => ConsensusConfig {
            snapshot_round_gap: cli.round_gap_ms * 1_000_000,
            timestamp_poll_interval_ms: 1,
            ..ConsensusConfig::default()
        },
    };
    if config.genesis_timestamp == 0 {
        config.genesis_timestamp = SystemClock.now();
    }
    config
}

// ── Phase 1: Bootstrap ──

fn bootstrap(
    n: usize,
    config: ConsensusConfig,
    domain: &SigningKeypair,
    shutdown: CancellationToken,
) -> Result<Vec<Arc<SimNode>>, String> {
    if n == 0 {
        return Err("committee needs at least one node".into());
    }
    let keypairs: Vec<SigningKeypair> = (0..n).map(|_| SigningKeypair::generate()).collect();
    let committee: Vec<ConsensusNode> = keypairs
        .iter()
        .map(|kp| ConsensusNode::new(kp.public.clone()))
        .collect();
    let ids: Vec<NodeId> = committee.iter().map(|c| c.id).collect();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let mut nodes = Vec::with_capacity(n);
    for (i, (kp, (transport, inbox))) in keypairs
        .into_iter()
        .zip(ChannelTransport::mesh(&ids))
        .enumerate()
    {
        let store = SledStore::open_temporary().map_err(|e| format!("node {} store: {}", i, e))?;
        store
            .put_domain(&Domain {
                public_spend_key: domain.public.clone(),
            })
            .map_err(|e| format!("node {} domain: {}", i, e))?;

        let (node, queue) = Node::new(
            kp,
            committee.clone(),
            config.clone(),
            Arc::new(store),
            transport,
            clock.clone(),
        )
        .map_err(|e| format!("node {} init: {}", i, e))?;
        let node = Arc::new(node);

        let runner = node.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.run(queue, token).await {
                tracing::error!(node = i, "Signer stopped: {}", e);
            }
        });
        let server = node.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(inbox, token).await {
                tracing::error!(node = i, "Message handler stopped: {}", e);
            }
        });
        nodes.push(node);
    }
    Ok(nodes)
}

// ── Transactions ──

fn deposit(domain: &SigningKeypair, output_index: u64, recipient: Hash) -> SignedTransaction {
    let data = DepositData {
        chain: meridian::constants::ethereum_chain_id(),
        asset_key: "0xdac17f958d2ee523a2206206994597c13d831ec7".into(),
        transaction_hash: format!("0x{}", "5a".repeat(32)),
        output_index,
        amount: 1_000 + output_index % 1_000,
    };
    let amount = data.amount;
    let mut tx = Transaction::new(data.asset_id());
    tx.add_deposit_input(data);
    tx.add_output(amount, recipient);
    let mut signed = SignedTransaction::new(tx);
    signed.sign_input(domain);
    signed
}

fn mint(batch: u64, amount: u64) -> SignedTransaction {
    let mut tx = Transaction::new(meridian::hash_domain("meridian.asset", b"XIN"));
    tx.add_mint_input(MintData {
        group: meridian::constants::MINT_GROUP_UNIVERSAL.into(),
        batch,
        amount,
    });
    tx.add_output(amount, [0u8; 32]);
    SignedTransaction::new(tx)
}

// ── Checks ──

async fn wait_for_finalization(nodes: &[Arc<SimNode>], txs: &[Hash], timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let done = nodes.iter().all(|node| {
            txs.iter().all(|tx| {
                node.store()
                    .check_transaction_finalization(tx)
                    .unwrap_or(false)
            })
        });
        if done {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

fn check_count(name: &str, got: usize, want: usize) -> TestResult {
    if got == want {
        TestResult::pass(name, &format!("{}/{} accepted", got, want))
    } else {
        TestResult::fail(name, &format!("{}/{} accepted", got, want))
    }
}

fn check_topology(nodes: &[Arc<SimNode>]) -> TestResult {
    let counts: Vec<u64> = nodes.iter().map(|n| n.topology()).collect();
    let stored: Vec<u64> = nodes
        .iter()
        .map(|n| n.store().topology_count().unwrap_or(0))
        .collect();
    if counts.windows(2).all(|w| w[0] == w[1]) && counts == stored {
        println!(
            "  {} every node ordered {} snapshots",
            "OK".green().bold(),
            counts[0]
        );
        TestResult::pass("Topological Order", &format!("{} snapshots", counts[0]))
    } else {
        println!("  {} order counts differ: {:?}", "FAIL".red().bold(), counts);
        TestResult::fail("Topological Order", &format!("counts {:?}", counts))
    }
}

async fn check_rounds(nodes: &[Arc<SimNode>]) -> TestResult {
    let mut highest = 0;
    for node in nodes {
        let round = node.cache_round().await;
        highest = highest.max(round.number);
        for other in nodes {
            let Some(known) = node.final_round(other.id()).await else {
                return TestResult::fail(
                    "Round Gossip",
                    &format!("{} unknown to a peer", meridian::short_hex(other.id())),
                );
            };
            let own = other.cache_round().await.number;
            if known.number >= own {
                return TestResult::fail(
                    "Round Gossip",
                    &format!("closed round {} not below open round {}", known.number, own),
                );
            }
        }
    }
    println!("  {} highest open round {}", "OK".green().bold(), highest);
    TestResult::pass("Round Gossip", &format!("highest open round {}", highest))
}

fn print_summary(results: &[TestResult]) {
    println!(
        "\n{}",
        "========================================".bright_cyan()
    );
    println!("{}", "          SIMULATION RESULTS".bright_cyan().bold());
    println!(
        "{}\n",
        "========================================".bright_cyan()
    );

    let passed = results.iter().filter(|r| r.passed).count();
    let failed = results.len() - passed;

    for r in results {
        let icon = if r.passed {
            "PASS".green().bold()
        } else {
            "FAIL".red().bold()
        };
        let detail = if r.passed {
            r.detail.dimmed().to_string()
        } else {
            r.detail.red().to_string()
        };
        println!("  [{}] {} - {}", icon, r.name, detail);
    }

    println!();
    if failed == 0 {
        println!(
            "  {} {}/{} checks passed",
            "ALL PASSED".green().bold(),
            passed,
            results.len()
        );
    } else {
        println!(
            "  {} {}/{} passed, {} failed",
            "SOME FAILED".red().bold(),
            passed,
            results.len(),
            failed
        );
    }
}
