use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use accord_consensus::{ConsensusState, HashChainExecutor};
use accord_crypto::KeyPair;
use accord_peer::{PeerConfig, PeerServer, PeerSnapshot, StoreConfig};
use accord_store::{Cell, Transaction};
use anyhow::{bail, Context};
use colored::Colorize;
use serde_json::json;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Keygen(args) => cmd_keygen(args, cli.format),
        Command::Config(args) => cmd_config(args),
        Command::Simulate(args) => {
            let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
            runtime.block_on(cmd_simulate(args, cli.format))
        }
    }
}

fn cmd_keygen(args: KeygenArgs, format: OutputFormat) -> anyhow::Result<()> {
    let key_pair = match args.seed {
        Some(seed) => {
            let bytes = hex::decode(&seed).context("seed is not hex")?;
            let seed: [u8; 32] = bytes
                .try_into()
                .map_err(|b: Vec<u8>| anyhow::anyhow!("seed must be 32 bytes, got {}", b.len()))?;
            KeyPair::from_seed(seed)
        }
        None => KeyPair::generate(),
    };
    let key = key_pair.account_key();
    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "account_key": key.to_hex(), "seed": hex::encode(key_pair.seed()) })
        ),
        OutputFormat::Text => {
            println!("{} {}", "Account key:".bold(), key.to_hex().cyan());
            println!("{} {}", "Seed:".bold(), hex::encode(key_pair.seed()).dimmed());
        }
    }
    Ok(())
}

fn cmd_config(args: ConfigArgs) -> anyhow::Result<()> {
    match args.path {
        Some(path) => {
            let config = PeerConfig::load(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            println!("{} {} is valid", "✓".green().bold(), path.display());
            print!("{}", config.to_toml()?);
        }
        None => print!("{}", PeerConfig::default().to_toml()?),
    }
    Ok(())
}

async fn cmd_simulate(args: SimulateArgs, format: OutputFormat) -> anyhow::Result<()> {
    if args.peers == 0 {
        bail!("at least one peer is needed");
    }
    let config = match &args.config {
        Some(path) => PeerConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => PeerConfig::default(),
    };

    let key_pairs: Vec<KeyPair> = (0..args.peers).map(|_| KeyPair::generate()).collect();
    let genesis = ConsensusState::genesis(key_pairs.iter().map(|kp| (kp.account_key(), args.stake)));

    let mut peers = Vec::with_capacity(args.peers);
    for (i, key_pair) in key_pairs.into_iter().enumerate() {
        let peer_config = PeerConfig {
            store: store_for_peer(&config.store, i),
            ..config.clone()
        };
        let peer = PeerServer::launch(key_pair, genesis.clone(), Arc::new(HashChainExecutor), peer_config)
            .with_context(|| format!("launching peer {i}"))?;
        peers.push(peer);
    }
    for (i, a) in peers.iter().enumerate() {
        for b in &peers[i + 1..] {
            a.connect(b);
        }
    }
    tracing::info!(peers = peers.len(), transactions = args.transactions, "simulation started");

    let started = Instant::now();
    for n in 0..args.transactions {
        let peer = &peers[n % peers.len()];
        let tx = Transaction::new(*peer.key(), n as u64, Cell::Long(n as i64));
        peer.submit_transaction(tx)?;
    }

    let deadline = started + Duration::from_secs(args.timeout);
    let snapshots = loop {
        let snapshots: Vec<Arc<PeerSnapshot>> = peers.iter().map(|p| p.snapshot()).collect();
        let drained = peers.iter().all(|p| p.pending_transactions() == 0);
        if drained && settled(&snapshots, args.transactions > 0) {
            break Ok(snapshots);
        }
        if Instant::now() > deadline {
            break Err(snapshots);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    let elapsed = started.elapsed();

    let (snapshots, converged) = match snapshots {
        Ok(s) => (s, true),
        Err(s) => (s, false),
    };
    report(&peers, &snapshots, converged, elapsed, format);

    for peer in peers {
        peer.shutdown().await?;
    }
    if !converged {
        bail!("peers did not converge within {}s", args.timeout);
    }
    Ok(())
}

/// Every peer has finalized its whole order, and all agree on its length.
fn settled(snapshots: &[Arc<PeerSnapshot>], expect_blocks: bool) -> bool {
    let cp = snapshots[0].consensus_point;
    (cp > 0 || !expect_blocks)
        && snapshots
            .iter()
            .all(|s| s.consensus_point == cp && s.order_length == cp && s.executed == cp)
}

fn store_for_peer(store: &StoreConfig, index: usize) -> StoreConfig {
    match store {
        StoreConfig::Memory => StoreConfig::Memory,
        StoreConfig::File { path } => StoreConfig::File {
            path: PathBuf::from(format!("{}.{index}", path.display())),
        },
    }
}

fn report(
    peers: &[PeerServer],
    snapshots: &[Arc<PeerSnapshot>],
    converged: bool,
    elapsed: Duration,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => {
            let rows: Vec<serde_json::Value> = peers
                .iter()
                .zip(snapshots)
                .map(|(peer, s)| {
                    json!({
                        "peer": s.key.to_hex(),
                        "consensus_point": s.consensus_point,
                        "proposal_point": s.proposal_point,
                        "order_length": s.order_length,
                        "executed": s.executed,
                        "state_hash": s.state_hash.to_hex(),
                        "beliefs_received": s.beliefs_received,
                        "broadcasts_sent": s.broadcasts_sent,
                        "missing_requests": peer.stats().missing_requests(),
                    })
                })
                .collect();
            println!(
                "{}",
                json!({
                    "converged": converged,
                    "elapsed_ms": elapsed.as_millis() as u64,
                    "peers": rows,
                })
            );
        }
        OutputFormat::Text => {
            let verdict = if converged {
                format!("{} Converged", "✓".green().bold())
            } else {
                format!("{} Did not converge", "✗".red().bold())
            };
            println!("{verdict} in {:.2}s", elapsed.as_secs_f64());
            for s in snapshots {
                println!(
                    "  {}  consensus {:>5}  proposal {:>5}  length {:>5}  state {}",
                    s.key.short_id().cyan(),
                    s.consensus_point.to_string().bold(),
                    s.proposal_point,
                    s.order_length,
                    s.state_hash.short_hex().dimmed(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_stores_are_split_per_peer() {
        let store = StoreConfig::File {
            path: PathBuf::from("/tmp/cells.log"),
        };
        assert_eq!(
            store_for_peer(&store, 2),
            StoreConfig::File {
                path: PathBuf::from("/tmp/cells.log.2")
            }
        );
        assert_eq!(store_for_peer(&StoreConfig::Memory, 2), StoreConfig::Memory);
    }

    #[test]
    fn keygen_from_seed() {
        let args = KeygenArgs {
            seed: Some(hex::encode([7u8; 32])),
        };
        cmd_keygen(args, OutputFormat::Json).unwrap();
        let bad = KeygenArgs {
            seed: Some("abcd".into()),
        };
        assert!(cmd_keygen(bad, OutputFormat::Text).is_err());
    }

    #[test]
    fn simulate_small_network() {
        let args = SimulateArgs {
            peers: 3,
            transactions: 12,
            stake: 10,
            config: None,
            timeout: 30,
        };
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(cmd_simulate(args, OutputFormat::Json)).unwrap();
    }

    #[test]
    fn simulate_needs_peers() {
        let args = SimulateArgs {
            peers: 0,
            transactions: 1,
            stake: 1,
            config: None,
            timeout: 1,
        };
        let runtime = tokio::runtime::Runtime::new().unwrap();
        assert!(runtime.block_on(cmd_simulate(args, OutputFormat::Text)).is_err());
    }
}
