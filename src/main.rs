//! OBOL node
//!
//! Minimal node binary: opens the store, bootstraps genesis through the
//! ordinary ingest path, and mines blocks against the local mempool until
//! interrupted. Networking is left to the host embedding the library; this
//! binary logs the data requests the processor would send to peers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};

use obol_core::consensus::StateId;
use obol_core::crypto::Kdf;
use obol_core::mining::{PowResult, PowSolver};
use obol_core::node::{
    create_genesis, ChainProcessor, NodeConfig, NodeEvents, PeerId,
};
use obol_core::storage::StateStore;

/// The local miner feeds its own blocks back through the peer interface
const SELF: PeerId = PeerId(0);

struct NodeHost;

impl NodeEvents for NodeHost {
    fn request_data(&mut self, id: StateId, want_block: bool, preferred_peer: Option<PeerId>) {
        info!(%id, want_block, ?preferred_peer, "data wanted from the network");
    }

    fn on_peer_insane(&mut self, peer: PeerId) {
        warn!(%peer, "peer sent invalid data");
    }

    fn on_new_state(&mut self) {
        info!("tip advanced");
    }
}

fn load_config() -> NodeConfig {
    let Some(path) = std::env::args().nth(1) else {
        return NodeConfig::default();
    };
    match std::fs::read_to_string(&path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!(%path, error = %e, "config unreadable, using defaults");
                NodeConfig::default()
            }
        },
        Err(e) => {
            warn!(%path, error = %e, "config missing, using defaults");
            NodeConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = load_config();
    info!(db_path = %config.db_path, horizon = ?config.horizon, "starting node");

    let store = StateStore::open(&config.db_path)?;
    let processor = ChainProcessor::open(store, config.horizon, NodeHost)?;
    let processor = Arc::new(Mutex::new(processor));

    // Bootstrap: feed genesis through the ordinary ingest path
    {
        let (header, body) = create_genesis()?;
        let id = header.id();
        let mut proc = processor.lock().expect("processor lock poisoned");
        proc.on_state(&header, SELF)?;
        proc.on_block(&id, &body.encode()?, SELF)?;
        let tip = proc.tip_id()?;
        info!(?tip, "chain loaded");
    }

    let kdf = Kdf::random();
    let solver = PowSolver::new();

    // Mining task
    let mining_processor = Arc::clone(&processor);
    let mining_solver = solver.clone();
    let miner = tokio::spawn(async move {
        loop {
            let candidate = {
                let mut proc = mining_processor.lock().expect("processor lock poisoned");
                match proc.generate_block(&kdf) {
                    Ok(candidate) => candidate,
                    Err(e) => {
                        error!(error = %e, "block assembly failed");
                        break;
                    }
                }
            };

            let worker = mining_solver.clone();
            let header = candidate.header.clone();
            let solved = tokio::task::spawn_blocking(move || worker.solve(header)).await;

            match solved {
                Ok(PowResult::Solved(header)) => {
                    let id = header.id();
                    let mut proc = mining_processor.lock().expect("processor lock poisoned");
                    let result = proc.on_state(&header, SELF);
                    let result = result.and(proc.on_block(&id, &candidate.body, SELF));
                    match result {
                        Ok(_) => info!(%id, fees = candidate.fees, "mined"),
                        Err(e) => {
                            error!(error = %e, "mined block rejected by own node");
                            break;
                        }
                    }
                }
                Ok(PowResult::Interrupted) => break,
                Err(e) => {
                    error!(error = %e, "pow worker failed");
                    break;
                }
            }
        }
    });

    // Congestion tick: keep asking for whatever a better branch still needs
    let congestion_processor = Arc::clone(&processor);
    let congestions = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(10));
        loop {
            tick.tick().await;
            let mut proc = congestion_processor.lock().expect("processor lock poisoned");
            if let Err(e) = proc.enum_congestions() {
                error!(error = %e, "congestion walk failed");
                break;
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    solver.stop();
    congestions.abort();
    let _ = miner.await;

    Ok(())
}
