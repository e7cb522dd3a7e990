//! Blockswap - content-addressed block exchange engine
//!
//! Demo entrypoint: runs an in-process swarm over the virtual network,
//! seeds the first node with generated blocks and lets every other node
//! fetch them through the exchange protocol.

use std::error::Error;
use std::time::{Duration, Instant};

use blockswap_core::testnet::{spawn_nodes, BlockGenerator, VirtualNetwork};
use blockswap_core::{Config, EngineConfig};
use cid::Cid;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = Config::from_cli();
    init_logging(&config.log_level);

    tracing::info!(
        nodes = config.nodes,
        blocks = config.blocks,
        "starting blockswap demo swarm"
    );
    run_demo(config).await
}

async fn run_demo(config: Config) -> Result<(), Box<dyn Error>> {
    let net = VirtualNetwork::new(Duration::from_millis(config.delay_ms));
    let engine_config = EngineConfig {
        rebroadcast_interval: Duration::from_millis(500),
        ..EngineConfig::default()
    };
    let nodes = spawn_nodes(&net, &engine_config, config.nodes);

    let mut gen = BlockGenerator::new();
    let blocks: Vec<_> = (0..config.blocks)
        .map(|_| gen.sized(config.block_size))
        .collect();
    let keys: Vec<Cid> = blocks.iter().map(|b| b.cid).collect();

    let ctx = CancellationToken::new();
    let seed = &nodes[0];
    for block in &blocks {
        seed.swap.has_block(&ctx, block.clone()).await?;
    }
    tracing::info!(peer = %seed.peer, "seeded {} blocks", blocks.len());

    let started = Instant::now();
    let mut fetches = Vec::new();
    for node in &nodes[1..] {
        let swap = node.swap.clone();
        let keys = keys.clone();
        let ctx = ctx.clone();
        fetches.push(tokio::spawn(async move {
            let mut stream = swap.get_blocks(&ctx, &keys).await?;
            let mut got = 0usize;
            while stream.recv().await.is_some() {
                got += 1;
            }
            Ok::<usize, blockswap_core::SwapError>(got)
        }));
    }

    for fetch in fetches {
        let got = fetch.await??;
        if got != keys.len() {
            return Err(format!("fetched {got} of {} blocks", keys.len()).into());
        }
    }
    tracing::info!(elapsed = ?started.elapsed(), "distribution complete");

    for node in &nodes {
        let stat = node.swap.stat();
        tracing::info!(
            peer = %node.peer,
            received = stat.blocks_received,
            duplicates = stat.dup_blocks_received,
            sent = stat.blocks_sent,
            "node stats"
        );
        node.swap.close()?;
    }
    Ok(())
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
