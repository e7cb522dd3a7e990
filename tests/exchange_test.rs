//! Integration tests for block exchange between in-process swarm nodes

use std::time::Duration;

use blockswap_core::testnet::{spawn_nodes, BlockGenerator, TestNode, VirtualNetwork};
use blockswap_core::{BlockStore, EngineConfig, Receiver, SwapError};
use cid::Cid;
use tokio_util::sync::CancellationToken;

const NETWORK_DELAY: Duration = Duration::ZERO;

fn test_config() -> EngineConfig {
    EngineConfig {
        // Fast rebroadcast so late announces are picked up within test time
        rebroadcast_interval: Duration::from_millis(200),
        provider_timeout: Duration::from_millis(500),
        ..EngineConfig::default()
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

#[tokio::test]
async fn test_get_block_from_peer_after_peer_announces() {
    init_logging();
    let net = VirtualNetwork::new(NETWORK_DELAY);
    let nodes = spawn_nodes(&net, &test_config(), 2);
    let block = blockswap_core::Block::new(b"block".to_vec()).unwrap();

    let ctx = CancellationToken::new();
    nodes[0]
        .swap
        .has_block(&ctx, block.clone())
        .await
        .expect("seed must accept the block");

    let fetch_ctx = CancellationToken::new();
    let received = tokio::time::timeout(
        Duration::from_secs(1),
        nodes[1].swap.get_block(&fetch_ctx, &block.cid),
    )
    .await
    .expect("fetch must finish within a second")
    .expect("fetch must succeed");

    assert_eq!(received.data, block.data);

    for node in &nodes {
        node.swap.close().unwrap();
    }
}

#[tokio::test]
async fn test_send_to_wanting_peer() {
    init_logging();
    let net = VirtualNetwork::new(NETWORK_DELAY);
    let nodes = spawn_nodes(&net, &test_config(), 2);
    let mut gen = BlockGenerator::new();
    let alpha = gen.next();

    // A asks first; nobody has the block yet
    let ctx = CancellationToken::new();
    let mut promise = nodes[0]
        .swap
        .get_blocks(&ctx, &[alpha.cid])
        .await
        .expect("subscription must register");

    tokio::time::sleep(Duration::from_millis(100)).await;

    // B announces it later; A's rebroadcast finds B via the provider table
    let announce_ctx = CancellationToken::new();
    nodes[1]
        .swap
        .has_block(&announce_ctx, alpha.clone())
        .await
        .expect("announce must succeed");

    let received = tokio::time::timeout(Duration::from_secs(5), promise.recv())
        .await
        .expect("block must arrive before the deadline")
        .expect("stream must yield the block");
    assert_eq!(received.cid, alpha.cid);

    // All keys delivered: the stream closes
    let end = tokio::time::timeout(Duration::from_secs(1), promise.recv())
        .await
        .expect("stream must close");
    assert!(end.is_none());

    for node in &nodes {
        node.swap.close().unwrap();
    }
}

async fn perform_distribution_test(num_instances: usize, num_blocks: usize) {
    init_logging();
    let net = VirtualNetwork::new(NETWORK_DELAY);
    let nodes = spawn_nodes(&net, &test_config(), num_instances);
    let mut gen = BlockGenerator::new();
    let blocks = gen.blocks(num_blocks);
    let keys: Vec<Cid> = blocks.iter().map(|b| b.cid).collect();

    let ctx = CancellationToken::new();
    for block in &blocks {
        nodes[0]
            .swap
            .has_block(&ctx, block.clone())
            .await
            .expect("seeding must succeed");
    }

    let mut fetches = Vec::new();
    for node in &nodes[1..] {
        let swap = node.swap.clone();
        let keys = keys.clone();
        let ctx = ctx.clone();
        fetches.push(tokio::spawn(async move {
            let mut stream = swap.get_blocks(&ctx, &keys).await?;
            while stream.recv().await.is_some() {}
            Ok::<(), SwapError>(())
        }));
    }

    for fetch in fetches {
        tokio::time::timeout(Duration::from_secs(60), fetch)
            .await
            .expect("distribution must finish in time")
            .expect("fetch task must not panic")
            .expect("fetch must succeed");
    }

    for node in &nodes {
        for key in &keys {
            assert!(
                node.store.has(key).await.unwrap(),
                "node {} is missing a block",
                node.peer
            );
        }
        node.swap.close().unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_swarm() {
    perform_distribution_test(50, 2).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_file() {
    perform_distribution_test(10, 100).await;
}

#[tokio::test]
async fn test_close_then_get_errors_promptly() {
    init_logging();
    let net = VirtualNetwork::new(NETWORK_DELAY);
    let nodes = spawn_nodes(&net, &test_config(), 1);
    let mut gen = BlockGenerator::new();
    let block = gen.next();

    nodes[0].swap.close().unwrap();
    nodes[0].swap.close().unwrap(); // close is idempotent

    let ctx = CancellationToken::new();
    let res = tokio::time::timeout(
        Duration::from_secs(1),
        nodes[0].swap.get_block(&ctx, &block.cid),
    )
    .await
    .expect("closed engine must answer promptly");
    assert!(matches!(res, Err(SwapError::Closed)));
}

#[tokio::test]
async fn test_cancellation_leaves_state_consistent() {
    init_logging();
    let net = VirtualNetwork::new(NETWORK_DELAY);
    let nodes = spawn_nodes(&net, &test_config(), 2);
    let mut gen = BlockGenerator::new();
    let wanted = gen.next();

    let ctx = CancellationToken::new();
    let mut stream = nodes[0]
        .swap
        .get_blocks(&ctx, &[wanted.cid])
        .await
        .expect("subscription must register");

    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.cancel();

    // The delivery stream closes within a bounded delay
    let end = tokio::time::timeout(Duration::from_secs(1), stream.recv())
        .await
        .expect("stream must close after cancellation");
    assert!(end.is_none());

    // Cancellation does not clear the wantlist; the key stays wanted
    assert_eq!(nodes[0].swap.get_wantlist(), vec![wanted.cid]);

    // A later announce still settles through the engine: the want is alive
    let announce_ctx = CancellationToken::new();
    nodes[1]
        .swap
        .has_block(&announce_ctx, wanted.clone())
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !nodes[0].store.has(&wanted.cid).await.unwrap() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "wanted block never arrived after cancellation"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for node in &nodes {
        node.swap.close().unwrap();
    }
}

#[tokio::test]
async fn test_wantlist_visible_to_serving_peer() {
    init_logging();
    let net = VirtualNetwork::new(NETWORK_DELAY);
    let nodes = spawn_nodes(&net, &test_config(), 2);
    let mut gen = BlockGenerator::new();
    let block = gen.next();

    let ctx = CancellationToken::new();
    let _stream = nodes[0]
        .swap
        .get_blocks(&ctx, &[block.cid])
        .await
        .unwrap();

    // The broadcast want shows up in the serving peer's ledger
    let asker = nodes[0].peer;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let wl = nodes[1].swap.wantlist_for_peer(&asker);
        if wl.contains(&block.cid) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "want never reached the peer ledger"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    for node in &nodes {
        node.swap.close().unwrap();
    }
}

#[tokio::test]
async fn test_duplicate_arrivals_counted_once_stored() {
    init_logging();
    let net = VirtualNetwork::new(NETWORK_DELAY);
    let nodes = spawn_nodes(&net, &test_config(), 3);
    let mut gen = BlockGenerator::new();
    let block = gen.next();

    // Two seeds hold the same block
    let ctx = CancellationToken::new();
    for seed in &nodes[..2] {
        seed.swap.has_block(&ctx, block.clone()).await.unwrap();
    }

    let fetch_ctx = CancellationToken::new();
    let received = tokio::time::timeout(
        Duration::from_secs(2),
        nodes[2].swap.get_block(&fetch_ctx, &block.cid),
    )
    .await
    .expect("fetch must finish")
    .expect("fetch must succeed");
    assert_eq!(received.cid, block.cid);

    assert!(nodes[2].store.has(&block.cid).await.unwrap());
    assert_eq!(nodes[2].store.len().await, 1);

    for node in &nodes {
        node.swap.close().unwrap();
    }
}

/// Helper for late-join scenarios: a node created after the swarm exists.
fn join_swarm(net: &VirtualNetwork, nodes: &[TestNode]) -> TestNode {
    let newcomers = spawn_nodes(net, &test_config(), 1);
    let newcomer = newcomers.into_iter().next().unwrap();
    for node in nodes {
        newcomer.swap.peer_connected(node.peer);
        node.swap.peer_connected(newcomer.peer);
    }
    newcomer
}

#[tokio::test]
async fn test_late_joiner_learns_outstanding_wants() {
    init_logging();
    let net = VirtualNetwork::new(NETWORK_DELAY);
    let nodes = spawn_nodes(&net, &test_config(), 1);
    let mut gen = BlockGenerator::new();
    let block = gen.next();

    let ctx = CancellationToken::new();
    let mut stream = nodes[0]
        .swap
        .get_blocks(&ctx, &[block.cid])
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    // The joining peer holds the block; connecting pushes the full wantlist
    // at it and the exchange settles without any provider lookup.
    let joiner = join_swarm(&net, &nodes);
    joiner.swap.has_block(&ctx, block.clone()).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("block must arrive")
        .expect("stream must yield it");
    assert_eq!(received.cid, block.cid);

    nodes[0].swap.close().unwrap();
    joiner.swap.close().unwrap();
}
