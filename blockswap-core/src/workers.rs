//! Engine worker loops
//!
//! Five families of long-running tasks, all tied to the engine's root
//! cancellation token: task workers draining the decision engine's outbox,
//! the client batch worker, the periodic wantlist rebroadcast, the provide
//! collector and the provide workers.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use cid::Cid;
use libp2p_identity::PeerId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::exchange::{BatchRequest, BlockSwap};
use crate::message::BsMessage;
use crate::wantlist::MAX_PRIORITY;

/// Spawn every worker loop for `swap`.
pub(crate) fn start(
    swap: Arc<BlockSwap>,
    batch_rx: mpsc::Receiver<BatchRequest>,
    new_blocks_rx: mpsc::Receiver<Cid>,
) {
    for id in 0..swap.config.task_workers {
        tokio::spawn(task_worker(swap.clone(), id));
    }

    tokio::spawn(client_worker(swap.clone(), batch_rx));
    tokio::spawn(rebroadcast_worker(swap.clone()));

    let (provide_tx, provide_rx) = mpsc::channel(1);
    tokio::spawn(provide_collector(swap.clone(), new_blocks_rx, provide_tx));

    let provide_rx = Arc::new(tokio::sync::Mutex::new(provide_rx));
    for id in 0..swap.config.provide_workers {
        tokio::spawn(provide_worker(swap.clone(), provide_rx.clone(), id));
    }
}

/// Drain the decision engine's outbox into the dispatcher: take a handshake
/// channel, await its envelope, send, then signal completion so the peer's
/// in-flight slot frees up.
async fn task_worker(swap: Arc<BlockSwap>, id: usize) {
    let outbox = swap.engine.outbox();
    let token = swap.token.clone();

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = async { outbox.lock().await.recv().await } => next,
        };
        let Some(envelope_rx) = next else { break };

        let envelope = tokio::select! {
            _ = token.cancelled() => break,
            env = envelope_rx => match env {
                Ok(env) => env,
                Err(_) => continue,
            },
        };

        let (peer, message, done) = envelope.into_parts();
        swap.send(peer, message);
        done.complete();
    }
    debug!(worker = id, "task worker shutting down");
}

/// Priority for position `i` of a batch: the head gets `MAX_PRIORITY`, the
/// rest count down and saturate at zero.
fn batch_priority(i: usize) -> i32 {
    (MAX_PRIORITY as i64 - i as i64).max(0) as i32
}

/// Serve local batch requests: register the wants, tell connected peers,
/// then chase providers of the batch head (who most likely hold the rest).
async fn client_worker(swap: Arc<BlockSwap>, mut batch_rx: mpsc::Receiver<BatchRequest>) {
    let token = swap.token.clone();

    loop {
        let req = tokio::select! {
            _ = token.cancelled() => break,
            req = batch_rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };
        if req.keys.is_empty() {
            warn!("batch request with no keys");
            continue;
        }

        let mut msg = BsMessage::new(false);
        let mut wanted = Vec::new();
        for (i, key) in req.keys.iter().enumerate() {
            // Keys we already hold settle straight from the store
            if swap.store.has(key).await.unwrap_or(false) {
                if let Ok(block) = swap.store.get(key).await {
                    swap.notifications.publish(&block);
                    continue;
                }
            }
            let priority = batch_priority(i);
            swap.wantlist.add(*key, priority);
            msg.add_entry(*key, priority);
            wanted.push(*key);
        }
        if wanted.is_empty() {
            continue;
        }

        swap.pm.broadcast(msg);

        let providers = collect_providers(&swap, wanted[0], &req.ctx).await;
        swap.send_full_wantlist(providers);
    }
    debug!("client worker shutting down");
}

/// Periodically re-send the outstanding wantlist to providers of every
/// wanted key; recovers from lost messages and newly arrived providers.
async fn rebroadcast_worker(swap: Arc<BlockSwap>) {
    let token = swap.token.clone();
    let period = swap.config.rebroadcast_interval;
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tick.tick() => {}
        }

        let entries = swap.wantlist.entries();
        if entries.is_empty() {
            continue;
        }
        debug!(keys = entries.len(), "rebroadcasting wantlist");

        let lookups = entries
            .iter()
            .map(|e| collect_providers(&swap, e.key, &token));
        let results = futures_util::future::join_all(lookups).await;

        let mut providers: HashSet<PeerId> = HashSet::new();
        for found in results {
            providers.extend(found);
        }
        swap.send_full_wantlist(providers);
    }
    debug!("rebroadcast worker shutting down");
}

/// Collect up to `max_providers` peers for `key`, bounded by the provider
/// timeout and by `ctx`.
async fn collect_providers(
    swap: &BlockSwap,
    key: Cid,
    ctx: &CancellationToken,
) -> HashSet<PeerId> {
    let mut rx = swap.router.find_providers(key, swap.config.max_providers);
    let mut found = HashSet::new();

    let deadline = tokio::time::sleep(swap.config.provider_timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = &mut deadline => {
                debug!(cid = %key, "provider lookup timed out");
                break;
            }
            maybe = rx.recv() => match maybe {
                Some(peer) => { found.insert(peer); }
                None => break,
            },
        }
    }
    found
}

/// Forward newly stored keys into the provide channel through a single
/// offered slot, buffering internally during bursts so `has_block` callers
/// are never stalled by slow provide announcements.
async fn provide_collector(
    swap: Arc<BlockSwap>,
    mut new_blocks_rx: mpsc::Receiver<Cid>,
    provide_tx: mpsc::Sender<Cid>,
) {
    let token = swap.token.clone();
    let mut backlog: VecDeque<Cid> = VecDeque::new();
    let mut offered: Option<Cid> = None;

    loop {
        if let Some(key) = offered {
            tokio::select! {
                _ = token.cancelled() => break,
                maybe = new_blocks_rx.recv() => match maybe {
                    Some(next) => backlog.push_back(next),
                    None => break,
                },
                permit = provide_tx.reserve() => match permit {
                    Ok(permit) => {
                        permit.send(key);
                        offered = backlog.pop_front();
                    }
                    Err(_) => break,
                },
            }
        } else {
            tokio::select! {
                _ = token.cancelled() => break,
                maybe = new_blocks_rx.recv() => match maybe {
                    Some(next) => offered = Some(next),
                    None => break,
                },
            }
        }
    }
    debug!("provide collector shutting down");
}

/// Announce provided keys to the router, one timeout-bounded call at a time.
async fn provide_worker(
    swap: Arc<BlockSwap>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Cid>>>,
    id: usize,
) {
    let token = swap.token.clone();

    loop {
        let key = tokio::select! {
            _ = token.cancelled() => break,
            key = async { rx.lock().await.recv().await } => match key {
                Some(key) => key,
                None => break,
            },
        };

        match tokio::time::timeout(swap.config.provide_timeout, swap.router.provide(key)).await {
            Err(_) => warn!(cid = %key, worker = id, "provide timed out"),
            Ok(Err(err)) => warn!(cid = %key, error = %err, "provide failed"),
            Ok(Ok(())) => trace!(cid = %key, "provided"),
        }
    }
    debug!(worker = id, "provide worker shutting down");
}
