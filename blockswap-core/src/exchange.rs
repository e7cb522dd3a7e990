//! The exchange engine
//!
//! `BlockSwap` glues the pieces together: the local wantlist, the decision
//! engine serving peers, the outbound dispatcher, the notification registry
//! and the control loops in [`crate::workers`]. It is also the delegate the
//! transport feeds with inbound messages and peer events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use libp2p_identity::PeerId;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::block::Block;
use crate::blockstore::{BlockStore, StorageError};
use crate::config::EngineConfig;
use crate::decision::{Engine, LedgerSnapshot};
use crate::message::BsMessage;
use crate::metrics::{Metrics, Stat};
use crate::network::{Network, NetworkError, Receiver, Router};
use crate::notifications::Notifications;
use crate::peermanager::PeerManager;
use crate::taskqueue;
use crate::wantlist::ThreadSafeWantlist;
use crate::workers;

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("exchange is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("store failure: {0}")]
    Store(#[from] StorageError),
}

/// A batch of keys some local caller wants fetched.
pub(crate) struct BatchRequest {
    pub keys: Vec<Cid>,
    pub ctx: CancellationToken,
}

pub struct BlockSwap {
    self_id: PeerId,
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn BlockStore>,
    pub(crate) router: Arc<dyn Router>,
    pub(crate) pm: PeerManager,
    pub(crate) engine: Arc<Engine>,
    pub(crate) wantlist: Arc<ThreadSafeWantlist>,
    pub(crate) notifications: Arc<Notifications>,
    batch_tx: mpsc::Sender<BatchRequest>,
    new_blocks_tx: mpsc::Sender<Cid>,
    pub(crate) metrics: Metrics,
    pub(crate) token: CancellationToken,
    closed: AtomicBool,
}

impl BlockSwap {
    /// Build the engine, register it as the transport delegate and start its
    /// worker loops. Runs until [`BlockSwap::close`] is called.
    pub fn new(
        self_id: PeerId,
        config: EngineConfig,
        store: Arc<dyn BlockStore>,
        network: Arc<dyn Network>,
        router: Arc<dyn Router>,
    ) -> Arc<Self> {
        let token = CancellationToken::new();
        let engine = Engine::new(store.clone(), taskqueue::v1, token.child_token());
        let pm = PeerManager::new(network.clone(), token.child_token());
        let (batch_tx, batch_rx) = mpsc::channel(config.batch_buffer);
        let (new_blocks_tx, new_blocks_rx) = mpsc::channel(config.new_blocks_buffer);

        let swap = Arc::new(Self {
            self_id,
            config,
            store,
            router,
            pm,
            engine,
            wantlist: Arc::new(ThreadSafeWantlist::new()),
            notifications: Arc::new(Notifications::new()),
            batch_tx,
            new_blocks_tx,
            metrics: Metrics::new(),
            token,
            closed: AtomicBool::new(false),
        });

        network.set_delegate(swap.clone());
        workers::start(swap.clone(), batch_rx, new_blocks_rx);
        swap
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Fetch a single block, waiting until it arrives from some peer or
    /// `ctx` is cancelled.
    pub async fn get_block(&self, ctx: &CancellationToken, key: &Cid) -> Result<Block, SwapError> {
        let mut blocks = self.get_blocks(ctx, std::slice::from_ref(key)).await?;
        tokio::select! {
            maybe = blocks.recv() => match maybe {
                Some(block) => Ok(block),
                // The stream closed under us: either the caller's context
                // ended or the engine shut down.
                None if ctx.is_cancelled() => Err(SwapError::Cancelled),
                None => Err(SwapError::Closed),
            },
            _ = ctx.cancelled() => Err(SwapError::Cancelled),
        }
    }

    /// Register waiters for `keys` and enqueue a batch fetch. The returned
    /// stream yields blocks as they arrive and ends when all keys have been
    /// delivered or `ctx` is cancelled. The keys stay wanted until they
    /// arrive, even if the caller gives up early.
    pub async fn get_blocks(
        &self,
        ctx: &CancellationToken,
        keys: &[Cid],
    ) -> Result<mpsc::Receiver<Block>, SwapError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SwapError::Closed);
        }

        let (sub, rx) = self.notifications.subscribe(keys);
        if keys.is_empty() {
            return Ok(rx);
        }

        {
            // Release the waiter when the caller's context or the engine ends.
            let notifications = self.notifications.clone();
            let ctx = ctx.clone();
            let engine_token = self.token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = ctx.cancelled() => {}
                    _ = engine_token.cancelled() => {}
                }
                notifications.unsubscribe(sub);
            });
        }

        let request = BatchRequest {
            keys: keys.to_vec(),
            ctx: ctx.clone(),
        };
        tokio::select! {
            res = self.batch_tx.send(request) => {
                if res.is_err() {
                    self.notifications.unsubscribe(sub);
                    return Err(SwapError::Closed);
                }
            }
            _ = ctx.cancelled() => {
                self.notifications.unsubscribe(sub);
                return Err(SwapError::Cancelled);
            }
        }

        Ok(rx)
    }

    /// Announce a block that became available locally: store it, settle any
    /// local waiters, schedule sends to peers that asked for it and queue a
    /// provide announcement.
    pub async fn has_block(&self, ctx: &CancellationToken, block: Block) -> Result<(), SwapError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SwapError::Closed);
        }

        let key = block.cid;
        match tokio::time::timeout(self.config.has_block_timeout, self.store.put(block.clone()))
            .await
        {
            Ok(res) => res?,
            Err(_) => return Err(SwapError::Store(StorageError::Timeout)),
        }

        self.wantlist.remove(&key);
        self.engine.block_arrived(&key);
        self.notifications.publish(&block);

        tokio::select! {
            res = self.new_blocks_tx.send(key) => {
                if res.is_err() {
                    return Err(SwapError::Closed);
                }
            }
            _ = ctx.cancelled() => return Err(SwapError::Cancelled),
        }
        Ok(())
    }

    /// Snapshot of what `peer` has asked us for.
    pub fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<Cid> {
        self.engine
            .wantlist_for_peer(peer)
            .into_iter()
            .map(|e| e.key)
            .collect()
    }

    /// Snapshot of the keys this node currently wants.
    pub fn get_wantlist(&self) -> Vec<Cid> {
        self.wantlist.entries().into_iter().map(|e| e.key).collect()
    }

    /// Per-peer transfer accounting, if the peer is known.
    pub fn ledger_snapshot(&self, peer: &PeerId) -> Option<LedgerSnapshot> {
        self.engine.ledger_snapshot(peer)
    }

    /// Engine-wide transfer counters.
    pub fn stat(&self) -> Stat {
        self.metrics.snapshot(self.get_wantlist())
    }

    /// Idempotent shutdown: cancels every worker and closes all outstanding
    /// block streams. In-flight network sends may still complete.
    pub fn close(&self) -> Result<(), SwapError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(peer = %self.self_id, "closing exchange");
            self.token.cancel();
            self.notifications.shutdown();
        }
        Ok(())
    }

    /// Send a message through the dispatcher, keeping ledger accounting in
    /// step with what goes out.
    pub(crate) fn send(&self, to: PeerId, msg: BsMessage) {
        self.engine.message_sent(to, &msg);
        for block in msg.blocks() {
            self.metrics.block_sent(block.size());
        }
        self.pm.send(to, msg);
    }

    /// Send the full local wantlist to each of `peers` (deduplicated).
    /// Nothing is sent while the wantlist is empty.
    pub(crate) fn send_full_wantlist<I>(&self, peers: I)
    where
        I: IntoIterator<Item = PeerId>,
    {
        let entries = self.wantlist.entries();
        if entries.is_empty() {
            return;
        }
        let mut msg = BsMessage::new(true);
        for e in entries {
            msg.add_entry(e.key, e.priority);
        }

        let mut seen = std::collections::HashSet::new();
        for peer in peers {
            if seen.insert(peer) {
                self.send(peer, msg.clone());
            }
        }
    }

    /// Tell every peer we no longer want `keys`; their send queues drop any
    /// still-pending payloads for them.
    fn cancel_blocks(&self, keys: &[Cid]) {
        if keys.is_empty() {
            return;
        }
        let mut msg = BsMessage::new(false);
        for key in keys {
            msg.cancel(*key);
        }
        self.pm.broadcast(msg);
    }
}

#[async_trait]
impl Receiver for BlockSwap {
    async fn receive_message(&self, from: PeerId, msg: BsMessage) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        self.engine.message_received(from, &msg).await;

        for (key, e) in msg.entries() {
            if e.cancel {
                self.pm.cancel_block(from, *key);
            }
        }

        let mut received = Vec::new();
        for block in msg.blocks() {
            self.metrics.block_received(block.size());
            if self.store.has(&block.cid).await.unwrap_or(false) {
                self.metrics.duplicate_received();
            }
            debug!(cid = %block.cid, peer = %from, "got block");

            let ctx = self.token.child_token();
            if let Err(err) = self.has_block(&ctx, block.clone()).await {
                warn!(cid = %block.cid, error = %err, "dropping inbound message, ingest failed");
                return;
            }
            received.push(block.cid);
        }

        self.cancel_blocks(&received);
    }

    fn receive_error(&self, err: NetworkError) {
        debug!(error = %err, "network error");
    }

    fn peer_connected(&self, peer: PeerId) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.pm.connected(peer);
        self.send_full_wantlist(std::iter::once(peer));
    }

    fn peer_disconnected(&self, peer: PeerId) {
        self.pm.disconnected(peer);
        self.engine.peer_disconnected(&peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::MemoryBlockStore;
    use std::time::Duration;

    /// Transport and router stubs that drop everything.
    struct NullNetwork;

    #[async_trait]
    impl Network for NullNetwork {
        async fn send_message(&self, _to: PeerId, _msg: BsMessage) -> Result<(), NetworkError> {
            Ok(())
        }
        async fn connect_to(&self, _peer: PeerId) -> Result<(), NetworkError> {
            Ok(())
        }
        fn set_delegate(&self, _delegate: Arc<dyn Receiver>) {}
    }

    struct NullRouter;

    #[async_trait]
    impl Router for NullRouter {
        fn find_providers(&self, _key: Cid, _max: usize) -> mpsc::Receiver<PeerId> {
            let (_tx, rx) = mpsc::channel(1);
            rx
        }
        async fn provide(&self, _key: Cid) -> Result<(), NetworkError> {
            Ok(())
        }
    }

    fn standalone_swap() -> Arc<BlockSwap> {
        BlockSwap::new(
            PeerId::random(),
            EngineConfig::default(),
            Arc::new(MemoryBlockStore::new()),
            Arc::new(NullNetwork),
            Arc::new(NullRouter),
        )
    }

    #[tokio::test]
    async fn test_get_block_after_close_errors() {
        let swap = standalone_swap();
        swap.close().unwrap();
        swap.close().unwrap(); // idempotent

        let ctx = CancellationToken::new();
        let key = crate::block::content_cid(b"x").unwrap();
        let res = tokio::time::timeout(Duration::from_secs(1), swap.get_block(&ctx, &key)).await;
        assert!(matches!(res, Ok(Err(SwapError::Closed))));
    }

    #[tokio::test]
    async fn test_get_blocks_zero_keys() {
        let swap = standalone_swap();
        let ctx = CancellationToken::new();

        let mut rx = swap.get_blocks(&ctx, &[]).await.unwrap();
        assert!(rx.recv().await.is_none());
        assert!(swap.get_wantlist().is_empty());
        swap.close().unwrap();
    }

    #[tokio::test]
    async fn test_has_block_then_get_block_is_local() {
        let swap = standalone_swap();
        let ctx = CancellationToken::new();
        let block = Block::new(b"local".to_vec()).unwrap();

        swap.has_block(&ctx, block.clone()).await.unwrap();

        // An already-stored key settles from the local store, no peers needed
        let fetched = tokio::time::timeout(
            Duration::from_secs(1),
            swap.get_block(&ctx, &block.cid),
        )
        .await
        .expect("local fetch must not hang")
        .unwrap();
        assert_eq!(fetched, block);
        assert!(swap.get_wantlist().is_empty());
        swap.close().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_get_block() {
        let swap = standalone_swap();
        let ctx = CancellationToken::new();
        let key = crate::block::content_cid(b"never-arrives").unwrap();

        let swap2 = swap.clone();
        let ctx2 = ctx.clone();
        let fetch = tokio::spawn(async move { swap2.get_block(&ctx2, &key).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.cancel();

        let res = tokio::time::timeout(Duration::from_secs(1), fetch)
            .await
            .expect("cancellation must unblock the caller")
            .unwrap();
        assert!(matches!(res, Err(SwapError::Cancelled)));

        // cancellation does not clear the wantlist
        assert_eq!(swap.get_wantlist(), vec![key]);
        swap.close().unwrap();
    }

    #[tokio::test]
    async fn test_batch_head_ranks_highest() {
        let swap = standalone_swap();
        let ctx = CancellationToken::new();
        let keys: Vec<Cid> = (0..4u8)
            .map(|n| crate::block::content_cid(&[n]).unwrap())
            .collect();

        let _rx = swap.get_blocks(&ctx, &keys).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // head of the batch carries the highest priority
        let wl = swap.get_wantlist();
        assert_eq!(wl.len(), 4);
        assert_eq!(wl[0], keys[0]);
        swap.close().unwrap();
    }
}
