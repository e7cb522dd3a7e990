//! Outbound dispatcher
//!
//! One coalescing send queue per connected peer, each pumped by its own
//! worker. Repeated wantlist updates merge into a single pending message and
//! repeated payloads overwrite by key, so a slow peer never grows unbounded
//! state on the sender and redundant updates are compressed before the wire.
//!
//! The dispatcher itself is an actor: a command channel drained by one run
//! loop that owns the peer map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cid::Cid;
use libp2p_identity::PeerId;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::block::Block;
use crate::message::BsMessage;
use crate::network::Network;

/// Pause before re-waking a queue whose transport connection failed.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);

enum Command {
    Send { to: PeerId, msg: BsMessage },
    Broadcast(BsMessage),
    Connected(PeerId),
    Disconnected(PeerId),
    CancelBlock { peer: PeerId, key: Cid },
}

/// Handle to the dispatcher actor. Cheap to clone; all operations are
/// fire-and-forget enqueues processed by the run loop.
#[derive(Clone)]
pub struct PeerManager {
    tx: mpsc::UnboundedSender<Command>,
}

impl PeerManager {
    /// Spawn the dispatcher. It runs until `token` is cancelled.
    pub fn new(network: Arc<dyn Network>, token: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(network, rx, token));
        Self { tx }
    }

    /// Enqueue a message for one peer, creating its queue on demand.
    pub fn send(&self, to: PeerId, msg: BsMessage) {
        let _ = self.tx.send(Command::Send { to, msg });
    }

    /// Enqueue a message onto every known peer's queue.
    pub fn broadcast(&self, msg: BsMessage) {
        let _ = self.tx.send(Command::Broadcast(msg));
    }

    pub fn connected(&self, peer: PeerId) {
        let _ = self.tx.send(Command::Connected(peer));
    }

    pub fn disconnected(&self, peer: PeerId) {
        let _ = self.tx.send(Command::Disconnected(peer));
    }

    /// Drop a not-yet-sent payload for `(peer, key)`. Already-sent blocks
    /// are uncancellable; an unknown peer is a no-op.
    pub fn cancel_block(&self, peer: PeerId, key: Cid) {
        let _ = self.tx.send(Command::CancelBlock { peer, key });
    }
}

async fn run(
    network: Arc<dyn Network>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    token: CancellationToken,
) {
    let mut peers: HashMap<PeerId, MsgQueue> = HashMap::new();

    loop {
        let cmd = tokio::select! {
            _ = token.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };

        match cmd {
            Command::Send { to, msg } => {
                let queue = peers.entry(to).or_insert_with(|| {
                    debug!(peer = %to, "send to peer with no live queue, creating one");
                    MsgQueue::start(to, network.clone(), token.child_token())
                });
                queue.add_message(msg);
            }
            Command::Broadcast(msg) => {
                for queue in peers.values() {
                    queue.add_message(msg.clone());
                }
            }
            Command::Connected(peer) => {
                peers
                    .entry(peer)
                    .or_insert_with(|| MsgQueue::start(peer, network.clone(), token.child_token()));
            }
            Command::Disconnected(peer) => {
                if let Some(queue) = peers.remove(&peer) {
                    queue.stop();
                }
            }
            Command::CancelBlock { peer, key } => {
                if let Some(queue) = peers.get(&peer) {
                    queue.cancel_block(&key);
                }
            }
        }
    }

    for queue in peers.values() {
        queue.stop();
    }
    debug!("peer manager shutting down");
}

/// One peer's coalescing send queue.
struct MsgQueue {
    pending: Arc<Mutex<PendingWork>>,
    work: Arc<Notify>,
    token: CancellationToken,
}

#[derive(Default)]
struct PendingWork {
    wantlist: Option<BsMessage>,
    blocks: HashMap<Cid, Block>,
}

impl MsgQueue {
    fn start(peer: PeerId, network: Arc<dyn Network>, token: CancellationToken) -> Self {
        let queue = Self {
            pending: Arc::new(Mutex::new(PendingWork::default())),
            work: Arc::new(Notify::new()),
            token: token.clone(),
        };
        tokio::spawn(run_queue(
            peer,
            network,
            queue.pending.clone(),
            queue.work.clone(),
            token,
        ));
        queue
    }

    /// Merge `msg` into the pending state and wake the worker. The wake is
    /// edge-triggered: any number of merges during one send cycle cost at
    /// most one extra wake.
    fn add_message(&self, mut msg: BsMessage) {
        {
            let mut pending = self.pending.lock().unwrap();

            for block in msg.take_blocks() {
                pending.blocks.insert(block.cid, block);
            }

            if pending.wantlist.is_none() || msg.full() {
                pending.wantlist = Some(msg);
            } else if let Some(wl) = pending.wantlist.as_mut() {
                for (key, e) in msg.entries() {
                    if e.cancel {
                        wl.cancel(*key);
                    } else {
                        wl.add_entry(*key, e.priority);
                    }
                }
            }
        }
        self.work.notify_one();
    }

    fn cancel_block(&self, key: &Cid) {
        self.pending.lock().unwrap().blocks.remove(key);
    }

    fn stop(&self) {
        self.token.cancel();
    }
}

async fn run_queue(
    peer: PeerId,
    network: Arc<dyn Network>,
    pending: Arc<Mutex<PendingWork>>,
    work: Arc<Notify>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = work.notified() => {}
        }

        // Nothing is taken off the queue until the connection is up, so a
        // failed dial loses nothing; we retry on the next wake.
        if let Err(err) = network.connect_to(peer).await {
            debug!(peer = %peer, error = %err, "connect failed, will retry");
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(CONNECT_RETRY_DELAY) => {}
            }
            work.notify_one();
            continue;
        }

        let (wantlist, blocks) = {
            let mut pending = pending.lock().unwrap();
            (pending.wantlist.take(), std::mem::take(&mut pending.blocks))
        };

        if let Some(msg) = wantlist {
            if !msg.is_empty() {
                if let Err(err) = network.send_message(peer, msg).await {
                    warn!(peer = %peer, error = %err, "wantlist send failed");
                }
            }
        }

        for (_, block) in blocks {
            let mut msg = BsMessage::new(false);
            msg.add_block(block);
            if let Err(err) = network.send_message(peer, msg).await {
                warn!(peer = %peer, error = %err, "block send failed");
            }
        }
    }
    debug!(peer = %peer, "send queue shutting down");
}
