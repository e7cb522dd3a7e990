//! Decision engine
//!
//! Tracks what every peer has asked for, schedules which block to send to
//! which peer next, and turns those decisions into [`Envelope`]s consumed by
//! the task workers. All mutable state (per-peer ledgers plus the two-level
//! task queue) lives under a single mutex whose critical sections never
//! suspend; block-store probes happen with the lock released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cid::Cid;
use libp2p_identity::PeerId;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::blockstore::BlockStore;
use crate::message::BsMessage;
use crate::taskqueue::{PeerTaskQueue, TaskCmp};
use crate::wantlist::{Entry, Wantlist};

/// A block send decided by the engine, one block per envelope.
pub struct Envelope {
    pub peer: PeerId,
    pub message: BsMessage,
    done: TaskDone,
}

impl Envelope {
    /// Signal that the envelope reached the dispatcher; releases the
    /// `(peer, key)` in-flight slot and re-ranks the peer.
    pub fn sent(self) {
        self.done.complete();
    }

    /// Split the envelope so the message can be handed off before the
    /// completion is signalled.
    pub fn into_parts(self) -> (PeerId, BsMessage, TaskDone) {
        (self.peer, self.message, self.done)
    }
}

/// Completion handle capturing the engine state, so finishing a task needs
/// no back-pointer from task to engine.
pub struct TaskDone {
    inner: Arc<Mutex<EngineInner>>,
    peer: PeerId,
    key: Cid,
    generation: u64,
}

impl TaskDone {
    pub fn complete(self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.task_done(self.peer, &self.key, self.generation);
    }
}

struct Ledger {
    wantlist: Wantlist,
    bytes_sent: u64,
    bytes_received: u64,
    blocks_exchanged: u64,
    messages_received: u64,
}

impl Ledger {
    fn new() -> Self {
        Self {
            wantlist: Wantlist::new(),
            bytes_sent: 0,
            bytes_received: 0,
            blocks_exchanged: 0,
            messages_received: 0,
        }
    }
}

/// Point-in-time view of one peer's ledger.
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    pub peer: PeerId,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub blocks_exchanged: u64,
    pub messages_received: u64,
    pub wantlist: Vec<Entry>,
}

struct EngineInner {
    ledgers: HashMap<PeerId, Ledger>,
    queue: PeerTaskQueue,
}

type EnvelopeFeed = mpsc::Receiver<oneshot::Receiver<Envelope>>;

pub struct Engine {
    inner: Arc<Mutex<EngineInner>>,
    store: Arc<dyn BlockStore>,
    work: Arc<Notify>,
    outbox: Arc<tokio::sync::Mutex<EnvelopeFeed>>,
}

impl Engine {
    /// Create the engine and spawn its outbox loop. The loop stops when
    /// `token` is cancelled.
    pub fn new(store: Arc<dyn BlockStore>, cmp: TaskCmp, token: CancellationToken) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1);
        let engine = Arc::new(Self {
            inner: Arc::new(Mutex::new(EngineInner {
                ledgers: HashMap::new(),
                queue: PeerTaskQueue::new(cmp),
            })),
            store,
            work: Arc::new(Notify::new()),
            outbox: Arc::new(tokio::sync::Mutex::new(rx)),
        });

        tokio::spawn(outbox_loop(engine.clone(), tx, token));
        engine
    }

    /// The envelope feed for task workers. Obtaining the next envelope is a
    /// two-step handshake: receive a one-shot channel, then await the
    /// envelope on it. The engine fills one envelope at a time, so a worker
    /// taking a channel is what lets the next decision start.
    pub fn outbox(&self) -> Arc<tokio::sync::Mutex<EnvelopeFeed>> {
        self.outbox.clone()
    }

    /// Ingest an inbound message's wantlist into the sender's ledger and
    /// schedule sends for the entries we can serve from the local store.
    pub async fn message_received(&self, from: PeerId, msg: &BsMessage) {
        let mut added: Vec<Entry> = Vec::new();
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            let ledger = inner.ledgers.entry(from).or_insert_with(Ledger::new);
            ledger.messages_received += 1;

            if msg.full() {
                // A full message replaces our view of the peer's wantlist;
                // tasks scheduled for keys the replacement drops must not
                // ship a block the peer no longer wants.
                let dropped: Vec<Cid> = ledger
                    .wantlist
                    .entries()
                    .into_iter()
                    .map(|e| e.key)
                    .filter(|key| msg.entry(key).map_or(true, |e| e.cancel))
                    .collect();
                ledger.wantlist = Wantlist::new();
                for key in dropped {
                    inner.queue.remove(&key, from);
                }
            }
            for (key, e) in msg.entries() {
                if e.cancel {
                    debug!(peer = %from, cid = %key, "peer cancelled want");
                    ledger.wantlist.remove(key);
                    inner.queue.remove(key, from);
                } else {
                    ledger.wantlist.add(*key, e.priority);
                    added.push(Entry {
                        key: *key,
                        priority: e.priority,
                    });
                }
            }

            for block in msg.blocks() {
                ledger.bytes_received += block.size() as u64;
                ledger.blocks_exchanged += 1;
            }
        }

        for entry in added {
            if self.store.has(&entry.key).await.unwrap_or(false) {
                self.push(entry, from);
            }
        }
    }

    /// A block just became available locally: schedule sends to every peer
    /// whose wantlist contains it.
    pub fn block_arrived(&self, key: &Cid) {
        let mut pushed = false;
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            let wanting: Vec<(PeerId, Entry)> = inner
                .ledgers
                .iter()
                .filter_map(|(peer, ledger)| {
                    ledger.wantlist.contains(key).map(|entry| (*peer, entry))
                })
                .collect();
            for (peer, entry) in wanting {
                inner.queue.push(entry, peer);
                pushed = true;
            }
        }
        if pushed {
            self.work.notify_one();
        }
    }

    /// Accounting hook for outbound messages: blocks we sent leave the
    /// recipient's ledger wantlist and cancel any still-queued task.
    pub fn message_sent(&self, to: PeerId, msg: &BsMessage) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let ledger = inner.ledgers.entry(to).or_insert_with(Ledger::new);
        for block in msg.blocks() {
            ledger.bytes_sent += block.size() as u64;
            ledger.blocks_exchanged += 1;
            ledger.wantlist.remove(&block.cid);
            inner.queue.remove(&block.cid, to);
        }
    }

    /// Drop everything known about `peer`.
    pub fn peer_disconnected(&self, peer: &PeerId) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.ledgers.remove(peer);
        inner.queue.remove_peer(*peer);
    }

    /// Snapshot of what `peer` currently wants from us.
    pub fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<Entry> {
        let guard = self.inner.lock().unwrap();
        guard
            .ledgers
            .get(peer)
            .map(|l| l.wantlist.entries())
            .unwrap_or_default()
    }

    /// Snapshot of the accounting kept for `peer`, if any.
    pub fn ledger_snapshot(&self, peer: &PeerId) -> Option<LedgerSnapshot> {
        let guard = self.inner.lock().unwrap();
        guard.ledgers.get(peer).map(|l| LedgerSnapshot {
            peer: *peer,
            bytes_sent: l.bytes_sent,
            bytes_received: l.bytes_received,
            blocks_exchanged: l.blocks_exchanged,
            messages_received: l.messages_received,
            wantlist: l.wantlist.entries(),
        })
    }

    fn push(&self, entry: Entry, to: PeerId) {
        {
            let mut guard = self.inner.lock().unwrap();
            guard.queue.push(entry, to);
        }
        self.work.notify_one();
    }
}

async fn outbox_loop(
    engine: Arc<Engine>,
    tx: mpsc::Sender<oneshot::Receiver<Envelope>>,
    token: CancellationToken,
) {
    loop {
        let (etx, erx) = oneshot::channel();
        tokio::select! {
            _ = token.cancelled() => break,
            res = tx.send(erx) => {
                if res.is_err() {
                    break;
                }
            }
        }

        match next_envelope(&engine, &token).await {
            Some(envelope) => {
                // The worker holding the one-shot may have gone away; the
                // envelope's task slot is released either way.
                if let Err(env) = etx.send(envelope) {
                    env.sent();
                }
            }
            None => break,
        }
    }
    debug!("engine outbox loop shutting down");
}

/// Produce the next envelope, waiting for work when the queue runs dry.
/// Returns None only on cancellation.
async fn next_envelope(engine: &Arc<Engine>, token: &CancellationToken) -> Option<Envelope> {
    loop {
        let popped = {
            let mut guard = engine.inner.lock().unwrap();
            guard.queue.pop()
        };

        let task = match popped {
            Some(task) => task,
            None => {
                tokio::select! {
                    _ = token.cancelled() => return None,
                    _ = engine.work.notified() => continue,
                }
            }
        };

        let done = TaskDone {
            inner: engine.inner.clone(),
            peer: task.peer,
            key: task.key,
            generation: task.generation(),
        };

        match engine.store.get(&task.key).await {
            Ok(block) => {
                let mut message = BsMessage::new(false);
                message.add_block(block);
                return Some(Envelope {
                    peer: task.peer,
                    message,
                    done,
                });
            }
            Err(err) => {
                // The block vanished between scheduling and sending.
                debug!(cid = %task.key, error = %err, "skipping task, block not in store");
                done.complete();
                continue;
            }
        }
    }
}
