//! In-process network fabric
//!
//! A virtual transport plus provider registry for exercising full exchange
//! swarms in one process: messages are delivered asynchronously (with an
//! optional simulated delay) to each peer's registered delegate, and
//! `provide` announcements land in a shared provider table that backs
//! `find_providers`. Used by the integration tests and the demo binary.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use libp2p_identity::PeerId;
use tokio::sync::mpsc;

use crate::block::Block;
use crate::blockstore::MemoryBlockStore;
use crate::config::EngineConfig;
use crate::exchange::BlockSwap;
use crate::message::BsMessage;
use crate::network::{Network, NetworkError, Receiver, Router};

/// A simulated peer-to-peer network connecting in-process exchange engines.
#[derive(Clone)]
pub struct VirtualNetwork {
    state: Arc<Mutex<NetState>>,
    delay: Duration,
}

#[derive(Default)]
struct NetState {
    clients: HashMap<PeerId, Arc<VirtualAdapter>>,
    // Provider lists keep announcement order so lookups are deterministic
    providers: HashMap<Cid, Vec<PeerId>>,
    // Established links, normalized; connect events fire only on new links
    links: HashSet<(PeerId, PeerId)>,
}

impl VirtualNetwork {
    pub fn new(delay: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetState::default())),
            delay,
        }
    }

    /// Create the network adapter for `peer` and register it on the fabric.
    pub fn adapter(&self, peer: PeerId) -> Arc<VirtualAdapter> {
        let adapter = Arc::new(VirtualAdapter {
            local: peer,
            net: self.clone(),
            delegate: Mutex::new(None),
        });
        self.state
            .lock()
            .unwrap()
            .clients
            .insert(peer, adapter.clone());
        adapter
    }

    fn client(&self, peer: &PeerId) -> Option<Arc<VirtualAdapter>> {
        self.state.lock().unwrap().clients.get(peer).cloned()
    }

    fn providers_of(&self, key: &Cid, max: usize) -> Vec<PeerId> {
        let state = self.state.lock().unwrap();
        state
            .providers
            .get(key)
            .map(|peers| peers.iter().take(max).copied().collect())
            .unwrap_or_default()
    }

    fn add_provider(&self, key: Cid, peer: PeerId) {
        let mut state = self.state.lock().unwrap();
        let peers = state.providers.entry(key).or_default();
        if !peers.contains(&peer) {
            peers.push(peer);
        }
    }

    /// Record the link between `a` and `b`; returns true when it is new.
    fn link_up(&self, a: PeerId, b: PeerId) -> bool {
        let link = if a.to_bytes() <= b.to_bytes() {
            (a, b)
        } else {
            (b, a)
        };
        self.state.lock().unwrap().links.insert(link)
    }
}

/// One peer's handle onto the [`VirtualNetwork`]; implements both the
/// transport and routing seams.
pub struct VirtualAdapter {
    local: PeerId,
    net: VirtualNetwork,
    delegate: Mutex<Option<Arc<dyn Receiver>>>,
}

impl VirtualAdapter {
    fn delegate(&self) -> Option<Arc<dyn Receiver>> {
        self.delegate.lock().unwrap().clone()
    }
}

#[async_trait]
impl Network for VirtualAdapter {
    async fn send_message(&self, to: PeerId, msg: BsMessage) -> Result<(), NetworkError> {
        let Some(target) = self.net.client(&to) else {
            return Err(NetworkError::Unreachable(to));
        };
        let Some(delegate) = target.delegate() else {
            return Err(NetworkError::SendFailed {
                peer: to,
                reason: "peer has no delegate".into(),
            });
        };

        let from = self.local;
        let delay = self.net.delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            delegate.receive_message(from, msg).await;
        });
        Ok(())
    }

    async fn connect_to(&self, peer: PeerId) -> Result<(), NetworkError> {
        let Some(target) = self.net.client(&peer) else {
            return Err(NetworkError::Unreachable(peer));
        };

        // Re-dialing an established link is a no-op; only a fresh dial
        // notifies the two delegates.
        if !self.net.link_up(self.local, peer) {
            return Ok(());
        }
        if let Some(delegate) = target.delegate() {
            delegate.peer_connected(self.local);
        }
        if let Some(delegate) = self.delegate() {
            delegate.peer_connected(peer);
        }
        Ok(())
    }

    fn set_delegate(&self, delegate: Arc<dyn Receiver>) {
        *self.delegate.lock().unwrap() = Some(delegate);
    }
}

#[async_trait]
impl Router for VirtualAdapter {
    fn find_providers(&self, key: Cid, max: usize) -> mpsc::Receiver<PeerId> {
        let (tx, rx) = mpsc::channel(max.max(1));
        let net = self.net.clone();
        tokio::spawn(async move {
            if !net.delay.is_zero() {
                tokio::time::sleep(net.delay).await;
            }
            for peer in net.providers_of(&key, max) {
                if tx.send(peer).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    async fn provide(&self, key: Cid) -> Result<(), NetworkError> {
        if !self.net.delay.is_zero() {
            tokio::time::sleep(self.net.delay).await;
        }
        self.net.add_provider(key, self.local);
        Ok(())
    }
}

/// Deterministic generator of distinct test blocks.
#[derive(Default)]
pub struct BlockGenerator {
    seq: u64,
}

impl BlockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> Block {
        self.seq += 1;
        Block::new(format!("virtual block {}", self.seq).into_bytes())
            .expect("hashing generated bytes cannot fail")
    }

    /// A distinct block padded to at least `size` bytes.
    pub fn sized(&mut self, size: usize) -> Block {
        self.seq += 1;
        let mut data = format!("virtual block {}", self.seq).into_bytes();
        if data.len() < size {
            data.resize(size, 0x5b);
        }
        Block::new(data).expect("hashing generated bytes cannot fail")
    }

    pub fn blocks(&mut self, n: usize) -> Vec<Block> {
        (0..n).map(|_| self.next()).collect()
    }
}

/// An exchange engine wired onto a [`VirtualNetwork`] with its own store.
pub struct TestNode {
    pub peer: PeerId,
    pub swap: Arc<BlockSwap>,
    pub store: Arc<MemoryBlockStore>,
}

/// Spawn `n` engines on `net` and introduce every pair to each other.
pub fn spawn_nodes(net: &VirtualNetwork, config: &EngineConfig, n: usize) -> Vec<TestNode> {
    let nodes: Vec<TestNode> = (0..n)
        .map(|_| {
            let peer = PeerId::random();
            let adapter = net.adapter(peer);
            let store = Arc::new(MemoryBlockStore::new());
            let swap = BlockSwap::new(
                peer,
                config.clone(),
                store.clone(),
                adapter.clone(),
                adapter,
            );
            TestNode { peer, swap, store }
        })
        .collect();

    for node in &nodes {
        for other in &nodes {
            if node.peer != other.peer {
                node.swap.peer_connected(other.peer);
            }
        }
    }
    nodes
}
