//! Collaborator interfaces
//!
//! The engine talks to the outside world through three seams: a
//! stream-oriented peer transport ([`Network`]), a provider-routing layer
//! ([`Router`]) and the delegate the transport calls back into
//! ([`Receiver`]). Real deployments wire these to an actual transport and
//! DHT; tests wire them to [`crate::testnet::VirtualNetwork`].

use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use libp2p_identity::PeerId;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::BsMessage;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("no route to peer {0}")]
    Unreachable(PeerId),

    #[error("send to {peer} failed: {reason}")]
    SendFailed { peer: PeerId, reason: String },

    #[error("routing failure: {0}")]
    Routing(String),
}

/// Peer-to-peer message transport consumed by the engine.
#[async_trait]
pub trait Network: Send + Sync {
    /// Deliver one message to one peer.
    async fn send_message(&self, to: PeerId, msg: BsMessage) -> Result<(), NetworkError>;

    /// Ensure a connection to `peer` exists, dialing if needed.
    async fn connect_to(&self, peer: PeerId) -> Result<(), NetworkError>;

    /// Register the delegate that receives inbound traffic and peer events.
    fn set_delegate(&self, delegate: Arc<dyn Receiver>);
}

/// Provider routing consumed by the engine.
#[async_trait]
pub trait Router: Send + Sync {
    /// Stream up to `max` peers believed to hold `key`. The channel closes
    /// when the search finishes or the limit is reached.
    fn find_providers(&self, key: Cid, max: usize) -> mpsc::Receiver<PeerId>;

    /// Announce that this node can serve `key`.
    async fn provide(&self, key: Cid) -> Result<(), NetworkError>;
}

/// Delegate the transport feeds with inbound messages and peer events.
#[async_trait]
pub trait Receiver: Send + Sync {
    async fn receive_message(&self, from: PeerId, msg: BsMessage);

    fn receive_error(&self, err: NetworkError);

    fn peer_connected(&self, peer: PeerId);

    fn peer_disconnected(&self, peer: PeerId);
}
