//! Blockswap Core
//!
//! Decision-and-dispatch core of a peer-to-peer block exchange: wantlist
//! accounting, per-peer fair task scheduling, coalescing send queues and the
//! notification fabric coupling block arrivals to local waiters. Storage,
//! transport and routing are collaborators behind the traits in
//! [`blockstore`] and [`network`].

pub mod block;
pub mod blockstore;
pub mod config;
pub mod decision;
pub mod exchange;
pub mod message;
pub mod metrics;
pub mod network;
pub mod notifications;
pub mod peermanager;
pub mod taskqueue;
pub mod testnet;
pub mod wantlist;

mod workers;

pub use block::{Block, BlockError};
pub use blockstore::{BlockStore, MemoryBlockStore, StorageError};
pub use config::{Config, EngineConfig};
pub use exchange::{BlockSwap, SwapError};
pub use message::BsMessage;
pub use metrics::Stat;
pub use network::{Network, NetworkError, Receiver, Router};
pub use wantlist::MAX_PRIORITY;
