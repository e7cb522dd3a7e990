//! Transfer counters
//!
//! Thread-safe exchange counters using atomic types, cloned freely into
//! worker tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cid::Cid;

#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    blocks_received: AtomicU64,
    dup_blocks_received: AtomicU64,
    blocks_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_received(&self, size: usize) {
        self.inner.blocks_received.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_received
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn duplicate_received(&self) {
        self.inner
            .dup_blocks_received
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn block_sent(&self, size: usize) {
        self.inner.blocks_sent.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_sent
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn blocks_received(&self) -> u64 {
        self.inner.blocks_received.load(Ordering::Relaxed)
    }

    pub fn dup_blocks_received(&self) -> u64 {
        self.inner.dup_blocks_received.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, wantlist: Vec<Cid>) -> Stat {
        Stat {
            blocks_received: self.inner.blocks_received.load(Ordering::Relaxed),
            dup_blocks_received: self.inner.dup_blocks_received.load(Ordering::Relaxed),
            blocks_sent: self.inner.blocks_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            wantlist,
        }
    }
}

/// Point-in-time view of the engine's transfer counters.
#[derive(Debug, Clone)]
pub struct Stat {
    pub blocks_received: u64,
    pub dup_blocks_received: u64,
    pub blocks_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub wantlist: Vec<Cid>,
}
