//! Local block storage
//!
//! The engine only needs `has`/`get`/`put` from its store; anything that
//! persists verified blocks can sit behind [`BlockStore`]. An in-memory
//! implementation is provided for tests and single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use cid::Cid;
use tokio::sync::RwLock;
use tracing::debug;

use crate::block::{verify_content, Block, BlockError};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("block not found: {0}")]
    NotFound(Cid),

    #[error("CID verification failed: {0}")]
    Verification(#[from] BlockError),

    #[error("store operation timed out")]
    Timeout,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Content-addressed block storage consumed by the exchange engine.
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn has(&self, cid: &Cid) -> Result<bool, StorageError>;
    async fn get(&self, cid: &Cid) -> Result<Block, StorageError>;
    async fn put(&self, block: Block) -> Result<(), StorageError>;
}

/// In-memory block store with CID-based indexing
pub struct MemoryBlockStore {
    inner: RwLock<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    blocks: HashMap<Cid, Block>,
    total_size: usize,
}

impl MemoryBlockStore {
    /// Create a new empty block store
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
        }
    }

    /// Store raw data, computing and verifying its CID
    pub async fn put_data(&self, data: Vec<u8>) -> Result<Cid, StorageError> {
        let block = Block::new(data)?;
        let cid = block.cid;
        self.put(block).await?;
        Ok(cid)
    }

    /// Number of blocks currently stored
    pub async fn len(&self) -> usize {
        self.inner.read().await.blocks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.blocks.is_empty()
    }

    /// Total bytes of block data currently stored
    pub async fn total_size(&self) -> usize {
        self.inner.read().await.total_size
    }

    /// Get all CIDs in the store
    pub async fn list_cids(&self) -> Vec<Cid> {
        self.inner.read().await.blocks.keys().copied().collect()
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        Ok(self.inner.read().await.blocks.contains_key(cid))
    }

    async fn get(&self, cid: &Cid) -> Result<Block, StorageError> {
        self.inner
            .read()
            .await
            .blocks
            .get(cid)
            .cloned()
            .ok_or(StorageError::NotFound(*cid))
    }

    async fn put(&self, block: Block) -> Result<(), StorageError> {
        // Verify block integrity before anything else touches it
        verify_content(&block.data, &block.cid)?;

        let mut inner = self.inner.write().await;
        if inner.blocks.contains_key(&block.cid) {
            debug!(cid = %block.cid, "block already stored");
            return Ok(()); // put is idempotent
        }

        inner.total_size += block.size();
        inner.blocks.insert(block.cid, block);
        Ok(())
    }
}
