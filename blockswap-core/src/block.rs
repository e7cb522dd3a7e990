//! Content-addressed blocks
//!
//! A block is an opaque byte payload addressed by a CID derived from its
//! contents (CIDv1, raw codec, sha2-256 multihash).

use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Multicodec code for sha2-256.
/// See: https://github.com/multiformats/multicodec/blob/master/table.csv
const SHA2_256_CODE: u64 = 0x12;

/// Multicodec code for raw binary payloads.
const RAW_CODEC: u64 = 0x55;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("invalid CID: {0}")]
    InvalidCid(String),

    #[error("content mismatch: expected {expected}, got {actual}")]
    ContentMismatch { expected: String, actual: String },

    #[error("multihash error: {0}")]
    Multihash(String),
}

/// Compute the CID of a payload.
pub fn content_cid(data: &[u8]) -> Result<Cid, BlockError> {
    let digest = Sha256::digest(data);
    let mh = Multihash::<64>::wrap(SHA2_256_CODE, digest.as_slice())
        .map_err(|e| BlockError::Multihash(e.to_string()))?;
    Ok(Cid::new_v1(RAW_CODEC, mh))
}

/// Verify that a payload hashes to the expected CID.
pub fn verify_content(data: &[u8], expected: &Cid) -> Result<(), BlockError> {
    let computed = content_cid(data)?;
    if &computed != expected {
        return Err(BlockError::ContentMismatch {
            expected: expected.to_string(),
            actual: computed.to_string(),
        });
    }
    Ok(())
}

/// Parse a CID from its binary form (as carried in wantlist entries).
pub fn parse_cid(bytes: &[u8]) -> Result<Cid, BlockError> {
    Cid::try_from(bytes).map_err(|e| BlockError::InvalidCid(e.to_string()))
}

/// A block with its CID and data
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl Block {
    /// Create a new block from data, computing its CID
    pub fn new(data: Vec<u8>) -> Result<Self, BlockError> {
        let cid = content_cid(&data)?;
        Ok(Self { cid, data })
    }

    /// Create a block from data and verify it matches the expected CID
    pub fn from_cid_and_data(cid: Cid, data: Vec<u8>) -> Result<Self, BlockError> {
        verify_content(&data, &cid)?;
        Ok(Self { cid, data })
    }

    /// Get the size of the block in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}
