//! Exchange protocol messages
//!
//! The wire shape is a protobuf message carrying a wantlist (entries of
//! `(key, priority, cancel)` plus a `full` replacement flag) and a list of
//! block payloads, declared with prost derive macros. [`BsMessage`] is the
//! in-memory form the engine manipulates; it merges repeated entry updates
//! so a key appears at most once.

use std::collections::HashMap;

use cid::Cid;
use prost::Message as ProstMessage;
use thiserror::Error;

use crate::block::{parse_cid, Block, BlockError};

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireMessage {
    #[prost(message, optional, tag = "1")]
    pub wantlist: Option<WireWantlist>,

    #[prost(message, repeated, tag = "2")]
    pub payload: Vec<WireBlock>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireWantlist {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<WireEntry>,

    #[prost(bool, tag = "2")]
    pub full: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireEntry {
    #[prost(bytes = "vec", tag = "1")]
    pub block: Vec<u8>,

    #[prost(int32, tag = "2")]
    pub priority: i32,

    #[prost(bool, tag = "3")]
    pub cancel: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireBlock {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed entry key: {0}")]
    BadKey(#[from] BlockError),

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("encode error: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// A single wantlist update carried in a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgEntry {
    pub priority: i32,
    pub cancel: bool,
}

/// In-memory exchange message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BsMessage {
    full: bool,
    entries: HashMap<Cid, MsgEntry>,
    blocks: Vec<Block>,
}

impl BsMessage {
    pub fn new(full: bool) -> Self {
        Self {
            full,
            ..Default::default()
        }
    }

    /// True when this message replaces the recipient's view of the sender's
    /// wantlist rather than updating it incrementally.
    pub fn full(&self) -> bool {
        self.full
    }

    pub fn set_full(&mut self, full: bool) {
        self.full = full;
    }

    /// Add (or overwrite) a want for `key`. Adding the same key twice leaves
    /// a single entry, so merges are idempotent.
    pub fn add_entry(&mut self, key: Cid, priority: i32) {
        self.entries.insert(
            key,
            MsgEntry {
                priority,
                cancel: false,
            },
        );
    }

    /// Retract a want for `key`, superseding any pending add.
    pub fn cancel(&mut self, key: Cid) {
        self.entries.insert(
            key,
            MsgEntry {
                priority: 0,
                cancel: true,
            },
        );
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Cid, &MsgEntry)> {
        self.entries.iter()
    }

    pub fn entry(&self, key: &Cid) -> Option<&MsgEntry> {
        self.entries.get(key)
    }

    pub fn add_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Remove and return all block payloads, leaving the wantlist intact.
    pub fn take_blocks(&mut self) -> Vec<Block> {
        std::mem::take(&mut self.blocks)
    }

    /// A message with no entries and no payloads carries nothing worth
    /// sending, even when `full` is set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.blocks.is_empty()
    }

    pub fn to_wire(&self) -> WireMessage {
        let entries = self
            .entries
            .iter()
            .map(|(key, e)| WireEntry {
                block: key.to_bytes(),
                priority: e.priority,
                cancel: e.cancel,
            })
            .collect();

        WireMessage {
            wantlist: Some(WireWantlist {
                entries,
                full: self.full,
            }),
            payload: self
                .blocks
                .iter()
                .map(|b| WireBlock {
                    data: b.data.clone(),
                })
                .collect(),
        }
    }

    /// Rebuild a message from its wire form. Payload CIDs are recomputed from
    /// the bytes, so a corrupted block cannot impersonate another key.
    pub fn from_wire(wire: WireMessage) -> Result<Self, MessageError> {
        let mut msg = BsMessage::default();

        if let Some(wl) = wire.wantlist {
            msg.full = wl.full;
            for entry in wl.entries {
                let key = parse_cid(&entry.block)?;
                if entry.cancel {
                    msg.cancel(key);
                } else {
                    msg.add_entry(key, entry.priority);
                }
            }
        }

        for wb in wire.payload {
            let block = Block::new(wb.data)?;
            msg.blocks.push(block);
        }

        Ok(msg)
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let wire = self.to_wire();
        let mut buf = Vec::with_capacity(wire.encoded_len());
        wire.encode(&mut buf)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        Self::from_wire(WireMessage::decode(bytes)?)
    }
}
