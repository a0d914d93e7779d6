// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! IPLD node kinds and their CBOR tuple-representation codec.
//!
//! Every node is a definite-length CBOR array whose first element is the
//! kind discriminant, which puts the kind byte at offset 1 of the encoding.
//! [`Kind::of`] relies on that to classify raw sections without decoding.

pub mod pool;
mod reassemble;
mod types;

pub use reassemble::{checksum_crc64, checksum_fnv, reassemble_dataframes};
pub use types::{Block, DataFrame, Entry, Epoch, Rewards, Shredding, SlotMeta, Subset, Transaction};

use cid::Cid;
use std::fmt;
use thiserror::Error;

/// Node kind discriminants, fixed on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Transaction = 0,
    Entry = 1,
    Block = 2,
    Subset = 3,
    Epoch = 4,
    Rewards = 5,
    DataFrame = 6,
}

impl Kind {
    pub const ALL: [Kind; 7] = [
        Kind::Transaction,
        Kind::Entry,
        Kind::Block,
        Kind::Subset,
        Kind::Epoch,
        Kind::Rewards,
        Kind::DataFrame,
    ];

    pub const fn from_byte(byte: u8) -> Option<Kind> {
        match byte {
            0 => Some(Kind::Transaction),
            1 => Some(Kind::Entry),
            2 => Some(Kind::Block),
            3 => Some(Kind::Subset),
            4 => Some(Kind::Epoch),
            5 => Some(Kind::Rewards),
            6 => Some(Kind::DataFrame),
            _ => None,
        }
    }

    /// Classify an encoded node by peeking at the kind byte. O(1); never
    /// decodes.
    pub fn of(bytes: &[u8]) -> Result<Kind, NodeError> {
        if bytes.len() < 2 {
            return Err(NodeError::TruncatedNode(bytes.len()));
        }
        Kind::from_byte(bytes[1]).ok_or(NodeError::UnknownKind(bytes[1]))
    }

    pub const fn name(self) -> &'static str {
        match self {
            Kind::Transaction => "transaction",
            Kind::Entry => "entry",
            Kind::Block => "block",
            Kind::Subset => "subset",
            Kind::Epoch => "epoch",
            Kind::Rewards => "rewards",
            Kind::DataFrame => "dataframe",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A small set of [`Kind`]s, used for accumulator ignore filters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KindSet(u8);

impl KindSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn of(kinds: &[Kind]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < kinds.len() {
            bits |= 1 << kinds[i] as u8;
            i += 1;
        }
        Self(bits)
    }

    pub fn insert(&mut self, kind: Kind) {
        self.0 |= 1 << kind as u8;
    }

    pub const fn contains(self, kind: Kind) -> bool {
        self.0 & (1 << kind as u8) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<Kind> for KindSet {
    fn from_iter<I: IntoIterator<Item = Kind>>(iter: I) -> Self {
        let mut set = KindSet::empty();
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

/// Node decode / reassembly error
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("truncated node: need at least 2 bytes, got {0}")]
    TruncatedNode(usize),
    #[error("unknown node kind {0}")]
    UnknownKind(u8),
    #[error("expected {expected} node, found {found}")]
    UnexpectedKind { expected: Kind, found: Kind },
    #[error("cbor: {0}")]
    Cbor(String),
    #[error("dataframe {0} not found")]
    MissingFrame(Cid),
    #[error("linked node {0} is not a dataframe")]
    WrongNodeKind(Cid),
    #[error("dataframe chain has {found} frames, head says {total}")]
    FrameCountMismatch { total: u64, found: u64 },
    #[error("dataframe index {0} occurs more than once")]
    FrameIndexCollision(u64),
    #[error("payload hash mismatch: stored {stored:#018x}, crc64 {crc64:#018x}, fnv {fnv:#018x}")]
    HashMismatch { stored: u64, crc64: u64, fnv: u64 },
}

pub(crate) fn expect_kind(bytes: &[u8], expected: Kind) -> Result<(), NodeError> {
    let found = Kind::of(bytes)?;
    if found != expected {
        return Err(NodeError::UnexpectedKind { expected, found });
    }
    Ok(())
}

pub(crate) fn cbor_err<E: fmt::Display>(e: E) -> NodeError {
    NodeError::Cbor(e.to_string())
}

/// A decoded node of any kind. Boxes come from the per-kind pools; call
/// [`recycle`](Node::recycle) to hand one back.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Transaction(Box<Transaction>),
    Entry(Box<Entry>),
    Block(Box<Block>),
    Subset(Box<Subset>),
    Epoch(Box<Epoch>),
    Rewards(Box<Rewards>),
    DataFrame(Box<DataFrame>),
}

impl Node {
    /// Decode any node, dispatching on the kind byte.
    pub fn decode(bytes: &[u8]) -> Result<Node, NodeError> {
        Ok(match Kind::of(bytes)? {
            Kind::Transaction => {
                Node::Transaction(pool::TRANSACTION.boxed(Transaction::from_bytes(bytes)?))
            }
            Kind::Entry => Node::Entry(pool::ENTRY.boxed(Entry::from_bytes(bytes)?)),
            Kind::Block => Node::Block(pool::BLOCK.boxed(Block::from_bytes(bytes)?)),
            Kind::Subset => Node::Subset(pool::SUBSET.boxed(Subset::from_bytes(bytes)?)),
            Kind::Epoch => Node::Epoch(pool::EPOCH.boxed(Epoch::from_bytes(bytes)?)),
            Kind::Rewards => Node::Rewards(pool::REWARDS.boxed(Rewards::from_bytes(bytes)?)),
            Kind::DataFrame => {
                Node::DataFrame(pool::DATA_FRAME.boxed(DataFrame::from_bytes(bytes)?))
            }
        })
    }

    pub fn kind(&self) -> Kind {
        match self {
            Node::Transaction(_) => Kind::Transaction,
            Node::Entry(_) => Kind::Entry,
            Node::Block(_) => Kind::Block,
            Node::Subset(_) => Kind::Subset,
            Node::Epoch(_) => Kind::Epoch,
            Node::Rewards(_) => Kind::Rewards,
            Node::DataFrame(_) => Kind::DataFrame,
        }
    }

    /// Return the boxed node to its kind pool.
    pub fn recycle(self) {
        match self {
            Node::Transaction(b) => pool::TRANSACTION.put(b),
            Node::Entry(b) => pool::ENTRY.put(b),
            Node::Block(b) => pool::BLOCK.put(b),
            Node::Subset(b) => pool::SUBSET.put(b),
            Node::Epoch(b) => pool::EPOCH.put(b),
            Node::Rewards(b) => pool::REWARDS.put(b),
            Node::DataFrame(b) => pool::DATA_FRAME.put(b),
        }
    }

    pub fn as_transaction(&self) -> Option<&Transaction> {
        match self {
            Node::Transaction(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_entry(&self) -> Option<&Entry> {
        match self {
            Node::Entry(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<&Block> {
        match self {
            Node::Block(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_subset(&self) -> Option<&Subset> {
        match self {
            Node::Subset(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_epoch(&self) -> Option<&Epoch> {
        match self {
            Node::Epoch(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_rewards(&self) -> Option<&Rewards> {
        match self {
            Node::Rewards(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_data_frame(&self) -> Option<&DataFrame> {
        match self {
            Node::DataFrame(d) => Some(d),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_of_peeks_byte_one() {
        // 0x84 = array(4), 0x02 = kind 2 (block)
        assert_eq!(Kind::of(&[0x84, 0x02, 0x00, 0x00]).unwrap(), Kind::Block);
        assert!(matches!(Kind::of(&[0x84]), Err(NodeError::TruncatedNode(1))));
        assert!(matches!(Kind::of(&[0x84, 0x09]), Err(NodeError::UnknownKind(9))));
    }

    #[test]
    fn kind_set_ops() {
        let mut set = KindSet::of(&[Kind::Entry, Kind::Rewards]);
        assert!(set.contains(Kind::Entry));
        assert!(set.contains(Kind::Rewards));
        assert!(!set.contains(Kind::Block));
        set.insert(Kind::Block);
        assert!(set.contains(Kind::Block));
        assert!(KindSet::empty().is_empty());
    }
}
