// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-block mini-DAG batches.
//!
//! The accumulator (and the random-access engine) assemble one batch per
//! block: the block node plus every child that preceded it in the CAR.
//! [`RawBatch`] holds the undecoded sections, [`ParsedBatch`] the decoded
//! nodes; both sort by CID once and answer lookups by binary search.

use crate::car::NodeBytes;
use crate::node::{Block, DataFrame, Entry, Epoch, Kind, Node, NodeError, Rewards, Subset, Transaction};
use crate::pool::PooledBuf;
use bytes::Bytes;
use cid::Cid;

/// A node payload: either a pooled buffer owned by the batch or a
/// cheaply-cloned slice of a cached range read.
#[derive(Debug)]
pub enum Payload {
    Pooled(PooledBuf),
    Shared(Bytes),
}

impl Payload {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Pooled(buf) => buf,
            Payload::Shared(bytes) => bytes,
        }
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// One element of a [`RawBatch`].
#[derive(Debug)]
pub struct RawNode {
    pub cid: Cid,
    /// Absolute CAR offset of the section, when the source reported one.
    pub offset: Option<u64>,
    /// On-disk size of the section, varint prefix included.
    pub section_len: u64,
    pub data: Payload,
}

impl RawNode {
    pub fn kind(&self) -> Result<Kind, NodeError> {
        Kind::of(self.data.as_slice())
    }
}

impl From<NodeBytes> for RawNode {
    fn from(node: NodeBytes) -> Self {
        Self {
            cid: node.cid,
            offset: node.offset,
            section_len: node.section_len,
            data: Payload::Pooled(node.data),
        }
    }
}

/// Undecoded (CID, section) pairs for one block's run. When built by the
/// accumulator the block node is the tail.
#[derive(Debug, Default)]
pub struct RawBatch {
    items: Vec<RawNode>,
    sorted: bool,
}

impl RawBatch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            sorted: false,
        }
    }

    pub fn push(&mut self, node: RawNode) {
        self.items.push(node);
        self.sorted = false;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RawNode> {
        self.items.iter()
    }

    /// Arrange elements in CID order. Required before [`by_cid`].
    ///
    /// [`by_cid`]: Self::by_cid
    pub fn sort_by_cid(&mut self) {
        self.items.sort_unstable_by(|a, b| a.cid.cmp(&b.cid));
        self.sorted = true;
    }

    /// Binary search by CID. The batch must be sorted.
    pub fn by_cid(&self, cid: &Cid) -> Option<&RawNode> {
        debug_assert!(self.sorted, "by_cid on an unsorted batch");
        let at = self.items.binary_search_by(|item| item.cid.cmp(cid)).ok()?;
        Some(&self.items[at])
    }

    /// Linear fallback for the rare unsorted paths.
    pub fn linear_by_cid(&self, cid: &Cid) -> Option<&RawNode> {
        self.items.iter().find(|item| item.cid == *cid)
    }

    /// Decode every element, preserving order.
    pub fn to_parsed(&self) -> Result<ParsedBatch, NodeError> {
        let mut items = Vec::with_capacity(self.items.len());
        for item in &self.items {
            items.push((item.cid, Node::decode(item.data.as_slice())?));
        }
        Ok(ParsedBatch {
            items,
            sorted: self.sorted,
        })
    }

    /// Drop the batch, returning every pooled buffer.
    pub fn reset(self) {
        drop(self);
    }
}

impl FromIterator<RawNode> for RawBatch {
    fn from_iter<I: IntoIterator<Item = RawNode>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
            sorted: false,
        }
    }
}

/// Decoded (CID, node) pairs for one block's run.
#[derive(Debug, Default)]
pub struct ParsedBatch {
    items: Vec<(Cid, Node)>,
    sorted: bool,
}

macro_rules! typed_iter {
    ($name:ident, $ty:ty, $as:ident) => {
        /// Lazy view over the nodes of one kind, in batch order.
        pub fn $name(&self) -> impl Iterator<Item = (&Cid, &$ty)> {
            self.items
                .iter()
                .filter_map(|(cid, node)| node.$as().map(|n| (cid, n)))
        }
    };
}

impl ParsedBatch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Cid, Node)> {
        self.items.iter()
    }

    pub fn sort_by_cid(&mut self) {
        self.items.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        self.sorted = true;
    }

    pub fn by_cid(&self, cid: &Cid) -> Option<&Node> {
        debug_assert!(self.sorted, "by_cid on an unsorted batch");
        let at = self.items.binary_search_by(|item| item.0.cmp(cid)).ok()?;
        Some(&self.items[at].1)
    }

    pub fn linear_by_cid(&self, cid: &Cid) -> Option<&Node> {
        self.items
            .iter()
            .find(|(item_cid, _)| item_cid == cid)
            .map(|(_, node)| node)
    }

    typed_iter!(blocks, Block, as_block);
    typed_iter!(entries, Entry, as_entry);
    typed_iter!(transactions, Transaction, as_transaction);
    typed_iter!(data_frames, DataFrame, as_data_frame);
    typed_iter!(rewards, Rewards, as_rewards);
    typed_iter!(subsets, Subset, as_subset);
    typed_iter!(epochs, Epoch, as_epoch);

    /// Transactions ordered by their position in the block. Transactions
    /// without a recorded position keep their batch order.
    pub fn sorted_transactions(&self) -> Vec<(&Cid, &Transaction)> {
        let mut txs: Vec<(&Cid, &Transaction)> = self.transactions().collect();
        txs.sort_by_key(|(_, tx)| tx.index.unwrap_or(u64::MAX));
        txs
    }

    /// Recycle every decoded node into its kind pool.
    pub fn reset(self) {
        for (_, node) in self.items {
            node.recycle();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FixtureNode, cid_of_raw, tiny_epoch};

    fn raw_batch() -> (RawBatch, Vec<Cid>) {
        let fixture = tiny_epoch();
        let mut batch = RawBatch::default();
        let mut cids = Vec::new();
        for FixtureNode { cid, encoded, .. } in &fixture.nodes {
            cids.push(*cid);
            batch.push(RawNode {
                cid: *cid,
                offset: None,
                section_len: encoded.len() as u64,
                data: Payload::Shared(Bytes::from(encoded.clone())),
            });
        }
        (batch, cids)
    }

    #[test]
    fn sort_then_binary_search() {
        let (mut batch, cids) = raw_batch();
        batch.sort_by_cid();
        for cid in &cids {
            assert_eq!(batch.by_cid(cid).unwrap().cid, *cid);
        }
        assert!(batch.by_cid(&cid_of_raw(b"not in the batch")).is_none());
    }

    #[test]
    fn linear_search_works_unsorted() {
        let (batch, cids) = raw_batch();
        for cid in &cids {
            assert_eq!(batch.linear_by_cid(cid).unwrap().cid, *cid);
        }
    }

    #[test]
    fn parse_preserves_order_and_kinds() {
        let (batch, cids) = raw_batch();
        let parsed = batch.to_parsed().unwrap();
        assert_eq!(parsed.len(), cids.len());
        for ((cid, _), want) in parsed.iter().zip(&cids) {
            assert_eq!(cid, want);
        }
        assert_eq!(parsed.blocks().count(), 1);
        assert_eq!(parsed.epochs().count(), 1);
        assert_eq!(parsed.subsets().count(), 1);
        assert!(parsed.transactions().count() >= 1);
        parsed.reset();
    }

    #[test]
    fn sorted_transactions_order_by_index() {
        let mk = |slot, index| Transaction {
            slot,
            index,
            ..Default::default()
        };
        let items = [mk(1, Some(2)), mk(1, None), mk(1, Some(0)), mk(1, Some(1))];
        let mut batch = RawBatch::default();
        for (i, tx) in items.iter().enumerate() {
            let encoded = tx.to_vec().unwrap();
            batch.push(RawNode {
                cid: cid_of_raw(&[i as u8]),
                offset: None,
                section_len: encoded.len() as u64,
                data: Payload::Shared(Bytes::from(encoded)),
            });
        }
        let parsed = batch.to_parsed().unwrap();
        let order: Vec<Option<u64>> = parsed
            .sorted_transactions()
            .into_iter()
            .map(|(_, tx)| tx.index)
            .collect();
        assert_eq!(order, [Some(0), Some(1), Some(2), None]);
        parsed.reset();
    }
}
