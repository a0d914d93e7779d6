// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-kind free lists for decoded nodes.
//!
//! Batch decoding (`to_parsed`) allocates one box per node; at epoch scale
//! that is hundreds of millions of boxes, so batches recycle them here. A
//! pooled value is [`Reset`] before it goes back on the shelf.

use super::types::{Block, DataFrame, Entry, Epoch, Rewards, Subset, Transaction};
use parking_lot::Mutex;

/// Restores a pooled value to its vacant state.
pub trait Reset {
    fn reset(&mut self);
}

pub struct ObjectPool<T> {
    shelf: Mutex<Vec<Box<T>>>,
}

impl<T: Reset> ObjectPool<T> {
    pub const fn new() -> Self {
        Self {
            shelf: Mutex::new(Vec::new()),
        }
    }

    /// Box `value`, reusing a shelved allocation when one is available.
    pub fn boxed(&self, value: T) -> Box<T> {
        match self.shelf.lock().pop() {
            Some(mut slot) => {
                *slot = value;
                slot
            }
            None => Box::new(value),
        }
    }

    /// Reset `value` and shelve it for reuse.
    pub fn put(&self, mut value: Box<T>) {
        value.reset();
        self.shelf.lock().push(value);
    }

    pub fn shelved(&self) -> usize {
        self.shelf.lock().len()
    }
}

impl<T: Reset> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub static TRANSACTION: ObjectPool<Transaction> = ObjectPool::new();
pub static ENTRY: ObjectPool<Entry> = ObjectPool::new();
pub static BLOCK: ObjectPool<Block> = ObjectPool::new();
pub static SUBSET: ObjectPool<Subset> = ObjectPool::new();
pub static EPOCH: ObjectPool<Epoch> = ObjectPool::new();
pub static REWARDS: ObjectPool<Rewards> = ObjectPool::new();
pub static DATA_FRAME: ObjectPool<DataFrame> = ObjectPool::new();

impl Reset for DataFrame {
    fn reset(&mut self) {
        self.hash = None;
        self.index = None;
        self.total = None;
        self.data.clear();
        self.next = None;
    }
}

impl Reset for Transaction {
    fn reset(&mut self) {
        self.data.reset();
        self.metadata.reset();
        self.slot = 0;
        self.index = None;
    }
}

impl Reset for Entry {
    fn reset(&mut self) {
        self.num_hashes = 0;
        self.hash = [0; 32];
        self.transactions.clear();
    }
}

impl Reset for Block {
    fn reset(&mut self) {
        self.slot = 0;
        self.shredding.clear();
        self.entries.clear();
        self.meta = Default::default();
        self.rewards = Default::default();
    }
}

impl Reset for Subset {
    fn reset(&mut self) {
        self.first = 0;
        self.last = 0;
        self.blocks.clear();
    }
}

impl Reset for Epoch {
    fn reset(&mut self) {
        self.epoch = 0;
        self.subsets.clear();
    }
}

impl Reset for Rewards {
    fn reset(&mut self) {
        self.slot = 0;
        self.data.reset();
    }
}
