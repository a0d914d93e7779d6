// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Groups the flat CAR node stream into per-block batches.
//!
//! Producers write every child of a block immediately before the block
//! itself, so one pass with a single pending list suffices: nodes append
//! until a block node arrives, which closes and flushes the batch. The
//! stream never buffers more than one block's run.

use super::IngestError;
use crate::car::{NodeBytes, NodeSource};
use crate::node::{Kind, KindSet};
use crate::util::CancelToken;
use tracing::trace;

/// Callback verdict: keep consuming or end the run cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// One flushed batch: a block and the children that preceded it. The final
/// flush at end of stream carries `block: None` with whatever remained.
#[derive(Debug, Default)]
pub struct BlockBatch {
    pub block: Option<NodeBytes>,
    pub children: Vec<NodeBytes>,
}

impl BlockBatch {
    /// Nodes in CAR order: children first, block last.
    pub fn into_nodes(self) -> impl Iterator<Item = NodeBytes> {
        self.children.into_iter().chain(self.block)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AccumulatorOptions {
    /// Leading nodes to drop before accumulation starts.
    pub skip_nodes: usize,
    /// Kinds silently dropped from batches.
    pub ignore_kinds: KindSet,
    /// Queue capacity between the accumulator and a dedicated flusher.
    pub flush_depth: usize,
}

impl Default for AccumulatorOptions {
    fn default() -> Self {
        Self {
            skip_nodes: 0,
            ignore_kinds: KindSet::empty(),
            flush_depth: 1000,
        }
    }
}

/// Run the accumulator inline: `flush` is invoked on the caller's thread for
/// every batch, in CAR order.
///
/// Returning [`Flow::Stop`] ends the run cleanly. On cancellation or error,
/// pending buffers are returned to the pool before this function returns.
pub fn accumulate<S, F>(
    source: &mut S,
    options: AccumulatorOptions,
    cancel: &CancelToken,
    mut flush: F,
) -> Result<(), IngestError>
where
    S: NodeSource,
    F: FnMut(BlockBatch) -> Result<Flow, IngestError>,
{
    let mut skip_nodes = options.skip_nodes;
    let mut children: Vec<NodeBytes> = Vec::new();
    loop {
        if cancel.is_cancelled() {
            // Dropping the pending children returns their buffers.
            return Err(IngestError::Cancelled);
        }
        let node = match source.next_node_bytes() {
            Ok(Some(node)) => node,
            Ok(None) => {
                flush(BlockBatch {
                    block: None,
                    children,
                })?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if skip_nodes > 0 {
            skip_nodes -= 1;
            continue;
        }
        let kind = Kind::of(&node.data)?;
        if options.ignore_kinds.contains(kind) {
            continue;
        }
        if kind == Kind::Block {
            trace!(children = children.len(), "flushing block batch");
            let batch = BlockBatch {
                block: Some(node),
                children: std::mem::take(&mut children),
            };
            match flush(batch)? {
                Flow::Continue => {}
                Flow::Stop => return Ok(()),
            }
        } else {
            children.push(node);
        }
    }
}

/// Run the accumulator with a dedicated flusher thread behind a bounded
/// queue, so slow batch processing backpressures the framer instead of
/// stalling accumulation.
pub fn accumulate_with_flusher<S, F>(
    source: &mut S,
    options: AccumulatorOptions,
    cancel: &CancelToken,
    flush: F,
) -> Result<(), IngestError>
where
    S: NodeSource,
    F: FnMut(BlockBatch) -> Result<Flow, IngestError> + Send,
{
    let (tx, rx) = flume::bounded::<BlockBatch>(options.flush_depth);
    std::thread::scope(|scope| {
        let flusher = scope.spawn(move || -> Result<(), IngestError> {
            let mut flush = flush;
            for batch in rx.iter() {
                if flush(batch)? == Flow::Stop {
                    // Dropping the receiver tells the accumulator to stop;
                    // undelivered batches free their buffers on drop.
                    return Ok(());
                }
            }
            Ok(())
        });
        let accumulated = accumulate(source, options, cancel, |batch| {
            if tx.send(batch).is_err() {
                return Ok(Flow::Stop);
            }
            Ok(Flow::Continue)
        });
        drop(tx);
        let flushed = flusher.join().expect("flusher thread panicked");
        accumulated.and(flushed)
    })
}
