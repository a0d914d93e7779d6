// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Single-pass index construction over an epoch CAR.
//!
//! A cheap counting scan sizes the index writers, then the prefetching
//! reader streams the CAR once through the accumulator while every observed
//! CID, slot, and signature is spilled into the builders. Sealing produces
//! the four index files and a receipt of per-kind counts.

pub mod accumulator;

pub use accumulator::{AccumulatorOptions, BlockBatch, Flow, accumulate, accumulate_with_flusher};

use crate::car::{CarError, CarFileReader, CarPrefetchReader, ReaderOptions};
use crate::epoch::epoch_of_slot;
use crate::index::{
    CidToOffsetAndSizeReader, CidToOffsetAndSizeWriter, IndexError, IndexKind, Network,
    OffsetAndSize, SigExistsReader, SigExistsWriter, SigToCidReader, SigToCidWriter,
    SlotToCidReader, SlotToCidWriter, find_index_file,
};
use crate::node::{Block, DataFrame, Kind, NodeError, Transaction, reassemble_dataframes};
use crate::util::CancelToken;
use cid::Cid;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Ingest error
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Car(#[from] CarError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("malformed transaction wire data: {0}")]
    MalformedTransaction(String),
    #[error("verification failed: {0}")]
    VerifyFailed(String),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Parse the leading signature off raw Solana transaction bytes: a
/// shortvec (compact-u16) count followed by 64-byte signatures. Nothing
/// else of the wire format is interpreted here.
pub fn leading_signature(wire: &[u8]) -> Result<[u8; 64], IngestError> {
    let mut count: u16 = 0;
    let mut at = 0;
    loop {
        let byte = *wire
            .get(at)
            .ok_or_else(|| IngestError::MalformedTransaction("truncated shortvec".into()))?;
        count |= u16::from(byte & 0x7f) << (7 * at);
        at += 1;
        if byte & 0x80 == 0 {
            break;
        }
        if at == 3 {
            return Err(IngestError::MalformedTransaction(
                "shortvec longer than 3 bytes".into(),
            ));
        }
    }
    if count == 0 {
        return Err(IngestError::MalformedTransaction("no signatures".into()));
    }
    let raw = wire
        .get(at..at + 64)
        .ok_or_else(|| IngestError::MalformedTransaction("truncated signature".into()))?;
    Ok(raw.try_into().expect("64 bytes"))
}

/// Per-kind node counts observed in a scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KindCounts([u64; 7]);

impl KindCounts {
    pub fn bump(&mut self, kind: Kind) {
        self.0[kind as usize] += 1;
    }

    pub fn of(&self, kind: Kind) -> u64 {
        self.0[kind as usize]
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }
}

/// Result of the counting scan that sizes the index writers.
#[derive(Debug, Default, Clone, Copy)]
pub struct CarStats {
    pub counts: KindCounts,
    pub first_block_slot: Option<u64>,
}

/// Count nodes per kind without decoding anything but the first block
/// (whose slot pins the epoch number).
pub fn scan_car(car_path: &Path, cancel: &CancelToken) -> Result<CarStats, IngestError> {
    let mut reader = CarFileReader::open(car_path)?;
    let mut stats = CarStats::default();
    while let Some(node) = reader.next_section(true)? {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        let kind = Kind::of(&node.data)?;
        if kind == Kind::Block && stats.first_block_slot.is_none() {
            stats.first_block_slot = Some(Block::from_bytes(&node.data)?.slot);
        }
        stats.counts.bump(kind);
    }
    debug!(nodes = stats.counts.total(), "counted CAR nodes");
    Ok(stats)
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub network: Network,
    /// Where sealed indexes land.
    pub index_dir: PathBuf,
    /// Parent for builder spill directories.
    pub tmp_dir: PathBuf,
    pub reader: ReaderOptions,
    /// Draw a progress bar on stderr.
    pub progress: bool,
}

/// Paths of the four sealed index files.
#[derive(Debug, Clone)]
pub struct SealedIndexes {
    pub cid_to_offset_and_size: PathBuf,
    pub slot_to_cid: PathBuf,
    pub sig_to_cid: PathBuf,
    pub sig_exists: PathBuf,
}

#[derive(Debug, Clone)]
pub struct IngestReceipt {
    pub epoch: u64,
    pub root: Cid,
    pub counts: KindCounts,
    pub sealed: SealedIndexes,
}

/// Build all four indexes from one linear pass over the CAR (after a
/// counting scan that sizes the writers).
pub fn build_all_indexes(
    car_path: &Path,
    options: &IngestOptions,
    cancel: &CancelToken,
) -> Result<IngestReceipt, IngestError> {
    let stats = scan_car(car_path, cancel)?;

    let file = std::fs::File::open(car_path)?;
    let mut reader = CarPrefetchReader::new(file, options.reader.clone())?;
    let root = reader.header().roots[0];
    let epoch = stats.first_block_slot.map(epoch_of_slot).unwrap_or_default();
    info!(
        epoch,
        %root,
        nodes = stats.counts.total(),
        blocks = stats.counts.of(Kind::Block),
        transactions = stats.counts.of(Kind::Transaction),
        "building indexes"
    );

    let mut cid_writer = CidToOffsetAndSizeWriter::new(
        &options.tmp_dir,
        epoch,
        &root,
        options.network,
        stats.counts.total(),
    )?;
    let mut slot_writer = SlotToCidWriter::new(
        &options.tmp_dir,
        epoch,
        &root,
        options.network,
        stats.counts.of(Kind::Block),
    )?;
    let mut sig_writer = SigToCidWriter::new(
        &options.tmp_dir,
        epoch,
        &root,
        options.network,
        stats.counts.of(Kind::Transaction),
    )?;
    let mut sig_exists_writer = SigExistsWriter::new(epoch, &root, options.network);

    let bar = if options.progress {
        let bar = ProgressBar::new(stats.counts.total());
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} nodes ({per_sec})",
            )
            .expect("static template"),
        );
        bar
    } else {
        ProgressBar::hidden()
    };

    let mut counts = KindCounts::default();
    let mut next_offset = reader.header_size();
    let result = accumulate(
        &mut reader,
        AccumulatorOptions::default(),
        cancel,
        |batch| {
            index_batch(
                &batch,
                &mut next_offset,
                &mut counts,
                &mut cid_writer,
                &mut slot_writer,
                &mut sig_writer,
                &mut sig_exists_writer,
            )?;
            bar.inc((batch.children.len() + usize::from(batch.block.is_some())) as u64);
            Ok(Flow::Continue)
        },
    );
    reader.close();
    result?;
    bar.finish_and_clear();

    if counts != stats.counts {
        warn!("node counts changed between the scan and the indexing pass");
    }

    let sealed = SealedIndexes {
        cid_to_offset_and_size: cid_writer.seal(&options.index_dir)?,
        slot_to_cid: slot_writer.seal(&options.index_dir)?,
        sig_to_cid: sig_writer.seal(&options.index_dir)?,
        sig_exists: sig_exists_writer.seal(&options.index_dir)?,
    };
    info!(epoch, "sealed all indexes");
    Ok(IngestReceipt {
        epoch,
        root,
        counts,
        sealed,
    })
}

/// Index one block batch: every node's byte range, the block's slot, and
/// each transaction's leading signature.
fn index_batch(
    batch: &BlockBatch,
    next_offset: &mut u64,
    counts: &mut KindCounts,
    cid_writer: &mut CidToOffsetAndSizeWriter,
    slot_writer: &mut SlotToCidWriter,
    sig_writer: &mut SigToCidWriter,
    sig_exists_writer: &mut SigExistsWriter,
) -> Result<(), IngestError> {
    let nodes = batch.children.iter().chain(batch.block.iter());
    for node in nodes {
        let offset = *next_offset;
        *next_offset += node.section_len;
        cid_writer.put(
            &node.cid,
            OffsetAndSize {
                offset,
                size: node.section_len,
            },
        )?;

        let kind = Kind::of(&node.data)?;
        counts.bump(kind);
        match kind {
            Kind::Block => {
                let block = Block::from_bytes(&node.data)?;
                slot_writer.put(block.slot, &node.cid)?;
            }
            Kind::Transaction => {
                let tx = Transaction::from_bytes(&node.data)?;
                let wire = reassemble_dataframes(&tx.data, |cid| batch_frame(batch, cid))?;
                let signature = leading_signature(&wire)?;
                sig_writer.put(&signature, &node.cid)?;
                sig_exists_writer.put(&signature);
            }
            _ => {}
        }
    }
    Ok(())
}

/// Frame getter over the raw nodes of the current batch; transaction wire
/// payloads large enough to chain always sit in the same block run.
fn batch_frame(batch: &BlockBatch, cid: &Cid) -> Result<DataFrame, IngestError> {
    let node = batch
        .children
        .iter()
        .find(|n| n.cid == *cid)
        .ok_or(NodeError::MissingFrame(*cid))?;
    Ok(DataFrame::from_bytes(&node.data)?)
}

/// Re-stream the CAR and prove every sealed entry against it: offsets and
/// sizes round-trip (the stored range frames the same CID), every block's
/// slot resolves, every signature resolves and registers in the existence
/// filter. This is also the locality audit: it re-derives everything the
/// serve path will trust.
pub fn verify_indexes(
    car_path: &Path,
    index_dir: &Path,
    cancel: &CancelToken,
) -> Result<(), IngestError> {
    let cid_reader =
        CidToOffsetAndSizeReader::open(&find_index_file(index_dir, IndexKind::CidToOffsetAndSize)?)?;
    let slot_reader = SlotToCidReader::open(&find_index_file(index_dir, IndexKind::SlotToCid)?)?;
    let sig_reader = SigToCidReader::open(&find_index_file(index_dir, IndexKind::SigToCid)?)?;
    let sig_exists = SigExistsReader::open(&find_index_file(index_dir, IndexKind::SigExists)?)?;

    let mut reader = CarFileReader::open(car_path)?;
    // Dataframes of the current block run, for multipart wire payloads.
    let mut run_frames: HashMap<Cid, DataFrame> = HashMap::new();
    let mut verified = 0u64;
    while let Some(node) = reader.next_section(true)? {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        let offset = node.offset.expect("file reader reports offsets");
        let entry = cid_reader.get(&node.cid).map_err(|e| {
            IngestError::VerifyFailed(format!("cid {} missing from offset index: {e}", node.cid))
        })?;
        if entry.offset != offset || entry.size != node.section_len {
            return Err(IngestError::VerifyFailed(format!(
                "cid {}: index says [{}, {}), stream says [{}, {})",
                node.cid,
                entry.offset,
                entry.end(),
                offset,
                offset + node.section_len,
            )));
        }

        match Kind::of(&node.data)? {
            Kind::DataFrame => {
                run_frames.insert(node.cid, DataFrame::from_bytes(&node.data)?);
            }
            Kind::Transaction => {
                let tx = Transaction::from_bytes(&node.data)?;
                let wire = reassemble_dataframes(&tx.data, |cid| {
                    run_frames
                        .get(cid)
                        .cloned()
                        .ok_or_else(|| IngestError::from(NodeError::MissingFrame(*cid)))
                })?;
                let signature = leading_signature(&wire)?;
                let got = sig_reader.get(&signature).map_err(|e| {
                    IngestError::VerifyFailed(format!(
                        "signature of tx {} unresolvable: {e}",
                        node.cid
                    ))
                })?;
                if got != node.cid {
                    return Err(IngestError::VerifyFailed(format!(
                        "signature of tx {} resolves to {got}",
                        node.cid
                    )));
                }
                if !sig_exists.has(&signature)? {
                    return Err(IngestError::VerifyFailed(format!(
                        "signature of tx {} missing from existence filter",
                        node.cid
                    )));
                }
            }
            Kind::Block => {
                let block = Block::from_bytes(&node.data)?;
                let got = slot_reader.get(block.slot).map_err(|e| {
                    IngestError::VerifyFailed(format!("slot {} unresolvable: {e}", block.slot))
                })?;
                if got != node.cid {
                    return Err(IngestError::VerifyFailed(format!(
                        "slot {} resolves to {got}, stream has {}",
                        block.slot, node.cid
                    )));
                }
                // The run ends with its block.
                run_frames.clear();
            }
            _ => {}
        }
        verified += 1;
    }
    info!(verified, "indexes verified against the CAR");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BUFFER_POOL;
    use crate::test_utils::{tiny_epoch, wire_transaction};
    use serial_test::serial;

    #[test]
    fn leading_signature_parses_shortvec() {
        let sig = [7u8; 64];
        let wire = wire_transaction(sig, b"message");
        assert_eq!(leading_signature(&wire).unwrap(), sig);

        // Two-byte shortvec (0x80 continuation): count 128.
        let mut wire = vec![0x80, 0x01];
        wire.extend_from_slice(&[9u8; 64 * 2]);
        assert_eq!(leading_signature(&wire).unwrap(), [9u8; 64]);

        assert!(matches!(
            leading_signature(&[0x00, 1, 2]),
            Err(IngestError::MalformedTransaction(_))
        ));
        assert!(matches!(
            leading_signature(&[0x01, 1, 2]),
            Err(IngestError::MalformedTransaction(_))
        ));
        assert!(matches!(
            leading_signature(&[]),
            Err(IngestError::MalformedTransaction(_))
        ));
    }

    #[test]
    #[serial]
    fn scan_counts_every_kind() {
        let fixture = tiny_epoch();
        let tmp = tempfile::tempdir().unwrap();
        let car_path = tmp.path().join("epoch.car");
        std::fs::write(&car_path, &fixture.car).unwrap();

        let stats = scan_car(&car_path, &CancelToken::new()).unwrap();
        assert_eq!(stats.counts.of(Kind::Block), 3);
        assert_eq!(stats.counts.of(Kind::Transaction), 3);
        assert_eq!(stats.counts.of(Kind::Entry), 3);
        assert_eq!(stats.counts.of(Kind::Rewards), 3);
        assert_eq!(stats.counts.of(Kind::Subset), 1);
        assert_eq!(stats.counts.of(Kind::Epoch), 1);
        assert_eq!(stats.counts.of(Kind::DataFrame), 2);
        assert_eq!(stats.counts.total(), fixture.nodes.len() as u64);
        assert_eq!(stats.first_block_slot, Some(10));
    }

    fn build_fixture_indexes(fixture: &crate::test_utils::Fixture) -> (tempfile::TempDir, IngestReceipt) {
        let tmp = tempfile::tempdir().unwrap();
        let car_path = tmp.path().join("epoch.car");
        std::fs::write(&car_path, &fixture.car).unwrap();
        let index_dir = tmp.path().join("indexes");
        let tmp_dir = tmp.path().join("tmp");
        std::fs::create_dir_all(&index_dir).unwrap();
        std::fs::create_dir_all(&tmp_dir).unwrap();

        let receipt = build_all_indexes(
            &car_path,
            &IngestOptions {
                network: Network::Mainnet,
                index_dir,
                tmp_dir,
                reader: ReaderOptions::default(),
                progress: false,
            },
            &CancelToken::new(),
        )
        .unwrap();
        (tmp, receipt)
    }

    #[test]
    #[serial]
    fn builds_and_verifies_all_four_indexes() {
        let base = BUFFER_POOL.outstanding();
        let fixture = tiny_epoch();
        let (tmp, receipt) = build_fixture_indexes(&fixture);
        assert_eq!(BUFFER_POOL.outstanding(), base);

        assert_eq!(receipt.epoch, 0);
        assert_eq!(receipt.root, fixture.root);
        assert_eq!(receipt.counts.total(), fixture.nodes.len() as u64);
        for path in [
            &receipt.sealed.cid_to_offset_and_size,
            &receipt.sealed.slot_to_cid,
            &receipt.sealed.sig_to_cid,
            &receipt.sealed.sig_exists,
        ] {
            assert!(path.exists(), "missing {}", path.display());
        }

        let car_path = tmp.path().join("epoch.car");
        let index_dir = tmp.path().join("indexes");
        verify_indexes(&car_path, &index_dir, &CancelToken::new()).unwrap();
    }

    #[test]
    #[serial]
    fn sealed_lookups_match_the_fixture() {
        let fixture = tiny_epoch();
        let (tmp, receipt) = build_fixture_indexes(&fixture);
        let car = std::fs::read(tmp.path().join("epoch.car")).unwrap();

        let slot_reader = SlotToCidReader::open(&receipt.sealed.slot_to_cid).unwrap();
        let sig_reader = SigToCidReader::open(&receipt.sealed.sig_to_cid).unwrap();
        let cid_reader =
            CidToOffsetAndSizeReader::open(&receipt.sealed.cid_to_offset_and_size).unwrap();
        let sig_exists = SigExistsReader::open(&receipt.sealed.sig_exists).unwrap();

        for block in &fixture.blocks {
            assert_eq!(slot_reader.get(block.slot).unwrap(), block.cid);
            assert_eq!(
                sig_reader.get(&block.tx_signatures[0]).unwrap(),
                block.tx_cids[0]
            );
            assert!(sig_exists.has(&block.tx_signatures[0]).unwrap());

            // The indexed transaction range must frame the original bytes.
            let entry = cid_reader.get(&block.tx_cids[0]).unwrap();
            let section = &car[entry.offset as usize..entry.end() as usize];
            let body = {
                use integer_encoding::VarIntReader;
                let mut cursor = std::io::Cursor::new(section);
                let len: u64 = cursor.read_varint().unwrap();
                let at = cursor.position() as usize;
                &section[at..at + len as usize]
            };
            let (cid, data) = crate::car::parse_node_from_section(body, None).unwrap();
            assert_eq!(cid, block.tx_cids[0]);
            assert_eq!(data, fixture.node(&block.tx_cids[0]).encoded.as_slice());
        }

        // A slot with no block.
        assert!(matches!(slot_reader.get(11), Err(IndexError::NotFound)));
    }

    #[test]
    #[serial]
    fn cancellation_surfaces_and_leaks_nothing() {
        let base = BUFFER_POOL.outstanding();
        let fixture = tiny_epoch();
        let tmp = tempfile::tempdir().unwrap();
        let car_path = tmp.path().join("epoch.car");
        std::fs::write(&car_path, &fixture.car).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = build_all_indexes(
            &car_path,
            &IngestOptions {
                network: Network::Mainnet,
                index_dir: tmp.path().to_path_buf(),
                tmp_dir: tmp.path().to_path_buf(),
                reader: ReaderOptions::default(),
                progress: false,
            },
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::Cancelled));
        assert_eq!(BUFFER_POOL.outstanding(), base);
    }
}
