// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Slot → block CID index. Keys are 8-byte little-endian slot numbers; a
//! missing key means the slot was skipped (no block produced).

use super::compact::{CompactIndexReader, CompactIndexWriter};
use super::{IndexError, IndexKind, Metadata, Network, check_kind, index_file_name};
use cid::Cid;
use std::path::{Path, PathBuf};

const KIND: IndexKind = IndexKind::SlotToCid;
const CID_LEN: usize = 36;

pub struct SlotToCidWriter {
    inner: CompactIndexWriter,
}

impl SlotToCidWriter {
    pub fn new(
        tmp_parent: &Path,
        epoch: u64,
        root_cid: &Cid,
        network: Network,
        expected_items: u64,
    ) -> Result<Self, IndexError> {
        let metadata = Metadata::new(KIND, epoch, root_cid, network);
        Ok(Self {
            inner: CompactIndexWriter::new(tmp_parent, expected_items, CID_LEN, metadata)?,
        })
    }

    pub fn put(&mut self, slot: u64, cid: &Cid) -> Result<(), IndexError> {
        self.inner.put(&slot.to_le_bytes(), &cid.to_bytes())
    }

    pub fn received(&self) -> u64 {
        self.inner.received()
    }

    pub fn seal(self, dst_dir: &Path) -> Result<PathBuf, IndexError> {
        let meta = self.inner.metadata();
        let name = index_file_name(meta.epoch()?, &meta.root_cid()?, meta.network()?, KIND);
        let path = dst_dir.join(name);
        self.inner.seal(&path)?;
        Ok(path)
    }
}

pub struct SlotToCidReader {
    inner: CompactIndexReader,
}

impl SlotToCidReader {
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let inner = CompactIndexReader::open(path)?;
        check_kind(inner.metadata(), inner.is_legacy(), KIND)?;
        if inner.value_size() != CID_LEN {
            return Err(IndexError::CorruptIndex(format!(
                "{KIND} index with {}-byte values",
                inner.value_size()
            )));
        }
        Ok(Self { inner })
    }

    pub fn get(&self, slot: u64) -> Result<Cid, IndexError> {
        let raw = self.inner.get(&slot.to_le_bytes())?;
        Cid::try_from(raw).map_err(|e| IndexError::CorruptIndex(format!("stored cid: {e}")))
    }

    pub fn prefetch(&self, enabled: bool) -> Result<(), IndexError> {
        self.inner.prefetch(enabled)
    }

    pub fn metadata(&self) -> &Metadata {
        self.inner.metadata()
    }
}
