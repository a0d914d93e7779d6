// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Transaction signature → transaction CID index.

use super::compact::{CompactIndexReader, CompactIndexWriter};
use super::{IndexError, IndexKind, Metadata, Network, check_kind, index_file_name};
use cid::Cid;
use std::path::{Path, PathBuf};

const KIND: IndexKind = IndexKind::SigToCid;
const CID_LEN: usize = 36;

pub struct SigToCidWriter {
    inner: CompactIndexWriter,
}

impl SigToCidWriter {
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

    pub fn put(&mut self, signature: &[u8; 64], cid: &Cid) -> Result<(), IndexError> {
        self.inner.put(signature, &cid.to_bytes())
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

pub struct SigToCidReader {
    inner: CompactIndexReader,
}

impl SigToCidReader {
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

    pub fn get(&self, signature: &[u8; 64]) -> Result<Cid, IndexError> {
        let raw = self.inner.get(signature)?;
        Cid::try_from(raw).map_err(|e| IndexError::CorruptIndex(format!("stored cid: {e}")))
    }

    pub fn prefetch(&self, enabled: bool) -> Result<(), IndexError> {
        self.inner.prefetch(enabled)
    }

    pub fn metadata(&self) -> &Metadata {
        self.inner.metadata()
    }
}
