// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! CID → CAR byte range index.

use super::compact::{CompactIndexReader, CompactIndexWriter};
use super::{IndexError, IndexKind, Metadata, Network, check_kind, index_file_name};
use byteorder::{ByteOrder, LittleEndian};
use cid::Cid;
use std::path::{Path, PathBuf};

const KIND: IndexKind = IndexKind::CidToOffsetAndSize;

/// A section's location in the CAR: 48-bit offset, 24-bit size, packed
/// little-endian into 9 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetAndSize {
    pub offset: u64,
    pub size: u64,
}

impl OffsetAndSize {
    pub const ENCODED_LEN: usize = 9;

    pub fn to_bytes(self) -> Result<[u8; Self::ENCODED_LEN], IndexError> {
        if self.offset >= 1 << 48 {
            return Err(IndexError::OffsetOverflow(self.offset));
        }
        if self.size >= 1 << 24 {
            return Err(IndexError::SizeOverflow(self.size));
        }
        let mut out = [0u8; Self::ENCODED_LEN];
        LittleEndian::write_uint(&mut out[..6], self.offset, 6);
        LittleEndian::write_uint(&mut out[6..], self.size, 3);
        Ok(out)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, IndexError> {
        if raw.len() != Self::ENCODED_LEN {
            return Err(IndexError::CorruptIndex(format!(
                "offset+size value is {} bytes",
                raw.len()
            )));
        }
        Ok(Self {
            offset: LittleEndian::read_uint(&raw[..6], 6),
            size: LittleEndian::read_uint(&raw[6..], 3),
        })
    }

    /// End of the byte range, exclusive.
    pub fn end(self) -> u64 {
        self.offset + self.size
    }
}

pub struct CidToOffsetAndSizeWriter {
    inner: CompactIndexWriter,
}

impl CidToOffsetAndSizeWriter {
    pub fn new(
        tmp_parent: &Path,
        epoch: u64,
        root_cid: &Cid,
        network: Network,
        expected_items: u64,
    ) -> Result<Self, IndexError> {
        let metadata = Metadata::new(KIND, epoch, root_cid, network);
        Ok(Self {
            inner: CompactIndexWriter::new(
                tmp_parent,
                expected_items,
                OffsetAndSize::ENCODED_LEN,
                metadata,
            )?,
        })
    }

    pub fn put(&mut self, cid: &Cid, entry: OffsetAndSize) -> Result<(), IndexError> {
        self.inner.put(&cid.to_bytes(), &entry.to_bytes()?)
    }

    pub fn received(&self) -> u64 {
        self.inner.received()
    }

    /// Seal into `dst_dir` under the canonical file name.
    pub fn seal(self, dst_dir: &Path) -> Result<PathBuf, IndexError> {
        let meta = self.inner.metadata();
        let name = index_file_name(meta.epoch()?, &meta.root_cid()?, meta.network()?, KIND);
        let path = dst_dir.join(name);
        self.inner.seal(&path)?;
        Ok(path)
    }
}

pub struct CidToOffsetAndSizeReader {
    inner: CompactIndexReader,
}

impl CidToOffsetAndSizeReader {
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let inner = CompactIndexReader::open(path)?;
        check_kind(inner.metadata(), inner.is_legacy(), KIND)?;
        if inner.value_size() != OffsetAndSize::ENCODED_LEN {
            return Err(IndexError::CorruptIndex(format!(
                "{KIND} index with {}-byte values",
                inner.value_size()
            )));
        }
        Ok(Self { inner })
    }

    pub fn get(&self, cid: &Cid) -> Result<OffsetAndSize, IndexError> {
        OffsetAndSize::from_bytes(self.inner.get(&cid.to_bytes())?)
    }

    pub fn prefetch(&self, enabled: bool) -> Result<(), IndexError> {
        self.inner.prefetch(enabled)
    }

    pub fn metadata(&self) -> &Metadata {
        self.inner.metadata()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cid_of_raw;

    #[test]
    fn pack_unpack_offset_and_size() {
        let entry = OffsetAndSize {
            offset: 0x0000_8f00_aa00_0042,
            size: 0x00aa_bb,
        };
        let bytes = entry.to_bytes().unwrap();
        assert_eq!(OffsetAndSize::from_bytes(&bytes).unwrap(), entry);
        assert_eq!(entry.end(), entry.offset + entry.size);

        assert!(matches!(
            OffsetAndSize { offset: 1 << 48, size: 0 }.to_bytes(),
            Err(IndexError::OffsetOverflow(_))
        ));
        assert!(matches!(
            OffsetAndSize { offset: 0, size: 1 << 24 }.to_bytes(),
            Err(IndexError::SizeOverflow(_))
        ));
    }

    #[test]
    fn write_seal_open_get() {
        let tmp = tempfile::tempdir().unwrap();
        let root = cid_of_raw(b"root");
        let mut writer =
            CidToOffsetAndSizeWriter::new(tmp.path(), 7, &root, Network::Devnet, 64).unwrap();
        let mut entries = Vec::new();
        let mut offset = 59u64;
        for i in 0..64u64 {
            let cid = cid_of_raw(&i.to_le_bytes());
            let entry = OffsetAndSize { offset, size: 100 + i };
            writer.put(&cid, entry).unwrap();
            entries.push((cid, entry));
            offset += entry.size;
        }
        let path = writer.seal(tmp.path()).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            index_file_name(7, &root, Network::Devnet, KIND)
        );

        let reader = CidToOffsetAndSizeReader::open(&path).unwrap();
        assert_eq!(reader.metadata().epoch().unwrap(), 7);
        for (cid, entry) in entries {
            assert_eq!(reader.get(&cid).unwrap(), entry);
        }
        assert!(matches!(
            reader.get(&cid_of_raw(b"absent")),
            Err(IndexError::NotFound)
        ));
    }

    #[test]
    fn open_rejects_other_kinds() {
        let tmp = tempfile::tempdir().unwrap();
        let root = cid_of_raw(b"root");
        let mut writer =
            crate::index::SlotToCidWriter::new(tmp.path(), 7, &root, Network::Devnet, 4).unwrap();
        writer.put(1, &cid_of_raw(b"b")).unwrap();
        let path = writer.seal(tmp.path()).unwrap();
        assert!(matches!(
            CidToOffsetAndSizeReader::open(&path),
            Err(IndexError::WrongIndexKind { .. })
        ));
    }
}
