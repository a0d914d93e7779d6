// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Signature existence filter.
//!
//! Not a full index: just "was this signature seen in the epoch". The
//! 64-byte signature space is divided by its first two bytes into 65536
//! buckets; each bucket is a sorted list of 64-bit signature hashes, so a
//! probe is one descriptor read plus a binary search over a few thousand
//! mapped words.
//!
//! Layout:
//!
//! ```text
//! magic[8] ‖ file_size:u64 ‖ metadata
//!          ‖ 65536 × (offset:u64 ‖ count:u32)
//!          ‖ per-bucket sorted u64 hashes
//! ```

use super::compact::key_hash;
use super::{IndexError, IndexKind, Metadata, Network, SIG_EXISTS_MAGIC, check_kind, index_file_name};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use cid::Cid;
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

const KIND: IndexKind = IndexKind::SigExists;
const NUM_BUCKETS: usize = 1 << 16;
const DESC_LEN: usize = 12;
const HEADER_LEN: usize = 16;

fn bucket_of(signature: &[u8; 64]) -> usize {
    usize::from(u16::from_be_bytes([signature[0], signature[1]]))
}

/// In-memory builder; at 8 bytes per signature an epoch's worth fits
/// comfortably next to the compact writers' spill files.
pub struct SigExistsWriter {
    buckets: Vec<Vec<u64>>,
    metadata: Metadata,
    received: u64,
}

impl SigExistsWriter {
    pub fn new(epoch: u64, root_cid: &Cid, network: Network) -> Self {
        Self {
            buckets: vec![Vec::new(); NUM_BUCKETS],
            metadata: Metadata::new(KIND, epoch, root_cid, network),
            received: 0,
        }
    }

    pub fn put(&mut self, signature: &[u8; 64]) {
        self.buckets[bucket_of(signature)].push(key_hash(signature));
        self.received += 1;
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn seal(mut self, dst_dir: &Path) -> Result<PathBuf, IndexError> {
        let name = index_file_name(
            self.metadata.epoch()?,
            &self.metadata.root_cid()?,
            self.metadata.network()?,
            KIND,
        );
        let dst = dst_dir.join(name);

        for bucket in &mut self.buckets {
            bucket.sort_unstable();
            bucket.dedup();
        }

        let mut out = NamedTempFile::new_in(dst_dir)?;
        {
            let mut w = BufWriter::new(out.as_file());
            w.write_all(&SIG_EXISTS_MAGIC)?;
            w.write_u64::<LittleEndian>(0)?; // file size, patched below
            self.metadata.write_to(&mut w)?;

            let table_len = NUM_BUCKETS * DESC_LEN;
            let mut offset = (HEADER_LEN + self.metadata.encoded_len() + table_len) as u64;
            for bucket in &self.buckets {
                w.write_u64::<LittleEndian>(offset)?;
                w.write_u32::<LittleEndian>(bucket.len() as u32)?;
                offset += bucket.len() as u64 * 8;
            }
            for bucket in &self.buckets {
                for hash in bucket {
                    w.write_u64::<LittleEndian>(*hash)?;
                }
            }
            w.flush()?;

            let file = out.as_file();
            (&*file).seek(SeekFrom::Start(8))?;
            (&*file).write_all(&offset.to_le_bytes())?;
            file.sync_all()?;
        }
        out.persist(&dst).map_err(|e| IndexError::Io(e.error))?;
        debug!(dst = %dst.display(), signatures = self.received, "sealed sig-exists filter");
        Ok(dst)
    }
}

pub struct SigExistsReader {
    mmap: Mmap,
    table_offset: usize,
    metadata: Metadata,
}

impl SigExistsReader {
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let file = File::open(path)?;
        // Safety: sealed index files are immutable once renamed into place.
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < HEADER_LEN {
            return Err(IndexError::CorruptIndex("file shorter than header".into()));
        }
        let magic: [u8; 8] = mmap[..8].try_into().expect("8 bytes");
        if magic != SIG_EXISTS_MAGIC {
            return Err(IndexError::UnsupportedMagic(magic));
        }
        let file_size = LittleEndian::read_u64(&mmap[8..16]);
        if file_size != mmap.len() as u64 {
            return Err(IndexError::CorruptIndex(format!(
                "header says {file_size} bytes, file has {}",
                mmap.len()
            )));
        }
        let mut reader = &mmap[HEADER_LEN..];
        let before = reader.len();
        let metadata = Metadata::read_from(&mut reader)?;
        check_kind(&metadata, false, KIND)?;
        let table_offset = HEADER_LEN + (before - reader.len());
        if table_offset + NUM_BUCKETS * DESC_LEN > mmap.len() {
            return Err(IndexError::CorruptIndex("bucket table out of bounds".into()));
        }
        Ok(Self {
            mmap,
            table_offset,
            metadata,
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Whether the signature was observed in this epoch. False positives
    /// are bounded by the 64-bit hash within a 2-byte prefix bucket.
    pub fn has(&self, signature: &[u8; 64]) -> Result<bool, IndexError> {
        let at = self.table_offset + bucket_of(signature) * DESC_LEN;
        let desc = self
            .mmap
            .get(at..at + DESC_LEN)
            .ok_or_else(|| IndexError::CorruptIndex("bucket descriptor out of bounds".into()))?;
        let offset = LittleEndian::read_u64(&desc[..8]) as usize;
        let count = LittleEndian::read_u32(&desc[8..]) as usize;
        let entries = self
            .mmap
            .get(offset..offset + count * 8)
            .ok_or_else(|| IndexError::CorruptIndex("bucket out of bounds".into()))?;

        let needle = key_hash(signature);
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let have = LittleEndian::read_u64(&entries[mid * 8..]);
            match have.cmp(&needle) {
                std::cmp::Ordering::Equal => return Ok(true),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(false)
    }
}
