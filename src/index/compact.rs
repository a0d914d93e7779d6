// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Compact external index: arbitrary keys to fixed-width values at a few
//! bytes per entry.
//!
//! Build partitions entries into buckets of ~8 by key hash and spills them
//! to bounded shard files, so memory stays flat no matter how many pairs
//! stream in. Sealing searches each bucket for a 32-bit `hash_domain` whose
//! mixed hash assigns every entry a distinct slot in `[0, n)`; the record
//! at a slot stores only a short hash tag and the value. Lookup is then one
//! bucket-descriptor read plus one record read on a mapped file.
//!
//! Layout:
//!
//! ```text
//! magic[8] ‖ file_size:u64 ‖ num_buckets:u32 ‖ value_size:u16 ‖ pad:u16
//!          ‖ metadata (absent in legacy files)
//!          ‖ num_buckets × (hash_domain:u32 ‖ num_entries:u32 ‖ hash_len:u8 ‖ pad:u8 ‖ offset:u48)
//!          ‖ per-bucket records (short_hash[hash_len] ‖ value[value_size]), slot order
//! ```

use super::{INDEX_MAGIC, IndexError, LEGACY_INDEX_MAGIC, Metadata};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use fnv::FnvHasher;
use memmap2::Mmap;
use std::fs::File;
use std::hash::Hasher;
use std::io::{BufWriter, Cursor, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, warn};

/// Buckets are sized for ~8 entries; the slot-permutation search is cheap
/// at that load and the bucket table stays a small fraction of the payload.
const TARGET_ENTRIES_PER_BUCKET: u64 = 8;
/// Hard cap on indexed items.
pub const MAX_ITEMS: u64 = 1 << 31;
/// Spill fan-out cap; each shard covers a contiguous bucket range.
const MAX_SPILL_SHARDS: u32 = 512;
const DEFAULT_HASH_LEN: u8 = 3;
const HEADER_LEN: u64 = 24;
const BUCKET_DESC_LEN: u64 = 16;
const OFFSET_MAX: u64 = (1 << 48) - 1;

/// FNV-1a of the whole key; basis of bucket selection and slot hashing.
pub fn key_hash(key: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(key);
    hasher.finish()
}

/// Mix a 32-bit domain into a key hash (splitmix finalizer). Bijective in
/// the hash for any fixed domain, so distinct keys keep distinct mixes.
pub fn domain_hash(domain: u32, key_hash: u64) -> u64 {
    let mut x = key_hash ^ (u64::from(domain)).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 31;
    x
}

fn bucket_of(key_hash: u64, num_buckets: u32) -> u32 {
    (key_hash % u64::from(num_buckets)) as u32
}

fn short_mask(hash_len: u8) -> u64 {
    if hash_len >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * hash_len)) - 1
    }
}

/// Streaming builder. Owns a temp directory of spill shards; `seal`
/// produces the final file with fsync-then-rename and removes the temp
/// directory.
pub struct CompactIndexWriter {
    tmp: TempDir,
    shard_paths: Vec<PathBuf>,
    shards: Vec<BufWriter<File>>,
    num_buckets: u32,
    buckets_per_shard: u32,
    value_size: usize,
    metadata: Metadata,
    expected: u64,
    received: u64,
}

impl CompactIndexWriter {
    /// `expected_items` sizes the bucket table; the builder tolerates some
    /// drift but load factors far above the estimate slow sealing down.
    pub fn new(
        tmp_parent: &Path,
        expected_items: u64,
        value_size: usize,
        metadata: Metadata,
    ) -> Result<Self, IndexError> {
        if expected_items > MAX_ITEMS {
            return Err(IndexError::TooManyItems(expected_items));
        }
        let num_buckets = expected_items.div_ceil(TARGET_ENTRIES_PER_BUCKET).max(1) as u32;
        let shard_count = num_buckets.min(MAX_SPILL_SHARDS);
        let buckets_per_shard = num_buckets.div_ceil(shard_count);
        let tmp = tempfile::Builder::new()
            .prefix("index-compact-")
            .tempdir_in(tmp_parent)?;
        let mut shard_paths = Vec::with_capacity(shard_count as usize);
        let mut shards = Vec::with_capacity(shard_count as usize);
        for i in 0..shard_count {
            let path = tmp.path().join(format!("shard-{i:04}.spill"));
            shards.push(BufWriter::new(File::create(&path)?));
            shard_paths.push(path);
        }
        debug!(
            num_buckets,
            shard_count, value_size, expected_items, "compact index writer opened"
        );
        Ok(Self {
            tmp,
            shard_paths,
            shards,
            num_buckets,
            buckets_per_shard,
            value_size,
            metadata,
            expected: expected_items,
            received: 0,
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Spill one (key, value) pair.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), IndexError> {
        if value.len() != self.value_size {
            return Err(IndexError::WrongValueSize {
                expected: self.value_size,
                got: value.len(),
            });
        }
        if self.received >= MAX_ITEMS {
            return Err(IndexError::TooManyItems(self.received + 1));
        }
        let hash = key_hash(key);
        let shard = (bucket_of(hash, self.num_buckets) / self.buckets_per_shard) as usize;
        let writer = &mut self.shards[shard];
        writer.write_u64::<LittleEndian>(hash)?;
        writer.write_all(value)?;
        self.received += 1;
        Ok(())
    }

    /// Seal into `dst`. Consuming the writer is what makes sealing
    /// idempotent: no further puts can exist.
    pub fn seal(self, dst: &Path) -> Result<(), IndexError> {
        self.seal_with_magic(dst, &INDEX_MAGIC, true)
    }

    fn seal_with_magic(
        mut self,
        dst: &Path,
        magic: &[u8; 8],
        with_metadata: bool,
    ) -> Result<(), IndexError> {
        for shard in &mut self.shards {
            shard.flush()?;
        }
        drop(std::mem::take(&mut self.shards));
        if self.received > self.expected {
            warn!(
                expected = self.expected,
                received = self.received,
                "index writer got more items than estimated; buckets run overloaded"
            );
        }

        let dir = dst.parent().filter(|p| !p.as_os_str().is_empty());
        let mut out = NamedTempFile::new_in(dir.unwrap_or_else(|| Path::new(".")))?;
        let table_offset;
        let mut descriptors: Vec<(u32, u32, u8, u64)> =
            Vec::with_capacity(self.num_buckets as usize);
        {
            let mut w = BufWriter::new(out.as_file());
            w.write_all(magic)?;
            w.write_u64::<LittleEndian>(0)?; // file size, patched below
            w.write_u32::<LittleEndian>(self.num_buckets)?;
            w.write_u16::<LittleEndian>(self.value_size as u16)?;
            w.write_u16::<LittleEndian>(0)?;
            let mut pos = HEADER_LEN;
            if with_metadata {
                self.metadata.write_to(&mut w)?;
                pos += self.metadata.encoded_len() as u64;
            }
            table_offset = pos;
            let table_len = u64::from(self.num_buckets) * BUCKET_DESC_LEN;
            w.write_all(&vec![0u8; table_len as usize])?;
            pos += table_len;

            let entry_len = 8 + self.value_size;
            for (shard_idx, path) in self.shard_paths.iter().enumerate() {
                let blob = std::fs::read(path)?;
                if blob.len() % entry_len != 0 {
                    return Err(IndexError::CorruptIndex("torn spill record".into()));
                }
                let first_bucket = shard_idx as u32 * self.buckets_per_shard;
                let last_bucket = (first_bucket + self.buckets_per_shard).min(self.num_buckets);
                let mut groups: Vec<Vec<(u64, &[u8])>> =
                    vec![Vec::new(); (last_bucket - first_bucket) as usize];
                for record in blob.chunks_exact(entry_len) {
                    let hash = u64::from_le_bytes(record[..8].try_into().expect("8 bytes"));
                    let bucket = bucket_of(hash, self.num_buckets);
                    groups[(bucket - first_bucket) as usize].push((hash, &record[8..]));
                }
                for entries in &groups {
                    if pos > OFFSET_MAX {
                        return Err(IndexError::OffsetOverflow(pos));
                    }
                    let (domain, hash_len, records) = seal_bucket(entries, self.value_size)?;
                    w.write_all(&records)?;
                    descriptors.push((domain, entries.len() as u32, hash_len, pos));
                    pos += records.len() as u64;
                }
            }
            w.flush()?;

            let file_size = pos;
            let file = out.as_file();
            (&*file).seek(SeekFrom::Start(table_offset))?;
            {
                let mut tw = BufWriter::new(file);
                for (domain, num_entries, hash_len, offset) in &descriptors {
                    tw.write_u32::<LittleEndian>(*domain)?;
                    tw.write_u32::<LittleEndian>(*num_entries)?;
                    tw.write_u8(*hash_len)?;
                    tw.write_u8(0)?;
                    tw.write_uint::<LittleEndian>(*offset, 6)?;
                }
                tw.flush()?;
            }
            (&*file).seek(SeekFrom::Start(8))?;
            (&*file).write_all(&file_size.to_le_bytes())?;
            file.sync_all()?;
        }
        out.persist(dst)
            .map_err(|e| IndexError::Io(e.error))?;
        debug!(dst = %dst.display(), buckets = self.num_buckets, "sealed compact index");
        // Spill shards go with the temp directory.
        self.tmp.close()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn seal_legacy(self, dst: &Path) -> Result<(), IndexError> {
        self.seal_with_magic(dst, &LEGACY_INDEX_MAGIC, false)
    }
}

/// Find a hash domain that maps the bucket's entries onto distinct slots,
/// pick a short-hash width with no collisions, and lay the records out in
/// slot order.
fn seal_bucket(
    entries: &[(u64, &[u8])],
    value_size: usize,
) -> Result<(u32, u8, Vec<u8>), IndexError> {
    let n = entries.len();
    if n == 0 {
        return Ok((0, DEFAULT_HASH_LEN, Vec::new()));
    }

    let mut hashes: Vec<u64> = entries.iter().map(|(h, _)| *h).collect();
    hashes.sort_unstable();
    for pair in hashes.windows(2) {
        if pair[0] == pair[1] {
            return Err(IndexError::DuplicateKey(pair[0]));
        }
    }

    let mut taken = vec![0u64; n];
    let mut generation = 0u64;
    let mut found = None;
    for domain in 0..=u32::MAX {
        generation += 1;
        let mut ok = true;
        for (hash, _) in entries {
            let slot = (domain_hash(domain, *hash) % n as u64) as usize;
            if taken[slot] == generation {
                ok = false;
                break;
            }
            taken[slot] = generation;
        }
        if ok {
            found = Some(domain);
            break;
        }
    }
    let domain = found.ok_or(IndexError::NoHashDomain(n as u32))?;

    // `domain_hash` is a bijection of the key hash, so distinct keys are
    // always separable at the full 8 bytes.
    let mut hash_len = DEFAULT_HASH_LEN;
    while hash_len < 8 {
        let mask = short_mask(hash_len);
        let mut shorts: Vec<u64> = entries
            .iter()
            .map(|(hash, _)| domain_hash(domain, *hash) & mask)
            .collect();
        shorts.sort_unstable();
        if shorts.windows(2).all(|pair| pair[0] != pair[1]) {
            break;
        }
        hash_len += 1;
    }

    let record_len = hash_len as usize + value_size;
    let mut records = vec![0u8; n * record_len];
    for (hash, value) in entries {
        let mixed = domain_hash(domain, *hash);
        let slot = (mixed % n as u64) as usize;
        let at = slot * record_len;
        records[at..at + hash_len as usize]
            .copy_from_slice(&mixed.to_le_bytes()[..hash_len as usize]);
        records[at + hash_len as usize..at + record_len].copy_from_slice(value);
    }
    Ok((domain, hash_len, records))
}

struct BucketDesc {
    domain: u32,
    num_entries: u32,
    hash_len: u8,
    offset: u64,
}

/// Read side: a mapped, sealed index. Lock-free after open.
pub struct CompactIndexReader {
    mmap: Mmap,
    num_buckets: u32,
    value_size: usize,
    table_offset: u64,
    metadata: Metadata,
    legacy: bool,
}

impl CompactIndexReader {
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let file = File::open(path)?;
        // Safety: sealed index files are immutable once renamed into place.
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < HEADER_LEN as usize {
            return Err(IndexError::CorruptIndex("file shorter than header".into()));
        }
        let magic: [u8; 8] = mmap[..8].try_into().expect("8 bytes");
        let legacy = match magic {
            INDEX_MAGIC => false,
            LEGACY_INDEX_MAGIC => true,
            other => return Err(IndexError::UnsupportedMagic(other)),
        };
        let mut cursor = Cursor::new(&mmap[8..]);
        let file_size = cursor.read_u64::<LittleEndian>()?;
        let num_buckets = cursor.read_u32::<LittleEndian>()?;
        let value_size = cursor.read_u16::<LittleEndian>()? as usize;
        let _pad = cursor.read_u16::<LittleEndian>()?;
        if file_size != mmap.len() as u64 {
            return Err(IndexError::CorruptIndex(format!(
                "header says {file_size} bytes, file has {}",
                mmap.len()
            )));
        }
        let mut pos = HEADER_LEN;
        let metadata = if legacy {
            Metadata::default()
        } else {
            let mut reader = &mmap[HEADER_LEN as usize..];
            let before = reader.len();
            let metadata = Metadata::read_from(&mut reader)?;
            pos += (before - reader.len()) as u64;
            metadata
        };
        let table_len = u64::from(num_buckets) * BUCKET_DESC_LEN;
        if pos + table_len > mmap.len() as u64 {
            return Err(IndexError::CorruptIndex("bucket table out of bounds".into()));
        }
        Ok(Self {
            mmap,
            num_buckets,
            value_size,
            table_offset: pos,
            metadata,
            legacy,
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    pub fn num_buckets(&self) -> u32 {
        self.num_buckets
    }

    /// Toggle OS read-ahead on the mapped region.
    pub fn prefetch(&self, enabled: bool) -> Result<(), IndexError> {
        #[cfg(unix)]
        {
            use memmap2::Advice;
            self.mmap
                .advise(if enabled { Advice::WillNeed } else { Advice::Normal })?;
        }
        let _ = enabled;
        Ok(())
    }

    fn bucket_desc(&self, bucket: u32) -> Result<BucketDesc, IndexError> {
        let at = (self.table_offset + u64::from(bucket) * BUCKET_DESC_LEN) as usize;
        let raw = self
            .mmap
            .get(at..at + BUCKET_DESC_LEN as usize)
            .ok_or_else(|| IndexError::CorruptIndex("bucket descriptor out of bounds".into()))?;
        Ok(BucketDesc {
            domain: u32::from_le_bytes(raw[0..4].try_into().expect("4 bytes")),
            num_entries: u32::from_le_bytes(raw[4..8].try_into().expect("4 bytes")),
            hash_len: raw[8],
            offset: LittleEndian::read_uint(&raw[10..16], 6),
        })
    }

    /// O(1) point lookup.
    pub fn get(&self, key: &[u8]) -> Result<&[u8], IndexError> {
        let hash = key_hash(key);
        let desc = self.bucket_desc(bucket_of(hash, self.num_buckets))?;
        if desc.num_entries == 0 {
            return Err(IndexError::NotFound);
        }
        let mixed = domain_hash(desc.domain, hash);
        let slot = mixed % u64::from(desc.num_entries);
        let record_len = desc.hash_len as usize + self.value_size;
        let at = (desc.offset + slot * record_len as u64) as usize;
        let record = self
            .mmap
            .get(at..at + record_len)
            .ok_or_else(|| IndexError::CorruptIndex("record out of bounds".into()))?;
        let short = &mixed.to_le_bytes()[..desc.hash_len as usize];
        if &record[..desc.hash_len as usize] != short {
            return Err(IndexError::NotFound);
        }
        Ok(&record[desc.hash_len as usize..])
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool, IndexError> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(IndexError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexKind, Network};
    use crate::test_utils::cid_of_raw;
    use quickcheck_macros::quickcheck;
    use std::collections::HashMap;

    fn meta() -> Metadata {
        Metadata::new(
            IndexKind::SlotToCid,
            3,
            &cid_of_raw(b"root"),
            Network::Mainnet,
        )
    }

    fn value_for(i: u64) -> [u8; 9] {
        let mut v = [0u8; 9];
        v[..8].copy_from_slice(&i.to_le_bytes());
        v[8] = (i % 251) as u8;
        v
    }

    #[test]
    fn build_and_look_up_thousands() {
        let tmp = tempfile::tempdir().unwrap();
        let dst = tmp.path().join("test.index");
        let n = 2000u64;

        let mut writer = CompactIndexWriter::new(tmp.path(), n, 9, meta()).unwrap();
        for i in 0..n {
            writer.put(format!("key-{i}").as_bytes(), &value_for(i)).unwrap();
        }
        writer.seal(&dst).unwrap();

        let reader = CompactIndexReader::open(&dst).unwrap();
        assert!(!reader.is_legacy());
        assert_eq!(reader.value_size(), 9);
        assert_eq!(reader.metadata().epoch().unwrap(), 3);
        for i in 0..n {
            let got = reader.get(format!("key-{i}").as_bytes()).unwrap();
            assert_eq!(got, &value_for(i));
        }
        for i in n..n + 500 {
            assert!(matches!(
                reader.get(format!("key-{i}").as_bytes()),
                Err(IndexError::NotFound)
            ));
        }
    }

    #[test]
    fn seal_removes_spill_dir_and_renames() {
        let tmp = tempfile::tempdir().unwrap();
        let dst = tmp.path().join("small.index");
        let mut writer = CompactIndexWriter::new(tmp.path(), 4, 2, meta()).unwrap();
        for (k, v) in [("a", [0, 1]), ("b", [2, 3]), ("c", [4, 5])] {
            writer.put(k.as_bytes(), &v).unwrap();
        }
        writer.seal(&dst).unwrap();

        assert!(dst.exists());
        // Only the sealed file remains in the temp parent.
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, ["small.index"]);
    }

    #[test]
    fn duplicate_keys_fail_the_seal() {
        let tmp = tempfile::tempdir().unwrap();
        let dst = tmp.path().join("dup.index");
        let mut writer = CompactIndexWriter::new(tmp.path(), 8, 1, meta()).unwrap();
        writer.put(b"same-key", &[1]).unwrap();
        writer.put(b"other", &[2]).unwrap();
        writer.put(b"same-key", &[3]).unwrap();
        assert!(matches!(
            writer.seal(&dst),
            Err(IndexError::DuplicateKey(_))
        ));
    }

    #[test]
    fn wrong_value_width_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut writer = CompactIndexWriter::new(tmp.path(), 8, 4, meta()).unwrap();
        assert!(matches!(
            writer.put(b"k", &[1, 2, 3]),
            Err(IndexError::WrongValueSize { expected: 4, got: 3 })
        ));
    }

    #[test]
    fn legacy_magic_reads_without_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let dst = tmp.path().join("legacy.index");
        let mut writer = CompactIndexWriter::new(tmp.path(), 16, 8, meta()).unwrap();
        for i in 0..16u64 {
            writer.put(&i.to_le_bytes(), &(i * 7).to_le_bytes()).unwrap();
        }
        writer.seal_legacy(&dst).unwrap();

        let reader = CompactIndexReader::open(&dst).unwrap();
        assert!(reader.is_legacy());
        assert!(matches!(
            reader.metadata().kind(),
            Err(IndexError::MetadataMissing(_))
        ));
        for i in 0..16u64 {
            assert_eq!(reader.get(&i.to_le_bytes()).unwrap(), &(i * 7).to_le_bytes());
        }
    }

    #[test]
    fn unknown_magic_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dst = tmp.path().join("bogus.index");
        std::fs::write(&dst, b"BOGUSMAGand then some more bytes to pass the length check").unwrap();
        assert!(matches!(
            CompactIndexReader::open(&dst),
            Err(IndexError::UnsupportedMagic(_))
        ));
    }

    #[test]
    fn underestimated_item_count_still_seals() {
        let tmp = tempfile::tempdir().unwrap();
        let dst = tmp.path().join("overload.index");
        let mut writer = CompactIndexWriter::new(tmp.path(), 90, 8, meta()).unwrap();
        for i in 0..100u64 {
            writer.put(&i.to_be_bytes(), &i.to_le_bytes()).unwrap();
        }
        writer.seal(&dst).unwrap();
        let reader = CompactIndexReader::open(&dst).unwrap();
        for i in 0..100u64 {
            assert_eq!(reader.get(&i.to_be_bytes()).unwrap(), &i.to_le_bytes());
        }
    }

    #[quickcheck]
    fn round_trips_arbitrary_key_sets(keys: HashMap<Vec<u8>, u32>) -> bool {
        let tmp = tempfile::tempdir().unwrap();
        let dst = tmp.path().join("qc.index");
        let mut writer =
            CompactIndexWriter::new(tmp.path(), keys.len() as u64, 4, meta()).unwrap();
        for (key, value) in &keys {
            writer.put(key, &value.to_le_bytes()).unwrap();
        }
        writer.seal(&dst).unwrap();
        let reader = CompactIndexReader::open(&dst).unwrap();
        keys.iter()
            .all(|(key, value)| reader.get(key).unwrap() == value.to_le_bytes())
    }
}
