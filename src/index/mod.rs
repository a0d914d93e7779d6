// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Sealed on-disk indexes.
//!
//! Four indexes are built per epoch, all sharing the compact bucketed
//! layout of [`compact`] except the signature-existence filter, which is a
//! prefix-bucketed sorted hash list. Sealed files are self-describing: an
//! embedded metadata block records the index kind, epoch, root CID, and
//! network, and `open` refuses a file of the wrong kind.

pub mod compact;

mod cid_to_offset_and_size;
mod sig_exists;
mod sig_to_cid;
mod slot_to_cid;

pub use cid_to_offset_and_size::{
    CidToOffsetAndSizeReader, CidToOffsetAndSizeWriter, OffsetAndSize,
};
pub use sig_exists::{SigExistsReader, SigExistsWriter};
pub use sig_to_cid::{SigToCidReader, SigToCidWriter};
pub use slot_to_cid::{SlotToCidReader, SlotToCidWriter};

use cid::Cid;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Magic of the current sealed-index format.
pub const INDEX_MAGIC: [u8; 8] = *b"SVNIDX01";
/// Magic of the deprecated format: same layout, no metadata block.
pub const LEGACY_INDEX_MAGIC: [u8; 8] = *b"rdcecidx";
/// Magic of the signature-existence filter.
pub const SIG_EXISTS_MAGIC: [u8; 8] = *b"SVNSIGX1";

/// The four index kinds, as recorded in file metadata and file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    CidToOffsetAndSize,
    SlotToCid,
    SigToCid,
    SigExists,
}

impl IndexKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            IndexKind::CidToOffsetAndSize => "cid-to-offset-and-size",
            IndexKind::SlotToCid => "slot-to-cid",
            IndexKind::SigToCid => "sig-to-cid",
            IndexKind::SigExists => "sig-exists",
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cid-to-offset-and-size" => Ok(IndexKind::CidToOffsetAndSize),
            "slot-to-cid" => Ok(IndexKind::SlotToCid),
            "sig-to-cid" => Ok(IndexKind::SigToCid),
            "sig-exists" => Ok(IndexKind::SigExists),
            other => Err(format!("unknown index kind `{other}`")),
        }
    }
}

/// The network an epoch was archived from; part of index naming and
/// metadata so a devnet index cannot be served as mainnet.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Devnet,
}

impl Network {
    pub const fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Devnet => "devnet",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "devnet" => Ok(Network::Devnet),
            other => Err(format!("unknown network `{other}`")),
        }
    }
}

/// Single-byte metadata keys.
pub mod meta_key {
    pub const KIND: u8 = 1;
    pub const EPOCH: u8 = 2;
    pub const ROOT_CID: u8 = 3;
    pub const NETWORK: u8 = 4;
}

/// Index error
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("key not found")]
    NotFound,
    #[error("duplicate key in bucket (key hash {0:#018x})")]
    DuplicateKey(u64),
    #[error("offset {0} does not fit in 48 bits")]
    OffsetOverflow(u64),
    #[error("size {0} does not fit in 24 bits")]
    SizeOverflow(u64),
    #[error("an index holds at most 2^31 items, got {0}")]
    TooManyItems(u64),
    #[error("no 32-bit hash domain seals a bucket of {0} entries")]
    NoHashDomain(u32),
    #[error("writer is sealed")]
    Sealed,
    #[error("value is {got} bytes, this index stores {expected}-byte values")]
    WrongValueSize { expected: usize, got: usize },
    #[error("unsupported index magic {0:02x?}")]
    UnsupportedMagic([u8; 8]),
    #[error("corrupt index: {0}")]
    CorruptIndex(String),
    #[error("index metadata key {0} missing")]
    MetadataMissing(u8),
    #[error("metadata mismatch: {0}")]
    MetadataMismatch(String),
    #[error("index is `{got}`, expected `{expected}`")]
    WrongIndexKind { expected: IndexKind, got: String },
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// The embedded key→bytes metadata block of a sealed index.
///
/// Encoding: `count:u8 ‖ (key:u8 ‖ len:u8 ‖ bytes[len])*`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pairs: Vec<(u8, Vec<u8>)>,
}

impl Metadata {
    pub fn new(kind: IndexKind, epoch: u64, root_cid: &Cid, network: Network) -> Self {
        let mut meta = Metadata::default();
        meta.set(meta_key::KIND, kind.as_str().as_bytes().to_vec());
        meta.set(meta_key::EPOCH, epoch.to_le_bytes().to_vec());
        meta.set(meta_key::ROOT_CID, root_cid.to_bytes());
        meta.set(meta_key::NETWORK, network.as_str().as_bytes().to_vec());
        meta
    }

    pub fn set(&mut self, key: u8, value: Vec<u8>) {
        assert!(value.len() <= u8::MAX as usize, "metadata value too long");
        if let Some(pair) = self.pairs.iter_mut().find(|(k, _)| *k == key) {
            pair.1 = value;
        } else {
            self.pairs.push((key, value));
        }
    }

    pub fn get(&self, key: u8) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_slice())
    }

    fn require(&self, key: u8) -> Result<&[u8], IndexError> {
        self.get(key).ok_or(IndexError::MetadataMissing(key))
    }

    pub fn kind(&self) -> Result<IndexKind, IndexError> {
        let raw = self.require(meta_key::KIND)?;
        let s = std::str::from_utf8(raw)
            .map_err(|_| IndexError::CorruptIndex("kind metadata is not utf-8".into()))?;
        s.parse().map_err(IndexError::CorruptIndex)
    }

    pub fn epoch(&self) -> Result<u64, IndexError> {
        let raw = self.require(meta_key::EPOCH)?;
        let bytes: [u8; 8] = raw
            .try_into()
            .map_err(|_| IndexError::CorruptIndex("epoch metadata is not 8 bytes".into()))?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn root_cid(&self) -> Result<Cid, IndexError> {
        let raw = self.require(meta_key::ROOT_CID)?;
        Cid::try_from(raw).map_err(|e| IndexError::CorruptIndex(format!("root cid: {e}")))
    }

    pub fn network(&self) -> Result<Network, IndexError> {
        let raw = self.require(meta_key::NETWORK)?;
        let s = std::str::from_utf8(raw)
            .map_err(|_| IndexError::CorruptIndex("network metadata is not utf-8".into()))?;
        s.parse().map_err(IndexError::CorruptIndex)
    }

    pub fn encoded_len(&self) -> usize {
        1 + self.pairs.iter().map(|(_, v)| 2 + v.len()).sum::<usize>()
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&[self.pairs.len() as u8])?;
        for (key, value) in &self.pairs {
            out.write_all(&[*key, value.len() as u8])?;
            out.write_all(value)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(input: &mut R) -> Result<Self, IndexError> {
        let mut count = [0u8; 1];
        input.read_exact(&mut count)?;
        let mut pairs = Vec::with_capacity(count[0] as usize);
        for _ in 0..count[0] {
            let mut head = [0u8; 2];
            input.read_exact(&mut head)?;
            let mut value = vec![0u8; head[1] as usize];
            input.read_exact(&mut value)?;
            pairs.push((head[0], value));
        }
        Ok(Self { pairs })
    }
}

/// `epoch-{N}-{root_cid}-{net}-{kind}.index`
pub fn index_file_name(epoch: u64, root_cid: &Cid, network: Network, kind: IndexKind) -> String {
    format!("epoch-{epoch}-{root_cid}-{network}-{kind}.index")
}

/// Locate the sealed index of `kind` for some epoch in `dir` by its file
/// name suffix.
pub fn find_index_file(dir: &Path, kind: IndexKind) -> Result<PathBuf, IndexError> {
    let suffix = format!("-{kind}.index");
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str())
            && name.starts_with("epoch-")
            && name.ends_with(&suffix)
        {
            return Ok(path);
        }
    }
    Err(IndexError::CorruptIndex(format!(
        "no {kind} index found in {}",
        dir.display()
    )))
}

/// Open-time kind validation shared by the typed readers. Legacy files
/// carry no metadata and are accepted as-is.
pub(crate) fn check_kind(metadata: &Metadata, legacy: bool, expected: IndexKind) -> Result<(), IndexError> {
    if legacy {
        return Ok(());
    }
    match metadata.kind() {
        Ok(kind) if kind == expected => Ok(()),
        Ok(kind) => Err(IndexError::WrongIndexKind {
            expected,
            got: kind.to_string(),
        }),
        Err(IndexError::CorruptIndex(s)) => Err(IndexError::WrongIndexKind { expected, got: s }),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cid_of_raw;

    #[test]
    fn metadata_round_trip() {
        let root = cid_of_raw(b"epoch root");
        let meta = Metadata::new(IndexKind::SlotToCid, 512, &root, Network::Testnet);

        let mut buf = Vec::new();
        meta.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), meta.encoded_len());

        let parsed = Metadata::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(parsed.kind().unwrap(), IndexKind::SlotToCid);
        assert_eq!(parsed.epoch().unwrap(), 512);
        assert_eq!(parsed.root_cid().unwrap(), root);
        assert_eq!(parsed.network().unwrap(), Network::Testnet);
    }

    #[test]
    fn missing_key_is_reported() {
        let meta = Metadata::default();
        assert!(matches!(
            meta.epoch(),
            Err(IndexError::MetadataMissing(meta_key::EPOCH))
        ));
    }

    #[test]
    fn file_names_follow_the_scheme() {
        let root = cid_of_raw(b"root");
        let name = index_file_name(132, &root, Network::Mainnet, IndexKind::SigToCid);
        assert_eq!(name, format!("epoch-132-{root}-mainnet-sig-to-cid.index"));
    }

    #[test]
    fn kind_check_rejects_mismatch() {
        let root = cid_of_raw(b"root");
        let meta = Metadata::new(IndexKind::SigToCid, 1, &root, Network::Mainnet);
        assert!(check_kind(&meta, false, IndexKind::SigToCid).is_ok());
        assert!(matches!(
            check_kind(&meta, false, IndexKind::SlotToCid),
            Err(IndexError::WrongIndexKind { .. })
        ));
        // Legacy files have no metadata to check.
        assert!(check_kind(&Metadata::default(), true, IndexKind::SlotToCid).is_ok());
    }
}
