// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The seven DAG node types and their CBOR codecs.
//!
//! All nodes use the tuple representation: a definite-length array with the
//! kind discriminant first. The decoders are hand-written sequence visitors
//! because the wire tolerates two shapes derives cannot express: numeric
//! fields arrive as either unsigned or (non-negative) negative-major
//! integers depending on the producer, and optional trailing fields may be
//! encoded as CBOR null or simply left off the array.

use super::{Kind, NodeError, cbor_err, expect_kind};
use cid::Cid;
use serde::de::{self, Deserialize, Deserializer, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeTuple, Serializer};
use serde_bytes::ByteBuf;
use std::fmt;

/// u64 field that tolerates a non-negative signed encoding.
struct FlexU64(u64);

impl<'de> Deserialize<'de> for FlexU64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl Visitor<'_> for V {
            type Value = FlexU64;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<FlexU64, E> {
                Ok(FlexU64(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<FlexU64, E> {
                u64::try_from(v)
                    .map(FlexU64)
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
            }
        }
        deserializer.deserialize_any(V)
    }
}

/// u64 field that reinterprets a signed encoding bit-for-bit. Legacy
/// producers emitted checksums through a signed integer path.
struct BitsU64(u64);

impl<'de> Deserialize<'de> for BitsU64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl Visitor<'_> for V {
            type Value = BitsU64;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<BitsU64, E> {
                Ok(BitsU64(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<BitsU64, E> {
                Ok(BitsU64(v as u64))
            }
        }
        deserializer.deserialize_any(V)
    }
}

/// i64 field that tolerates an unsigned encoding within range.
struct FlexI64(i64);

impl<'de> Deserialize<'de> for FlexI64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl Visitor<'_> for V {
            type Value = FlexI64;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<FlexI64, E> {
                Ok(FlexI64(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<FlexI64, E> {
                i64::try_from(v)
                    .map(FlexI64)
                    .map_err(|_| E::invalid_value(de::Unexpected::Unsigned(v), &self))
            }
        }
        deserializer.deserialize_any(V)
    }
}

fn required<'de, A, T>(seq: &mut A, index: usize, what: &'static str) -> Result<T, A::Error>
where
    A: SeqAccess<'de>,
    T: Deserialize<'de>,
{
    seq.next_element::<T>()?
        .ok_or_else(|| de::Error::invalid_length(index, &what))
}

/// Optional field: absent array slot and CBOR null both map to `None`.
fn optional<'de, A, T>(seq: &mut A) -> Result<Option<T>, A::Error>
where
    A: SeqAccess<'de>,
    T: Deserialize<'de>,
{
    Ok(seq.next_element::<Option<T>>()?.flatten())
}

fn check_kind<E: de::Error>(got: u64, want: Kind) -> Result<(), E> {
    if got != want as u64 {
        return Err(E::custom(format_args!(
            "wrong kind discriminant {got} for a {want} node"
        )));
    }
    Ok(())
}

macro_rules! impl_node_codec {
    ($ty:ident, $kind:expr) => {
        impl $ty {
            /// Strict decode: the section must hold this node kind.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, NodeError> {
                expect_kind(bytes, $kind)?;
                serde_ipld_dagcbor::from_slice(bytes).map_err(cbor_err)
            }

            pub fn to_vec(&self) -> Result<Vec<u8>, NodeError> {
                serde_ipld_dagcbor::to_vec(self).map_err(cbor_err)
            }

            pub const fn kind() -> Kind {
                $kind
            }
        }
    };
}

/// A chunk of a larger logical payload. `next` links successor frames;
/// reassembly orders the flattened chain by `index`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub hash: Option<u64>,
    pub index: Option<u64>,
    pub total: Option<u64>,
    pub data: Vec<u8>,
    pub next: Option<Vec<Cid>>,
}

impl_node_codec!(DataFrame, Kind::DataFrame);

impl DataFrame {
    /// Number of frames the chain claims to have; a frame without `total`
    /// stands alone.
    pub fn total_frames(&self) -> u64 {
        self.total.unwrap_or(1)
    }
}

impl Serialize for DataFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(6)?;
        tup.serialize_element(&(Kind::DataFrame as u64))?;
        tup.serialize_element(&self.hash)?;
        tup.serialize_element(&self.index)?;
        tup.serialize_element(&self.total)?;
        tup.serialize_element(serde_bytes::Bytes::new(&self.data))?;
        tup.serialize_element(&self.next)?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for DataFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = DataFrame;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a dataframe tuple")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<DataFrame, A::Error> {
                let kind: FlexU64 = required(&mut seq, 0, "kind")?;
                check_kind(kind.0, Kind::DataFrame)?;
                let hash = optional::<_, BitsU64>(&mut seq)?.map(|v| v.0);
                let index = optional::<_, FlexU64>(&mut seq)?.map(|v| v.0);
                let total = optional::<_, FlexU64>(&mut seq)?.map(|v| v.0);
                let data: ByteBuf = required(&mut seq, 4, "data")?;
                let next = optional::<_, Vec<Cid>>(&mut seq)?;
                Ok(DataFrame {
                    hash,
                    index,
                    total,
                    data: data.into_vec(),
                    next,
                })
            }
        }
        deserializer.deserialize_seq(V)
    }
}

/// A single executed transaction, with its wire bytes and status metadata
/// carried as (possibly multipart) dataframes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub data: DataFrame,
    pub metadata: DataFrame,
    pub slot: u64,
    /// Position within the block, when the producer recorded it.
    pub index: Option<u64>,
}

impl_node_codec!(Transaction, Kind::Transaction);

impl Serialize for Transaction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(5)?;
        tup.serialize_element(&(Kind::Transaction as u64))?;
        tup.serialize_element(&self.data)?;
        tup.serialize_element(&self.metadata)?;
        tup.serialize_element(&self.slot)?;
        tup.serialize_element(&self.index)?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Transaction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = Transaction;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a transaction tuple")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Transaction, A::Error> {
                let kind: FlexU64 = required(&mut seq, 0, "kind")?;
                check_kind(kind.0, Kind::Transaction)?;
                let data: DataFrame = required(&mut seq, 1, "data")?;
                let metadata: DataFrame = required(&mut seq, 2, "metadata")?;
                let slot: FlexU64 = required(&mut seq, 3, "slot")?;
                let index = optional::<_, FlexU64>(&mut seq)?.map(|v| v.0);
                Ok(Transaction {
                    data,
                    metadata,
                    slot: slot.0,
                    index,
                })
            }
        }
        deserializer.deserialize_seq(V)
    }
}

/// A proof-of-history entry and the transactions it attests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Entry {
    pub num_hashes: u64,
    pub hash: [u8; 32],
    pub transactions: Vec<Cid>,
}

impl_node_codec!(Entry, Kind::Entry);

impl Serialize for Entry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(4)?;
        tup.serialize_element(&(Kind::Entry as u64))?;
        tup.serialize_element(&self.num_hashes)?;
        tup.serialize_element(serde_bytes::Bytes::new(&self.hash))?;
        tup.serialize_element(&self.transactions)?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Entry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = Entry;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an entry tuple")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Entry, A::Error> {
                let kind: FlexU64 = required(&mut seq, 0, "kind")?;
                check_kind(kind.0, Kind::Entry)?;
                let num_hashes: FlexU64 = required(&mut seq, 1, "num_hashes")?;
                let hash: ByteBuf = required(&mut seq, 2, "hash")?;
                let hash: [u8; 32] = hash.as_slice().try_into().map_err(|_| {
                    de::Error::invalid_length(hash.len(), &"a 32-byte entry hash")
                })?;
                let transactions: Vec<Cid> = required(&mut seq, 3, "transactions")?;
                Ok(Entry {
                    num_hashes: num_hashes.0,
                    hash,
                    transactions,
                })
            }
        }
        deserializer.deserialize_seq(V)
    }
}

/// Shred boundary bookkeeping carried on blocks. Producers use -1 for
/// "no boundary", hence the signed fields.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Shredding {
    pub entry_end_idx: i64,
    pub shred_end_idx: i64,
}

impl Serialize for Shredding {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(2)?;
        tup.serialize_element(&self.entry_end_idx)?;
        tup.serialize_element(&self.shred_end_idx)?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Shredding {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = Shredding;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a shredding pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Shredding, A::Error> {
                let entry_end_idx: FlexI64 = required(&mut seq, 0, "entry_end_idx")?;
                let shred_end_idx: FlexI64 = required(&mut seq, 1, "shred_end_idx")?;
                Ok(Shredding {
                    entry_end_idx: entry_end_idx.0,
                    shred_end_idx: shred_end_idx.0,
                })
            }
        }
        deserializer.deserialize_seq(V)
    }
}

/// Block metadata tuple.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SlotMeta {
    pub parent_slot: u64,
    pub blocktime: i64,
    pub block_height: Option<u64>,
}

impl Serialize for SlotMeta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(3)?;
        tup.serialize_element(&self.parent_slot)?;
        tup.serialize_element(&self.blocktime)?;
        tup.serialize_element(&self.block_height)?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for SlotMeta {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = SlotMeta;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a slot meta tuple")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<SlotMeta, A::Error> {
                let parent_slot: FlexU64 = required(&mut seq, 0, "parent_slot")?;
                let blocktime = optional::<_, FlexI64>(&mut seq)?.map_or(0, |v| v.0);
                let block_height = optional::<_, FlexU64>(&mut seq)?.map(|v| v.0);
                Ok(SlotMeta {
                    parent_slot: parent_slot.0,
                    blocktime,
                    block_height,
                })
            }
        }
        deserializer.deserialize_seq(V)
    }
}

/// One produced slot: its entries, shredding layout, metadata, and a link to
/// the slot's rewards payload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Block {
    pub slot: u64,
    pub shredding: Vec<Shredding>,
    pub entries: Vec<Cid>,
    pub meta: SlotMeta,
    pub rewards: Cid,
}

impl_node_codec!(Block, Kind::Block);

impl Serialize for Block {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(6)?;
        tup.serialize_element(&(Kind::Block as u64))?;
        tup.serialize_element(&self.slot)?;
        tup.serialize_element(&self.shredding)?;
        tup.serialize_element(&self.entries)?;
        tup.serialize_element(&self.meta)?;
        tup.serialize_element(&self.rewards)?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Block {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = Block;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a block tuple")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Block, A::Error> {
                let kind: FlexU64 = required(&mut seq, 0, "kind")?;
                check_kind(kind.0, Kind::Block)?;
                let slot: FlexU64 = required(&mut seq, 1, "slot")?;
                let shredding: Vec<Shredding> = required(&mut seq, 2, "shredding")?;
                let entries: Vec<Cid> = required(&mut seq, 3, "entries")?;
                let meta: SlotMeta = required(&mut seq, 4, "meta")?;
                let rewards: Cid = required(&mut seq, 5, "rewards")?;
                Ok(Block {
                    slot: slot.0,
                    shredding,
                    entries,
                    meta,
                    rewards,
                })
            }
        }
        deserializer.deserialize_seq(V)
    }
}

/// A contiguous range of a subset of the epoch's blocks.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Subset {
    pub first: u64,
    pub last: u64,
    pub blocks: Vec<Cid>,
}

impl_node_codec!(Subset, Kind::Subset);

impl Serialize for Subset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(4)?;
        tup.serialize_element(&(Kind::Subset as u64))?;
        tup.serialize_element(&self.first)?;
        tup.serialize_element(&self.last)?;
        tup.serialize_element(&self.blocks)?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Subset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = Subset;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a subset tuple")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Subset, A::Error> {
                let kind: FlexU64 = required(&mut seq, 0, "kind")?;
                check_kind(kind.0, Kind::Subset)?;
                let first: FlexU64 = required(&mut seq, 1, "first")?;
                let last: FlexU64 = required(&mut seq, 2, "last")?;
                let blocks: Vec<Cid> = required(&mut seq, 3, "blocks")?;
                Ok(Subset {
                    first: first.0,
                    last: last.0,
                    blocks,
                })
            }
        }
        deserializer.deserialize_seq(V)
    }
}

/// The DAG root: one epoch and its subsets.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Epoch {
    pub epoch: u64,
    pub subsets: Vec<Cid>,
}

impl_node_codec!(Epoch, Kind::Epoch);

impl Serialize for Epoch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(3)?;
        tup.serialize_element(&(Kind::Epoch as u64))?;
        tup.serialize_element(&self.epoch)?;
        tup.serialize_element(&self.subsets)?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Epoch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = Epoch;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an epoch tuple")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Epoch, A::Error> {
                let kind: FlexU64 = required(&mut seq, 0, "kind")?;
                check_kind(kind.0, Kind::Epoch)?;
                let epoch: FlexU64 = required(&mut seq, 1, "epoch")?;
                let subsets: Vec<Cid> = required(&mut seq, 2, "subsets")?;
                Ok(Epoch {
                    epoch: epoch.0,
                    subsets,
                })
            }
        }
        deserializer.deserialize_seq(V)
    }
}

/// Block rewards payload, carried as a (possibly multipart) dataframe.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Rewards {
    pub slot: u64,
    pub data: DataFrame,
}

impl_node_codec!(Rewards, Kind::Rewards);

impl Serialize for Rewards {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(3)?;
        tup.serialize_element(&(Kind::Rewards as u64))?;
        tup.serialize_element(&self.slot)?;
        tup.serialize_element(&self.data)?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Rewards {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = Rewards;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a rewards tuple")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Rewards, A::Error> {
                let kind: FlexU64 = required(&mut seq, 0, "kind")?;
                check_kind(kind.0, Kind::Rewards)?;
                let slot: FlexU64 = required(&mut seq, 1, "slot")?;
                let data: DataFrame = required(&mut seq, 2, "data")?;
                Ok(Rewards { slot: slot.0, data })
            }
        }
        deserializer.deserialize_seq(V)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cid_of_raw;
    use quickcheck_macros::quickcheck;

    fn frame(data: &[u8]) -> DataFrame {
        DataFrame {
            data: data.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn dataframe_round_trip() {
        let df = DataFrame {
            hash: Some(0xdead_beef_dead_beef),
            index: Some(0),
            total: Some(3),
            data: b"chunk zero".to_vec(),
            next: Some(vec![cid_of_raw(b"f1"), cid_of_raw(b"f2")]),
        };
        let bytes = df.to_vec().unwrap();
        assert_eq!(Kind::of(&bytes).unwrap(), Kind::DataFrame);
        assert_eq!(DataFrame::from_bytes(&bytes).unwrap(), df);
    }

    #[test]
    fn transaction_round_trip() {
        let tx = Transaction {
            data: frame(b"wire bytes"),
            metadata: frame(b"status"),
            slot: 431_996,
            index: Some(7),
        };
        let bytes = tx.to_vec().unwrap();
        assert_eq!(Kind::of(&bytes).unwrap(), Kind::Transaction);
        assert_eq!(Transaction::from_bytes(&bytes).unwrap(), tx);
    }

    #[test]
    fn entry_round_trip() {
        let entry = Entry {
            num_hashes: 12_500,
            hash: [0xab; 32],
            transactions: vec![cid_of_raw(b"tx0"), cid_of_raw(b"tx1")],
        };
        let bytes = entry.to_vec().unwrap();
        assert_eq!(Entry::from_bytes(&bytes).unwrap(), entry);
    }

    #[test]
    fn block_round_trip() {
        let block = Block {
            slot: 432_001,
            shredding: vec![
                Shredding { entry_end_idx: 3, shred_end_idx: -1 },
                Shredding { entry_end_idx: 9, shred_end_idx: 22 },
            ],
            entries: vec![cid_of_raw(b"e0")],
            meta: SlotMeta {
                parent_slot: 431_999,
                blocktime: 1_697_000_000,
                block_height: Some(400_000_000),
            },
            rewards: cid_of_raw(b"rewards"),
        };
        let bytes = block.to_vec().unwrap();
        assert_eq!(Kind::of(&bytes).unwrap(), Kind::Block);
        assert_eq!(Block::from_bytes(&bytes).unwrap(), block);
    }

    #[test]
    fn subset_epoch_rewards_round_trip() {
        let subset = Subset {
            first: 0,
            last: 431_999,
            blocks: vec![cid_of_raw(b"b")],
        };
        assert_eq!(Subset::from_bytes(&subset.to_vec().unwrap()).unwrap(), subset);

        let epoch = Epoch {
            epoch: 512,
            subsets: vec![cid_of_raw(b"s")],
        };
        assert_eq!(Epoch::from_bytes(&epoch.to_vec().unwrap()).unwrap(), epoch);

        let rewards = Rewards {
            slot: 5,
            data: frame(b"zstd blob"),
        };
        assert_eq!(Rewards::from_bytes(&rewards.to_vec().unwrap()).unwrap(), rewards);
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let bytes = frame(b"x").to_vec().unwrap();
        assert!(matches!(
            Transaction::from_bytes(&bytes),
            Err(NodeError::UnexpectedKind {
                expected: Kind::Transaction,
                found: Kind::DataFrame,
            })
        ));
    }

    #[test]
    fn optional_fields_accept_null_and_absent() {
        // Hand-built 6-tuple with explicit nulls for hash/index/total/next.
        let with_nulls = DataFrame {
            hash: None,
            index: None,
            total: None,
            data: b"solo".to_vec(),
            next: None,
        };
        let bytes = with_nulls.to_vec().unwrap();
        assert_eq!(DataFrame::from_bytes(&bytes).unwrap(), with_nulls);

        // 5-tuple with the trailing `next` slot left off entirely.
        let mut short = vec![0x85u8, 0x06, 0xf6, 0xf6, 0xf6];
        short.push(0x44); // bytes(4)
        short.extend_from_slice(b"solo");
        let decoded = DataFrame::from_bytes(&short).unwrap();
        assert_eq!(decoded, with_nulls);
    }

    #[test]
    fn numeric_fields_accept_signed_encodings() {
        // [6, -2, null, null, h'', null]: legacy signed hash reinterprets
        // bit-for-bit.
        let bytes = vec![0x86u8, 0x06, 0x21, 0xf6, 0xf6, 0x40, 0xf6];
        let decoded = DataFrame::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.hash, Some((-2i64) as u64));

        // A signed slot must stay in range: [0, df, df, -5, null] fails.
        let df = frame(b"d").to_vec().unwrap();
        let mut tx = vec![0x85u8, 0x00];
        tx.extend_from_slice(&df);
        tx.extend_from_slice(&df);
        tx.push(0x24); // -5
        tx.push(0xf6);
        assert!(matches!(Transaction::from_bytes(&tx), Err(NodeError::Cbor(_))));
    }

    #[quickcheck]
    fn dataframe_codec_is_total(data: Vec<u8>, hash: Option<u64>, index: Option<u64>) -> bool {
        let df = DataFrame {
            hash,
            index,
            total: index.map(|i| i + 1),
            data,
            next: None,
        };
        DataFrame::from_bytes(&df.to_vec().unwrap()).unwrap() == df
    }
}
