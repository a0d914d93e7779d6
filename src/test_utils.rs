// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-memory CAR fixtures for tests: a tiny but well-formed epoch DAG with
//! the producer's node ordering (children first, block last, subset and
//! epoch at the tail).

use crate::node::{
    Block, DataFrame, Entry, Epoch, Kind, Rewards, Shredding, SlotMeta, Subset, Transaction,
    checksum_crc64,
};
use cid::Cid;
use integer_encoding::VarIntWriter;
use multihash_codetable::{Code, MultihashDigest};
use serde::Serialize;

const DAG_CBOR: u64 = 0x71;
const RAW: u64 = 0x55;

/// CID of arbitrary raw bytes; handy for synthetic links.
pub fn cid_of_raw(data: &[u8]) -> Cid {
    Cid::new_v1(RAW, Code::Sha2_256.digest(data))
}

/// CID of an encoded dag-cbor node.
pub fn cid_of_node(encoded: &[u8]) -> Cid {
    Cid::new_v1(DAG_CBOR, Code::Sha2_256.digest(encoded))
}

pub fn encode<T: Serialize>(node: &T) -> Vec<u8> {
    serde_ipld_dagcbor::to_vec(node).expect("fixture nodes encode")
}

/// Append `uvarint(len) ‖ payload` to `out`.
pub fn write_section(out: &mut Vec<u8>, payload: &[u8]) {
    out.write_varint(payload.len() as u64).expect("vec write");
    out.extend_from_slice(payload);
}

/// Serialize a complete CARv1 stream.
pub fn write_car(roots: &[Cid], sections: &[(Cid, Vec<u8>)]) -> Vec<u8> {
    let header = crate::car::CarHeader::new(roots.to_vec(), 1);
    let mut out = Vec::new();
    write_section(&mut out, &encode(&header));
    for (cid, data) in sections {
        let mut body = cid.to_bytes();
        body.extend_from_slice(data);
        write_section(&mut out, &body);
    }
    out
}

/// Solana wire-format transaction prefix: shortvec signature count followed
/// by the signatures, then an opaque message body.
pub fn wire_transaction(signature: [u8; 64], body: &[u8]) -> Vec<u8> {
    let mut out = vec![1u8];
    out.extend_from_slice(&signature);
    out.extend_from_slice(body);
    out
}

#[derive(Debug, Clone)]
pub struct FixtureNode {
    pub cid: Cid,
    pub kind: Kind,
    pub encoded: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FixtureBlock {
    pub cid: Cid,
    pub slot: u64,
    pub parent_slot: u64,
    /// Children CIDs in CAR order (the block itself excluded).
    pub children: Vec<Cid>,
    pub tx_cids: Vec<Cid>,
    pub tx_signatures: Vec<[u8; 64]>,
}

#[derive(Debug, Clone)]
pub struct Fixture {
    pub car: Vec<u8>,
    /// Every node in CAR order.
    pub nodes: Vec<FixtureNode>,
    pub blocks: Vec<FixtureBlock>,
    pub root: Cid,
    pub epoch: u64,
    /// The fully reassembled multipart metadata payload of
    /// [`multipart_slot`](Self::multipart_slot)'s transaction.
    pub multipart_payload: Vec<u8>,
    pub multipart_slot: u64,
}

impl Fixture {
    pub fn node(&self, cid: &Cid) -> &FixtureNode {
        self.nodes
            .iter()
            .find(|n| n.cid == *cid)
            .expect("fixture node")
    }

    pub fn block_by_slot(&self, slot: u64) -> &FixtureBlock {
        self.blocks
            .iter()
            .find(|b| b.slot == slot)
            .expect("fixture block")
    }
}

fn sig_for(slot: u64, index: u8) -> [u8; 64] {
    let mut sig = [0u8; 64];
    sig[0] = index;
    sig[8..16].copy_from_slice(&slot.to_le_bytes());
    for (i, b) in sig.iter_mut().enumerate().skip(16) {
        *b = (i as u8) ^ (slot as u8);
    }
    sig
}

fn inline_frame(data: &[u8]) -> DataFrame {
    DataFrame {
        hash: Some(checksum_crc64(data)),
        index: None,
        total: None,
        data: data.to_vec(),
        next: None,
    }
}

/// Three blocks in slots 10, 12, 15 of epoch 0, one entry and one
/// transaction each; slot 12's transaction carries multipart metadata split
/// over three frames. Tail is subset then epoch, the epoch node being the
/// single root.
pub fn tiny_epoch() -> Fixture {
    let mut nodes: Vec<FixtureNode> = Vec::new();
    let mut blocks: Vec<FixtureBlock> = Vec::new();
    let mut push = |kind: Kind, encoded: Vec<u8>| -> Cid {
        let cid = cid_of_node(&encoded);
        nodes.push(FixtureNode { cid, kind, encoded });
        cid
    };

    let multipart_payload =
        b"transaction status metadata large enough to be split across three dataframes".to_vec();
    let multipart_slot = 12;

    let slots: [(u64, u64); 3] = [(10, 9), (12, 10), (15, 12)];
    let mut block_cids = Vec::new();
    for (slot, parent_slot) in slots {
        let mut children = Vec::new();

        // Transaction metadata: inline for most slots, a three-frame chain
        // for the multipart slot.
        let metadata = if slot == multipart_slot {
            let chunk = multipart_payload.len().div_ceil(3);
            let parts: Vec<&[u8]> = multipart_payload.chunks(chunk).collect();
            let f1 = DataFrame {
                hash: None,
                index: Some(1),
                total: Some(3),
                data: parts[1].to_vec(),
                next: None,
            };
            let f1_cid = push(Kind::DataFrame, encode(&f1));
            children.push(f1_cid);
            let f2 = DataFrame {
                hash: None,
                index: Some(2),
                total: Some(3),
                data: parts[2].to_vec(),
                next: None,
            };
            let f2_cid = push(Kind::DataFrame, encode(&f2));
            children.push(f2_cid);
            DataFrame {
                hash: Some(checksum_crc64(&multipart_payload)),
                index: Some(0),
                total: Some(3),
                data: parts[0].to_vec(),
                next: Some(vec![f1_cid, f2_cid]),
            }
        } else {
            inline_frame(format!("meta for slot {slot}").as_bytes())
        };

        let signature = sig_for(slot, 0);
        let tx = Transaction {
            data: inline_frame(&wire_transaction(
                signature,
                format!("message body {slot}").as_bytes(),
            )),
            metadata,
            slot,
            index: Some(0),
        };
        let tx_cid = push(Kind::Transaction, encode(&tx));
        children.push(tx_cid);

        let entry = Entry {
            num_hashes: 12_500,
            hash: [slot as u8; 32],
            transactions: vec![tx_cid],
        };
        let entry_cid = push(Kind::Entry, encode(&entry));
        children.push(entry_cid);

        let rewards = Rewards {
            slot,
            data: inline_frame(format!("rewards {slot}").as_bytes()),
        };
        let rewards_cid = push(Kind::Rewards, encode(&rewards));
        children.push(rewards_cid);

        let block = Block {
            slot,
            shredding: vec![Shredding {
                entry_end_idx: 0,
                shred_end_idx: -1,
            }],
            entries: vec![entry_cid],
            meta: SlotMeta {
                parent_slot,
                blocktime: 1_690_000_000 + slot as i64,
                block_height: Some(slot + 100),
            },
            rewards: rewards_cid,
        };
        let block_cid = push(Kind::Block, encode(&block));
        block_cids.push(block_cid);
        blocks.push(FixtureBlock {
            cid: block_cid,
            slot,
            parent_slot,
            children,
            tx_cids: vec![tx_cid],
            tx_signatures: vec![signature],
        });
    }

    let subset = Subset {
        first: 10,
        last: 15,
        blocks: block_cids,
    };
    let subset_cid = push(Kind::Subset, encode(&subset));

    let epoch = Epoch {
        epoch: 0,
        subsets: vec![subset_cid],
    };
    let root = push(Kind::Epoch, encode(&epoch));

    let sections: Vec<(Cid, Vec<u8>)> = nodes
        .iter()
        .map(|n| (n.cid, n.encoded.clone()))
        .collect();
    let car = write_car(&[root], &sections);

    Fixture {
        car,
        nodes,
        blocks,
        root,
        epoch: 0,
        multipart_payload,
        multipart_slot,
    }
}
