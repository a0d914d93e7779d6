// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Multipart dataframe reassembly.
//!
//! A payload larger than one section is carried by a chain of dataframes:
//! the head names `total` and links successors through `next`; successors
//! may link further frames. Flattened, the chain must contain exactly
//! `total` frames with distinct `index`es; concatenation in ascending index
//! order reconstructs the payload.

use super::{DataFrame, NodeError};
use cid::Cid;
use crc::{CRC_64_GO_ISO, Crc};
use fnv::FnvHasher;
use std::collections::VecDeque;
use std::hash::Hasher;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// CRC-64 with the ISO polynomial, the checksum current producers write.
pub fn checksum_crc64(data: &[u8]) -> u64 {
    CRC64.checksum(data)
}

/// FNV-1a 64, written by legacy producers.
pub fn checksum_fnv(data: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(data);
    hasher.finish()
}

fn verify_hash(stored: Option<u64>, data: &[u8]) -> Result<(), NodeError> {
    let Some(stored) = stored else {
        return Ok(());
    };
    let crc64 = checksum_crc64(data);
    if crc64 == stored {
        return Ok(());
    }
    let fnv = checksum_fnv(data);
    if fnv == stored {
        return Ok(());
    }
    Err(NodeError::HashMismatch { stored, crc64, fnv })
}

/// Reassemble the payload rooted at `head`, fetching linked frames through
/// `get`. The getter is typically backed by the current mini-DAG or, on the
/// signature path, by index lookups and ranged reads; its error type only
/// needs to absorb [`NodeError`].
///
/// Heads without `total` (or with `total <= 1`) stand alone; frames without
/// `index` sort as index 0.
pub fn reassemble_dataframes<F, E>(head: &DataFrame, mut get: F) -> Result<Vec<u8>, E>
where
    F: FnMut(&Cid) -> Result<DataFrame, E>,
    E: From<NodeError>,
{
    let total = head.total_frames();
    if total <= 1 {
        verify_hash(head.hash, &head.data)?;
        return Ok(head.data.clone());
    }

    let mut frames: Vec<(u64, Vec<u8>)> = Vec::with_capacity(total as usize);
    frames.push((head.index.unwrap_or(0), head.data.clone()));

    let mut pending: VecDeque<Cid> = head.next.iter().flatten().copied().collect();
    while let Some(cid) = pending.pop_front() {
        // A malformed chain could link in a loop; the claimed total bounds
        // the walk.
        if frames.len() as u64 >= total {
            return Err(NodeError::FrameCountMismatch {
                total,
                found: frames.len() as u64 + 1,
            }
            .into());
        }
        let frame = get(&cid)?;
        pending.extend(frame.next.iter().flatten().copied());
        frames.push((frame.index.unwrap_or(0), frame.data));
    }

    if frames.len() as u64 != total {
        return Err(NodeError::FrameCountMismatch {
            total,
            found: frames.len() as u64,
        }
        .into());
    }

    frames.sort_by_key(|(index, _)| *index);
    for pair in frames.windows(2) {
        if pair[0].0 == pair[1].0 {
            return Err(NodeError::FrameIndexCollision(pair[0].0).into());
        }
    }

    let mut payload = Vec::with_capacity(frames.iter().map(|(_, d)| d.len()).sum());
    for (_, data) in &frames {
        payload.extend_from_slice(data);
    }
    verify_hash(head.hash, &payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cid_of_raw;
    use std::collections::HashMap;

    fn chain(payload: &[u8], pieces: usize) -> (DataFrame, HashMap<Cid, DataFrame>) {
        let chunk = payload.len().div_ceil(pieces);
        let parts: Vec<&[u8]> = payload.chunks(chunk).collect();
        assert_eq!(parts.len(), pieces);

        let mut store = HashMap::new();
        let mut tail_cids = Vec::new();
        for (i, part) in parts.iter().enumerate().skip(1) {
            let frame = DataFrame {
                hash: None,
                index: Some(i as u64),
                total: Some(pieces as u64),
                data: part.to_vec(),
                next: None,
            };
            let cid = cid_of_raw(&frame.to_vec().unwrap());
            store.insert(cid, frame);
            tail_cids.push(cid);
        }
        let head = DataFrame {
            hash: Some(checksum_crc64(payload)),
            index: Some(0),
            total: Some(pieces as u64),
            data: parts[0].to_vec(),
            next: Some(tail_cids),
        };
        (head, store)
    }

    fn getter(store: &HashMap<Cid, DataFrame>) -> impl FnMut(&Cid) -> Result<DataFrame, NodeError> {
        move |cid| store.get(cid).cloned().ok_or(NodeError::MissingFrame(*cid))
    }

    #[test]
    fn single_frame_passthrough() {
        let head = DataFrame {
            hash: Some(checksum_crc64(b"inline")),
            data: b"inline".to_vec(),
            ..Default::default()
        };
        let out = reassemble_dataframes(&head, |_| -> Result<DataFrame, NodeError> {
            unreachable!("no links")
        })
        .unwrap();
        assert_eq!(out, b"inline");
    }

    #[test]
    fn three_piece_chain_reassembles() {
        let payload = b"the full logical payload, split across three frames".to_vec();
        let (head, store) = chain(&payload, 3);
        let out = reassemble_dataframes(&head, getter(&store)).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn next_order_does_not_matter() {
        let payload = b"ordering comes from indexes, not link order".to_vec();
        let (mut head, store) = chain(&payload, 4);
        head.next.as_mut().unwrap().reverse();
        let out = reassemble_dataframes(&head, getter(&store)).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn fnv_checksum_is_accepted() {
        let payload = b"legacy producers hashed with fnv-1a".to_vec();
        let (mut head, store) = chain(&payload, 2);
        head.hash = Some(checksum_fnv(&payload));
        let out = reassemble_dataframes(&head, getter(&store)).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn flipped_byte_is_a_hash_mismatch() {
        let payload = b"any corruption must surface".to_vec();
        let (head, mut store) = chain(&payload, 3);
        let victim = head.next.as_ref().unwrap()[0];
        store.get_mut(&victim).unwrap().data[0] ^= 1;
        assert!(matches!(
            reassemble_dataframes(&head, getter(&store)),
            Err(NodeError::HashMismatch { .. })
        ));
    }

    #[test]
    fn missing_frame_surfaces() {
        let payload = b"a dropped link is fatal".to_vec();
        let (head, mut store) = chain(&payload, 3);
        let victim = head.next.as_ref().unwrap()[1];
        store.remove(&victim);
        assert!(matches!(
            reassemble_dataframes(&head, getter(&store)),
            Err(NodeError::MissingFrame(cid)) if cid == victim
        ));
    }

    #[test]
    fn count_mismatch_surfaces() {
        let payload = b"head promises more than the chain holds".to_vec();
        let (mut head, store) = chain(&payload, 3);
        head.total = Some(4);
        assert!(matches!(
            reassemble_dataframes(&head, getter(&store)),
            Err(NodeError::FrameCountMismatch { total: 4, found: 3 })
        ));
    }

    #[test]
    fn index_collision_surfaces() {
        let payload = b"two frames with one index".to_vec();
        let (head, mut store) = chain(&payload, 3);
        let victim = head.next.as_ref().unwrap()[1];
        store.get_mut(&victim).unwrap().index = Some(1);
        assert!(matches!(
            reassemble_dataframes(&head, getter(&store)),
            Err(NodeError::FrameIndexCollision(1))
        ));
    }

    #[test]
    fn linked_tree_flattens() {
        // head -> f1 -> (f2, f3): successors may carry their own links.
        let parts: [&[u8]; 4] = [b"aaaa", b"bbbb", b"cccc", b"dd"];
        let payload: Vec<u8> = parts.concat();

        let mut store = HashMap::new();
        let mut mk = |index: u64, data: &[u8], next: Option<Vec<Cid>>| {
            let frame = DataFrame {
                hash: None,
                index: Some(index),
                total: Some(4),
                data: data.to_vec(),
                next,
            };
            let cid = cid_of_raw(&frame.to_vec().unwrap());
            store.insert(cid, frame);
            cid
        };
        let f2 = mk(2, parts[2], None);
        let f3 = mk(3, parts[3], None);
        let f1 = mk(1, parts[1], Some(vec![f2, f3]));
        let head = DataFrame {
            hash: Some(checksum_crc64(&payload)),
            index: Some(0),
            total: Some(4),
            data: parts[0].to_vec(),
            next: Some(vec![f1]),
        };

        let out = reassemble_dataframes(&head, getter(&store)).unwrap();
        assert_eq!(out, payload);
    }
}
