// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! CARv1 stream framing.
//!
//! A CARv1 file is a header section followed by block sections, each framed
//! as `uvarint(len) ‖ payload`. The header payload is a CBOR map
//! `{roots, version}`; every other payload is `CID ‖ data`.

mod reader;

pub use reader::{CarFileReader, CarPrefetchReader, NodeBytes, NodeSource, ReaderOptions};

use crate::pool::{BUFFER_POOL, PooledBuf};
use cid::Cid;
use integer_encoding::VarIntReader;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use thiserror::Error;

/// Largest accepted section payload. Matches the byte-array cap cbor-gen
/// imposes on producers, so anything bigger is corruption, not data.
pub const MAX_SECTION_SIZE: usize = 2 << 20;

/// CAR file header
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct CarHeader {
    pub roots: Vec<Cid>,
    pub version: u64,
}

impl CarHeader {
    pub fn new(roots: Vec<Cid>, version: u64) -> Self {
        Self { roots, version }
    }
}

impl From<Vec<Cid>> for CarHeader {
    fn from(roots: Vec<Cid>) -> Self {
        Self { roots, version: 1 }
    }
}

/// CAR framing error
#[derive(Debug, Error)]
pub enum CarError {
    #[error("empty CAR file")]
    EmptyCar,
    #[error("unsupported CAR version {0}, only version 1 is supported")]
    UnsupportedVersion(u64),
    #[error("malformed CAR header: {0}")]
    MalformedHeader(String),
    #[error("section of {got} bytes exceeds the {max} byte limit")]
    OversizedSection { got: usize, max: usize },
    #[error("truncated section: wanted {wanted} bytes, got {got}")]
    TruncatedSection { wanted: usize, got: usize },
    #[error("section CID {got} does not match expected {expected}")]
    CidMismatch { expected: Cid, got: Cid },
    #[error("invalid CID in section: {0}")]
    InvalidCid(#[from] cid::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Number of bytes the uvarint length prefix of a `len`-byte section takes.
pub fn varint_len(len: u64) -> u64 {
    let bits = u64::BITS as u64 - u64::from(len.leading_zeros()).min(63);
    bits.div_ceil(7)
}

/// Total on-disk size of a section with a `len`-byte payload.
pub fn section_size(len: u64) -> u64 {
    varint_len(len) + len
}

/// Read the uvarint length prefix of the next section. `Ok(None)` on a clean
/// EOF before the first byte.
fn read_section_len<R: Read>(reader: &mut R, max: usize) -> Result<Option<usize>, CarError> {
    let len: u64 = match reader.read_varint() {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let len = len as usize;
    if len > max {
        return Err(CarError::OversizedSection { got: len, max });
    }
    Ok(Some(len))
}

fn read_exact_or_truncated<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), CarError> {
    let wanted = buf.len();
    let mut got = 0;
    while got < wanted {
        match reader.read(&mut buf[got..]) {
            Ok(0) => return Err(CarError::TruncatedSection { wanted, got }),
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Parse the CARv1 header off the front of `reader`.
///
/// Returns the header and the number of bytes it occupied on disk.
pub fn read_header<R: Read>(reader: &mut R) -> Result<(CarHeader, u64), CarError> {
    let len = read_section_len(reader, MAX_SECTION_SIZE)?.ok_or(CarError::EmptyCar)?;
    if len == 0 {
        return Err(CarError::EmptyCar);
    }
    let mut buf = vec![0; len];
    read_exact_or_truncated(reader, &mut buf)?;
    let header: CarHeader = serde_ipld_dagcbor::from_slice(&buf)
        .map_err(|e| CarError::MalformedHeader(e.to_string()))?;
    if header.version != 1 {
        return Err(CarError::UnsupportedVersion(header.version));
    }
    if header.roots.is_empty() {
        return Err(CarError::MalformedHeader("no roots".into()));
    }
    Ok((header, section_size(len as u64)))
}

/// One parsed block section.
#[derive(Debug)]
pub struct Section {
    pub cid: Cid,
    /// On-disk size of the whole section, varint prefix included.
    pub section_len: u64,
    /// Node payload; `None` when the caller asked to discard it.
    pub data: Option<PooledBuf>,
}

/// Read the next block section. `Ok(None)` at a clean end of stream.
///
/// With `with_data == false` the payload is skipped without buffering; only
/// the CID and the section length are reported.
pub fn read_section<R: Read>(
    reader: &mut R,
    with_data: bool,
    max_section_size: usize,
) -> Result<Option<Section>, CarError> {
    let Some(len) = read_section_len(reader, max_section_size)? else {
        return Ok(None);
    };
    let cid = Cid::read_bytes(&mut *reader)?;
    let cid_len = cid.encoded_len();
    let data_len = len
        .checked_sub(cid_len)
        .ok_or(CarError::TruncatedSection { wanted: cid_len, got: len })?;
    let data = if with_data {
        let mut buf = BUFFER_POOL.get();
        buf.resize(data_len, 0);
        read_exact_or_truncated(reader, &mut buf)?;
        Some(buf)
    } else {
        let skipped = io::copy(&mut reader.take(data_len as u64), &mut io::sink())?;
        if skipped != data_len as u64 {
            return Err(CarError::TruncatedSection {
                wanted: data_len,
                got: skipped as usize,
            });
        }
        None
    };
    Ok(Some(Section {
        cid,
        section_len: section_size(len as u64),
        data,
    }))
}

/// Split an in-memory section payload (`CID ‖ data`) into its parts.
///
/// When `expected_cid` is given, a differing CID is an error.
pub fn parse_node_from_section<'a>(
    bytes: &'a [u8],
    expected_cid: Option<&Cid>,
) -> Result<(Cid, &'a [u8]), CarError> {
    let mut cursor = io::Cursor::new(bytes);
    let cid = Cid::read_bytes(&mut cursor)?;
    if let Some(expected) = expected_cid
        && cid != *expected
    {
        return Err(CarError::CidMismatch {
            expected: *expected,
            got: cid,
        });
    }
    Ok((cid, &bytes[cursor.position() as usize..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{cid_of_raw, write_car, write_section};
    use serial_test::serial;
    use std::io::Cursor;

    #[test]
    fn header_round_trip() {
        let cid = cid_of_raw(b"root");
        let header = CarHeader::new(vec![cid], 1);
        let bytes = serde_ipld_dagcbor::to_vec(&header).unwrap();
        let parsed: CarHeader = serde_ipld_dagcbor::from_slice(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn empty_stream_is_empty_car() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(matches!(read_header(&mut cursor), Err(CarError::EmptyCar)));
    }

    #[test]
    fn rejects_unsupported_version() {
        let cid = cid_of_raw(b"root");
        let mut bytes = Vec::new();
        let header = CarHeader::new(vec![cid], 2);
        write_section(&mut bytes, &serde_ipld_dagcbor::to_vec(&header).unwrap());
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            read_header(&mut cursor),
            Err(CarError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn rejects_garbage_header() {
        let mut bytes = Vec::new();
        write_section(&mut bytes, b"\xffnot cbor");
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            read_header(&mut cursor),
            Err(CarError::MalformedHeader(_))
        ));
    }

    #[test]
    #[serial]
    fn section_round_trip() {
        let data = b"node payload".to_vec();
        let cid = cid_of_raw(&data);
        let car = write_car(&[cid], &[(cid, data.clone())]);
        let mut cursor = Cursor::new(car);

        let (header, header_size) = read_header(&mut cursor).unwrap();
        assert_eq!(header.roots, vec![cid]);
        assert!(header_size > 0);

        let section = read_section(&mut cursor, true, MAX_SECTION_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(section.cid, cid);
        let buf = section.data.unwrap();
        assert_eq!(buf.as_slice(), data.as_slice());
        assert_eq!(
            section.section_len,
            section_size((cid.encoded_len() + data.len()) as u64)
        );
        drop(buf);

        assert!(read_section(&mut cursor, true, MAX_SECTION_SIZE).unwrap().is_none());
    }

    #[test]
    #[serial]
    fn skip_section_discards_payload() {
        let data = vec![7u8; 1000];
        let cid = cid_of_raw(&data);
        let car = write_car(&[cid], &[(cid, data.clone()), (cid, data)]);
        let mut cursor = Cursor::new(car);
        read_header(&mut cursor).unwrap();

        let first = read_section(&mut cursor, false, MAX_SECTION_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(first.cid, cid);
        assert!(first.data.is_none());

        // The skip must leave the cursor on the next section boundary.
        let second = read_section(&mut cursor, true, MAX_SECTION_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(second.cid, cid);
    }

    #[test]
    fn oversized_section_is_rejected() {
        let data = vec![0u8; 64];
        let cid = cid_of_raw(&data);
        let car = write_car(&[cid], &[(cid, data)]);
        let mut cursor = Cursor::new(car);
        read_header(&mut cursor).unwrap();
        assert!(matches!(
            read_section(&mut cursor, true, 32),
            Err(CarError::OversizedSection { .. })
        ));
    }

    #[test]
    fn parse_node_checks_expected_cid() {
        let data = b"payload".to_vec();
        let cid = cid_of_raw(&data);
        let mut section = cid.to_bytes();
        section.extend_from_slice(&data);

        let (got, rest) = parse_node_from_section(&section, Some(&cid)).unwrap();
        assert_eq!(got, cid);
        assert_eq!(rest, data.as_slice());

        let other = cid_of_raw(b"something else");
        assert!(matches!(
            parse_node_from_section(&section, Some(&other)),
            Err(CarError::CidMismatch { .. })
        ));
    }

    #[test]
    #[serial]
    fn truncated_section_reports_short_read() {
        let data = b"payload-that-gets-cut".to_vec();
        let cid = cid_of_raw(&data);
        let mut car = Vec::new();
        let header = CarHeader::new(vec![cid], 1);
        write_section(&mut car, &serde_ipld_dagcbor::to_vec(&header).unwrap());
        let mut section = cid.to_bytes();
        section.extend_from_slice(&data);
        write_section(&mut car, &section);
        car.truncate(car.len() - 5);

        let mut cursor = Cursor::new(car);
        read_header(&mut cursor).unwrap();
        assert!(matches!(
            read_section(&mut cursor, true, MAX_SECTION_SIZE),
            Err(CarError::TruncatedSection { .. })
        ));
    }

    #[test]
    fn varint_len_matches_encoding() {
        use integer_encoding::VarIntWriter;
        for len in [0u64, 1, 127, 128, 16_383, 16_384, 2 << 20] {
            let mut buf = Vec::new();
            buf.write_varint(len).unwrap();
            assert_eq!(varint_len(len), buf.len() as u64, "len={len}");
        }
    }
}
