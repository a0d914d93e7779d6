// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Sequential CAR readers.
//!
//! [`CarPrefetchReader`] runs the framer on its own thread and hands parsed
//! sections to the consumer over a bounded channel, so CBOR framing never
//! stalls consumption. [`CarFileReader`] frames inline and additionally
//! reports absolute stream offsets, which the prefetching variant does not
//! expose.

use super::{CarError, CarHeader, MAX_SECTION_SIZE, read_header, read_section};
use crate::pool::{BUFFER_POOL, PooledBuf};
use crate::util::CancelToken;
use cid::Cid;
use std::io::{BufReader, Read};
use std::path::Path;
use std::thread::JoinHandle;
use tracing::debug;

/// Tuning for the prefetching reader.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Read-ahead buffer in front of the source, in bytes.
    pub read_ahead: usize,
    /// Capacity of the framer → consumer queue, in sections.
    pub prefetch_depth: usize,
    /// Upper bound on a single section payload.
    pub max_section_size: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            read_ahead: 4 << 20,
            prefetch_depth: 100_000,
            max_section_size: MAX_SECTION_SIZE,
        }
    }
}

/// One delivered node: its CID, the on-disk section size, and the payload in
/// a pooled buffer owned by the receiver until dropped.
#[derive(Debug)]
pub struct NodeBytes {
    pub cid: Cid,
    /// Absolute section offset; only the non-prefetching reader reports it.
    pub offset: Option<u64>,
    pub section_len: u64,
    pub data: PooledBuf,
}

/// Anything that yields nodes in CAR order.
pub trait NodeSource {
    fn next_node_bytes(&mut self) -> Result<Option<NodeBytes>, CarError>;
}

enum FramerMsg {
    Node(NodeBytes),
    /// Terminal marker: `None` for a clean EOF, otherwise the framing error.
    End(Option<CarError>),
}

/// CAR reader that frames sections on a worker thread.
///
/// The consumer sees nodes strictly in CAR order. Each delivered
/// [`NodeBytes`] owns its pooled payload buffer; dropping it returns the
/// buffer. [`close`](Self::close) is idempotent and also runs on drop.
pub struct CarPrefetchReader {
    header: CarHeader,
    header_size: u64,
    rx: Option<flume::Receiver<FramerMsg>>,
    handle: Option<JoinHandle<()>>,
    cancel: CancelToken,
    finished: bool,
}

impl CarPrefetchReader {
    /// Open a CAR file and start prefetching with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CarError> {
        let file = std::fs::File::open(path)?;
        Self::new(file, ReaderOptions::default())
    }

    /// Parse the header off `source`, then spawn the framer thread.
    pub fn new<R>(source: R, options: ReaderOptions) -> Result<Self, CarError>
    where
        R: Read + Send + 'static,
    {
        let mut reader = BufReader::with_capacity(options.read_ahead, source);
        let (header, header_size) = read_header(&mut reader)?;
        let (tx, rx) = flume::bounded(options.prefetch_depth);
        let cancel = CancelToken::new();
        let framer_cancel = cancel.clone();
        let max_section_size = options.max_section_size;
        let handle = std::thread::Builder::new()
            .name("car-framer".into())
            .spawn(move || {
                run_framer(reader, tx, framer_cancel, max_section_size);
            })
            .map_err(CarError::Io)?;
        Ok(Self {
            header,
            header_size,
            rx: Some(rx),
            handle: Some(handle),
            cancel,
            finished: false,
        })
    }

    /// The CARv1 header parsed at construction.
    pub fn header(&self) -> &CarHeader {
        &self.header
    }

    /// Bytes the header occupied, i.e. the offset of the first section.
    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    /// Return a delivered payload buffer to the pool. Dropping the buffer is
    /// equivalent.
    pub fn put_buffer(&self, buf: PooledBuf) {
        BUFFER_POOL.put(buf);
    }

    /// Shut the framer down and drain the queue, returning every in-flight
    /// buffer to the pool. Safe to call more than once.
    pub fn close(&mut self) {
        self.cancel.cancel();
        if let Some(rx) = self.rx.take() {
            // Draining unblocks a framer parked on a full queue.
            for msg in rx.drain() {
                if let FramerMsg::Node(node) = msg {
                    drop(node.data);
                }
            }
            drop(rx);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.finished = true;
    }
}

impl NodeSource for CarPrefetchReader {
    /// Next node in CAR order, `Ok(None)` at end of stream.
    fn next_node_bytes(&mut self) -> Result<Option<NodeBytes>, CarError> {
        if self.finished {
            return Ok(None);
        }
        let Some(rx) = self.rx.as_ref() else {
            return Ok(None);
        };
        match rx.recv() {
            Ok(FramerMsg::Node(node)) => Ok(Some(node)),
            Ok(FramerMsg::End(None)) | Err(flume::RecvError::Disconnected) => {
                self.finished = true;
                Ok(None)
            }
            Ok(FramerMsg::End(Some(err))) => {
                self.finished = true;
                Err(err)
            }
        }
    }
}

impl Drop for CarPrefetchReader {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_framer<R: Read>(
    mut reader: R,
    tx: flume::Sender<FramerMsg>,
    cancel: CancelToken,
    max_section_size: usize,
) {
    loop {
        if cancel.is_cancelled() {
            debug!("car framer cancelled");
            return;
        }
        match read_section(&mut reader, true, max_section_size) {
            Ok(Some(section)) => {
                let node = NodeBytes {
                    cid: section.cid,
                    offset: None,
                    section_len: section.section_len,
                    data: section.data.expect("read_section(with_data) yields data"),
                };
                if tx.send(FramerMsg::Node(node)).is_err() {
                    // Receiver is gone; the unsent buffer returns via drop.
                    return;
                }
            }
            Ok(None) => {
                let _ = tx.send(FramerMsg::End(None));
                return;
            }
            Err(err) => {
                let _ = tx.send(FramerMsg::End(Some(err)));
                return;
            }
        }
    }
}

/// Inline (non-prefetching) CAR reader with offset reporting.
pub struct CarFileReader<R> {
    reader: BufReader<R>,
    header: CarHeader,
    header_size: u64,
    offset: u64,
    max_section_size: usize,
}

impl CarFileReader<std::fs::File> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CarError> {
        Self::new(std::fs::File::open(path)?, ReaderOptions::default())
    }
}

impl<R: Read> CarFileReader<R> {
    pub fn new(source: R, options: ReaderOptions) -> Result<Self, CarError> {
        let mut reader = BufReader::with_capacity(options.read_ahead, source);
        let (header, header_size) = read_header(&mut reader)?;
        Ok(Self {
            reader,
            header,
            header_size,
            offset: header_size,
            max_section_size: options.max_section_size,
        })
    }

    pub fn header(&self) -> &CarHeader {
        &self.header
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    /// Absolute offset of the next section to be read.
    pub fn global_offset_for_next_read(&self) -> u64 {
        self.offset
    }

    /// Read the next section, optionally discarding the payload.
    pub fn next_section(&mut self, with_data: bool) -> Result<Option<NodeBytes>, CarError> {
        let Some(section) = read_section(&mut self.reader, with_data, self.max_section_size)?
        else {
            return Ok(None);
        };
        let offset = self.offset;
        self.offset += section.section_len;
        Ok(Some(NodeBytes {
            cid: section.cid,
            offset: Some(offset),
            section_len: section.section_len,
            data: section.data.unwrap_or_else(|| BUFFER_POOL.get()),
        }))
    }
}

impl<R: Read> NodeSource for CarFileReader<R> {
    fn next_node_bytes(&mut self) -> Result<Option<NodeBytes>, CarError> {
        self.next_section(true)
    }
}
