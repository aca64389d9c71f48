use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::{ChunkId, IdxEntry, Record};
use crate::{Error, Result};

/// Cached, cheap-to-copy chunk metadata.
///
/// `start_ts` / `end_ts` are only meaningful when `record_count > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub id: ChunkId,
    pub sealed: bool,
    pub record_count: u64,
    pub start_ts: i64,
    pub end_ts: i64,
    /// Sum of payload and attribute bytes (pre-compression).
    pub bytes: u64,
    /// Bytes actually occupied on disk by the data log.
    pub disk_bytes: u64,
}

impl ChunkMeta {
    pub fn empty(id: ChunkId) -> Self {
        Self {
            id,
            sealed: false,
            record_count: 0,
            start_ts: 0,
            end_ts: 0,
            bytes: 0,
            disk_bytes: 0,
        }
    }

    /// Whether `[start_ts, end_ts]` intersects the half-open query range.
    pub fn overlaps(&self, start: Option<i64>, end: Option<i64>) -> bool {
        if self.record_count == 0 {
            return false;
        }
        if let Some(start) = start {
            if self.end_ts < start {
                return false;
            }
        }
        if let Some(end) = end {
            if self.start_ts >= end {
                return false;
            }
        }
        true
    }
}

/// Read-side counters, used by chunk analysis and by tests asserting that
/// fast paths stay off the record bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkIoStats {
    pub body_reads: u64,
}

/// One chunk of a vault's record stream.
///
/// Implementations are internally synchronized: appends are serialized by
/// the owning chunk manager, reads may happen concurrently from any thread,
/// and sealing is visible atomically without invalidating open cursors.
pub trait Chunk: Send + Sync {
    fn id(&self) -> ChunkId;

    fn meta(&self) -> ChunkMeta;

    fn is_sealed(&self) -> bool;

    /// Append a record; returns the position it was written at. Fails with
    /// [`Error::Sealed`] once the chunk is sealed. On an I/O error the
    /// record is not counted.
    fn append(&self, rec: &Record) -> Result<u64>;

    /// Seal the chunk. Idempotent; returns the last record's `write_ts`
    /// (zero for an empty chunk).
    fn seal(&self) -> Result<i64>;

    /// Read the record at `position`; `Ok(None)` past the end.
    fn read(&self, position: u64) -> Result<Option<Record>>;

    /// The position-index entry at `position`, without touching the body.
    fn idx_entry(&self, position: u64) -> Result<Option<IdxEntry>>;

    /// Smallest position whose `write_ts >= ts`, or `None` when every
    /// record is older. O(log n) over the position index.
    fn find_start_position(&self, ts: i64) -> Result<Option<u64>>;

    /// Vectorized `write_ts` read; no record-body I/O.
    fn read_write_timestamps(&self, positions: &[u64]) -> Result<Vec<i64>>;

    fn io_stats(&self) -> ChunkIoStats;
}

/// Restartable cursor over a chunk in position order.
///
/// The cursor holds its own reference to the chunk, so a concurrent seal
/// (or the manager dropping the chunk from its maps) cannot invalidate it.
/// Reading past the end yields `Ok(None)`; on an active chunk a later call
/// may see records appended in the meantime.
pub struct ChunkCursor {
    chunk: Arc<dyn Chunk>,
    next: u64,
}

impl ChunkCursor {
    pub fn new(chunk: Arc<dyn Chunk>, from_position: u64) -> Self {
        Self {
            chunk,
            next: from_position,
        }
    }

    pub fn position(&self) -> u64 {
        self.next
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk.id()
    }

    /// Next record with its position, or `None` past the end.
    pub fn next(&mut self) -> Result<Option<(u64, Record)>> {
        match self.chunk.read(self.next)? {
            Some(rec) => {
                let pos = self.next;
                self.next += 1;
                Ok(Some((pos, rec)))
            }
            None => Ok(None),
        }
    }

    /// Restart the cursor at `position`.
    pub fn seek(&mut self, position: u64) {
        self.next = position;
    }
}

/// Shared recovery helper: drop trailing idx entries that point past the
/// end of the data log, returning how many entries remain valid and the
/// consistent data length.
pub(crate) fn consistent_tail(entries: &[IdxEntry], data: &[u8]) -> (usize, u64) {
    let mut n = entries.len();
    while n > 0 {
        let entry = entries[n - 1];
        let offset = entry.offset as usize;
        if offset <= data.len() {
            if let Some(size) = crate::store::frame_size_at(&data[offset..]) {
                if offset + size <= data.len() {
                    return (n, (offset + size) as u64);
                }
            }
        }
        n -= 1;
    }
    (0, 0)
}

/// Validate that `positions` are addressable in a chunk of `count` records.
pub(crate) fn check_positions(count: u64, positions: &[u64]) -> Result<()> {
    for &p in positions {
        if p >= count {
            return Err(Error::invalid(format!(
                "position {} out of range (record_count {})",
                p, count
            )));
        }
    }
    Ok(())
}
