use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use crate::store::{
    check_positions, Chunk, ChunkId, ChunkIoStats, ChunkMeta, IdxEntry, Record,
};
use crate::tools::sync::{rlock, wlock};
use crate::{Error, Result};

struct MemState {
    meta: ChunkMeta,
    records: Vec<Record>,
    index: Vec<IdxEntry>,
}

/// In-memory chunk for `memory` vaults. Same semantics as the file-backed
/// chunk, minus durability: sealing flips the flag without writing
/// anything, and the chunk disappears with the process.
pub struct MemChunk {
    id: ChunkId,
    sealed: AtomicBool,
    body_reads: AtomicU64,
    state: RwLock<MemState>,
}

impl MemChunk {
    pub fn new(id: ChunkId) -> MemChunk {
        MemChunk {
            id,
            sealed: AtomicBool::new(false),
            body_reads: AtomicU64::new(0),
            state: RwLock::new(MemState {
                meta: ChunkMeta::empty(id),
                records: Vec::new(),
                index: Vec::new(),
            }),
        }
    }
}

impl Chunk for MemChunk {
    fn id(&self) -> ChunkId {
        self.id
    }

    fn meta(&self) -> ChunkMeta {
        rlock(&self.state).meta
    }

    fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    fn append(&self, rec: &Record) -> Result<u64> {
        if self.is_sealed() {
            return Err(Error::Sealed);
        }
        let mut st = wlock(&self.state);
        let pos = st.meta.record_count;
        if pos == 0 {
            st.meta.start_ts = rec.write_ts;
            st.meta.end_ts = rec.write_ts;
        } else {
            st.meta.start_ts = st.meta.start_ts.min(rec.write_ts);
            st.meta.end_ts = st.meta.end_ts.max(rec.write_ts);
        }
        st.meta.record_count += 1;
        st.meta.bytes += rec.logical_bytes();
        st.meta.disk_bytes = st.meta.bytes;
        st.index.push(IdxEntry {
            write_ts: rec.write_ts,
            ingest_ts: rec.ingest_ts,
            source_ts: rec.source_ts,
            offset: 0,
        });
        st.records.push(rec.clone());
        Ok(pos)
    }

    fn seal(&self) -> Result<i64> {
        self.sealed.store(true, Ordering::Release);
        let mut st = wlock(&self.state);
        st.meta.sealed = true;
        Ok(st.meta.end_ts)
    }

    fn read(&self, position: u64) -> Result<Option<Record>> {
        let st = rlock(&self.state);
        match st.records.get(position as usize) {
            Some(rec) => {
                self.body_reads.fetch_add(1, Ordering::Relaxed);
                Ok(Some(rec.clone()))
            }
            None => Ok(None),
        }
    }

    fn idx_entry(&self, position: u64) -> Result<Option<IdxEntry>> {
        Ok(rlock(&self.state).index.get(position as usize).copied())
    }

    fn find_start_position(&self, ts: i64) -> Result<Option<u64>> {
        let st = rlock(&self.state);
        let pos = st.index.partition_point(|e| e.write_ts < ts);
        if pos == st.index.len() {
            Ok(None)
        } else {
            Ok(Some(pos as u64))
        }
    }

    fn read_write_timestamps(&self, positions: &[u64]) -> Result<Vec<i64>> {
        let st = rlock(&self.state);
        check_positions(st.index.len() as u64, positions)?;
        Ok(positions
            .iter()
            .map(|&p| st.index[p as usize].write_ts)
            .collect())
    }

    fn io_stats(&self) -> ChunkIoStats {
        ChunkIoStats {
            body_reads: self.body_reads.load(Ordering::Relaxed),
        }
    }
}
