use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::store::{
    codec, consistent_tail, check_positions, Chunk, ChunkId, ChunkIoStats, ChunkMeta, IdxEntry,
    Record, IDX_ENTRY_SIZE,
};
use crate::tools::sync::{lock, rlock, wlock};
use crate::{Error, Result};

pub const DATA_LOG_NAME: &str = "data.log";
pub const IDX_LOG_NAME: &str = "idx.log";
pub const META_NAME: &str = "meta.json";

const META_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct MetaFile {
    version: u32,
    id: ChunkId,
    sealed: bool,
    record_count: u64,
    start_ts: i64,
    end_ts: i64,
    bytes: u64,
    disk_bytes: u64,
}

struct WriteHandles {
    data: File,
    idx: File,
    data_len: u64,
}

struct ChunkState {
    meta: ChunkMeta,
    /// Position index. Always present on an active chunk; loaded lazily
    /// from `idx.log` on a sealed one.
    index: Option<Vec<IdxEntry>>,
}

/// File-backed chunk: `data.log` + `idx.log`, plus `meta.json` once sealed.
///
/// The absence of `meta.json` is what marks a chunk directory as active;
/// sealing writes it temp-then-rename, so the transition is atomic at the
/// filesystem level.
pub struct FileChunk {
    id: ChunkId,
    dir: PathBuf,
    compress: bool,
    sealed: AtomicBool,
    body_reads: AtomicU64,
    state: RwLock<ChunkState>,
    writer: Mutex<Option<WriteHandles>>,
    reader: Mutex<Option<File>>,
}

impl FileChunk {
    /// Create a fresh active chunk directory under `parent`.
    pub fn create(parent: &Path, id: ChunkId, compress: bool) -> Result<FileChunk> {
        let dir = parent.join(id.to_string());
        std::fs::create_dir(&dir)?;

        let data = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(dir.join(DATA_LOG_NAME))?;
        let idx = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(dir.join(IDX_LOG_NAME))?;

        Ok(FileChunk {
            id,
            dir,
            compress,
            sealed: AtomicBool::new(false),
            body_reads: AtomicU64::new(0),
            state: RwLock::new(ChunkState {
                meta: ChunkMeta::empty(id),
                index: Some(Vec::new()),
            }),
            writer: Mutex::new(Some(WriteHandles {
                data,
                idx,
                data_len: 0,
            })),
            reader: Mutex::new(None),
        })
    }

    /// Open an existing chunk directory.
    ///
    /// A directory with `meta.json` is a sealed chunk and opens cheaply; a
    /// directory without it is the active chunk and goes through crash
    /// recovery: trailing entries of `idx.log` and `data.log` that do not
    /// describe one complete, checksum-valid record are truncated away.
    pub fn open(dir: &Path, compress: bool) -> Result<FileChunk> {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::invalid(format!("bad chunk directory {:?}", dir)))?;
        let id = ChunkId::parse(name)?;

        let meta_path = dir.join(META_NAME);
        if meta_path.exists() {
            let meta: MetaFile = serde_json::from_slice(&std::fs::read(&meta_path)?)
                .map_err(|err| Error::corrupt(format!("bad {}: {}", META_NAME, err)))?;
            if meta.id != id {
                return Err(Error::corrupt(format!(
                    "chunk id mismatch: directory {} vs meta {}",
                    id, meta.id
                )));
            }
            return Ok(FileChunk {
                id,
                dir: dir.to_owned(),
                compress,
                sealed: AtomicBool::new(true),
                body_reads: AtomicU64::new(0),
                state: RwLock::new(ChunkState {
                    meta: ChunkMeta {
                        id,
                        sealed: true,
                        record_count: meta.record_count,
                        start_ts: meta.start_ts,
                        end_ts: meta.end_ts,
                        bytes: meta.bytes,
                        disk_bytes: meta.disk_bytes,
                    },
                    index: None,
                }),
                writer: Mutex::new(None),
                reader: Mutex::new(None),
            });
        }

        Self::recover_active(dir, id, compress)
    }

    fn recover_active(dir: &Path, id: ChunkId, compress: bool) -> Result<FileChunk> {
        let idx_path = dir.join(IDX_LOG_NAME);
        let data_path = dir.join(DATA_LOG_NAME);

        let idx_raw = match std::fs::read(&idx_path) {
            Ok(raw) => raw,
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        if idx_raw.len() % IDX_ENTRY_SIZE != 0 {
            warn!(
                "chunk {}: idx.log has {} trailing bytes, truncating",
                id,
                idx_raw.len() % IDX_ENTRY_SIZE
            );
        }
        let mut entries = Vec::with_capacity(idx_raw.len() / IDX_ENTRY_SIZE);
        for slot in idx_raw.chunks_exact(IDX_ENTRY_SIZE) {
            entries.push(IdxEntry::decode(slot)?);
        }

        let data = match std::fs::read(&data_path) {
            Ok(raw) => raw,
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let (mut valid, mut data_len) = consistent_tail(&entries, &data);

        // Walk the covered frames front to back; corruption in the middle
        // (not just a torn tail) also truncates from that point on.
        let mut meta = ChunkMeta::empty(id);
        let mut offset = 0u64;
        let mut walked = 0usize;
        while walked < valid {
            let entry = entries[walked];
            if entry.offset != offset {
                warn!("chunk {}: idx offset diverges at position {}", id, walked);
                break;
            }
            match codec::decode_record(&data[offset as usize..]) {
                Ok((rec, used)) => {
                    if walked == 0 {
                        meta.start_ts = rec.write_ts;
                    }
                    meta.end_ts = rec.write_ts;
                    meta.bytes += rec.logical_bytes();
                    offset += used as u64;
                    walked += 1;
                }
                Err(err) => {
                    warn!("chunk {}: bad frame at position {}: {}", id, walked, err);
                    break;
                }
            }
        }
        if walked < valid {
            valid = walked;
            data_len = offset;
        }
        entries.truncate(valid);
        meta.record_count = valid as u64;
        meta.disk_bytes = data_len;

        if data_len != data.len() as u64 || valid * IDX_ENTRY_SIZE != idx_raw.len() {
            warn!(
                "chunk {}: recovering to {} records ({} data bytes)",
                id, valid, data_len
            );
            let f = OpenOptions::new().write(true).create(true).open(&data_path)?;
            f.set_len(data_len)?;
            let f = OpenOptions::new().write(true).create(true).open(&idx_path)?;
            f.set_len((valid * IDX_ENTRY_SIZE) as u64)?;
        }

        let data_file = OpenOptions::new().append(true).open(&data_path)?;
        let idx_file = OpenOptions::new().append(true).open(&idx_path)?;

        Ok(FileChunk {
            id,
            dir: dir.to_owned(),
            compress,
            sealed: AtomicBool::new(false),
            body_reads: AtomicU64::new(0),
            state: RwLock::new(ChunkState {
                meta,
                index: Some(entries),
            }),
            writer: Mutex::new(Some(WriteHandles {
                data: data_file,
                idx: idx_file,
                data_len,
            })),
            reader: Mutex::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn with_index<T>(&self, f: impl FnOnce(&[IdxEntry]) -> T) -> Result<T> {
        {
            let st = rlock(&self.state);
            if let Some(ref index) = st.index {
                return Ok(f(index));
            }
        }

        let raw = std::fs::read(self.dir.join(IDX_LOG_NAME))?;
        let mut entries = Vec::with_capacity(raw.len() / IDX_ENTRY_SIZE);
        for slot in raw.chunks_exact(IDX_ENTRY_SIZE) {
            entries.push(IdxEntry::decode(slot)?);
        }

        let mut st = wlock(&self.state);
        if entries.len() as u64 != st.meta.record_count {
            return Err(Error::corrupt(format!(
                "chunk {}: idx.log has {} entries, meta says {}",
                self.id,
                entries.len(),
                st.meta.record_count
            )));
        }
        if st.index.is_none() {
            st.index = Some(entries);
        }
        Ok(f(st.index.as_ref().expect("index just set")))
    }

    fn read_frame(&self, offset: u64) -> Result<Vec<u8>> {
        let mut guard = lock(&self.reader);
        if guard.is_none() {
            *guard = Some(File::open(self.dir.join(DATA_LOG_NAME))?);
        }
        let file = guard.as_mut().expect("reader just opened");

        file.seek(SeekFrom::Start(offset))?;
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let body_len = u32::from_le_bytes(len_buf) as usize;
        if body_len > codec::MAX_FRAME_SIZE {
            return Err(Error::corrupt(format!(
                "chunk {}: oversized frame at offset {}",
                self.id, offset
            )));
        }
        let mut frame = vec![0u8; 4 + body_len];
        frame[0..4].copy_from_slice(&len_buf);
        file.read_exact(&mut frame[4..])?;
        Ok(frame)
    }

    fn write_meta_file(&self, meta: &ChunkMeta) -> Result<()> {
        let file = MetaFile {
            version: META_VERSION,
            id: meta.id,
            sealed: true,
            record_count: meta.record_count,
            start_ts: meta.start_ts,
            end_ts: meta.end_ts,
            bytes: meta.bytes,
            disk_bytes: meta.disk_bytes,
        };
        let raw = serde_json::to_vec_pretty(&file)
            .map_err(|err| Error::internal(format!("encode meta: {}", err)))?;
        crate::tools::replace_file(self.dir.join(META_NAME), &raw)
    }
}

impl Chunk for FileChunk {
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

        let frame = codec::encode_record(rec, self.compress)?;

        let mut guard = lock(&self.writer);
        let handles = guard.as_mut().ok_or(Error::Sealed)?;

        // data first, then idx: recovery discards a data frame that has no
        // idx entry, so a crash between the two writes loses the record
        // cleanly instead of corrupting the chunk
        handles.data.write_all(&frame)?;
        let entry = IdxEntry {
            write_ts: rec.write_ts,
            ingest_ts: rec.ingest_ts,
            source_ts: rec.source_ts,
            offset: handles.data_len,
        };
        handles.idx.write_all(&entry.encode())?;
        handles.data_len += frame.len() as u64;

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
        st.meta.disk_bytes += frame.len() as u64;
        if let Some(ref mut index) = st.index {
            index.push(entry);
        }
        Ok(pos)
    }

    fn seal(&self) -> Result<i64> {
        let mut guard = lock(&self.writer);
        if self.sealed.swap(true, Ordering::AcqRel) {
            return Ok(rlock(&self.state).meta.end_ts);
        }

        if let Some(handles) = guard.take() {
            handles.data.sync_all()?;
            handles.idx.sync_all()?;
        }

        let meta = {
            let mut st = wlock(&self.state);
            st.meta.sealed = true;
            st.meta
        };
        self.write_meta_file(&meta)?;
        Ok(meta.end_ts)
    }

    fn read(&self, position: u64) -> Result<Option<Record>> {
        let entry = match self.idx_entry(position)? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let frame = self.read_frame(entry.offset)?;
        self.body_reads.fetch_add(1, Ordering::Relaxed);
        let (rec, _) = codec::decode_record(&frame)?;
        Ok(Some(rec))
    }

    fn idx_entry(&self, position: u64) -> Result<Option<IdxEntry>> {
        self.with_index(|index| index.get(position as usize).copied())
    }

    fn find_start_position(&self, ts: i64) -> Result<Option<u64>> {
        self.with_index(|index| {
            let pos = index.partition_point(|e| e.write_ts < ts);
            if pos == index.len() {
                None
            } else {
                Some(pos as u64)
            }
        })
    }

    fn read_write_timestamps(&self, positions: &[u64]) -> Result<Vec<i64>> {
        self.with_index(|index| {
            check_positions(index.len() as u64, positions)?;
            Ok(positions
                .iter()
                .map(|&p| index[p as usize].write_ts)
                .collect())
        })?
    }

    fn io_stats(&self) -> ChunkIoStats {
        ChunkIoStats {
            body_reads: self.body_reads.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChunkCursor;
    use std::sync::Arc;

    fn rec(write_ts: i64, raw: &str) -> Record {
        let mut r = Record::new(raw.as_bytes().to_vec());
        r.ingest_ts = write_ts;
        r.write_ts = write_ts;
        r
    }

    #[test]
    fn append_read_seal_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = FileChunk::create(dir.path(), ChunkId::now(), false).unwrap();

        for i in 0..10i64 {
            let pos = chunk.append(&rec(1000 + i, &format!("line {}", i))).unwrap();
            assert_eq!(pos, i as u64);
        }

        let meta = chunk.meta();
        assert_eq!(meta.record_count, 10);
        assert_eq!(meta.start_ts, 1000);
        assert_eq!(meta.end_ts, 1009);
        assert!(!meta.sealed);

        let last_ts = chunk.seal().unwrap();
        assert_eq!(last_ts, 1009);
        assert!(matches!(
            chunk.append(&rec(2000, "late")),
            Err(Error::Sealed)
        ));
        // idempotent
        assert_eq!(chunk.seal().unwrap(), 1009);

        let got = chunk.read(3).unwrap().unwrap();
        assert_eq!(&got.raw[..], b"line 3");
        assert!(chunk.read(10).unwrap().is_none());
    }

    #[test]
    fn reopen_sealed_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let id = ChunkId::now();
        {
            let chunk = FileChunk::create(dir.path(), id, true).unwrap();
            for i in 0..5i64 {
                chunk.append(&rec(i, &format!("payload {}", i))).unwrap();
            }
            chunk.seal().unwrap();
        }

        let chunk = FileChunk::open(&dir.path().join(id.to_string()), true).unwrap();
        assert!(chunk.is_sealed());
        let meta = chunk.meta();
        assert_eq!(meta.record_count, 5);
        assert_eq!(chunk.read(4).unwrap().unwrap().raw, &b"payload 4"[..]);
    }

    #[test]
    fn reopen_active_chunk_and_continue() {
        let dir = tempfile::tempdir().unwrap();
        let id = ChunkId::now();
        {
            let chunk = FileChunk::create(dir.path(), id, false).unwrap();
            chunk.append(&rec(1, "one")).unwrap();
            chunk.append(&rec(2, "two")).unwrap();
            // dropped without sealing
        }

        let chunk = FileChunk::open(&dir.path().join(id.to_string()), false).unwrap();
        assert!(!chunk.is_sealed());
        assert_eq!(chunk.meta().record_count, 2);
        chunk.append(&rec(3, "three")).unwrap();
        assert_eq!(chunk.meta().record_count, 3);
        assert_eq!(chunk.read(2).unwrap().unwrap().raw, &b"three"[..]);
    }

    #[test]
    fn recovery_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let id = ChunkId::now();
        let chunk_dir = dir.path().join(id.to_string());
        {
            let chunk = FileChunk::create(dir.path(), id, false).unwrap();
            chunk.append(&rec(1, "good")).unwrap();
            chunk.append(&rec(2, "torn")).unwrap();
        }

        // tear the last frame: cut 3 bytes off data.log
        let data_path = chunk_dir.join(DATA_LOG_NAME);
        let len = std::fs::metadata(&data_path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&data_path)
            .unwrap()
            .set_len(len - 3)
            .unwrap();

        let chunk = FileChunk::open(&chunk_dir, false).unwrap();
        assert_eq!(chunk.meta().record_count, 1);
        assert_eq!(chunk.read(0).unwrap().unwrap().raw, &b"good"[..]);
        assert!(chunk.read(1).unwrap().is_none());

        // appends keep working after recovery
        chunk.append(&rec(3, "after")).unwrap();
        assert_eq!(chunk.read(1).unwrap().unwrap().raw, &b"after"[..]);
    }

    #[test]
    fn find_start_position_binary_search() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = FileChunk::create(dir.path(), ChunkId::now(), false).unwrap();
        for ts in [10i64, 20, 20, 30, 40] {
            chunk.append(&rec(ts, "x")).unwrap();
        }
        assert_eq!(chunk.find_start_position(5).unwrap(), Some(0));
        assert_eq!(chunk.find_start_position(10).unwrap(), Some(0));
        assert_eq!(chunk.find_start_position(15).unwrap(), Some(1));
        assert_eq!(chunk.find_start_position(20).unwrap(), Some(1));
        assert_eq!(chunk.find_start_position(21).unwrap(), Some(3));
        assert_eq!(chunk.find_start_position(40).unwrap(), Some(4));
        assert_eq!(chunk.find_start_position(41).unwrap(), None);
    }

    #[test]
    fn cursor_survives_concurrent_seal() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = Arc::new(FileChunk::create(dir.path(), ChunkId::now(), false).unwrap());
        for i in 0..4i64 {
            chunk.append(&rec(i, "r")).unwrap();
        }

        let mut cursor = ChunkCursor::new(chunk.clone() as Arc<dyn Chunk>, 0);
        assert!(cursor.next().unwrap().is_some());
        chunk.seal().unwrap();
        let mut rest = 0;
        while cursor.next().unwrap().is_some() {
            rest += 1;
        }
        assert_eq!(rest, 3);
    }

    #[test]
    fn timestamps_without_body_io() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = FileChunk::create(dir.path(), ChunkId::now(), false).unwrap();
        for ts in [7i64, 8, 9] {
            chunk.append(&rec(ts, "z")).unwrap();
        }
        let ts = chunk.read_write_timestamps(&[0, 2]).unwrap();
        assert_eq!(ts, vec![7, 9]);
        assert_eq!(chunk.io_stats().body_reads, 0);
        assert!(chunk.read_write_timestamps(&[3]).is_err());
    }
}
