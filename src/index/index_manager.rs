use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::index::{
    read_index_file, write_index_file, IndexData, IndexKind, IndexReader, IndexSetBuilder,
};
use crate::store::{Chunk, ChunkBackend, ChunkCursor, ChunkId, VaultId};
use crate::tools::sync::lock;
use crate::{Error, Result};

pub const INDEXES_META_NAME: &str = "indexes.meta";

const INDEXES_META_VERSION: u32 = 1;

/// Completion state of one index of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    /// Build finished and every record is represented.
    Complete,
    /// Build finished but the entry budget was exhausted; lookups must
    /// treat absence as "unknown".
    Capped,
    /// Not built (or a previous build did not finish).
    Missing,
}

#[derive(Serialize, Deserialize)]
struct IndexesMetaFile {
    version: u32,
    states: BTreeMap<String, IndexState>,
}

#[derive(Default)]
struct MemIndexes {
    states: BTreeMap<IndexKind, IndexState>,
    data: BTreeMap<IndexKind, Arc<IndexData>>,
}

/// Builds and opens the indexes of one vault's chunks.
///
/// Refers to chunks only through the storage backend and ids handed in by
/// the caller - never back into the chunk manager - so the orchestrator
/// can own both sides without reference cycles.
pub struct IndexManager {
    vault_id: VaultId,
    backend: Arc<dyn ChunkBackend>,
    kv_budget: usize,
    mem: Mutex<HashMap<ChunkId, MemIndexes>>,
    cache: Mutex<HashMap<(ChunkId, IndexKind), Arc<IndexData>>>,
}

impl IndexManager {
    pub fn new(vault_id: VaultId, backend: Arc<dyn ChunkBackend>, kv_budget: usize) -> IndexManager {
        IndexManager {
            vault_id,
            backend,
            kv_budget,
            mem: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn vault_id(&self) -> VaultId {
        self.vault_id
    }

    /// Build all indexes for a sealed chunk. Idempotent: a chunk whose
    /// indexes are already complete is left alone. Index files are written
    /// atomically and the completion record last, so an interrupted build
    /// leaves the chunk "indexes incomplete" rather than half-indexed.
    pub fn build_indexes(&self, chunk: &Arc<dyn Chunk>) -> Result<()> {
        if !chunk.is_sealed() {
            return Err(Error::precondition(format!(
                "chunk {} is not sealed, cannot index",
                chunk.id()
            )));
        }
        let chunk_id = chunk.id();
        if self.indexes_complete(chunk_id) {
            debug!("chunk {}: indexes already complete", chunk_id);
            return Ok(());
        }

        let mut builder = IndexSetBuilder::new(self.kv_budget);
        let mut cursor = ChunkCursor::new(chunk.clone(), 0);
        while let Some((position, rec)) = cursor.next()? {
            builder.add_record(position, &rec);
        }
        let indexes = builder.finish();

        let mut states = BTreeMap::new();
        for (kind, data) in &indexes {
            let state = if data.capped {
                IndexState::Capped
            } else {
                IndexState::Complete
            };
            states.insert(*kind, state);
        }

        match self.backend.index_dir(chunk_id) {
            Some(dir) => {
                for (kind, data) in &indexes {
                    write_index_file(&dir.join(kind.file_name()), data)?;
                }
                let file = IndexesMetaFile {
                    version: INDEXES_META_VERSION,
                    states: states
                        .iter()
                        .map(|(k, s)| (k.name().to_owned(), *s))
                        .collect(),
                };
                let raw = serde_json::to_vec_pretty(&file)
                    .map_err(|err| Error::internal(format!("encode indexes.meta: {}", err)))?;
                crate::tools::replace_file(dir.join(INDEXES_META_NAME), &raw)?;
            }
            None => {
                let mut mem = lock(&self.mem);
                let slot = mem.entry(chunk_id).or_insert_with(MemIndexes::default);
                slot.states = states.clone();
                slot.data = indexes
                    .iter()
                    .map(|(k, d)| (*k, Arc::new(d.clone())))
                    .collect();
            }
        }

        // a rebuild may replace capped indexes, drop stale cached data
        let mut cache = lock(&self.cache);
        for kind in IndexKind::ALL.iter() {
            cache.remove(&(chunk_id, *kind));
        }

        info!(
            "vault {}: built indexes for chunk {} ({} records)",
            self.vault_id,
            chunk_id,
            chunk.meta().record_count
        );
        Ok(())
    }

    /// Delete all index files (or in-memory indexes) of a chunk.
    pub fn delete_indexes(&self, chunk_id: ChunkId) -> Result<()> {
        match self.backend.index_dir(chunk_id) {
            Some(dir) => {
                for kind in IndexKind::ALL.iter() {
                    let path = dir.join(kind.file_name());
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                let meta = dir.join(INDEXES_META_NAME);
                match std::fs::remove_file(&meta) {
                    Ok(()) => {}
                    Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
            None => {
                lock(&self.mem).remove(&chunk_id);
            }
        }
        let mut cache = lock(&self.cache);
        for kind in IndexKind::ALL.iter() {
            cache.remove(&(chunk_id, *kind));
        }
        Ok(())
    }

    /// Per-index completion states. Indexes without a completion record
    /// report [`IndexState::Missing`].
    pub fn states(&self, chunk_id: ChunkId) -> BTreeMap<IndexKind, IndexState> {
        let mut states: BTreeMap<IndexKind, IndexState> = IndexKind::ALL
            .iter()
            .map(|k| (*k, IndexState::Missing))
            .collect();

        match self.backend.index_dir(chunk_id) {
            Some(dir) => {
                let raw = match std::fs::read(dir.join(INDEXES_META_NAME)) {
                    Ok(raw) => raw,
                    Err(_) => return states,
                };
                let file: IndexesMetaFile = match serde_json::from_slice(&raw) {
                    Ok(file) => file,
                    Err(_) => return states,
                };
                for (name, state) in file.states {
                    if let Some(kind) = IndexKind::from_name(&name) {
                        states.insert(kind, state);
                    }
                }
            }
            None => {
                if let Some(slot) = lock(&self.mem).get(&chunk_id) {
                    for (kind, state) in &slot.states {
                        states.insert(*kind, *state);
                    }
                }
            }
        }
        states
    }

    /// Whether every index of the chunk is usable (complete or capped).
    /// Chunks that fail this are queried in scan mode.
    pub fn indexes_complete(&self, chunk_id: ChunkId) -> bool {
        self.states(chunk_id)
            .values()
            .all(|s| *s != IndexState::Missing)
    }

    /// Open one index of a sealed chunk for lookups.
    pub fn open(&self, chunk_id: ChunkId, kind: IndexKind) -> Result<IndexReader> {
        {
            let cache = lock(&self.cache);
            if let Some(data) = cache.get(&(chunk_id, kind)) {
                return Ok(IndexReader::new(kind, data.clone()));
            }
        }

        let data = match self.backend.index_dir(chunk_id) {
            Some(dir) => Arc::new(read_index_file(&dir.join(kind.file_name()))?),
            None => lock(&self.mem)
                .get(&chunk_id)
                .and_then(|slot| slot.data.get(&kind).cloned())
                .ok_or_else(|| {
                    Error::not_found(format!("index {} of chunk {}", kind.name(), chunk_id))
                })?,
        };

        lock(&self.cache).insert((chunk_id, kind), data.clone());
        Ok(IndexReader::new(kind, data))
    }

    /// Size in bytes of each index of the chunk.
    pub fn index_sizes(&self, chunk_id: ChunkId) -> Result<BTreeMap<String, u64>> {
        let mut sizes = BTreeMap::new();
        match self.backend.index_dir(chunk_id) {
            Some(dir) => {
                for kind in IndexKind::ALL.iter() {
                    let path = dir.join(kind.file_name());
                    match std::fs::metadata(&path) {
                        Ok(meta) => {
                            sizes.insert(kind.name().to_owned(), meta.len());
                        }
                        Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                }
            }
            None => {
                if let Some(slot) = lock(&self.mem).get(&chunk_id) {
                    for (kind, data) in &slot.data {
                        sizes.insert(kind.name().to_owned(), data.approx_bytes());
                    }
                }
            }
        }
        Ok(sizes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileBackend, MemoryBackend, Record};

    fn fill(chunk: &Arc<dyn Chunk>) {
        let lines = ["user login ok", "user logout ok", "error network"];
        for (i, line) in lines.iter().enumerate() {
            let mut rec = Record::new(line.as_bytes().to_vec());
            rec.write_ts = i as i64;
            chunk.append(&rec).unwrap();
        }
        chunk.seal().unwrap();
    }

    #[test]
    fn build_and_lookup_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn ChunkBackend> =
            Arc::new(FileBackend::open(dir.path(), false).unwrap());
        let manager = IndexManager::new(VaultId::new_v4(), backend.clone(), 1000);

        let chunk = backend.create_chunk(ChunkId::now()).unwrap();
        let id = chunk.id();
        assert!(!manager.indexes_complete(id));
        fill(&chunk);

        manager.build_indexes(&chunk).unwrap();
        assert!(manager.indexes_complete(id));

        let token = manager.open(id, IndexKind::Token).unwrap();
        assert_eq!(token.lookup("user", ""), Some(&[0u64, 1][..]));
        assert_eq!(token.lookup("error", ""), Some(&[2u64][..]));
        assert_eq!(token.lookup("missing", ""), None);

        let sizes = manager.index_sizes(id).unwrap();
        assert_eq!(sizes.len(), 7);
        assert!(sizes["token"] > 0);
    }

    #[test]
    fn build_requires_sealed_chunk() {
        let backend: Arc<dyn ChunkBackend> = Arc::new(MemoryBackend::new());
        let manager = IndexManager::new(VaultId::new_v4(), backend.clone(), 1000);
        let chunk = backend.create_chunk(ChunkId::now()).unwrap();
        assert!(matches!(
            manager.build_indexes(&chunk),
            Err(Error::FailedPrecondition(_))
        ));
    }

    #[test]
    fn delete_indexes_resets_completion() {
        let backend: Arc<dyn ChunkBackend> = Arc::new(MemoryBackend::new());
        let manager = IndexManager::new(VaultId::new_v4(), backend.clone(), 1000);
        let chunk = backend.create_chunk(ChunkId::now()).unwrap();
        fill(&chunk);

        manager.build_indexes(&chunk).unwrap();
        assert!(manager.indexes_complete(chunk.id()));

        manager.delete_indexes(chunk.id()).unwrap();
        assert!(!manager.indexes_complete(chunk.id()));
        assert!(manager.open(chunk.id(), IndexKind::Token).is_err());
    }

    #[test]
    fn capped_state_is_recorded() {
        let backend: Arc<dyn ChunkBackend> = Arc::new(MemoryBackend::new());
        let manager = IndexManager::new(VaultId::new_v4(), backend.clone(), 2);
        let chunk = backend.create_chunk(ChunkId::now()).unwrap();
        let mut rec = Record::new(&b"a=1 b=2 c=3"[..]);
        rec.write_ts = 1;
        chunk.append(&rec).unwrap();
        chunk.seal().unwrap();

        manager.build_indexes(&chunk).unwrap();
        let states = manager.states(chunk.id());
        assert_eq!(states[&IndexKind::KvKv], IndexState::Capped);
        assert_eq!(states[&IndexKind::Token], IndexState::Complete);
        // capped still counts as usable
        assert!(manager.indexes_complete(chunk.id()));
    }
}
