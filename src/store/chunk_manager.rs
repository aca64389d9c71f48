use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use log::{info, warn};

use crate::store::{
    Chunk, ChunkBackend, ChunkCursor, ChunkId, ChunkMeta, CompiledRotation, Record, VaultId,
};
use crate::tools::sync::{lock, rlock, wlock};
use crate::{Error, Result};

/// Where an append landed, plus the chunk that got sealed when the append
/// tripped the rotation policy.
#[derive(Debug, Clone, Copy)]
pub struct AppendOutcome {
    pub chunk_id: ChunkId,
    pub position: u64,
    pub rotated: Option<ChunkId>,
}

struct ActiveChunk {
    chunk: Arc<dyn Chunk>,
    created_ns: i64,
}

struct ManagerState {
    active: Option<ActiveChunk>,
    sealed: BTreeMap<ChunkId, Arc<dyn Chunk>>,
}

/// Manages the chunk set of one vault: exactly one active chunk while the
/// vault is enabled, plus the sealed history, plus the rotation policy.
///
/// Appends are serialized by the append lock (one writer per vault);
/// everything else reads shared immutable state. A rotation seals the
/// active chunk and synchronously creates its successor, so the next
/// append always has somewhere to go.
pub struct ChunkManager {
    vault_id: VaultId,
    backend: Arc<dyn ChunkBackend>,
    rotation: RwLock<CompiledRotation>,
    state: RwLock<ManagerState>,
    append_lock: Mutex<()>,
}

impl ChunkManager {
    /// Open the manager over whatever the backend already holds. With
    /// `start_active`, ensures an active chunk exists (normal enabled
    /// vault); without, the vault comes up with sealed chunks only
    /// (disabled vault).
    pub fn open(
        vault_id: VaultId,
        backend: Arc<dyn ChunkBackend>,
        rotation: CompiledRotation,
        start_active: bool,
    ) -> Result<ChunkManager> {
        let mut sealed = BTreeMap::new();
        let mut unsealed: Vec<Arc<dyn Chunk>> = Vec::new();
        for chunk in backend.load_chunks()? {
            if chunk.is_sealed() {
                sealed.insert(chunk.id(), chunk);
            } else {
                unsealed.push(chunk);
            }
        }

        // at most one active chunk may exist; seal stragglers from an
        // interrupted rotation, keeping the newest one active
        unsealed.sort_by_key(|c| c.id());
        let active = unsealed.pop();
        for chunk in unsealed {
            warn!(
                "vault {}: sealing stray unsealed chunk {}",
                vault_id,
                chunk.id()
            );
            chunk.seal()?;
            sealed.insert(chunk.id(), chunk);
        }

        let manager = ChunkManager {
            vault_id,
            backend,
            rotation: RwLock::new(rotation),
            state: RwLock::new(ManagerState {
                active: active.map(|chunk| ActiveChunk {
                    created_ns: chunk.id().timestamp_nanos(),
                    chunk,
                }),
                sealed,
            }),
            append_lock: Mutex::new(()),
        };

        if start_active {
            manager.ensure_active()?;
        }
        Ok(manager)
    }

    pub fn vault_id(&self) -> VaultId {
        self.vault_id
    }

    pub fn backend(&self) -> &Arc<dyn ChunkBackend> {
        &self.backend
    }

    pub fn set_rotation(&self, rotation: CompiledRotation) {
        *wlock(&self.rotation) = rotation;
    }

    /// Append one record. Returns where it went and, when the append
    /// tripped the rotation policy, the id of the chunk that was sealed.
    pub fn append(&self, rec: &Record) -> Result<AppendOutcome> {
        let _guard = lock(&self.append_lock);

        let (chunk, created_ns) = {
            let st = rlock(&self.state);
            let active = st.active.as_ref().ok_or_else(|| {
                Error::precondition(format!("vault {} has no active chunk", self.vault_id))
            })?;
            (active.chunk.clone(), active.created_ns)
        };

        // the position index relies on write_ts being non-decreasing
        // within a chunk; near-simultaneous producers can hand records
        // over a hair out of order, so clamp instead of corrupting the
        // binary-search order
        let clamped;
        let rec = match chunk.meta() {
            meta if meta.record_count > 0 && rec.write_ts < meta.end_ts => {
                let mut copy = rec.clone();
                copy.write_ts = meta.end_ts;
                clamped = copy;
                &clamped
            }
            _ => rec,
        };

        let position = chunk.append(rec)?;
        let meta = chunk.meta();

        let rotated = {
            let rotation = rlock(&self.rotation);
            if rotation.should_rotate(&meta, created_ns, crate::tools::time::epoch_nanos()) {
                drop(rotation);
                Some(self.rotate_locked()?)
            } else {
                None
            }
        };

        Ok(AppendOutcome {
            chunk_id: meta.id,
            position,
            rotated,
        })
    }

    // caller must hold the append lock
    fn rotate_locked(&self) -> Result<ChunkId> {
        let old = {
            let st = rlock(&self.state);
            st.active
                .as_ref()
                .map(|a| a.chunk.clone())
                .ok_or_else(|| Error::internal("rotation without active chunk"))?
        };
        old.seal()?;

        let new_chunk = self.backend.create_chunk(ChunkId::now())?;
        info!(
            "vault {}: rotated chunk {} -> {}",
            self.vault_id,
            old.id(),
            new_chunk.id()
        );

        let mut st = wlock(&self.state);
        st.sealed.insert(old.id(), old.clone());
        st.active = Some(ActiveChunk {
            created_ns: new_chunk.id().timestamp_nanos(),
            chunk: new_chunk,
        });
        Ok(old.id())
    }

    /// Seal the active chunk explicitly (disable, migrate). Returns the
    /// sealed chunk's id, or `None` when the vault had no active chunk.
    pub fn seal_active(&self) -> Result<Option<ChunkId>> {
        let _guard = lock(&self.append_lock);
        let old = {
            let st = rlock(&self.state);
            match st.active.as_ref() {
                Some(a) => a.chunk.clone(),
                None => return Ok(None),
            }
        };
        old.seal()?;
        let mut st = wlock(&self.state);
        st.sealed.insert(old.id(), old.clone());
        st.active = None;
        Ok(Some(old.id()))
    }

    /// Seal the active chunk and immediately start a new one.
    pub fn rotate(&self) -> Result<ChunkId> {
        let _guard = lock(&self.append_lock);
        self.rotate_locked()
    }

    /// Make sure an active chunk exists (vault enable, startup).
    pub fn ensure_active(&self) -> Result<()> {
        let _guard = lock(&self.append_lock);
        {
            let st = rlock(&self.state);
            if st.active.is_some() {
                return Ok(());
            }
        }
        let chunk = self.backend.create_chunk(ChunkId::now())?;
        info!("vault {}: new active chunk {}", self.vault_id, chunk.id());
        let mut st = wlock(&self.state);
        st.active = Some(ActiveChunk {
            created_ns: chunk.id().timestamp_nanos(),
            chunk,
        });
        Ok(())
    }

    pub fn active_meta(&self) -> Option<ChunkMeta> {
        rlock(&self.state).active.as_ref().map(|a| a.chunk.meta())
    }

    /// Metadata of every chunk, sorted by chunk id (creation order). The
    /// active chunk, having the newest id, comes last.
    pub fn list(&self) -> Vec<ChunkMeta> {
        self.chunks().into_iter().map(|c| c.meta()).collect()
    }

    /// All chunks sorted by id.
    pub fn chunks(&self) -> Vec<Arc<dyn Chunk>> {
        let st = rlock(&self.state);
        let mut chunks: Vec<Arc<dyn Chunk>> = st.sealed.values().cloned().collect();
        if let Some(ref active) = st.active {
            chunks.push(active.chunk.clone());
        }
        chunks.sort_by_key(|c| c.id());
        chunks
    }

    pub fn chunk(&self, id: ChunkId) -> Result<Arc<dyn Chunk>> {
        let st = rlock(&self.state);
        if let Some(chunk) = st.sealed.get(&id) {
            return Ok(chunk.clone());
        }
        if let Some(ref active) = st.active {
            if active.chunk.id() == id {
                return Ok(active.chunk.clone());
            }
        }
        Err(Error::not_found(format!("chunk {}", id)))
    }

    pub fn meta(&self, id: ChunkId) -> Result<ChunkMeta> {
        Ok(self.chunk(id)?.meta())
    }

    pub fn open_cursor(&self, id: ChunkId, from_position: u64) -> Result<ChunkCursor> {
        Ok(ChunkCursor::new(self.chunk(id)?, from_position))
    }

    /// Delete a sealed chunk and its files.
    pub fn delete(&self, id: ChunkId) -> Result<()> {
        {
            let st = rlock(&self.state);
            if let Some(ref active) = st.active {
                if active.chunk.id() == id {
                    return Err(Error::precondition("cannot delete the active chunk"));
                }
            }
            if !st.sealed.contains_key(&id) {
                return Err(Error::not_found(format!("chunk {}", id)));
            }
        }
        self.backend.delete_chunk(id)?;
        wlock(&self.state).sealed.remove(&id);
        Ok(())
    }

    /// Detach a sealed chunk for a filesystem move. The chunk leaves this
    /// manager's ownership; the returned path is what the destination's
    /// [`adopt`](Self::adopt) takes.
    pub fn disown(&self, id: ChunkId) -> Result<PathBuf> {
        let mover = self
            .backend
            .as_mover()
            .ok_or_else(|| Error::precondition("vault backend cannot move chunks"))?;
        {
            let st = rlock(&self.state);
            if !st.sealed.contains_key(&id) {
                return Err(Error::not_found(format!("sealed chunk {}", id)));
            }
        }
        let path = mover.disown_chunk(id)?;
        wlock(&self.state).sealed.remove(&id);
        Ok(path)
    }

    /// Take ownership of a chunk directory detached from another vault.
    pub fn adopt(&self, dir: &Path) -> Result<ChunkId> {
        let mover = self
            .backend
            .as_mover()
            .ok_or_else(|| Error::precondition("vault backend cannot move chunks"))?;
        let chunk = mover.adopt_chunk(dir)?;
        let id = chunk.id();
        wlock(&self.state).sealed.insert(id, chunk);
        Ok(id)
    }

    /// Total records and logical bytes across all chunks.
    pub fn totals(&self) -> (u64, u64) {
        self.chunks()
            .iter()
            .map(|c| c.meta())
            .fold((0, 0), |(r, b), m| (r + m.record_count, b + m.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, RotationPolicy};

    fn manager(max_records: Option<u64>) -> ChunkManager {
        let rotation = RotationPolicy::new()
            .max_records(max_records)
            .compile()
            .unwrap();
        ChunkManager::open(
            VaultId::new_v4(),
            Arc::new(MemoryBackend::new()),
            rotation,
            true,
        )
        .unwrap()
    }

    fn rec(ts: i64, raw: &str) -> Record {
        let mut r = Record::new(raw.as_bytes().to_vec());
        r.ingest_ts = ts;
        r.write_ts = ts;
        r
    }

    #[test]
    fn rotates_on_record_limit() {
        let mgr = manager(Some(5));
        let mut rotations = 0;
        for i in 0..12i64 {
            let out = mgr.append(&rec(i, &format!("m{}", i))).unwrap();
            if out.rotated.is_some() {
                rotations += 1;
            }
        }
        assert_eq!(rotations, 2);

        let list = mgr.list();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].record_count, 5);
        assert!(list[0].sealed);
        assert_eq!(list[1].record_count, 5);
        assert!(list[1].sealed);
        assert_eq!(list[2].record_count, 2);
        assert!(!list[2].sealed);
    }

    #[test]
    fn positions_restart_in_new_chunk() {
        let mgr = manager(Some(2));
        assert_eq!(mgr.append(&rec(1, "a")).unwrap().position, 0);
        let out = mgr.append(&rec(2, "b")).unwrap();
        assert_eq!(out.position, 1);
        assert!(out.rotated.is_some());
        assert_eq!(mgr.append(&rec(3, "c")).unwrap().position, 0);
    }

    #[test]
    fn seal_active_then_ensure_active() {
        let mgr = manager(None);
        mgr.append(&rec(1, "a")).unwrap();
        let sealed = mgr.seal_active().unwrap().unwrap();
        assert!(mgr.active_meta().is_none());
        assert!(mgr.append(&rec(2, "b")).is_err());
        assert!(mgr.meta(sealed).unwrap().sealed);

        mgr.ensure_active().unwrap();
        assert!(mgr.active_meta().is_some());
        mgr.append(&rec(3, "c")).unwrap();
    }

    #[test]
    fn delete_refuses_active() {
        let mgr = manager(None);
        mgr.append(&rec(1, "a")).unwrap();
        let active_id = mgr.active_meta().unwrap().id;
        assert!(matches!(
            mgr.delete(active_id),
            Err(Error::FailedPrecondition(_))
        ));
    }
}
