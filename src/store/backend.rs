use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::warn;
use walkdir::WalkDir;

use crate::store::{Chunk, ChunkId, FileChunk, MemChunk, META_NAME};
use crate::tools::sync::lock;
use crate::{Error, Result};

/// Storage backend of one vault: creates, enumerates and deletes chunks.
///
/// The chunk manager owns the chunks; the backend only knows how to
/// materialize them. File backends additionally support *moving* whole
/// chunks between vaults (`as_mover`), which migration uses to preserve
/// chunk files byte-for-byte.
pub trait ChunkBackend: Send + Sync {
    fn create_chunk(&self, id: ChunkId) -> Result<Arc<dyn Chunk>>;

    /// All chunks currently present in the backend, unordered.
    fn load_chunks(&self) -> Result<Vec<Arc<dyn Chunk>>>;

    fn delete_chunk(&self, id: ChunkId) -> Result<()>;

    /// Directory holding a chunk's auxiliary index files, when the backend
    /// is file-based.
    fn index_dir(&self, id: ChunkId) -> Option<PathBuf>;

    fn as_mover(&self) -> Option<&dyn ChunkMover>;
}

/// Filesystem-level chunk transfer between vaults.
pub trait ChunkMover {
    /// Detach a chunk directory from this backend without deleting it;
    /// returns the detached path. Only valid for sealed chunks.
    fn disown_chunk(&self, id: ChunkId) -> Result<PathBuf>;

    /// Move a previously disowned chunk directory into this backend and
    /// open it.
    fn adopt_chunk(&self, dir: &Path) -> Result<Arc<dyn Chunk>>;
}

/// File-backed vault storage: one subdirectory per chunk under the vault
/// directory, named by chunk id.
pub struct FileBackend {
    root: PathBuf,
    compress: bool,
}

impl FileBackend {
    pub fn open(root: impl Into<PathBuf>, compress: bool) -> Result<FileBackend> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(FileBackend { root, compress })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chunk_dir(&self, id: ChunkId) -> PathBuf {
        self.root.join(id.to_string())
    }
}

impl ChunkBackend for FileBackend {
    fn create_chunk(&self, id: ChunkId) -> Result<Arc<dyn Chunk>> {
        Ok(Arc::new(FileChunk::create(&self.root, id, self.compress)?))
    }

    fn load_chunks(&self) -> Result<Vec<Arc<dyn Chunk>>> {
        let mut chunks: Vec<Arc<dyn Chunk>> = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|err| Error::internal(format!("walk vault dir: {}", err)))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if ChunkId::parse(&name).is_err() {
                warn!("ignoring foreign directory {:?} in vault dir", entry.path());
                continue;
            }
            chunks.push(Arc::new(FileChunk::open(entry.path(), self.compress)?));
        }
        Ok(chunks)
    }

    fn delete_chunk(&self, id: ChunkId) -> Result<()> {
        let dir = self.chunk_dir(id);
        if !dir.exists() {
            return Err(Error::not_found(format!("chunk {}", id)));
        }
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    fn index_dir(&self, id: ChunkId) -> Option<PathBuf> {
        Some(self.chunk_dir(id))
    }

    fn as_mover(&self) -> Option<&dyn ChunkMover> {
        Some(self)
    }
}

impl ChunkMover for FileBackend {
    fn disown_chunk(&self, id: ChunkId) -> Result<PathBuf> {
        let dir = self.chunk_dir(id);
        if !dir.exists() {
            return Err(Error::not_found(format!("chunk {}", id)));
        }
        if !dir.join(META_NAME).exists() {
            return Err(Error::precondition(format!(
                "chunk {} is not sealed, refusing to move",
                id
            )));
        }
        let mut detached = self.root.join(format!("{}.moving", id));
        // pick a free name; a previous interrupted move may have left one
        let mut n = 0;
        while detached.exists() {
            n += 1;
            detached = self.root.join(format!("{}.moving.{}", id, n));
        }
        std::fs::rename(&dir, &detached)?;
        Ok(detached)
    }

    fn adopt_chunk(&self, dir: &Path) -> Result<Arc<dyn Chunk>> {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::invalid(format!("bad chunk directory {:?}", dir)))?;
        let id_part = name.split('.').next().unwrap_or(name);
        let id = ChunkId::parse(id_part)?;

        let target = self.chunk_dir(id);
        if target.exists() {
            return Err(Error::precondition(format!(
                "chunk {} already exists in target vault",
                id
            )));
        }
        std::fs::rename(dir, &target)?;
        Ok(Arc::new(FileChunk::open(&target, self.compress)?))
    }
}

/// Storage for `memory` vaults. Chunks exist only while the process runs;
/// a map keeps them addressable for delete and reload.
pub struct MemoryBackend {
    chunks: Mutex<HashMap<ChunkId, Arc<MemChunk>>>,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend {
            chunks: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkBackend for MemoryBackend {
    fn create_chunk(&self, id: ChunkId) -> Result<Arc<dyn Chunk>> {
        let chunk = Arc::new(MemChunk::new(id));
        lock(&self.chunks).insert(id, chunk.clone());
        Ok(chunk)
    }

    fn load_chunks(&self) -> Result<Vec<Arc<dyn Chunk>>> {
        Ok(lock(&self.chunks)
            .values()
            .map(|c| c.clone() as Arc<dyn Chunk>)
            .collect())
    }

    fn delete_chunk(&self, id: ChunkId) -> Result<()> {
        lock(&self.chunks)
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("chunk {}", id)))
    }

    fn index_dir(&self, _id: ChunkId) -> Option<PathBuf> {
        None
    }

    fn as_mover(&self) -> Option<&dyn ChunkMover> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Record;

    #[test]
    fn file_backend_create_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path(), false).unwrap();

        let a = backend.create_chunk(ChunkId::now()).unwrap();
        let b = backend.create_chunk(ChunkId::now()).unwrap();
        a.append(&Record::new(&b"x"[..])).unwrap();
        a.seal().unwrap();

        let loaded = backend.load_chunks().unwrap();
        assert_eq!(loaded.len(), 2);

        backend.delete_chunk(b.id()).unwrap();
        assert_eq!(backend.load_chunks().unwrap().len(), 1);
        assert!(matches!(
            backend.delete_chunk(b.id()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn disown_adopt_moves_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let src = FileBackend::open(dir.path().join("src"), false).unwrap();
        let dst = FileBackend::open(dir.path().join("dst"), false).unwrap();

        let chunk = src.create_chunk(ChunkId::now()).unwrap();
        let id = chunk.id();
        let mut rec = Record::new(&b"moved"[..]);
        rec.write_ts = 99;
        chunk.append(&rec).unwrap();

        // unsealed chunks must not move
        assert!(src.disown_chunk(id).is_err());
        chunk.seal().unwrap();

        let detached = src.disown_chunk(id).unwrap();
        assert!(src.load_chunks().unwrap().is_empty());

        let adopted = dst.adopt_chunk(&detached).unwrap();
        assert_eq!(adopted.id(), id);
        assert_eq!(adopted.meta().record_count, 1);
        assert_eq!(adopted.read(0).unwrap().unwrap().write_ts, 99);
    }
}
