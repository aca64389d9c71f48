use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::config::{VaultConfig, VaultType};
use crate::index::IndexManager;
use crate::orchestrator::OrchestratorOptions;
use crate::store::{
    ChunkBackend, ChunkManager, CompiledRotation, FileBackend, MemoryBackend, VaultId,
};
use crate::tools::sync::{rlock, wlock};
use crate::Result;

/// Per-vault ingest counters. Monotonic for the life of the handle.
#[derive(Default)]
pub struct VaultCounters {
    records: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
}

impl VaultCounters {
    pub fn count_append(&self, bytes: u64) {
        self.records.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn count_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time statistics of one vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VaultStats {
    pub vault_id: VaultId,
    /// Records routed into the vault since startup.
    pub ingested_records: u64,
    /// Logical bytes routed into the vault since startup.
    pub ingested_bytes: u64,
    /// Append errors since startup.
    pub append_errors: u64,
    /// Chunks currently stored.
    pub chunks: u64,
    /// Records currently stored across all chunks.
    pub stored_records: u64,
    /// Logical bytes currently stored across all chunks.
    pub stored_bytes: u64,
}

/// One registered vault: its configuration, managers and counters.
///
/// The handle owns the chunk manager and index manager; both refer to the
/// vault only by id, never back to the orchestrator.
pub struct VaultHandle {
    cfg: RwLock<VaultConfig>,
    data_dir: Option<PathBuf>,
    chunks: Arc<ChunkManager>,
    indexes: Arc<IndexManager>,
    counters: VaultCounters,
    enabled: AtomicBool,
}

impl VaultHandle {
    /// Materialize a vault from its configuration: build the backend,
    /// open the chunk manager over existing chunks (running recovery as
    /// needed) and set up the index manager.
    pub(crate) fn open(
        options: &OrchestratorOptions,
        cfg: VaultConfig,
        rotation: CompiledRotation,
    ) -> Result<VaultHandle> {
        let (backend, data_dir): (Arc<dyn ChunkBackend>, Option<PathBuf>) = match cfg.vault_type {
            VaultType::Memory => (Arc::new(MemoryBackend::new()), None),
            VaultType::File => {
                let dir = match cfg.path() {
                    Some(path) => PathBuf::from(path),
                    None => options.data_dir.join(cfg.id.to_string()),
                };
                std::fs::create_dir_all(&dir)?;
                let dir = dir.canonicalize()?;
                let backend = FileBackend::open(&dir, cfg.compress())?;
                (Arc::new(backend), Some(dir))
            }
        };

        let enabled = cfg.enabled;
        let chunks = Arc::new(ChunkManager::open(
            cfg.id,
            backend.clone(),
            rotation,
            enabled,
        )?);
        let indexes = Arc::new(IndexManager::new(cfg.id, backend, options.kv_index_budget));

        Ok(VaultHandle {
            cfg: RwLock::new(cfg),
            data_dir,
            chunks,
            indexes,
            counters: VaultCounters::default(),
            enabled: AtomicBool::new(enabled),
        })
    }

    pub fn id(&self) -> VaultId {
        rlock(&self.cfg).id
    }

    pub fn name(&self) -> String {
        rlock(&self.cfg).name.clone()
    }

    pub fn config(&self) -> VaultConfig {
        rlock(&self.cfg).clone()
    }

    pub(crate) fn update_config(&self, cfg: VaultConfig) {
        *wlock(&self.cfg) = cfg;
    }

    /// Canonical data directory of a file vault; `None` for memory vaults.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.data_dir.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        wlock(&self.cfg).enabled = enabled;
    }

    pub fn chunk_manager(&self) -> &Arc<ChunkManager> {
        &self.chunks
    }

    pub fn index_manager(&self) -> &Arc<IndexManager> {
        &self.indexes
    }

    pub(crate) fn counters(&self) -> &VaultCounters {
        &self.counters
    }

    pub fn stats(&self) -> VaultStats {
        let (stored_records, stored_bytes) = self.chunks.totals();
        VaultStats {
            vault_id: self.id(),
            ingested_records: self.counters.records.load(Ordering::Relaxed),
            ingested_bytes: self.counters.bytes.load(Ordering::Relaxed),
            append_errors: self.counters.errors.load(Ordering::Relaxed),
            chunks: self.chunks.list().len() as u64,
            stored_records,
            stored_bytes,
        }
    }
}

/// What the query engine needs of one vault. Snapshotted at query start,
/// so a vault removed mid-query keeps serving that query's cursors.
#[derive(Clone)]
pub struct QueryTarget {
    pub id: VaultId,
    pub name: String,
    pub chunks: Arc<ChunkManager>,
    pub indexes: Arc<IndexManager>,
}

impl crate::orchestrator::Orchestrator {
    /// Snapshot the vaults a query with the given filter applies to,
    /// ordered by vault id (the merge tie-break order).
    pub fn query_targets(
        &self,
        filter: Option<&crate::filter::CompiledFilter>,
    ) -> Vec<QueryTarget> {
        self.list_vaults()
            .into_iter()
            .filter(|handle| match filter {
                Some(f) => f.applies_to_store(&handle.id(), &handle.name()),
                None => true,
            })
            .map(|handle| QueryTarget {
                id: handle.id(),
                name: handle.name(),
                chunks: handle.chunk_manager().clone(),
                indexes: handle.index_manager().clone(),
            })
            .collect()
    }

    /// Stats of one vault.
    pub fn vault_stats(&self, id: VaultId) -> Result<VaultStats> {
        Ok(self.vault(id)?.stats())
    }
}
