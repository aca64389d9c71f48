//! The orchestrator binds everything together: it owns one chunk manager
//! and one index manager per vault (keyed by vault id - managers refer
//! back by id only, so there are no ownership cycles), routes incoming
//! records through the compiled filter set, and drives background jobs
//! through the scheduler.
//!
//! Ingestion is queue-based: `ingest` stamps the record and enqueues it, a
//! small worker pool routes and appends. When the queue is full the caller
//! gets `Overloaded` and decides whether to drop or retry. On shutdown the
//! queue is drained to empty before the workers stop.

mod vault;
pub use vault::*;

mod ingest;
pub use ingest::*;

mod jobs;
pub use jobs::*;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use log::{info, warn};
use uuid::Uuid;

use crate::config::{ConfigData, FilterConfig, RotationPolicyConfig, VaultConfig};
use crate::scheduler::Scheduler;
use crate::store::{CompiledRotation, Record, VaultId};
use crate::tools::sync::{lock, rlock, wlock};
use crate::{Error, Result};

/// Tunables of one engine instance.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Default parent directory for file vaults without an explicit path.
    pub data_dir: PathBuf,
    /// Ingest queue capacity; a full queue makes `ingest` return
    /// `Overloaded`.
    pub queue_capacity: usize,
    /// Ingest worker threads.
    pub ingest_workers: usize,
    /// Background job concurrency.
    pub max_concurrent_jobs: usize,
    /// Unique-entry budget of the kv extraction indexes, per chunk.
    pub kv_index_budget: usize,
}

impl OrchestratorOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> OrchestratorOptions {
        OrchestratorOptions {
            data_dir: data_dir.into(),
            queue_capacity: 1024,
            ingest_workers: 2,
            max_concurrent_jobs: 4,
            kv_index_budget: 8192,
        }
    }
}

pub(crate) struct Shared {
    pub(crate) options: OrchestratorOptions,
    pub(crate) vaults: RwLock<BTreeMap<VaultId, Arc<VaultHandle>>>,
    pub(crate) filters: RwLock<BTreeMap<Uuid, FilterConfig>>,
    pub(crate) policies: RwLock<BTreeMap<Uuid, RotationPolicyConfig>>,
    pub(crate) filter_set: RwLock<Arc<FilterSet>>,
    pub(crate) scheduler: Scheduler,
    pub(crate) in_flight: AtomicU64,
    pub(crate) overloaded: AtomicU64,
    pub(crate) stopping: AtomicBool,
}

/// The engine's front door.
pub struct Orchestrator {
    pub(crate) shared: Arc<Shared>,
    pub(crate) ingest_tx: Mutex<Option<crossbeam_channel::Sender<Record>>>,
    pub(crate) workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(options: OrchestratorOptions) -> Result<Arc<Orchestrator>> {
        std::fs::create_dir_all(&options.data_dir)?;
        let scheduler = Scheduler::new(options.max_concurrent_jobs);
        let shared = Arc::new(Shared {
            options,
            vaults: RwLock::new(BTreeMap::new()),
            filters: RwLock::new(BTreeMap::new()),
            policies: RwLock::new(BTreeMap::new()),
            filter_set: RwLock::new(Arc::new(FilterSet::empty())),
            scheduler,
            in_flight: AtomicU64::new(0),
            overloaded: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
        });

        let orch = Arc::new(Orchestrator {
            shared: shared.clone(),
            ingest_tx: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        });
        orch.start_ingest_workers();
        Ok(orch)
    }

    /// Construct an engine from a persisted configuration: register all
    /// filters and rotation policies first, then bring up every vault.
    pub fn open(options: OrchestratorOptions, config: &ConfigData) -> Result<Arc<Orchestrator>> {
        let orch = Orchestrator::new(options)?;
        {
            let mut filters = wlock(&orch.shared.filters);
            for (id, filter) in &config.filters {
                filters.insert(*id, filter.clone());
            }
            let mut policies = wlock(&orch.shared.policies);
            for (id, policy) in &config.rotation_policies {
                policies.insert(*id, policy.clone());
            }
        }
        for vault in config.vaults.values() {
            if let Err(err) = orch.add_vault(vault.clone()) {
                warn!("vault {} ({}) failed to open: {}", vault.name, vault.id, err);
            }
        }
        Ok(orch)
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.shared.options
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    // ---- vault lifecycle ----

    /// Create and register a vault. Sealed chunks found on disk that are
    /// missing indexes get their builds scheduled in the background.
    pub fn add_vault(&self, cfg: VaultConfig) -> Result<VaultId> {
        {
            let vaults = rlock(&self.shared.vaults);
            if vaults.contains_key(&cfg.id) {
                return Err(Error::invalid(format!("vault {} already exists", cfg.id)));
            }
            if vaults.values().any(|v| v.name() == cfg.name) {
                return Err(Error::invalid(format!(
                    "vault name '{}' already in use",
                    cfg.name
                )));
            }
        }

        let rotation = self.resolve_rotation(&cfg)?;
        let handle = VaultHandle::open(&self.shared.options, cfg, rotation)?;
        self.check_nesting(&handle)?;
        let id = handle.id();

        wlock(&self.shared.vaults).insert(id, Arc::new(handle));
        self.rebuild_filter_set();

        // index whatever history is missing indexes
        let handle = self.vault(id)?;
        for chunk in handle.chunk_manager().chunks() {
            if chunk.is_sealed() && !handle.index_manager().indexes_complete(chunk.id()) {
                schedule_index_build(&self.shared, &handle, chunk.id());
            }
        }

        info!("vault {} ({}) registered", self.vault(id)?.name(), id);
        Ok(id)
    }

    /// Update a vault's configuration in place. The storage type and
    /// parameters are fixed at creation (use migration to change them);
    /// name, filter, rotation policy and retention may change.
    pub fn update_vault(&self, cfg: VaultConfig) -> Result<()> {
        let handle = self.vault(cfg.id)?;
        let current = handle.config();
        if cfg.vault_type != current.vault_type || cfg.params != current.params {
            return Err(Error::invalid(
                "vault type and params cannot change; migrate instead",
            ));
        }
        {
            let vaults = rlock(&self.shared.vaults);
            if vaults
                .values()
                .any(|v| v.id() != cfg.id && v.name() == cfg.name)
            {
                return Err(Error::invalid(format!(
                    "vault name '{}' already in use",
                    cfg.name
                )));
            }
        }
        let rotation = self.resolve_rotation(&cfg)?;
        handle.chunk_manager().set_rotation(rotation);
        let enabled = cfg.enabled;
        handle.update_config(cfg);
        if enabled != current.enabled {
            if enabled {
                self.enable_vault(handle.id())?;
            } else {
                self.disable_vault(handle.id())?;
            }
        } else {
            self.rebuild_filter_set();
        }
        Ok(())
    }

    pub fn vault(&self, id: VaultId) -> Result<Arc<VaultHandle>> {
        rlock(&self.shared.vaults)
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("vault {}", id)))
    }

    pub fn vault_by_name(&self, name: &str) -> Result<Arc<VaultHandle>> {
        rlock(&self.shared.vaults)
            .values()
            .find(|v| v.name() == name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("vault '{}'", name)))
    }

    /// All vaults, ordered by id.
    pub fn list_vaults(&self) -> Vec<Arc<VaultHandle>> {
        rlock(&self.shared.vaults).values().cloned().collect()
    }

    /// Stop accepting writes into the vault and seal its active chunk.
    pub fn disable_vault(&self, id: VaultId) -> Result<()> {
        let handle = self.vault(id)?;
        handle.set_enabled(false);
        self.rebuild_filter_set();
        if let Some(sealed) = handle.chunk_manager().seal_active()? {
            schedule_index_build(&self.shared, &handle, sealed);
        }
        info!("vault {} disabled", id);
        Ok(())
    }

    /// Re-enable a disabled vault with a fresh active chunk.
    pub fn enable_vault(&self, id: VaultId) -> Result<()> {
        let handle = self.vault(id)?;
        handle.chunk_manager().ensure_active()?;
        handle.set_enabled(true);
        self.rebuild_filter_set();
        info!("vault {} enabled", id);
        Ok(())
    }

    /// Remove an empty vault. Refuses when any record is stored.
    pub fn remove_vault(&self, id: VaultId) -> Result<()> {
        let handle = self.vault(id)?;
        let (records, _) = handle.chunk_manager().totals();
        if records > 0 {
            return Err(Error::precondition(format!(
                "vault {} is not empty ({} records)",
                id, records
            )));
        }
        self.teardown_vault(handle)
    }

    /// Remove a vault and every record in it.
    pub fn force_remove_vault(&self, id: VaultId) -> Result<()> {
        let handle = self.vault(id)?;
        self.teardown_vault(handle)
    }

    fn teardown_vault(&self, handle: Arc<VaultHandle>) -> Result<()> {
        teardown_vault(&self.shared, handle)
    }

    // ---- filter / rotation policy registry ----

    /// Create or update a named filter. The expression is compiled up
    /// front so a broken filter never reaches the routing path.
    pub fn set_filter(&self, cfg: FilterConfig) -> Result<()> {
        crate::filter::CompiledFilter::compile(&cfg.expression)?;
        wlock(&self.shared.filters).insert(cfg.id, cfg);
        self.rebuild_filter_set();
        Ok(())
    }

    pub fn delete_filter(&self, id: Uuid) -> Result<()> {
        {
            let vaults = rlock(&self.shared.vaults);
            if let Some(user) = vaults.values().find(|v| v.config().filter_id == Some(id)) {
                return Err(Error::precondition(format!(
                    "filter {} is used by vault '{}'",
                    id,
                    user.name()
                )));
            }
        }
        wlock(&self.shared.filters)
            .remove(&id)
            .ok_or_else(|| Error::not_found(format!("filter {}", id)))?;
        self.rebuild_filter_set();
        Ok(())
    }

    pub fn filter_config(&self, id: Uuid) -> Option<FilterConfig> {
        rlock(&self.shared.filters).get(&id).cloned()
    }

    pub fn set_rotation_policy(&self, cfg: RotationPolicyConfig) -> Result<()> {
        let compiled = cfg.policy.compile()?;
        wlock(&self.shared.policies).insert(cfg.id, cfg.clone());
        // push the new policy into every vault referencing it
        for handle in self.list_vaults() {
            if handle.config().rotation_policy_id == Some(cfg.id) {
                handle.chunk_manager().set_rotation(compiled.clone());
            }
        }
        Ok(())
    }

    pub fn delete_rotation_policy(&self, id: Uuid) -> Result<()> {
        {
            let vaults = rlock(&self.shared.vaults);
            if let Some(user) = vaults
                .values()
                .find(|v| v.config().rotation_policy_id == Some(id))
            {
                return Err(Error::precondition(format!(
                    "rotation policy {} is used by vault '{}'",
                    id,
                    user.name()
                )));
            }
        }
        wlock(&self.shared.policies)
            .remove(&id)
            .ok_or_else(|| Error::not_found(format!("rotation policy {}", id)))?;
        Ok(())
    }

    fn resolve_rotation(&self, cfg: &VaultConfig) -> Result<CompiledRotation> {
        match cfg.rotation_policy_id {
            Some(id) => {
                let policies = rlock(&self.shared.policies);
                let policy = policies
                    .get(&id)
                    .ok_or_else(|| Error::not_found(format!("rotation policy {}", id)))?;
                policy.policy.compile()
            }
            None => Ok(CompiledRotation::none()),
        }
    }

    fn check_nesting(&self, candidate: &VaultHandle) -> Result<()> {
        let candidate_dir = match candidate.data_dir() {
            Some(dir) => dir,
            None => return Ok(()),
        };
        let vaults = rlock(&self.shared.vaults);
        for other in vaults.values() {
            if let Some(dir) = other.data_dir() {
                if dir.starts_with(&candidate_dir) || candidate_dir.starts_with(&dir) {
                    return Err(Error::invalid(format!(
                        "vault directory {:?} nests with vault '{}' ({:?})",
                        candidate_dir,
                        other.name(),
                        dir
                    )));
                }
            }
        }
        Ok(())
    }

    /// Engine-wide ingest statistics.
    pub fn ingest_stats(&self) -> IngestStats {
        IngestStats {
            queued: lock(&self.ingest_tx)
                .as_ref()
                .map(|tx| tx.len() as u64)
                .unwrap_or(0),
            overloaded: self.shared.overloaded.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Snapshot of queue pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub queued: u64,
    pub overloaded: u64,
}

/// Unroute a vault, delete its chunks and indexes, and drop it from the
/// registry. Used by remove / force-remove and by the migration job after
/// all chunks have moved out.
pub(crate) fn teardown_vault(shared: &Shared, handle: Arc<VaultHandle>) -> Result<()> {
    let id = handle.id();

    // unroute first so no worker appends while we tear down
    handle.set_enabled(false);
    rebuild_filter_set(shared);

    handle.chunk_manager().seal_active()?;
    for chunk in handle.chunk_manager().chunks() {
        handle.index_manager().delete_indexes(chunk.id())?;
        handle.chunk_manager().delete(chunk.id())?;
    }
    if let Some(dir) = handle.data_dir() {
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
    }

    wlock(&shared.vaults).remove(&id);
    rebuild_filter_set(shared);
    info!("vault {} removed", id);
    Ok(())
}
