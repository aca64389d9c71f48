use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, TrySendError};
use log::warn;
use uuid::Uuid;

use crate::config::FilterConfig;
use crate::filter::CompiledFilter;
use crate::orchestrator::{Orchestrator, Shared, VaultHandle};
use crate::store::{ChunkId, Record, VaultId};
use crate::tools::sync::{lock, rlock, wlock};
use crate::{Error, Result};

/// One routing entry: a filter already bound to its vault.
pub struct FilterRoute {
    pub vault_id: VaultId,
    pub filter: CompiledFilter,
}

/// The compiled filter set. Immutable; configuration changes build a new
/// set and swap the shared pointer, so a record is routed against either
/// the old set or the new one, never a mix.
pub struct FilterSet {
    routes: Vec<FilterRoute>,
}

impl FilterSet {
    pub(crate) fn empty() -> FilterSet {
        FilterSet { routes: Vec::new() }
    }

    /// Build routes for every enabled vault, in vault-id order (the order
    /// is part of the routing contract: it makes multi-vault ingestion
    /// deterministic).
    pub(crate) fn build(
        vaults: &BTreeMap<VaultId, Arc<VaultHandle>>,
        filters: &BTreeMap<Uuid, FilterConfig>,
    ) -> FilterSet {
        let mut routes = Vec::new();
        for (vault_id, handle) in vaults {
            if !handle.is_enabled() {
                continue;
            }
            let cfg = handle.config();
            let filter = match cfg.filter_id {
                None => CompiledFilter::match_all(),
                Some(filter_id) => match filters.get(&filter_id) {
                    None => {
                        warn!(
                            "vault '{}' references unknown filter {}, not routing",
                            cfg.name, filter_id
                        );
                        continue;
                    }
                    Some(filter_cfg) => match CompiledFilter::compile(&filter_cfg.expression) {
                        Ok(filter) => filter,
                        Err(err) => {
                            warn!(
                                "vault '{}': filter '{}' does not compile ({}), not routing",
                                cfg.name, filter_cfg.name, err
                            );
                            continue;
                        }
                    },
                },
            };
            if !filter.applies_to_store(vault_id, &cfg.name) {
                continue;
            }
            let bound = filter.bind_store(vault_id, &cfg.name);
            if bound.is_nothing() {
                continue;
            }
            routes.push(FilterRoute {
                vault_id: *vault_id,
                filter: bound,
            });
        }
        FilterSet { routes }
    }

    pub fn routes(&self) -> &[FilterRoute] {
        &self.routes
    }
}

/// Rebuild and atomically swap the filter set. Called on every change to
/// vaults or filters.
pub(crate) fn rebuild_filter_set(shared: &Shared) {
    let set = {
        let vaults = rlock(&shared.vaults);
        let filters = rlock(&shared.filters);
        Arc::new(FilterSet::build(&vaults, &filters))
    };
    *wlock(&shared.filter_set) = set;
}

impl Orchestrator {
    /// Rebuild and atomically swap the filter set.
    pub(crate) fn rebuild_filter_set(&self) {
        rebuild_filter_set(&self.shared);
    }

    /// The current filter set.
    pub fn filter_set(&self) -> Arc<FilterSet> {
        rlock(&self.shared.filter_set).clone()
    }

    pub(crate) fn start_ingest_workers(&self) {
        let (tx, rx) = bounded::<Record>(self.shared.options.queue_capacity);
        *lock(&self.ingest_tx) = Some(tx);

        let mut workers = lock(&self.workers);
        for n in 0..self.shared.options.ingest_workers.max(1) {
            let shared = self.shared.clone();
            let rx: Receiver<Record> = rx.clone();
            let worker = std::thread::Builder::new()
                .name(format!("ingest-{}", n))
                .spawn(move || {
                    while let Ok(rec) = rx.recv() {
                        route_record(&shared, &rec);
                        shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                    }
                })
                .expect("spawn ingest worker");
            workers.push(worker);
        }
    }

    /// Enqueue one record for routing. Stamps `ingest_ts` / `write_ts`
    /// when unset. Returns [`Error::Overloaded`] when the queue is full;
    /// the caller decides whether to drop or retry.
    pub fn ingest(&self, mut rec: Record) -> Result<()> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(Error::precondition("engine is shutting down"));
        }
        let now = crate::tools::time::epoch_nanos();
        if rec.ingest_ts == 0 {
            rec.ingest_ts = now;
        }
        if rec.write_ts == 0 {
            rec.write_ts = rec.ingest_ts;
        }

        let guard = lock(&self.ingest_tx);
        let tx = guard
            .as_ref()
            .ok_or_else(|| Error::precondition("engine is shutting down"))?;

        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        match tx.try_send(rec) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                self.shared.overloaded.fetch_add(1, Ordering::Relaxed);
                Err(Error::Overloaded)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                Err(Error::precondition("engine is shutting down"))
            }
        }
    }

    /// Block until every queued record has been routed. Mostly useful for
    /// tests and for graceful handover points.
    pub fn flush(&self) {
        while self.shared.in_flight.load(Ordering::Acquire) > 0 {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    /// Drain the ingest queue, stop the workers and shut the scheduler
    /// down. Records already queued are routed; new `ingest` calls fail.
    pub fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        let tx = lock(&self.ingest_tx).take();
        drop(tx);
        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
        self.shared.scheduler.shutdown();
    }
}

/// Route one record through the filter set, appending it to every vault
/// whose filter matches.
fn route_record(shared: &Arc<Shared>, rec: &Record) {
    let set = rlock(&shared.filter_set).clone();
    for route in set.routes() {
        if !route.filter.matches(rec) {
            continue;
        }
        let handle = match rlock(&shared.vaults).get(&route.vault_id).cloned() {
            Some(handle) => handle,
            None => continue, // vault removed since the set was built
        };
        if !handle.is_enabled() {
            continue;
        }
        match handle.chunk_manager().append(rec) {
            Ok(outcome) => {
                handle.counters().count_append(rec.logical_bytes());
                if let Some(sealed) = outcome.rotated {
                    schedule_index_build(shared, &handle, sealed);
                }
            }
            Err(err) => {
                handle.counters().count_error();
                warn!(
                    "vault {}: append failed: {}",
                    route.vault_id, err
                );
            }
        }
    }
}

/// Queue a background index build for a freshly sealed chunk.
pub(crate) fn schedule_index_build(shared: &Shared, handle: &Arc<VaultHandle>, chunk_id: ChunkId) {
    let handle = handle.clone();
    let submitted = shared.scheduler.submit("index-build", move |ctx| {
        ctx.cancel.check()?;
        let chunk = handle.chunk_manager().chunk(chunk_id)?;
        handle.index_manager().build_indexes(&chunk)?;
        ctx.progress.chunk_done();
        Ok(())
    });
    if let Err(err) = submitted {
        warn!(
            "failed to schedule index build for chunk {}: {}",
            chunk_id, err
        );
    }
}
