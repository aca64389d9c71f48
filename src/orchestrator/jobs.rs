//! Background operations on vaults: reindex, migrate, merge, export,
//! import, validation and chunk analysis.
//!
//! The long-running ones (reindex, migrate, merge) run as scheduler jobs
//! with progress handles; per-chunk problems are recorded as job error
//! details without failing the whole job. Export, import, validation and
//! analysis run on the caller's thread.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;
use serde::Serialize;

use crate::config::VaultConfig;
use crate::index::IndexState;
use crate::orchestrator::{teardown_vault, Orchestrator, VaultHandle};
use crate::scheduler::{CancelToken, JobHandle};
use crate::store::{Chunk, ChunkCursor, ChunkId, ChunkIoStats, ChunkMeta, Record, VaultId};
use crate::{Error, Result};

const CANCEL_CHECK_EVERY: u64 = 100;

/// Sequential reader over every record of a vault, chunk by chunk in
/// creation order. Snapshots the chunk list up front.
pub struct VaultReader {
    chunks: Vec<Arc<dyn Chunk>>,
    next_chunk: usize,
    cursor: Option<ChunkCursor>,
}

impl VaultReader {
    pub fn new(handle: &VaultHandle) -> VaultReader {
        VaultReader {
            chunks: handle.chunk_manager().chunks(),
            next_chunk: 0,
            cursor: None,
        }
    }

    /// Next record with its source chunk and position.
    pub fn next(&mut self) -> Result<Option<(ChunkId, u64, Record)>> {
        loop {
            if self.cursor.is_none() {
                match self.chunks.get(self.next_chunk) {
                    Some(chunk) => {
                        self.cursor = Some(ChunkCursor::new(chunk.clone(), 0));
                        self.next_chunk += 1;
                    }
                    None => return Ok(None),
                }
            }
            if let Some(ref mut cursor) = self.cursor {
                match cursor.next()? {
                    Some((pos, rec)) => return Ok(Some((cursor.chunk_id(), pos, rec))),
                    None => self.cursor = None,
                }
            }
        }
    }
}

/// Streaming export of a vault's records.
pub struct ExportStream {
    reader: VaultReader,
}

impl Iterator for ExportStream {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.next() {
            Ok(Some((_, _, rec))) => Some(Ok(rec)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

/// Findings of a vault validation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub vault_id: VaultId,
    pub chunks_checked: u64,
    pub records_checked: u64,
    pub findings: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Everything worth knowing about one chunk.
#[derive(Debug, Clone)]
pub struct ChunkAnalysis {
    pub meta: ChunkMeta,
    pub index_states: BTreeMap<String, IndexState>,
    pub index_sizes: BTreeMap<String, u64>,
    pub io: ChunkIoStats,
}

impl Orchestrator {
    /// Rebuild every index of every sealed chunk of the vault. Per-chunk
    /// failures are recorded as error details and do not abort the job.
    pub fn reindex_vault(&self, id: VaultId) -> Result<JobHandle> {
        let handle = self.vault(id)?;
        self.shared.scheduler.submit("reindex", move |ctx| {
            let chunks: Vec<_> = handle
                .chunk_manager()
                .chunks()
                .into_iter()
                .filter(|c| c.is_sealed())
                .collect();
            ctx.progress.set_chunks_total(chunks.len() as u64);

            for chunk in chunks {
                ctx.cancel.check()?;
                let result = handle
                    .index_manager()
                    .delete_indexes(chunk.id())
                    .and_then(|_| handle.index_manager().build_indexes(&chunk));
                match result {
                    Ok(()) => {
                        ctx.progress.records_done(chunk.meta().record_count);
                    }
                    Err(err) => {
                        ctx.progress.error(format!("chunk {}: {}", chunk.id(), err));
                    }
                }
                ctx.progress.chunk_done();
            }
            Ok(())
        })
    }

    /// Move a vault's records into a freshly created vault and remove the
    /// source. Between two file vaults whole chunk directories are moved,
    /// preserving `write_ts` (and every other byte) exactly; otherwise
    /// records are copied preserving their timestamps.
    pub fn migrate_vault(&self, src: VaultId, dest_cfg: VaultConfig) -> Result<JobHandle> {
        let src_handle = self.vault(src)?;
        let dest_id = self.add_vault(dest_cfg)?;
        let dest_handle = self.vault(dest_id)?;
        let shared = self.shared.clone();

        self.shared.scheduler.submit("migrate", move |ctx| {
            // stop routing into the source for good
            src_handle.set_enabled(false);
            super::rebuild_filter_set(&shared);
            src_handle.chunk_manager().seal_active()?;

            let chunks: Vec<_> = src_handle.chunk_manager().chunks();
            ctx.progress.set_chunks_total(chunks.len() as u64);

            let chunk_level = src_handle.chunk_manager().backend().as_mover().is_some()
                && dest_handle.chunk_manager().backend().as_mover().is_some();

            for chunk in chunks {
                ctx.cancel.check()?;
                let records = chunk.meta().record_count;
                if chunk_level {
                    let detached = src_handle.chunk_manager().disown(chunk.id())?;
                    dest_handle.chunk_manager().adopt(&detached)?;
                } else {
                    copy_chunk_records(&chunk, &dest_handle, &ctx.cancel)?;
                }
                ctx.progress.records_done(records);
                ctx.progress.chunk_done();
            }

            // moved chunks carry their index files with them; build any
            // that are still missing
            for chunk in dest_handle.chunk_manager().chunks() {
                if chunk.is_sealed()
                    && !dest_handle.index_manager().indexes_complete(chunk.id())
                {
                    if let Err(err) = dest_handle.index_manager().build_indexes(&chunk) {
                        ctx.progress.error(format!("index chunk {}: {}", chunk.id(), err));
                    }
                }
            }

            teardown_vault(&shared, src_handle.clone())?;
            info!(
                "migrated vault {} -> {}",
                src_handle.id(),
                dest_handle.id()
            );
            Ok(())
        })
    }

    /// Merge the records of several vaults into a freshly created vault in
    /// global `write_ts` order. The sources are left untouched.
    pub fn merge_vaults(&self, sources: Vec<VaultId>, dest_cfg: VaultConfig) -> Result<JobHandle> {
        if sources.is_empty() {
            return Err(Error::invalid("merge needs at least one source vault"));
        }
        let mut source_handles = Vec::with_capacity(sources.len());
        for id in &sources {
            source_handles.push(self.vault(*id)?);
        }
        let dest_id = self.add_vault(dest_cfg)?;
        let dest_handle = self.vault(dest_id)?;

        self.shared.scheduler.submit("merge", move |ctx| {
            let mut readers: Vec<VaultReader> = source_handles
                .iter()
                .map(|handle| VaultReader::new(handle))
                .collect();
            let mut heads: Vec<Option<Record>> = Vec::with_capacity(readers.len());
            for reader in readers.iter_mut() {
                heads.push(reader.next()?.map(|(_, _, rec)| rec));
            }

            let mut appended = 0u64;
            loop {
                ctx.cancel.check()?;
                // earliest head wins; ties go to the earlier source
                let next = heads
                    .iter()
                    .enumerate()
                    .filter_map(|(i, head)| head.as_ref().map(|r| (i, r.write_ts)))
                    .min_by_key(|&(i, ts)| (ts, i))
                    .map(|(i, _)| i);
                let i = match next {
                    Some(i) => i,
                    None => break,
                };
                let rec = match heads[i].take() {
                    Some(rec) => rec,
                    None => break,
                };
                let outcome = dest_handle.chunk_manager().append(&rec)?;
                if let Some(sealed) = outcome.rotated {
                    let chunk = dest_handle.chunk_manager().chunk(sealed)?;
                    if let Err(err) = dest_handle.index_manager().build_indexes(&chunk) {
                        ctx.progress.error(format!("index chunk {}: {}", sealed, err));
                    }
                }
                appended += 1;
                if appended % CANCEL_CHECK_EVERY == 0 {
                    ctx.progress.records_done(CANCEL_CHECK_EVERY);
                }
                heads[i] = readers[i].next()?.map(|(_, _, rec)| rec);
            }
            ctx.progress.records_done(appended % CANCEL_CHECK_EVERY);
            info!("merged {} vaults into {} ({} records)", readers.len(), dest_handle.id(), appended);
            Ok(())
        })
    }

    /// Stream every record of a vault in chunk order.
    pub fn export_vault(&self, id: VaultId) -> Result<ExportStream> {
        let handle = self.vault(id)?;
        Ok(ExportStream {
            reader: VaultReader::new(&handle),
        })
    }

    /// Append externally supplied records to a vault, bypassing the filter
    /// set. With `preserve_timestamps` the records keep their `ingest_ts`
    /// and `write_ts` (migration-style); otherwise both are restamped and
    /// only `source_ts` survives. Returns the number of records imported.
    pub fn import_records<I>(
        &self,
        id: VaultId,
        records: I,
        preserve_timestamps: bool,
    ) -> Result<u64>
    where
        I: IntoIterator<Item = Record>,
    {
        let handle = self.vault(id)?;
        if !handle.is_enabled() {
            return Err(Error::precondition(format!(
                "vault {} is disabled",
                id
            )));
        }

        let mut imported = 0u64;
        for mut rec in records {
            if !preserve_timestamps {
                let now = crate::tools::time::epoch_nanos();
                rec.ingest_ts = now;
                rec.write_ts = now;
            }
            let outcome = handle.chunk_manager().append(&rec)?;
            handle.counters().count_append(rec.logical_bytes());
            if let Some(sealed) = outcome.rotated {
                super::schedule_index_build(&self.shared, &handle, sealed);
            }
            imported += 1;
        }
        Ok(imported)
    }

    /// Check the storage invariants of every chunk of a vault. Read-only;
    /// corruption is reported, never repaired here.
    pub fn validate_vault(&self, id: VaultId) -> Result<ValidationReport> {
        let handle = self.vault(id)?;
        let cancel = CancelToken::new();
        let mut report = ValidationReport {
            vault_id: id,
            chunks_checked: 0,
            records_checked: 0,
            findings: Vec::new(),
        };

        for chunk in handle.chunk_manager().chunks() {
            cancel.check()?;
            validate_chunk(&chunk, &mut report);
            if chunk.is_sealed() && !handle.index_manager().indexes_complete(chunk.id()) {
                report
                    .findings
                    .push(format!("chunk {}: indexes incomplete", chunk.id()));
            }
            report.chunks_checked += 1;
        }
        Ok(report)
    }

    /// Meta, index completion and sizes of one chunk.
    pub fn analyze_chunk(&self, vault: VaultId, chunk_id: ChunkId) -> Result<ChunkAnalysis> {
        let handle = self.vault(vault)?;
        let chunk = handle.chunk_manager().chunk(chunk_id)?;
        let index_states = handle
            .index_manager()
            .states(chunk_id)
            .into_iter()
            .map(|(k, s)| (k.name().to_owned(), s))
            .collect();
        Ok(ChunkAnalysis {
            meta: chunk.meta(),
            index_states,
            index_sizes: handle.index_manager().index_sizes(chunk_id)?,
            io: chunk.io_stats(),
        })
    }
}

fn copy_chunk_records(
    chunk: &Arc<dyn Chunk>,
    dest: &Arc<VaultHandle>,
    cancel: &CancelToken,
) -> Result<()> {
    let mut cursor = ChunkCursor::new(chunk.clone(), 0);
    let mut copied = 0u64;
    while let Some((_, rec)) = cursor.next()? {
        dest.chunk_manager().append(&rec)?;
        copied += 1;
        if copied % CANCEL_CHECK_EVERY == 0 {
            cancel.check()?;
        }
    }
    Ok(())
}

fn validate_chunk(chunk: &Arc<dyn Chunk>, report: &mut ValidationReport) {
    let meta = chunk.meta();
    let mut cursor = ChunkCursor::new(chunk.clone(), 0);
    let mut count = 0u64;
    let mut prev_ts: Option<i64> = None;
    let mut min_ts = i64::MAX;
    let mut max_ts = i64::MIN;

    loop {
        match cursor.next() {
            Ok(Some((pos, rec))) => {
                count += 1;
                min_ts = min_ts.min(rec.write_ts);
                max_ts = max_ts.max(rec.write_ts);
                if let Some(prev) = prev_ts {
                    if rec.write_ts < prev {
                        report.findings.push(format!(
                            "chunk {}: write_ts decreases at position {}",
                            meta.id, pos
                        ));
                    }
                }
                prev_ts = Some(rec.write_ts);

                match chunk.idx_entry(pos) {
                    Ok(Some(entry)) => {
                        if entry.write_ts != rec.write_ts {
                            report.findings.push(format!(
                                "chunk {}: position index disagrees with record at {}",
                                meta.id, pos
                            ));
                        }
                    }
                    Ok(None) => report.findings.push(format!(
                        "chunk {}: missing position index entry at {}",
                        meta.id, pos
                    )),
                    Err(err) => report
                        .findings
                        .push(format!("chunk {}: idx read failed at {}: {}", meta.id, pos, err)),
                }
            }
            Ok(None) => break,
            Err(err) => {
                report
                    .findings
                    .push(format!("chunk {}: record read failed: {}", meta.id, err));
                break;
            }
        }
    }

    report.records_checked += count;
    if count != meta.record_count {
        report.findings.push(format!(
            "chunk {}: meta says {} records, found {}",
            meta.id, meta.record_count, count
        ));
    }
    if count > 0 {
        if meta.start_ts != min_ts {
            report.findings.push(format!(
                "chunk {}: meta start_ts {} != observed {}",
                meta.id, meta.start_ts, min_ts
            ));
        }
        if meta.end_ts != max_ts {
            report.findings.push(format!(
                "chunk {}: meta end_ts {} != observed {}",
                meta.id, meta.end_ts, max_ts
            ));
        }
    }
}
