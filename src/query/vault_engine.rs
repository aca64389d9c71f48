use crate::filter::CompiledFilter;
use crate::orchestrator::QueryTarget;
use crate::query::{plan_vault, ChunkPlan, ExecMode, Hit, PlanStep, Query};
use crate::store::{ChunkId, IdxEntry, RecordRef, VaultId};
use crate::Result;

/// Lazy record stream of one vault for one query.
///
/// Chunks are visited in the iteration direction (newest-first by
/// default), positions within a chunk likewise; records with equal
/// `write_ts` therefore come out in position order (descending under
/// reverse), which is the within-vault tie-break the merge layer relies on.
pub struct VaultQuery {
    vault_id: VaultId,
    reverse: bool,
    filter: Option<CompiledFilter>,
    query: QueryBounds,
    plans: Vec<ChunkPlan>,
    current: usize,
    cursor: Option<PlanCursor>,
    /// Next position the engine would visit, maintained for follow mode's
    /// frontier tracking (forward iteration only).
    frontier: Option<(ChunkId, u64)>,
    scanned: u64,
}

#[derive(Clone, Copy)]
struct QueryBounds {
    start: Option<i64>,
    end: Option<i64>,
    ingest_start: Option<i64>,
    ingest_end: Option<i64>,
    source_start: Option<i64>,
    source_end: Option<i64>,
}

impl QueryBounds {
    fn admit(&self, entry: &IdxEntry) -> bool {
        fn within(value: i64, start: Option<i64>, end: Option<i64>) -> bool {
            if let Some(start) = start {
                if value < start {
                    return false;
                }
            }
            if let Some(end) = end {
                if value >= end {
                    return false;
                }
            }
            true
        }
        within(entry.write_ts, self.start, self.end)
            && within(entry.ingest_ts, self.ingest_start, self.ingest_end)
            && within(entry.source_ts, self.source_start, self.source_end)
    }
}

/// Direction-aware position iterator over one chunk plan.
struct PlanCursor {
    positions: PositionSeq,
}

enum PositionSeq {
    Range { next: u64, from: u64, to: u64, done: bool },
    List { list: Vec<u64>, idx: usize, done: bool },
}

impl PlanCursor {
    fn new(mode: &ExecMode, reverse: bool) -> PlanCursor {
        let positions = match mode {
            ExecMode::Scan { from, to } => PositionSeq::Range {
                next: if reverse { to - 1 } else { *from },
                from: *from,
                to: *to,
                done: *from >= *to,
            },
            ExecMode::Positions(list) => PositionSeq::List {
                idx: if reverse { list.len().saturating_sub(1) } else { 0 },
                done: list.is_empty(),
                list: list.clone(),
            },
        };
        PlanCursor { positions }
    }

    fn next(&mut self, reverse: bool) -> Option<u64> {
        match &mut self.positions {
            PositionSeq::Range { next, from, to, done } => {
                if *done {
                    return None;
                }
                let pos = *next;
                if reverse {
                    if pos == *from {
                        *done = true;
                    } else {
                        *next = pos - 1;
                    }
                } else if pos + 1 >= *to {
                    *done = true;
                } else {
                    *next = pos + 1;
                }
                Some(pos)
            }
            PositionSeq::List { list, idx, done } => {
                if *done {
                    return None;
                }
                let pos = list[*idx];
                if reverse {
                    if *idx == 0 {
                        *done = true;
                    } else {
                        *idx -= 1;
                    }
                } else if *idx + 1 >= list.len() {
                    *done = true;
                } else {
                    *idx += 1;
                }
                Some(pos)
            }
        }
    }
}

impl VaultQuery {
    /// Plan and open the stream. `filter` must already be bound to this
    /// vault; `anchor` is the inclusive resume position.
    pub fn new(
        target: &QueryTarget,
        query: &Query,
        filter: Option<CompiledFilter>,
        anchor: Option<(ChunkId, u64)>,
    ) -> Result<(VaultQuery, Vec<PlanStep>)> {
        let (mut plans, steps) = plan_vault(target, query, filter.as_ref(), anchor)?;
        if query.reverse {
            plans.reverse();
        }
        Ok((
            VaultQuery {
                vault_id: target.id,
                reverse: query.reverse,
                filter,
                query: QueryBounds {
                    start: query.start,
                    end: query.end,
                    ingest_start: query.ingest_start,
                    ingest_end: query.ingest_end,
                    source_start: query.source_start,
                    source_end: query.source_end,
                },
                plans,
                current: 0,
                cursor: None,
                frontier: anchor,
                scanned: 0,
            },
            steps,
        ))
    }

    pub fn vault_id(&self) -> VaultId {
        self.vault_id
    }

    /// Records visited so far (matching or not); drives the filtered
    /// histogram's scan cap.
    pub fn scanned(&self) -> u64 {
        self.scanned
    }

    /// Where iteration would continue if new records appeared: one past
    /// the last visited position. Meaningful in forward mode only.
    pub fn frontier(&self) -> Option<(ChunkId, u64)> {
        self.frontier
    }

    /// Next matching record, or `None` when the vault is exhausted.
    pub fn next(&mut self) -> Result<Option<Hit>> {
        loop {
            let plan = match self.plans.get(self.current) {
                Some(plan) => plan,
                None => return Ok(None),
            };
            let reverse = self.reverse;
            if self.cursor.is_none() {
                self.cursor = Some(PlanCursor::new(&plan.mode, reverse));
            }
            let pos = match self
                .cursor
                .as_mut()
                .and_then(|cursor| cursor.next(reverse))
            {
                Some(pos) => pos,
                None => {
                    self.current += 1;
                    self.cursor = None;
                    continue;
                }
            };

            self.scanned += 1;
            if !self.reverse {
                self.frontier = Some((plan.meta.id, pos + 1));
            }

            let entry = match plan.chunk.idx_entry(pos)? {
                Some(entry) => entry,
                None => continue, // raced past the end of an active chunk
            };
            if !self.query.admit(&entry) {
                continue;
            }

            let rec = match plan.chunk.read(pos)? {
                Some(rec) => rec,
                None => continue,
            };
            if let Some(ref filter) = self.filter {
                if !filter.matches(&rec) {
                    continue;
                }
            }

            return Ok(Some(Hit {
                at: RecordRef {
                    vault_id: self.vault_id,
                    chunk_id: plan.meta.id,
                    position: pos,
                },
                rec,
            }));
        }
    }
}
