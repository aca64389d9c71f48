//! Per-vault query planning: prune chunks by time range, then decide per
//! chunk between an index-driven candidate list and a scan.

use std::sync::Arc;

use serde::Serialize;

use crate::filter::{CompiledFilter, Probe};
use crate::index::IndexKind;
use crate::orchestrator::QueryTarget;
use crate::query::Query;
use crate::store::{Chunk, ChunkId, ChunkMeta};
use crate::Result;

/// What the planner decided to do with one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanAction {
    Scan,
    Indexed,
    Skipped,
}

/// One planning decision, kept for `explain` output and debugging.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    pub chunk_id: ChunkId,
    pub action: PlanAction,
    /// Index that drove the decision, when one did.
    pub index: Option<String>,
    pub reason: String,
    pub positions_before: u64,
    pub positions_after: u64,
}

/// Executable plan for one chunk.
pub struct ChunkPlan {
    pub chunk: Arc<dyn Chunk>,
    pub meta: ChunkMeta,
    pub mode: ExecMode,
}

pub enum ExecMode {
    /// Evaluate the filter over every position in `[from, to)`.
    Scan { from: u64, to: u64 },
    /// Evaluate the filter over these candidate positions only
    /// (ascending; false positives are re-checked).
    Positions(Vec<u64>),
}

impl ExecMode {
    pub fn len(&self) -> u64 {
        match self {
            ExecMode::Scan { from, to } => to.saturating_sub(*from),
            ExecMode::Positions(p) => p.len() as u64,
        }
    }
}

/// Candidate positions from probe evaluation. `positions == None` means
/// "all positions" (a scan); `exact` records whether the set is exactly
/// the matching set or a superset.
struct Cand {
    positions: Option<Vec<u64>>,
    exact: bool,
}

impl Cand {
    fn all() -> Cand {
        Cand {
            positions: None,
            exact: false,
        }
    }

    fn exact_all() -> Cand {
        Cand {
            positions: None,
            exact: true,
        }
    }

    fn exact_positions(positions: Vec<u64>) -> Cand {
        Cand {
            positions: Some(positions),
            exact: true,
        }
    }
}

/// Plan the chunks of one vault for a query, in ascending chunk order.
/// The caller reverses the plan list for newest-first execution.
///
/// `anchor` restricts the plan for resumed iteration: in forward mode
/// everything before `(chunk, position)` is excluded, in reverse mode
/// everything after it.
pub fn plan_vault(
    target: &QueryTarget,
    query: &Query,
    filter: Option<&CompiledFilter>,
    anchor: Option<(ChunkId, u64)>,
) -> Result<(Vec<ChunkPlan>, Vec<PlanStep>)> {
    let mut plans = Vec::new();
    let mut steps = Vec::new();

    let probe = filter.map(|f| f.derive_probes());

    for chunk in target.chunks.chunks() {
        let meta = chunk.meta();
        let total = meta.record_count;

        let mut skip = |reason: &str, steps: &mut Vec<PlanStep>| {
            steps.push(PlanStep {
                chunk_id: meta.id,
                action: PlanAction::Skipped,
                index: None,
                reason: reason.to_owned(),
                positions_before: total,
                positions_after: 0,
            });
        };

        if meta.record_count == 0 {
            skip("empty chunk", &mut steps);
            continue;
        }

        // anchor pruning: whole chunks on the wrong side disappear
        if let Some((anchor_chunk, _)) = anchor {
            if query.reverse && meta.id > anchor_chunk {
                skip("beyond resume anchor", &mut steps);
                continue;
            }
            if !query.reverse && meta.id < anchor_chunk {
                skip("before resume anchor", &mut steps);
                continue;
            }
        }

        if !meta.overlaps(query.start, query.end) {
            skip("outside time range", &mut steps);
            continue;
        }

        // clip the position range by the write_ts bounds
        let mut from = match query.start {
            Some(start) => match chunk.find_start_position(start)? {
                Some(pos) => pos,
                None => {
                    skip("outside time range", &mut steps);
                    continue;
                }
            },
            None => 0,
        };
        let mut to = match query.end {
            Some(end) => chunk
                .find_start_position(end)?
                .unwrap_or(meta.record_count),
            None => meta.record_count,
        };

        // clip by the resume anchor inside the anchor chunk
        if let Some((anchor_chunk, anchor_pos)) = anchor {
            if meta.id == anchor_chunk {
                if query.reverse {
                    to = to.min(anchor_pos.saturating_add(1));
                } else {
                    from = from.max(anchor_pos);
                }
            }
        }

        if from >= to {
            skip("empty position range", &mut steps);
            continue;
        }

        let range = to - from;

        // no predicates, or an active / unindexed chunk: scan
        let must_scan = match &probe {
            None => Some("no predicates"),
            Some(Probe::All) => Some("match-all filter"),
            Some(_) if !chunk.is_sealed() => Some("active chunk"),
            Some(_) if !target.indexes.indexes_complete(meta.id) => Some("indexes incomplete"),
            Some(_) => None,
        };

        if let Some(reason) = must_scan {
            steps.push(PlanStep {
                chunk_id: meta.id,
                action: PlanAction::Scan,
                index: None,
                reason: reason.to_owned(),
                positions_before: total,
                positions_after: range,
            });
            plans.push(ChunkPlan {
                chunk,
                meta,
                mode: ExecMode::Scan { from, to },
            });
            continue;
        }

        let probe = match &probe {
            Some(probe) => probe,
            None => unreachable!("handled by must_scan"),
        };
        let cand = eval_probe(probe, target, meta.id, meta.record_count)?;

        match cand.positions {
            None => {
                steps.push(PlanStep {
                    chunk_id: meta.id,
                    action: PlanAction::Scan,
                    index: Some("kv".to_owned()),
                    reason: "probe needs scan".to_owned(),
                    positions_before: total,
                    positions_after: range,
                });
                plans.push(ChunkPlan {
                    chunk,
                    meta,
                    mode: ExecMode::Scan { from, to },
                });
            }
            Some(positions) => {
                let clipped: Vec<u64> = positions
                    .into_iter()
                    .filter(|p| *p >= from && *p < to)
                    .collect();
                if clipped.is_empty() {
                    skip("empty index intersection", &mut steps);
                } else {
                    steps.push(PlanStep {
                        chunk_id: meta.id,
                        action: PlanAction::Indexed,
                        index: Some("token/kv".to_owned()),
                        reason: "index candidates".to_owned(),
                        positions_before: total,
                        positions_after: clipped.len() as u64,
                    });
                    plans.push(ChunkPlan {
                        chunk,
                        meta,
                        mode: ExecMode::Positions(clipped),
                    });
                }
            }
        }
    }

    Ok((plans, steps))
}

fn eval_probe(
    probe: &Probe,
    target: &QueryTarget,
    chunk_id: ChunkId,
    record_count: u64,
) -> Result<Cand> {
    match probe {
        Probe::All => Ok(Cand::exact_all()),
        Probe::Nothing => Ok(Cand::exact_positions(Vec::new())),
        Probe::Scan => Ok(Cand::all()),
        Probe::Token(token) => {
            let reader = target.indexes.open(chunk_id, IndexKind::Token)?;
            let positions = reader
                .lookup(token, "")
                .map(|p| p.to_vec())
                .unwrap_or_default();
            Ok(Cand::exact_positions(positions))
        }
        Probe::Kv { key, value } => {
            let attr = target.indexes.open(chunk_id, IndexKind::AttrKv)?;
            let mut positions = attr
                .lookup(key, value)
                .map(|p| p.to_vec())
                .unwrap_or_default();

            let kv = target.indexes.open(chunk_id, IndexKind::KvKv)?;
            match kv.lookup(key, value) {
                Some(more) => {
                    positions = union_sorted(&positions, more);
                    Ok(Cand {
                        positions: Some(positions),
                        exact: !kv.capped(),
                    })
                }
                None if kv.capped() => {
                    // the pair may have been dropped by the budget; only a
                    // scan can answer this predicate
                    Ok(Cand::all())
                }
                None => Ok(Cand::exact_positions(positions)),
            }
        }
        Probe::And(children) => {
            let mut exact = true;
            let mut acc: Option<Vec<u64>> = None;
            for child in children {
                let cand = eval_probe(child, target, chunk_id, record_count)?;
                exact = exact && cand.exact;
                if let Some(positions) = cand.positions {
                    acc = Some(match acc {
                        None => positions,
                        Some(current) => intersect_sorted(&current, &positions),
                    });
                    if let Some(ref list) = acc {
                        if list.is_empty() {
                            // empty intersection stays empty; AND of a
                            // superset with the empty set is exact
                            return Ok(Cand::exact_positions(Vec::new()));
                        }
                    }
                }
            }
            Ok(Cand {
                positions: acc,
                exact,
            })
        }
        Probe::Or(children) => {
            let mut exact = true;
            let mut lists: Vec<Vec<u64>> = Vec::new();
            for child in children {
                let cand = eval_probe(child, target, chunk_id, record_count)?;
                exact = exact && cand.exact;
                match cand.positions {
                    None => return Ok(if exact { Cand::exact_all() } else { Cand::all() }),
                    Some(positions) => lists.push(positions),
                }
            }
            let mut merged: Vec<u64> = lists.into_iter().flatten().collect();
            merged.sort_unstable();
            merged.dedup();
            Ok(Cand {
                positions: Some(merged),
                exact,
            })
        }
        Probe::Not(child) => {
            let cand = eval_probe(child, target, chunk_id, record_count)?;
            if !cand.exact {
                // complementing a superset proves nothing
                return Ok(Cand::all());
            }
            match cand.positions {
                None => Ok(Cand::exact_positions(Vec::new())),
                Some(positions) => Ok(Cand::exact_positions(complement(
                    &positions,
                    record_count,
                ))),
            }
        }
    }
}

fn intersect_sorted(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

fn union_sorted(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

fn complement(positions: &[u64], record_count: u64) -> Vec<u64> {
    let mut out = Vec::with_capacity((record_count as usize).saturating_sub(positions.len()));
    let mut iter = positions.iter().peekable();
    for pos in 0..record_count {
        match iter.peek() {
            Some(&&next) if next == pos => {
                iter.next();
            }
            _ => out.push(pos),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_set_operations() {
        assert_eq!(intersect_sorted(&[1, 3, 5, 7], &[3, 4, 5]), vec![3, 5]);
        assert_eq!(union_sorted(&[1, 3], &[2, 3, 9]), vec![1, 2, 3, 9]);
        assert_eq!(complement(&[0, 2], 4), vec![1, 3]);
        assert_eq!(complement(&[], 2), vec![0, 1]);
    }
}
