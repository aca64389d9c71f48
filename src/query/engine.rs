use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

use prost::Message;
use serde::Serialize;

use crate::orchestrator::Orchestrator;
use crate::query::{run_pipeline, Hit, PlanStep, Query, QueryOutput, VaultQuery};
use crate::scheduler::CancelToken;
use crate::store::{ChunkId, RecordRef, VaultId};
use crate::{Error, Result};

/// Wire form of a resume token. Opaque to clients; the engine decodes and
/// validates it on resume.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResumeTokenEntry {
    #[prost(string, tag = "1")]
    pub vault_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub chunk_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "3")]
    pub position: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResumeToken {
    #[prost(message, repeated, tag = "1")]
    pub entries: ::prost::alloc::vec::Vec<ResumeTokenEntry>,
    #[prost(bool, tag = "2")]
    pub reverse: bool,
}

impl ResumeToken {
    pub fn encode_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf)
            .unwrap_or_else(|_| unreachable!("Vec<u8> has unlimited capacity"));
        buf
    }

    pub fn decode_bytes(raw: &[u8]) -> Result<ResumeToken> {
        ResumeToken::decode(raw)
            .map_err(|err| Error::invalid(format!("bad resume token: {}", err)))
    }
}

/// Caller-side knobs of one search call.
#[derive(Clone, Default)]
pub struct SearchOptions {
    /// Token from a previous limited call; absent entries mean the vault
    /// was already exhausted.
    pub resume_token: Option<Vec<u8>>,
    pub cancel: CancelToken,
    /// Hard deadline; past it the stream errors with `DeadlineExceeded`.
    pub deadline: Option<Instant>,
}

/// `explain` output: per-vault planning decisions.
#[derive(Debug, Clone, Serialize)]
pub struct QueryPlanReport {
    pub vaults: Vec<VaultPlanReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VaultPlanReport {
    pub vault_id: VaultId,
    pub vault_name: String,
    pub steps: Vec<PlanStep>,
}

struct VaultInput {
    query: VaultQuery,
    head: Option<Hit>,
}

/// Heap entry ordering: by `write_ts` in the iteration direction, ties
/// broken by input order (ascending vault id) in both directions.
struct MergeEntry {
    ts: i64,
    input: usize,
    reverse: bool,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ts == other.ts && self.input == other.input
    }
}

impl Eq for MergeEntry {}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        let ts = if self.reverse {
            self.ts.cmp(&other.ts)
        } else {
            other.ts.cmp(&self.ts)
        };
        // BinaryHeap is a max-heap: the smaller input index must rank higher
        ts.then_with(|| other.input.cmp(&self.input))
    }
}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Streaming k-way merge over the per-vault streams.
///
/// Yields hits in global `write_ts` order (descending when reverse, the
/// default), stopping after `limit` records with a resume token pointing
/// at the first unemitted record of every vault that still has matches.
pub struct SearchStream {
    inputs: Vec<VaultInput>,
    heap: BinaryHeap<MergeEntry>,
    reverse: bool,
    limit: Option<usize>,
    emitted: usize,
    limit_hit: bool,
    cancel: CancelToken,
    deadline: Option<Instant>,
}

impl SearchStream {
    fn new(
        mut inputs: Vec<VaultInput>,
        reverse: bool,
        limit: Option<usize>,
        cancel: CancelToken,
        deadline: Option<Instant>,
    ) -> Result<SearchStream> {
        let mut heap = BinaryHeap::with_capacity(inputs.len());
        for (idx, input) in inputs.iter_mut().enumerate() {
            input.head = input.query.next()?;
            if let Some(ref hit) = input.head {
                heap.push(MergeEntry {
                    ts: hit.rec.write_ts,
                    input: idx,
                    reverse,
                });
            }
        }
        Ok(SearchStream {
            inputs,
            heap,
            reverse,
            limit,
            emitted: 0,
            limit_hit: false,
            cancel,
            deadline,
        })
    }

    /// Next merged hit. `Ok(None)` when drained or the limit was reached.
    pub fn next(&mut self) -> Result<Option<Hit>> {
        if self.limit_hit {
            return Ok(None);
        }
        if let Some(limit) = self.limit {
            if self.emitted >= limit {
                self.limit_hit = true;
                return Ok(None);
            }
        }
        self.cancel.check()?;
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::DeadlineExceeded);
            }
        }

        let entry = match self.heap.pop() {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let input = &mut self.inputs[entry.input];
        let hit = match input.head.take() {
            Some(hit) => hit,
            None => return Err(Error::internal("merge head out of sync")),
        };

        input.head = input.query.next()?;
        if let Some(ref next) = input.head {
            self.heap.push(MergeEntry {
                ts: next.rec.write_ts,
                input: entry.input,
                reverse: self.reverse,
            });
        }

        self.emitted += 1;
        Ok(Some(hit))
    }

    /// Total records the underlying vault engines have visited.
    pub fn scanned(&self) -> u64 {
        self.inputs.iter().map(|i| i.query.scanned()).sum()
    }

    /// After the limit was hit: a token resuming at the first unemitted
    /// record of every vault that still has one. `None` when everything
    /// was drained.
    pub fn resume_token(&self) -> Option<Vec<u8>> {
        if !self.limit_hit {
            return None;
        }
        let entries: Vec<ResumeTokenEntry> = self
            .inputs
            .iter()
            .filter_map(|input| {
                input.head.as_ref().map(|hit| ResumeTokenEntry {
                    vault_id: hit.at.vault_id.to_string(),
                    chunk_id: hit.at.chunk_id.to_string(),
                    position: hit.at.position,
                })
            })
            .collect();
        if entries.is_empty() {
            return None;
        }
        Some(
            ResumeToken {
                entries,
                reverse: self.reverse,
            }
            .encode_bytes(),
        )
    }

    /// Collect everything the stream still has to offer.
    pub fn collect_hits(&mut self) -> Result<Vec<Hit>> {
        let mut hits = Vec::new();
        while let Some(hit) = self.next()? {
            hits.push(hit);
        }
        Ok(hits)
    }

    /// Forward-mode frontier of every input, for follow.
    pub(crate) fn frontiers(&self) -> Vec<(VaultId, Option<(ChunkId, u64)>)> {
        self.inputs
            .iter()
            .map(|input| (input.query.vault_id(), input.query.frontier()))
            .collect()
    }
}

/// The multi-vault query engine.
pub struct QueryEngine {
    orch: Arc<Orchestrator>,
}

impl QueryEngine {
    pub fn new(orch: Arc<Orchestrator>) -> QueryEngine {
        QueryEngine { orch }
    }

    pub(crate) fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orch
    }

    /// Open a streaming search across every vault the query applies to.
    pub fn search(&self, query: &Query, opts: &SearchOptions) -> Result<SearchStream> {
        let anchors = match &opts.resume_token {
            Some(raw) => {
                let token = ResumeToken::decode_bytes(raw)?;
                if token.reverse != query.reverse {
                    return Err(Error::invalid(
                        "resume token direction does not match the query",
                    ));
                }
                // a resumed query skips vaults without a token entry: they
                // were already drained in an earlier page
                Some(AnchorSet {
                    anchors: parse_token_entries(&token)?,
                    skip_missing: true,
                })
            }
            None => None,
        };
        self.search_with(query, opts, anchors)
    }

    pub(crate) fn search_with(
        &self,
        query: &Query,
        opts: &SearchOptions,
        anchors: Option<AnchorSet>,
    ) -> Result<SearchStream> {
        let mut inputs = Vec::new();
        if query.is_empty_range() {
            return SearchStream::new(
                inputs,
                query.reverse,
                query.limit,
                opts.cancel.clone(),
                opts.deadline,
            );
        }

        for target in self.orch.query_targets(query.filter.as_ref()) {
            let bound = query
                .filter
                .as_ref()
                .map(|f| f.bind_store(&target.id, &target.name));
            if bound.as_ref().map(|f| f.is_nothing()).unwrap_or(false) {
                continue;
            }
            let anchor = match &anchors {
                Some(set) => match set.anchors.iter().find(|(v, _, _)| *v == target.id) {
                    Some((_, chunk, pos)) => Some((*chunk, *pos)),
                    None if set.skip_missing => continue,
                    None => None,
                },
                None => None,
            };
            let (vault_query, _) = VaultQuery::new(&target, query, bound, anchor)?;
            inputs.push(VaultInput {
                query: vault_query,
                head: None,
            });
        }

        SearchStream::new(
            inputs,
            query.reverse,
            query.limit,
            opts.cancel.clone(),
            opts.deadline,
        )
    }

    /// Run the query to completion: collect (bounded by the limit), apply
    /// the pipeline, return the typed output.
    pub fn execute(&self, query: &Query, opts: &SearchOptions) -> Result<QueryOutput> {
        let mut stream = self.search(query, opts)?;
        let hits = stream.collect_hits()?;
        let token = stream.resume_token();
        run_pipeline(hits, &query.pipeline, token)
    }

    /// Planning decisions for every vault, without executing anything
    /// beyond the index lookups planning needs.
    pub fn explain(&self, query: &Query) -> Result<QueryPlanReport> {
        let mut vaults = Vec::new();
        for target in self.orch.query_targets(query.filter.as_ref()) {
            let bound = query
                .filter
                .as_ref()
                .map(|f| f.bind_store(&target.id, &target.name));
            let (_, steps) = VaultQuery::new(&target, query, bound, None)?;
            vaults.push(VaultPlanReport {
                vault_id: target.id,
                vault_name: target.name.clone(),
                steps,
            });
        }
        Ok(QueryPlanReport { vaults })
    }

    /// Records around an anchor, within its chunk only: `before` records
    /// preceding it and `after` following it, clipped at the chunk
    /// boundaries. The anchor itself is always included.
    pub fn get_context(&self, at: &RecordRef, before: u64, after: u64) -> Result<Vec<Hit>> {
        let handle = self.orch.vault(at.vault_id)?;
        let chunk = handle.chunk_manager().chunk(at.chunk_id)?;
        let meta = chunk.meta();
        if at.position >= meta.record_count {
            return Err(Error::not_found(format!(
                "position {} in chunk {}",
                at.position, at.chunk_id
            )));
        }

        let from = at.position.saturating_sub(before);
        let to = at
            .position
            .saturating_add(after)
            .saturating_add(1)
            .min(meta.record_count);

        let mut hits = Vec::with_capacity((to - from) as usize);
        for pos in from..to {
            if let Some(rec) = chunk.read(pos)? {
                hits.push(Hit {
                    rec,
                    at: RecordRef {
                        vault_id: at.vault_id,
                        chunk_id: at.chunk_id,
                        position: pos,
                    },
                });
            }
        }
        Ok(hits)
    }
}

/// Per-vault resume anchors and the policy for vaults without one:
/// `skip_missing` treats them as drained (token resume), otherwise they
/// start at their natural boundary (follow frontier passes).
pub(crate) struct AnchorSet {
    pub(crate) anchors: Vec<(VaultId, ChunkId, u64)>,
    pub(crate) skip_missing: bool,
}

fn parse_token_entries(token: &ResumeToken) -> Result<Vec<(VaultId, ChunkId, u64)>> {
    let mut entries = Vec::with_capacity(token.entries.len());
    for entry in &token.entries {
        let vault_id: VaultId = entry
            .vault_id
            .parse()
            .map_err(|_| Error::invalid("bad vault id in resume token"))?;
        let chunk_id = ChunkId::parse(&entry.chunk_id)?;
        entries.push((vault_id, chunk_id, entry.position));
    }
    Ok(entries)
}
