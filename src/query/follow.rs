use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::orchestrator::Orchestrator;
use crate::query::engine::AnchorSet;
use crate::query::{apply_streaming, Hit, Query, QueryEngine, SearchOptions, SearchStream, Stage};
use crate::scheduler::CancelToken;
use crate::store::{ChunkId, VaultId};
use crate::Result;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Knobs of a follow (tail) subscription.
#[derive(Clone)]
pub struct FollowOptions {
    pub cancel: CancelToken,
    pub poll_interval: Duration,
}

impl Default for FollowOptions {
    fn default() -> Self {
        FollowOptions {
            cancel: CancelToken::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Tail-style iterator: drains the current matches of the query, then
/// polls the vaults for newly appended records and emits them in write
/// order. Runs until cancelled; cancellation ends the stream normally.
pub struct FollowStream {
    orch: Arc<Orchestrator>,
    query: Query,
    cancel: CancelToken,
    poll_interval: Duration,
    stream: Option<crate::query::SearchStream>,
    frontiers: HashMap<VaultId, (ChunkId, u64)>,
    head_remaining: Option<usize>,
}

impl QueryEngine {
    /// Open a follow subscription for the query. Pipeline stages that need
    /// complete input (`stats`, `sort`, `tail`, `slice`, `timechart`) are
    /// rejected with `FailedPrecondition`.
    pub fn follow(&self, query: &Query, opts: FollowOptions) -> Result<FollowStream> {
        query.check_streamable()?;

        let mut query = query.clone();
        query.reverse = false; // tailing is inherently oldest-first
        query.limit = None;

        let head_remaining = query.pipeline.iter().find_map(|stage| match stage {
            Stage::Head(n) => Some(*n),
            _ => None,
        });

        Ok(FollowStream {
            orch: self.orchestrator().clone(),
            query,
            cancel: opts.cancel,
            poll_interval: opts.poll_interval,
            stream: None,
            frontiers: HashMap::new(),
            head_remaining,
        })
    }
}

impl FollowStream {
    /// Next matching record. Blocks while waiting for new data; returns
    /// `Ok(None)` only when the subscription was cancelled (or a `head`
    /// stage ran out).
    pub fn next(&mut self) -> Result<Option<Hit>> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            if self.head_remaining == Some(0) {
                return Ok(None);
            }

            if self.stream.is_none() {
                self.stream = Some(self.open_pass()?);
            }

            let next = match self.stream.as_mut() {
                Some(stream) => stream.next()?,
                None => None,
            };

            match next {
                Some(hit) => {
                    // remember where to pick up, then push the hit through
                    // the streaming stages
                    self.frontiers
                        .insert(hit.at.vault_id, (hit.at.chunk_id, hit.at.position + 1));
                    if let Some(hit) = self.post_process(hit) {
                        if let Some(ref mut remaining) = self.head_remaining {
                            *remaining -= 1;
                        }
                        return Ok(Some(hit));
                    }
                }
                None => {
                    // drained; remember every input's frontier, then poll
                    if let Some(stream) = self.stream.take() {
                        for (vault_id, frontier) in stream.frontiers() {
                            if let Some(frontier) = frontier {
                                self.frontiers.insert(vault_id, frontier);
                            }
                        }
                    }
                    std::thread::sleep(self.poll_interval);
                }
            }
        }
    }

    fn open_pass(&self) -> Result<SearchStream> {
        let engine = QueryEngine::new(self.orch.clone());
        let opts = SearchOptions {
            cancel: self.cancel.clone(),
            ..SearchOptions::default()
        };
        if self.frontiers.is_empty() {
            return engine.search(&self.query, &opts);
        }

        // resume every known vault at its frontier; vaults without one
        // (nothing visited yet, or newly added) start from the beginning
        let anchors = AnchorSet {
            anchors: self
                .frontiers
                .iter()
                .map(|(vault_id, (chunk_id, position))| (*vault_id, *chunk_id, *position))
                .collect(),
            skip_missing: false,
        };
        engine.search_with(&self.query, &opts, Some(anchors))
    }

    fn post_process(&self, hit: Hit) -> Option<Hit> {
        let mut hit = hit;
        for stage in &self.query.pipeline {
            hit = apply_streaming(stage, hit)?;
        }
        Some(hit)
    }
}
