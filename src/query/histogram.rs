use serde::Serialize;

use crate::query::{Query, QueryEngine, SearchOptions};
use crate::{Error, Result};

/// Cap on records visited by the filtered histogram path.
pub const HISTOGRAM_SCAN_CAP: u64 = 1_000_000;

/// Bucketed record counts over `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Histogram {
    pub start: i64,
    pub end: i64,
    pub bucket_width: i64,
    pub counts: Vec<u64>,
    /// Set when the filtered path hit the scan cap; counts cover only the
    /// records visited up to that point.
    pub truncated: bool,
}

impl QueryEngine {
    /// Count matching records per time bucket.
    ///
    /// For unfiltered queries (no predicates beyond time bounds and vault
    /// scoping) the counts come from binary searches over the position
    /// indexes alone - no record body is ever read. Filtered queries run
    /// a capped forward search and bucket the matches.
    pub fn histogram(&self, query: &Query, buckets: usize) -> Result<Histogram> {
        let (start, end) = match (query.start, query.end) {
            (Some(start), Some(end)) => (start, end),
            _ => return Err(Error::invalid("histogram needs explicit time bounds")),
        };
        if buckets == 0 || start >= end {
            return Ok(Histogram {
                start,
                end,
                bucket_width: 0,
                counts: Vec::new(),
                truncated: false,
            });
        }

        let span = end
            .checked_sub(start)
            .ok_or_else(|| Error::invalid("histogram range overflows"))?;
        let bucket_width = (span / buckets as i64).max(1);

        if query.is_unfiltered() {
            self.histogram_indexed(query, start, end, bucket_width, buckets)
        } else {
            self.histogram_scanned(query, start, end, bucket_width, buckets)
        }
    }

    fn histogram_indexed(
        &self,
        query: &Query,
        start: i64,
        end: i64,
        bucket_width: i64,
        buckets: usize,
    ) -> Result<Histogram> {
        let mut counts = vec![0u64; buckets];

        for target in self.orchestrator().query_targets(query.filter.as_ref()) {
            for chunk in target.chunks.chunks() {
                let meta = chunk.meta();
                if !meta.overlaps(Some(start), Some(end)) {
                    continue;
                }
                // f(x) = first position at or after x; bucket count is
                // f(upper) - f(lower)
                let count = meta.record_count;
                let pos_at = |ts: i64| -> Result<u64> {
                    Ok(chunk.find_start_position(ts)?.unwrap_or(count))
                };

                let mut lower = pos_at(start)?;
                for (i, slot) in counts.iter_mut().enumerate() {
                    let bucket_end = if i + 1 == buckets {
                        end
                    } else {
                        start + (i as i64 + 1) * bucket_width
                    };
                    let upper = pos_at(bucket_end)?;
                    *slot += upper.saturating_sub(lower);
                    lower = upper;
                }
            }
        }

        Ok(Histogram {
            start,
            end,
            bucket_width,
            counts,
            truncated: false,
        })
    }

    fn histogram_scanned(
        &self,
        query: &Query,
        start: i64,
        end: i64,
        bucket_width: i64,
        buckets: usize,
    ) -> Result<Histogram> {
        let mut counts = vec![0u64; buckets];
        let mut truncated = false;

        let mut bounded = query.clone();
        bounded.limit = None;
        bounded.reverse = false;

        let mut stream = self.search(&bounded, &SearchOptions::default())?;
        while let Some(hit) = stream.next()? {
            let ts = hit.rec.write_ts;
            if ts >= start && ts < end {
                let idx = ((ts - start) / bucket_width) as usize;
                let idx = idx.min(buckets - 1);
                counts[idx] += 1;
            }
            if stream.scanned() >= HISTOGRAM_SCAN_CAP {
                truncated = true;
                break;
            }
        }

        Ok(Histogram {
            start,
            end,
            bucket_width,
            counts,
            truncated,
        })
    }
}
