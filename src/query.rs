//! Query planning and execution.
//!
//! A query is a compiled filter, optional time bounds on the three
//! timestamps, a direction (newest-first by default), an optional limit
//! and a post-processing pipeline. Execution is layered:
//!
//! * the *planner* prunes chunks by time range and decides per chunk
//!   whether to scan or to intersect index position lists,
//! * the *single-vault engine* walks one vault's chunks lazily in the
//!   requested direction,
//! * the *multi-vault engine* merges the per-vault streams by `write_ts`
//!   (stable vault order breaking ties), enforces the limit and mints
//!   resume tokens,
//! * the *pipeline* post-processes the record stream (filter, computed
//!   attributes, projection, sort, aggregation, timechart).
//!
//! Histograms over unfiltered queries never touch record bodies: bucket
//! counts come from binary searches over the position index alone.

mod model;
pub use model::*;

mod expr;
pub use expr::*;

mod pipeline;
pub use pipeline::*;

mod plan;
pub use plan::*;

mod vault_engine;
pub use vault_engine::*;

mod engine;
pub use engine::*;

mod histogram;
pub use histogram::*;

mod follow;
pub use follow::*;
