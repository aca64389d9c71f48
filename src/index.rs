//! Auxiliary indexes over sealed chunks.
//!
//! Six indexes are built per sealed chunk: tokens from the raw payload,
//! attribute keys / values / pairs, and key=value pairs extracted from the
//! raw payload. Every index is a sorted map from a key (or key+value) to an
//! ascending, deduplicated position list. Builds are deterministic: two
//! builds over the same chunk produce byte-identical files.
//!
//! The kv-extraction indexes run under a budget of unique entries; once
//! exhausted, new entries are dropped and the index is flagged *capped*.
//! Lookups against a capped index remain correct for the entries it holds;
//! the query planner falls back to scanning for the ones it might have
//! dropped.

mod tokenizer;
pub use tokenizer::*;

mod builder;
pub use builder::*;

mod format;
pub use format::*;

mod reader;
pub use reader::*;

mod index_manager;
pub use index_manager::*;
