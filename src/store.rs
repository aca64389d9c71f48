//! Chunk storage layer.
//!
//! A vault's record stream is persisted as a series of chunks. Exactly one
//! chunk per enabled vault is *active* (accepting appends); all others are
//! *sealed* and immutable. Each chunk stores a data log of crc-checked
//! record frames next to a fixed-width position index used for timestamp
//! binary search.
//!
//! On-disk layout of a file-backed chunk directory:
//!
//! ```text
//! <vault_dir>/<chunk_id>/
//!   data.log     length-prefixed record frames, optionally zstd per record
//!   idx.log      32-byte entries (write_ts, ingest_ts, source_ts, offset)
//!   meta.json    written on seal (temp-then-rename); absence marks active
//!   *.idx        auxiliary indexes, see the index module
//!   indexes.meta per-index completion state
//! ```

mod record;
pub use record::*;

mod chunk_id;
pub use chunk_id::*;

mod codec;
pub use codec::*;

mod chunk;
pub use chunk::*;

mod file_chunk;
pub use file_chunk::*;

mod mem_chunk;
pub use mem_chunk::*;

mod backend;
pub use backend::*;

mod rotation;
pub use rotation::*;

mod chunk_manager;
pub use chunk_manager::*;
