use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use uuid::Uuid;

use crate::store::ChunkId;

/// Identifier of a vault. Freshly created vaults get time-ordered v7 UUIDs.
pub type VaultId = Uuid;

/// Attribute map of a record. Keys are unique; the map is ordered so that
/// the on-disk encoding of a record is deterministic.
pub type AttrMap = BTreeMap<String, String>;

/// The atomic unit of storage.
///
/// `raw` is an opaque payload; `attrs` carry structured metadata next to
/// it. The three timestamps are epoch nanoseconds:
///
/// * `ingest_ts` - stamped by the server on ingestion,
/// * `write_ts`  - stamped when persisted; equals `ingest_ts` except when
///   records are copied preserving their origin (migration, merge),
/// * `source_ts` - optional, externally supplied; zero when absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub raw: Bytes,
    pub attrs: AttrMap,
    pub ingest_ts: i64,
    pub write_ts: i64,
    pub source_ts: i64,
}

impl Record {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self {
            raw: raw.into(),
            attrs: AttrMap::new(),
            ingest_ts: 0,
            write_ts: 0,
            source_ts: 0,
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn source_ts(mut self, ts: i64) -> Self {
        self.source_ts = ts;
        self
    }

    /// Logical size: payload plus attribute text. This is what rotation
    /// policies and the vault byte counters account.
    pub fn logical_bytes(&self) -> u64 {
        let attrs: usize = self
            .attrs
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        (self.raw.len() + attrs) as u64
    }
}

/// Stable address of a persisted record, usable as an opaque cursor anchor
/// for the life of the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordRef {
    pub vault_id: VaultId,
    pub chunk_id: ChunkId,
    pub position: u64,
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.vault_id, self.chunk_id, self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_bytes_counts_raw_and_attrs() {
        let rec = Record::new(&b"hello"[..])
            .attr("host", "web1")
            .attr("unit", "sshd");
        assert_eq!(rec.logical_bytes(), 5 + 4 + 4 + 4 + 4);
    }
}
