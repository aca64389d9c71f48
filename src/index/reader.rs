use std::sync::Arc;

use crate::index::{IndexData, IndexKind};

/// Shared, read-only view of one chunk's index. Cheap to clone; the
/// underlying data is loaded once and cached by the index manager.
#[derive(Clone)]
pub struct IndexReader {
    kind: IndexKind,
    data: Arc<IndexData>,
}

impl IndexReader {
    pub fn new(kind: IndexKind, data: Arc<IndexData>) -> IndexReader {
        IndexReader { kind, data }
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn capped(&self) -> bool {
        self.data.capped
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Positions for an entry. Single-dimension indexes take `value = ""`.
    /// `None` means the entry is not present - which, on a capped index,
    /// does not prove absence from the chunk.
    pub fn lookup(&self, key: &str, value: &str) -> Option<&[u64]> {
        self.data.lookup(key, value)
    }

    /// All entries in sorted order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &[u64])> {
        self.data
            .entries
            .iter()
            .map(|((k, v), positions)| (k.as_str(), v.as_str(), positions.as_slice()))
    }
}
