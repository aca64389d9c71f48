use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

/// Sortable 128-bit chunk identifier.
///
/// The high 64 bits are the creation instant in epoch nanoseconds, the low
/// 64 bits a per-process counter seeded randomly at startup. Ordering of
/// ids therefore equals creation order, and ids remain unique across
/// processes with overwhelming probability. Rendered as 32 hex digits,
/// which doubles as the chunk's directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(u128);

static NEXT_TAIL: Lazy<AtomicU64> = Lazy::new(|| {
    // seed from a v4 uuid; the counter only has to be unique per process
    let seed = uuid::Uuid::new_v4().as_u128() as u64;
    AtomicU64::new(seed)
});

impl ChunkId {
    /// A fresh id for the current instant.
    pub fn now() -> Self {
        let ns = crate::tools::time::epoch_nanos() as u64;
        let tail = NEXT_TAIL.fetch_add(1, Ordering::Relaxed);
        ChunkId(((ns as u128) << 64) | tail as u128)
    }

    pub fn from_parts(nanos: i64, tail: u64) -> Self {
        ChunkId(((nanos as u64 as u128) << 64) | tail as u128)
    }

    /// Creation instant encoded in the id, epoch nanoseconds.
    pub fn timestamp_nanos(&self) -> i64 {
        (self.0 >> 64) as u64 as i64
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != 32 {
            return Err(Error::invalid(format!("bad chunk id '{}'", s)));
        }
        let value = u128::from_str_radix(s, 16)
            .map_err(|_| Error::invalid(format!("bad chunk id '{}'", s)))?;
        Ok(ChunkId(value))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl std::str::FromStr for ChunkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ChunkId::parse(s)
    }
}

impl Serialize for ChunkId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChunkId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ChunkId::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_time_ordered() {
        let a = ChunkId::now();
        let b = ChunkId::now();
        assert!(b > a);
    }

    #[test]
    fn hex_roundtrip() {
        let id = ChunkId::now();
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(ChunkId::parse(&text).unwrap(), id);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ChunkId::parse("nope").is_err());
        assert!(ChunkId::parse("zz000000000000000000000000000000").is_err());
    }

    #[test]
    fn timestamp_survives() {
        let id = ChunkId::from_parts(1_234_567_890, 42);
        assert_eq!(id.timestamp_nanos(), 1_234_567_890);
    }
}
