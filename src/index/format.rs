//! On-disk encoding of index files.
//!
//! ```text
//! [u8; 8]  magic "LKIDX001"
//! u8       flags               bit 0: capped
//! u32      entry_count
//! entries, sorted by (key, value):
//!   u16 key_len, key, u32 val_len, val
//!   u32 position_count, position_count * u64 positions (ascending)
//! u32      crc32 over everything before it
//! ```
//!
//! Little-endian throughout. Files are written to a temporary and renamed
//! into place, so readers never observe a partial index.

use std::convert::TryInto;
use std::path::Path;

use crate::index::IndexData;
use crate::{Error, Result};

pub const INDEX_MAGIC: &[u8; 8] = b"LKIDX001";

const FLAG_CAPPED: u8 = 1;

/// Encode an index to its file representation.
pub fn encode_index(data: &IndexData) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64 + data.len() * 32);
    buf.extend_from_slice(INDEX_MAGIC);
    buf.push(if data.capped { FLAG_CAPPED } else { 0 });
    if data.len() > u32::MAX as usize {
        return Err(Error::internal("index entry count overflow"));
    }
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());

    for ((key, value), positions) in &data.entries {
        if key.len() > u16::MAX as usize {
            return Err(Error::invalid(format!("index key too long ({} bytes)", key.len())));
        }
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(&(positions.len() as u32).to_le_bytes());
        for &pos in positions {
            buf.extend_from_slice(&pos.to_le_bytes());
        }
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf);
    let crc = hasher.finalize();
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Decode an index file produced by [`encode_index`].
pub fn decode_index(raw: &[u8]) -> Result<IndexData> {
    if raw.len() < 8 + 1 + 4 + 4 {
        return Err(Error::corrupt("index file too small"));
    }
    if &raw[0..8] != INDEX_MAGIC {
        return Err(Error::corrupt("bad index magic"));
    }

    let crc_off = raw.len() - 4;
    let expected: [u8; 4] = raw[crc_off..]
        .try_into()
        .map_err(|_| Error::corrupt("short index crc"))?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&raw[..crc_off]);
    if hasher.finalize() != u32::from_le_bytes(expected) {
        return Err(Error::corrupt("index crc mismatch"));
    }

    let flags = raw[8];
    let count_bytes: [u8; 4] = raw[9..13]
        .try_into()
        .map_err(|_| Error::corrupt("short index header"))?;
    let count = u32::from_le_bytes(count_bytes) as usize;

    let mut data = IndexData::default();
    data.capped = flags & FLAG_CAPPED != 0;

    let body = &raw[13..crc_off];
    let mut pos = 0usize;

    fn take<'a>(body: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
        if *pos + n > body.len() {
            return Err(Error::corrupt("truncated index entry"));
        }
        let slice = &body[*pos..*pos + n];
        *pos += n;
        Ok(slice)
    }

    for _ in 0..count {
        let klen_bytes: [u8; 2] = take(body, &mut pos, 2)?
            .try_into()
            .map_err(|_| Error::corrupt("short key length"))?;
        let klen = u16::from_le_bytes(klen_bytes) as usize;
        let key = std::str::from_utf8(take(body, &mut pos, klen)?)
            .map_err(|_| Error::corrupt("index key not utf-8"))?
            .to_owned();

        let vlen_bytes: [u8; 4] = take(body, &mut pos, 4)?
            .try_into()
            .map_err(|_| Error::corrupt("short value length"))?;
        let vlen = u32::from_le_bytes(vlen_bytes) as usize;
        let value = std::str::from_utf8(take(body, &mut pos, vlen)?)
            .map_err(|_| Error::corrupt("index value not utf-8"))?
            .to_owned();

        let plen_bytes: [u8; 4] = take(body, &mut pos, 4)?
            .try_into()
            .map_err(|_| Error::corrupt("short position count"))?;
        let plen = u32::from_le_bytes(plen_bytes) as usize;
        let mut positions = Vec::with_capacity(plen);
        let pos_bytes = take(body, &mut pos, plen * 8)?;
        for slot in pos_bytes.chunks_exact(8) {
            let value = u64::from_le_bytes(
                slot.try_into()
                    .map_err(|_| Error::corrupt("short position"))?,
            );
            if let Some(&last) = positions.last() {
                if value <= last {
                    return Err(Error::corrupt("index positions not ascending"));
                }
            }
            positions.push(value);
        }
        data.entries.insert((key, value), positions);
    }

    if pos != body.len() {
        return Err(Error::corrupt("trailing bytes in index file"));
    }
    Ok(data)
}

/// Write an index file atomically (temp-then-rename).
pub fn write_index_file(path: &Path, data: &IndexData) -> Result<()> {
    crate::tools::replace_file(path, &encode_index(data)?)
}

/// Read and verify an index file.
pub fn read_index_file(path: &Path) -> Result<IndexData> {
    let raw = std::fs::read(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::not_found(format!("index file {:?}", path))
        } else {
            Error::Io(err)
        }
    })?;
    decode_index(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IndexData {
        let mut data = IndexData::default();
        data.entries
            .insert(("error".into(), String::new()), vec![0, 3, 17]);
        data.entries
            .insert(("host".into(), "web1".into()), vec![2]);
        data
    }

    #[test]
    fn roundtrip() {
        let data = sample();
        let raw = encode_index(&data).unwrap();
        assert_eq!(decode_index(&raw).unwrap(), data);
    }

    #[test]
    fn roundtrip_capped_flag() {
        let mut data = sample();
        data.capped = true;
        let raw = encode_index(&data).unwrap();
        assert!(decode_index(&raw).unwrap().capped);
    }

    #[test]
    fn corruption_is_detected() {
        let mut raw = encode_index(&sample()).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0x01;
        assert!(matches!(decode_index(&raw), Err(Error::Corrupt(_))));
    }

    #[test]
    fn encoding_is_deterministic() {
        assert_eq!(
            encode_index(&sample()).unwrap(),
            encode_index(&sample()).unwrap()
        );
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.idx");
        write_index_file(&path, &sample()).unwrap();
        assert_eq!(read_index_file(&path).unwrap(), sample());
        assert!(matches!(
            read_index_file(&dir.path().join("missing.idx")),
            Err(Error::NotFound(_))
        ));
    }
}
