//! Binary framing of records in `data.log` and entries in `idx.log`.
//!
//! A frame is a `u32` length followed by the frame body:
//!
//! ```text
//! u8  flags              bit 0: payload is zstd-compressed
//! i64 ingest_ts
//! i64 write_ts
//! i64 source_ts
//! u32 raw_len            uncompressed payload length
//! u32 payload_len        stored payload length (== raw_len when uncompressed)
//! u16 attr_count
//!     u16 key_len, key bytes, u32 val_len, val bytes   (per attribute)
//! payload bytes
//! u32 crc32              over the body up to here
//! ```
//!
//! All integers little-endian. Decoding verifies the checksum, so torn or
//! bit-rotted frames surface as `Corrupt` instead of garbage records.

use std::convert::TryInto;

use bytes::Bytes;

use crate::store::{AttrMap, Record};
use crate::{Error, Result};

/// Upper bound on a single frame; anything larger is rejected on both
/// encode and decode.
pub const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

const FLAG_ZSTD: u8 = 1;

/// zstd level for record payloads; matches the store-wide default.
pub const ZSTD_LEVEL: i32 = 1;

/// Fixed-width entry of `idx.log`. Position equals the entry's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdxEntry {
    pub write_ts: i64,
    pub ingest_ts: i64,
    pub source_ts: i64,
    pub offset: u64,
}

pub const IDX_ENTRY_SIZE: usize = 32;

impl IdxEntry {
    pub fn encode(&self) -> [u8; IDX_ENTRY_SIZE] {
        let mut buf = [0u8; IDX_ENTRY_SIZE];
        buf[0..8].copy_from_slice(&self.write_ts.to_le_bytes());
        buf[8..16].copy_from_slice(&self.ingest_ts.to_le_bytes());
        buf[16..24].copy_from_slice(&self.source_ts.to_le_bytes());
        buf[24..32].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < IDX_ENTRY_SIZE {
            return Err(Error::corrupt("short idx entry"));
        }
        Ok(IdxEntry {
            write_ts: i64::from_le_bytes(buf[0..8].try_into_array()?),
            ingest_ts: i64::from_le_bytes(buf[8..16].try_into_array()?),
            source_ts: i64::from_le_bytes(buf[16..24].try_into_array()?),
            offset: u64::from_le_bytes(buf[24..32].try_into_array()?),
        })
    }
}

// small helper so the decode paths stay readable
trait TryIntoArray {
    fn try_into_array<const N: usize>(&self) -> Result<[u8; N]>;
}

impl TryIntoArray for [u8] {
    fn try_into_array<const N: usize>(&self) -> Result<[u8; N]> {
        self.try_into()
            .map_err(|_| Error::corrupt("short field"))
    }
}

/// Encode a record into a frame. The payload is compressed only when that
/// actually shrinks it, mirroring the usual blob-store rule.
pub fn encode_record(rec: &Record, compress: bool) -> Result<Vec<u8>> {
    let mut payload: &[u8] = &rec.raw;
    let mut flags = 0u8;

    let compressed;
    if compress && !rec.raw.is_empty() {
        compressed = zstd::block::compress(&rec.raw, ZSTD_LEVEL)?;
        if compressed.len() < rec.raw.len() {
            payload = &compressed;
            flags |= FLAG_ZSTD;
        }
    }

    let mut body = Vec::with_capacity(64 + payload.len());
    body.push(flags);
    body.extend_from_slice(&rec.ingest_ts.to_le_bytes());
    body.extend_from_slice(&rec.write_ts.to_le_bytes());
    body.extend_from_slice(&rec.source_ts.to_le_bytes());
    body.extend_from_slice(&(rec.raw.len() as u32).to_le_bytes());
    body.extend_from_slice(&(payload.len() as u32).to_le_bytes());

    if rec.attrs.len() > u16::MAX as usize {
        return Err(Error::invalid("too many attributes"));
    }
    body.extend_from_slice(&(rec.attrs.len() as u16).to_le_bytes());
    for (key, value) in &rec.attrs {
        if key.len() > u16::MAX as usize {
            return Err(Error::invalid(format!("attribute key too long ({} bytes)", key.len())));
        }
        body.extend_from_slice(&(key.len() as u16).to_le_bytes());
        body.extend_from_slice(key.as_bytes());
        body.extend_from_slice(&(value.len() as u32).to_le_bytes());
        body.extend_from_slice(value.as_bytes());
    }

    body.extend_from_slice(payload);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    body.extend_from_slice(&hasher.finalize().to_le_bytes());

    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::invalid(format!("record too large ({} bytes)", body.len())));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one frame from the start of `data`. Returns the record and the
/// total number of bytes consumed.
pub fn decode_record(data: &[u8]) -> Result<(Record, usize)> {
    if data.len() < 4 {
        return Err(Error::corrupt("truncated frame length"));
    }
    let body_len = u32::from_le_bytes(data[0..4].try_into_array()?) as usize;
    if body_len > MAX_FRAME_SIZE {
        return Err(Error::corrupt(format!("oversized frame ({} bytes)", body_len)));
    }
    if data.len() < 4 + body_len {
        return Err(Error::corrupt("truncated frame body"));
    }
    let body = &data[4..4 + body_len];
    if body.len() < 1 + 24 + 4 + 4 + 2 + 4 {
        return Err(Error::corrupt("frame body too small"));
    }

    let crc_off = body.len() - 4;
    let expected_crc = u32::from_le_bytes(body[crc_off..].try_into_array()?);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body[..crc_off]);
    if hasher.finalize() != expected_crc {
        return Err(Error::corrupt("frame crc mismatch"));
    }

    let flags = body[0];
    let ingest_ts = i64::from_le_bytes(body[1..9].try_into_array()?);
    let write_ts = i64::from_le_bytes(body[9..17].try_into_array()?);
    let source_ts = i64::from_le_bytes(body[17..25].try_into_array()?);
    let raw_len = u32::from_le_bytes(body[25..29].try_into_array()?) as usize;
    let payload_len = u32::from_le_bytes(body[29..33].try_into_array()?) as usize;
    let attr_count = u16::from_le_bytes(body[33..35].try_into_array()?) as usize;

    let mut pos = 35;
    let mut attrs = AttrMap::new();
    for _ in 0..attr_count {
        if pos + 2 > crc_off {
            return Err(Error::corrupt("truncated attribute key length"));
        }
        let klen = u16::from_le_bytes(body[pos..pos + 2].try_into_array()?) as usize;
        pos += 2;
        if pos + klen + 4 > crc_off {
            return Err(Error::corrupt("truncated attribute key"));
        }
        let key = std::str::from_utf8(&body[pos..pos + klen])
            .map_err(|_| Error::corrupt("attribute key not utf-8"))?
            .to_owned();
        pos += klen;
        let vlen = u32::from_le_bytes(body[pos..pos + 4].try_into_array()?) as usize;
        pos += 4;
        if pos + vlen > crc_off {
            return Err(Error::corrupt("truncated attribute value"));
        }
        let value = std::str::from_utf8(&body[pos..pos + vlen])
            .map_err(|_| Error::corrupt("attribute value not utf-8"))?
            .to_owned();
        pos += vlen;
        attrs.insert(key, value);
    }

    if pos + payload_len != crc_off {
        return Err(Error::corrupt("frame payload length mismatch"));
    }
    let payload = &body[pos..pos + payload_len];

    let raw = if flags & FLAG_ZSTD != 0 {
        let decompressed = zstd::block::decompress(payload, MAX_FRAME_SIZE)?;
        if decompressed.len() != raw_len {
            return Err(Error::corrupt("decompressed length mismatch"));
        }
        Bytes::from(decompressed)
    } else {
        if payload_len != raw_len {
            return Err(Error::corrupt("payload length mismatch"));
        }
        Bytes::copy_from_slice(payload)
    };

    Ok((
        Record {
            raw,
            attrs,
            ingest_ts,
            write_ts,
            source_ts,
        },
        4 + body_len,
    ))
}

/// Frame length at `data` (total bytes including the length prefix), if a
/// complete length prefix is present.
pub fn frame_size_at(data: &[u8]) -> Option<usize> {
    if data.len() < 4 {
        return None;
    }
    let body_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    Some(4 + body_len)
}
