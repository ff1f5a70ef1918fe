//! Snapshot byte format.
//!
//! ```text
//! ┌──────────────┬─────────────┬──────────────┬─────────────┬─────────┬───────────┐
//! │ "EMBERKV\0"  │ version u16 │ saved_at u64 │ count u64   │ records │ crc32 u32 │
//! └──────────────┴─────────────┴──────────────┴─────────────┴─────────┴───────────┘
//!
//! record:
//! key_len u32 │ key │ kind u8 │ value │ has_expiry u8 │ [expires_at u64] │ created_at u64
//!
//! value (kind 0, string):  len u32 │ bytes
//! value (kind 1, integer): i64
//! ```
//!
//! All integers are little-endian. The trailing CRC-32 covers every byte
//! before it.

use crate::persistence::PersistenceError;
use crate::storage::{Entry, Value, ValueKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const MAGIC: &[u8; 8] = b"EMBERKV\0";

pub const VERSION: u16 = 1;

const HEADER_LEN: usize = MAGIC.len() + 2 + 8 + 8;
const CHECKSUM_LEN: usize = 4;

/// Decoded snapshot contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    /// When the snapshot was taken (Unix ms)
    pub saved_at: u64,
    pub entries: Vec<(Bytes, Entry)>,
}

/// Serializes entries into a complete snapshot image.
pub fn encode(saved_at: u64, entries: &[(Bytes, Entry)]) -> Bytes {
    let body: usize = entries
        .iter()
        .map(|(key, entry)| 4 + key.len() + 1 + value_len(&entry.value) + 1 + 8 + 8)
        .sum();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body + CHECKSUM_LEN);

    buf.put_slice(MAGIC);
    buf.put_u16_le(VERSION);
    buf.put_u64_le(saved_at);
    buf.put_u64_le(entries.len() as u64);

    for (key, entry) in entries {
        buf.put_u32_le(key.len() as u32);
        buf.put_slice(key);

        buf.put_u8(entry.value.kind().tag());
        match &entry.value {
            Value::Str(bytes) => {
                buf.put_u32_le(bytes.len() as u32);
                buf.put_slice(bytes);
            }
            Value::Int(n) => buf.put_i64_le(*n),
        }

        match entry.expires_at {
            Some(at) => {
                buf.put_u8(1);
                buf.put_u64_le(at);
            }
            None => buf.put_u8(0),
        }
        buf.put_u64_le(entry.created_at);
    }

    let checksum = crc32fast::hash(&buf);
    buf.put_u32_le(checksum);
    buf.freeze()
}

fn value_len(value: &Value) -> usize {
    match value {
        Value::Str(bytes) => 4 + bytes.len(),
        Value::Int(_) => 8,
    }
}

/// Parses a snapshot image produced by [`encode`].
pub fn decode(data: Bytes) -> Result<SnapshotFile, PersistenceError> {
    if data.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(corrupt("file shorter than header"));
    }

    let (body, trailer) = data.split_at(data.len() - CHECKSUM_LEN);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if crc32fast::hash(body) != expected {
        return Err(corrupt("checksum mismatch"));
    }

    let mut buf = data.slice(..data.len() - CHECKSUM_LEN);

    if &buf[..MAGIC.len()] != MAGIC {
        return Err(corrupt("bad magic"));
    }
    buf.advance(MAGIC.len());

    let version = buf.get_u16_le();
    if version != VERSION {
        return Err(corrupt(format!("unsupported version {}", version)));
    }
    let saved_at = buf.get_u64_le();
    let count = buf.get_u64_le();

    // Every record is at least 18 bytes; don't trust `count` for allocation
    let mut entries = Vec::with_capacity((count as usize).min(buf.remaining() / 18));
    for _ in 0..count {
        entries.push(decode_record(&mut buf)?);
    }

    if buf.has_remaining() {
        return Err(corrupt(format!("{} trailing bytes", buf.remaining())));
    }

    Ok(SnapshotFile { saved_at, entries })
}

fn decode_record(buf: &mut Bytes) -> Result<(Bytes, Entry), PersistenceError> {
    let key_len = take_u32(buf)? as usize;
    let key = take_bytes(buf, key_len)?;

    let tag = take_u8(buf)?;
    let value = match ValueKind::from_tag(tag) {
        Some(ValueKind::Str) => {
            let len = take_u32(buf)? as usize;
            Value::Str(take_bytes(buf, len)?)
        }
        Some(ValueKind::Int) => {
            ensure(buf, 8)?;
            Value::Int(buf.get_i64_le())
        }
        None => return Err(corrupt(format!("unknown value kind {}", tag))),
    };

    let expires_at = match take_u8(buf)? {
        0 => None,
        1 => Some(take_u64(buf)?),
        other => return Err(corrupt(format!("bad expiry flag {}", other))),
    };
    let created_at = take_u64(buf)?;

    Ok((
        key,
        Entry {
            value,
            expires_at,
            created_at,
        },
    ))
}

fn ensure(buf: &Bytes, n: usize) -> Result<(), PersistenceError> {
    if buf.remaining() < n {
        return Err(corrupt("truncated record"));
    }
    Ok(())
}

fn take_u8(buf: &mut Bytes) -> Result<u8, PersistenceError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut Bytes) -> Result<u32, PersistenceError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn take_u64(buf: &mut Bytes) -> Result<u64, PersistenceError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn take_bytes(buf: &mut Bytes, n: usize) -> Result<Bytes, PersistenceError> {
    ensure(buf, n)?;
    Ok(buf.split_to(n))
}

fn corrupt(reason: impl Into<String>) -> PersistenceError {
    PersistenceError::Corrupt(reason.into())
}
