//! Binary encoding of archive index entries.
//!
//! Every entry is encoded in big-endian order:
//!
//! ```text
//! | msb (8) | lsb (8) | length (4) | generation (4) | full generation (4) | compacted (1) |
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DecodeError;
use crate::segment::{SegmentArchiveEntry, SegmentId};

/// Encoded size of a single [`SegmentArchiveEntry`].
pub const ENTRY_LENGTH: usize = 29;

pub fn encode_entry(entry: &SegmentArchiveEntry, buf: &mut BytesMut) {
    buf.reserve(ENTRY_LENGTH);
    buf.put_u64(entry.id.msb);
    buf.put_u64(entry.id.lsb);
    buf.put_u32(entry.length);
    buf.put_u32(entry.generation);
    buf.put_u32(entry.full_generation);
    buf.put_u8(u8::from(entry.compacted));
}

pub fn decode_entry<B: Buf>(buf: &mut B) -> Result<SegmentArchiveEntry, DecodeError> {
    if buf.remaining() < ENTRY_LENGTH {
        return Err(DecodeError::InsufficientData {
            remaining: buf.remaining(),
            required: ENTRY_LENGTH,
        });
    }
    let msb = buf.get_u64();
    let lsb = buf.get_u64();
    let length = buf.get_u32();
    let generation = buf.get_u32();
    let full_generation = buf.get_u32();
    let compacted = match buf.get_u8() {
        0 => false,
        1 => true,
        flag => return Err(DecodeError::InvalidFlag(flag)),
    };
    Ok(SegmentArchiveEntry::new(
        SegmentId::new(msb, lsb),
        length,
        generation,
        full_generation,
        compacted,
    ))
}

/// Encode entries back to back, preserving their order.
pub fn encode_entries(entries: &[SegmentArchiveEntry]) -> Bytes {
    let mut buf = BytesMut::with_capacity(entries.len() * ENTRY_LENGTH);
    entries
        .iter()
        .for_each(|entry| encode_entry(entry, &mut buf));
    buf.freeze()
}

pub fn decode_entries(mut buf: Bytes) -> Result<Vec<SegmentArchiveEntry>, DecodeError> {
    if buf.len() % ENTRY_LENGTH != 0 {
        return Err(DecodeError::IndexLengthMismatch(buf.len()));
    }
    let mut entries = Vec::with_capacity(buf.len() / ENTRY_LENGTH);
    while buf.has_remaining() {
        entries.push(decode_entry(&mut buf)?);
    }
    Ok(entries)
}
