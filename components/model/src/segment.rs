use std::fmt::{self, Display, Formatter};

use bytes::Bytes;
use uuid::Uuid;

/// 128-bit identity of a segment, split into the most and least significant halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId {
    pub msb: u64,
    pub lsb: u64,
}

impl SegmentId {
    pub fn new(msb: u64, lsb: u64) -> Self {
        Self { msb, lsb }
    }

    pub fn random() -> Self {
        let (msb, lsb) = Uuid::new_v4().as_u64_pair();
        Self { msb, lsb }
    }

    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_u64_pair(self.msb, self.lsb)
    }
}

impl From<Uuid> for SegmentId {
    fn from(uuid: Uuid) -> Self {
        let (msb, lsb) = uuid.as_u64_pair();
        Self { msb, lsb }
    }
}

impl Display for SegmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uuid())
    }
}

/// Metadata of a segment as listed by an archive, in archive order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentArchiveEntry {
    pub id: SegmentId,

    /// Length of the segment payload in bytes.
    pub length: u32,

    pub generation: u32,

    pub full_generation: u32,

    pub compacted: bool,
}

impl SegmentArchiveEntry {
    pub fn new(
        id: SegmentId,
        length: u32,
        generation: u32,
        full_generation: u32,
        compacted: bool,
    ) -> Self {
        Self {
            id,
            length,
            generation,
            full_generation,
            compacted,
        }
    }
}

/// A fully fetched segment: its archive entry together with the payload.
///
/// The payload is immutable. Handing the segment to a writer through [`Segment::into_parts`]
/// moves the payload, no copy of it is kept.
#[derive(Debug, Clone)]
pub struct Segment {
    entry: SegmentArchiveEntry,
    data: Bytes,
}

impl Segment {
    pub fn new(entry: SegmentArchiveEntry, data: Bytes) -> Self {
        Self { entry, data }
    }

    pub fn id(&self) -> SegmentId {
        self.entry.id
    }

    pub fn entry(&self) -> &SegmentArchiveEntry {
        &self.entry
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_parts(self) -> (SegmentArchiveEntry, Bytes) {
        (self.entry, self.data)
    }
}

impl Display for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entry.id)
    }
}

#[cfg(test)]
mod tests {
    use super::{Segment, SegmentArchiveEntry, SegmentId};
    use bytes::Bytes;
    use uuid::Uuid;

    #[test]
    fn test_segment_id_display() {
        let uuid = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        let id = SegmentId::from(uuid);
        assert_eq!(0x67e5504410b1426f, id.msb);
        assert_eq!(0x9247bb680e5fe0c8, id.lsb);
        assert_eq!("67e55044-10b1-426f-9247-bb680e5fe0c8", id.to_string());
        assert_eq!(uuid, id.to_uuid());
    }

    #[test]
    fn test_into_parts() {
        let id = SegmentId::random();
        let entry = SegmentArchiveEntry::new(id, 3, 1, 2, true);
        let segment = Segment::new(entry, Bytes::from_static(b"abc"));
        assert_eq!(id, segment.id());
        assert_eq!(3, segment.len());
        assert_eq!(id.to_string(), segment.to_string());

        let (entry, data) = segment.into_parts();
        assert_eq!(1, entry.generation);
        assert_eq!(2, entry.full_generation);
        assert!(entry.compacted);
        assert_eq!(&b"abc"[..], &data[..]);
    }
}
