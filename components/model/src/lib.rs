pub mod error;
pub mod index;
pub mod segment;

pub use crate::segment::Segment;
pub use crate::segment::SegmentArchiveEntry;
pub use crate::segment::SegmentId;
