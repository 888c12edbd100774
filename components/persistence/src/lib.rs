//! # Segment store persistence
//!
//! A segment store keeps its state in four kinds of resources:
//! - the journal, an append-only log of root references whose last line is the current head;
//! - the GC journal, an append-only log of garbage collection bookkeeping;
//! - the manifest, a small set of key/value properties;
//! - segment archives, ordered containers of immutable segments plus optional binary reference and graph blobs.
//!
//! [`Persistence`] is the capability set over those resources. Two implementations exist:
//! [`local::LocalPersistence`] keeps everything in a local directory, one file per archive, while
//! [`cloud::CloudPersistence`] lays the same resources out as blobs of an object storage through opendal.
//! Code moving data between stores only depends on the traits of this module.
#![allow(async_fn_in_trait)]

use std::future::Future;

use bytes::Bytes;
use model::{SegmentArchiveEntry, SegmentId};

pub mod cloud;
pub mod error;
pub mod local;
#[cfg(any(test, feature = "mock"))]
pub mod memory;
pub mod properties;
pub mod reverse_reader;

pub use crate::error::PersistenceError;
pub use crate::properties::Properties;
pub use crate::reverse_reader::ReverseLineReader;

pub const JOURNAL_FILE_NAME: &str = "journal.log";
pub const GC_JOURNAL_FILE_NAME: &str = "gc.log";
pub const MANIFEST_FILE_NAME: &str = "manifest";

/// Capability set of a segment store backend.
pub trait Persistence {
    type Journal: JournalFile;
    type GcJournal: GcJournalFile;
    type Manifest: ManifestFile;
    type ArchiveManager: ArchiveManager;

    fn journal_file(&self) -> Self::Journal;

    fn gc_journal_file(&self) -> Self::GcJournal;

    fn manifest_file(&self) -> Self::Manifest;

    /// Whether the store holds at least one segment archive.
    async fn segment_files_exist(&self) -> Result<bool, PersistenceError>;

    async fn create_archive_manager(&self) -> Result<Self::ArchiveManager, PersistenceError>;
}

pub trait JournalFile {
    type Reader: JournalReader;
    type Writer: JournalWriter;

    async fn exists(&self) -> Result<bool, PersistenceError>;

    /// Open a reader returning journal lines from the most recent to the oldest.
    async fn open_journal_reader(&self) -> Result<Self::Reader, PersistenceError>;

    async fn open_journal_writer(&self) -> Result<Self::Writer, PersistenceError>;
}

pub trait JournalReader {
    /// Read the next line, going backward from the end of the journal.
    ///
    /// Returns `Ok(None)` once the beginning of the journal has been passed.
    async fn read_line(&mut self) -> Result<Option<String>, PersistenceError>;
}

pub trait JournalWriter {
    async fn truncate(&mut self) -> Result<(), PersistenceError>;

    async fn write_line(&mut self, line: &str) -> Result<(), PersistenceError>;

    /// Flush pending lines and release the journal.
    async fn close(self) -> Result<(), PersistenceError>;
}

pub trait GcJournalFile {
    /// All lines in the order they were written. An absent GC journal has no lines.
    async fn read_lines(&self) -> Result<Vec<String>, PersistenceError>;

    async fn truncate(&self) -> Result<(), PersistenceError>;

    async fn write_line(&self, line: &str) -> Result<(), PersistenceError>;

    /// Append `lines` in order. Nothing is written when `lines` is empty.
    async fn write_lines(&self, lines: &[String]) -> Result<(), PersistenceError> {
        for line in lines {
            self.write_line(line).await?;
        }
        Ok(())
    }
}

pub trait ManifestFile {
    async fn exists(&self) -> Result<bool, PersistenceError>;

    async fn load(&self) -> Result<Properties, PersistenceError>;

    /// Replace the manifest with the given properties.
    async fn save(&self, properties: &Properties) -> Result<(), PersistenceError>;
}

pub trait ArchiveManager {
    type Reader: ArchiveReader;
    type Writer: ArchiveWriter;

    /// Names of all archives, sorted.
    async fn list_archives(&self) -> Result<Vec<String>, PersistenceError>;

    /// Open an existing archive for reading.
    ///
    /// Fails with [`PersistenceError::NotFound`] if there is no archive by that name.
    async fn open(&self, name: &str) -> Result<Self::Reader, PersistenceError>;

    /// Create a new archive. Creating an archive that already exists replaces it.
    async fn create(&self, name: &str) -> Result<Self::Writer, PersistenceError>;
}

/// Read access to a closed archive.
///
/// Readers are shared by concurrent fetch tasks: every read is independent from the others.
pub trait ArchiveReader: Send + Sync {
    fn name(&self) -> &str;

    /// Entries of all segments, in the order they were written.
    async fn list_segments(&self) -> Result<Vec<SegmentArchiveEntry>, PersistenceError>;

    fn read_segment(
        &self,
        id: SegmentId,
    ) -> impl Future<Output = Result<Bytes, PersistenceError>> + Send;

    async fn has_graph(&self) -> Result<bool, PersistenceError>;

    async fn graph(&self) -> Result<Bytes, PersistenceError>;

    /// Binary references blob of the archive, `None` if the archive has none.
    async fn binary_references(&self) -> Result<Option<Bytes>, PersistenceError>;
}

/// Write access to an archive being created. A writer has a single owner.
pub trait ArchiveWriter {
    /// Append a segment. `data` must be exactly `entry.length` bytes long.
    async fn write_segment(
        &mut self,
        entry: &SegmentArchiveEntry,
        data: Bytes,
    ) -> Result<(), PersistenceError>;

    async fn write_graph(&mut self, data: Bytes) -> Result<(), PersistenceError>;

    async fn write_binary_references(&mut self, data: Bytes) -> Result<(), PersistenceError>;

    /// Seal the archive. Segments written so far become visible to readers.
    async fn close(self) -> Result<(), PersistenceError>;
}

/// Byte range access to a resource of fixed size.
pub trait RangeRead {
    /// Read exactly `length` bytes starting at `offset`.
    async fn read_range(&self, offset: u64, length: usize) -> Result<Bytes, PersistenceError>;
}

/// Reject a segment whose payload does not match the length recorded by its entry.
pub(crate) fn check_segment_length(
    entry: &SegmentArchiveEntry,
    data: &Bytes,
) -> Result<(), PersistenceError> {
    if data.len() != entry.length as usize {
        return Err(PersistenceError::DataCorrupted(format!(
            "segment {} has {} bytes, {} expected",
            entry.id,
            data.len(),
            entry.length
        )));
    }
    Ok(())
}

impl<T> RangeRead for &T
where
    T: RangeRead,
{
    async fn read_range(&self, offset: u64, length: usize) -> Result<Bytes, PersistenceError> {
        (**self).read_range(offset, length).await
    }
}
