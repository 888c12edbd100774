//! In-memory segment store with fault injection, for tests of code built on the persistence traits.
//!
//! Clones share the same state, so a test keeps a handle to inspect what was written through another.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use model::{SegmentArchiveEntry, SegmentId};
use parking_lot::Mutex;

use crate::error::PersistenceError;
use crate::properties::Properties;
use crate::reverse_reader::{ReverseLineReader, DEFAULT_BUFFER_SIZE};
use crate::{
    check_segment_length, ArchiveManager, ArchiveReader, ArchiveWriter, GcJournalFile, JournalFile,
    JournalReader, JournalWriter, ManifestFile, Persistence, RangeRead,
};

type ReadDelay = Arc<dyn Fn(&SegmentId) -> Duration + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryArchive {
    pub segments: Vec<(SegmentArchiveEntry, Bytes)>,
    pub graph: Option<Bytes>,
    pub binary_references: Option<Bytes>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a segment with a random id.
    pub fn with_segment(mut self, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let generation = self.segments.len() as u32;
        let entry = SegmentArchiveEntry::new(
            SegmentId::random(),
            data.len() as u32,
            generation,
            generation,
            false,
        );
        self.segments.push((entry, data));
        self
    }

    pub fn with_graph(mut self, graph: impl Into<Bytes>) -> Self {
        self.graph = Some(graph.into());
        self
    }

    pub fn with_binary_references(mut self, binary_references: impl Into<Bytes>) -> Self {
        self.binary_references = Some(binary_references.into());
        self
    }

    pub fn entries(&self) -> Vec<SegmentArchiveEntry> {
        self.segments.iter().map(|(entry, _)| *entry).collect()
    }
}

#[derive(Default)]
struct State {
    journal: Option<BytesMut>,
    gc_journal: Option<Vec<String>>,
    manifest: Option<Properties>,
    archives: BTreeMap<String, MemoryArchive>,
}

#[derive(Default)]
struct Faults {
    read_delay: Option<ReadDelay>,
    failing_segment_reads: usize,
    unreachable_archive_opens: usize,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    faults: Mutex<Faults>,
    segment_reads: AtomicUsize,
    archives_created: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryPersistence {
    inner: Arc<Inner>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_journal<S: AsRef<str>>(&self, lines: &[S]) {
        let mut content = BytesMut::new();
        for line in lines {
            content.extend_from_slice(line.as_ref().as_bytes());
            content.extend_from_slice(b"\n");
        }
        self.inner.state.lock().journal = Some(content);
    }

    /// Lines of the journal in written order, `None` if there is no journal.
    pub fn journal_lines(&self) -> Option<Vec<String>> {
        self.inner.state.lock().journal.as_ref().map(|content| {
            String::from_utf8_lossy(content)
                .lines()
                .map(str::to_owned)
                .collect()
        })
    }

    pub fn set_gc_journal<S: AsRef<str>>(&self, lines: &[S]) {
        self.inner.state.lock().gc_journal =
            Some(lines.iter().map(|line| line.as_ref().to_owned()).collect());
    }

    pub fn gc_journal_lines(&self) -> Option<Vec<String>> {
        self.inner.state.lock().gc_journal.clone()
    }

    pub fn set_manifest(&self, properties: Properties) {
        self.inner.state.lock().manifest = Some(properties);
    }

    pub fn manifest(&self) -> Option<Properties> {
        self.inner.state.lock().manifest.clone()
    }

    pub fn add_archive(&self, name: &str, archive: MemoryArchive) {
        self.inner
            .state
            .lock()
            .archives
            .insert(name.to_owned(), archive);
    }

    pub fn archive(&self, name: &str) -> Option<MemoryArchive> {
        self.inner.state.lock().archives.get(name).cloned()
    }

    pub fn archive_names(&self) -> Vec<String> {
        self.inner.state.lock().archives.keys().cloned().collect()
    }

    /// Delay every segment read by the duration computed for its id.
    pub fn set_read_delay<F>(&self, delay: F)
    where
        F: Fn(&SegmentId) -> Duration + Send + Sync + 'static,
    {
        self.inner.faults.lock().read_delay = Some(Arc::new(delay));
    }

    /// Make the next `count` segment reads fail with a transient I/O error.
    pub fn fail_segment_reads(&self, count: usize) {
        self.inner.faults.lock().failing_segment_reads = count;
    }

    /// Make the next `count` archive opens fail as if the store was not reachable.
    pub fn fail_archive_opens(&self, count: usize) {
        self.inner.faults.lock().unreachable_archive_opens = count;
    }

    /// Number of segment read attempts, failed ones included.
    pub fn segment_reads(&self) -> usize {
        self.inner.segment_reads.load(Ordering::Relaxed)
    }

    pub fn archives_created(&self) -> usize {
        self.inner.archives_created.load(Ordering::Relaxed)
    }
}

impl Persistence for MemoryPersistence {
    type Journal = MemoryPersistence;
    type GcJournal = MemoryPersistence;
    type Manifest = MemoryPersistence;
    type ArchiveManager = MemoryPersistence;

    fn journal_file(&self) -> MemoryPersistence {
        self.clone()
    }

    fn gc_journal_file(&self) -> MemoryPersistence {
        self.clone()
    }

    fn manifest_file(&self) -> MemoryPersistence {
        self.clone()
    }

    async fn segment_files_exist(&self) -> Result<bool, PersistenceError> {
        Ok(!self.inner.state.lock().archives.is_empty())
    }

    async fn create_archive_manager(&self) -> Result<MemoryPersistence, PersistenceError> {
        Ok(self.clone())
    }
}

impl RangeRead for Bytes {
    async fn read_range(&self, offset: u64, length: usize) -> Result<Bytes, PersistenceError> {
        let start = offset as usize;
        if start + length > self.len() {
            return Err(PersistenceError::Internal(format!(
                "range {}..{} is beyond {} bytes",
                start,
                start + length,
                self.len()
            )));
        }
        Ok(self.slice(start..start + length))
    }
}

pub struct MemoryJournalReader {
    inner: ReverseLineReader<Bytes>,
}

impl JournalReader for MemoryJournalReader {
    async fn read_line(&mut self) -> Result<Option<String>, PersistenceError> {
        self.inner.read_line().await
    }
}

pub struct MemoryJournalWriter {
    store: MemoryPersistence,
}

impl JournalWriter for MemoryJournalWriter {
    async fn truncate(&mut self) -> Result<(), PersistenceError> {
        if let Some(content) = self.store.inner.state.lock().journal.as_mut() {
            content.clear();
        }
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> Result<(), PersistenceError> {
        let mut state = self.store.inner.state.lock();
        let content = state.journal.get_or_insert_with(BytesMut::new);
        content.extend_from_slice(line.as_bytes());
        content.extend_from_slice(b"\n");
        Ok(())
    }

    async fn close(self) -> Result<(), PersistenceError> {
        Ok(())
    }
}

impl JournalFile for MemoryPersistence {
    type Reader = MemoryJournalReader;
    type Writer = MemoryJournalWriter;

    async fn exists(&self) -> Result<bool, PersistenceError> {
        Ok(self.inner.state.lock().journal.is_some())
    }

    async fn open_journal_reader(&self) -> Result<MemoryJournalReader, PersistenceError> {
        let snapshot = self
            .inner
            .state
            .lock()
            .journal
            .as_ref()
            .map(|content| Bytes::copy_from_slice(content))
            .unwrap_or_default();
        let length = snapshot.len() as u64;
        Ok(MemoryJournalReader {
            inner: ReverseLineReader::with_buffer_size(snapshot, length, DEFAULT_BUFFER_SIZE),
        })
    }

    async fn open_journal_writer(&self) -> Result<MemoryJournalWriter, PersistenceError> {
        Ok(MemoryJournalWriter {
            store: self.clone(),
        })
    }
}

impl GcJournalFile for MemoryPersistence {
    async fn read_lines(&self) -> Result<Vec<String>, PersistenceError> {
        Ok(self.gc_journal_lines().unwrap_or_default())
    }

    async fn truncate(&self) -> Result<(), PersistenceError> {
        if let Some(lines) = self.inner.state.lock().gc_journal.as_mut() {
            lines.clear();
        }
        Ok(())
    }

    async fn write_line(&self, line: &str) -> Result<(), PersistenceError> {
        self.inner
            .state
            .lock()
            .gc_journal
            .get_or_insert_with(Vec::new)
            .push(line.to_owned());
        Ok(())
    }
}

impl ManifestFile for MemoryPersistence {
    async fn exists(&self) -> Result<bool, PersistenceError> {
        Ok(self.inner.state.lock().manifest.is_some())
    }

    async fn load(&self) -> Result<Properties, PersistenceError> {
        self.manifest()
            .ok_or_else(|| PersistenceError::NotFound("manifest".to_owned()))
    }

    async fn save(&self, properties: &Properties) -> Result<(), PersistenceError> {
        self.set_manifest(properties.clone());
        Ok(())
    }
}

impl ArchiveManager for MemoryPersistence {
    type Reader = MemoryArchiveReader;
    type Writer = MemoryArchiveWriter;

    async fn list_archives(&self) -> Result<Vec<String>, PersistenceError> {
        Ok(self.archive_names())
    }

    async fn open(&self, name: &str) -> Result<MemoryArchiveReader, PersistenceError> {
        {
            let mut faults = self.inner.faults.lock();
            if faults.unreachable_archive_opens > 0 {
                faults.unreachable_archive_opens -= 1;
                return Err(PersistenceError::Unreachable(format!(
                    "injected failure opening {name}"
                )));
            }
        }
        let archive = self
            .archive(name)
            .ok_or_else(|| PersistenceError::NotFound(name.to_owned()))?;
        let payloads = archive
            .segments
            .iter()
            .map(|(entry, data)| (entry.id, data.clone()))
            .collect();
        Ok(MemoryArchiveReader {
            name: name.to_owned(),
            store: self.clone(),
            archive,
            payloads,
        })
    }

    async fn create(&self, name: &str) -> Result<MemoryArchiveWriter, PersistenceError> {
        self.inner.archives_created.fetch_add(1, Ordering::Relaxed);
        Ok(MemoryArchiveWriter {
            name: name.to_owned(),
            store: self.clone(),
            archive: MemoryArchive::new(),
        })
    }
}

pub struct MemoryArchiveReader {
    name: String,
    store: MemoryPersistence,
    archive: MemoryArchive,
    payloads: HashMap<SegmentId, Bytes>,
}

impl ArchiveReader for MemoryArchiveReader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_segments(&self) -> Result<Vec<SegmentArchiveEntry>, PersistenceError> {
        Ok(self.archive.entries())
    }

    async fn read_segment(&self, id: SegmentId) -> Result<Bytes, PersistenceError> {
        let inner = &self.store.inner;
        inner.segment_reads.fetch_add(1, Ordering::Relaxed);
        let (delay, fail) = {
            let mut faults = inner.faults.lock();
            let delay = faults.read_delay.as_ref().map(|delay| delay(&id));
            let fail = faults.failing_segment_reads > 0;
            if fail {
                faults.failing_segment_reads -= 1;
            }
            (delay, fail)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(PersistenceError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                format!("injected failure reading segment {id}"),
            )));
        }
        self.payloads
            .get(&id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(format!("segment {id} in {}", self.name)))
    }

    async fn has_graph(&self) -> Result<bool, PersistenceError> {
        Ok(self.archive.graph.is_some())
    }

    async fn graph(&self) -> Result<Bytes, PersistenceError> {
        self.archive
            .graph
            .clone()
            .ok_or_else(|| PersistenceError::NotFound(format!("graph of {}", self.name)))
    }

    async fn binary_references(&self) -> Result<Option<Bytes>, PersistenceError> {
        Ok(self.archive.binary_references.clone())
    }
}

/// Archive under construction, published to the store on close.
pub struct MemoryArchiveWriter {
    name: String,
    store: MemoryPersistence,
    archive: MemoryArchive,
}

impl ArchiveWriter for MemoryArchiveWriter {
    async fn write_segment(
        &mut self,
        entry: &SegmentArchiveEntry,
        data: Bytes,
    ) -> Result<(), PersistenceError> {
        check_segment_length(entry, &data)?;
        self.archive.segments.push((*entry, data));
        Ok(())
    }

    async fn write_graph(&mut self, data: Bytes) -> Result<(), PersistenceError> {
        self.archive.graph = Some(data);
        Ok(())
    }

    async fn write_binary_references(&mut self, data: Bytes) -> Result<(), PersistenceError> {
        self.archive.binary_references = Some(data);
        Ok(())
    }

    async fn close(self) -> Result<(), PersistenceError> {
        self.store.add_archive(&self.name, self.archive);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::{MemoryArchive, MemoryPersistence};
    use crate::{
        ArchiveManager, ArchiveReader, ArchiveWriter, JournalFile, JournalReader, Persistence,
        PersistenceError,
    };

    #[tokio::test]
    async fn test_journal_snapshot() -> Result<(), PersistenceError> {
        let store = MemoryPersistence::new();
        assert!(!JournalFile::exists(&store).await?);
        store.set_journal(&["rootA", "rootB"]);
        let mut reader = store.journal_file().open_journal_reader().await?;
        store.set_journal(&["rootC"]);
        assert_eq!(Some("rootB".to_owned()), reader.read_line().await?);
        assert_eq!(Some("rootA".to_owned()), reader.read_line().await?);
        assert_eq!(None, reader.read_line().await?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_injection() -> Result<(), PersistenceError> {
        let store = MemoryPersistence::new();
        let archive = MemoryArchive::new().with_segment(Bytes::from_static(b"abc"));
        let id = archive.segments[0].0.id;
        store.add_archive("data00000a.tar", archive);
        store.set_read_delay(|_| Duration::from_millis(100));
        store.fail_segment_reads(1);
        store.fail_archive_opens(1);

        let manager = store.create_archive_manager().await?;
        assert!(matches!(
            manager.open("data00000a.tar").await,
            Err(PersistenceError::Unreachable(_))
        ));
        let reader = manager.open("data00000a.tar").await?;
        assert!(reader.read_segment(id).await.is_err());
        assert_eq!(Bytes::from_static(b"abc"), reader.read_segment(id).await?);
        assert_eq!(2, store.segment_reads());
        Ok(())
    }

    #[tokio::test]
    async fn test_archive_visible_on_close() -> Result<(), PersistenceError> {
        let store = MemoryPersistence::new();
        let manager = store.create_archive_manager().await?;
        let mut writer = manager.create("data00000a.tar").await?;
        writer.write_graph(Bytes::from_static(b"graph")).await?;
        assert!(store.archive_names().is_empty());
        writer.close().await?;
        assert_eq!(vec!["data00000a.tar"], store.archive_names());
        assert_eq!(1, store.archives_created());
        assert!(store.segment_files_exist().await?);
        Ok(())
    }
}
