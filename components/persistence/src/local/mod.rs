//! Segment store kept in a local directory.
//!
//! ```text
//! <dir>/journal.log
//! <dir>/gc.log
//! <dir>/manifest
//! <dir>/<archive>      one file per archive, see `archive` for its layout
//! ```

use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::PersistenceError;
use crate::properties::{self, Properties};
use crate::reverse_reader::{ReverseLineReader, DEFAULT_BUFFER_SIZE};
use crate::{
    GcJournalFile, JournalFile, JournalReader, JournalWriter, ManifestFile, Persistence, RangeRead,
    GC_JOURNAL_FILE_NAME, JOURNAL_FILE_NAME, MANIFEST_FILE_NAME,
};

mod archive;

pub use self::archive::{LocalArchiveManager, LocalArchiveReader, LocalArchiveWriter};

pub(crate) const LOCK_FILE_NAME: &str = "repo.lock";

#[derive(Debug, Clone)]
pub struct LocalPersistence {
    dir: PathBuf,
    journal_buffer_size: usize,
}

impl LocalPersistence {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            journal_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_journal_buffer_size(mut self, journal_buffer_size: usize) -> Self {
        self.journal_buffer_size = journal_buffer_size;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Persistence for LocalPersistence {
    type Journal = LocalJournalFile;
    type GcJournal = LocalGcJournalFile;
    type Manifest = LocalManifestFile;
    type ArchiveManager = LocalArchiveManager;

    fn journal_file(&self) -> LocalJournalFile {
        LocalJournalFile {
            path: self.dir.join(JOURNAL_FILE_NAME),
            buffer_size: self.journal_buffer_size,
        }
    }

    fn gc_journal_file(&self) -> LocalGcJournalFile {
        LocalGcJournalFile {
            path: self.dir.join(GC_JOURNAL_FILE_NAME),
        }
    }

    fn manifest_file(&self) -> LocalManifestFile {
        LocalManifestFile {
            path: self.dir.join(MANIFEST_FILE_NAME),
        }
    }

    async fn segment_files_exist(&self) -> Result<bool, PersistenceError> {
        let manager = LocalArchiveManager::new(self.dir.clone());
        Ok(!archive::list(&manager).await?.is_empty())
    }

    async fn create_archive_manager(&self) -> Result<LocalArchiveManager, PersistenceError> {
        Ok(LocalArchiveManager::new(self.dir.clone()))
    }
}

/// Positional read of an open file, executed on the blocking pool so that concurrent reads do not
/// contend on a shared cursor.
pub(crate) async fn read_at(
    file: Arc<std::fs::File>,
    offset: u64,
    length: usize,
) -> Result<Bytes, PersistenceError> {
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0; length];
        file.read_exact_at(&mut buf, offset)?;
        Ok::<_, PersistenceError>(Bytes::from(buf))
    })
    .await
    .map_err(|e| PersistenceError::Internal(format!("positional read task failed: {e}")))?
}

pub(crate) async fn exists(path: &Path) -> Result<bool, PersistenceError> {
    match fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn mkdirs_for(path: &Path) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

async fn open_for_append(path: &Path) -> Result<File, PersistenceError> {
    mkdirs_for(path).await?;
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

pub struct LocalJournalFile {
    path: PathBuf,
    buffer_size: usize,
}

impl JournalFile for LocalJournalFile {
    type Reader = LocalJournalReader;
    type Writer = LocalJournalWriter;

    async fn exists(&self) -> Result<bool, PersistenceError> {
        exists(&self.path).await
    }

    async fn open_journal_reader(&self) -> Result<LocalJournalReader, PersistenceError> {
        let (file, length) = match File::open(&self.path).await {
            Ok(file) => {
                let length = file.metadata().await?.len();
                (Some(Arc::new(file.into_std().await)), length)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => (None, 0),
            Err(e) => return Err(e.into()),
        };
        debug!("Opened journal {:?} of {} bytes", self.path, length);
        Ok(LocalJournalReader {
            inner: ReverseLineReader::with_buffer_size(
                FileRange { file },
                length,
                self.buffer_size,
            ),
        })
    }

    async fn open_journal_writer(&self) -> Result<LocalJournalWriter, PersistenceError> {
        Ok(LocalJournalWriter {
            file: open_for_append(&self.path).await?,
        })
    }
}

struct FileRange {
    file: Option<Arc<std::fs::File>>,
}

impl RangeRead for FileRange {
    async fn read_range(&self, offset: u64, length: usize) -> Result<Bytes, PersistenceError> {
        match &self.file {
            Some(file) => read_at(Arc::clone(file), offset, length).await,
            None => Ok(Bytes::new()),
        }
    }
}

pub struct LocalJournalReader {
    inner: ReverseLineReader<FileRange>,
}

impl JournalReader for LocalJournalReader {
    async fn read_line(&mut self) -> Result<Option<String>, PersistenceError> {
        self.inner.read_line().await
    }
}

pub struct LocalJournalWriter {
    file: File,
}

impl JournalWriter for LocalJournalWriter {
    async fn truncate(&mut self) -> Result<(), PersistenceError> {
        self.file.set_len(0).await?;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> Result<(), PersistenceError> {
        self.file.write_all(format!("{line}\n").as_bytes()).await?;
        Ok(())
    }

    async fn close(mut self) -> Result<(), PersistenceError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

pub struct LocalGcJournalFile {
    path: PathBuf,
}

impl GcJournalFile for LocalGcJournalFile {
    async fn read_lines(&self) -> Result<Vec<String>, PersistenceError> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content.lines().map(str::to_owned).collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e.into()),
        }
    }

    async fn truncate(&self) -> Result<(), PersistenceError> {
        if exists(&self.path).await? {
            OpenOptions::new()
                .write(true)
                .open(&self.path)
                .await?
                .set_len(0)
                .await?;
        }
        Ok(())
    }

    async fn write_line(&self, line: &str) -> Result<(), PersistenceError> {
        let mut file = open_for_append(&self.path).await?;
        file.write_all(format!("{line}\n").as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn write_lines(&self, lines: &[String]) -> Result<(), PersistenceError> {
        if lines.is_empty() {
            return Ok(());
        }
        let content: String = lines.iter().map(|line| format!("{line}\n")).collect();
        let mut file = open_for_append(&self.path).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

pub struct LocalManifestFile {
    path: PathBuf,
}

impl ManifestFile for LocalManifestFile {
    async fn exists(&self) -> Result<bool, PersistenceError> {
        exists(&self.path).await
    }

    async fn load(&self) -> Result<Properties, PersistenceError> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => properties::decode(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(PersistenceError::NotFound(self.path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, properties: &Properties) -> Result<(), PersistenceError> {
        mkdirs_for(&self.path).await?;
        let tmp = self.path.with_file_name(format!(".{MANIFEST_FILE_NAME}.tmp"));
        fs::write(&tmp, properties::encode(properties)).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
