//! Segment store laid out as blobs of an object storage.
//!
//! ```text
//! <root>/journal.log
//! <root>/gc.log
//! <root>/manifest
//! <root>/<archive>/NNNN.<uuid>     segment blobs, NNNN is the position in hex
//! <root>/<archive>/<archive>.brf   binary references, optional
//! <root>/<archive>/<archive>.gph   graph, optional
//! <root>/<archive>/<archive>.idx   index, written when the archive is closed
//! ```

use bytes::{Bytes, BytesMut};
use config::StoreLocation;
use log::{debug, info};
use opendal::services::Azblob;
use opendal::Operator;

use crate::error::PersistenceError;
use crate::properties::{self, Properties};
use crate::reverse_reader::{ReverseLineReader, DEFAULT_BUFFER_SIZE};
use crate::{
    GcJournalFile, JournalFile, JournalReader, JournalWriter, ManifestFile, Persistence, RangeRead,
    GC_JOURNAL_FILE_NAME, JOURNAL_FILE_NAME, MANIFEST_FILE_NAME,
};

mod archive;

pub use self::archive::{CloudArchiveManager, CloudArchiveReader, CloudArchiveWriter};

#[derive(Debug, Clone)]
pub struct CloudPersistence {
    op: Operator,
    journal_buffer_size: usize,
}

impl CloudPersistence {
    pub fn new(op: Operator) -> Self {
        Self {
            op,
            journal_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Connect to the Azure blob container of `location`, authenticating with the shared `account_key`.
    pub fn from_location(
        location: &StoreLocation,
        account_key: &str,
    ) -> Result<Self, PersistenceError> {
        let StoreLocation::Azure {
            endpoint,
            account,
            container,
            prefix,
        } = location
        else {
            return Err(PersistenceError::Configuration(format!(
                "{location} is not a cloud location"
            )));
        };

        let mut builder = Azblob::default();
        builder
            .root(&format!("/{prefix}"))
            .container(container)
            .endpoint(endpoint)
            .account_name(account)
            .account_key(account_key);
        let op = Operator::new(builder)?.finish();
        info!("Connected to {}", location);
        Ok(Self::new(op))
    }

    pub fn with_journal_buffer_size(mut self, journal_buffer_size: usize) -> Self {
        self.journal_buffer_size = journal_buffer_size;
        self
    }
}

impl Persistence for CloudPersistence {
    type Journal = CloudJournalFile;
    type GcJournal = CloudGcJournalFile;
    type Manifest = CloudManifestFile;
    type ArchiveManager = CloudArchiveManager;

    fn journal_file(&self) -> CloudJournalFile {
        CloudJournalFile {
            blob: Blob::new(self.op.clone(), JOURNAL_FILE_NAME),
            buffer_size: self.journal_buffer_size,
        }
    }

    fn gc_journal_file(&self) -> CloudGcJournalFile {
        CloudGcJournalFile {
            blob: Blob::new(self.op.clone(), GC_JOURNAL_FILE_NAME),
        }
    }

    fn manifest_file(&self) -> CloudManifestFile {
        CloudManifestFile {
            blob: Blob::new(self.op.clone(), MANIFEST_FILE_NAME),
        }
    }

    async fn segment_files_exist(&self) -> Result<bool, PersistenceError> {
        let manager = CloudArchiveManager::new(self.op.clone());
        Ok(!archive::list(&manager).await?.is_empty())
    }

    async fn create_archive_manager(&self) -> Result<CloudArchiveManager, PersistenceError> {
        Ok(CloudArchiveManager::new(self.op.clone()))
    }
}

/// A single blob addressed by its path relative to the operator root.
#[derive(Debug, Clone)]
pub(crate) struct Blob {
    op: Operator,
    path: String,
}

impl Blob {
    pub(crate) fn new(op: Operator, path: impl Into<String>) -> Self {
        Self {
            op,
            path: path.into(),
        }
    }

    pub(crate) async fn exists(&self) -> Result<bool, PersistenceError> {
        Ok(self.op.is_exist(&self.path).await?)
    }

    /// Content of the blob, `None` if it does not exist.
    pub(crate) async fn read(&self) -> Result<Option<Bytes>, PersistenceError> {
        match self.op.read(&self.path).await {
            Ok(content) => Ok(Some(Bytes::from(content))),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn size(&self) -> Result<u64, PersistenceError> {
        match self.op.stat(&self.path).await {
            Ok(metadata) => Ok(metadata.content_length()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn write(&self, content: Bytes) -> Result<(), PersistenceError> {
        self.op.write(&self.path, content).await?;
        Ok(())
    }
}

impl RangeRead for Blob {
    async fn read_range(&self, offset: u64, length: usize) -> Result<Bytes, PersistenceError> {
        let content = self
            .op
            .range_read(&self.path, offset..offset + length as u64)
            .await?;
        Ok(Bytes::from(content))
    }
}

fn lines_of(content: &[u8]) -> Result<Vec<String>, PersistenceError> {
    std::str::from_utf8(content)
        .map(|text| text.lines().map(str::to_owned).collect())
        .map_err(|e| PersistenceError::DataCorrupted(format!("journal is not UTF-8: {e}")))
}

pub struct CloudJournalFile {
    blob: Blob,
    buffer_size: usize,
}

impl JournalFile for CloudJournalFile {
    type Reader = CloudJournalReader;
    type Writer = CloudJournalWriter;

    async fn exists(&self) -> Result<bool, PersistenceError> {
        self.blob.exists().await
    }

    async fn open_journal_reader(&self) -> Result<CloudJournalReader, PersistenceError> {
        let length = self.blob.size().await?;
        debug!("Opened journal blob {} of {} bytes", self.blob.path, length);
        Ok(CloudJournalReader {
            inner: ReverseLineReader::with_buffer_size(
                self.blob.clone(),
                length,
                self.buffer_size,
            ),
        })
    }

    async fn open_journal_writer(&self) -> Result<CloudJournalWriter, PersistenceError> {
        let content = self.blob.read().await?.unwrap_or_default();
        Ok(CloudJournalWriter {
            blob: self.blob.clone(),
            content: BytesMut::from(&content[..]),
        })
    }
}

pub struct CloudJournalReader {
    inner: ReverseLineReader<Blob>,
}

impl JournalReader for CloudJournalReader {
    async fn read_line(&mut self) -> Result<Option<String>, PersistenceError> {
        self.inner.read_line().await
    }
}

/// Blobs cannot be appended to: lines are buffered and the whole journal is uploaded on close.
pub struct CloudJournalWriter {
    blob: Blob,
    content: BytesMut,
}

impl JournalWriter for CloudJournalWriter {
    async fn truncate(&mut self) -> Result<(), PersistenceError> {
        self.content.clear();
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> Result<(), PersistenceError> {
        self.content.extend_from_slice(line.as_bytes());
        self.content.extend_from_slice(b"\n");
        Ok(())
    }

    async fn close(self) -> Result<(), PersistenceError> {
        self.blob.write(self.content.freeze()).await
    }
}

pub struct CloudGcJournalFile {
    blob: Blob,
}

impl GcJournalFile for CloudGcJournalFile {
    async fn read_lines(&self) -> Result<Vec<String>, PersistenceError> {
        match self.blob.read().await? {
            Some(content) => lines_of(&content),
            None => Ok(vec![]),
        }
    }

    async fn truncate(&self) -> Result<(), PersistenceError> {
        if self.blob.exists().await? {
            self.blob.write(Bytes::new()).await?;
        }
        Ok(())
    }

    async fn write_line(&self, line: &str) -> Result<(), PersistenceError> {
        self.write_lines(&[line.to_owned()]).await
    }

    /// Blobs cannot be appended to: the journal is read and rewritten once per batch.
    async fn write_lines(&self, lines: &[String]) -> Result<(), PersistenceError> {
        if lines.is_empty() {
            return Ok(());
        }
        let content = self.blob.read().await?.unwrap_or_default();
        let mut updated = BytesMut::with_capacity(
            content.len() + lines.iter().map(|line| line.len() + 1).sum::<usize>(),
        );
        updated.extend_from_slice(&content);
        for line in lines {
            updated.extend_from_slice(line.as_bytes());
            updated.extend_from_slice(b"\n");
        }
        self.blob.write(updated.freeze()).await
    }
}

pub struct CloudManifestFile {
    blob: Blob,
}

impl ManifestFile for CloudManifestFile {
    async fn exists(&self) -> Result<bool, PersistenceError> {
        self.blob.exists().await
    }

    async fn load(&self) -> Result<Properties, PersistenceError> {
        match self.blob.read().await? {
            Some(content) => {
                let text = std::str::from_utf8(&content).map_err(|e| {
                    PersistenceError::DataCorrupted(format!("manifest is not UTF-8: {e}"))
                })?;
                properties::decode(text)
            }
            None => Err(PersistenceError::NotFound(self.blob.path.clone())),
        }
    }

    async fn save(&self, properties: &Properties) -> Result<(), PersistenceError> {
        self.blob
            .write(Bytes::from(properties::encode(properties)))
            .await
    }
}
