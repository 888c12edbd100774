//! Single-file archive layout.
//!
//! Segment payloads and the optional blobs are appended in the order they are written. Closing the
//! archive appends the segment index and a fixed-size footer:
//!
//! ```text
//! +-----------------------------+
//! | payloads and blobs          |
//! +-----------------------------+
//! | index: N * (position + entry)|
//! +-----------------------------+
//! | footer (38 bytes)           |
//! +-----------------------------+
//! ```
//!
//! Footer, big-endian: binary references offset (8) and length (4), graph offset (8) and length (4),
//! flags (1), entry count (4), CRC32 of the index (4), magic (4), version (1).

use std::collections::HashMap;
use std::io::{Cursor, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, info};
use model::index::{decode_entry, encode_entry, ENTRY_LENGTH};
use model::{SegmentArchiveEntry, SegmentId};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

use super::{read_at, LOCK_FILE_NAME};
use crate::error::PersistenceError;
use crate::{
    check_segment_length, ArchiveManager, ArchiveReader, ArchiveWriter, GC_JOURNAL_FILE_NAME,
    JOURNAL_FILE_NAME, MANIFEST_FILE_NAME,
};

pub(crate) const FOOTER_LENGTH: usize = 38;
pub(crate) const INDEX_RECORD_LENGTH: usize = 8 + ENTRY_LENGTH;
const MAGIC: u32 = 0x5341_5243; // "SARC"
const VERSION: u8 = 1;

const FLAG_BINARY_REFERENCES: u8 = 0x01;
const FLAG_GRAPH: u8 = 0x02;

const RESERVED_FILE_NAMES: [&str; 4] = [
    JOURNAL_FILE_NAME,
    GC_JOURNAL_FILE_NAME,
    MANIFEST_FILE_NAME,
    LOCK_FILE_NAME,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    offset: u64,
    length: u32,
}

#[derive(Debug, PartialEq, Eq)]
struct Footer {
    binary_references: Option<Extent>,
    graph: Option<Extent>,
    entry_count: u32,
    index_crc: u32,
}

impl Footer {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FOOTER_LENGTH);
        let mut flags = 0;
        for (extent, flag) in [
            (self.binary_references, FLAG_BINARY_REFERENCES),
            (self.graph, FLAG_GRAPH),
        ] {
            if extent.is_some() {
                flags |= flag;
            }
            let extent = extent.unwrap_or(Extent {
                offset: 0,
                length: 0,
            });
            buf.put_u64(extent.offset);
            buf.put_u32(extent.length);
        }
        buf.put_u8(flags);
        buf.put_u32(self.entry_count);
        buf.put_u32(self.index_crc);
        buf.put_u32(MAGIC);
        buf.put_u8(VERSION);
        buf.freeze()
    }

    fn decode(buf: &[u8]) -> Result<Self, PersistenceError> {
        let mut cursor = Cursor::new(buf);
        let binary_references = Extent {
            offset: cursor.read_u64::<BigEndian>()?,
            length: cursor.read_u32::<BigEndian>()?,
        };
        let graph = Extent {
            offset: cursor.read_u64::<BigEndian>()?,
            length: cursor.read_u32::<BigEndian>()?,
        };
        let flags = cursor.read_u8()?;
        let entry_count = cursor.read_u32::<BigEndian>()?;
        let index_crc = cursor.read_u32::<BigEndian>()?;
        let magic = cursor.read_u32::<BigEndian>()?;
        let version = cursor.read_u8()?;
        if magic != MAGIC {
            return Err(PersistenceError::DataCorrupted(format!(
                "unexpected archive magic {magic:#x}"
            )));
        }
        if version != VERSION {
            return Err(PersistenceError::DataCorrupted(format!(
                "unsupported archive version {version}"
            )));
        }
        Ok(Self {
            binary_references: (flags & FLAG_BINARY_REFERENCES != 0).then_some(binary_references),
            graph: (flags & FLAG_GRAPH != 0).then_some(graph),
            entry_count,
            index_crc,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LocalArchiveManager {
    dir: PathBuf,
}

impl LocalArchiveManager {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

/// Archive files of the directory: regular, non-hidden files other than the journals, manifest and lock.
pub(crate) async fn list(manager: &LocalArchiveManager) -> Result<Vec<String>, PersistenceError> {
    let mut read_dir = match fs::read_dir(&manager.dir).await {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };
    let mut names = vec![];
    while let Some(entry) = read_dir.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || RESERVED_FILE_NAMES.contains(&name.as_str()) {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

impl ArchiveManager for LocalArchiveManager {
    type Reader = LocalArchiveReader;
    type Writer = LocalArchiveWriter;

    async fn list_archives(&self) -> Result<Vec<String>, PersistenceError> {
        list(self).await
    }

    async fn open(&self, name: &str) -> Result<LocalArchiveReader, PersistenceError> {
        let path = self.dir.join(name);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(PersistenceError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let length = file.metadata().await?.len();
        let file = Arc::new(file.into_std().await);
        LocalArchiveReader::load(name, file, length).await
    }

    async fn create(&self, name: &str) -> Result<LocalArchiveWriter, PersistenceError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(name);
        let file = File::create(&path).await?;
        info!("Created archive {:?}", path);
        Ok(LocalArchiveWriter {
            path,
            writer: BufWriter::new(file),
            position: 0,
            index: vec![],
            binary_references: None,
            graph: None,
        })
    }
}

/// Whether `length` bytes at `offset` end before `limit`.
fn within(offset: u64, length: u32, limit: u64) -> bool {
    offset
        .checked_add(length as u64)
        .is_some_and(|end| end <= limit)
}

pub struct LocalArchiveReader {
    name: String,
    file: Arc<std::fs::File>,
    entries: Vec<SegmentArchiveEntry>,
    positions: HashMap<SegmentId, Extent>,
    binary_references: Option<Extent>,
    graph: Option<Extent>,
}

impl LocalArchiveReader {
    async fn load(
        name: &str,
        file: Arc<std::fs::File>,
        length: u64,
    ) -> Result<Self, PersistenceError> {
        let corrupted = |reason: String| {
            PersistenceError::DataCorrupted(format!("archive {name}: {reason}"))
        };
        if length < FOOTER_LENGTH as u64 {
            return Err(corrupted(format!("{length} bytes is too short")));
        }

        let footer_offset = length - FOOTER_LENGTH as u64;
        let footer = read_at(Arc::clone(&file), footer_offset, FOOTER_LENGTH).await?;
        let footer = Footer::decode(&footer)?;

        let index_length = footer.entry_count as u64 * INDEX_RECORD_LENGTH as u64;
        if index_length > footer_offset {
            return Err(corrupted(format!(
                "index of {} entries exceeds the archive",
                footer.entry_count
            )));
        }
        let index_offset = footer_offset - index_length;
        let mut index = read_at(Arc::clone(&file), index_offset, index_length as usize).await?;
        if crc32fast::hash(&index) != footer.index_crc {
            return Err(corrupted("index checksum mismatch".to_owned()));
        }

        let mut entries = Vec::with_capacity(footer.entry_count as usize);
        let mut positions = HashMap::with_capacity(footer.entry_count as usize);
        while index.has_remaining() {
            let offset = index.get_u64();
            let entry = decode_entry(&mut index)?;
            if !within(offset, entry.length, index_offset) {
                return Err(corrupted(format!("segment {} is out of bounds", entry.id)));
            }
            positions.insert(
                entry.id,
                Extent {
                    offset,
                    length: entry.length,
                },
            );
            entries.push(entry);
        }

        for extent in footer.binary_references.iter().chain(footer.graph.iter()) {
            if !within(extent.offset, extent.length, index_offset) {
                return Err(corrupted("blob is out of bounds".to_owned()));
            }
        }

        debug!(
            "Opened archive {} with {} segments",
            name,
            entries.len()
        );
        Ok(Self {
            name: name.to_owned(),
            file,
            entries,
            positions,
            binary_references: footer.binary_references,
            graph: footer.graph,
        })
    }

    async fn read_extent(&self, extent: Extent) -> Result<Bytes, PersistenceError> {
        read_at(Arc::clone(&self.file), extent.offset, extent.length as usize).await
    }
}

impl ArchiveReader for LocalArchiveReader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_segments(&self) -> Result<Vec<SegmentArchiveEntry>, PersistenceError> {
        Ok(self.entries.clone())
    }

    async fn read_segment(&self, id: SegmentId) -> Result<Bytes, PersistenceError> {
        let extent = self
            .positions
            .get(&id)
            .copied()
            .ok_or_else(|| PersistenceError::NotFound(format!("segment {id} in {}", self.name)))?;
        self.read_extent(extent).await
    }

    async fn has_graph(&self) -> Result<bool, PersistenceError> {
        Ok(self.graph.is_some())
    }

    async fn graph(&self) -> Result<Bytes, PersistenceError> {
        match self.graph {
            Some(extent) => self.read_extent(extent).await,
            None => Err(PersistenceError::NotFound(format!(
                "graph of {}",
                self.name
            ))),
        }
    }

    async fn binary_references(&self) -> Result<Option<Bytes>, PersistenceError> {
        match self.binary_references {
            Some(extent) => self.read_extent(extent).await.map(Some),
            None => Ok(None),
        }
    }
}

pub struct LocalArchiveWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    position: u64,
    index: Vec<(u64, SegmentArchiveEntry)>,
    binary_references: Option<Extent>,
    graph: Option<Extent>,
}

impl LocalArchiveWriter {
    async fn append(&mut self, data: &[u8]) -> Result<Extent, PersistenceError> {
        let length = u32::try_from(data.len()).map_err(|_| {
            PersistenceError::DataCorrupted(format!("blob of {} bytes is too large", data.len()))
        })?;
        self.writer.write_all(data).await?;
        let extent = Extent {
            offset: self.position,
            length,
        };
        self.position += data.len() as u64;
        Ok(extent)
    }
}

impl ArchiveWriter for LocalArchiveWriter {
    async fn write_segment(
        &mut self,
        entry: &SegmentArchiveEntry,
        data: Bytes,
    ) -> Result<(), PersistenceError> {
        check_segment_length(entry, &data)?;
        let extent = self.append(&data).await?;
        self.index.push((extent.offset, *entry));
        Ok(())
    }

    async fn write_graph(&mut self, data: Bytes) -> Result<(), PersistenceError> {
        self.graph = Some(self.append(&data).await?);
        Ok(())
    }

    async fn write_binary_references(&mut self, data: Bytes) -> Result<(), PersistenceError> {
        self.binary_references = Some(self.append(&data).await?);
        Ok(())
    }

    async fn close(mut self) -> Result<(), PersistenceError> {
        let mut index = BytesMut::with_capacity(self.index.len() * INDEX_RECORD_LENGTH);
        for (offset, entry) in &self.index {
            index.put_u64(*offset);
            encode_entry(entry, &mut index);
        }
        let footer = Footer {
            binary_references: self.binary_references,
            graph: self.graph,
            entry_count: self.index.len() as u32,
            index_crc: crc32fast::hash(&index),
        };
        self.writer.write_all(&index).await?;
        self.writer.write_all(&footer.encode()).await?;
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await?;
        debug!(
            "Closed archive {:?} with {} segments",
            self.path,
            self.index.len()
        );
        Ok(())
    }
}
