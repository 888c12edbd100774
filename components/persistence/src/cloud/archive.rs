use std::collections::HashMap;

use bytes::Bytes;
use futures::TryStreamExt;
use log::{debug, info};
use model::index::{decode_entries, encode_entries};
use model::{SegmentArchiveEntry, SegmentId};
use opendal::Operator;

use super::Blob;
use crate::error::PersistenceError;
use crate::{check_segment_length, ArchiveManager, ArchiveReader, ArchiveWriter};

const INDEX_SUFFIX: &str = ".idx";
const GRAPH_SUFFIX: &str = ".gph";
const BINARY_REFERENCES_SUFFIX: &str = ".brf";

fn segment_path(archive: &str, position: usize, id: &SegmentId) -> String {
    format!("{archive}/{position:04x}.{id}")
}

fn blob_path(archive: &str, suffix: &str) -> String {
    format!("{archive}/{archive}{suffix}")
}

#[derive(Debug, Clone)]
pub struct CloudArchiveManager {
    op: Operator,
}

impl CloudArchiveManager {
    pub(crate) fn new(op: Operator) -> Self {
        Self { op }
    }

    /// Delete every blob of an archive, the index first so that a partial removal leaves an unclosed archive.
    async fn remove(&self, name: &str) -> Result<(), PersistenceError> {
        let mut lister = match self.op.list(&format!("{name}/")).await {
            Ok(lister) => lister,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut paths = vec![];
        while let Some(entry) = lister.try_next().await? {
            if !entry.path().ends_with('/') {
                paths.push(entry.path().to_owned());
            }
        }
        if paths.is_empty() {
            return Ok(());
        }

        let index = blob_path(name, INDEX_SUFFIX);
        self.op.delete(&index).await?;
        for path in paths.iter().filter(|path| **path != index) {
            self.op.delete(path).await?;
        }
        info!("Removed {} blobs of existing archive {}", paths.len(), name);
        Ok(())
    }
}

/// Archive directories directly under the root.
pub(crate) async fn list(manager: &CloudArchiveManager) -> Result<Vec<String>, PersistenceError> {
    let mut lister = match manager.op.list("/").await {
        Ok(lister) => lister,
        Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };
    let mut names = vec![];
    while let Some(entry) = lister.try_next().await? {
        if let Some(name) = entry.path().strip_suffix('/') {
            let name = name.trim_start_matches('/');
            if !name.is_empty() && !name.contains('/') {
                names.push(name.to_owned());
            }
        }
    }
    names.sort();
    Ok(names)
}

impl ArchiveManager for CloudArchiveManager {
    type Reader = CloudArchiveReader;
    type Writer = CloudArchiveWriter;

    async fn list_archives(&self) -> Result<Vec<String>, PersistenceError> {
        list(self).await
    }

    async fn open(&self, name: &str) -> Result<CloudArchiveReader, PersistenceError> {
        let index = Blob::new(self.op.clone(), blob_path(name, INDEX_SUFFIX));
        let entries = match index.read().await? {
            Some(content) => decode_entries(content)?,
            None if self.op.is_exist(&format!("{name}/")).await? => {
                return Err(PersistenceError::DataCorrupted(format!(
                    "archive {name} has no index, it was not closed"
                )))
            }
            None => return Err(PersistenceError::NotFound(name.to_owned())),
        };

        let paths = entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (entry.id, segment_path(name, position, &entry.id)))
            .collect();
        debug!("Opened archive {} with {} segments", name, entries.len());
        Ok(CloudArchiveReader {
            name: name.to_owned(),
            op: self.op.clone(),
            entries,
            paths,
        })
    }

    async fn create(&self, name: &str) -> Result<CloudArchiveWriter, PersistenceError> {
        self.remove(name).await?;
        info!("Creating archive {}", name);
        Ok(CloudArchiveWriter {
            name: name.to_owned(),
            op: self.op.clone(),
            entries: vec![],
        })
    }
}

pub struct CloudArchiveReader {
    name: String,
    op: Operator,
    entries: Vec<SegmentArchiveEntry>,
    paths: HashMap<SegmentId, String>,
}

impl CloudArchiveReader {
    fn blob(&self, suffix: &str) -> Blob {
        Blob::new(self.op.clone(), blob_path(&self.name, suffix))
    }
}

impl ArchiveReader for CloudArchiveReader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_segments(&self) -> Result<Vec<SegmentArchiveEntry>, PersistenceError> {
        Ok(self.entries.clone())
    }

    async fn read_segment(&self, id: SegmentId) -> Result<Bytes, PersistenceError> {
        let path = self
            .paths
            .get(&id)
            .ok_or_else(|| PersistenceError::NotFound(format!("segment {id} in {}", self.name)))?;
        Ok(Bytes::from(self.op.read(path).await?))
    }

    async fn has_graph(&self) -> Result<bool, PersistenceError> {
        self.blob(GRAPH_SUFFIX).exists().await
    }

    async fn graph(&self) -> Result<Bytes, PersistenceError> {
        self.blob(GRAPH_SUFFIX)
            .read()
            .await?
            .ok_or_else(|| PersistenceError::NotFound(format!("graph of {}", self.name)))
    }

    async fn binary_references(&self) -> Result<Option<Bytes>, PersistenceError> {
        self.blob(BINARY_REFERENCES_SUFFIX).read().await
    }
}

pub struct CloudArchiveWriter {
    name: String,
    op: Operator,
    entries: Vec<SegmentArchiveEntry>,
}

impl CloudArchiveWriter {
    fn blob(&self, suffix: &str) -> Blob {
        Blob::new(self.op.clone(), blob_path(&self.name, suffix))
    }
}

impl ArchiveWriter for CloudArchiveWriter {
    async fn write_segment(
        &mut self,
        entry: &SegmentArchiveEntry,
        data: Bytes,
    ) -> Result<(), PersistenceError> {
        check_segment_length(entry, &data)?;
        let path = segment_path(&self.name, self.entries.len(), &entry.id);
        self.op.write(&path, data).await?;
        self.entries.push(*entry);
        Ok(())
    }

    async fn write_graph(&mut self, data: Bytes) -> Result<(), PersistenceError> {
        self.blob(GRAPH_SUFFIX).write(data).await
    }

    async fn write_binary_references(&mut self, data: Bytes) -> Result<(), PersistenceError> {
        self.blob(BINARY_REFERENCES_SUFFIX).write(data).await
    }

    async fn close(self) -> Result<(), PersistenceError> {
        self.blob(INDEX_SUFFIX)
            .write(encode_entries(&self.entries))
            .await?;
        debug!(
            "Closed archive {} with {} segments",
            self.name,
            self.entries.len()
        );
        Ok(())
    }
}
