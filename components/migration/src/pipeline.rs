use std::sync::Arc;

use log::{debug, trace};
use model::Segment;
use persistence::{ArchiveReader, ArchiveWriter, PersistenceError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::error::MigrationError;
use crate::retry::RetryPolicy;

/// Copies the segments of an archive, fetching up to `read_threads` of them concurrently while writing them
/// one at a time in archive order.
pub struct SegmentPipeline {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    retry: RetryPolicy,
}

impl SegmentPipeline {
    pub fn new(read_threads: usize, retry: RetryPolicy) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(read_threads.max(1))),
            tracker: TaskTracker::new(),
            retry,
        }
    }

    /// Copy all segments of `reader` into `writer`, returning the number of segments written.
    ///
    /// Every segment is fetched by its own task. Handles are awaited in submission order, so a segment is
    /// written only after all segments listed before it, whatever order fetches complete in. The first
    /// failed fetch or write aborts the copy; fetches not awaited yet are cancelled.
    pub async fn copy_segments<R, W>(
        &self,
        reader: Arc<R>,
        writer: &mut W,
    ) -> Result<usize, MigrationError>
    where
        R: ArchiveReader + 'static,
        W: ArchiveWriter,
    {
        if self.tracker.is_closed() {
            return Err(PersistenceError::Internal("segment pipeline is closed".to_owned()).into());
        }

        let archive = reader.name().to_owned();
        let entries = self
            .retry
            .execute(&format!("list segments of {archive}"), || {
                reader.list_segments()
            })
            .await?;
        debug!("Copying {} segments of {}", entries.len(), archive);

        let handles: Vec<_> = entries
            .into_iter()
            .map(|entry| {
                let reader = Arc::clone(&reader);
                let permits = Arc::clone(&self.permits);
                let retry = self.retry.clone();
                self.tracker.spawn(async move {
                    let _permit = permits.acquire_owned().await.map_err(|_| {
                        PersistenceError::Internal("fetch permits are closed".to_owned())
                    })?;
                    let description = format!("read segment {} of {}", entry.id, reader.name());
                    let data = retry
                        .execute(&description, || reader.read_segment(entry.id))
                        .await?;
                    trace!("Fetched segment {} of {} bytes", entry.id, data.len());
                    Ok::<_, PersistenceError>(Segment::new(entry, data))
                })
            })
            .collect();
        let mut pending = PendingFetches(handles.into_iter());

        let mut copied = 0;
        while let Some(handle) = pending.0.next() {
            let segment = match handle.await {
                Ok(result) => result?,
                Err(source) => return Err(MigrationError::Join { archive, source }),
            };
            let (entry, data) = segment.into_parts();
            writer.write_segment(&entry, data).await?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Stop accepting archives and wait for the fetch tasks still running to finish.
    pub async fn close(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Fetch tasks not awaited yet. They are aborted when the copy stops early.
struct PendingFetches(std::vec::IntoIter<JoinHandle<Result<Segment, PersistenceError>>>);

impl Drop for PendingFetches {
    fn drop(&mut self) {
        self.0.by_ref().for_each(|handle| handle.abort());
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::io;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use model::SegmentArchiveEntry;
    use persistence::memory::{MemoryArchive, MemoryPersistence};
    use persistence::{ArchiveManager, ArchiveWriter, Persistence, PersistenceError};
    use tokio::time::Instant;

    use super::SegmentPipeline;
    use crate::error::MigrationError;
    use crate::retry::RetryPolicy;

    fn archive(segments: usize) -> MemoryArchive {
        (0..segments).fold(MemoryArchive::new(), |archive, i| {
            archive.with_segment(Bytes::from(format!("segment-{i}")))
        })
    }

    /// Accepts `remaining` segments, then fails.
    struct FailingWriter {
        remaining: usize,
    }

    impl ArchiveWriter for FailingWriter {
        async fn write_segment(
            &mut self,
            _entry: &SegmentArchiveEntry,
            _data: Bytes,
        ) -> Result<(), PersistenceError> {
            if self.remaining == 0 {
                return Err(PersistenceError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "no space left on device",
                )));
            }
            self.remaining -= 1;
            Ok(())
        }

        async fn write_graph(&mut self, _data: Bytes) -> Result<(), PersistenceError> {
            Ok(())
        }

        async fn write_binary_references(&mut self, _data: Bytes) -> Result<(), PersistenceError> {
            Ok(())
        }

        async fn close(self) -> Result<(), PersistenceError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_preserved() -> Result<(), Box<dyn Error>> {
        ulog::try_init_log();
        let source = MemoryPersistence::new();
        let expected = archive(32);
        source.add_archive("data00000a.tar", expected.clone());
        // Later segments complete first.
        let ids: Vec<_> = expected.segments.iter().map(|(entry, _)| entry.id).collect();
        source.set_read_delay(move |id| {
            let position = ids.iter().position(|other| other == id).unwrap_or(0);
            Duration::from_millis(1000 - position as u64 * 10)
        });

        let target = MemoryPersistence::new();
        let pipeline = SegmentPipeline::new(8, RetryPolicy::new(3, Duration::from_secs(1)));
        let reader = Arc::new(source.create_archive_manager().await?.open("data00000a.tar").await?);
        let manager = target.create_archive_manager().await?;
        let mut writer = manager.create("data00000a.tar").await?;
        assert_eq!(32, pipeline.copy_segments(reader, &mut writer).await?);
        persistence::ArchiveWriter::close(writer).await?;
        pipeline.close().await;

        assert_eq!(Some(expected), target.archive("data00000a.tar"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried() -> Result<(), Box<dyn Error>> {
        let source = MemoryPersistence::new();
        source.add_archive("data00000a.tar", archive(4));
        source.fail_segment_reads(3);

        let pipeline = SegmentPipeline::new(1, RetryPolicy::new(4, Duration::from_secs(1)));
        let reader = Arc::new(source.open("data00000a.tar").await?);
        let target = MemoryPersistence::new();
        let mut writer = target.create("data00000a.tar").await?;
        assert_eq!(4, pipeline.copy_segments(reader, &mut writer).await?);
        assert_eq!(7, source.segment_reads());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_fetch_aborts() -> Result<(), Box<dyn Error>> {
        let source = MemoryPersistence::new();
        source.add_archive("data00000a.tar", archive(2));
        source.fail_segment_reads(usize::MAX);

        let pipeline = SegmentPipeline::new(2, RetryPolicy::new(2, Duration::from_secs(1)));
        let reader = Arc::new(source.open("data00000a.tar").await?);
        let target = MemoryPersistence::new();
        let mut writer = target.create("data00000a.tar").await?;
        let result = pipeline.copy_segments(reader, &mut writer).await;
        assert!(matches!(
            result,
            Err(MigrationError::Persistence(PersistenceError::Io(_)))
        ));
        pipeline.close().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_cancels_fetches() -> Result<(), Box<dyn Error>> {
        let source = MemoryPersistence::new();
        source.add_archive("data00000a.tar", archive(16));
        source.set_read_delay(|_| Duration::from_secs(1));

        let pipeline = SegmentPipeline::new(1, RetryPolicy::new(16, Duration::from_secs(5)));
        let reader = Arc::new(source.open("data00000a.tar").await?);
        let mut writer = FailingWriter { remaining: 1 };
        let start = Instant::now();
        let result = pipeline.copy_segments(reader, &mut writer).await;
        assert!(matches!(
            result,
            Err(MigrationError::Persistence(PersistenceError::Io(_)))
        ));

        let reads = source.segment_reads();
        assert!(reads < 16);
        pipeline.close().await;
        assert_eq!(reads, source.segment_reads());
        assert!(start.elapsed() < Duration::from_secs(16));
        Ok(())
    }

    #[tokio::test]
    async fn test_closed_pipeline_rejects_work() -> Result<(), Box<dyn Error>> {
        let source = MemoryPersistence::new();
        source.add_archive("data00000a.tar", archive(1));
        let pipeline = SegmentPipeline::new(2, RetryPolicy::new(1, Duration::from_secs(1)));
        pipeline.close().await;

        let reader = Arc::new(source.open("data00000a.tar").await?);
        let mut writer = source.create("data00000b.tar").await?;
        assert!(pipeline.copy_segments(reader, &mut writer).await.is_err());
        Ok(())
    }
}
