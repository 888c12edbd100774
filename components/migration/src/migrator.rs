use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use config::Configuration;
use log::{debug, info, warn};
use persistence::{
    ArchiveManager, ArchiveReader, ArchiveWriter, GcJournalFile, JournalFile, JournalReader,
    JournalWriter, ManifestFile, Persistence, PersistenceError,
};

use crate::error::MigrationError;
use crate::pipeline::SegmentPipeline;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Keep what the target already has: journals are extended and existing archives are skipped.
    pub append_mode: bool,

    /// Copy the current head of the journal only.
    pub only_last_journal_entry: bool,

    /// Upper bound of segments fetched concurrently.
    pub read_threads: usize,

    pub retry: RetryPolicy,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            append_mode: false,
            only_last_journal_entry: false,
            read_threads: 20,
            retry: RetryPolicy::new(16, Duration::from_secs(5)),
        }
    }
}

impl From<&Configuration> for MigrationOptions {
    fn from(configuration: &Configuration) -> Self {
        Self {
            append_mode: configuration.append_mode,
            only_last_journal_entry: configuration.only_last_journal_entry,
            read_threads: configuration.read_threads,
            retry: RetryPolicy::from(&configuration.retry),
        }
    }
}

/// What a migration wrote to the target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    pub journal_lines: usize,
    pub gc_journal_lines: usize,
    pub manifest_copied: bool,
    pub archives_copied: usize,
    pub archives_skipped: usize,
    pub segments_copied: usize,
}

impl Display for MigrationSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} journal lines, {} GC journal lines, manifest {}, {} archives with {} segments copied, {} archives skipped",
            self.journal_lines,
            self.gc_journal_lines,
            if self.manifest_copied { "copied" } else { "not copied" },
            self.archives_copied,
            self.segments_copied,
            self.archives_skipped
        )
    }
}

/// Copies a segment store into another one, possibly backed by a different kind of storage.
///
/// The journal, the GC journal and the manifest are copied first, each step retried as a whole on
/// transient failures. Archives follow in source listing order.
pub struct SegmentStoreMigrator<S, T> {
    source: S,
    source_name: String,
    target: T,
    target_name: String,
    options: MigrationOptions,
    pipeline: SegmentPipeline,
}

impl<S, T> SegmentStoreMigrator<S, T>
where
    S: Persistence,
    T: Persistence,
    <S::ArchiveManager as ArchiveManager>::Reader: 'static,
{
    pub fn new(
        source: S,
        source_name: impl Into<String>,
        target: T,
        target_name: impl Into<String>,
        options: MigrationOptions,
    ) -> Self {
        let pipeline = SegmentPipeline::new(options.read_threads, options.retry.clone());
        Self {
            source,
            source_name: source_name.into(),
            target,
            target_name: target_name.into(),
            options,
            pipeline,
        }
    }

    pub async fn migrate(&self) -> Result<MigrationSummary, MigrationError> {
        info!(
            "Migrating {} to {}",
            self.source_name, self.target_name
        );
        let retry = &self.options.retry;
        let mut summary = MigrationSummary {
            journal_lines: retry
                .execute("migrate the journal", || self.migrate_journal())
                .await?,
            gc_journal_lines: retry
                .execute("migrate the GC journal", || self.migrate_gc_journal())
                .await?,
            manifest_copied: retry
                .execute("migrate the manifest", || self.migrate_manifest())
                .await?,
            ..Default::default()
        };
        self.migrate_archives(&mut summary).await?;
        info!("Migration to {} completed: {}", self.target_name, summary);
        Ok(summary)
    }

    /// Wait for fetch tasks still in flight. No archive can be copied afterwards.
    pub async fn close(&self) {
        self.pipeline.close().await;
    }

    async fn migrate_journal(&self) -> Result<usize, PersistenceError> {
        let source = self.source.journal_file();
        if !source.exists().await? {
            info!("No journal in {}, skipping", self.source_name);
            return Ok(0);
        }

        info!("Migrating the journal of {}", self.source_name);
        let mut lines = Vec::new();
        let mut reader = source.open_journal_reader().await?;
        while let Some(line) = reader.read_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            lines.push(line);
            if self.options.only_last_journal_entry {
                break;
            }
        }
        lines.reverse();

        let target = self.target.journal_file();
        let skipped = if self.options.append_mode {
            let tail = read_tail(&target, lines.len()).await?;
            overlap(&tail, &lines)
        } else {
            0
        };
        let mut writer = target.open_journal_writer().await?;
        if !self.options.append_mode {
            writer.truncate().await?;
        }
        for line in &lines[skipped..] {
            writer.write_line(line).await?;
        }
        writer.close().await?;

        debug!(
            "Wrote {} journal lines, {} already present",
            lines.len() - skipped,
            skipped
        );
        Ok(lines.len() - skipped)
    }

    async fn migrate_gc_journal(&self) -> Result<usize, PersistenceError> {
        info!("Migrating the GC journal of {}", self.source_name);
        let lines = self.source.gc_journal_file().read_lines().await?;
        let target = self.target.gc_journal_file();
        let skipped = if self.options.append_mode {
            overlap(&target.read_lines().await?, &lines)
        } else {
            target.truncate().await?;
            0
        };
        target.write_lines(&lines[skipped..]).await?;
        Ok(lines.len() - skipped)
    }

    async fn migrate_manifest(&self) -> Result<bool, PersistenceError> {
        let source = self.source.manifest_file();
        if !source.exists().await? {
            info!("No manifest in {}, skipping", self.source_name);
            return Ok(false);
        }
        info!("Migrating the manifest of {}", self.source_name);
        let properties = source.load().await?;
        self.target.manifest_file().save(&properties).await?;
        Ok(true)
    }

    async fn migrate_archives(&self, summary: &mut MigrationSummary) -> Result<(), MigrationError> {
        let retry = &self.options.retry;
        if !retry
            .execute("look for segment archives", || self.source.segment_files_exist())
            .await?
        {
            info!("No segment archives in {}, skipping", self.source_name);
            return Ok(());
        }

        let source = retry
            .execute("open the source archives", || self.source.create_archive_manager())
            .await?;
        let target = retry
            .execute("open the target archives", || self.target.create_archive_manager())
            .await?;
        let names = retry
            .execute("list the source archives", || source.list_archives())
            .await?;
        let existing: HashSet<String> = retry
            .execute("list the target archives", || target.list_archives())
            .await?
            .into_iter()
            .collect();

        info!(
            "Migrating {} segment archives of {}",
            names.len(),
            self.source_name
        );
        for name in names {
            if self.options.append_mode && existing.contains(&name) {
                info!("Segment archive {} already exists in {}, skipping", name, self.target_name);
                summary.archives_skipped += 1;
                continue;
            }

            info!("Migrating segment archive {}", name);
            let reader = retry
                .execute(&format!("open archive {name}"), || source.open(&name))
                .await?;
            let mut writer = target.create(&name).await?;
            let copied = self.copy_archive(Arc::new(reader), &mut writer).await;
            let closed = writer.close().await;
            if let Err(e) = &copied {
                warn!(
                    "Partial archive {} left in {}, run again without append mode to replace it: {}",
                    name, self.target_name, e
                );
            }
            let segments = copied?;
            closed?;

            summary.archives_copied += 1;
            summary.segments_copied += segments;
        }
        Ok(())
    }

    async fn copy_archive<R, W>(&self, reader: Arc<R>, writer: &mut W) -> Result<usize, MigrationError>
    where
        R: ArchiveReader + 'static,
        W: ArchiveWriter,
    {
        let retry = &self.options.retry;
        let segments = self
            .pipeline
            .copy_segments(Arc::clone(&reader), writer)
            .await?;

        let binary_references = retry
            .execute(&format!("read binary references of {}", reader.name()), || {
                reader.binary_references()
            })
            .await?;
        if let Some(binary_references) = binary_references {
            writer.write_binary_references(binary_references).await?;
        }

        let has_graph = retry
            .execute(&format!("look for the graph of {}", reader.name()), || {
                reader.has_graph()
            })
            .await?;
        if has_graph {
            let graph = retry
                .execute(&format!("read the graph of {}", reader.name()), || {
                    reader.graph()
                })
                .await?;
            writer.write_graph(graph).await?;
        }
        Ok(segments)
    }
}

/// Up to `limit` most recent lines of a journal, oldest first.
async fn read_tail<J: JournalFile>(journal: &J, limit: usize) -> Result<Vec<String>, PersistenceError> {
    let mut tail = Vec::with_capacity(limit);
    if limit == 0 || !journal.exists().await? {
        return Ok(tail);
    }
    let mut reader = journal.open_journal_reader().await?;
    while tail.len() < limit {
        match reader.read_line().await? {
            Some(line) => tail.push(line),
            None => break,
        }
    }
    tail.reverse();
    Ok(tail)
}

/// Length of the longest suffix of `existing` which is also a prefix of `lines`.
fn overlap(existing: &[String], lines: &[String]) -> usize {
    let Some(last) = existing.last() else {
        return 0;
    };
    (1..=existing.len().min(lines.len()))
        .rev()
        .filter(|&k| &lines[k - 1] == last)
        .find(|&k| existing[existing.len() - k..] == lines[..k])
        .unwrap_or(0)
}
