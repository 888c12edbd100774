use std::error::Error;
use std::time::Duration;

use bytes::Bytes;
use migration::{
    MigrationError, MigrationOptions, MigrationSummary, RetryPolicy, SegmentStoreMigrator,
};
use persistence::memory::{MemoryArchive, MemoryPersistence};
use persistence::{PersistenceError, Properties};
use rand::Rng;

fn options(append_mode: bool, only_last_journal_entry: bool) -> MigrationOptions {
    MigrationOptions {
        append_mode,
        only_last_journal_entry,
        read_threads: 4,
        retry: RetryPolicy::new(3, Duration::from_secs(1)),
    }
}

fn migrator(
    source: &MemoryPersistence,
    target: &MemoryPersistence,
    options: MigrationOptions,
) -> SegmentStoreMigrator<MemoryPersistence, MemoryPersistence> {
    SegmentStoreMigrator::new(source.clone(), "source", target.clone(), "target", options)
}

fn archive(segments: usize) -> MemoryArchive {
    (0..segments).fold(MemoryArchive::new(), |archive, i| {
        archive.with_segment(Bytes::from(format!("segment #{i}").repeat(i + 1)))
    })
}

fn manifest(entries: &[(&str, &str)]) -> Properties {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_full_journal() -> Result<(), Box<dyn Error>> {
    ulog::try_init_log();
    let source = MemoryPersistence::new();
    source.set_journal(&["rootA", "rootB", "rootC"]);
    let target = MemoryPersistence::new();
    target.set_journal(&["stale"]);

    let migrator = migrator(&source, &target, options(false, false));
    let summary = migrator.migrate().await?;
    migrator.close().await;

    assert_eq!(3, summary.journal_lines);
    assert_eq!(
        Some(vec!["rootA".to_owned(), "rootB".to_owned(), "rootC".to_owned()]),
        target.journal_lines()
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_only_last_journal_entry() -> Result<(), Box<dyn Error>> {
    let source = MemoryPersistence::new();
    source.set_journal(&["rootA", "rootB", "rootC"]);
    let target = MemoryPersistence::new();

    let summary = migrator(&source, &target, options(false, true))
        .migrate()
        .await?;
    assert_eq!(1, summary.journal_lines);
    assert_eq!(Some(vec!["rootC".to_owned()]), target.journal_lines());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_blank_journal_lines_dropped() -> Result<(), Box<dyn Error>> {
    let source = MemoryPersistence::new();
    source.set_journal(&["rootA", "", "rootB", "  ", ""]);
    let target = MemoryPersistence::new();

    migrator(&source, &target, options(false, false))
        .migrate()
        .await?;
    assert_eq!(
        Some(vec!["rootA".to_owned(), "rootB".to_owned()]),
        target.journal_lines()
    );

    // The head is the last non-blank line.
    let target = MemoryPersistence::new();
    migrator(&source, &target, options(false, true))
        .migrate()
        .await?;
    assert_eq!(Some(vec!["rootB".to_owned()]), target.journal_lines());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_gc_journal_replaced_without_append_mode() -> Result<(), Box<dyn Error>> {
    let source = MemoryPersistence::new();
    source.set_gc_journal(&["gc1", "gc2"]);
    let target = MemoryPersistence::new();
    target.set_gc_journal(&["old"]);

    let summary = migrator(&source, &target, options(false, false))
        .migrate()
        .await?;
    assert_eq!(2, summary.gc_journal_lines);
    assert_eq!(
        Some(vec!["gc1".to_owned(), "gc2".to_owned()]),
        target.gc_journal_lines()
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_missing_gc_journal_and_manifest() -> Result<(), Box<dyn Error>> {
    let source = MemoryPersistence::new();
    source.set_journal(&["rootA"]);
    let target = MemoryPersistence::new();
    target.set_manifest(manifest(&[("store", "1")]));

    let summary = migrator(&source, &target, options(false, false))
        .migrate()
        .await?;
    assert_eq!(0, summary.gc_journal_lines);
    assert!(!summary.manifest_copied);
    assert_eq!(None, target.gc_journal_lines());
    assert_eq!(Some(manifest(&[("store", "1")])), target.manifest());
    assert!(target.archive_names().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_manifest_replaced() -> Result<(), Box<dyn Error>> {
    let source = MemoryPersistence::new();
    source.set_manifest(manifest(&[("store", "2")]));
    let target = MemoryPersistence::new();
    target.set_manifest(manifest(&[("store", "1"), ("legacy", "true")]));

    let summary = migrator(&source, &target, options(false, false))
        .migrate()
        .await?;
    assert!(summary.manifest_copied);
    assert_eq!(Some(manifest(&[("store", "2")])), target.manifest());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_archives_copied() -> Result<(), Box<dyn Error>> {
    let source = MemoryPersistence::new();
    let with_blobs = archive(3)
        .with_binary_references(Bytes::from_static(b"references"))
        .with_graph(Bytes::from_static(b"graph"));
    let without_blobs = archive(2);
    source.add_archive("data00000a.tar", with_blobs.clone());
    source.add_archive("data00001a.tar", without_blobs.clone());
    let target = MemoryPersistence::new();

    let summary = migrator(&source, &target, options(false, false))
        .migrate()
        .await?;
    assert_eq!(
        MigrationSummary {
            archives_copied: 2,
            segments_copied: 5,
            ..Default::default()
        },
        summary
    );
    assert_eq!(Some(with_blobs), target.archive("data00000a.tar"));

    // Absent blobs stay absent.
    let copied = target.archive("data00001a.tar");
    assert_eq!(Some(without_blobs), copied);
    assert!(copied.is_some_and(|archive| archive.graph.is_none() && archive.binary_references.is_none()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_order_under_random_latency() -> Result<(), Box<dyn Error>> {
    let source = MemoryPersistence::new();
    let expected = archive(64);
    source.add_archive("data00000a.tar", expected.clone());
    source.set_read_delay(|_| Duration::from_millis(rand::thread_rng().gen_range(0..500)));
    let target = MemoryPersistence::new();

    let options = MigrationOptions {
        read_threads: 16,
        ..options(false, false)
    };
    let migrator = migrator(&source, &target, options);
    migrator.migrate().await?;
    migrator.close().await;
    assert_eq!(Some(expected), target.archive("data00000a.tar"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_append_mode_is_idempotent() -> Result<(), Box<dyn Error>> {
    let source = MemoryPersistence::new();
    source.set_journal(&["rootA", "rootB"]);
    source.set_gc_journal(&["gc1", "gc2"]);
    source.set_manifest(manifest(&[("store", "1")]));
    source.add_archive("data00000a.tar", archive(3));
    source.add_archive("data00001a.tar", archive(1).with_graph(Bytes::from_static(b"g")));
    let target = MemoryPersistence::new();

    let first = migrator(&source, &target, options(true, false))
        .migrate()
        .await?;
    assert_eq!(2, first.archives_copied);
    let journal = target.journal_lines();
    let gc_journal = target.gc_journal_lines();
    let archives = target.archive_names();
    let reads = source.segment_reads();

    let second = migrator(&source, &target, options(true, false))
        .migrate()
        .await?;
    assert_eq!(0, second.journal_lines);
    assert_eq!(0, second.gc_journal_lines);
    assert_eq!(0, second.archives_copied);
    assert_eq!(2, second.archives_skipped);
    assert_eq!(2, target.archives_created());
    assert_eq!(reads, source.segment_reads());
    assert_eq!(journal, target.journal_lines());
    assert_eq!(gc_journal, target.gc_journal_lines());
    assert_eq!(archives, target.archive_names());
    assert_eq!(Some(manifest(&[("store", "1")])), target.manifest());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_append_mode_extends_journals() -> Result<(), Box<dyn Error>> {
    let source = MemoryPersistence::new();
    source.set_journal(&["rootA", "rootB"]);
    source.set_gc_journal(&["gc1"]);
    let target = MemoryPersistence::new();
    migrator(&source, &target, options(true, false))
        .migrate()
        .await?;

    source.set_journal(&["rootA", "rootB", "rootC"]);
    source.set_gc_journal(&["gc1", "gc2"]);
    source.add_archive("data00000a.tar", archive(1));
    let summary = migrator(&source, &target, options(true, false))
        .migrate()
        .await?;
    assert_eq!(1, summary.journal_lines);
    assert_eq!(1, summary.gc_journal_lines);
    assert_eq!(1, summary.archives_copied);
    assert_eq!(
        Some(vec!["rootA".to_owned(), "rootB".to_owned(), "rootC".to_owned()]),
        target.journal_lines()
    );
    assert_eq!(
        Some(vec!["gc1".to_owned(), "gc2".to_owned()]),
        target.gc_journal_lines()
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_overwrite_without_append_mode() -> Result<(), Box<dyn Error>> {
    let source = MemoryPersistence::new();
    source.add_archive("data00000a.tar", archive(2));
    let target = MemoryPersistence::new();
    target.add_archive("data00000a.tar", archive(5));

    let summary = migrator(&source, &target, options(false, false))
        .migrate()
        .await?;
    assert_eq!(1, summary.archives_copied);
    assert_eq!(source.archive("data00000a.tar"), target.archive("data00000a.tar"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_recovered() -> Result<(), Box<dyn Error>> {
    let source = MemoryPersistence::new();
    let expected = archive(4);
    source.add_archive("data00000a.tar", expected.clone());
    source.fail_archive_opens(2);
    source.fail_segment_reads(2);
    let target = MemoryPersistence::new();

    migrator(&source, &target, options(false, false))
        .migrate()
        .await?;
    assert_eq!(Some(expected), target.archive("data00000a.tar"));
    assert_eq!(6, source.segment_reads());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_archive_is_closed() -> Result<(), Box<dyn Error>> {
    let source = MemoryPersistence::new();
    source.add_archive("data00000a.tar", archive(2));
    source.add_archive("data00001a.tar", archive(2));
    source.fail_segment_reads(usize::MAX);
    let target = MemoryPersistence::new();

    let migrator = migrator(&source, &target, options(false, false));
    let result = migrator.migrate().await;
    migrator.close().await;
    assert!(matches!(
        result,
        Err(MigrationError::Persistence(PersistenceError::Io(_)))
    ));
    // The writer of the failed archive is closed, the next archive is not attempted.
    assert_eq!(vec!["data00000a.tar"], target.archive_names());
    assert_eq!(1, target.archives_created());
    // The failed archive is left without segments.
    assert!(target
        .archive("data00000a.tar")
        .is_some_and(|archive| archive.segments.is_empty()));
    Ok(())
}
