pub mod cli;

use std::env;

use anyhow::Context;
use config::{Configuration, StoreLocation};
use log::info;
use migration::{MigrationError, MigrationOptions, MigrationSummary, SegmentStoreMigrator};
use persistence::cloud::CloudPersistence;
use persistence::local::LocalPersistence;
use persistence::{ArchiveManager, Persistence};

pub use crate::cli::Cli;

/// Environment variable holding the shared key of the Azure storage account.
pub const AZURE_SECRET_KEY: &str = "AZURE_SECRET_KEY";

enum Store {
    Local(LocalPersistence),
    Cloud(CloudPersistence),
}

fn open_store(location: &StoreLocation, configuration: &Configuration) -> anyhow::Result<Store> {
    let store = match location {
        StoreLocation::Local { path } => Store::Local(
            LocalPersistence::new(path).with_journal_buffer_size(configuration.journal_buffer_size),
        ),
        StoreLocation::Azure { .. } => {
            let key = env::var(AZURE_SECRET_KEY)
                .with_context(|| format!("{AZURE_SECRET_KEY} is required to access {location}"))?;
            Store::Cloud(
                CloudPersistence::from_location(location, &key)?
                    .with_journal_buffer_size(configuration.journal_buffer_size),
            )
        }
    };
    Ok(store)
}

/// Migrate the source store of `configuration` into its target store.
pub async fn migrate(
    configuration: &Configuration,
    options: MigrationOptions,
) -> anyhow::Result<MigrationSummary> {
    let (source, target) = configuration.check()?;
    let source_name = source.description();
    let target_name = target.description();
    info!(
        "Source: {}, target: {}, append mode: {}, only last journal entry: {}",
        source_name, target_name, options.append_mode, options.only_last_journal_entry
    );

    let summary = match (
        open_store(&source, configuration)?,
        open_store(&target, configuration)?,
    ) {
        (Store::Local(source), Store::Local(target)) => {
            run(source, source_name, target, target_name, options).await
        }
        (Store::Local(source), Store::Cloud(target)) => {
            run(source, source_name, target, target_name, options).await
        }
        (Store::Cloud(source), Store::Local(target)) => {
            run(source, source_name, target, target_name, options).await
        }
        (Store::Cloud(source), Store::Cloud(target)) => {
            run(source, source_name, target, target_name, options).await
        }
    }?;
    Ok(summary)
}

async fn run<S, T>(
    source: S,
    source_name: String,
    target: T,
    target_name: String,
    options: MigrationOptions,
) -> Result<MigrationSummary, MigrationError>
where
    S: Persistence,
    T: Persistence,
    <S::ArchiveManager as ArchiveManager>::Reader: 'static,
{
    let migrator = SegmentStoreMigrator::new(source, source_name, target, target_name, options);
    let result = migrator.migrate().await;
    migrator.close().await;
    result
}
