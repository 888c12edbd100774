use std::path::Path;

use clap::{Args, Parser, Subcommand};
use config::Configuration;
use log::info;

#[derive(Debug, Parser, Clone)]
#[command(author, about, version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Args)]
pub struct MigrateArgs {
    /// Store to copy from: a local segment store directory, or
    /// `az:https://<account>.blob.core.windows.net/<container>/<directory>`.
    #[arg(long, env = "SEGMENT_TOOL_SOURCE")]
    source: Option<String>,

    /// Store to copy into, in the same forms as `source`.
    #[arg(long, env = "SEGMENT_TOOL_TARGET")]
    target: Option<String>,

    /// Keep the content of the target: journals are extended and archives the target already has are skipped.
    #[arg(long)]
    append: bool,

    /// Copy only the most recent journal entry.
    #[arg(long)]
    only_last_journal_entry: bool,

    /// Number of segments fetched concurrently.
    ///
    /// Default value: 20
    #[arg(long, env = "SEGMENT_TOOL_READ_THREADS")]
    read_threads: Option<usize>,

    /// Path to the configuration file in YAML format. Command line options take precedence over it.
    #[arg(long, env = "SEGMENT_TOOL_CONFIG")]
    config: Option<String>,

    /// Path to the log4rs configuration file in YAML format.
    ///
    /// Logs go to the console, filtered by `RUST_LOG`, if omitted.
    #[arg(long, env = "SEGMENT_TOOL_LOG_CONFIG")]
    log: Option<String>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Copy the journal, GC journal, manifest and segment archives of a store into another one.
    Migrate(MigrateArgs),
}

impl MigrateArgs {
    pub fn init_log(&self) -> anyhow::Result<()> {
        match self.log.as_deref() {
            Some(config) => {
                let config_path = Path::new(config);
                if !config_path.is_file() {
                    anyhow::bail!("Log configuration file {} does not exist", config);
                }
                log4rs::init_file(config_path, Default::default())?;
            }
            None => ulog::init_log()?,
        }
        info!("Log initialized");
        Ok(())
    }

    pub fn create_config(&self) -> anyhow::Result<Configuration> {
        let mut configuration = match self.config.as_deref() {
            Some(path) => Configuration::from_yaml(&std::fs::read_to_string(path)?)?,
            None => Configuration::default(),
        };

        if let Some(source) = &self.source {
            configuration.source = source.clone();
        }
        if let Some(target) = &self.target {
            configuration.target = target.clone();
        }
        if self.append {
            configuration.append_mode = true;
        }
        if self.only_last_journal_entry {
            configuration.only_last_journal_entry = true;
        }
        if let Some(read_threads) = self.read_threads {
            configuration.read_threads = read_threads;
        }

        configuration.check()?;
        Ok(configuration)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use clap::{CommandFactory, Parser};

    use super::{Cli, Commands};

    #[test]
    fn test_command() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_create_config() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("segment-tool.yaml");
        std::fs::write(
            &path,
            "source: /data/a\ntarget: /data/b\nread-threads: 4\nretry:\n  max-attempts: 3\n",
        )?;

        let cli = Cli::try_parse_from([
            "segment-tool",
            "migrate",
            "--config",
            &path.to_string_lossy(),
            "--target",
            "az:https://account.blob.core.windows.net/oak",
            "--append",
        ])?;
        let Commands::Migrate(args) = cli.command;
        let configuration = args.create_config()?;
        assert_eq!("/data/a", configuration.source);
        assert_eq!("az:https://account.blob.core.windows.net/oak", configuration.target);
        assert!(configuration.append_mode);
        assert!(!configuration.only_last_journal_entry);
        assert_eq!(4, configuration.read_threads);
        assert_eq!(3, configuration.retry.max_attempts);
        assert_eq!(5, configuration.retry.interval_secs);
        Ok(())
    }

    #[test]
    fn test_invalid_config() -> Result<(), Box<dyn Error>> {
        let cli = Cli::try_parse_from([
            "segment-tool",
            "migrate",
            "--source",
            "/data/a",
            "--target",
            "/data/a",
        ])?;
        let Commands::Migrate(args) = cli.command;
        assert!(args.create_config().is_err());
        Ok(())
    }
}
