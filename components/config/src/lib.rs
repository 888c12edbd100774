use std::time::Duration;

use error::ConfigurationError;
use serde::{Deserialize, Serialize};

pub mod error;
pub mod location;

pub use crate::location::{StoreLocation, StoreType};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Retry {
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    #[serde(rename = "interval-secs")]
    pub interval_secs: u64,
}

impl Retry {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Location of the store to copy from. See [`StoreLocation::parse`] for the accepted forms.
    pub source: String,

    /// Location of the store to copy into.
    pub target: String,

    /// Keep existing target journals and skip archives the target already has.
    #[serde(rename = "append-mode")]
    pub append_mode: bool,

    /// Copy only the current head of the journal instead of its full history.
    #[serde(rename = "only-last-journal-entry")]
    pub only_last_journal_entry: bool,

    /// Number of segments fetched concurrently while copying an archive.
    #[serde(rename = "read-threads")]
    pub read_threads: usize,

    /// Size of the chunks used to scan journals backward.
    #[serde(rename = "journal-buffer-size")]
    pub journal_buffer_size: usize,

    pub retry: Retry,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            source: String::new(),
            target: String::new(),
            append_mode: false,
            only_last_journal_entry: false,
            read_threads: 20,
            journal_buffer_size: 16 * 1024,
            retry: Retry::default(),
        }
    }
}

impl Configuration {
    pub fn from_yaml(content: &str) -> Result<Self, ConfigurationError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn source_location(&self) -> Result<StoreLocation, ConfigurationError> {
        if self.source.trim().is_empty() {
            return Err(ConfigurationError::MissingLocation("source"));
        }
        StoreLocation::parse(&self.source)
    }

    pub fn target_location(&self) -> Result<StoreLocation, ConfigurationError> {
        if self.target.trim().is_empty() {
            return Err(ConfigurationError::MissingLocation("target"));
        }
        StoreLocation::parse(&self.target)
    }

    /// Check the configuration, returning the parsed source and target locations.
    pub fn check(&self) -> Result<(StoreLocation, StoreLocation), ConfigurationError> {
        let source = self.source_location()?;
        let target = self.target_location()?;
        if source == target {
            return Err(ConfigurationError::SameLocation(source.description()));
        }

        if self.read_threads == 0 {
            return Err(ConfigurationError::NotPositive("read-threads"));
        }

        if self.journal_buffer_size == 0 {
            return Err(ConfigurationError::NotPositive("journal-buffer-size"));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigurationError::NotPositive("retry.max-attempts"));
        }
        Ok((source, target))
    }
}

#[cfg(test)]
mod tests {
    use super::Configuration;
    use crate::error::ConfigurationError;
    use crate::StoreType;
    use std::{error::Error, fs::File, io::Read, path::Path, time::Duration};

    #[test]
    fn test_yaml() -> Result<(), Box<dyn Error>> {
        let manifest_dir = std::env::var("CARGO_MANIFEST_DIR")?;
        let path = Path::new(&manifest_dir);
        let path = path
            .parent()
            .unwrap()
            .parent()
            .unwrap()
            .join("etc/segment-tool.yaml");
        let mut file = File::open(path.as_path())?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let config = Configuration::from_yaml(&content)?;
        assert!(!config.append_mode);
        assert!(!config.only_last_journal_entry);
        assert_eq!(20, config.read_threads);
        assert_eq!(16384, config.journal_buffer_size);
        assert_eq!(16, config.retry.max_attempts);
        assert_eq!(Duration::from_secs(5), config.retry.interval());

        let (source, target) = config.check()?;
        assert_eq!(StoreType::Local, source.store_type());
        assert_eq!(StoreType::Azure, target.store_type());
        Ok(())
    }

    #[test]
    fn test_defaults_when_omitted() -> Result<(), ConfigurationError> {
        let config = Configuration::from_yaml("source: /a\ntarget: /b\nappend-mode: true\n")?;
        assert!(config.append_mode);
        assert_eq!(20, config.read_threads);
        assert_eq!(16384, config.journal_buffer_size);
        assert_eq!(16, config.retry.max_attempts);
        assert_eq!(5, config.retry.interval_secs);
        config.check()?;
        Ok(())
    }

    #[test]
    fn test_check() {
        let mut config = Configuration::default();
        assert!(matches!(
            config.check(),
            Err(ConfigurationError::MissingLocation("source"))
        ));

        config.source = "/data/a".to_owned();
        assert!(matches!(
            config.check(),
            Err(ConfigurationError::MissingLocation("target"))
        ));

        config.target = "/data/a".to_owned();
        assert!(matches!(
            config.check(),
            Err(ConfigurationError::SameLocation(_))
        ));

        config.target = "/data/b".to_owned();
        assert!(config.check().is_ok());

        config.read_threads = 0;
        assert!(matches!(
            config.check(),
            Err(ConfigurationError::NotPositive("read-threads"))
        ));

        config.read_threads = 1;
        config.retry.max_attempts = 0;
        assert!(matches!(
            config.check(),
            Err(ConfigurationError::NotPositive("retry.max-attempts"))
        ));
    }
}
