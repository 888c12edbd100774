use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};

use crate::error::ConfigurationError;

/// Prefix marking a location string as an Azure blob storage URI.
pub const AZ_PREFIX: &str = "az:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Local,
    Azure,
}

impl StoreType {
    pub fn name(&self) -> &'static str {
        match self {
            StoreType::Local => "Local Segment Store",
            StoreType::Azure => "Azure Segment Store",
        }
    }

    /// Human readable description in the form of `<type>@<location>`.
    pub fn description(&self, location: &str) -> String {
        let location = location.strip_prefix(AZ_PREFIX).unwrap_or(location);
        format!("{}@{}", self.name(), location)
    }
}

/// Where a segment store lives: a local directory or a container of an Azure storage account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Local {
        path: PathBuf,
    },

    Azure {
        /// Blob service endpoint, e.g. `https://account.blob.core.windows.net`
        endpoint: String,
        account: String,
        container: String,
        /// Directory inside the container, without leading or trailing slashes. May be empty.
        prefix: String,
    },
}

impl StoreLocation {
    /// Parse a location string.
    ///
    /// Strings starting with `az:` are treated as `az:https://<account>.blob.core.windows.net/<container>/<prefix>`,
    /// anything else is a local directory path.
    pub fn parse(location: &str) -> Result<Self, ConfigurationError> {
        let location = location.trim();
        if location.is_empty() {
            return Err(ConfigurationError::InvalidLocation(
                location.to_owned(),
                "location is empty",
            ));
        }

        let uri = match location.strip_prefix(AZ_PREFIX) {
            Some(uri) => uri,
            None => {
                return Ok(StoreLocation::Local {
                    path: PathBuf::from(location),
                })
            }
        };

        let invalid = |reason| ConfigurationError::InvalidLocation(location.to_owned(), reason);
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| invalid("scheme is missing"))?;
        if scheme != "https" && scheme != "http" {
            return Err(invalid("scheme must be http or https"));
        }
        let (host, path) = rest
            .split_once('/')
            .ok_or_else(|| invalid("container is missing"))?;
        let account = host
            .split('.')
            .next()
            .filter(|account| !account.is_empty())
            .ok_or_else(|| invalid("account is missing"))?;
        let path = path.trim_matches('/');
        let (container, prefix) = match path.split_once('/') {
            Some((container, prefix)) => (container, prefix.trim_matches('/')),
            None => (path, ""),
        };
        if container.is_empty() {
            return Err(invalid("container is missing"));
        }

        Ok(StoreLocation::Azure {
            endpoint: format!("{}://{}", scheme, host),
            account: account.to_owned(),
            container: container.to_owned(),
            prefix: prefix.to_owned(),
        })
    }

    pub fn store_type(&self) -> StoreType {
        match self {
            StoreLocation::Local { .. } => StoreType::Local,
            StoreLocation::Azure { .. } => StoreType::Azure,
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            StoreLocation::Local { path } => Some(path.as_path()),
            StoreLocation::Azure { .. } => None,
        }
    }

    pub fn description(&self) -> String {
        match self {
            StoreLocation::Local { path } => {
                self.store_type().description(&path.to_string_lossy())
            }
            StoreLocation::Azure {
                container, prefix, ..
            } => {
                let location = if prefix.is_empty() {
                    container.clone()
                } else {
                    format!("{}/{}", container, prefix)
                };
                self.store_type().description(&location)
            }
        }
    }
}

impl Display for StoreLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}
