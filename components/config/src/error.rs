use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("`{0}` store location is required")]
    MissingLocation(&'static str),

    #[error("Source and target refer to the same store `{0}`")]
    SameLocation(String),

    #[error("Store location `{0}` is invalid: {1}")]
    InvalidLocation(String, &'static str),

    #[error("`{0}` must be positive")]
    NotPositive(&'static str),

    #[error("An IO error raised")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration")]
    Yaml(#[from] serde_yaml::Error),
}
