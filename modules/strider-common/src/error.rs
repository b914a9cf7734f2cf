use thiserror::Error;

#[derive(Error, Debug)]
pub enum StriderError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage collision: {0} already exists")]
    StorageCollision(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
