//! Error types for the Persistit storage engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PersistitError>;

#[derive(Error, Debug)]
pub enum PersistitError {
    #[error("volume already exists: {0}")]
    VolumeAlreadyExists(String),

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("volume closed: {0}")]
    VolumeClosed(String),

    #[error("volume full: {0}")]
    VolumeFull(String),

    #[error("read-only volume: {0}")]
    ReadOnlyVolume(String),

    #[error("invalid page address {address} in volume {volume}")]
    InvalidPageAddress { volume: String, address: u64 },

    #[error("corrupt volume: {0}")]
    CorruptVolume(String),

    #[error("resource in use: {0}")]
    InUse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("conversion error: {0}")]
    Conversion(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("illegal argument: {0}")]
    IllegalArgument(String),
}

impl From<bincode::Error> for PersistitError {
    fn from(err: bincode::Error) -> Self {
        PersistitError::CorruptVolume(err.to_string())
    }
}
