//! Error types for setu-gw

use crate::mac::TxStatus;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// setu-gw error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Device not present in the association table
    #[error("Device not found")]
    DeviceNotFound,

    /// Request made before the coordinator reached the started state
    #[error("Invalid state: coordinator not started")]
    InvalidState,

    /// OAD image file could not be opened or parsed
    #[error("Invalid firmware file: {0}")]
    InvalidFile(String),

    /// No registered firmware file carries this id
    #[error("Invalid firmware file id: {0}")]
    InvalidFileId(u32),

    /// MAC data request was rejected by the co-processor
    #[error("Send failure: {0:?}")]
    SendFailure(TxStatus),

    /// Gateway connection transport failed
    #[error("Transport dead")]
    TransportDead,

    /// Malformed frame on the wire
    #[error("Frame error: {0}")]
    Frame(String),

    /// Configuration file problem
    #[error("Config error: {0}")]
    Config(String),

    /// Persistent store problem
    #[error("NV store error: {0}")]
    Nv(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
