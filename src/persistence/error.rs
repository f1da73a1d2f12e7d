use std::fmt;

/// Failure reading or writing durable state
#[derive(Debug)]
pub enum PersistenceError {
    /// The fjall keyspace rejected an operation
    Storage(fjall::Error),
    Encode(bincode::error::EncodeError),
    Decode(bincode::error::DecodeError),
    /// Stored bytes decoded but do not describe a valid record
    Corrupt(String),
    /// Background writer is no longer running
    WriterClosed,
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage: {}", e),
            Self::Encode(e) => write!(f, "encoding record: {}", e),
            Self::Decode(e) => write!(f, "decoding record: {}", e),
            Self::Corrupt(what) => write!(f, "corrupt record: {}", what),
            Self::WriterClosed => f.write_str("persistence writer closed"),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Corrupt(_) | Self::WriterClosed => None,
        }
    }
}

impl From<fjall::Error> for PersistenceError {
    fn from(e: fjall::Error) -> Self {
        Self::Storage(e)
    }
}

impl From<bincode::error::EncodeError> for PersistenceError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Encode(e)
    }
}

impl From<bincode::error::DecodeError> for PersistenceError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Decode(e)
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
