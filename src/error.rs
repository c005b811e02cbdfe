use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A row or UD payload was shorter than declared or did not match the
    /// catalog's column types.
    #[error("Failed to decode {0}: {1}")]
    Decode(&'static str, String),

    #[error("Failed to encode {0}: {1}")]
    Encode(&'static str, String),

    #[error("Corrupted {0}: {1}")]
    Corrupted(&'static str, String),

    #[error("Checksum mismatch in {0}")]
    ChecksumMismatch(String),

    #[error("Table not found: {0}")]
    NotFound(String),

    #[error("Catalog mismatch for table {0}: {1}")]
    CatalogMismatch(String, String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Timed out waiting for commit time {0}")]
    Timeout(i64),

    /// A checkpoint could not be written or reloaded; the table refuses
    /// further commands until restart.
    #[error("Table {0} is unavailable: {1}")]
    Unavailable(String, String),

    #[error("Warehouse error: {0}")]
    Warehouse(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Lock error: {0}")]
    LockError(io::Error),
}

impl Error {
    pub(crate) fn decode(what: &'static str, msg: impl Into<String>) -> Self {
        Error::Decode(what, msg.into())
    }

    /// Transport-level failures close the connection; everything else is
    /// answered with `ERR`.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Protocol(_))
    }
}
