//! Client-side error taxonomy.

use thiserror::Error;

use rftp_core::wire::FileStatus;
use rftp_transport::CarrierError;

/// Why a single file transfer did not produce valid content
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Server reported the file does not exist
    #[error("file does not exist on the server")]
    NotExistent,

    /// Server reported the file is empty
    #[error("file is empty")]
    Empty,

    /// Server refused to read the file
    #[error("access denied by the server")]
    AccessDenied,

    /// All chunks arrived but the digest disagrees with the metadata
    #[error("checksum mismatch on received file")]
    ChecksumMismatch,

    /// Transfer was cancelled before completion
    #[error("transfer aborted")]
    Aborted,

    /// The local sink rejected a write
    #[error("sink write failed: {0}")]
    Sink(String),
}

impl TransferError {
    /// Map a non-OK metadata status to the matching error. Returns `None`
    /// for [`FileStatus::Ok`].
    #[must_use]
    pub fn from_status(status: FileStatus) -> Option<Self> {
        match status {
            FileStatus::Ok => None,
            FileStatus::NotExistent => Some(Self::NotExistent),
            FileStatus::Empty => Some(Self::Empty),
            FileStatus::AccessDenied => Some(Self::AccessDenied),
        }
    }
}

/// Why a whole request failed
#[derive(Debug, Error)]
pub enum ClientError {
    /// More files than a request can index
    #[error("too many files in request: {0}, use at most 65536")]
    TooManyFiles(usize),

    /// Server never answered the initial request
    #[error("no response from server after {0} attempts")]
    Timeout(u32),

    /// Transport failure
    #[error(transparent)]
    Carrier(#[from] CarrierError),
}
