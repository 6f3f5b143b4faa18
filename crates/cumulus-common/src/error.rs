//! Error types for Cumulus
//!
//! Every failure that crosses a crate boundary is an [`Error`] carrying a
//! stable machine-readable code (see [`Error::code`]) plus free-text detail.

use crate::types::{BlockId, DiskId, FileId, VolumeId};
use thiserror::Error;

/// Common result type for Cumulus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Cumulus
#[derive(Debug, Error)]
pub enum Error {
    // Mirroring errors
    #[error("cannot upload block {block_id} to at least one of the mirrors: {detail}")]
    MirrorWriteFailure { block_id: BlockId, detail: String },

    #[error("cannot remove block {block_id} from at least one of the mirrors: {detail}")]
    MirrorRemoveFailure { block_id: BlockId, detail: String },

    #[error("block {block_id} is corrupted on both mirrors")]
    MirrorReadUnrecoverable { block_id: BlockId },

    #[error("cannot download block {block_id} from both mirrors: {detail}")]
    MirrorReadFailure { block_id: BlockId, detail: String },

    #[error("backup disk {disk_id} already has two mirrors assigned")]
    CompositionOverflow { disk_id: DiskId },

    #[error("operation not supported: {0}")]
    UnsupportedOperation(String),

    // Instance cache errors
    #[error("instance {0} is not enqueued")]
    NotEnqueued(String),

    #[error("volume not found: {0}")]
    VolumeNotFound(VolumeId),

    #[error("volume is not ready: {0}")]
    VolumeNotReady(VolumeId),

    #[error("volume is being used: {0}")]
    VolumeBusy(VolumeId),

    #[error("disk not found: {0}")]
    DiskNotFound(DiskId),

    #[error("disk is being used: {0}")]
    DiskBusy(DiskId),

    // Placement errors
    #[error("no disk can hold a block of {required} bytes")]
    NoDiskAvailable { required: u64 },

    // File system errors
    #[error("file not found: {0}")]
    FileNotFound(FileId),

    #[error("block not found: {0}")]
    BlockNotFound(BlockId),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("encryption error: {0}")]
    Encryption(String),

    // Backend errors
    #[error("remote operation failed: {0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Persistence errors
    #[error("repository error: {0}")]
    Repository(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::UnsupportedOperation(operation.into())
    }

    /// Create a remote (provider) failure
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    /// Create a repository error
    pub fn repository(msg: impl Into<String>) -> Self {
        Self::Repository(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::VolumeNotFound(_)
                | Self::DiskNotFound(_)
                | Self::FileNotFound(_)
                | Self::BlockNotFound(_)
                | Self::NotEnqueued(_)
        )
    }

    /// Check if the error reports a resource that is temporarily in use
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::DiskBusy(_) | Self::VolumeBusy(_))
    }

    /// Machine-readable completion code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Remote(_) => "REM-000",
            Self::MirrorWriteFailure { .. } => "REM-001",
            Self::MirrorReadUnrecoverable { .. } => "REM-002",
            Self::MirrorReadFailure { .. } => "REM-003",
            Self::MirrorRemoveFailure { .. } => "REM-004",
            Self::CompositionOverflow { .. } => "DSK-010",
            Self::UnsupportedOperation(_) => "DSK-011",
            Self::VolumeNotFound(_) => "TRN-001",
            Self::DiskNotFound(_) => "TRN-002",
            Self::DiskBusy(_) => "TRN-003",
            Self::NotEnqueued(_) => "TRN-004",
            Self::VolumeNotReady(_) => "TRN-005",
            Self::VolumeBusy(_) => "TRN-006",
            Self::NoDiskAvailable { .. } => "PRT-001",
            Self::Io(_) => "FS-000",
            Self::BlockNotFound(_) => "FS-001",
            Self::FileNotFound(_) => "FS-003",
            Self::ChecksumMismatch { .. } => "FS-010",
            Self::Encryption(_) => "ENC-001",
            Self::Repository(_) => "DB-001",
            Self::Serialization(_) => "DB-002",
            Self::InvalidArgument(_) => "VAL-000",
            Self::Configuration(_) => "CFG-000",
            Self::Internal(_) => "INT-000",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        assert!(Error::VolumeNotFound(VolumeId::new()).is_not_found());
        assert!(Error::NotEnqueued("x".into()).is_not_found());
        assert!(!Error::internal("boom").is_not_found());
    }

    #[test]
    fn test_error_codes() {
        let block_id = BlockId::new();
        assert_eq!(
            Error::MirrorWriteFailure {
                block_id,
                detail: String::new()
            }
            .code(),
            "REM-001"
        );
        assert_eq!(Error::MirrorReadUnrecoverable { block_id }.code(), "REM-002");
        assert_eq!(Error::NotEnqueued("x".into()).code(), "TRN-004");
        assert_eq!(
            Error::CompositionOverflow {
                disk_id: DiskId::new()
            }
            .code(),
            "DSK-010"
        );
        assert_eq!(Error::unsupported("name").code(), "DSK-011");
    }

    #[test]
    fn test_error_busy() {
        assert!(Error::DiskBusy(DiskId::new()).is_busy());
        assert!(!Error::DiskNotFound(DiskId::new()).is_busy());
    }
}
