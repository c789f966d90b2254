//! Error types for the blob cache

use std::fmt;
use std::io;

/// A snapshot file that cannot be trusted.
///
/// Any of these discards the whole snapshot; the cache then starts cold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// Fewer bytes than the smallest valid snapshot
    TooShort(usize),
    /// Trailing checksum does not match the content
    ChecksumMismatch,
    /// Magic value not produced by any known version
    UnknownMagic(u32),
    /// A record runs past the end of the checksummed region
    Truncated { offset: usize },
    /// Bytes left over after the last declared record
    TrailingBytes { offset: usize },
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::TooShort(len) => write!(f, "snapshot too short: {} bytes", len),
            SnapshotError::ChecksumMismatch => write!(f, "snapshot checksum mismatch"),
            SnapshotError::UnknownMagic(magic) => write!(f, "unknown snapshot magic {:#010x}", magic),
            SnapshotError::Truncated { offset } => {
                write!(f, "snapshot truncated at offset {}", offset)
            }
            SnapshotError::TrailingBytes { offset } => {
                write!(f, "unexpected data after last record at offset {}", offset)
            }
        }
    }
}

impl std::error::Error for SnapshotError {}

#[derive(Debug)]
pub enum BlobCacheError {
    Io(Box<io::Error>),
    Snapshot(SnapshotError),
}

impl fmt::Display for BlobCacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobCacheError::Io(err) => write!(f, "IO error: {}", err),
            BlobCacheError::Snapshot(err) => write!(f, "Corrupt snapshot: {}", err),
        }
    }
}

impl std::error::Error for BlobCacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BlobCacheError::Io(err) => Some(err.as_ref()),
            BlobCacheError::Snapshot(err) => Some(err),
        }
    }
}

impl From<io::Error> for BlobCacheError {
    fn from(err: io::Error) -> Self {
        BlobCacheError::Io(Box::new(err))
    }
}

impl From<SnapshotError> for BlobCacheError {
    fn from(err: SnapshotError) -> Self {
        BlobCacheError::Snapshot(err)
    }
}

pub type Result<T> = std::result::Result<T, BlobCacheError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_snapshot_error_display() {
        assert_eq!(
            format!("{}", SnapshotError::UnknownMagic(0xdeadbeef)),
            "unknown snapshot magic 0xdeadbeef"
        );
        assert_eq!(
            format!("{}", SnapshotError::Truncated { offset: 17 }),
            "snapshot truncated at offset 17"
        );
    }

    #[test]
    fn test_io_error_has_source() {
        let err = BlobCacheError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(format!("{}", err).contains("gone"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_snapshot_error_converts() {
        let err: BlobCacheError = SnapshotError::ChecksumMismatch.into();
        assert_eq!(format!("{}", err), "Corrupt snapshot: snapshot checksum mismatch");
    }
}
