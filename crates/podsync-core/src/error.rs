//! Error types for Podsync core operations.
//!
//! Errors are grouped by concern. Each group is its own `thiserror` enum and is
//! wrapped by a variant of the crate-wide [`Error`].

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while classifying or converting a track.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The classifier does not recognise the file.
    #[error("Unsupported file type: {path}")]
    UnsupportedFileType {
        /// File that could not be classified.
        path: PathBuf,
    },

    /// The original file is missing or not a regular file.
    #[error("Source file unavailable: {path}: {reason}")]
    SourceUnavailable {
        /// Original file.
        path: PathBuf,
        /// Why it could not be used.
        reason: String,
    },

    /// Conversion is mandatory for this type but no command is configured.
    #[error("Conversion required for '{file_type}' but no conversion command is configured")]
    ConversionRequired {
        /// File type name.
        file_type: String,
    },

    /// Running the command in extension query mode failed.
    #[error("Could not determine output extension with '{command}': {reason}")]
    ExtensionQueryFailed {
        /// Command line.
        command: String,
        /// Failure detail.
        reason: String,
    },

    /// The conversion command could not be started.
    #[error("Failed to start '{command}': {reason}")]
    SpawnFailed {
        /// Command line.
        command: String,
        /// Failure detail.
        reason: String,
    },

    /// The command exited with a non-zero status.
    #[error("Conversion of '{path}' failed: '{command}' returned exit status {code}")]
    ExitStatus {
        /// Source file.
        path: PathBuf,
        /// Command line.
        command: String,
        /// Exit code.
        code: i32,
    },

    /// The command was terminated by a signal.
    #[error("Conversion of '{path}' failed: '{command}' was terminated")]
    Terminated {
        /// Source file.
        path: PathBuf,
        /// Command line.
        command: String,
    },

    /// The command ran longer than the configured timeout.
    #[error("Conversion of '{path}' timed out after {secs}s")]
    TimedOut {
        /// Source file.
        path: PathBuf,
        /// Timeout that elapsed.
        secs: u64,
    },

    /// The command reported success but its output cannot be read.
    #[error("Converted file '{path}' is missing: {reason}")]
    OutputMissing {
        /// Expected output file.
        path: PathBuf,
        /// Failure detail.
        reason: String,
    },
}

/// Errors raised while copying a file onto a device.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The destination filesystem has no space left.
    #[error("Device is full while copying to {path}")]
    DiskFull {
        /// Destination file.
        path: PathBuf,
    },

    /// Generic copy failure.
    #[error("Copying '{source_path}' to '{destination}' failed: {reason}")]
    CopyFailed {
        /// Source file.
        source_path: PathBuf,
        /// Destination file.
        destination: PathBuf,
        /// Failure detail.
        reason: String,
    },

    /// The store could not provide a destination on the device.
    #[error("No destination available on device {device}: {reason}")]
    DestinationUnavailable {
        /// Device identifier.
        device: String,
        /// Failure detail.
        reason: String,
    },

    /// Source file to copy does not exist.
    #[error("Source file not found: {path}")]
    SourceNotFound {
        /// Missing source file.
        path: PathBuf,
    },

    /// Post-copy checksum comparison failed.
    #[error("Integrity check failed for {file}: expected {expected}, got {actual}")]
    IntegrityCheckFailed {
        /// Destination file.
        file: PathBuf,
        /// Checksum of the source.
        expected: String,
        /// Checksum of the copy.
        actual: String,
    },
}

/// Errors related to the conversion cache directory.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache directory could not be created or accessed.
    #[error("Failed to initialize conversion cache at {path}: {reason}")]
    InitializationFailed {
        /// Cache directory.
        path: PathBuf,
        /// Failure detail.
        reason: String,
    },

    /// The cache is disabled because its directory is not usable.
    #[error("Conversion cache is unavailable")]
    Unavailable,

    /// Walking the cache directory failed.
    #[error("Failed to measure conversion cache: {reason}")]
    MeasurementFailed {
        /// Failure detail.
        reason: String,
    },
}

/// Filesystem operation failures with the path involved.
#[derive(Debug, Error)]
pub enum FileSystemError {
    /// Reading a file failed.
    #[error("Failed to read {path}: {reason}")]
    ReadFailed {
        /// Path involved.
        path: PathBuf,
        /// Failure detail.
        reason: String,
    },

    /// Writing a file failed.
    #[error("Failed to write {path}: {reason}")]
    WriteFailed {
        /// Path involved.
        path: PathBuf,
        /// Failure detail.
        reason: String,
    },

    /// Deleting a file failed.
    #[error("Failed to delete {path}: {reason}")]
    DeleteFailed {
        /// Path involved.
        path: PathBuf,
        /// Failure detail.
        reason: String,
    },

    /// Creating a directory failed.
    #[error("Failed to create directory {path}: {reason}")]
    CreateDirFailed {
        /// Path involved.
        path: PathBuf,
        /// Failure detail.
        reason: String,
    },
}

/// Errors that can occur in Podsync core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Conversion stage error.
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// Transfer stage error.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Conversion cache error.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Filesystem error.
    #[error(transparent)]
    FileSystem(#[from] FileSystemError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error is the disk-full transfer classification.
    #[must_use]
    pub const fn is_disk_full(&self) -> bool {
        matches!(self, Self::Transfer(TransferError::DiskFull { .. }))
    }
}

/// Whether an IO error means the destination filesystem ran out of space.
///
/// Relies on the platform mapping (ENOSPC, `ERROR_DISK_FULL`) into
/// [`std::io::ErrorKind::StorageFull`].
#[must_use]
pub fn is_storage_full(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::StorageFull
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Configuration("bad value".to_string());
        assert_eq!(err.to_string(), "Configuration error: bad value");
    }

    #[test]
    fn test_conversion_error_display() {
        let err = Error::from(ConversionError::ExitStatus {
            path: PathBuf::from("/music/a.flac"),
            command: "flac2mp3".to_string(),
            code: 2,
        });
        assert_eq!(
            err.to_string(),
            "Conversion of '/music/a.flac' failed: 'flac2mp3' returned exit status 2"
        );
    }

    #[test]
    fn test_disk_full_classification() {
        let full = Error::from(TransferError::DiskFull {
            path: PathBuf::from("/mnt/ipod/x.mp3"),
        });
        assert!(full.is_disk_full());

        let generic = Error::from(TransferError::SourceNotFound {
            path: PathBuf::from("/missing"),
        });
        assert!(!generic.is_disk_full());
    }

    #[test]
    fn test_storage_full_detection() {
        let full = std::io::Error::new(std::io::ErrorKind::StorageFull, "no space");
        assert!(is_storage_full(&full));
        let other = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(!is_storage_full(&other));
    }

    #[cfg(unix)]
    #[test]
    fn test_enospc_is_storage_full() {
        assert!(is_storage_full(&std::io::Error::from_raw_os_error(28)));
    }

    #[cfg(windows)]
    #[test]
    fn test_windows_error_28_is_not_storage_full() {
        // ERROR_OUT_OF_PAPER shares the number with ENOSPC.
        assert!(!is_storage_full(&std::io::Error::from_raw_os_error(28)));
        // ERROR_DISK_FULL
        assert!(is_storage_full(&std::io::Error::from_raw_os_error(112)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
