//! Podsync Core Library
//!
//! Background conversion and transfer pipeline for portable media players:
//! - Classification of submitted tracks (pass-through, convert, reject)
//! - A bounded pool of conversion workers driving an external command
//! - A conversion cache with a size quota and single-flight pruning
//! - Per-device transfer queues with disk-full detection
//! - A periodic scheduling tick, driven by a tokio task or called directly
//!
//! The media library is reached through the [`MediaStore`] trait and file
//! types through [`FileClassifier`]; updates flow back as [`PipelineEvent`]s.
//!
//! # Error Handling
//!
//! Fallible operations return [`Result`] with the typed [`Error`] of the
//! [`error`] module. Workers never return errors across threads; their
//! failures are recorded on the job and reported through events.
//!
//! ```rust,ignore
//! use podsync_core::{ConversionManager, Error, Result, TrackRecord};
//!
//! fn add(manager: &ConversionManager, track: &TrackRecord) -> Result<()> {
//!     match manager.submit(track) {
//!         Err(Error::Conversion(e)) => tracing::warn!("{e}"),
//!         other => { other?; }
//!     }
//!     Ok(())
//! }
//! ```

pub mod classify;
pub mod command;
pub mod config;
mod convert;
pub mod convlog;
pub mod error;
pub mod events;
pub mod job;
pub mod logging;
pub mod manager;
pub mod quota;
pub mod scheduler;
pub mod store;
pub mod template;
pub mod track;
pub mod transfer;

pub use classify::{FileClassifier, FileType, TableClassifier};
pub use command::ConversionCommand;
pub use config::{
    DEFAULT_FILENAME_TEMPLATE, DEFAULT_LOG_MAX_LINES, DEFAULT_MAX_CACHE_SIZE,
    DEFAULT_TICK_INTERVAL_MS, FileTypeConfig, MAX_WORKERS_LIMIT, PipelineConfig,
    default_cache_directory,
};
pub use convlog::ConversionLog;
pub use error::{CacheError, ConversionError, Error, FileSystemError, Result, TransferError};
pub use events::{EventSink, PipelineEvent, TrackUpdate};
pub use job::{ConversionStatus, JobId, JobOutcome, JobState};
pub use logging::{LogRotation, LogSettings, LoggingError, LoggingGuard};
pub use manager::{ConversionManager, FailedTrack, Submission, TransferSummary};
pub use quota::{CacheQuota, PruneStats};
pub use scheduler::{SchedulerHandle, spawn_scheduler};
pub use store::{MediaStore, TrackRef};
pub use template::{FilenameTemplate, sanitize_filename};
pub use track::{DeviceId, GaplessData, TrackId, TrackRecord, TrackTags};
pub use transfer::{COPY_CHUNK_SIZE, TransferStatus, copy_file, file_checksum};
