//! Interface to the external media library.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::track::{DeviceId, TrackId};

/// Another record that shares the same underlying content as a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackRef {
    /// Track identity.
    pub id: TrackId,
    /// Library holding the record.
    pub device: DeviceId,
}

/// Queries and primitives the pipeline needs from the media library.
///
/// Notifications flow the other way through [`crate::events::PipelineEvent`].
#[cfg_attr(test, mockall::automock)]
pub trait MediaStore: Send + Sync {
    /// Records sharing the content of `track`, including `track` itself.
    fn same_tracks(&self, track: TrackId) -> Vec<TrackRef>;

    /// Pick the path a file should be copied to on `device`.
    fn destination_path(&self, device: DeviceId, source: &Path) -> Result<PathBuf>;

    /// Record a finished copy in the device library.
    fn finalize_copy(&self, track: TrackId, destination: &Path) -> Result<()>;
}
