//! Track and device identities as seen by the pipeline.
//!
//! The media library owns the real track records. The pipeline only keeps a
//! [`TrackRecord`] snapshot taken at submit time.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identifier of a track record in the external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track#{}", self.0)
    }
}

/// Identifier of a device library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

/// Tag values used for templated output names and conversion arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackTags {
    /// Artist.
    pub artist: Option<String>,
    /// Album.
    pub album: Option<String>,
    /// Title.
    pub title: Option<String>,
    /// Composer.
    pub composer: Option<String>,
    /// Genre.
    pub genre: Option<String>,
    /// Comment.
    pub comment: Option<String>,
    /// Track number on the disc (0 = unknown).
    pub track_nr: u32,
    /// Number of tracks on the disc (0 = unknown).
    pub tracks: u32,
    /// Disc number (0 = unknown).
    pub cd_nr: u32,
    /// Release year (0 = unknown).
    pub year: u32,
}

/// Gapless playback facts read from a converted file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GaplessData {
    /// Encoder delay in samples.
    pub pregap: u32,
    /// Padding at the end in samples.
    pub postgap: u32,
    /// Number of audio samples.
    pub samplecount: u64,
    /// Byte offset of the last frame.
    pub gapless_data: u32,
    /// Whether the track is part of a gapless album.
    pub gapless_track_flag: bool,
}

/// Snapshot of a track handed to [`crate::ConversionManager::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRecord {
    /// Track identity.
    pub id: TrackId,
    /// Owning device library.
    pub device: DeviceId,
    /// The library lives on the local machine; nothing needs copying.
    pub local: bool,
    /// The track has already been copied to the device.
    pub transferred: bool,
    /// Original media file on the local machine.
    pub source: Option<PathBuf>,
    /// Previously converted file, if any.
    pub converted_file: Option<PathBuf>,
    /// Tag values.
    pub tags: TrackTags,
}

impl TrackRecord {
    /// Create a record for a track that still needs to reach `device`.
    #[must_use]
    pub fn new(id: u64, device: u64, source: impl Into<PathBuf>) -> Self {
        Self {
            id: TrackId(id),
            device: DeviceId(device),
            local: false,
            transferred: false,
            source: Some(source.into()),
            converted_file: None,
            tags: TrackTags::default(),
        }
    }

    /// Set the tags.
    #[must_use]
    pub fn with_tags(mut self, tags: TrackTags) -> Self {
        self.tags = tags;
        self
    }

    /// Set a previously converted file.
    #[must_use]
    pub fn with_converted_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.converted_file = Some(path.into());
        self
    }

    /// Display name used in log messages.
    #[must_use]
    pub fn display_name(&self) -> String {
        let artist = self.tags.artist.as_deref().unwrap_or_default();
        let title = self.tags.title.as_deref().unwrap_or_default();
        match (artist.is_empty(), title.is_empty()) {
            (false, false) => format!("{artist} - {title}"),
            (true, false) => title.to_string(),
            _ => self
                .source
                .as_ref()
                .and_then(|p| p.file_name())
                .map_or_else(|| self.id.to_string(), |n| n.to_string_lossy().into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_prefers_tags() {
        let record = TrackRecord::new(1, 1, "/music/song.flac").with_tags(TrackTags {
            artist: Some("Nina".to_string()),
            title: Some("Sinnerman".to_string()),
            ..TrackTags::default()
        });
        assert_eq!(record.display_name(), "Nina - Sinnerman");
    }

    #[test]
    fn test_display_name_falls_back_to_file_name() {
        let record = TrackRecord::new(7, 1, "/music/song.flac");
        assert_eq!(record.display_name(), "song.flac");

        let mut no_source = TrackRecord::new(7, 1, "/x");
        no_source.source = None;
        assert_eq!(no_source.display_name(), "track#7");
    }
}
