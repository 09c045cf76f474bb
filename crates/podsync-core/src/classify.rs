//! File type classification.
//!
//! The pipeline asks a [`FileClassifier`] what a file is and whether it has to
//! be converted before it can go onto a device. [`TableClassifier`] is the
//! built-in implementation driven by [`crate::config::FileTypeConfig`] entries.

use std::path::Path;

use tracing::debug;

use crate::config::FileTypeConfig;
use crate::track::GaplessData;

/// Classification of a media file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileType {
    /// Type token.
    pub name: String,
    /// Whether conversion is supported for this type.
    pub can_convert: bool,
    /// Whether the device requires conversion.
    pub must_convert: bool,
    /// Conversion command line, if configured.
    pub conversion_command: Option<String>,
}

impl From<&FileTypeConfig> for FileType {
    fn from(config: &FileTypeConfig) -> Self {
        Self {
            name: config.name.clone(),
            can_convert: config.can_convert,
            must_convert: config.must_convert,
            conversion_command: config
                .conversion_command
                .as_ref()
                .filter(|c| !c.trim().is_empty())
                .cloned(),
        }
    }
}

/// Trait for classifying media files.
#[cfg_attr(test, mockall::automock)]
pub trait FileClassifier: Send + Sync {
    /// Classify `path`, or return `None` for unsupported files.
    fn classify(&self, path: &Path) -> Option<FileType>;

    /// Read gapless playback facts from a converted file.
    fn read_gapless(&self, path: &Path) -> Option<GaplessData>;
}

/// Suffix-based classifier built from configuration.
#[derive(Debug, Clone, Default)]
pub struct TableClassifier {
    types: Vec<FileTypeConfig>,
}

impl TableClassifier {
    /// Create a classifier from type entries.
    #[must_use]
    pub fn new(types: Vec<FileTypeConfig>) -> Self {
        Self { types }
    }
}

impl FileClassifier for TableClassifier {
    fn classify(&self, path: &Path) -> Option<FileType> {
        let suffix = path.extension()?.to_str()?.to_lowercase();
        let found = self
            .types
            .iter()
            .find(|t| t.suffixes.iter().any(|s| s.eq_ignore_ascii_case(&suffix)))
            .map(FileType::from);
        if found.is_none() {
            debug!("No file type registered for suffix '{}'", suffix);
        }
        found
    }

    fn read_gapless(&self, _path: &Path) -> Option<GaplessData> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> TableClassifier {
        TableClassifier::new(vec![
            FileTypeConfig::new("flac", "flac").with_command("flac2mp3 --fast").required(),
            FileTypeConfig::new("mp3", "mp3").passthrough(),
            FileTypeConfig::new("ogg", "ogg").with_command("   "),
        ])
    }

    #[test]
    fn test_classify_by_suffix_case_insensitive() {
        let ft = classifier().classify(Path::new("/music/a.FLAC")).expect("flac");
        assert_eq!(ft.name, "flac");
        assert!(ft.must_convert);
        assert_eq!(ft.conversion_command.as_deref(), Some("flac2mp3 --fast"));
    }

    #[test]
    fn test_classify_unknown_suffix() {
        assert!(classifier().classify(Path::new("/music/a.wav")).is_none());
        assert!(classifier().classify(Path::new("/music/no_suffix")).is_none());
    }

    #[test]
    fn test_blank_command_is_no_command() {
        let ft = classifier().classify(Path::new("x.ogg")).expect("ogg");
        assert!(ft.conversion_command.is_none());
    }

    #[test]
    fn test_passthrough_type() {
        let ft = classifier().classify(Path::new("x.mp3")).expect("mp3");
        assert!(!ft.can_convert);
        assert!(classifier().read_gapless(Path::new("x.mp3")).is_none());
    }

    #[test]
    fn test_mock_classifier() {
        let mut mock = MockFileClassifier::new();
        mock.expect_classify().returning(|_| None);
        assert!(mock.classify(Path::new("whatever")).is_none());
    }
}
