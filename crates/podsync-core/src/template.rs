//! Templated names for converted files.
//!
//! A template such as `%A/%t_%T` is expanded with a track's tags into a
//! relative path under the conversion cache. Supported tokens:
//!
//! | Token | Value |
//! |-------|-------|
//! | `%a` | artist |
//! | `%A` | album |
//! | `%t` | title |
//! | `%c` | composer |
//! | `%g`, `%G` | genre |
//! | `%C` | CD number |
//! | `%T` | track number, zero padded to the width of the track count (at least 2) |
//! | `%Y` | year |
//! | `%o` | source file name |
//! | `%O` | source file name without extension |
//! | `%%` | literal `%` |
//!
//! Unknown tokens are kept as written.

use std::path::{Component, Path, PathBuf};

use regex::{Captures, Regex};

use crate::error::{Error, Result};
use crate::track::TrackTags;

/// Maximum length of a single path component produced by expansion.
const MAX_COMPONENT_CHARS: usize = 200;

/// Sanitize a string for use as a filename.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let invalid_chars = ['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0'];

    let sanitized: String = name
        .chars()
        .map(|c| if invalid_chars.contains(&c) || c.is_control() { '_' } else { c })
        .collect();

    sanitized
        .trim()
        .trim_matches('.')
        .chars()
        .take(MAX_COMPONENT_CHARS)
        .collect()
}

/// A parsed file name template.
#[derive(Debug, Clone)]
pub struct FilenameTemplate {
    pattern: String,
    token_re: Regex,
}

impl FilenameTemplate {
    /// Parse a template.
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        if pattern.trim().is_empty() {
            return Err(Error::Configuration(
                "Filename template must not be empty".to_string(),
            ));
        }
        let token_re = Regex::new(r"%(.)")
            .map_err(|e| Error::Configuration(format!("Invalid template pattern: {e}")))?;
        Ok(Self { pattern, token_re })
    }

    /// The template text.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Expand the template into a relative path root (no extension).
    ///
    /// Falls back to the source file stem when nothing usable remains.
    #[must_use]
    pub fn expand(&self, tags: &TrackTags, source: &Path) -> PathBuf {
        let expanded = self
            .token_re
            .replace_all(&self.pattern, |caps: &Captures<'_>| {
                let token = caps.get(1).map_or("", |m| m.as_str());
                token_value(token, tags, source).unwrap_or_else(|| format!("%{token}"))
            });

        let mut root = PathBuf::new();
        for component in Path::new(expanded.as_ref()).components() {
            if let Component::Normal(part) = component {
                let part = part.to_string_lossy();
                let part = part.trim();
                if !part.is_empty() {
                    root.push(part);
                }
            }
        }

        if root.as_os_str().is_empty() {
            let stem = source
                .file_stem()
                .map(|s| sanitize_filename(&s.to_string_lossy()))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "track".to_string());
            root.push(stem);
        }
        root
    }
}

fn token_value(token: &str, tags: &TrackTags, source: &Path) -> Option<String> {
    let text = |value: &Option<String>| sanitize_filename(value.as_deref().unwrap_or_default());
    let number = |value: u32| if value == 0 { String::new() } else { value.to_string() };

    let value = match token {
        "a" => text(&tags.artist),
        "A" => text(&tags.album),
        "t" => text(&tags.title),
        "c" => text(&tags.composer),
        "g" | "G" => text(&tags.genre),
        "C" => number(tags.cd_nr),
        "Y" => number(tags.year),
        "T" => {
            let width = tags.tracks.to_string().len().max(2);
            format!("{:0width$}", tags.track_nr, width = width)
        }
        "o" => sanitize_filename(&source.file_name()?.to_string_lossy()),
        "O" => sanitize_filename(&source.file_stem()?.to_string_lossy()),
        "%" => "%".to_string(),
        _ => return None,
    };
    Some(value)
}
