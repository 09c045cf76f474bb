//! External conversion commands.
//!
//! A conversion command is a user-configured command line. It is invoked in
//! two ways:
//!
//! - `<cmd> -x` prints the extension of the files it produces;
//! - `<cmd> -a artist -A album -T track -t title -g genre -y year -c comment -f <output> <source>`
//!   converts `source` into `output`.
//!
//! Conversions run in their own process group so that cancelling a job also
//! stops any helper processes the command started.

use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use tracing::{debug, warn};

use crate::error::{ConversionError, Error, Result};
use crate::track::TrackTags;

/// A parsed conversion command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionCommand {
    line: String,
    program: String,
    args: Vec<String>,
}

impl ConversionCommand {
    /// Parse a command line with POSIX shell quoting rules.
    pub fn parse(line: &str) -> Result<Self> {
        let words = shlex::split(line).ok_or_else(|| {
            Error::Configuration(format!("Conversion command has unbalanced quotes: {line}"))
        })?;
        let mut words = words.into_iter();
        let program = words
            .next()
            .ok_or_else(|| Error::Configuration("Conversion command is empty".to_string()))?;
        Ok(Self {
            line: line.trim().to_string(),
            program,
            args: words.collect(),
        })
    }

    /// The command line as configured.
    #[must_use]
    pub fn line(&self) -> &str {
        &self.line
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Ask the command which extension its output files have.
    pub fn query_extension(&self) -> Result<String> {
        let failed = |reason: String| {
            Error::Conversion(ConversionError::ExtensionQueryFailed {
                command: self.line.clone(),
                reason,
            })
        };

        let output = self
            .base_command()
            .arg("-x")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| failed(e.to_string()))?;

        if !output.status.success() {
            return Err(failed(format!("exited with {}", output.status)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let extension = stdout
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .trim_start_matches('.')
            .to_string();

        if extension.is_empty() {
            return Err(failed("no extension printed".to_string()));
        }
        debug!("'{}' produces .{} files", self.line, extension);
        Ok(extension)
    }

    /// Arguments for converting `source` into `output`.
    #[must_use]
    pub fn conversion_args(tags: &TrackTags, output: &Path, source: &Path) -> Vec<OsString> {
        let text = |v: &Option<String>| OsString::from(v.as_deref().unwrap_or_default());
        vec![
            "-a".into(),
            text(&tags.artist),
            "-A".into(),
            text(&tags.album),
            "-T".into(),
            format!("{:02}", tags.track_nr).into(),
            "-t".into(),
            text(&tags.title),
            "-g".into(),
            text(&tags.genre),
            "-y".into(),
            tags.year.to_string().into(),
            "-c".into(),
            text(&tags.comment),
            "-f".into(),
            output.as_os_str().to_os_string(),
            source.as_os_str().to_os_string(),
        ]
    }

    /// Start a conversion in a new process group with stderr piped.
    pub fn spawn(&self, tags: &TrackTags, output: &Path, source: &Path) -> io::Result<Child> {
        let mut cmd = self.base_command();
        cmd.args(Self::conversion_args(tags, output, source))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        cmd.spawn()
    }
}

/// Send SIGTERM to the process group led by `pid`.
///
/// Returns whether the signal was delivered.
pub fn terminate_process_group(pid: u32) -> bool {
    #[cfg(unix)]
    {
        match Command::new("kill")
            .args(["-TERM", "--", &format!("-{pid}")])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) => status.success(),
            Err(e) => {
                warn!("Failed to signal process group {}: {}", pid, e);
                false
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}
