//! Size accounting and pruning for the conversion cache directory.
//!
//! Both operations are single-flight:
//!
//! - a [`CacheQuota::measure`] call made while another measurement runs waits
//!   for it and reuses its result;
//! - a [`CacheQuota::prune`] call made while a prune runs queues exactly one
//!   more pass and waits for it to finish. Further requests fold into that
//!   pending pass.
//!
//! Pruning deletes the least recently modified files that no job references
//! until the cache fits its quota again.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Result of one prune call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Files deleted.
    pub files_deleted: usize,
    /// Bytes freed.
    pub bytes_freed: u64,
    /// Cache size measured after the pass.
    pub size_after: u64,
    /// The pass was run by another caller.
    pub coalesced: bool,
}

#[derive(Debug, Default)]
struct QuotaState {
    size: Option<u64>,
    measuring: bool,
    pruning: bool,
    rerun_requested: bool,
    completed_prunes: u64,
}

#[derive(Debug)]
struct CacheFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Quota bookkeeping for one cache directory.
#[derive(Debug)]
pub struct CacheQuota {
    dir: PathBuf,
    max_size: u64,
    state: Mutex<QuotaState>,
    done: Condvar,
}

impl CacheQuota {
    /// Create the bookkeeping for `dir` with a quota of `max_size` bytes.
    ///
    /// The size is unknown until the first measurement.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            dir: dir.into(),
            max_size,
            state: Mutex::new(QuotaState::default()),
            done: Condvar::new(),
        }
    }

    /// Cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Configured quota in bytes.
    #[must_use]
    pub const fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Last measured size, or `None` before the first measurement.
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.state.lock().size
    }

    /// Whether the cache is over quota; `None` while the size is unknown.
    ///
    /// A quota of zero disables caching, so it always counts as exceeded.
    #[must_use]
    pub fn exceeded(&self) -> Option<bool> {
        self.size()
            .map(|size| self.max_size == 0 || size > self.max_size)
    }

    /// Measure the cache directory.
    pub fn measure(&self) -> u64 {
        let mut state = self.state.lock();
        if state.measuring {
            while state.measuring {
                self.done.wait(&mut state);
            }
            return state.size.unwrap_or(0);
        }
        self.measure_locked(&mut state)
    }

    fn measure_locked(&self, state: &mut MutexGuard<'_, QuotaState>) -> u64 {
        state.measuring = true;
        let size = MutexGuard::unlocked(state, || {
            self.list_files().iter().map(|f| f.size).sum::<u64>()
        });
        state.size = Some(size);
        state.measuring = false;
        self.done.notify_all();
        debug!("Conversion cache {} holds {} bytes", self.dir.display(), size);
        size
    }

    /// Prune unreferenced files until the cache fits its quota.
    ///
    /// `referenced` is called once per pass, after the cache has been listed,
    /// and returns every converted file a job still needs.
    pub fn prune<F>(&self, referenced: F) -> PruneStats
    where
        F: Fn() -> HashSet<PathBuf>,
    {
        let mut state = self.state.lock();
        if state.pruning {
            state.rerun_requested = true;
            let target = state.completed_prunes + 2;
            while state.completed_prunes < target {
                self.done.wait(&mut state);
            }
            return PruneStats {
                size_after: state.size.unwrap_or(0),
                coalesced: true,
                ..PruneStats::default()
            };
        }

        state.pruning = true;
        let mut total = PruneStats::default();
        loop {
            state.rerun_requested = false;
            let pass = MutexGuard::unlocked(&mut state, || self.prune_pass(&referenced));
            total.files_deleted += pass.files_deleted;
            total.bytes_freed += pass.bytes_freed;

            let size = if state.measuring {
                while state.measuring {
                    self.done.wait(&mut state);
                }
                state.size.unwrap_or(0)
            } else {
                self.measure_locked(&mut state)
            };
            total.size_after = size;

            state.completed_prunes += 1;
            self.done.notify_all();
            if !state.rerun_requested {
                break;
            }
        }
        state.pruning = false;
        self.done.notify_all();

        if total.files_deleted > 0 {
            info!(
                "Pruned {} files ({} bytes) from conversion cache",
                total.files_deleted, total.bytes_freed
            );
        }
        total
    }

    fn prune_pass<F>(&self, referenced: &F) -> PruneStats
    where
        F: Fn() -> HashSet<PathBuf>,
    {
        let mut files = self.list_files();
        let needed = referenced();
        files.sort_by_key(|f| f.modified);

        let mut size: u64 = files.iter().map(|f| f.size).sum();
        let mut stats = PruneStats::default();

        for file in files {
            if size <= self.max_size && self.max_size > 0 {
                break;
            }
            if size == 0 {
                break;
            }
            if needed.contains(&file.path) {
                continue;
            }
            match fs::remove_file(&file.path) {
                Ok(()) => {
                    debug!("Pruned {}", file.path.display());
                    size = size.saturating_sub(file.size);
                    stats.files_deleted += 1;
                    stats.bytes_freed += file.size;
                }
                Err(e) => warn!("Failed to prune {}: {}", file.path.display(), e),
            }
        }
        stats.size_after = size;
        stats
    }

    fn list_files(&self) -> Vec<CacheFile> {
        WalkDir::new(&self.dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!("Skipping unreadable cache entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                Some(CacheFile {
                    path: entry.into_path(),
                    size: meta.len(),
                    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                })
            })
            .collect()
    }
}
