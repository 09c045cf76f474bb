//! Conversion workers.
//!
//! A worker occupies one slot and converts jobs one at a time, taking the job
//! that has waited longest in `scheduled`. The queue lock is only held while a
//! job changes queues; the external command runs unlocked. Each iteration:
//!
//! 1. picks a collision-free output name, or reuses an up-to-date earlier
//!    conversion of the same track;
//! 2. runs the command in its own process group, capturing stderr into the
//!    slot's log page;
//! 3. records the outcome on the job and moves it to `converted` or `failed`;
//! 4. prunes the cache and decides whether to continue.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, warn};

use crate::command::{ConversionCommand, terminate_process_group};
use crate::error::{ConversionError, Error, Result};
use crate::events::PipelineEvent;
use crate::job::{CancelToken, ConversionJob, ConversionStatus, JobId};
use crate::manager::Shared;
use crate::track::{GaplessData, TrackTags};
use crate::transfer::remove_quietly;

/// How often a running conversion is checked for exit, cancellation and timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Time a terminated command gets to exit before it is killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Number of stderr lines quoted in a failure message.
const ERROR_TAIL_LINES: usize = 5;

/// Everything a worker needs to convert a job without holding the lock.
#[derive(Debug, Clone)]
struct ConversionTask {
    id: JobId,
    command: ConversionCommand,
    source: PathBuf,
    tags: TrackTags,
    fname_root: PathBuf,
    extension: String,
    previous: Option<PathBuf>,
    token: CancelToken,
}

#[derive(Debug)]
struct ConvertedOutput {
    path: PathBuf,
    size: u64,
    gapless: Option<GaplessData>,
    fresh: bool,
}

#[derive(Debug)]
struct ConversionFailure {
    error: Error,
    stderr_tail: String,
}

impl From<Error> for ConversionFailure {
    fn from(error: Error) -> Self {
        Self {
            error,
            stderr_tail: String::new(),
        }
    }
}

/// Start a worker in `slot`. The caller has already reserved the slot.
pub(crate) fn spawn_conversion_worker(shared: Arc<Shared>, slot: usize) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("podsync-convert-{slot}"))
        .spawn(move || run_conversion_worker(&shared, slot))
        .map(|_| ())
}

fn run_conversion_worker(shared: &Shared, slot: usize) {
    debug!("Conversion worker {} started", slot);
    loop {
        let Some(task) = next_task(shared, slot) else {
            break;
        };

        let result = convert(shared, &task, slot);
        record_result(shared, &task, result);

        shared.prune();

        if !should_continue(shared, slot) {
            break;
        }
    }
    debug!("Conversion worker {} stopped", slot);
}

/// Take the next job from `scheduled`, discarding cancelled ones.
fn next_task(shared: &Shared, slot: usize) -> Option<ConversionTask> {
    let mut queues = shared.queues.lock();
    loop {
        let Some(mut job) = queues.scheduled.pop() else {
            release_slot(shared, &mut queues, slot);
            return None;
        };
        if !job.is_valid() {
            debug!("Dropping cancelled {} before conversion", job.id);
            continue;
        }

        let task = match build_task(&job) {
            Some(task) => task,
            None => {
                job.set_error(format!(
                    "{} has no conversion command or source file",
                    job.track.display_name()
                ));
                queues.failed.push(job);
                continue;
            }
        };

        job.worker_slot = Some(slot);
        shared.force_continue.store(false, Ordering::SeqCst);
        queues.processing.push(job);
        return Some(task);
    }
}

fn build_task(job: &ConversionJob) -> Option<ConversionTask> {
    Some(ConversionTask {
        id: job.id,
        command: job.command.clone()?,
        source: job.track.source.clone()?,
        tags: job.track.tags.clone(),
        fname_root: job.fname_root.clone()?,
        extension: job.extension.clone()?,
        previous: job.converted_file.clone(),
        token: job.cancel_token(),
    })
}

/// Recheck continuation; on exit the slot is released under the same lock.
fn should_continue(shared: &Shared, slot: usize) -> bool {
    let mut queues = shared.queues.lock();
    let quota_ok = shared.quota.exceeded() == Some(false)
        || shared.force_continue.load(Ordering::SeqCst);
    if quota_ok && queues.active_workers <= shared.max_workers && !queues.scheduled.is_empty() {
        return true;
    }
    release_slot(shared, &mut queues, slot);
    false
}

fn release_slot(shared: &Shared, queues: &mut crate::manager::ConversionQueues, slot: usize) {
    if let Some(busy) = queues.slots.get_mut(slot) {
        *busy = false;
    }
    queues.active_workers = queues.active_workers.saturating_sub(1);
    if queues.active_workers <= shared.max_workers {
        shared.force_continue.store(false, Ordering::SeqCst);
    }
}

fn convert(
    shared: &Shared,
    task: &ConversionTask,
    slot: usize,
) -> std::result::Result<ConvertedOutput, ConversionFailure> {
    if let Some(previous) = task.previous.as_deref() {
        if is_reusable(previous, &task.source, &task.extension)? {
            info!(
                "Reusing earlier conversion {} for {}",
                previous.display(),
                task.source.display()
            );
            let size = fs::metadata(previous).map(|m| m.len()).unwrap_or(0);
            return Ok(ConvertedOutput {
                path: previous.to_path_buf(),
                size,
                gapless: shared.classifier.read_gapless(previous),
                fresh: false,
            });
        }
        if previous.exists() {
            debug!("Removing stale conversion {}", previous.display());
            remove_quietly(previous);
        }
    }

    let output = unique_output_path(shared.quota.dir(), &task.fname_root, slot, &task.extension);
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Error::Conversion(ConversionError::OutputMissing {
                path: output.clone(),
                reason: format!("cannot create directory: {e}"),
            })
        })?;
    }

    // The file name must be referenced before the command writes it so a
    // concurrent prune does not delete it.
    {
        let mut queues = shared.queues.lock();
        if let Some(job) = queues.processing.get_mut(task.id) {
            job.converted_file = Some(output.clone());
        }
    }

    run_command(shared, task, slot, &output)?;

    let size = fs::metadata(&output).map(|m| m.len()).map_err(|e| {
        Error::Conversion(ConversionError::OutputMissing {
            path: output.clone(),
            reason: e.to_string(),
        })
    })?;

    Ok(ConvertedOutput {
        gapless: shared.classifier.read_gapless(&output),
        path: output,
        size,
        fresh: true,
    })
}

/// Whether an earlier conversion can be reused: a regular file with the right
/// extension, newer than the source.
fn is_reusable(previous: &Path, source: &Path, extension: &str) -> Result<bool> {
    let Ok(previous_meta) = fs::metadata(previous) else {
        return Ok(false);
    };
    if !previous_meta.is_file() {
        return Ok(false);
    }
    let extension_matches = previous
        .extension()
        .is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case(extension));
    if !extension_matches {
        return Ok(false);
    }
    let source_modified = fs::metadata(source)
        .and_then(|m| m.modified())
        .map_err(|e| {
            Error::Conversion(ConversionError::SourceUnavailable {
                path: source.to_path_buf(),
                reason: e.to_string(),
            })
        })?;
    let previous_modified = previous_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    Ok(previous_modified > source_modified)
}

/// `<cache>/<root>-<slot>-<n>.<ext>` with the smallest free `n`.
fn unique_output_path(cache_dir: &Path, root: &Path, slot: usize, extension: &str) -> PathBuf {
    let base = cache_dir.join(root);
    let stem = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = base.parent().map_or_else(|| cache_dir.to_path_buf(), Path::to_path_buf);

    let mut n: u32 = 0;
    loop {
        let candidate = parent.join(format!("{stem}-{slot}-{n}.{extension}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn run_command(
    shared: &Shared,
    task: &ConversionTask,
    slot: usize,
    output: &Path,
) -> std::result::Result<(), ConversionFailure> {
    let mut child = task
        .command
        .spawn(&task.tags, output, &task.source)
        .map_err(|e| {
            Error::Conversion(ConversionError::SpawnFailed {
                command: task.command.line().to_string(),
                reason: e.to_string(),
            })
        })?;
    let pid = child.id();
    debug!("Converting {} with pid {}", task.source.display(), pid);

    {
        let mut queues = shared.queues.lock();
        if let Some(job) = queues.processing.get_mut(task.id) {
            job.pid = Some(pid);
        }
    }

    let reader = child
        .stderr
        .take()
        .map(|stderr| spawn_stderr_reader(Arc::clone(&shared.log), slot, stderr));

    let outcome = wait_for_exit(&mut child, &task.token, shared.config.conversion_timeout());

    {
        let mut queues = shared.queues.lock();
        if let Some(job) = queues.processing.get_mut(task.id) {
            job.pid = None;
        }
    }
    let stderr_tail = reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    let error = match outcome {
        WaitOutcome::Exited(status) if status.success() => return Ok(()),
        WaitOutcome::Exited(status) => match status.code() {
            Some(code) => ConversionError::ExitStatus {
                path: task.source.clone(),
                command: task.command.line().to_string(),
                code,
            },
            None => ConversionError::Terminated {
                path: task.source.clone(),
                command: task.command.line().to_string(),
            },
        },
        WaitOutcome::Cancelled => ConversionError::Terminated {
            path: task.source.clone(),
            command: task.command.line().to_string(),
        },
        WaitOutcome::TimedOut(limit) => ConversionError::TimedOut {
            path: task.source.clone(),
            secs: limit.as_secs(),
        },
        WaitOutcome::WaitFailed(reason) => ConversionError::SpawnFailed {
            command: task.command.line().to_string(),
            reason,
        },
    };

    remove_quietly(output);
    Err(ConversionFailure {
        error: Error::Conversion(error),
        stderr_tail,
    })
}

enum WaitOutcome {
    Exited(ExitStatus),
    Cancelled,
    TimedOut(Duration),
    WaitFailed(String),
}

fn wait_for_exit(child: &mut Child, token: &CancelToken, timeout: Option<Duration>) -> WaitOutcome {
    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return WaitOutcome::Exited(status),
            Ok(None) => {}
            Err(e) => return WaitOutcome::WaitFailed(e.to_string()),
        }

        if token.is_cancelled() {
            stop_child(child);
            return WaitOutcome::Cancelled;
        }
        if let Some(limit) = timeout
            && started.elapsed() >= limit
        {
            warn!("Conversion pid {} exceeded {:?}, terminating", child.id(), limit);
            stop_child(child);
            return WaitOutcome::TimedOut(limit);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn stop_child(child: &mut Child) {
    if terminate_process_group(child.id()) {
        let deadline = Instant::now() + KILL_GRACE;
        while Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
    if let Err(e) = child.kill() {
        debug!("Kill of pid {} failed: {}", child.id(), e);
    }
    if let Err(e) = child.wait() {
        warn!("Could not reap pid {}: {}", child.id(), e);
    }
}

/// Forward stderr into the slot's log page; returns the last few lines.
fn spawn_stderr_reader(
    log: Arc<crate::convlog::ConversionLog>,
    slot: usize,
    mut stderr: ChildStderr,
) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut tail: Vec<String> = Vec::new();
        let mut pending = String::new();
        let mut buffer = [0u8; 4096];
        loop {
            let read = match stderr.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let text = String::from_utf8_lossy(&buffer[..read]);
            log.append(slot, &text);
            pending.push_str(&text);
            while let Some(pos) = pending.find('\n') {
                let line: String = pending.drain(..=pos).collect();
                let line = line.trim_end().to_string();
                debug!(slot, "{}", line);
                tail.push(line);
                if tail.len() > ERROR_TAIL_LINES {
                    tail.remove(0);
                }
            }
        }
        if !pending.trim().is_empty() {
            tail.push(pending.trim_end().to_string());
            if tail.len() > ERROR_TAIL_LINES {
                tail.remove(0);
            }
        }
        tail.join("\n")
    })
}

fn record_result(
    shared: &Shared,
    task: &ConversionTask,
    result: std::result::Result<ConvertedOutput, ConversionFailure>,
) {
    let mut queues = shared.queues.lock();
    let Some(mut job) = queues.processing.remove(task.id) else {
        return;
    };
    job.worker_slot = None;
    job.pid = None;

    if !job.is_valid() {
        let leftover = match &result {
            Ok(output) if output.fresh => {
                remove_quietly(&output.path);
                Some(output.path.clone())
            }
            Ok(output) => Some(output.path.clone()),
            Err(_) => job.converted_file.take(),
        };
        debug!("Conversion of cancelled {} discarded", job.id);
        shared.events.emit(PipelineEvent::RemoveTrack {
            track: job.track_id(),
            converted_file: leftover,
        });
        return;
    }

    match result {
        Ok(output) => {
            info!("Converted {} to {}", task.source.display(), output.path.display());
            job.converted_file = Some(output.path);
            job.converted_size = output.size;
            job.gapless = output.gapless;
            job.status = ConversionStatus::Converted;
            queues.converted.push(job);
        }
        Err(failure) => {
            let mut message = failure.error.to_string();
            if !failure.stderr_tail.is_empty() {
                message.push('\n');
                message.push_str(&failure.stderr_tail);
            }
            warn!("{}", message);
            job.converted_file = None;
            job.set_error(message);
            queues.failed.push(job);
        }
    }
}
