//! Per-device transfer state and the transfer worker.
//!
//! Every device gets a [`DeviceTransfer`] holding its own FIFO pipeline:
//!
//! ```text
//! scheduled -> processing -> transferred | failed -> finished
//! ```
//!
//! At most one transfer worker runs per device. It copies the converted file
//! (or the original when no conversion happened) to the path the media store
//! picks, and distinguishes a full device from other copy failures. A full
//! device pauses its transfers until the caller continues them.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{Error, FileSystemError, Result, TransferError, is_storage_full};
use crate::job::{ConversionJob, JobId, JobQueue};
use crate::manager::Shared;
use crate::track::DeviceId;

/// Chunk size for file copies (64 KB).
pub const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Transfer status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// No transfer running.
    #[default]
    Idle,
    /// A transfer worker is copying.
    Active,
    /// The device ran out of space; transfers are paused.
    DiskFull,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Active => write!(f, "Transferring"),
            Self::DiskFull => write!(f, "Device full"),
        }
    }
}

/// Queues and flags of one device, guarded by its own mutex.
#[derive(Debug)]
pub(crate) struct TransferQueues {
    pub(crate) valid: bool,
    pub(crate) activated: bool,
    pub(crate) status: TransferStatus,
    pub(crate) disk_full_reported: bool,
    pub(crate) worker_running: bool,
    pub(crate) scheduled: JobQueue,
    pub(crate) processing: JobQueue,
    pub(crate) transferred: JobQueue,
    pub(crate) failed: JobQueue,
    pub(crate) finished: JobQueue,
}

impl TransferQueues {
    /// Queues other than `processing`, which belongs to the worker.
    pub(crate) fn idle_queues_mut(&mut self) -> [&mut JobQueue; 4] {
        [
            &mut self.scheduled,
            &mut self.transferred,
            &mut self.failed,
            &mut self.finished,
        ]
    }

    pub(crate) fn all_queues(&self) -> [&JobQueue; 5] {
        [
            &self.scheduled,
            &self.processing,
            &self.transferred,
            &self.failed,
            &self.finished,
        ]
    }

    pub(crate) fn all_queues_mut(&mut self) -> [&mut JobQueue; 5] {
        [
            &mut self.scheduled,
            &mut self.processing,
            &mut self.transferred,
            &mut self.failed,
            &mut self.finished,
        ]
    }

    /// Whether the worker could make progress.
    pub(crate) fn can_transfer(&self) -> bool {
        self.activated && self.status != TransferStatus::DiskFull
    }

    pub(crate) fn is_drained(&self) -> bool {
        !self.worker_running && self.all_queues().iter().all(|q| q.is_empty())
    }
}

/// Transfer state of one device.
#[derive(Debug)]
pub struct DeviceTransfer {
    device: DeviceId,
    pub(crate) queues: Mutex<TransferQueues>,
}

impl DeviceTransfer {
    pub(crate) fn new(device: DeviceId, activated: bool) -> Self {
        Self {
            device,
            queues: Mutex::new(TransferQueues {
                valid: true,
                activated,
                status: TransferStatus::Idle,
                disk_full_reported: false,
                worker_running: false,
                scheduled: JobQueue::new(),
                processing: JobQueue::new(),
                transferred: JobQueue::new(),
                failed: JobQueue::new(),
                finished: JobQueue::new(),
            }),
        }
    }

    /// Device this state belongs to.
    #[must_use]
    pub const fn device(&self) -> DeviceId {
        self.device
    }

    /// Current transfer status.
    #[must_use]
    pub fn status(&self) -> TransferStatus {
        self.queues.lock().status
    }

    /// Whether background transfer is allowed.
    #[must_use]
    pub fn is_activated(&self) -> bool {
        self.queues.lock().activated
    }
}

/// Copy `source` to `destination` in chunks.
///
/// The parent directory of `destination` is created. A partial copy is
/// removed on failure. A full destination filesystem is reported as
/// [`TransferError::DiskFull`]. With `verify`, the copy is re-read and its
/// SHA-256 compared with the source.
pub fn copy_file(source: &Path, destination: &Path, verify: bool) -> Result<()> {
    let result = copy_chunked(source, destination, verify);
    if result.is_err() {
        remove_quietly(destination);
    }
    result
}

fn copy_chunked(source: &Path, destination: &Path, verify: bool) -> Result<()> {
    let copy_failed = |e: std::io::Error| -> Error {
        if is_storage_full(&e) {
            Error::Transfer(TransferError::DiskFull {
                path: destination.to_path_buf(),
            })
        } else {
            Error::Transfer(TransferError::CopyFailed {
                source_path: source.to_path_buf(),
                destination: destination.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };

    let source_file = File::open(source).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::Transfer(TransferError::SourceNotFound {
                path: source.to_path_buf(),
            })
        } else {
            Error::FileSystem(FileSystemError::ReadFailed {
                path: source.to_path_buf(),
                reason: e.to_string(),
            })
        }
    })?;
    let mut reader = BufReader::with_capacity(COPY_CHUNK_SIZE, source_file);

    if let Some(parent) = destination.parent()
        && !parent.exists()
    {
        fs::create_dir_all(parent).map_err(copy_failed)?;
    }
    let dest_file = File::create(destination).map_err(copy_failed)?;
    let mut writer = BufWriter::with_capacity(COPY_CHUNK_SIZE, dest_file);

    let mut hasher = verify.then(Sha256::new);
    let mut buffer = vec![0u8; COPY_CHUNK_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer).map_err(|e| {
            Error::FileSystem(FileSystemError::ReadFailed {
                path: source.to_path_buf(),
                reason: e.to_string(),
            })
        })?;
        if bytes_read == 0 {
            break;
        }
        writer.write_all(&buffer[..bytes_read]).map_err(copy_failed)?;
        if let Some(h) = hasher.as_mut() {
            h.update(&buffer[..bytes_read]);
        }
    }

    let dest_file = writer
        .into_inner()
        .map_err(|e| copy_failed(e.into_error()))?;
    dest_file.sync_all().map_err(copy_failed)?;

    if let Some(h) = hasher {
        let expected = format!("{:x}", h.finalize());
        let actual = file_checksum(destination)?;
        if actual != expected {
            return Err(Error::Transfer(TransferError::IntegrityCheckFailed {
                file: destination.to_path_buf(),
                expected,
                actual,
            }));
        }
    }

    if let Ok(modified) = fs::metadata(source).and_then(|m| m.modified()) {
        if let Err(e) =
            filetime::set_file_mtime(destination, filetime::FileTime::from_system_time(modified))
        {
            debug!("Could not keep modification time on {}: {}", destination.display(), e);
        }
    }
    Ok(())
}

/// Compute SHA-256 checksum of a file.
pub fn file_checksum(path: &Path) -> Result<String> {
    let read_failed = |e: std::io::Error| {
        Error::FileSystem(FileSystemError::ReadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    };
    let mut reader = BufReader::new(File::open(path).map_err(read_failed)?);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
    loop {
        let bytes_read = reader.read(&mut buffer).map_err(read_failed)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Start the transfer worker of `device`.
///
/// The caller has already set `worker_running`.
pub(crate) fn spawn_transfer_worker(
    shared: Arc<Shared>,
    device: Arc<DeviceTransfer>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("podsync-transfer-{}", device.device().0))
        .spawn(move || run_transfer_worker(&shared, &device))
        .map(|_| ())
}

fn run_transfer_worker(shared: &Shared, device: &DeviceTransfer) {
    debug!("Transfer worker for {} started", device.device());
    loop {
        let Some((job_id, source)) = next_transfer(device) else {
            break;
        };

        let result = source
            .ok_or_else(|| {
                Error::Transfer(TransferError::SourceNotFound {
                    path: PathBuf::new(),
                })
            })
            .and_then(|source| {
                let dest = shared.store.destination_path(device.device(), &source)?;
                copy_file(&source, &dest, shared.config.verify_transfers)?;
                Ok(dest)
            });

        record_transfer(device, job_id, result);

        if shared.quota.exceeded() == Some(true) {
            shared.prune();
        }
    }
    debug!("Transfer worker for {} stopped", device.device());
}

/// Take the next job, or mark the worker stopped when there is nothing to do.
fn next_transfer(device: &DeviceTransfer) -> Option<(JobId, Option<PathBuf>)> {
    let mut queues = device.queues.lock();
    loop {
        let job = if queues.can_transfer() {
            queues.scheduled.pop()
        } else {
            None
        };
        let Some(mut job) = job else {
            queues.worker_running = false;
            if queues.status != TransferStatus::DiskFull {
                queues.status = TransferStatus::Idle;
            }
            return None;
        };
        if !job.is_valid() {
            discard(job);
            continue;
        }
        queues.status = TransferStatus::Active;
        job.error = None;
        job.error_reported = false;
        let source = job.converted_file.clone().or_else(|| job.track.source.clone());
        let id = job.id;
        queues.processing.push(job);
        return Some((id, source));
    }
}

fn record_transfer(device: &DeviceTransfer, job_id: JobId, result: Result<PathBuf>) {
    let mut queues = device.queues.lock();
    let Some(mut job) = queues.processing.remove(job_id) else {
        return;
    };

    match result {
        Ok(dest) => {
            if job.is_valid() {
                debug!("Copied {} to {}", job.track.display_name(), dest.display());
                job.dest_file = Some(dest);
                queues.transferred.push(job);
            } else {
                remove_quietly(&dest);
                discard(job);
            }
        }
        Err(e) if e.is_disk_full() => {
            warn!("{} is full, pausing transfers", device.device());
            queues.status = TransferStatus::DiskFull;
            if job.is_valid() {
                job.set_error(e.to_string());
                queues.scheduled.push_next(job);
            } else {
                discard(job);
            }
        }
        Err(e) => {
            info!("Transfer of {} failed: {}", job.track.display_name(), e);
            if job.is_valid() {
                job.set_error(e.to_string());
                queues.failed.push(job);
            } else {
                discard(job);
            }
        }
    }
}

/// Drop a cancelled job, removing its device copy if one was made.
pub(crate) fn discard(mut job: ConversionJob) {
    if let Some(dest) = job.dest_file.take() {
        remove_quietly(&dest);
    }
    debug!("Discarded cancelled {}", job.id);
}

pub(crate) fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ConversionJob, JobId};
    use crate::track::TrackRecord;
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).expect("write content");
        path
    }

    #[test]
    fn test_copy_file_creates_parent_dirs() {
        let temp = TempDir::new().expect("temp dir");
        let source = create_test_file(temp.path(), "song.mp3", b"audio bytes");
        let dest = temp.path().join("device").join("Music").join("F00").join("song.mp3");

        copy_file(&source, &dest, false).expect("copy");
        assert_eq!(fs::read(&dest).expect("read copy"), b"audio bytes");
    }

    #[test]
    fn test_copy_file_with_verification() {
        let temp = TempDir::new().expect("temp dir");
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let source = create_test_file(temp.path(), "big.mp3", &content);
        let dest = temp.path().join("out.mp3");

        copy_file(&source, &dest, true).expect("verified copy");
        assert_eq!(
            file_checksum(&source).expect("source checksum"),
            file_checksum(&dest).expect("dest checksum")
        );
    }

    #[test]
    fn test_copy_missing_source() {
        let temp = TempDir::new().expect("temp dir");
        let dest = temp.path().join("out.mp3");
        let err = copy_file(&temp.path().join("missing.mp3"), &dest, false).expect_err("must fail");
        assert!(matches!(
            err,
            Error::Transfer(TransferError::SourceNotFound { .. })
        ));
        assert!(!err.is_disk_full());
        assert!(!dest.exists());
    }

    #[test]
    fn test_failed_copy_removes_partial_destination() {
        let temp = TempDir::new().expect("temp dir");
        let source_dir = temp.path().join("album");
        fs::create_dir_all(&source_dir).expect("mkdir");
        let dest = temp.path().join("device").join("out.mp3");

        assert!(copy_file(&source_dir, &dest, false).is_err());
        assert!(!dest.exists());
    }

    #[test]
    fn test_copy_preserves_mtime() {
        let temp = TempDir::new().expect("temp dir");
        let source = create_test_file(temp.path(), "a.mp3", b"x");
        let stamp = filetime::FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(&source, stamp).expect("set mtime");
        let dest = temp.path().join("b.mp3");

        copy_file(&source, &dest, false).expect("copy");
        let meta = fs::metadata(&dest).expect("metadata");
        assert_eq!(filetime::FileTime::from_last_modification_time(&meta), stamp);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TransferStatus::DiskFull.to_string(), "Device full");
        assert_eq!(TransferStatus::default(), TransferStatus::Idle);
    }

    fn queued_device() -> DeviceTransfer {
        let device = DeviceTransfer::new(DeviceId(1), true);
        {
            let mut queues = device.queues.lock();
            queues.worker_running = true;
            for id in 1..=2 {
                queues.scheduled.push(ConversionJob::new(
                    JobId(id),
                    TrackRecord::new(id, 1, format!("/m/{id}.mp3")),
                ));
            }
        }
        device
    }

    #[test]
    fn test_disk_full_requeues_job_first() {
        let device = queued_device();
        let (id, source) = next_transfer(&device).expect("first job");
        assert_eq!(id, JobId(1));
        assert_eq!(source, Some(PathBuf::from("/m/1.mp3")));
        assert_eq!(device.status(), TransferStatus::Active);

        record_transfer(
            &device,
            id,
            Err(Error::Transfer(TransferError::DiskFull {
                path: PathBuf::from("/dev/full"),
            })),
        );
        assert_eq!(device.status(), TransferStatus::DiskFull);

        // The worker stops while the device is full.
        assert!(next_transfer(&device).is_none());
        let queues = device.queues.lock();
        assert!(!queues.worker_running);
        assert_eq!(queues.status, TransferStatus::DiskFull);
        let order: Vec<_> = queues.scheduled.iter().map(|j| j.id).collect();
        assert_eq!(order, vec![JobId(1), JobId(2)]);
    }

    #[test]
    fn test_generic_failure_goes_to_failed() {
        let device = queued_device();
        let (id, _) = next_transfer(&device).expect("job");
        record_transfer(
            &device,
            id,
            Err(Error::Transfer(TransferError::SourceNotFound {
                path: PathBuf::from("/m/1.mp3"),
            })),
        );
        let queues = device.queues.lock();
        assert_eq!(queues.failed.len(), 1);
        assert!(queues.failed.iter().all(|j| j.error.is_some()));
        assert_eq!(queues.status, TransferStatus::Active);
    }

    #[test]
    fn test_cancelled_copy_is_removed() {
        let temp = TempDir::new().expect("temp dir");
        let device = queued_device();
        let (id, _) = next_transfer(&device).expect("job");
        device
            .queues
            .lock()
            .processing
            .get_mut(id)
            .expect("processing job")
            .cancel();

        let dest = create_test_file(temp.path(), "copy.mp3", b"x");
        record_transfer(&device, id, Ok(dest.clone()));
        assert!(!dest.exists());
        let queues = device.queues.lock();
        assert!(queues.transferred.is_empty());
        assert!(queues.processing.is_empty());
    }

    #[test]
    fn test_inactive_device_stops_worker() {
        let device = queued_device();
        device.queues.lock().activated = false;
        assert!(next_transfer(&device).is_none());
        let queues = device.queues.lock();
        assert!(!queues.worker_running);
        assert_eq!(queues.scheduled.len(), 2);
    }
}
