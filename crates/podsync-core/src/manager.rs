//! The conversion manager.
//!
//! [`ConversionManager`] owns the conversion queues, the per-device transfer
//! states, the cache quota and the worker threads. Callers construct one
//! instance and share it; there is no global state.
//!
//! Jobs flow through the conversion queues
//!
//! ```text
//! scheduled -> processing -> converted | failed -> finished
//! ```
//!
//! and then into the transfer queues of their device (see
//! [`crate::transfer`]). [`ConversionManager::tick`] performs every transition
//! that happens outside a worker and is the only place that talks to the
//! media store.
//!
//! Lock order is the conversion queues first, then a device's queues. Store
//! calls are made with neither lock held.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use podsync_core::{ConversionManager, PipelineConfig, TableClassifier, TrackRecord};
//!
//! let config = PipelineConfig::load()?;
//! let classifier = Arc::new(TableClassifier::new(config.file_types.clone()));
//! let manager = Arc::new(ConversionManager::new(config, classifier, store)?);
//! let mut events = manager.take_events().expect("first call");
//!
//! manager.submit(&TrackRecord::new(1, 1, "/music/song.flac"))?;
//! let interval = manager.tick_interval();
//! let scheduler = podsync_core::scheduler::spawn_scheduler(Arc::clone(&manager), interval);
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::classify::FileClassifier;
use crate::command::ConversionCommand;
use crate::config::PipelineConfig;
use crate::convert::spawn_conversion_worker;
use crate::convlog::ConversionLog;
use crate::error::{CacheError, ConversionError, Error, Result};
use crate::events::{EventSink, PipelineEvent, TrackUpdate};
use crate::job::{ConversionJob, ConversionStatus, JobId, JobOutcome, JobQueue};
use crate::quota::{CacheQuota, PruneStats};
use crate::store::{MediaStore, TrackRef};
use crate::template::FilenameTemplate;
use crate::track::{DeviceId, GaplessData, TrackId, TrackRecord};
use crate::transfer::{
    DeviceTransfer, TransferQueues, TransferStatus, discard, remove_quietly, spawn_transfer_worker,
};

/// Outcome of an accepted [`ConversionManager::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Nothing to do: the library is local or the track is already on the device.
    Skipped,
    /// The track waits for conversion.
    Scheduled(JobId),
    /// The track is transferred without conversion.
    PassThrough(JobId),
}

/// Counts shown for one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    /// Transfer status of the device.
    pub status: TransferStatus,
    /// Tracks waiting for or undergoing conversion.
    pub to_convert: usize,
    /// Tracks being converted right now.
    pub converting: usize,
    /// Tracks waiting for or undergoing transfer.
    pub to_transfer: usize,
    /// Tracks copied to the device.
    pub transferred: usize,
    /// Tracks that could not be converted or copied.
    pub failed: usize,
}

/// A track that did not make it onto its device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTrack {
    /// Track identity.
    pub track: TrackId,
    /// Conversion classification; `Required`/`RequiredFailed` need user action.
    pub status: ConversionStatus,
    /// Last error message.
    pub message: Option<String>,
}

/// Conversion queues and worker bookkeeping, guarded by one mutex.
#[derive(Debug, Default)]
pub(crate) struct ConversionQueues {
    pub(crate) scheduled: JobQueue,
    pub(crate) processing: JobQueue,
    pub(crate) failed: JobQueue,
    pub(crate) converted: JobQueue,
    pub(crate) finished: JobQueue,
    pub(crate) active_workers: usize,
    pub(crate) slots: Vec<bool>,
    pub(crate) devices: Vec<Arc<DeviceTransfer>>,
}

impl ConversionQueues {
    fn all_queues(&self) -> [&JobQueue; 5] {
        [
            &self.scheduled,
            &self.processing,
            &self.failed,
            &self.converted,
            &self.finished,
        ]
    }

    fn all_queues_mut(&mut self) -> [&mut JobQueue; 5] {
        [
            &mut self.scheduled,
            &mut self.processing,
            &mut self.failed,
            &mut self.converted,
            &mut self.finished,
        ]
    }

    fn find_device(&self, device: DeviceId) -> Option<Arc<DeviceTransfer>> {
        self.devices
            .iter()
            .find(|d| d.device() == device && d.queues.lock().valid)
            .cloned()
    }

    /// Transfer state of `device`, created on first use.
    fn device_entry(&mut self, device: DeviceId, activated: bool) -> Arc<DeviceTransfer> {
        if let Some(existing) = self.find_device(device) {
            return existing;
        }
        debug!("Creating transfer state for {}", device);
        let entry = Arc::new(DeviceTransfer::new(device, activated));
        self.devices.push(Arc::clone(&entry));
        entry
    }

    fn reserve_slot(&mut self) -> usize {
        let slot = match self.slots.iter().position(|busy| !busy) {
            Some(slot) => slot,
            None => {
                self.slots.push(false);
                self.slots.len() - 1
            }
        };
        self.slots[slot] = true;
        self.active_workers += 1;
        slot
    }
}

fn count_for(queue: &JobQueue, device: DeviceId) -> usize {
    queue
        .iter()
        .filter(|j| j.is_valid() && j.device() == device)
        .count()
}

/// State shared by the manager and its worker threads.
pub(crate) struct Shared {
    pub(crate) config: PipelineConfig,
    pub(crate) cache_available: bool,
    pub(crate) max_workers: usize,
    pub(crate) template: FilenameTemplate,
    pub(crate) quota: CacheQuota,
    pub(crate) queues: Mutex<ConversionQueues>,
    pub(crate) force_continue: AtomicBool,
    pub(crate) next_job_id: AtomicU64,
    pub(crate) classifier: Arc<dyn FileClassifier>,
    pub(crate) store: Arc<dyn MediaStore>,
    pub(crate) events: EventSink,
    pub(crate) log: Arc<ConversionLog>,
}

impl Shared {
    /// Prune the cache, keeping every file a job still references.
    pub(crate) fn prune(&self) -> PruneStats {
        if !self.cache_available {
            return PruneStats::default();
        }
        self.quota.prune(|| self.referenced_files())
    }

    /// Converted files of every valid job in every queue.
    pub(crate) fn referenced_files(&self) -> HashSet<PathBuf> {
        let queues = self.queues.lock();
        let mut files: HashSet<PathBuf> = queues
            .all_queues()
            .iter()
            .flat_map(|q| q.iter())
            .filter(|j| j.is_valid())
            .filter_map(|j| j.converted_file.clone())
            .collect();
        for device in &queues.devices {
            let device_queues = device.queues.lock();
            files.extend(
                device_queues
                    .all_queues()
                    .iter()
                    .flat_map(|q| q.iter())
                    .filter(|j| j.is_valid())
                    .filter_map(|j| j.converted_file.clone()),
            );
        }
        files
    }

    /// Whether the quota currently prevents starting conversions.
    fn quota_blocks(&self) -> bool {
        self.quota.exceeded() != Some(false) && !self.force_continue.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> JobId {
        JobId(self.next_job_id.fetch_add(1, Ordering::SeqCst))
    }
}

/// Facts of a converted job, published to the store outside the lock.
#[derive(Debug)]
struct ConvertedFacts {
    id: JobId,
    track: TrackId,
    device: DeviceId,
    converted_file: Option<PathBuf>,
    size: u64,
    gapless: Option<GaplessData>,
}

/// Background conversion and transfer pipeline.
pub struct ConversionManager {
    shared: Arc<Shared>,
    tick_lock: Mutex<()>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<PipelineEvent>>>,
}

impl std::fmt::Debug for ConversionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionManager")
            .field("cache_dir", &self.shared.quota.dir())
            .field("max_workers", &self.shared.max_workers)
            .field("cache_available", &self.shared.cache_available)
            .finish_non_exhaustive()
    }
}

impl ConversionManager {
    /// Create a manager.
    ///
    /// The cache directory is created if needed. If that fails the manager
    /// still transfers tracks that need no conversion but never starts a
    /// conversion worker. The cache is measured and pruned in the background
    /// right away; conversions wait until the size is known.
    pub fn new(
        config: PipelineConfig,
        classifier: Arc<dyn FileClassifier>,
        store: Arc<dyn MediaStore>,
    ) -> Result<Self> {
        config.validate()?;
        let template = FilenameTemplate::new(config.filename_template.clone())?;
        let cache_dir = config.cache_directory();

        let cache_available = match fs::create_dir_all(&cache_dir) {
            Ok(()) => true,
            Err(e) => {
                let err = CacheError::InitializationFailed {
                    path: cache_dir.clone(),
                    reason: e.to_string(),
                };
                error!("{}; conversions are disabled", err);
                false
            }
        };

        let (events, event_rx) = EventSink::channel();
        let shared = Arc::new(Shared {
            max_workers: config.effective_max_workers(),
            quota: CacheQuota::new(cache_dir, config.quota_bytes()),
            log: Arc::new(ConversionLog::new(config.log_max_lines, config.display_log)),
            config,
            cache_available,
            template,
            queues: Mutex::new(ConversionQueues::default()),
            force_continue: AtomicBool::new(false),
            next_job_id: AtomicU64::new(1),
            classifier,
            store,
            events,
        });

        if cache_available {
            let background = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name("podsync-prune".to_string())
                .spawn(move || {
                    background.prune();
                });
            if let Err(e) = spawned {
                warn!("Failed to start cache measurement thread: {}", e);
                shared.prune();
            }
        }

        info!(
            "Conversion manager ready: cache {} (quota {} bytes), {} workers",
            shared.quota.dir().display(),
            shared.quota.max_size(),
            shared.max_workers
        );

        Ok(Self {
            shared,
            tick_lock: Mutex::new(()),
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PipelineEvent>> {
        self.event_rx.lock().take()
    }

    /// Per-worker log of conversion output.
    #[must_use]
    pub fn conversion_log(&self) -> &ConversionLog {
        &self.shared.log
    }

    /// Configured tick period.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        self.shared.config.tick_interval()
    }

    /// Whether the cache directory is usable.
    #[must_use]
    pub fn is_cache_available(&self) -> bool {
        self.shared.cache_available
    }

    /// Last measured cache size.
    #[must_use]
    pub fn cache_size(&self) -> Option<u64> {
        self.shared.quota.size()
    }

    /// Number of running conversion workers.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.shared.queues.lock().active_workers
    }

    // =========================================================================
    // Conversion
    // =========================================================================

    /// Submit a track.
    ///
    /// Unsupported files are rejected without a job. Missing sources, failed
    /// extension queries and required conversions without a command are
    /// rejected too, but their jobs land in the failed queue so they show up
    /// in [`Self::list_failed`].
    pub fn submit(&self, track: &TrackRecord) -> Result<Submission> {
        if track.local || track.transferred {
            trace!("Nothing to do for {}", track.display_name());
            return Ok(Submission::Skipped);
        }

        let mut job = ConversionJob::new(self.shared.next_id(), track.clone());

        let Some(source) = track.source.clone().filter(|p| p.is_file()) else {
            let err = Error::Conversion(ConversionError::SourceUnavailable {
                path: track.source.clone().unwrap_or_default(),
                reason: if track.source.is_none() {
                    "no source file recorded".to_string()
                } else {
                    "not a readable file".to_string()
                },
            });
            return Err(self.reject(job, ConversionStatus::Failed, err));
        };

        let Some(file_type) = self.shared.classifier.classify(&source) else {
            let err = Error::Conversion(ConversionError::UnsupportedFileType { path: source });
            warn!("Rejecting {}: {}", track.display_name(), err);
            return Err(err);
        };
        job.must_convert = file_type.must_convert;
        let failed_status = if file_type.must_convert {
            ConversionStatus::RequiredFailed
        } else {
            ConversionStatus::Failed
        };

        let line = match file_type.conversion_command {
            Some(line) if file_type.can_convert => line,
            _ if file_type.must_convert => {
                let err = Error::Conversion(ConversionError::ConversionRequired {
                    file_type: file_type.name,
                });
                return Err(self.reject(job, ConversionStatus::Required, err));
            }
            _ => return Ok(self.pass_through(job)),
        };

        if !self.shared.cache_available {
            let err = Error::Cache(CacheError::Unavailable);
            return Err(self.reject(job, failed_status, err));
        }

        let prepared = ConversionCommand::parse(&line).and_then(|command| {
            let extension = command.query_extension()?;
            Ok((command, extension))
        });
        let (command, extension) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => return Err(self.reject(job, failed_status, err)),
        };

        job.fname_root = Some(self.shared.template.expand(&track.tags, &source));
        job.command = Some(command);
        job.extension = Some(extension);
        job.status = ConversionStatus::Scheduled;
        let id = job.id;
        debug!("Scheduled {} for conversion as {}", track.display_name(), id);
        self.shared.queues.lock().scheduled.push(job);
        Ok(Submission::Scheduled(id))
    }

    /// Park a rejected job in the failed queue and hand the error back.
    fn reject(&self, mut job: ConversionJob, status: ConversionStatus, err: Error) -> Error {
        warn!("Rejecting {}: {}", job.track.display_name(), err);
        job.status = status;
        job.set_error(err.to_string());
        self.shared.queues.lock().failed.push(job);
        err
    }

    fn pass_through(&self, mut job: ConversionJob) -> Submission {
        job.status = ConversionStatus::Inactive;
        job.converted_file = None;
        let id = job.id;
        debug!("{} needs no conversion", job.track.display_name());
        self.shared.queues.lock().finished.push(job);
        Submission::PassThrough(id)
    }

    /// Move every scheduled job of `device` ahead of the others.
    pub fn reorder(&self, device: DeviceId) {
        self.shared
            .queues
            .lock()
            .scheduled
            .promote(|j| j.device() == device);
    }

    /// Cancel every job of `track`. Returns how many jobs were cancelled.
    ///
    /// Running conversions are killed and device copies deleted at once;
    /// the jobs themselves leave their queues on the next tick.
    pub fn cancel(&self, track: TrackId) -> usize {
        self.cancel_matching(|j| j.track_id() == track)
    }

    /// Cancel every job of `device` and drop its transfer state once drained.
    pub fn cancel_device(&self, device: DeviceId) -> usize {
        let cancelled = self.cancel_matching(|j| j.device() == device);
        let queues = self.shared.queues.lock();
        for entry in queues.devices.iter().filter(|d| d.device() == device) {
            entry.queues.lock().valid = false;
        }
        info!("Cancelled {} jobs of {}", cancelled, device);
        cancelled
    }

    /// Cancel every job.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.cancel_matching(|_| true);
        info!("Conversion manager shut down, {} jobs cancelled", cancelled);
        cancelled
    }

    fn cancel_matching(&self, pred: impl Fn(&ConversionJob) -> bool) -> usize {
        let mut copies: Vec<PathBuf> = Vec::new();
        let mut cancelled = 0;
        {
            let mut queues = self.shared.queues.lock();
            for queue in queues.all_queues_mut() {
                for job in queue.iter_mut().filter(|j| j.is_valid() && pred(&**j)) {
                    copies.extend(job.cancel());
                    cancelled += 1;
                }
            }
            for device in &queues.devices {
                let mut device_queues = device.queues.lock();
                for queue in device_queues.all_queues_mut() {
                    for job in queue.iter_mut().filter(|j| j.is_valid() && pred(&**j)) {
                        copies.extend(job.cancel());
                        cancelled += 1;
                    }
                }
            }
        }
        for copy in &copies {
            remove_quietly(copy);
        }
        cancelled
    }

    /// Let one more worker start even though the cache is over quota.
    ///
    /// Has no effect while a worker is running.
    pub fn continue_conversion(&self) {
        let queues = self.shared.queues.lock();
        if queues.active_workers == 0 {
            debug!("Forcing conversion to continue");
            self.shared.force_continue.store(true, Ordering::SeqCst);
        }
    }

    /// Prune the cache now.
    pub fn prune_cache(&self) -> PruneStats {
        self.shared.prune()
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Perform one scheduling step.
    ///
    /// Does nothing until the cache size is known. Otherwise starts at most
    /// one conversion worker, drains the conversion queues into the device
    /// queues, starts transfer workers and publishes finished work.
    pub fn tick(&self) {
        let _serialized = self.tick_lock.lock();
        let shared = &self.shared;
        if shared.cache_available && shared.quota.size().is_none() {
            trace!("Cache size unknown, skipping tick");
            return;
        }

        let converted = {
            let mut queues = shared.queues.lock();
            for job in queues.scheduled.extract_if(|j| !j.is_valid()) {
                discard(job);
            }
            self.start_conversion_worker(&mut queues);
            self.drain_failed(&mut queues);
            queues
                .converted
                .iter()
                .filter(|j| j.is_valid())
                .map(|j| ConvertedFacts {
                    id: j.id,
                    track: j.track_id(),
                    device: j.device(),
                    converted_file: j.converted_file.clone(),
                    size: j.converted_size,
                    gapless: j.gapless,
                })
                .collect::<Vec<_>>()
        };

        for slot in shared.log.take_dirty() {
            shared.events.emit(PipelineEvent::ConversionLogUpdated { slot });
        }

        for facts in &converted {
            self.publish_conversion(facts);
        }

        let devices = {
            let mut queues = shared.queues.lock();
            let published: HashSet<JobId> = converted.iter().map(|f| f.id).collect();
            let ready = queues
                .converted
                .extract_if(|j| !j.is_valid() || published.contains(&j.id));
            for job in ready {
                if job.is_valid() {
                    queues.finished.push(job);
                } else {
                    discard(job);
                }
            }
            self.drain_finished(&mut queues);
            queues.devices.clone()
        };

        for device in &devices {
            self.tick_device(device);
        }

        shared.queues.lock().devices.retain(|d| {
            let device_queues = d.queues.lock();
            device_queues.valid || !device_queues.is_drained()
        });
    }

    fn start_conversion_worker(&self, queues: &mut ConversionQueues) {
        let shared = &self.shared;
        if queues.scheduled.is_empty() {
            shared.force_continue.store(false, Ordering::SeqCst);
            return;
        }
        if !shared.cache_available
            || queues.active_workers >= shared.max_workers
            || shared.quota_blocks()
        {
            return;
        }

        let slot = queues.reserve_slot();
        debug!("Starting conversion worker {}", slot);
        if let Err(e) = spawn_conversion_worker(Arc::clone(shared), slot) {
            error!("Failed to start conversion worker: {}", e);
            queues.slots[slot] = false;
            queues.active_workers -= 1;
        }
    }

    fn drain_failed(&self, queues: &mut ConversionQueues) {
        for mut job in queues.failed.drain() {
            job.pid = None;
            job.worker_slot = None;
            if !job.is_valid() {
                discard(job);
                continue;
            }
            if job.status != ConversionStatus::Required {
                job.status = if job.must_convert {
                    ConversionStatus::RequiredFailed
                } else {
                    ConversionStatus::Failed
                };
            }
            self.report_error(&mut job);
            self.shared.events.emit(PipelineEvent::TrackUpdated {
                track: job.track_id(),
                update: TrackUpdate::StatusChanged { status: job.status },
            });
            queues.finished.push(job);
        }
    }

    /// Hand a conversion to the track and every record sharing its content.
    fn publish_conversion(&self, facts: &ConvertedFacts) {
        let Some(converted_file) = facts.converted_file.clone() else {
            return;
        };
        let mut records = self.shared.store.same_tracks(facts.track);
        if !records.iter().any(|r| r.id == facts.track) {
            records.push(TrackRef {
                id: facts.track,
                device: facts.device,
            });
        }

        let mut changed: Vec<DeviceId> = Vec::new();
        for record in records {
            let update = if record.id == facts.track {
                TrackUpdate::Converted {
                    converted_file: converted_file.clone(),
                    size: facts.size,
                    gapless: facts.gapless,
                    status: ConversionStatus::Converted,
                }
            } else {
                TrackUpdate::ConvertedFileShared {
                    converted_file: converted_file.clone(),
                }
            };
            self.shared.events.emit(PipelineEvent::TrackUpdated {
                track: record.id,
                update,
            });
            if !changed.contains(&record.device) {
                changed.push(record.device);
            }
        }
        for device in changed {
            self.shared.events.emit(PipelineEvent::LibraryChanged { device });
        }
    }

    fn drain_finished(&self, queues: &mut ConversionQueues) {
        for job in queues.finished.drain() {
            if !job.is_valid() {
                discard(job);
                continue;
            }
            let device = queues.device_entry(job.device(), self.shared.config.background_transfer);
            let mut device_queues = device.queues.lock();
            if job.status.is_transferable() {
                device_queues.scheduled.push(job);
            } else {
                device_queues.failed.push(job);
            }
        }
    }

    fn tick_device(&self, device: &Arc<DeviceTransfer>) {
        let copies: Vec<(JobId, TrackId, PathBuf)> = {
            let mut queues = device.queues.lock();
            for queue in queues.idle_queues_mut() {
                for job in queue.extract_if(|j| !j.is_valid()) {
                    discard(job);
                }
            }
            self.start_transfer_worker(device, &mut queues);
            self.report_disk_full(device, &mut queues);

            for mut job in queues.failed.drain() {
                self.report_error(&mut job);
                if let Some(dest) = job.dest_file.take() {
                    remove_quietly(&dest);
                }
                job.finish(JobOutcome::Failed);
                queues.finished.push(job);
            }

            for job in queues.transferred.extract_if(|j| j.dest_file.is_none()) {
                queues.failed.push(job);
            }
            queues
                .transferred
                .iter()
                .filter_map(|j| Some((j.id, j.track_id(), j.dest_file.clone()?)))
                .collect()
        };
        if copies.is_empty() {
            return;
        }

        let results: Vec<(JobId, PathBuf, Result<()>)> = copies
            .into_iter()
            .map(|(id, track, dest)| {
                let result = self.shared.store.finalize_copy(track, &dest);
                (id, dest, result)
            })
            .collect();

        let mut queues = device.queues.lock();
        for (id, dest, result) in results {
            let Some(mut job) = queues.transferred.remove(id) else {
                continue;
            };
            if !job.is_valid() {
                discard(job);
                continue;
            }
            match result {
                Ok(()) => {
                    job.finish(JobOutcome::Transferred);
                    self.shared.events.emit(PipelineEvent::TrackUpdated {
                        track: job.track_id(),
                        update: TrackUpdate::Transferred { destination: dest },
                    });
                    self.shared.events.emit(PipelineEvent::LibraryChanged {
                        device: job.device(),
                    });
                    queues.finished.push(job);
                }
                Err(e) => {
                    warn!("Could not record copy of {}: {}", job.track.display_name(), e);
                    job.set_error(e.to_string());
                    queues.failed.push(job);
                }
            }
        }
    }

    fn start_transfer_worker(&self, device: &Arc<DeviceTransfer>, queues: &mut TransferQueues) {
        if queues.scheduled.is_empty() || queues.worker_running || !queues.can_transfer() {
            return;
        }
        queues.worker_running = true;
        debug!("Starting transfer worker for {}", device.device());
        if let Err(e) = spawn_transfer_worker(Arc::clone(&self.shared), Arc::clone(device)) {
            error!("Failed to start transfer worker: {}", e);
            queues.worker_running = false;
        }
    }

    fn report_disk_full(&self, device: &DeviceTransfer, queues: &mut TransferQueues) {
        if queues.status != TransferStatus::DiskFull || queues.disk_full_reported {
            return;
        }
        queues.disk_full_reported = true;
        self.shared.events.emit(PipelineEvent::DiskFull {
            device: device.device(),
        });
        self.shared.events.warn(
            Some(device.device()),
            format!("{} is full; transfers are paused", device.device()),
        );
    }

    fn report_error(&self, job: &mut ConversionJob) {
        if job.error_reported {
            return;
        }
        if let Some(message) = job.error.as_ref() {
            self.shared.events.warn(Some(job.device()), message.clone());
        }
        job.error_reported = true;
    }

    /// Tick until nothing can make progress any more, or `timeout` elapses.
    ///
    /// Returns whether the pipeline went idle.
    pub fn run_until_idle(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            self.tick();
            if self.is_idle() {
                return true;
            }
            if started.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn is_idle(&self) -> bool {
        if self.shared.cache_available && self.shared.quota.size().is_none() {
            return false;
        }
        let queues = self.shared.queues.lock();
        let conversions_blocked = queues.scheduled.is_empty()
            || !self.shared.cache_available
            || self.shared.quota_blocks();
        if queues.active_workers > 0
            || !conversions_blocked
            || !queues.processing.is_empty()
            || !queues.failed.is_empty()
            || !queues.converted.is_empty()
            || !queues.finished.is_empty()
        {
            return false;
        }
        queues.devices.iter().all(|d| {
            let q = d.queues.lock();
            !q.worker_running
                && q.processing.is_empty()
                && q.transferred.is_empty()
                && q.failed.is_empty()
                && (q.scheduled.is_empty() || !q.can_transfer())
        })
    }

    // =========================================================================
    // Transfer
    // =========================================================================

    fn with_device<T>(&self, device: DeviceId, f: impl FnOnce(&mut TransferQueues) -> T) -> T {
        let mut queues = self.shared.queues.lock();
        let entry = queues.device_entry(device, self.shared.config.background_transfer);
        let mut device_queues = entry.queues.lock();
        f(&mut device_queues)
    }

    /// Allow or forbid background transfer to `device`.
    pub fn activate(&self, device: DeviceId, active: bool) {
        debug!("Background transfer to {} set to {}", device, active);
        self.with_device(device, |q| q.activated = active);
    }

    /// Restore the configured background transfer setting for `device`.
    pub fn reset_to_preference(&self, device: DeviceId) {
        self.activate(device, self.shared.config.background_transfer);
    }

    /// Resume transfers after the user freed space on `device`.
    ///
    /// Also lets one conversion run even if the cache is over quota.
    pub fn continue_after_disk_full(&self, device: DeviceId) {
        self.with_device(device, |q| {
            if q.status == TransferStatus::DiskFull {
                info!("Resuming transfers to {}", device);
                q.status = TransferStatus::Idle;
                q.disk_full_reported = false;
            }
        });
        self.continue_conversion();
    }

    /// Forget finished jobs once the device library has been saved.
    ///
    /// Their copies are permanent from now on; a later cancel leaves them.
    pub fn acknowledge(&self, device: DeviceId) -> usize {
        let Some(entry) = self.shared.queues.lock().find_device(device) else {
            return 0;
        };
        let acknowledged = entry.queues.lock().finished.drain().len();
        debug!("Acknowledged {} finished jobs of {}", acknowledged, device);
        acknowledged
    }

    /// Tracks of `device` that were neither converted nor copied.
    pub fn list_failed(&self, device: DeviceId) -> Vec<FailedTrack> {
        self.tick();
        let Some(entry) = self.shared.queues.lock().find_device(device) else {
            return Vec::new();
        };
        let queues = entry.queues.lock();
        queues
            .finished
            .iter()
            .filter(|j| j.is_valid() && j.dest_file.is_none())
            .map(|j| FailedTrack {
                track: j.track_id(),
                status: j.status,
                message: j.error.clone(),
            })
            .collect()
    }

    /// Retry every failed track of `device`.
    ///
    /// Transfer failures go back to the device queue; conversion failures are
    /// submitted again. Returns how many tracks were rescheduled.
    pub fn reschedule(&self, device: DeviceId) -> usize {
        self.tick();
        let Some(entry) = self.shared.queues.lock().find_device(device) else {
            return 0;
        };

        let mut requeued = 0;
        let resubmit: Vec<TrackRecord> = {
            let mut queues = entry.queues.lock();
            let failed = queues
                .finished
                .extract_if(|j| j.is_valid() && j.dest_file.is_none());
            let mut resubmit = Vec::new();
            for mut job in failed {
                if job.status.is_transferable() {
                    job.reactivate();
                    job.error = None;
                    job.error_reported = false;
                    queues.scheduled.push(job);
                    requeued += 1;
                } else {
                    resubmit.push(job.track.clone());
                }
            }
            resubmit
        };

        for track in &resubmit {
            match self.submit(track) {
                Ok(_) => requeued += 1,
                Err(e) => debug!("Resubmitting {} failed again: {}", track.display_name(), e),
            }
        }
        info!("Rescheduled {} failed tracks of {}", requeued, device);
        requeued
    }

    /// Status counts for `device`.
    pub fn status(&self, device: DeviceId) -> TransferSummary {
        let queues = self.shared.queues.lock();
        let converting = count_for(&queues.processing, device);
        let mut summary = TransferSummary {
            to_convert: count_for(&queues.scheduled, device) + converting,
            converting,
            to_transfer: count_for(&queues.converted, device) + count_for(&queues.finished, device),
            failed: count_for(&queues.failed, device),
            ..TransferSummary::default()
        };

        if let Some(entry) = queues.find_device(device) {
            let q = entry.queues.lock();
            let valid = |queue: &JobQueue| queue.iter().filter(|j| j.is_valid()).count();
            summary.status = q.status;
            summary.to_transfer += valid(&q.scheduled) + valid(&q.processing);
            summary.transferred += valid(&q.transferred);
            summary.failed += valid(&q.failed);
            for job in q.finished.iter().filter(|j| j.is_valid()) {
                if job.dest_file.is_some() {
                    summary.transferred += 1;
                } else {
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{MockFileClassifier, TableClassifier};
    use crate::config::FileTypeConfig;
    use crate::store::MockMediaStore;
    use tempfile::TempDir;

    fn manager(temp: &TempDir, types: Vec<FileTypeConfig>) -> ConversionManager {
        let mut config = PipelineConfig::new()
            .with_cache_dir(temp.path().join("cache"))
            .with_max_workers(1)
            .with_background_transfer(false);
        config.file_types = types;
        let classifier = Arc::new(TableClassifier::new(config.file_types.clone()));
        ConversionManager::new(config, classifier, Arc::new(MockMediaStore::new()))
            .expect("manager")
    }

    /// Every job id in every conversion and device queue.
    fn queued_job_ids(manager: &ConversionManager) -> Vec<JobId> {
        let queues = manager.shared.queues.lock();
        let mut ids: Vec<JobId> = queues
            .all_queues()
            .iter()
            .flat_map(|q| q.iter())
            .map(|j| j.id)
            .collect();
        for device in &queues.devices {
            let device_queues = device.queues.lock();
            ids.extend(
                device_queues
                    .all_queues()
                    .iter()
                    .flat_map(|q| q.iter())
                    .map(|j| j.id),
            );
        }
        ids
    }

    fn source(temp: &TempDir, name: &str) -> PathBuf {
        let path = temp.path().join(name);
        fs::write(&path, b"audio").expect("write source");
        path
    }

    #[test]
    fn test_local_and_transferred_tracks_are_skipped() {
        let temp = TempDir::new().expect("temp dir");
        let manager = manager(&temp, vec![]);
        let mut track = TrackRecord::new(1, 1, source(&temp, "a.mp3"));
        track.local = true;
        assert_eq!(manager.submit(&track).expect("submit"), Submission::Skipped);
        track.local = false;
        track.transferred = true;
        assert_eq!(manager.submit(&track).expect("submit"), Submission::Skipped);
    }

    #[test]
    fn test_unsupported_type_creates_no_job() {
        let temp = TempDir::new().expect("temp dir");
        let manager = manager(&temp, vec![FileTypeConfig::new("mp3", "mp3")]);
        let track = TrackRecord::new(1, 1, source(&temp, "a.xyz"));
        let err = manager.submit(&track).expect_err("unsupported");
        assert!(matches!(
            err,
            Error::Conversion(ConversionError::UnsupportedFileType { .. })
        ));
        assert_eq!(manager.status(DeviceId(1)), TransferSummary::default());
    }

    #[test]
    fn test_missing_source_lands_in_failed() {
        let temp = TempDir::new().expect("temp dir");
        let manager = manager(&temp, vec![FileTypeConfig::new("mp3", "mp3")]);
        let track = TrackRecord::new(1, 1, temp.path().join("gone.mp3"));
        assert!(manager.submit(&track).is_err());
        assert_eq!(manager.status(DeviceId(1)).failed, 1);
    }

    #[test]
    fn test_required_without_command_is_classified() {
        let temp = TempDir::new().expect("temp dir");
        let manager = manager(&temp, vec![FileTypeConfig::new("flac", "flac").required()]);
        let track = TrackRecord::new(7, 1, source(&temp, "a.flac"));
        let err = manager.submit(&track).expect_err("required");
        assert!(matches!(
            err,
            Error::Conversion(ConversionError::ConversionRequired { .. })
        ));

        assert!(manager.run_until_idle(Duration::from_secs(5)));
        let failed = manager.list_failed(DeviceId(1));
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].track, TrackId(7));
        assert_eq!(failed[0].status, ConversionStatus::Required);
    }

    #[test]
    fn test_pass_through_waits_for_activation() {
        let temp = TempDir::new().expect("temp dir");
        let manager = manager(&temp, vec![FileTypeConfig::new("mp3", "mp3").passthrough()]);
        let track = TrackRecord::new(1, 1, source(&temp, "a.mp3"));
        assert!(matches!(
            manager.submit(&track).expect("submit"),
            Submission::PassThrough(_)
        ));

        assert!(manager.run_until_idle(Duration::from_secs(5)));
        let summary = manager.status(DeviceId(1));
        assert_eq!(summary.to_transfer, 1);
        assert_eq!(summary.status, TransferStatus::Idle);
    }

    #[test]
    fn test_cancelled_pass_through_is_dropped() {
        let temp = TempDir::new().expect("temp dir");
        let manager = manager(&temp, vec![FileTypeConfig::new("mp3", "mp3")]);
        manager
            .submit(&TrackRecord::new(1, 1, source(&temp, "a.mp3")))
            .expect("submit");
        manager
            .submit(&TrackRecord::new(2, 1, source(&temp, "b.mp3")))
            .expect("submit");
        assert_eq!(manager.cancel(TrackId(1)), 1);
        assert_eq!(manager.cancel(TrackId(1)), 0);

        assert!(manager.run_until_idle(Duration::from_secs(5)));
        assert_eq!(manager.status(DeviceId(1)).to_transfer, 1);
    }

    #[test]
    fn test_classifier_mock_rejects_everything() {
        let temp = TempDir::new().expect("temp dir");
        let mut classifier = MockFileClassifier::new();
        classifier.expect_classify().returning(|_| None);
        let config = PipelineConfig::new().with_cache_dir(temp.path().join("cache"));
        let manager =
            ConversionManager::new(config, Arc::new(classifier), Arc::new(MockMediaStore::new()))
                .expect("manager");
        assert!(
            manager
                .submit(&TrackRecord::new(1, 1, source(&temp, "a.mp3")))
                .is_err()
        );
    }

    #[test]
    fn test_unwritable_cache_disables_conversion() {
        let temp = TempDir::new().expect("temp dir");
        let blocker = temp.path().join("file");
        fs::write(&blocker, b"x").expect("write");
        let mut config = PipelineConfig::new().with_cache_dir(blocker.join("cache"));
        config.file_types = vec![FileTypeConfig::new("flac", "flac").with_command("flac2mp3")];
        let classifier = Arc::new(TableClassifier::new(config.file_types.clone()));
        let manager = ConversionManager::new(config, classifier, Arc::new(MockMediaStore::new()))
            .expect("manager");

        assert!(!manager.is_cache_available());
        let err = manager
            .submit(&TrackRecord::new(1, 1, source(&temp, "a.flac")))
            .expect_err("no cache");
        assert!(matches!(err, Error::Cache(CacheError::Unavailable)));
        assert_eq!(manager.active_workers(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_every_job_sits_in_exactly_one_queue_after_each_tick() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().expect("temp dir");
        let script = temp.path().join("conv.sh");
        fs::write(
            &script,
            "#!/bin/sh\nif [ \"$1\" = \"-x\" ]; then echo mp3; exit 0; fi\n\
             while [ $# -gt 2 ]; do shift; done\ncp \"$2\" \"$1\"\n",
        )
        .expect("write script");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");

        let device_root = temp.path().join("devices");
        let mut store = MockMediaStore::new();
        store.expect_same_tracks().returning(|_| Vec::new());
        store.expect_destination_path().returning(move |device, source| {
            Ok(device_root
                .join(device.0.to_string())
                .join(source.file_name().unwrap_or_default()))
        });
        store.expect_finalize_copy().returning(|_, _| Ok(()));

        let mut config = PipelineConfig::new()
            .with_cache_dir(temp.path().join("cache"))
            .with_filename_template("%O")
            .with_max_workers(2);
        config.file_types = vec![
            FileTypeConfig::new("flac", "flac").with_command(script.to_string_lossy()),
            FileTypeConfig::new("mp3", "mp3").passthrough(),
        ];
        let classifier = Arc::new(TableClassifier::new(config.file_types.clone()));
        let manager =
            ConversionManager::new(config, classifier, Arc::new(store)).expect("manager");

        for id in 1..=6u64 {
            let name = if id % 3 == 0 { format!("t{id}.mp3") } else { format!("t{id}.flac") };
            let track = TrackRecord::new(id, 1 + id % 2, source(&temp, &name));
            manager.submit(&track).expect("submit");
        }

        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            manager.tick();
            let mut ids = queued_job_ids(&manager);
            assert_eq!(ids.len(), 6, "job lost or duplicated: {ids:?}");
            ids.sort();
            ids.dedup();
            assert_eq!(ids.len(), 6, "job queued twice");
            if manager.is_idle() {
                break;
            }
            assert!(Instant::now() < deadline, "pipeline did not go idle");
            std::thread::sleep(Duration::from_millis(5));
        }

        let transferred =
            manager.status(DeviceId(1)).transferred + manager.status(DeviceId(2)).transferred;
        assert_eq!(transferred, 6);
    }

    #[test]
    fn test_take_events_once() {
        let temp = TempDir::new().expect("temp dir");
        let manager = manager(&temp, vec![]);
        assert!(manager.take_events().is_some());
        assert!(manager.take_events().is_none());
    }

    #[test]
    fn test_activation_is_per_device() {
        let temp = TempDir::new().expect("temp dir");
        let manager = manager(&temp, vec![]);
        manager.activate(DeviceId(1), true);
        manager.activate(DeviceId(2), false);
        {
            let queues = manager.shared.queues.lock();
            assert!(queues.find_device(DeviceId(1)).expect("device 1").is_activated());
            assert!(!queues.find_device(DeviceId(2)).expect("device 2").is_activated());
        }
        manager.reset_to_preference(DeviceId(1));
        let queues = manager.shared.queues.lock();
        assert!(!queues.find_device(DeviceId(1)).expect("device 1").is_activated());
    }
}
