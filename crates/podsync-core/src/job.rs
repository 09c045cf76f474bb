//! Conversion jobs and the queues that hold them.
//!
//! A [`ConversionJob`] tracks one track through conversion and transfer. It
//! lives in exactly one [`JobQueue`] at a time; moving it between queues is a
//! move of the value, so duplication cannot happen.
//!
//! Queues are FIFO: new jobs are pushed at the front and workers take the job
//! that has waited longest from the back.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::command::ConversionCommand;
use crate::track::{DeviceId, GaplessData, TrackId, TrackRecord};

/// Identifier of a job, unique per manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// Conversion classification of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStatus {
    /// No conversion needed; the original file is transferred.
    #[default]
    Inactive,
    /// Waiting for or undergoing conversion.
    Scheduled,
    /// Converted successfully.
    Converted,
    /// Optional conversion failed.
    Failed,
    /// Conversion is mandatory but no command is configured.
    Required,
    /// Mandatory conversion failed.
    RequiredFailed,
    /// The conversion process was killed by a cancellation.
    Killed,
}

impl ConversionStatus {
    /// Whether the job may proceed to transfer with this status.
    #[must_use]
    pub const fn is_transferable(self) -> bool {
        matches!(self, Self::Inactive | Self::Converted)
    }

    /// Whether this is a "required" classification the user must act on.
    #[must_use]
    pub const fn is_required(self) -> bool {
        matches!(self, Self::Required | Self::RequiredFailed)
    }
}

impl fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "Not converted"),
            Self::Scheduled => write!(f, "Scheduled"),
            Self::Converted => write!(f, "Converted"),
            Self::Failed => write!(f, "Conversion failed"),
            Self::Required => write!(f, "Conversion required"),
            Self::RequiredFailed => write!(f, "Required conversion failed"),
            Self::Killed => write!(f, "Conversion killed"),
        }
    }
}

/// Final outcome of a job that reached a device's finished queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    /// Copied onto the device.
    Transferred,
    /// Could not be converted or copied.
    Failed,
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// In flight.
    Active,
    /// The owning track went away; every side effect must be undone.
    Cancelled,
    /// Done, waiting for acknowledgement.
    Terminal(JobOutcome),
}

/// Shared cancellation flag a worker can poll without taking a lock.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One track on its way through conversion and transfer.
#[derive(Debug)]
pub struct ConversionJob {
    /// Job identity.
    pub id: JobId,
    /// Track snapshot taken at submit time.
    pub track: TrackRecord,
    state: JobState,
    token: CancelToken,
    /// Conversion classification.
    pub status: ConversionStatus,
    /// Whether the device cannot play the original format.
    pub must_convert: bool,
    /// Conversion command, when the type has one.
    pub command: Option<ConversionCommand>,
    /// Extension of converted files.
    pub extension: Option<String>,
    /// Templated path root under the cache directory.
    pub fname_root: Option<PathBuf>,
    /// Working or finished converted file.
    pub converted_file: Option<PathBuf>,
    /// Size of the converted file.
    pub converted_size: u64,
    /// Gapless facts of the converted file.
    pub gapless: Option<GaplessData>,
    /// Copy on the device.
    pub dest_file: Option<PathBuf>,
    /// Pid of the running conversion process.
    pub pid: Option<u32>,
    /// Worker slot currently converting this job.
    pub worker_slot: Option<usize>,
    /// Last error message.
    pub error: Option<String>,
    /// Whether `error` has already been published as a warning.
    pub error_reported: bool,
}

impl ConversionJob {
    /// Create an active job for `track`.
    #[must_use]
    pub fn new(id: JobId, track: TrackRecord) -> Self {
        let converted_file = track.converted_file.clone();
        Self {
            id,
            track,
            state: JobState::Active,
            token: CancelToken::default(),
            status: ConversionStatus::Inactive,
            must_convert: false,
            command: None,
            extension: None,
            fname_root: None,
            converted_file,
            converted_size: 0,
            gapless: None,
            dest_file: None,
            pid: None,
            worker_slot: None,
            error: None,
            error_reported: false,
        }
    }

    /// Owning device.
    #[must_use]
    pub const fn device(&self) -> DeviceId {
        self.track.device
    }

    /// Track identity.
    #[must_use]
    pub const fn track_id(&self) -> TrackId {
        self.track.id
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn state(&self) -> JobState {
        self.state
    }

    /// Whether the job has not been cancelled.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        !matches!(self.state, JobState::Cancelled)
    }

    /// Token mirrored from the state for lock-free polling.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Mark the job terminal. A cancelled job stays cancelled.
    pub fn finish(&mut self, outcome: JobOutcome) {
        if self.is_valid() {
            self.state = JobState::Terminal(outcome);
        }
    }

    /// Record an error message.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.error_reported = false;
    }

    /// Return a terminal job to the active state for another attempt.
    pub fn reactivate(&mut self) {
        if matches!(self.state, JobState::Terminal(_)) {
            self.state = JobState::Active;
        }
    }

    /// Cancel the job.
    ///
    /// Only the state and the cancel token change; a running conversion sees
    /// the token and stops its process group itself. Returns the device copy, which the caller deletes after
    /// releasing its locks. The job stays in its queue until a worker or the
    /// next tick discards it.
    pub fn cancel(&mut self) -> Option<PathBuf> {
        if !self.is_valid() {
            return None;
        }
        debug!("Cancelling {} for {}", self.id, self.track.id);
        self.state = JobState::Cancelled;
        self.token.cancel();
        if self.pid.is_some() {
            self.status = ConversionStatus::Killed;
        }
        self.dest_file.take()
    }
}

/// FIFO queue of jobs.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<ConversionJob>,
}

impl JobQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a job behind every waiting job.
    pub fn push(&mut self, job: ConversionJob) {
        self.jobs.push_front(job);
    }

    /// Put a job back so that it is taken next.
    pub fn push_next(&mut self, job: ConversionJob) {
        self.jobs.push_back(job);
    }

    /// Take the job that has waited longest.
    pub fn pop(&mut self) -> Option<ConversionJob> {
        self.jobs.pop_back()
    }

    /// Number of queued jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs in processing order, next first.
    pub fn iter(&self) -> impl Iterator<Item = &ConversionJob> {
        self.jobs.iter().rev()
    }

    /// Mutable jobs in processing order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConversionJob> {
        self.jobs.iter_mut().rev()
    }

    /// Remove a job by id.
    pub fn remove(&mut self, id: JobId) -> Option<ConversionJob> {
        let index = self.jobs.iter().position(|j| j.id == id)?;
        self.jobs.remove(index)
    }

    /// Get a job by id.
    pub fn get_mut(&mut self, id: JobId) -> Option<&mut ConversionJob> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    /// Take every job, oldest first.
    pub fn drain(&mut self) -> Vec<ConversionJob> {
        self.jobs.drain(..).rev().collect()
    }

    /// Remove and return the jobs matching `pred`, oldest first.
    pub fn extract_if(&mut self, mut pred: impl FnMut(&ConversionJob) -> bool) -> Vec<ConversionJob> {
        let (taken, kept): (VecDeque<_>, VecDeque<_>) = self.jobs.drain(..).partition(|j| pred(j));
        self.jobs = kept;
        taken.into_iter().rev().collect()
    }

    /// Move all jobs matching `pred` ahead of the others.
    ///
    /// Relative order inside both groups is kept.
    pub fn promote(&mut self, mut pred: impl FnMut(&ConversionJob) -> bool) {
        let (promoted, rest): (VecDeque<_>, VecDeque<_>) = self.jobs.drain(..).partition(|j| pred(j));
        self.jobs = rest;
        self.jobs.extend(promoted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: u64, device: u64) -> ConversionJob {
        ConversionJob::new(JobId(id), TrackRecord::new(id, device, format!("/m/{id}.flac")))
    }

    fn order(queue: &JobQueue) -> Vec<u64> {
        queue.iter().map(|j| j.id.0).collect()
    }

    #[test]
    fn test_queue_is_fifo() {
        let mut queue = JobQueue::new();
        for id in 1..=3 {
            queue.push(job(id, 1));
        }
        assert_eq!(order(&queue), vec![1, 2, 3]);
        assert_eq!(queue.pop().map(|j| j.id), Some(JobId(1)));
        assert_eq!(queue.pop().map(|j| j.id), Some(JobId(2)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_push_next_is_taken_first() {
        let mut queue = JobQueue::new();
        queue.push(job(1, 1));
        queue.push_next(job(2, 1));
        assert_eq!(queue.pop().map(|j| j.id), Some(JobId(2)));
    }

    #[test]
    fn test_promote_is_stable_partition() {
        let mut queue = JobQueue::new();
        for (id, device) in [(1, 1), (2, 2), (3, 1), (4, 2), (5, 1), (6, 2)] {
            queue.push(job(id, device));
        }
        queue.promote(|j| j.device() == DeviceId(2));
        assert_eq!(order(&queue), vec![2, 4, 6, 1, 3, 5]);
    }

    #[test]
    fn test_extract_if_and_remove() {
        let mut queue = JobQueue::new();
        for id in 1..=4 {
            queue.push(job(id, id % 2));
        }
        let odd = queue.extract_if(|j| j.device() == DeviceId(1));
        assert_eq!(odd.iter().map(|j| j.id.0).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(order(&queue), vec![2, 4]);

        assert!(queue.remove(JobId(4)).is_some());
        assert!(queue.remove(JobId(4)).is_none());
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel_is_monotonic() {
        let mut j = job(1, 1);
        let token = j.cancel_token();
        assert!(j.is_valid());
        j.cancel();
        assert!(!j.is_valid());
        assert!(token.is_cancelled());
        j.finish(JobOutcome::Transferred);
        assert_eq!(j.state(), JobState::Cancelled);
    }

    #[test]
    fn test_cancel_removes_device_copy() {
        let temp = tempfile::TempDir::new().expect("temp dir");
        let dest = temp.path().join("copy.mp3");
        std::fs::write(&dest, b"data").expect("write");

        let mut j = job(1, 1);
        j.dest_file = Some(dest.clone());
        j.finish(JobOutcome::Transferred);
        assert_eq!(j.cancel(), Some(dest.clone()));
        assert!(j.dest_file.is_none());
        assert_eq!(j.cancel(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_cancel_leaves_process_to_the_worker() {
        let cmd = ConversionCommand::parse("sh -c 'sleep 30' conv").expect("parse");
        let mut child = cmd
            .spawn(
                &crate::track::TrackTags::default(),
                std::path::Path::new("/dev/null"),
                std::path::Path::new("/dev/null"),
            )
            .expect("spawn");

        let mut j = job(1, 1);
        let token = j.cancel_token();
        j.pid = Some(child.id());
        assert_eq!(j.cancel(), None);
        assert_eq!(j.status, ConversionStatus::Killed);
        assert!(token.is_cancelled());
        assert!(child.try_wait().expect("try_wait").is_none());

        child.kill().expect("kill");
        child.wait().expect("wait");
    }

    #[test]
    fn test_status_classification() {
        assert!(ConversionStatus::Inactive.is_transferable());
        assert!(ConversionStatus::Converted.is_transferable());
        assert!(!ConversionStatus::RequiredFailed.is_transferable());
        assert!(ConversionStatus::Required.is_required());
        assert!(!ConversionStatus::Failed.is_required());
        assert_eq!(ConversionStatus::RequiredFailed.to_string(), "Required conversion failed");
    }
}
