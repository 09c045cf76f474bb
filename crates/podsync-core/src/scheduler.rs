//! Periodic driver for [`ConversionManager::tick`].
//!
//! The manager itself owns no timer. [`spawn_scheduler`] runs a tokio task
//! that ticks it at a fixed period until the returned handle is stopped.
//! Each tick runs on the blocking pool because it may wait on queue locks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::manager::ConversionManager;

/// Handle for controlling a running scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SchedulerHandle {
    /// Stop the scheduler. Workers already running finish their current job.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Tick `manager` every `period` on the current tokio runtime.
#[must_use]
pub fn spawn_scheduler(manager: Arc<ConversionManager>, period: Duration) -> SchedulerHandle {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Scheduler shutting down");
                    break;
                }
                _ = timer.tick() => {
                    let manager = Arc::clone(&manager);
                    if let Err(e) = tokio::task::spawn_blocking(move || manager.tick()).await {
                        warn!("Scheduling tick panicked: {}", e);
                    }
                }
            }
        }
    });

    SchedulerHandle { shutdown_tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::TableClassifier;
    use crate::config::{FileTypeConfig, PipelineConfig};
    use crate::events::PipelineEvent;
    use crate::job::ConversionStatus;
    use crate::store::MockMediaStore;
    use crate::track::{DeviceId, TrackRecord};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_scheduler_drains_failed_jobs() {
        let temp = TempDir::new().expect("temp dir");
        let mut config = PipelineConfig::new()
            .with_cache_dir(temp.path().join("cache"))
            .with_background_transfer(false);
        config.file_types = vec![FileTypeConfig::new("flac", "flac").required()];
        let classifier = Arc::new(TableClassifier::new(config.file_types.clone()));
        let manager = Arc::new(
            ConversionManager::new(config, classifier, Arc::new(MockMediaStore::new()))
                .expect("manager"),
        );
        let mut events = manager.take_events().expect("receiver");

        let source = temp.path().join("a.flac");
        std::fs::write(&source, b"audio").expect("write");
        assert!(manager.submit(&TrackRecord::new(1, 1, source)).is_err());

        let handle = spawn_scheduler(Arc::clone(&manager), Duration::from_millis(10));

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(PipelineEvent::TrackUpdated { update, .. }) => return Some(update),
                    Some(_) => {}
                    None => return None,
                }
            }
        })
        .await
        .expect("timeout waiting for event")
        .expect("channel closed");

        assert_eq!(
            event,
            crate::events::TrackUpdate::StatusChanged {
                status: ConversionStatus::Required
            }
        );
        handle.stop().await;
        assert_eq!(manager.status(DeviceId(1)).failed, 1);
    }

    #[tokio::test]
    async fn test_handle_stop_twice() {
        let temp = TempDir::new().expect("temp dir");
        let config = PipelineConfig::new().with_cache_dir(temp.path().join("cache"));
        let manager = Arc::new(
            ConversionManager::new(
                config,
                Arc::new(TableClassifier::default()),
                Arc::new(MockMediaStore::new()),
            )
            .expect("manager"),
        );
        let handle = spawn_scheduler(manager, Duration::from_millis(10));
        let clone = handle.clone();
        handle.stop().await;
        clone.stop().await;
    }
}
