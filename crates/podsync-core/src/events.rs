//! Events published by the pipeline.
//!
//! The manager never calls into the library or the user interface directly.
//! It publishes [`PipelineEvent`]s on an unbounded channel and the subscriber
//! applies them on its own thread.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::job::ConversionStatus;
use crate::track::{DeviceId, GaplessData, TrackId};

/// Change to apply to a track record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackUpdate {
    /// The track's own conversion finished.
    Converted {
        /// Converted file in the cache.
        converted_file: PathBuf,
        /// Size of the converted file.
        size: u64,
        /// Gapless facts, when they could be read.
        gapless: Option<GaplessData>,
        /// Resulting conversion status.
        status: ConversionStatus,
    },
    /// The conversion classification changed without producing a file.
    StatusChanged {
        /// New conversion status.
        status: ConversionStatus,
    },
    /// Another record with the same content may reuse this converted file.
    ConvertedFileShared {
        /// Converted file in the cache.
        converted_file: PathBuf,
    },
    /// The track has been copied onto its device.
    Transferred {
        /// Path on the device.
        destination: PathBuf,
    },
}

/// Event published by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// A track record must be updated.
    TrackUpdated {
        /// Affected track.
        track: TrackId,
        /// What changed.
        update: TrackUpdate,
    },
    /// A library has unsaved changes.
    LibraryChanged {
        /// Affected library.
        device: DeviceId,
    },
    /// A cancelled job's converted output must be removed through the library.
    RemoveTrack {
        /// Cancelled track.
        track: TrackId,
        /// Converted file left behind, if any.
        converted_file: Option<PathBuf>,
    },
    /// A user-facing failure message.
    Warning {
        /// Library concerned, when known.
        device: Option<DeviceId>,
        /// Message text.
        message: String,
    },
    /// A device ran out of space; its transfers are paused.
    DiskFull {
        /// Affected device.
        device: DeviceId,
    },
    /// A worker log page received new output.
    ConversionLogUpdated {
        /// Worker slot.
        slot: usize,
    },
}

/// Sending half of the event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl EventSink {
    /// Create a sink and the matching receiver.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publish an event. A closed channel is ignored.
    pub fn emit(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            trace!("Pipeline event dropped, no subscriber");
        }
    }

    /// Publish a warning.
    pub fn warn(&self, device: Option<DeviceId>, message: impl Into<String>) {
        self.emit(PipelineEvent::Warning {
            device,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_receive() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(PipelineEvent::LibraryChanged {
            device: DeviceId(3),
        });
        sink.warn(None, "oops");

        assert_eq!(
            rx.try_recv().expect("first event"),
            PipelineEvent::LibraryChanged {
                device: DeviceId(3)
            }
        );
        assert!(matches!(
            rx.try_recv().expect("second event"),
            PipelineEvent::Warning { message, .. } if message == "oops"
        ));
    }

    #[test]
    fn test_emit_without_receiver_is_silent() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.warn(Some(DeviceId(1)), "nobody listens");
    }

    #[test]
    fn test_event_serializes() {
        let event = PipelineEvent::DiskFull {
            device: DeviceId(9),
        };
        let json = serde_json::to_string(&event).expect("serialize");
        let back: PipelineEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, event);
    }
}
