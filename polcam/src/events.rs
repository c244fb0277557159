//! Typed events exchanged over the [`EventBus`](crate::EventBus)

use crate::types::{ParameterUpdate, ProcessingMode, ProcessingResult};
use polmath::{ImageBuffer, Roi};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Closed set of event kinds; subscriptions are keyed by kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CameraConnected,
    CameraDisconnected,
    FrameCaptured,
    FrameProcessed,
    ParameterChanged,
    ErrorOccurred,
    DisplayModeChanged,
    ProcessingStarted,
    ProcessingCompleted,
    StreamingStarted,
    StreamingStopped,
    RawFileLoaded,
    StatusMessageUpdate,
    StatusMessageClear,
    RoiChanged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterChange {
    Updated(ParameterUpdate),
    /// Every parameter returned to its default
    Reset,
}

/// Event data, one variant per kind
#[derive(Debug, Clone)]
pub enum EventPayload {
    CameraConnected {
        device: String,
    },
    CameraDisconnected,
    FrameCaptured {
        frame: Arc<ImageBuffer>,
    },
    FrameProcessed {
        result: Arc<ProcessingResult>,
        processing_time: Duration,
    },
    ParameterChanged {
        change: ParameterChange,
    },
    ErrorOccurred {
        source: String,
        message: String,
    },
    DisplayModeChanged {
        mode: ProcessingMode,
    },
    ProcessingStarted {
        mode: ProcessingMode,
        priority: i32,
        submitted_at: Instant,
    },
    ProcessingCompleted {
        mode: ProcessingMode,
    },
    StreamingStarted,
    StreamingStopped,
    RawFileLoaded {
        path: PathBuf,
        width: usize,
        height: usize,
    },
    StatusMessageUpdate {
        message: String,
        timeout: Option<Duration>,
    },
    StatusMessageClear,
    RoiChanged {
        roi: Option<Roi>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::CameraConnected { .. } => EventKind::CameraConnected,
            EventPayload::CameraDisconnected => EventKind::CameraDisconnected,
            EventPayload::FrameCaptured { .. } => EventKind::FrameCaptured,
            EventPayload::FrameProcessed { .. } => EventKind::FrameProcessed,
            EventPayload::ParameterChanged { .. } => EventKind::ParameterChanged,
            EventPayload::ErrorOccurred { .. } => EventKind::ErrorOccurred,
            EventPayload::DisplayModeChanged { .. } => EventKind::DisplayModeChanged,
            EventPayload::ProcessingStarted { .. } => EventKind::ProcessingStarted,
            EventPayload::ProcessingCompleted { .. } => EventKind::ProcessingCompleted,
            EventPayload::StreamingStarted => EventKind::StreamingStarted,
            EventPayload::StreamingStopped => EventKind::StreamingStopped,
            EventPayload::RawFileLoaded { .. } => EventKind::RawFileLoaded,
            EventPayload::StatusMessageUpdate { .. } => EventKind::StatusMessageUpdate,
            EventPayload::StatusMessageClear => EventKind::StatusMessageClear,
            EventPayload::RoiChanged { .. } => EventKind::RoiChanged,
        }
    }

    pub fn error<S: Into<String>, M: Into<String>>(source: S, message: M) -> Self {
        EventPayload::ErrorOccurred {
            source: source.into(),
            message: message.into(),
        }
    }
}

/// Immutable once published
#[derive(Debug, Clone)]
pub struct Event {
    pub payload: EventPayload,
    pub timestamp: SystemTime,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            timestamp: SystemTime::now(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

impl From<EventPayload> for Event {
    fn from(payload: EventPayload) -> Self {
        Event::new(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_payload() {
        let event = Event::new(EventPayload::DisplayModeChanged {
            mode: ProcessingMode::QuadGray,
        });
        assert_eq!(event.kind(), EventKind::DisplayModeChanged);

        let event: Event = EventPayload::error("processing", "bad frame").into();
        assert_eq!(event.kind(), EventKind::ErrorOccurred);
        match event.payload {
            EventPayload::ErrorOccurred { source, message } => {
                assert_eq!(source, "processing");
                assert_eq!(message, "bad frame");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
