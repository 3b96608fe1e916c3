//! Transfer record (C2, spec §3): mutable per-transfer state owned
//! exclusively by a coordinator's serialized context.

use crate::error::TransferError;
use crate::events::{TransferInfo, UnitEventSink};
use crate::http_task::HttpTask;

/// Per-record lifecycle state (spec §4.5 state machine). `New` and
/// `Starting` are both "pre-start" per §3 (no task handle yet, or a task
/// handle that hasn't been resumed yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    New,
    Starting,
    Running,
    Suspended,
    Completed,
    Failed,
    Canceled,
}

impl RecordState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RecordState::Completed | RecordState::Failed | RecordState::Canceled
        )
    }

    pub fn is_suspended(self) -> bool {
        matches!(self, RecordState::Suspended)
    }

    pub fn is_running(self) -> bool {
        matches!(self, RecordState::Running)
    }
}

/// A single transfer's mutable state, generic over its descriptor type
/// (`DownloadDescriptor` or `UploadDescriptor`).
pub(crate) struct Record<D> {
    pub id: String,
    pub descriptor: D,
    pub current_bytes: f64,
    pub total_bytes: f64,
    pub error: Option<TransferError>,
    pub resume_token: Option<Vec<u8>>,
    pub state: RecordState,
    pub task: Option<Box<dyn HttpTask>>,
    pub start_emitted: bool,
    pub sink: UnitEventSink,
}

impl<D> Record<D> {
    pub fn new(id: String, descriptor: D, sink: UnitEventSink) -> Self {
        Self {
            id,
            descriptor,
            current_bytes: 0.0,
            total_bytes: 0.0,
            error: None,
            resume_token: None,
            state: RecordState::New,
            task: None,
            start_emitted: false,
            sink,
        }
    }

    pub fn info(&self, index: usize) -> TransferInfo {
        TransferInfo {
            index,
            current_bytes: self.current_bytes,
            total_bytes: self.total_bytes,
            is_downloading: self.state.is_running(),
            is_suspended: self.state.is_suspended(),
            is_completed: self.state == RecordState::Completed,
            error: self.error.as_ref().map(|e| e.to_string()),
        }
    }
}
