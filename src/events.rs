//! Two-level event-stream protocol (C3, spec §4.1) plus the channel plumbing
//! that carries it: the coordinator owns the producing end (`*Sink`), the
//! caller owns the receiving end (`*Stream`) — the same ownership split as
//! `move_transfer/worker.rs`'s queue-signal channel, generalized to a full
//! event stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::TransferError;

/// Read-only snapshot of a transfer record, the `TransferRecord` payload
/// referenced throughout spec §4.1.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TransferInfo {
    pub index: usize,
    pub current_bytes: f64,
    pub total_bytes: f64,
    pub is_downloading: bool,
    pub is_suspended: bool,
    pub is_completed: bool,
    pub error: Option<String>,
}

/// Per-record event (§4.1).
#[derive(Debug, Clone)]
pub enum UnitEvent {
    /// Emitted exactly once, immediately before the record's task is
    /// resumed for the first time.
    Start { index: usize, info: TransferInfo },
    /// Emitted subject to the progress throttle (C4).
    Update { current: f64, total: f64 },
    /// Terminal. `body` is the downloaded file (downloads) or the
    /// accumulated response body (uploads).
    Completed { body: Bytes, info: TransferInfo },
}

/// Per-batch event (§4.1).
pub enum AggregateEvent {
    /// Emitted once, before any unit event.
    Start { records: Vec<TransferInfo> },
    /// One per record, delivered in submission order, wrapping that
    /// record's own stream.
    Unit { index: usize, stream: UnitEventStream },
    /// Emitted once, after every unit stream has completed successfully.
    AllCompleted { records: Vec<TransferInfo> },
}

type UnitItem = Result<UnitEvent, TransferError>;
type AggregateItem = Result<AggregateEvent, TransferError>;

/// Write end of a unit stream; owned exclusively by the coordinator.
#[derive(Clone)]
pub(crate) struct UnitEventSink {
    tx: mpsc::Sender<UnitItem>,
}

/// Read end of a unit stream; returned to callers from `events(..)`.
pub struct UnitEventStream {
    rx: mpsc::Receiver<UnitItem>,
}

pub(crate) fn unit_event_channel(buffer: usize) -> (UnitEventSink, UnitEventStream) {
    let (tx, rx) = mpsc::channel(buffer);
    (UnitEventSink { tx }, UnitEventStream { rx })
}

impl UnitEventSink {
    pub(crate) async fn emit_start(&self, index: usize, info: TransferInfo) {
        let _ = self.tx.send(Ok(UnitEvent::Start { index, info })).await;
    }

    pub(crate) async fn emit_update(&self, current: f64, total: f64) {
        let _ = self.tx.send(Ok(UnitEvent::Update { current, total })).await;
    }

    pub(crate) async fn emit_completed(&self, body: Bytes, info: TransferInfo) {
        let _ = self.tx.send(Ok(UnitEvent::Completed { body, info })).await;
    }

    pub(crate) async fn fail(&self, error: TransferError) {
        let _ = self.tx.send(Err(error)).await;
    }
}

impl UnitEventStream {
    /// Await the next event. Returns `None` once the stream has finished.
    pub async fn next(&mut self) -> Option<UnitItem> {
        self.rx.recv().await
    }
}

impl futures_util::Stream for UnitEventStream {
    type Item = UnitItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Write end of the aggregate stream; owned exclusively by the coordinator.
pub(crate) struct AggregateEventSink {
    tx: mpsc::Sender<AggregateItem>,
}

/// Read end of the aggregate stream; returned to callers from the
/// multi-transfer `events(..)` overload.
pub struct AggregateEventStream {
    rx: mpsc::Receiver<AggregateItem>,
}

pub(crate) fn aggregate_event_channel(buffer: usize) -> (AggregateEventSink, AggregateEventStream) {
    let (tx, rx) = mpsc::channel(buffer);
    (AggregateEventSink { tx }, AggregateEventStream { rx })
}

impl AggregateEventSink {
    pub(crate) async fn emit_start(&self, records: Vec<TransferInfo>) {
        let _ = self.tx.send(Ok(AggregateEvent::Start { records })).await;
    }

    pub(crate) async fn emit_unit(&self, index: usize, stream: UnitEventStream) {
        let _ = self.tx.send(Ok(AggregateEvent::Unit { index, stream })).await;
    }

    pub(crate) async fn emit_all_completed(&self, records: Vec<TransferInfo>) {
        let _ = self
            .tx
            .send(Ok(AggregateEvent::AllCompleted { records }))
            .await;
    }

    pub(crate) async fn fail(&self, error: TransferError) {
        let _ = self.tx.send(Err(error)).await;
    }
}

impl AggregateEventStream {
    pub async fn next(&mut self) -> Option<AggregateItem> {
        self.rx.recv().await
    }
}

impl futures_util::Stream for AggregateEventStream {
    type Item = AggregateItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(index: usize) -> TransferInfo {
        TransferInfo {
            index,
            current_bytes: 0.0,
            total_bytes: 0.0,
            is_downloading: false,
            is_suspended: false,
            is_completed: false,
            error: None,
        }
    }

    #[tokio::test]
    async fn unit_stream_delivers_events_in_order() {
        let (sink, mut stream) = unit_event_channel(8);
        sink.emit_start(0, info(0)).await;
        sink.emit_update(10.0, 100.0).await;
        sink.emit_completed(Bytes::from_static(b"hi"), info(0)).await;
        drop(sink);

        assert!(matches!(stream.next().await, Some(Ok(UnitEvent::Start { .. }))));
        assert!(matches!(stream.next().await, Some(Ok(UnitEvent::Update { .. }))));
        assert!(matches!(
            stream.next().await,
            Some(Ok(UnitEvent::Completed { .. }))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn unit_stream_can_terminate_with_error() {
        let (sink, mut stream) = unit_event_channel(8);
        sink.emit_start(0, info(0)).await;
        sink.fail(TransferError::ServerError(500)).await;
        drop(sink);

        assert!(matches!(stream.next().await, Some(Ok(UnitEvent::Start { .. }))));
        assert_eq!(stream.next().await, Some(Err(TransferError::ServerError(500))));
    }
}
