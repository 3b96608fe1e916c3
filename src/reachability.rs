//! Reachability observer (C9, spec §4.7): emits a connectivity-status event
//! stream by polling a pluggable probe. Real path monitoring is an external
//! collaborator (§1); this module only owns the change-detection and event
//! framing around whatever probe the host application supplies, using
//! `tokio::time::interval` as a stand-in for a native OS path monitor.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// `(connected, is_cellular)` as reported by the host platform.
pub trait ReachabilityProbe: Send + Sync + 'static {
    fn probe(&self) -> (bool, bool);
}

/// Trivial probe that always reports a connected, non-cellular link. Useful
/// as a default for hosts with no real path monitor wired up yet.
pub struct AlwaysOnline;

impl ReachabilityProbe for AlwaysOnline {
    fn probe(&self) -> (bool, bool) {
        (true, false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityEvent {
    /// Emitted exactly once, on the first probe reading.
    Start { connected: bool, cellular: bool },
    /// Emitted only when `connected` changes from the previous reading.
    UpdateStatus { connected: bool },
    /// Emitted only when `cellular` changes from the previous reading.
    UpdateInterfaceType { cellular: bool },
}

pub struct ReachabilityStream {
    rx: mpsc::Receiver<ReachabilityEvent>,
}

impl ReachabilityStream {
    pub async fn next(&mut self) -> Option<ReachabilityEvent> {
        self.rx.recv().await
    }
}

impl futures_util::Stream for ReachabilityStream {
    type Item = ReachabilityEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Single-shot: once `stop()` has been called, `start()` no longer spawns a
/// new monitor on the same instance (§4.7).
pub struct ReachabilityObserver {
    cancel: Arc<AtomicBool>,
    started: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ReachabilityObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl ReachabilityObserver {
    pub fn new() -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    /// Starts polling `probe` every `poll_interval`. Returns an empty,
    /// already-finished stream if this instance was already started (or
    /// already stopped).
    pub async fn start(
        &self,
        probe: impl ReachabilityProbe,
        poll_interval: Duration,
    ) -> ReachabilityStream {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let (_tx, rx) = mpsc::channel(1);
            return ReachabilityStream { rx };
        }

        let (tx, rx) = mpsc::channel(16);
        let cancel = self.cancel.clone();
        let probe = Box::new(probe);
        let handle = tokio::spawn(run_poll_loop(cancel, probe, poll_interval, tx));
        *self.handle.lock().await = Some(handle);
        ReachabilityStream { rx }
    }

    /// Cancels the underlying monitor. Idempotent.
    pub async fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }
}

async fn run_poll_loop(
    cancel: Arc<AtomicBool>,
    probe: Box<dyn ReachabilityProbe>,
    poll_interval: Duration,
    tx: mpsc::Sender<ReachabilityEvent>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    let mut last: Option<(bool, bool)> = None;

    loop {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        ticker.tick().await;
        if cancel.load(Ordering::SeqCst) {
            return;
        }

        let (connected, cellular) = probe.probe();
        match last {
            None => {
                if tx
                    .send(ReachabilityEvent::Start { connected, cellular })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Some((prev_connected, prev_cellular)) => {
                if connected != prev_connected
                    && tx
                        .send(ReachabilityEvent::UpdateStatus { connected })
                        .await
                        .is_err()
                {
                    return;
                }
                if cellular != prev_cellular
                    && tx
                        .send(ReachabilityEvent::UpdateInterfaceType { cellular })
                        .await
                        .is_err()
                {
                    return;
                }
            }
        }
        last = Some((connected, cellular));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Sequence {
        readings: Vec<(bool, bool)>,
        index: AtomicUsize,
    }

    impl ReachabilityProbe for Sequence {
        fn probe(&self) -> (bool, bool) {
            let i = self.index.fetch_add(1, Ordering::SeqCst);
            self.readings[i.min(self.readings.len() - 1)]
        }
    }

    #[tokio::test]
    async fn emits_start_once_then_only_on_change() {
        let probe = Sequence {
            readings: vec![(true, false), (true, false), (false, false), (false, true)],
            index: AtomicUsize::new(0),
        };
        let observer = ReachabilityObserver::new();
        let mut stream = observer.start(probe, Duration::from_millis(5)).await;

        assert_eq!(
            stream.next().await,
            Some(ReachabilityEvent::Start {
                connected: true,
                cellular: false
            })
        );
        // second reading is identical: no event until the third reading flips `connected`.
        assert_eq!(
            stream.next().await,
            Some(ReachabilityEvent::UpdateStatus { connected: false })
        );
        assert_eq!(
            stream.next().await,
            Some(ReachabilityEvent::UpdateInterfaceType { cellular: true })
        );

        observer.stop().await;
    }

    #[tokio::test]
    async fn is_single_shot() {
        let observer = ReachabilityObserver::new();
        let _first = observer.start(AlwaysOnline, Duration::from_millis(5)).await;
        observer.stop().await;

        let mut second = observer.start(AlwaysOnline, Duration::from_millis(5)).await;
        assert_eq!(second.next().await, None);
    }
}
