//! Downloader coordinator (C7, spec §4.5): owns a batch of download records,
//! drives the per-record state machine, and exposes the two-level event
//! stream.
//!
//! Grounded on `move_transfer/worker.rs`'s queue-sender/`run_queue_worker`
//! pair: one `mpsc` channel carries commands onto a single spawned task (the
//! "serialized context" of spec §5), generalized here to also multiplex the
//! HTTP task adapter's callbacks onto that same task via a second channel.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use reqwest::Client;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::descriptor::DownloadDescriptor;
use crate::error::TransferError;
use crate::events::{
    aggregate_event_channel, unit_event_channel, AggregateEventSink, AggregateEventStream,
    TransferInfo, UnitEventStream,
};
use crate::gate::ConcurrencyGate;
use crate::http_task::{
    map_task_failure, DownloadHttpTask, DownloadResumeToken, HttpTask, TaskEvent, TaskFailure,
};
use crate::record::{Record, RecordState};
use crate::throttle::ProgressThrottle;

enum Command {
    EventsOne {
        descriptor: DownloadDescriptor,
        respond: oneshot::Sender<UnitEventStream>,
    },
    EventsMany {
        descriptors: Vec<DownloadDescriptor>,
        respond: oneshot::Sender<AggregateEventStream>,
    },
    Pause,
    Resume,
    Stop {
        error: Option<TransferError>,
    },
}

/// Handle to a running downloader coordinator. Cloning shares the same
/// underlying actor and batch.
#[derive(Clone)]
pub struct Downloader {
    cmd_tx: mpsc::Sender<Command>,
}

impl Downloader {
    /// `max_active` is clamped to `[1, 5]` (§4.3). `progress_interval` is a
    /// percentage (§4.2). `spool_dir` holds in-flight `.part` files; it is
    /// created lazily on first use.
    pub fn new(max_active: usize, progress_interval: f64, spool_dir: impl Into<PathBuf>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (task_tx, task_rx) = mpsc::channel(256);
        let actor = DownloaderActor {
            client: None,
            gate: ConcurrencyGate::new(max_active),
            progress_interval,
            spool_dir: spool_dir.into(),
            task_tx,
            records: Vec::new(),
            throttles: Vec::new(),
            aggregate_sink: None,
            stopped: false,
        };
        tokio::spawn(actor.run(cmd_rx, task_rx));
        Self { cmd_tx }
    }

    /// Single-transfer form (§4.5): starts a fresh one-element batch.
    pub async fn events(&self, descriptor: DownloadDescriptor) -> UnitEventStream {
        let (respond, response) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::EventsOne { descriptor, respond })
            .await;
        response.await.expect("downloader actor is gone")
    }

    /// Multi-transfer form (§4.5): starts a fresh batch of `descriptors.len()`
    /// records.
    pub async fn events_many(&self, descriptors: Vec<DownloadDescriptor>) -> AggregateEventStream {
        let (respond, response) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::EventsMany {
                descriptors,
                respond,
            })
            .await;
        response.await.expect("downloader actor is gone")
    }

    /// Suspends every currently-running record (§4.5). A no-op if nothing is
    /// running (B5).
    pub async fn pause(&self) {
        let _ = self.cmd_tx.send(Command::Pause).await;
    }

    /// Resumes every non-completed record through the gate (§4.5).
    pub async fn resume(&self) {
        let _ = self.cmd_tx.send(Command::Resume).await;
    }

    /// Terminal cleanup (§4.5). Idempotent (P7).
    pub async fn stop(&self, error: Option<TransferError>) {
        let _ = self.cmd_tx.send(Command::Stop { error }).await;
    }
}

struct DownloaderActor {
    client: Option<Client>,
    gate: ConcurrencyGate,
    progress_interval: f64,
    spool_dir: PathBuf,
    task_tx: mpsc::Sender<TaskEvent>,
    records: Vec<Record<DownloadDescriptor>>,
    throttles: Vec<ProgressThrottle>,
    aggregate_sink: Option<AggregateEventSink>,
    stopped: bool,
}

impl DownloaderActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, mut task_rx: mpsc::Receiver<TaskEvent>) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                event = task_rx.recv() => {
                    match event {
                        Some(event) => self.handle_task_event(event).await,
                        None => continue,
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::EventsOne { descriptor, respond } => {
                self.reset_batch();
                let id = Uuid::new_v4().to_string();
                let (sink, stream) = unit_event_channel(32);
                self.records.push(Record::new(id, descriptor, sink));
                self.throttles.push(ProgressThrottle::new(self.progress_interval));
                let _ = respond.send(stream);
                self.fill_gate().await;
            }
            Command::EventsMany {
                descriptors,
                respond,
            } => {
                self.reset_batch();
                let (agg_sink, agg_stream) = aggregate_event_channel(32);
                let _ = respond.send(agg_stream);

                let mut streams = Vec::with_capacity(descriptors.len());
                for descriptor in descriptors {
                    let id = Uuid::new_v4().to_string();
                    let (sink, stream) = unit_event_channel(32);
                    self.records.push(Record::new(id, descriptor, sink));
                    self.throttles
                        .push(ProgressThrottle::new(self.progress_interval));
                    streams.push(stream);
                }

                let infos: Vec<TransferInfo> = self
                    .records
                    .iter()
                    .enumerate()
                    .map(|(i, r)| r.info(i))
                    .collect();
                agg_sink.emit_start(infos).await;
                for (i, stream) in streams.into_iter().enumerate() {
                    agg_sink.emit_unit(i, stream).await;
                }
                self.aggregate_sink = Some(agg_sink);

                if self.records.is_empty() {
                    if let Some(sink) = self.aggregate_sink.take() {
                        sink.emit_all_completed(Vec::new()).await;
                    }
                } else {
                    self.fill_gate().await;
                }
            }
            Command::Pause => self.handle_pause().await,
            Command::Resume => self.fill_gate().await,
            Command::Stop { error } => self.handle_stop(error).await,
        }
    }

    fn reset_batch(&mut self) {
        self.records.clear();
        self.throttles.clear();
        self.aggregate_sink = None;
        self.stopped = false;
    }

    async fn handle_pause(&mut self) {
        let running: Vec<usize> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state.is_running())
            .map(|(i, _)| i)
            .collect();

        for idx in running {
            let token = {
                let task = self.records[idx].task.as_ref().expect("running record has a task");
                task.cancel_producing_resume_token().await
            };
            match token {
                Some(token) => {
                    log::info!("download {} suspended with a resume token", self.records[idx].id);
                    self.records[idx].resume_token = Some(token.clone());
                    let new_task = self.build_task_for(idx, Some(token));
                    self.records[idx].task = Some(new_task);
                }
                None => {
                    log::info!("download {} suspended", self.records[idx].id);
                    let task = self.records[idx].task.as_ref().expect("running record has a task");
                    task.suspend().await;
                }
            }
            self.records[idx].state = RecordState::Suspended;
        }
    }

    async fn handle_stop(&mut self, error: Option<TransferError>) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        log::info!("downloader stopping, error={error:?}");

        for record in &mut self.records {
            if record.state.is_terminal() {
                continue;
            }
            if let Some(task) = &record.task {
                task.cancel().await;
            }
            let err = error.clone().unwrap_or(TransferError::CanceledByUser);
            record.state = RecordState::Canceled;
            record.error = Some(err.clone());
            record.sink.fail(err).await;
        }

        if let Some(sink) = self.aggregate_sink.take() {
            sink.fail(error.unwrap_or(TransferError::CanceledByUser)).await;
        }

        self.client = None;
    }

    /// Starts as many New/Suspended records as the gate allows, FIFO by
    /// submission order (§4.3).
    async fn fill_gate(&mut self) {
        loop {
            let states: Vec<RecordState> = self.records.iter().map(|r| r.state).collect();
            let next = states
                .iter()
                .position(|s| matches!(s, RecordState::New | RecordState::Suspended));
            let Some(next) = next else { break };
            match self.gate.pick_next_to_start(&states, Some(next)) {
                Some(index) => self.start_record(index).await,
                None => break,
            }
        }
    }

    async fn start_record(&mut self, index: usize) {
        if self.records[index].task.is_none() {
            let _ = tokio::fs::create_dir_all(&self.spool_dir).await;
            let resume_token = self.records[index].resume_token.clone();
            let task = self.build_task_for(index, resume_token);
            self.records[index].task = Some(task);
        }

        if !self.records[index].start_emitted {
            self.records[index].start_emitted = true;
            log::info!("download {} starting", self.records[index].id);
            let info = self.records[index].info(index);
            self.records[index].sink.emit_start(index, info).await;
        }

        self.records[index].state = RecordState::Running;
        self.records[index]
            .task
            .as_ref()
            .expect("task built above")
            .resume()
            .await;
    }

    fn build_task_for(&mut self, index: usize, resume_token: Option<Vec<u8>>) -> Box<dyn HttpTask> {
        let client = self.client.get_or_insert_with(Client::new).clone();
        let record = &self.records[index];
        let id = record.id.clone();
        let url = record.descriptor.source_url.clone();
        let headers = record.descriptor.headers.clone();
        let timeout = record.descriptor.timeout;

        let decoded = resume_token.and_then(|bytes| DownloadResumeToken::decode(&bytes));
        match decoded {
            Some(token) => Box::new(DownloadHttpTask::from_resume_token(
                id,
                client,
                url,
                headers,
                timeout,
                token,
                self.task_tx.clone(),
            )),
            None => Box::new(DownloadHttpTask::new(
                id,
                client,
                url,
                headers,
                timeout,
                &self.spool_dir,
                self.task_tx.clone(),
            )),
        }
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    async fn handle_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::DidWrite {
                id,
                total_written,
                total_expected,
                ..
            } => self.handle_did_write(id, total_written, total_expected).await,
            TaskEvent::DidFinishDownloading { id, bytes, status } => {
                self.handle_did_finish(id, bytes, status).await
            }
            TaskEvent::DidReceive { .. } => {
                // Downloads never receive this callback (§4.4: uploads only).
            }
            TaskEvent::DidComplete { id, error } => self.handle_did_complete(id, error).await,
        }
    }

    async fn handle_did_write(&mut self, id: String, total_written: u64, total_expected: u64) {
        let Some(idx) = self.index_of(&id) else {
            return;
        };
        let current = total_written as f64;
        let total = total_expected as f64;
        self.records[idx].current_bytes = current;
        self.records[idx].total_bytes = total;
        if self.throttles[idx].observe(current, total) {
            self.records[idx].sink.emit_update(current, total).await;
        }
    }

    async fn handle_did_finish(&mut self, id: String, bytes: Bytes, status: u16) {
        let Some(idx) = self.index_of(&id) else {
            return;
        };

        if !(200..300).contains(&status) {
            let err = TransferError::ServerError(status);
            log::warn!("download {id} server responded with status {status}");
            self.records[idx].error = Some(err.clone());
            self.records[idx].state = RecordState::Failed;
            self.records[idx].sink.fail(err).await;
            self.after_unit_terminal(idx).await;
            return;
        }

        let dir = self.records[idx].descriptor.destination_dir.clone();
        let file_name = self.records[idx].descriptor.file_name();
        match save_to_destination(&dir, &file_name, &bytes).await {
            Ok(()) => {
                log::info!("download {id} completed ({} bytes)", bytes.len());
                self.records[idx].current_bytes = bytes.len() as f64;
                self.records[idx].total_bytes = bytes.len() as f64;
                self.records[idx].state = RecordState::Completed;
                let info = self.records[idx].info(idx);
                self.records[idx].sink.emit_completed(bytes, info).await;
            }
            Err(err) => {
                log::warn!("download {id} failed to save to destination: {err}");
                self.records[idx].error = Some(err.clone());
                self.records[idx].state = RecordState::Failed;
                self.records[idx].sink.fail(err).await;
            }
        }
        self.after_unit_terminal(idx).await;
    }

    async fn handle_did_complete(&mut self, id: String, error: Option<TaskFailure>) {
        let Some(idx) = self.index_of(&id) else {
            return;
        };
        let Some(failure) = error else {
            // Downloads only terminate successfully via DidFinishDownloading.
            return;
        };

        if failure.canceled {
            log::info!("download {id} canceled by user");
            self.records[idx].state = RecordState::Canceled;
            self.records[idx].error = Some(TransferError::CanceledByUser);
            self.records[idx].sink.fail(TransferError::CanceledByUser).await;
        } else if let Some(token) = failure.resume_token.clone() {
            let err = map_task_failure(&failure);
            log::warn!("download {id} failed with a resume token captured: {err}");
            self.records[idx].resume_token = Some(token.clone());
            self.records[idx].error = Some(err.clone());
            let task = self.build_task_for(idx, Some(token));
            self.records[idx].task = Some(task);
            self.records[idx].state = RecordState::Failed;
            self.records[idx].sink.fail(err).await;
        } else {
            let err = map_task_failure(&failure);
            log::warn!("download {id} failed: {err}");
            self.records[idx].error = Some(err.clone());
            self.records[idx].state = RecordState::Failed;
            self.records[idx].sink.fail(err).await;
        }
        self.after_unit_terminal(idx).await;
    }

    /// Aggregate bookkeeping after one record's unit stream reached a
    /// terminal event (§4.5 "completion bookkeeping").
    async fn after_unit_terminal(&mut self, idx: usize) {
        if self.records[idx].state == RecordState::Failed {
            if let Some(sink) = self.aggregate_sink.take() {
                let err = self.records[idx]
                    .error
                    .clone()
                    .unwrap_or(TransferError::FailureReason("unknown failure".into()));
                sink.fail(err).await;
            }
        }

        let all_done = self.records.iter().all(|r| r.state.is_terminal());
        if all_done {
            if let Some(sink) = self.aggregate_sink.take() {
                let infos: Vec<TransferInfo> = self
                    .records
                    .iter()
                    .enumerate()
                    .map(|(i, r)| r.info(i))
                    .collect();
                sink.emit_all_completed(infos).await;
            }
        } else {
            self.fill_gate().await;
        }
    }
}

/// Save policy (§4.5): destination directory is created if missing, bytes
/// are written to a sibling temp file and renamed into place so a reader
/// never observes a partially written destination file.
async fn save_to_destination(dir: &Path, file_name: &str, bytes: &Bytes) -> Result<(), TransferError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| TransferError::NoDataInLocal(e.to_string()))?;
    let destination = dir.join(file_name);
    let tmp_path = dir.join(format!(".{file_name}.part"));
    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| TransferError::NoDataInLocal(e.to_string()))?;
    tokio::fs::rename(&tmp_path, &destination)
        .await
        .map_err(|e| TransferError::NoDataInLocal(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AggregateEvent, UnitEvent};
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// End-to-end scenario 1 (§8): single download, maxActive=1. Expects a
    /// `start`, at least one `update`, then `completed` with the full body.
    #[tokio::test]
    async fn single_download_completes_with_full_body() {
        let server = MockServer::start().await;
        let body = vec![7u8; 200_000];
        Mock::given(method("GET"))
            .and(path("/y.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dest = tempfile::tempdir().unwrap();
        let spool = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(1, 1.0, spool.path());
        let url = Url::parse(&format!("{}/y.bin", server.uri())).unwrap();
        let descriptor = DownloadDescriptor::new(url, dest.path());

        let mut stream = downloader.events(descriptor).await;

        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, UnitEvent::Start { index: 0, .. }));

        let mut saw_update = false;
        loop {
            match stream.next().await.unwrap().unwrap() {
                UnitEvent::Update { .. } => saw_update = true,
                UnitEvent::Completed { body: completed_body, info } => {
                    assert_eq!(completed_body.len(), body.len());
                    assert!(info.is_completed);
                    break;
                }
                UnitEvent::Start { .. } => panic!("start emitted twice"),
            }
        }
        assert!(saw_update, "expected at least one throttled update event");

        let saved = tokio::fs::read(dest.path().join("y.bin")).await.unwrap();
        assert_eq!(saved, body);
    }

    /// End-to-end scenario 4 (§8): one of three downloads fails with a 500;
    /// the other two still complete, and the aggregate stream surfaces the
    /// first unit error (B4).
    #[tokio::test]
    async fn batch_download_continues_past_one_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 1024]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b.bin"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/c.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![2u8; 1024]))
            .mount(&server)
            .await;

        let dest = tempfile::tempdir().unwrap();
        let spool = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(2, 10.0, spool.path());
        let descriptors: Vec<DownloadDescriptor> = ["a.bin", "b.bin", "c.bin"]
            .iter()
            .map(|name| {
                let url = Url::parse(&format!("{}/{name}", server.uri())).unwrap();
                DownloadDescriptor::new(url, dest.path())
            })
            .collect();

        let mut aggregate = downloader.events_many(descriptors).await;
        assert!(matches!(
            aggregate.next().await.unwrap().unwrap(),
            AggregateEvent::Start { .. }
        ));

        let mut unit_streams = Vec::new();
        for _ in 0..3 {
            match aggregate.next().await.unwrap().unwrap() {
                AggregateEvent::Unit { index, stream } => unit_streams.push((index, stream)),
                other => panic!("expected Unit event, got {}", describe(&other)),
            }
        }

        let mut completed = 0;
        let mut failed = 0;
        for (_, mut stream) in unit_streams {
            loop {
                match stream.next().await {
                    Some(Ok(UnitEvent::Completed { .. })) => {
                        completed += 1;
                        break;
                    }
                    Some(Err(_)) => {
                        failed += 1;
                        break;
                    }
                    Some(_) => continue,
                    None => break,
                }
            }
        }
        assert_eq!(completed, 2);
        assert_eq!(failed, 1);

        // Aggregate surfaces the first unit error instead of `allCompleted`.
        assert!(matches!(aggregate.next().await, Some(Err(TransferError::ServerError(500)))));
    }

    fn describe(event: &AggregateEvent) -> &'static str {
        match event {
            AggregateEvent::Start { .. } => "Start",
            AggregateEvent::Unit { .. } => "Unit",
            AggregateEvent::AllCompleted { .. } => "AllCompleted",
        }
    }

    /// B3: an empty batch emits `start{[]}` then `allCompleted{[]}` with no
    /// unit events in between.
    #[tokio::test]
    async fn empty_batch_emits_start_then_all_completed() {
        let spool = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(1, 1.0, spool.path());
        let mut aggregate = downloader.events_many(Vec::new()).await;

        assert!(matches!(
            aggregate.next().await.unwrap().unwrap(),
            AggregateEvent::Start { records } if records.is_empty()
        ));
        assert!(matches!(
            aggregate.next().await.unwrap().unwrap(),
            AggregateEvent::AllCompleted { records } if records.is_empty()
        ));
    }

    #[test]
    fn map_task_failure_prefers_status_over_message() {
        let failure = TaskFailure {
            message: "server error 503: unavailable".to_string(),
            status: Some(503),
            resume_token: None,
            canceled: false,
        };
        assert_eq!(map_task_failure(&failure), TransferError::ServerError(503));
    }

    #[test]
    fn map_task_failure_falls_back_to_transport_error() {
        let failure = TaskFailure {
            message: "connection reset".to_string(),
            status: None,
            resume_token: None,
            canceled: false,
        };
        assert_eq!(
            map_task_failure(&failure),
            TransferError::Transport("connection reset".to_string())
        );
    }
}
