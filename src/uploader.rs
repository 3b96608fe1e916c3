//! Uploader coordinator (C8, spec §4.6): mirrors the downloader's actor
//! shape, but builds a multipart/form-data body into a spool file per
//! record, enforces a maximum payload size, and accumulates the server's
//! response bytes instead of writing a destination file.
//!
//! Grounded on `upload.rs`'s part-size/threshold constants and spool-file
//! handling and on `move_transfer/worker.rs`'s queue-actor pattern, reused
//! here for the coordinator's serialized context.

use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::descriptor::{guess_mime, UploadDescriptor, UploadPayload};
use crate::error::TransferError;
use crate::events::{
    aggregate_event_channel, unit_event_channel, AggregateEventSink, AggregateEventStream,
    TransferInfo, UnitEventStream,
};
use crate::gate::ConcurrencyGate;
use crate::http_task::{map_task_failure, HttpTask, TaskEvent, UploadHttpTask};
use crate::record::{Record, RecordState};
use crate::throttle::ProgressThrottle;

enum Command {
    EventsOne {
        descriptor: UploadDescriptor,
        respond: oneshot::Sender<UnitEventStream>,
    },
    EventsMany {
        descriptors: Vec<UploadDescriptor>,
        respond: oneshot::Sender<AggregateEventStream>,
    },
    Pause,
    Resume,
    Stop {
        error: Option<TransferError>,
    },
}

/// Handle to a running uploader coordinator.
#[derive(Clone)]
pub struct Uploader {
    cmd_tx: mpsc::Sender<Command>,
}

impl Uploader {
    /// `spool_dir` is the "upload spool" directory (§6, persisted state);
    /// `reset_directory` deletes and recreates it up front, matching the
    /// optional constructor-time reset the source allows.
    pub fn new(
        max_active: usize,
        progress_interval: f64,
        spool_dir: impl Into<PathBuf>,
        reset_directory: bool,
    ) -> Self {
        let spool_dir = spool_dir.into();
        if reset_directory {
            let _ = std::fs::remove_dir_all(&spool_dir);
        }
        let _ = std::fs::create_dir_all(&spool_dir);

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (task_tx, task_rx) = mpsc::channel(256);
        let actor = UploaderActor {
            client: None,
            gate: ConcurrencyGate::new(max_active),
            progress_interval,
            spool_dir,
            task_tx,
            records: Vec::new(),
            throttles: Vec::new(),
            response_buffers: Vec::new(),
            aggregate_sink: None,
            stopped: false,
        };
        tokio::spawn(actor.run(cmd_rx, task_rx));
        Self { cmd_tx }
    }

    pub async fn events(&self, descriptor: UploadDescriptor) -> UnitEventStream {
        let (respond, response) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::EventsOne { descriptor, respond })
            .await;
        response.await.expect("uploader actor is gone")
    }

    pub async fn events_many(&self, descriptors: Vec<UploadDescriptor>) -> AggregateEventStream {
        let (respond, response) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::EventsMany {
                descriptors,
                respond,
            })
            .await;
        response.await.expect("uploader actor is gone")
    }

    pub async fn pause(&self) {
        let _ = self.cmd_tx.send(Command::Pause).await;
    }

    pub async fn resume(&self) {
        let _ = self.cmd_tx.send(Command::Resume).await;
    }

    pub async fn stop(&self, error: Option<TransferError>) {
        let _ = self.cmd_tx.send(Command::Stop { error }).await;
    }
}

struct UploaderActor {
    client: Option<Client>,
    gate: ConcurrencyGate,
    progress_interval: f64,
    spool_dir: PathBuf,
    task_tx: mpsc::Sender<TaskEvent>,
    records: Vec<Record<UploadDescriptor>>,
    throttles: Vec<ProgressThrottle>,
    response_buffers: Vec<BytesMut>,
    aggregate_sink: Option<AggregateEventSink>,
    stopped: bool,
}

impl UploaderActor {
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
                self.response_buffers.push(BytesMut::new());
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
                    self.response_buffers.push(BytesMut::new());
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
        self.response_buffers.clear();
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
            // Uploads have no resume-token equivalent (§4.6): this always
            // takes the `suspend()` branch.
            let token = {
                let task = self.records[idx].task.as_ref().expect("running record has a task");
                task.cancel_producing_resume_token().await
            };
            if token.is_none() {
                log::info!("upload {} suspended", self.records[idx].id);
                let task = self.records[idx].task.as_ref().expect("running record has a task");
                task.suspend().await;
            }
            self.records[idx].state = RecordState::Suspended;
        }
    }

    async fn handle_stop(&mut self, error: Option<TransferError>) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        log::info!("uploader stopping, error={error:?}");

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

    fn spool_path_for(&self, id: &str) -> PathBuf {
        self.spool_dir.join(id)
    }

    async fn start_record(&mut self, index: usize) {
        if self.records[index].task.is_none() {
            let id = self.records[index].id.clone();
            let spool_path = self.spool_path_for(&id);

            if let Err(err) = build_multipart_spool(&self.records[index].descriptor, &spool_path, &id).await {
                self.fail_without_start(index, err).await;
                return;
            }

            let size = match tokio::fs::metadata(&spool_path).await {
                Ok(meta) => meta.len(),
                Err(e) => {
                    self.fail_without_start(index, TransferError::EncodingError(e.to_string()))
                        .await;
                    return;
                }
            };
            if size > self.records[index].descriptor.max_bytes {
                self.fail_without_start(index, TransferError::OverLimitedFileSize).await;
                return;
            }

            let client = self.client.get_or_insert_with(Client::new).clone();
            let headers = merged_headers(&self.records[index].descriptor, &id);
            let url = self.records[index].descriptor.destination_url.clone();
            let timeout = self.records[index].descriptor.timeout;
            let task = UploadHttpTask::new(id, client, url, headers, timeout, spool_path, self.task_tx.clone());
            self.records[index].task = Some(Box::new(task));
        }

        if !self.records[index].start_emitted {
            self.records[index].start_emitted = true;
            log::info!("upload {} starting", self.records[index].id);
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

    async fn fail_without_start(&mut self, index: usize, err: TransferError) {
        log::warn!("upload {} failed before starting: {err}", self.records[index].id);
        self.records[index].error = Some(err.clone());
        self.records[index].state = RecordState::Failed;
        self.records[index].sink.fail(err).await;
        self.after_unit_terminal(index).await;
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
            TaskEvent::DidFinishDownloading { .. } => {
                // Uploads never receive this callback (§4.4: downloads only).
            }
            TaskEvent::DidReceive { id, data } => self.handle_did_receive(id, data),
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

    fn handle_did_receive(&mut self, id: String, data: Bytes) {
        let Some(idx) = self.index_of(&id) else {
            return;
        };
        self.response_buffers[idx].extend_from_slice(&data);
    }

    async fn handle_did_complete(&mut self, id: String, error: Option<crate::http_task::TaskFailure>) {
        let Some(idx) = self.index_of(&id) else {
            return;
        };

        match error {
            None => {
                log::info!("upload {id} completed");
                let body = std::mem::take(&mut self.response_buffers[idx]).freeze();
                self.records[idx].state = RecordState::Completed;
                let info = self.records[idx].info(idx);
                self.records[idx].sink.emit_completed(body, info).await;
            }
            Some(failure) if failure.canceled => {
                log::info!("upload {id} canceled by user");
                self.records[idx].state = RecordState::Canceled;
                self.records[idx].error = Some(TransferError::CanceledByUser);
                self.records[idx].sink.fail(TransferError::CanceledByUser).await;
            }
            Some(failure) => {
                let err = map_task_failure(&failure);
                log::warn!("upload {id} failed: {err}");
                self.records[idx].error = Some(err.clone());
                self.records[idx].state = RecordState::Failed;
                self.records[idx].sink.fail(err).await;
            }
        }
        self.after_unit_terminal(idx).await;
    }

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

/// Default `Content-Type` carrying the boundary, overridden by an
/// application-supplied header of the same name (§4.6).
fn merged_headers(descriptor: &UploadDescriptor, boundary: &str) -> HeaderMap {
    let mut headers = descriptor.headers.clone();
    if !headers.contains_key(CONTENT_TYPE) {
        let value = format!("multipart/form-data; boundary={boundary}");
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(CONTENT_TYPE, value);
        }
    }
    headers
}

/// Builds the multipart/form-data body described by `descriptor` into
/// `spool_path` (§4.6). Parameters are written first (sorted by name, for a
/// deterministic field order), then the payload's file part(s), then the
/// closing boundary.
async fn build_multipart_spool(
    descriptor: &UploadDescriptor,
    spool_path: &Path,
    boundary: &str,
) -> Result<(), TransferError> {
    let mut file = tokio::fs::File::create(spool_path).await.map_err(spool_io_err)?;

    if let Some(params) = &descriptor.parameters {
        let mut keys: Vec<&String> = params.keys().collect();
        keys.sort();
        for key in keys {
            let value = &params[key];
            let part = format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{key}\"\r\n\r\n{value}\r\n"
            );
            file.write_all(part.as_bytes()).await.map_err(spool_io_err)?;
        }
    }

    match &descriptor.payload {
        UploadPayload::Data {
            bytes,
            field_name,
            file_name,
            mime,
        } => {
            write_part_header(&mut file, boundary, field_name, Some(file_name), mime).await?;
            file.write_all(bytes).await.map_err(spool_io_err)?;
            file.write_all(b"\r\n").await.map_err(spool_io_err)?;
        }
        UploadPayload::File { path, field_name } => {
            write_file_part(&mut file, boundary, field_name, path).await?;
        }
        UploadPayload::Files { paths, field_name } => {
            for path in paths {
                write_file_part(&mut file, boundary, field_name, path).await?;
            }
        }
    }

    file.write_all(format!("--{boundary}--\r\n").as_bytes())
        .await
        .map_err(spool_io_err)?;
    file.flush().await.map_err(spool_io_err)?;
    Ok(())
}

async fn write_file_part(
    file: &mut tokio::fs::File,
    boundary: &str,
    field_name: &str,
    path: &Path,
) -> Result<(), TransferError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file")
        .to_string();
    let mime = guess_mime(path);
    write_part_header(file, boundary, field_name, Some(&file_name), &mime).await?;
    let mut source = tokio::fs::File::open(path).await.map_err(spool_io_err)?;
    tokio::io::copy(&mut source, file).await.map_err(spool_io_err)?;
    file.write_all(b"\r\n").await.map_err(spool_io_err)?;
    Ok(())
}

async fn write_part_header(
    file: &mut tokio::fs::File,
    boundary: &str,
    field_name: &str,
    file_name: Option<&str>,
    mime: &str,
) -> Result<(), TransferError> {
    let header = match file_name {
        Some(name) => format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{field_name}\"; filename=\"{name}\"\r\nContent-Type: {mime}\r\n\r\n"
        ),
        None => format!("--{boundary}\r\nContent-Disposition: form-data; name=\"{field_name}\"\r\n\r\n"),
    };
    file.write_all(header.as_bytes()).await.map_err(spool_io_err)
}

fn spool_io_err(e: std::io::Error) -> TransferError {
    TransferError::EncodingError(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::CachePolicy;
    use crate::events::UnitEvent;
    use std::collections::HashMap;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn data_descriptor(max_bytes: u64) -> UploadDescriptor {
        UploadDescriptor {
            destination_url: Url::parse("https://example.com/upload").unwrap(),
            headers: HeaderMap::new(),
            cache_policy: CachePolicy::default(),
            timeout: std::time::Duration::from_secs(30),
            payload: UploadPayload::Data {
                bytes: vec![1, 2, 3, 4],
                field_name: "file".to_string(),
                file_name: "blob.bin".to_string(),
                mime: "application/octet-stream".to_string(),
            },
            parameters: Some(HashMap::from([
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ])),
            max_bytes,
        }
    }

    #[tokio::test]
    async fn multipart_spool_contains_parameters_in_sorted_order_then_file_part() {
        let dir = tempfile::tempdir().unwrap();
        let spool_path = dir.path().join("rec-1");
        let descriptor = data_descriptor(1_000_000);

        build_multipart_spool(&descriptor, &spool_path, "rec-1").await.unwrap();
        let contents = tokio::fs::read_to_string(&spool_path).await.unwrap();

        let a_pos = contents.find("name=\"a\"").unwrap();
        let b_pos = contents.find("name=\"b\"").unwrap();
        let file_pos = contents.find("name=\"file\"").unwrap();
        assert!(a_pos < b_pos);
        assert!(b_pos < file_pos);
        assert!(contents.trim_end().ends_with("--rec-1--"));
    }

    #[test]
    fn merged_headers_defaults_content_type_to_multipart_with_boundary() {
        let descriptor = data_descriptor(1_000_000);
        let headers = merged_headers(&descriptor, "rec-1");
        assert_eq!(
            headers.get(CONTENT_TYPE).unwrap(),
            "multipart/form-data; boundary=rec-1"
        );
    }

    #[test]
    fn merged_headers_respects_application_supplied_content_type() {
        let mut descriptor = data_descriptor(1_000_000);
        descriptor
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/custom"));
        let headers = merged_headers(&descriptor, "rec-1");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/custom");
    }

    /// End-to-end scenario 5 (§8): an oversize spool file fails the record
    /// before it ever starts — no `start` unit event, terminal
    /// `OverLimitedFileSize`.
    #[tokio::test]
    async fn oversize_upload_fails_without_starting() {
        let spool = tempfile::tempdir().unwrap();
        let uploader = Uploader::new(1, 1.0, spool.path(), false);
        let mut descriptor = data_descriptor(3);
        descriptor.destination_url = Url::parse("https://example.com/upload").unwrap();
        // `data_descriptor`'s payload is 4 bytes, already over this max.

        let mut stream = uploader.events(descriptor).await;
        match stream.next().await {
            Some(Err(TransferError::OverLimitedFileSize)) => {}
            other => panic!("expected OverLimitedFileSize, got {other:?}"),
        }
    }

    /// `pause()` on a running upload must actually suspend it instead of
    /// silently leaving it running in the background while the coordinator
    /// believes otherwise; bounded by a generous timeout so a regression
    /// back to the old "suspend never observed" behavior (which stalled for
    /// the adapter's internal 10s deadline) fails fast instead of hanging.
    #[tokio::test]
    async fn pause_then_resume_does_not_stall() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(200)))
            .mount(&server)
            .await;

        let spool = tempfile::tempdir().unwrap();
        let uploader = Uploader::new(1, 1.0, spool.path(), false);
        let mut descriptor = data_descriptor(10_000_000);
        descriptor.destination_url = Url::parse(&format!("{}/upload", server.uri())).unwrap();
        descriptor.payload = UploadPayload::Data {
            bytes: vec![9u8; 2_000_000],
            field_name: "file".to_string(),
            file_name: "blob.bin".to_string(),
            mime: "application/octet-stream".to_string(),
        };

        let mut stream = uploader.events(descriptor).await;
        assert!(matches!(
            stream.next().await.unwrap().unwrap(),
            UnitEvent::Start { .. }
        ));

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            uploader.pause().await;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            uploader.resume().await;

            loop {
                match stream.next().await.unwrap().unwrap() {
                    UnitEvent::Update { .. } => continue,
                    UnitEvent::Completed { info, .. } => {
                        assert!(info.is_completed);
                        break;
                    }
                    UnitEvent::Start { .. } => panic!("start emitted twice"),
                }
            }
        })
        .await
        .expect("pause/resume should not stall on an unsuspended upload task");
    }

    /// End-to-end scenario 6 (§8): a successful upload reports one `start`,
    /// throttled progress, then `completed` carrying the server's response
    /// body.
    #[tokio::test]
    async fn successful_upload_captures_response_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(br#"{"ok":true}"#.to_vec()))
            .mount(&server)
            .await;

        let spool = tempfile::tempdir().unwrap();
        let uploader = Uploader::new(1, 1.0, spool.path(), false);
        let mut descriptor = data_descriptor(1_000_000);
        descriptor.destination_url = Url::parse(&format!("{}/upload", server.uri())).unwrap();

        let mut stream = uploader.events(descriptor).await;
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, UnitEvent::Start { index: 0, .. }));

        loop {
            match stream.next().await.unwrap().unwrap() {
                UnitEvent::Update { .. } => continue,
                UnitEvent::Completed { body, info } => {
                    assert_eq!(&body[..], &br#"{"ok":true}"#[..]);
                    assert!(info.is_completed);
                    break;
                }
                UnitEvent::Start { .. } => panic!("start emitted twice"),
            }
        }
    }
}
