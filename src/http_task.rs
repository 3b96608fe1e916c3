//! HTTP task adapter (C6, spec §4.4): wraps `reqwest`, exposes
//! start/suspend/cancel/cancel-with-resume-token, and forwards progress and
//! completion callbacks onto the coordinator's serialized context via an
//! internal `mpsc` channel.
//!
//! Grounded on `download/worker.rs::download_file_internal` (streaming GET,
//! cooperative cancel/pause checks on every chunk) and
//! `upload.rs::upload_single_part`/`upload_multipart` (single PUT / bounded
//! concurrent parts), generalized from those two hand-written call sites
//! into one reusable trait with two concrete implementations.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, RANGE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, Notify};
use url::Url;

use crate::error::TransferError;

/// Adapter-reported task state (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    New,
    Running,
    Suspended,
    Completed,
    Canceling,
}

const ST_NEW: u8 = 0;
const ST_RUNNING: u8 = 1;
const ST_SUSPENDED: u8 = 2;
const ST_COMPLETED: u8 = 3;
const ST_CANCELING: u8 = 4;

fn decode_state(v: u8) -> TaskState {
    match v {
        ST_RUNNING => TaskState::Running,
        ST_SUSPENDED => TaskState::Suspended,
        ST_COMPLETED => TaskState::Completed,
        ST_CANCELING => TaskState::Canceling,
        _ => TaskState::New,
    }
}

const SIGNAL_NONE: u8 = 0;
const SIGNAL_CANCEL: u8 = 1;
const SIGNAL_SUSPEND: u8 = 2;

/// Failure carried by `DidComplete`; may include a resume token when the
/// transport (or our emulation of one, for downloads) can offer one.
#[derive(Debug, Clone)]
pub(crate) struct TaskFailure {
    pub message: String,
    pub status: Option<u16>,
    pub resume_token: Option<Vec<u8>>,
    /// Set when this `DidComplete` came from a `cancel()` call rather than a
    /// transport/server error, so the coordinator can route it to
    /// `TransferError::CanceledByUser` without matching on `message`.
    pub canceled: bool,
}

/// Callbacks the adapter delivers to the coordinator (§4.4), identified by
/// the record id so the coordinator can resolve id -> index itself (§9,
/// "cyclic references").
pub(crate) enum TaskEvent {
    DidWrite {
        id: String,
        written: u64,
        total_written: u64,
        total_expected: u64,
    },
    DidFinishDownloading {
        id: String,
        bytes: Bytes,
        status: u16,
    },
    DidReceive {
        id: String,
        data: Bytes,
    },
    DidComplete {
        id: String,
        error: Option<TaskFailure>,
    },
}

#[async_trait]
pub(crate) trait HttpTask: Send + Sync {
    fn state(&self) -> TaskState;
    async fn resume(&self);
    async fn suspend(&self);
    async fn cancel(&self);
    async fn cancel_producing_resume_token(&self) -> Option<Vec<u8>>;
}

/// Opaque resume token: where the in-flight spool file lives and how many
/// bytes of it are already on disk. Serialized to JSON bytes so it round-
/// trips as the `Vec<u8>` blob spec §3/§9 calls opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DownloadResumeToken {
    pub spool_path: PathBuf,
    pub offset: u64,
}

impl DownloadResumeToken {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("resume token always serializes")
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

struct DownloadInner {
    id: String,
    client: Client,
    url: Url,
    headers: HeaderMap,
    timeout: Duration,
    spool_path: PathBuf,
    resume_offset: Mutex<Option<u64>>,
    state: AtomicU8,
    control: AtomicU8,
    written: AtomicU64,
    events_tx: mpsc::Sender<TaskEvent>,
    notify: Notify,
}

/// Download task: streams into a private spool file, reads the whole file
/// into memory before reporting completion (§4.5 "temp-file rule": some HTTP
/// stacks delete the temp file as soon as the finish callback returns, so we
/// must read it into memory before yielding control back).
#[derive(Clone)]
pub(crate) struct DownloadHttpTask(Arc<DownloadInner>);

impl DownloadHttpTask {
    pub fn new(
        id: String,
        client: Client,
        url: Url,
        headers: HeaderMap,
        timeout: Duration,
        spool_dir: &std::path::Path,
        events_tx: mpsc::Sender<TaskEvent>,
    ) -> Self {
        let spool_path = spool_dir.join(format!("{id}.part"));
        Self(Arc::new(DownloadInner {
            id,
            client,
            url,
            headers,
            timeout,
            spool_path,
            resume_offset: Mutex::new(None),
            state: AtomicU8::new(ST_NEW),
            control: AtomicU8::new(SIGNAL_NONE),
            written: AtomicU64::new(0),
            events_tx,
            notify: Notify::new(),
        }))
    }

    /// Re-creates a download task primed with a previously issued resume
    /// token (§4.4 `new_download_from_resume`).
    pub fn from_resume_token(
        id: String,
        client: Client,
        url: Url,
        headers: HeaderMap,
        timeout: Duration,
        token: DownloadResumeToken,
        events_tx: mpsc::Sender<TaskEvent>,
    ) -> Self {
        let task = Self(Arc::new(DownloadInner {
            id,
            client,
            url,
            headers,
            timeout,
            spool_path: token.spool_path,
            resume_offset: Mutex::new(Some(token.offset)),
            state: AtomicU8::new(ST_NEW),
            control: AtomicU8::new(SIGNAL_NONE),
            written: AtomicU64::new(token.offset),
            events_tx,
            notify: Notify::new(),
        }));
        task
    }

    async fn wait_for_stop(&self) {
        let deadline = tokio::time::sleep(Duration::from_secs(10));
        tokio::pin!(deadline);
        loop {
            let state = decode_state(self.0.state.load(Ordering::SeqCst));
            if matches!(state, TaskState::Suspended | TaskState::Completed) {
                return;
            }
            tokio::select! {
                _ = self.0.notify.notified() => {}
                _ = &mut deadline => return,
            }
        }
    }
}

#[async_trait]
impl HttpTask for DownloadHttpTask {
    fn state(&self) -> TaskState {
        decode_state(self.0.state.load(Ordering::SeqCst))
    }

    async fn resume(&self) {
        let state = decode_state(self.0.state.load(Ordering::SeqCst));
        if state == TaskState::Running {
            return;
        }
        self.0.state.store(ST_RUNNING, Ordering::SeqCst);
        self.0.control.store(SIGNAL_NONE, Ordering::SeqCst);
        let inner = self.0.clone();
        tokio::spawn(async move { run_download(inner).await });
    }

    async fn suspend(&self) {
        self.0.control.store(SIGNAL_SUSPEND, Ordering::SeqCst);
        self.wait_for_stop().await;
    }

    async fn cancel(&self) {
        self.0.control.store(SIGNAL_CANCEL, Ordering::SeqCst);
        self.wait_for_stop().await;
    }

    async fn cancel_producing_resume_token(&self) -> Option<Vec<u8>> {
        self.0.control.store(SIGNAL_SUSPEND, Ordering::SeqCst);
        self.wait_for_stop().await;
        let offset = *self.0.resume_offset.lock().await;
        offset.map(|offset| {
            DownloadResumeToken {
                spool_path: self.0.spool_path.clone(),
                offset,
            }
            .encode()
        })
    }
}

async fn run_download(inner: Arc<DownloadInner>) {
    let offset = *inner.resume_offset.lock().await;

    let mut file = match if offset.is_some() {
        OpenOptions::new().write(true).open(&inner.spool_path).await
    } else {
        File::create(&inner.spool_path).await
    } {
        Ok(f) => f,
        Err(e) => {
            complete_with_error(&inner, format!("failed to open spool file: {e}"), None, None)
                .await;
            return;
        }
    };
    if let Some(off) = offset {
        if let Err(e) = file.seek(std::io::SeekFrom::Start(off)).await {
            complete_with_error(&inner, format!("failed to seek spool file: {e}"), None, None)
                .await;
            return;
        }
    }

    let mut request = inner
        .client
        .get(inner.url.clone())
        .headers(inner.headers.clone())
        .timeout(inner.timeout);
    if let Some(off) = offset {
        request = request.header(RANGE, format!("bytes={off}-"));
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            complete_with_error(&inner, e.to_string(), None, None).await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() && status.as_u16() != 206 {
        let body = response.text().await.unwrap_or_default();
        complete_with_error(
            &inner,
            format!("server error {}: {body}", status.as_u16()),
            Some(status.as_u16()),
            None,
        )
        .await;
        return;
    }

    let total_expected = response.content_length().unwrap_or(0) + offset.unwrap_or(0);
    let mut written = offset.unwrap_or(0);
    let mut stream = response.bytes_stream();

    loop {
        match inner.control.load(Ordering::SeqCst) {
            SIGNAL_CANCEL => {
                let _ = tokio::fs::remove_file(&inner.spool_path).await;
                inner.state.store(ST_COMPLETED, Ordering::SeqCst);
                inner.notify.notify_waiters();
                let _ = inner
                    .events_tx
                    .send(TaskEvent::DidComplete {
                        id: inner.id.clone(),
                        error: Some(TaskFailure {
                            message: "canceled by user".to_string(),
                            status: None,
                            resume_token: None,
                            canceled: true,
                        }),
                    })
                    .await;
                return;
            }
            SIGNAL_SUSPEND => {
                let _ = file.flush().await;
                *inner.resume_offset.lock().await = Some(written);
                inner.state.store(ST_SUSPENDED, Ordering::SeqCst);
                inner.notify.notify_waiters();
                return;
            }
            _ => {}
        }

        match stream.next().await {
            Some(Ok(chunk)) => {
                if let Err(e) = file.write_all(&chunk).await {
                    complete_with_error(
                        &inner,
                        format!("failed to write spool file: {e}"),
                        None,
                        Some(written),
                    )
                    .await;
                    return;
                }
                written += chunk.len() as u64;
                inner.written.store(written, Ordering::SeqCst);
                let _ = inner
                    .events_tx
                    .send(TaskEvent::DidWrite {
                        id: inner.id.clone(),
                        written: chunk.len() as u64,
                        total_written: written,
                        total_expected,
                    })
                    .await;
            }
            Some(Err(e)) => {
                complete_with_error(&inner, e.to_string(), None, Some(written)).await;
                return;
            }
            None => break,
        }
    }

    if let Err(e) = file.flush().await {
        complete_with_error(&inner, format!("failed to flush spool file: {e}"), None, None).await;
        return;
    }

    let bytes = match tokio::fs::read(&inner.spool_path).await {
        Ok(b) => b,
        Err(e) => {
            complete_with_error(
                &inner,
                format!("failed to read completed spool file: {e}"),
                None,
                None,
            )
            .await;
            return;
        }
    };
    let _ = tokio::fs::remove_file(&inner.spool_path).await;

    inner.state.store(ST_COMPLETED, Ordering::SeqCst);
    inner.notify.notify_waiters();
    let _ = inner
        .events_tx
        .send(TaskEvent::DidFinishDownloading {
            id: inner.id.clone(),
            bytes: Bytes::from(bytes),
            status: status.as_u16(),
        })
        .await;
}

/// Some transports attach a resume token to a mid-flight transport error; we
/// emulate that by attaching one whenever bytes were already written.
async fn complete_with_error(
    inner: &Arc<DownloadInner>,
    message: String,
    status: Option<u16>,
    written_at_failure: Option<u64>,
) {
    inner.state.store(ST_COMPLETED, Ordering::SeqCst);
    inner.notify.notify_waiters();
    let resume_token = written_at_failure.filter(|w| *w > 0).map(|offset| {
        DownloadResumeToken {
            spool_path: inner.spool_path.clone(),
            offset,
        }
        .encode()
    });
    let _ = inner
        .events_tx
        .send(TaskEvent::DidComplete {
            id: inner.id.clone(),
            error: Some(TaskFailure {
                message,
                status,
                resume_token,
                canceled: false,
            }),
        })
        .await;
}

struct UploadInner {
    id: String,
    client: Client,
    url: Url,
    headers: HeaderMap,
    timeout: Duration,
    spool_path: PathBuf,
    state: AtomicU8,
    control: AtomicU8,
    events_tx: mpsc::Sender<TaskEvent>,
    notify: Notify,
}

/// Upload task: sends the bytes of a pre-built spool file (the multipart
/// body, §4.6) and forwards each response chunk as `DidReceive`. No resume-
/// token equivalent (§4.6): `suspend()` is the only pause mechanism.
#[derive(Clone)]
pub(crate) struct UploadHttpTask(Arc<UploadInner>);

impl UploadHttpTask {
    pub fn new(
        id: String,
        client: Client,
        url: Url,
        headers: HeaderMap,
        timeout: Duration,
        spool_path: PathBuf,
        events_tx: mpsc::Sender<TaskEvent>,
    ) -> Self {
        Self(Arc::new(UploadInner {
            id,
            client,
            url,
            headers,
            timeout,
            spool_path,
            state: AtomicU8::new(ST_NEW),
            control: AtomicU8::new(SIGNAL_NONE),
            events_tx,
            notify: Notify::new(),
        }))
    }

    async fn wait_for_stop(&self) {
        let deadline = tokio::time::sleep(Duration::from_secs(10));
        tokio::pin!(deadline);
        loop {
            let state = decode_state(self.0.state.load(Ordering::SeqCst));
            if matches!(state, TaskState::Suspended | TaskState::Completed) {
                return;
            }
            tokio::select! {
                _ = self.0.notify.notified() => {}
                _ = &mut deadline => return,
            }
        }
    }
}

#[async_trait]
impl HttpTask for UploadHttpTask {
    fn state(&self) -> TaskState {
        decode_state(self.0.state.load(Ordering::SeqCst))
    }

    async fn resume(&self) {
        let state = decode_state(self.0.state.load(Ordering::SeqCst));
        if state == TaskState::Running {
            return;
        }
        self.0.state.store(ST_RUNNING, Ordering::SeqCst);
        self.0.control.store(SIGNAL_NONE, Ordering::SeqCst);
        let inner = self.0.clone();
        tokio::spawn(async move { run_upload(inner).await });
    }

    async fn suspend(&self) {
        self.0.control.store(SIGNAL_SUSPEND, Ordering::SeqCst);
        self.wait_for_stop().await;
    }

    async fn cancel(&self) {
        self.0.control.store(SIGNAL_CANCEL, Ordering::SeqCst);
        self.wait_for_stop().await;
    }

    /// Always `None`: uploads have no resume-token equivalent in this
    /// design (§4.6); pause always degrades to `suspend()`.
    async fn cancel_producing_resume_token(&self) -> Option<Vec<u8>> {
        None
    }
}

async fn run_upload(inner: Arc<UploadInner>) {
    let total = match tokio::fs::metadata(&inner.spool_path).await {
        Ok(m) => m.len(),
        Err(e) => {
            upload_complete_with_error(&inner, format!("failed to stat spool file: {e}"), None, false)
                .await;
            return;
        }
    };
    let file = match File::open(&inner.spool_path).await {
        Ok(f) => f,
        Err(e) => {
            upload_complete_with_error(&inner, format!("failed to open spool file: {e}"), None, false)
                .await;
            return;
        }
    };

    let id = inner.id.clone();
    let events_tx = inner.events_tx.clone();
    let control = inner.control.load(Ordering::SeqCst);
    if control == SIGNAL_CANCEL {
        upload_complete_with_error(&inner, "canceled by user".to_string(), None, true).await;
        return;
    }
    if control == SIGNAL_SUSPEND {
        suspend_upload(&inner).await;
        return;
    }

    let written = Arc::new(AtomicU64::new(0));
    let control_inner = inner.clone();
    let body_stream =
        tokio_util::codec::FramedRead::new(file, tokio_util::codec::BytesCodec::new()).map(
            move |frame| match frame {
                Ok(bytes) => {
                    // Suspend and cancel both abort the in-flight body stream
                    // here: there is no resume-token equivalent for uploads
                    // (§4.6), so a suspended upload restarts from scratch.
                    match control_inner.control.load(Ordering::SeqCst) {
                        SIGNAL_CANCEL => return Err(std::io::Error::other("canceled by user")),
                        SIGNAL_SUSPEND => return Err(std::io::Error::other("suspended by user")),
                        _ => {}
                    }
                    let n = bytes.len() as u64;
                    let total_written = written.fetch_add(n, Ordering::SeqCst) + n;
                    let _ = events_tx.try_send(TaskEvent::DidWrite {
                        id: id.clone(),
                        written: n,
                        total_written,
                        total_expected: total,
                    });
                    Ok(bytes.freeze())
                }
                Err(e) => Err(e),
            },
        );

    let body = reqwest::Body::wrap_stream(body_stream);
    let response = match inner
        .client
        .post(inner.url.clone())
        .headers(inner.headers.clone())
        .timeout(inner.timeout)
        .body(body)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            match inner.control.load(Ordering::SeqCst) {
                SIGNAL_SUSPEND => {
                    suspend_upload(&inner).await;
                    return;
                }
                SIGNAL_CANCEL => {
                    upload_complete_with_error(&inner, "canceled by user".to_string(), None, true).await;
                    return;
                }
                _ => {
                    upload_complete_with_error(&inner, e.to_string(), None, false).await;
                    return;
                }
            }
        }
    };

    let status = response.status();
    let mut stream = response.bytes_stream();
    loop {
        match inner.control.load(Ordering::SeqCst) {
            SIGNAL_CANCEL => {
                upload_complete_with_error(&inner, "canceled by user".to_string(), None, true).await;
                return;
            }
            SIGNAL_SUSPEND => {
                suspend_upload(&inner).await;
                return;
            }
            _ => {}
        }
        match stream.next().await {
            Some(Ok(chunk)) => {
                let _ = inner
                    .events_tx
                    .send(TaskEvent::DidReceive {
                        id: inner.id.clone(),
                        data: chunk,
                    })
                    .await;
            }
            Some(Err(e)) => {
                upload_complete_with_error(&inner, e.to_string(), None, false).await;
                return;
            }
            None => break,
        }
    }

    inner.state.store(ST_COMPLETED, Ordering::SeqCst);
    inner.notify.notify_waiters();
    let error = if status.is_success() {
        None
    } else {
        Some(TaskFailure {
            message: format!("server error {}", status.as_u16()),
            status: Some(status.as_u16()),
            resume_token: None,
            canceled: false,
        })
    };
    let _ = inner
        .events_tx
        .send(TaskEvent::DidComplete {
            id: inner.id.clone(),
            error,
        })
        .await;
}

/// Marks the task `Suspended` without firing `DidComplete` — the in-flight
/// request is simply abandoned; `resume()` restarts the upload from scratch
/// since uploads have no resume-token equivalent (§4.6).
async fn suspend_upload(inner: &Arc<UploadInner>) {
    inner.state.store(ST_SUSPENDED, Ordering::SeqCst);
    inner.notify.notify_waiters();
}

async fn upload_complete_with_error(
    inner: &Arc<UploadInner>,
    message: String,
    status: Option<u16>,
    canceled: bool,
) {
    inner.state.store(ST_COMPLETED, Ordering::SeqCst);
    inner.notify.notify_waiters();
    let _ = inner
        .events_tx
        .send(TaskEvent::DidComplete {
            id: inner.id.clone(),
            error: Some(TaskFailure {
                message,
                status,
                resume_token: None,
                canceled,
            }),
        })
        .await;
}

/// Shared by both coordinators: turns a task-reported failure into the
/// public error taxonomy (§7). A status code always wins over the raw
/// message since it is the more specific signal.
pub(crate) fn map_task_failure(failure: &TaskFailure) -> TransferError {
    match failure.status {
        Some(status) => TransferError::ServerError(status),
        None => TransferError::Transport(failure.message.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_token_round_trips() {
        let token = DownloadResumeToken {
            spool_path: PathBuf::from("/tmp/abc.part"),
            offset: 4096,
        };
        let encoded = token.encode();
        let decoded = DownloadResumeToken::decode(&encoded).unwrap();
        assert_eq!(decoded.spool_path, token.spool_path);
        assert_eq!(decoded.offset, token.offset);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(DownloadResumeToken::decode(b"not json").is_none());
    }
}
