use std::time::{Duration, Instant};

use futures_util::StreamExt;
use futures_util::stream;
use log::{debug, warn};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::engine::models::SelectedFile;
use crate::engine::state::TaskId;

/// Multipart field carrying the file.
pub const FILE_FIELD: &str = "file";

const CHUNK_SIZE: usize = 64 * 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Everything needed to issue one store request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadRequest {
    pub endpoint: String,
    pub token: Option<String>,
    pub file: SelectedFile,
    pub field: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// `timestamp_ms` counts from the moment the request was issued.
    Progress {
        loaded: u64,
        total: Option<u64>,
        timestamp_ms: u64,
    },
    /// `status_text` is the canonical reason phrase for `status`, empty for
    /// codes without one; the phrase the server actually sent is not kept.
    Complete {
        status: u16,
        status_text: String,
        body: String,
    },
    /// No response was received.
    NetworkError(String),
    /// The file to upload could not be opened or inspected.
    FileError(String),
    /// The transfer was torn down without the controller asking for it.
    Aborted,
}

/// A transport event tagged with the task and attempt that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportMessage {
    pub task: TaskId,
    pub attempt: u32,
    pub event: TransportEvent,
}

/// Where a transfer reports its events.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportMessage>,
    task: TaskId,
    attempt: u32,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<TransportMessage>, task: TaskId, attempt: u32) -> Self {
        Self { tx, task, attempt }
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(TransportMessage {
            task: self.task,
            attempt: self.attempt,
            event,
        });
    }
}

/// Control over one in-flight transfer.
pub trait TransferHandle {
    fn abort(&mut self);
}

/// Issues store requests. Each call starts an independent transfer.
pub trait Transport {
    fn send(&self, request: UploadRequest, events: EventSink) -> Box<dyn TransferHandle>;
}

/// reqwest-backed transport running every transfer as its own tokio task.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    runtime: Handle,
}

impl HttpTransport {
    pub fn new(runtime: Handle) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|err| {
                warn!("network client: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self::with_client(client, runtime)
    }

    pub fn with_client(client: Client, runtime: Handle) -> Self {
        Self { client, runtime }
    }
}

struct SpawnedTransfer {
    handle: AbortHandle,
}

impl TransferHandle for SpawnedTransfer {
    fn abort(&mut self) {
        self.handle.abort();
    }
}

// Reports `Aborted` when a transfer future is dropped before it finished.
struct AbortNotice {
    events: EventSink,
    armed: bool,
}

impl Drop for AbortNotice {
    fn drop(&mut self) {
        if self.armed {
            self.events.emit(TransportEvent::Aborted);
        }
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: UploadRequest, events: EventSink) -> Box<dyn TransferHandle> {
        let client = self.client.clone();
        let join = self.runtime.spawn(async move {
            let mut notice = AbortNotice {
                events: events.clone(),
                armed: true,
            };
            let opened = open_file(&request.file).await;
            let event = match opened {
                Ok((file, total)) => match post_file(&client, request, file, total, &events).await
                {
                    Ok(event) => event,
                    Err(err) => TransportEvent::NetworkError(err),
                },
                Err(err) => TransportEvent::FileError(err),
            };
            notice.armed = false;
            events.emit(event);
        });
        Box::new(SpawnedTransfer {
            handle: join.abort_handle(),
        })
    }
}

async fn open_file(selected: &SelectedFile) -> Result<(File, u64), String> {
    let file = File::open(&selected.path)
        .await
        .map_err(|e| format!("failed to open {}: {e}", selected.path.display()))?;
    let total = file
        .metadata()
        .await
        .map_err(|e| format!("failed to stat {}: {e}", selected.path.display()))?
        .len();
    Ok((file, total))
}

async fn post_file(
    client: &Client,
    request: UploadRequest,
    file: File,
    total: u64,
    events: &EventSink,
) -> Result<TransportEvent, String> {
    let started = Instant::now();
    let body = progress_body(file, total, started, events.clone());
    let part = Part::stream_with_length(body, total).file_name(request.file.name.clone());
    let form = Form::new().part(request.field, part);

    let mut builder = client.post(&request.endpoint).multipart(form);
    if let Some(token) = &request.token {
        builder = builder.bearer_auth(token);
    }

    debug!(
        "store request: POST {} ({} bytes of {})",
        request.endpoint, total, request.file.name
    );
    let response = builder
        .send()
        .await
        .map_err(|e| format!("store request failed: {e}"))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| format!("failed to read store response: {e}"))?;

    Ok(TransportEvent::Complete {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_owned(),
        body,
    })
}

// Streams the file in chunks, reporting bytes handed to the HTTP client.
fn progress_body(file: File, total: u64, started: Instant, events: EventSink) -> Body {
    let chunks = stream::unfold(Some(file), |state| async move {
        let mut file = state?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(read) => {
                buf.truncate(read);
                Some((Ok(buf), Some(file)))
            }
            Err(err) => Some((Err(err), None)),
        }
    });

    let mut loaded = 0u64;
    let mut last_report: Option<Instant> = None;
    let reported = chunks.map(move |chunk: Result<Vec<u8>, std::io::Error>| {
        if let Ok(bytes) = &chunk {
            loaded += bytes.len() as u64;
            let due = last_report.is_none_or(|at| at.elapsed() >= PROGRESS_INTERVAL);
            if due || loaded >= total {
                last_report = Some(Instant::now());
                events.emit(TransportEvent::Progress {
                    loaded,
                    total: Some(total),
                    timestamp_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
        chunk
    });

    Body::wrap_stream(reported)
}
