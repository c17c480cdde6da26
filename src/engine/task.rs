use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::credentials::CredentialSource;
use crate::engine::models::{SelectedFile, parse_resource_id};
use crate::engine::state::{ErrorKind, FailureReason, TaskId, TransitionError, UploadStatus};
use crate::engine::throughput::{Sample, ThroughputSampler};
use crate::networking::{
    EventSink, FILE_FIELD, TransferHandle, Transport, TransportEvent, TransportMessage,
    UploadRequest,
};

const SUCCESS_STATUS: u16 = 200;

/// What a task needs from its owner to issue a request.
pub struct StartContext<'a> {
    pub endpoint: &'a str,
    pub transport: &'a dyn Transport,
    pub credentials: &'a dyn CredentialSource,
    pub events: &'a mpsc::UnboundedSender<TransportMessage>,
}

/// Observable effect of feeding an event or command into a task.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TaskChange {
    Unchanged,
    Progress { rate: Option<f64> },
    Status,
}

/// One file's upload transaction.
pub struct UploadTask {
    id: TaskId,
    file: SelectedFile,
    status: UploadStatus,
    bytes_loaded: u64,
    bytes_total: Option<u64>,
    sampler: ThroughputSampler,
    attempt: u32,
    transfer: Option<Box<dyn TransferHandle>>,
}

impl UploadTask {
    pub fn new(id: TaskId, file: SelectedFile) -> Self {
        Self {
            id,
            file,
            status: UploadStatus::Pending,
            bytes_loaded: 0,
            bytes_total: None,
            sampler: ThroughputSampler::new(),
            attempt: 0,
            transfer: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn file_name(&self) -> &str {
        &self.file.name
    }

    pub fn status(&self) -> &UploadStatus {
        &self.status
    }

    pub fn bytes_loaded(&self) -> u64 {
        self.bytes_loaded
    }

    pub fn bytes_total(&self) -> Option<u64> {
        self.bytes_total
    }

    #[allow(dead_code)]
    pub fn last_sample(&self) -> Option<Sample> {
        self.sampler.last_sample()
    }

    /// Number of times the request has been issued.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn result(&self) -> Option<&str> {
        match &self.status {
            UploadStatus::Succeeded { resource_id } => Some(resource_id),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match &self.status {
            UploadStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.status {
            UploadStatus::Failed(reason) => Some(reason.kind()),
            UploadStatus::Cancelled => Some(ErrorKind::UserCancelled),
            _ => None,
        }
    }

    pub fn can_cancel(&self) -> bool {
        self.status == UploadStatus::Uploading
    }

    // User cancellation is not a failure and never offers a retry.
    pub fn can_retry(&self) -> bool {
        matches!(self.status, UploadStatus::Failed(_))
    }

    pub fn start(&mut self, ctx: &StartContext<'_>) -> Result<(), TransitionError> {
        if self.status != UploadStatus::Pending {
            return Err(self.invalid("start"));
        }
        self.issue(ctx);
        Ok(())
    }

    /// Re-run the same transaction from scratch after a failure.
    pub fn retry(&mut self, ctx: &StartContext<'_>) -> Result<(), TransitionError> {
        if !self.can_retry() {
            return Err(self.invalid("retry"));
        }
        info!("upload {}: retrying {}", self.id, self.file.name);
        self.issue(ctx);
        Ok(())
    }

    /// Abort the in-flight transfer. A no-op unless uploading.
    pub fn cancel(&mut self) -> TaskChange {
        if !self.can_cancel() {
            debug!("upload {}: cancel ignored while {}", self.id, self.status);
            return TaskChange::Unchanged;
        }
        if let Some(mut transfer) = self.transfer.take() {
            transfer.abort();
        }
        info!("upload {}: cancelled by user", self.id);
        self.status = UploadStatus::Cancelled;
        TaskChange::Status
    }

    /// Route a transport event. Events from earlier attempts are dropped.
    pub fn handle_event(&mut self, attempt: u32, event: TransportEvent) -> TaskChange {
        if attempt != self.attempt {
            debug!(
                "upload {}: dropping event from attempt {attempt} (current {})",
                self.id, self.attempt
            );
            return TaskChange::Unchanged;
        }
        match event {
            TransportEvent::Progress {
                loaded,
                total,
                timestamp_ms,
            } => self.on_progress(loaded, total, timestamp_ms),
            TransportEvent::Complete {
                status,
                status_text,
                body,
            } => self.on_complete(status, &status_text, &body),
            TransportEvent::NetworkError(message) => self.on_network_error(message),
            TransportEvent::FileError(message) => self.on_file_error(message),
            TransportEvent::Aborted => self.on_aborted(),
        }
    }

    pub fn on_progress(&mut self, loaded: u64, total: Option<u64>, timestamp_ms: u64) -> TaskChange {
        if self.status != UploadStatus::Uploading {
            return TaskChange::Unchanged;
        }
        // A total learned late never drops below what was already counted.
        if self.bytes_total.is_none() {
            self.bytes_total = total.map(|total| total.max(self.bytes_loaded));
        }
        let mut loaded = loaded.max(self.bytes_loaded);
        if let Some(total) = self.bytes_total {
            loaded = loaded.min(total);
        }
        self.bytes_loaded = loaded;

        let rate = self.sampler.sample(timestamp_ms, loaded);
        debug!(
            "upload {}: {loaded}/{:?} bytes, rate {rate:?}",
            self.id, self.bytes_total
        );
        TaskChange::Progress { rate }
    }

    pub fn on_complete(&mut self, status: u16, status_text: &str, body: &str) -> TaskChange {
        if self.status != UploadStatus::Uploading {
            return TaskChange::Unchanged;
        }
        self.transfer = None;

        if status != SUCCESS_STATUS {
            warn!(
                "upload {}: store request failed with status {status} ({status_text})",
                self.id
            );
            self.status = UploadStatus::Failed(FailureReason::Server {
                status,
                status_text: status_text.to_owned(),
            });
            return TaskChange::Status;
        }

        self.status = match parse_resource_id(body) {
            Ok(resource_id) => {
                info!(
                    "upload {}: {} stored as {resource_id}",
                    self.id, self.file.name
                );
                if let Some(total) = self.bytes_total {
                    self.bytes_loaded = total;
                }
                UploadStatus::Succeeded { resource_id }
            }
            Err(err) => {
                warn!("upload {}: {err}", self.id);
                UploadStatus::Failed(FailureReason::MalformedResponse(err))
            }
        };
        TaskChange::Status
    }

    pub fn on_network_error(&mut self, message: String) -> TaskChange {
        if self.status != UploadStatus::Uploading {
            return TaskChange::Unchanged;
        }
        warn!("upload {}: {message}", self.id);
        self.transfer = None;
        self.status = UploadStatus::Failed(FailureReason::Network(message));
        TaskChange::Status
    }

    pub fn on_file_error(&mut self, message: String) -> TaskChange {
        if self.status != UploadStatus::Uploading {
            return TaskChange::Unchanged;
        }
        warn!("upload {}: {message}", self.id);
        self.transfer = None;
        self.status = UploadStatus::Failed(FailureReason::File(message));
        TaskChange::Status
    }

    pub fn on_aborted(&mut self) -> TaskChange {
        if self.status != UploadStatus::Uploading {
            return TaskChange::Unchanged;
        }
        info!("upload {}: transfer aborted", self.id);
        self.transfer = None;
        self.status = UploadStatus::Cancelled;
        TaskChange::Status
    }

    fn issue(&mut self, ctx: &StartContext<'_>) {
        let token = ctx.credentials.bearer_token();
        if token.is_none() {
            warn!(
                "upload {}: no bearer token available; sending without authorization",
                self.id
            );
        }
        let request = UploadRequest {
            endpoint: ctx.endpoint.to_owned(),
            token,
            file: self.file.clone(),
            field: FILE_FIELD,
        };

        self.attempt += 1;
        self.bytes_loaded = 0;
        self.bytes_total = None;
        self.sampler.reset(Sample {
            timestamp_ms: 0,
            bytes: 0,
        });
        let sink = EventSink::new(ctx.events.clone(), self.id, self.attempt);
        self.transfer = Some(ctx.transport.send(request, sink));
        self.status = UploadStatus::Uploading;
        debug!(
            "upload {}: attempt {} issued to {}",
            self.id, self.attempt, ctx.endpoint
        );
    }

    fn invalid(&self, action: &'static str) -> TransitionError {
        TransitionError {
            task: self.id,
            action,
            status: self.status.label(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeTransport, NoToken};
    use super::*;
    use crate::credentials::StaticToken;

    const ENDPOINT: &str = "http://localhost:8080/api/store";

    struct Fixture {
        transport: FakeTransport,
        credentials: StaticToken,
        tx: mpsc::UnboundedSender<TransportMessage>,
        _rx: mpsc::UnboundedReceiver<TransportMessage>,
    }

    impl Fixture {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                transport: FakeTransport::default(),
                credentials: StaticToken("token-1".into()),
                tx,
                _rx: rx,
            }
        }

        fn ctx(&self) -> StartContext<'_> {
            StartContext {
                endpoint: ENDPOINT,
                transport: &self.transport,
                credentials: &self.credentials,
                events: &self.tx,
            }
        }
    }

    fn task() -> UploadTask {
        UploadTask::new(TaskId(1), SelectedFile::new("photo.jpg", "/tmp/photo.jpg"))
    }

    #[test]
    fn start_issues_authorized_multipart_request() {
        let fixture = Fixture::new();
        let mut task = task();
        assert_eq!(task.status(), &UploadStatus::Pending);

        task.start(&fixture.ctx()).unwrap();

        assert_eq!(task.status(), &UploadStatus::Uploading);
        assert_eq!(task.attempt(), 1);
        let requests = fixture.transport.requests.borrow();
        assert_eq!(
            requests.as_slice(),
            &[UploadRequest {
                endpoint: ENDPOINT.into(),
                token: Some("token-1".into()),
                file: SelectedFile::new("photo.jpg", "/tmp/photo.jpg"),
                field: "file",
            }]
        );
    }

    #[test]
    fn start_requires_pending() {
        let fixture = Fixture::new();
        let mut task = task();
        task.start(&fixture.ctx()).unwrap();
        let err = task.start(&fixture.ctx()).unwrap_err();
        assert_eq!(err.action, "start");
        assert_eq!(err.status, "uploading");
        assert_eq!(fixture.transport.requests.borrow().len(), 1);
    }

    #[test]
    fn progress_then_success_yields_resource_id() {
        let fixture = Fixture::new();
        let mut task = task();
        task.start(&fixture.ctx()).unwrap();

        assert_eq!(
            task.on_progress(250, Some(500), 500),
            TaskChange::Progress { rate: Some(500.0) }
        );
        assert_eq!(
            task.on_progress(500, Some(500), 1000),
            TaskChange::Progress { rate: Some(500.0) }
        );
        assert_eq!(task.bytes_loaded(), 500);
        assert_eq!(task.bytes_total(), Some(500));
        assert_eq!(
            task.last_sample(),
            Some(Sample {
                timestamp_ms: 1000,
                bytes: 500
            })
        );

        assert_eq!(
            task.on_complete(200, "OK", r#"{"file":{"id":"abc"}}"#),
            TaskChange::Status
        );
        assert_eq!(task.result(), Some("abc"));
        assert_eq!(task.failure_reason(), None);
        assert!(!task.can_retry());
    }

    #[test]
    fn progress_tolerates_unknown_total_and_stays_monotonic() {
        let fixture = Fixture::new();
        let mut task = task();
        task.start(&fixture.ctx()).unwrap();

        task.on_progress(300, None, 100);
        assert_eq!(task.bytes_total(), None);
        task.on_progress(200, None, 200);
        assert_eq!(task.bytes_loaded(), 300);

        task.on_progress(900, Some(600), 300);
        assert_eq!(task.bytes_total(), Some(600));
        assert_eq!(task.bytes_loaded(), 600);
    }

    #[test]
    fn late_total_smaller_than_loaded_keeps_count() {
        let fixture = Fixture::new();
        let mut task = task();
        task.start(&fixture.ctx()).unwrap();

        task.on_progress(900, None, 10);
        task.on_progress(950, Some(600), 20);
        assert_eq!(task.bytes_total(), Some(900));
        assert_eq!(task.bytes_loaded(), 900);

        task.on_progress(1200, Some(1200), 30);
        assert_eq!(task.bytes_loaded(), 900);
    }

    #[test]
    fn server_error_is_retryable_and_reissues_same_request() {
        let fixture = Fixture::new();
        let mut task = task();
        task.start(&fixture.ctx()).unwrap();
        task.on_progress(100, Some(500), 50);

        task.on_complete(500, "Internal Server Error", "oops");
        assert_eq!(
            task.failure_reason(),
            Some(&FailureReason::Server {
                status: 500,
                status_text: "Internal Server Error".into()
            })
        );
        assert_eq!(task.error_kind(), Some(ErrorKind::ServerError));
        assert!(task.can_retry());

        task.retry(&fixture.ctx()).unwrap();
        assert_eq!(task.status(), &UploadStatus::Uploading);
        assert_eq!(task.attempt(), 2);
        assert_eq!(task.bytes_loaded(), 0);

        let requests = fixture.transport.requests.borrow();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], requests[1]);
    }

    #[test]
    fn malformed_success_body_fails() {
        let fixture = Fixture::new();
        let mut task = task();
        task.start(&fixture.ctx()).unwrap();
        task.on_complete(200, "OK", "<html>");
        assert_eq!(task.error_kind(), Some(ErrorKind::MalformedResponse));
        assert!(task.can_retry());
    }

    #[test]
    fn cancel_is_idempotent_and_not_retryable() {
        let fixture = Fixture::new();
        let mut task = task();
        task.start(&fixture.ctx()).unwrap();

        assert_eq!(task.cancel(), TaskChange::Status);
        assert_eq!(task.status(), &UploadStatus::Cancelled);
        assert_eq!(task.cancel(), TaskChange::Unchanged);
        assert_eq!(task.status(), &UploadStatus::Cancelled);
        assert_eq!(*fixture.transport.aborts.borrow(), 1);

        assert_eq!(task.error_kind(), Some(ErrorKind::UserCancelled));
        assert!(!task.can_retry());
        assert!(task.retry(&fixture.ctx()).is_err());
        assert_eq!(fixture.transport.requests.borrow().len(), 1);
    }

    #[test]
    fn cancel_before_start_is_a_noop() {
        let mut task = task();
        assert_eq!(task.cancel(), TaskChange::Unchanged);
        assert_eq!(task.status(), &UploadStatus::Pending);
    }

    #[test]
    fn network_error_fails_but_transport_abort_cancels() {
        let fixture = Fixture::new();
        let mut failed = task();
        failed.start(&fixture.ctx()).unwrap();
        failed.handle_event(1, TransportEvent::NetworkError("connection refused".into()));
        assert_eq!(failed.error_kind(), Some(ErrorKind::NetworkError));
        assert!(failed.can_retry());

        let mut unreadable = task();
        unreadable.start(&fixture.ctx()).unwrap();
        unreadable.handle_event(1, TransportEvent::FileError("failed to open photo.jpg".into()));
        assert!(matches!(
            unreadable.failure_reason(),
            Some(FailureReason::File(message)) if message.contains("photo.jpg")
        ));
        assert_eq!(
            unreadable.failure_reason().map(ToString::to_string).as_deref(),
            Some("cannot read file: failed to open photo.jpg")
        );
        assert!(unreadable.can_retry());

        let mut aborted = task();
        aborted.start(&fixture.ctx()).unwrap();
        aborted.handle_event(1, TransportEvent::Aborted);
        assert_eq!(aborted.status(), &UploadStatus::Cancelled);
        assert!(!aborted.can_retry());
    }

    #[test]
    fn events_after_terminal_state_are_ignored() {
        let fixture = Fixture::new();
        let mut task = task();
        task.start(&fixture.ctx()).unwrap();
        task.cancel();
        assert_eq!(
            task.on_complete(200, "OK", r#"{"file":{"id":"late"}}"#),
            TaskChange::Unchanged
        );
        assert_eq!(task.on_progress(10, Some(10), 5), TaskChange::Unchanged);
        assert_eq!(task.status(), &UploadStatus::Cancelled);
    }

    #[test]
    fn stale_attempt_events_are_dropped() {
        let fixture = Fixture::new();
        let mut task = task();
        task.start(&fixture.ctx()).unwrap();
        task.on_network_error("reset".into());
        task.retry(&fixture.ctx()).unwrap();

        let stale = task.handle_event(
            1,
            TransportEvent::Complete {
                status: 200,
                status_text: "OK".into(),
                body: r#"{"file":{"id":"old"}}"#.into(),
            },
        );
        assert_eq!(stale, TaskChange::Unchanged);
        assert_eq!(task.status(), &UploadStatus::Uploading);
    }

    #[test]
    fn missing_token_still_sends_request() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = FakeTransport::default();
        let ctx = StartContext {
            endpoint: ENDPOINT,
            transport: &transport,
            credentials: &NoToken,
            events: &tx,
        };
        let mut task = task();
        task.start(&ctx).unwrap();
        assert_eq!(transport.requests.borrow()[0].token, None);
    }
}
