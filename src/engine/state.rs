use std::fmt;

/// Identifier of one upload task, unique within a registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// Lifecycle of a single upload. Terminal payloads live inside their variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    Uploading,
    Succeeded { resource_id: String },
    Failed(FailureReason),
    Cancelled,
}

impl UploadStatus {
    pub fn label(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Succeeded { .. } => "succeeded",
            UploadStatus::Failed(_) => "failed",
            UploadStatus::Cancelled => "cancelled",
        }
    }

    /// `Succeeded`, `Failed` and `Cancelled` are settled; only `Failed` may
    /// still move again through a retry.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            UploadStatus::Succeeded { .. } | UploadStatus::Failed(_) | UploadStatus::Cancelled
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why an upload ended in `Failed`.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("network error: {0}")]
    Network(String),

    /// The local file could not be opened; nothing was sent.
    #[error("cannot read file: {0}")]
    File(String),

    #[error("server responded {status} {status_text}")]
    Server { status: u16, status_text: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl FailureReason {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FailureReason::Network(_) | FailureReason::File(_) => ErrorKind::NetworkError,
            FailureReason::Server { .. } => ErrorKind::ServerError,
            FailureReason::MalformedResponse(_) => ErrorKind::MalformedResponse,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NetworkError,
    ServerError,
    MalformedResponse,
    UserCancelled,
}

/// An operation was requested in a state that has no edge for it.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} task {task} while {status}")]
pub struct TransitionError {
    pub task: TaskId,
    pub action: &'static str,
    pub status: &'static str,
}

// Intents posted back by a presentation adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserIntent {
    Cancel(TaskId),
    Retry(TaskId),
}
