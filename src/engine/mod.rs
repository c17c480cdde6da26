use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::credentials::CredentialSource;
use crate::engine::models::SelectedFile;
use crate::engine::state::{TaskId, TransitionError, UploadStatus, UserIntent};
use crate::engine::task::{StartContext, TaskChange, UploadTask};
use crate::networking::{Transport, TransportMessage};

pub mod models;
pub mod state;
pub mod task;
pub mod throughput;

/// Receives every successfully stored task.
pub type ResultSink = Box<dyn FnMut(&UploadTask)>;

/// Rendering hooks implemented by a front end.
pub trait PresentationAdapter {
    fn on_state_change(&mut self, task: &UploadTask);

    /// `rate` is in bytes per second; `None` while no estimate exists or when
    /// throughput display is turned off.
    fn on_progress(&mut self, task: &UploadTask, rate: Option<f64>);
}

/// Configuration shared by every task of a registry.
pub struct UploadOptions {
    pub endpoint: String,
    pub show_throughput: bool,
    pub allow_cancel: bool,
    pub on_success: Option<ResultSink>,
}

impl UploadOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            show_throughput: true,
            allow_cancel: true,
            on_success: None,
        }
    }
}

/// Owns the page's upload tasks in selection order and routes transport
/// events and user intents to them.
pub struct UploadRegistry<A: PresentationAdapter> {
    tasks: Vec<UploadTask>,
    next_id: u64,
    options: UploadOptions,
    transport: Box<dyn Transport>,
    credentials: Box<dyn CredentialSource>,
    adapter: A,
    events_tx: mpsc::UnboundedSender<TransportMessage>,
    events_rx: mpsc::UnboundedReceiver<TransportMessage>,
}

impl<A: PresentationAdapter> UploadRegistry<A> {
    pub fn new(
        options: UploadOptions,
        transport: Box<dyn Transport>,
        credentials: Box<dyn CredentialSource>,
        adapter: A,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            tasks: Vec::new(),
            next_id: 1,
            options,
            transport,
            credentials,
            adapter,
            events_tx,
            events_rx,
        }
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn tasks(&self) -> &[UploadTask] {
        &self.tasks
    }

    #[allow(dead_code)]
    pub fn get(&self, id: TaskId) -> Option<&UploadTask> {
        self.tasks.iter().find(|task| task.id() == id)
    }

    /// True once no task is pending or uploading.
    pub fn all_settled(&self) -> bool {
        self.tasks.iter().all(|task| task.status().is_settled())
    }

    /// Create a task for a freshly selected file and start it immediately.
    pub fn create_from_selection(&mut self, file: SelectedFile) -> &UploadTask {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        info!("upload {id}: selected {}", file.path.display());

        let task = UploadTask::new(id, file);
        self.adapter.on_state_change(&task);
        self.tasks.push(task);

        let index = self.tasks.len() - 1;
        let Self {
            tasks,
            options,
            transport,
            credentials,
            events_tx,
            adapter,
            ..
        } = &mut *self;
        let ctx = StartContext {
            endpoint: &options.endpoint,
            transport: transport.as_ref(),
            credentials: credentials.as_ref(),
            events: events_tx,
        };
        let task = &mut tasks[index];
        match task.start(&ctx) {
            Ok(()) => adapter.on_state_change(task),
            Err(err) => warn!("{err}"),
        }
        &self.tasks[index]
    }

    pub fn handle_intent(&mut self, intent: UserIntent) {
        match intent {
            UserIntent::Cancel(id) => {
                self.request_cancel(id);
            }
            UserIntent::Retry(id) => {
                if let Err(err) = self.request_retry(id) {
                    warn!("intent: {err}");
                }
            }
        }
    }

    /// Returns whether the task moved to `Cancelled`.
    pub fn request_cancel(&mut self, id: TaskId) -> bool {
        if !self.options.allow_cancel {
            warn!("intent: cancel of {id} ignored; cancellation is disabled");
            return false;
        }
        let Some(index) = self.index_of(id) else {
            warn!("intent: cancel for unknown task {id}");
            return false;
        };
        let change = self.tasks[index].cancel();
        self.notify(index, change);
        change == TaskChange::Status
    }

    pub fn request_retry(&mut self, id: TaskId) -> Result<(), TransitionError> {
        let Some(index) = self.index_of(id) else {
            warn!("intent: retry for unknown task {id}");
            return Ok(());
        };
        let Self {
            tasks,
            options,
            transport,
            credentials,
            events_tx,
            ..
        } = &mut *self;
        let ctx = StartContext {
            endpoint: &options.endpoint,
            transport: transport.as_ref(),
            credentials: credentials.as_ref(),
            events: events_tx,
        };
        tasks[index].retry(&ctx)?;
        self.notify(index, TaskChange::Status);
        Ok(())
    }

    /// Cancel every task that is still uploading.
    pub fn cancel_all(&mut self) {
        for index in 0..self.tasks.len() {
            let change = self.tasks[index].cancel();
            self.notify(index, change);
        }
    }

    /// Apply one transport message to the task that produced it.
    pub fn dispatch(&mut self, message: TransportMessage) {
        let Some(index) = self.index_of(message.task) else {
            debug!("dispatch: message for unknown task {}", message.task);
            return;
        };
        let change = self.tasks[index].handle_event(message.attempt, message.event);
        self.notify(index, change);
    }

    /// Dispatch every queued message without waiting. Returns how many were
    /// applied.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(message) = self.events_rx.try_recv() {
            self.dispatch(message);
            applied += 1;
        }
        applied
    }

    /// Wait for the next transport message.
    pub async fn next_message(&mut self) -> Option<TransportMessage> {
        self.events_rx.recv().await
    }

    fn index_of(&self, id: TaskId) -> Option<usize> {
        self.tasks.iter().position(|task| task.id() == id)
    }

    fn notify(&mut self, index: usize, change: TaskChange) {
        let task = &self.tasks[index];
        match change {
            TaskChange::Unchanged => {}
            TaskChange::Progress { rate } => {
                let rate = rate.filter(|_| self.options.show_throughput);
                self.adapter.on_progress(task, rate);
            }
            TaskChange::Status => {
                self.adapter.on_state_change(task);
                if matches!(task.status(), UploadStatus::Succeeded { .. })
                    && let Some(sink) = self.options.on_success.as_mut()
                {
                    sink(task);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::credentials::StaticToken;
    use crate::engine::state::{ErrorKind, FailureReason};
    use crate::engine::task::testing::FakeTransport;
    use crate::networking::TransportEvent;

    #[derive(Default)]
    pub struct RecordingAdapter {
        pub states: Vec<(TaskId, &'static str)>,
        pub rates: Vec<(TaskId, Option<f64>)>,
    }

    impl PresentationAdapter for RecordingAdapter {
        fn on_state_change(&mut self, task: &UploadTask) {
            self.states.push((task.id(), task.status().label()));
        }

        fn on_progress(&mut self, task: &UploadTask, rate: Option<f64>) {
            self.rates.push((task.id(), rate));
        }
    }

    fn registry_with(
        options: UploadOptions,
    ) -> (UploadRegistry<RecordingAdapter>, FakeTransport) {
        let transport = FakeTransport::default();
        let registry = UploadRegistry::new(
            options,
            Box::new(transport.clone()),
            Box::new(StaticToken("t".into())),
            RecordingAdapter::default(),
        );
        (registry, transport)
    }

    fn registry() -> (UploadRegistry<RecordingAdapter>, FakeTransport) {
        registry_with(UploadOptions::new("http://localhost:8080/api/store"))
    }

    fn message(task: TaskId, attempt: u32, event: TransportEvent) -> TransportMessage {
        TransportMessage {
            task,
            attempt,
            event,
        }
    }

    #[test]
    fn selection_creates_and_starts_task() {
        let (mut registry, transport) = registry();
        let id = registry
            .create_from_selection(SelectedFile::new("a.txt", "/tmp/a.txt"))
            .id();

        assert_eq!(registry.get(id).unwrap().status(), &UploadStatus::Uploading);
        assert_eq!(
            registry.adapter().states,
            vec![(id, "pending"), (id, "uploading")]
        );
        assert_eq!(transport.requests.borrow().len(), 1);
        assert!(!registry.all_settled());
    }

    #[test]
    fn tasks_are_independent() {
        let (mut registry, transport) = registry();
        let first = registry
            .create_from_selection(SelectedFile::new("a.txt", "/tmp/a.txt"))
            .id();
        let second = registry
            .create_from_selection(SelectedFile::new("b.txt", "/tmp/b.txt"))
            .id();
        assert_ne!(first, second);

        assert!(registry.request_cancel(first));
        assert_eq!(registry.get(first).unwrap().status(), &UploadStatus::Cancelled);
        assert_eq!(registry.get(second).unwrap().status(), &UploadStatus::Uploading);
        assert_eq!(*transport.aborts.borrow(), 1);

        let names: Vec<_> = registry.tasks().iter().map(|t| t.file_name()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn dispatch_drives_task_to_success_and_feeds_sink() {
        let stored = Rc::new(RefCell::new(Vec::new()));
        let sink_store = stored.clone();
        let mut options = UploadOptions::new("http://localhost:8080/api/store");
        options.on_success = Some(Box::new(move |task: &UploadTask| {
            sink_store
                .borrow_mut()
                .push(task.result().unwrap_or_default().to_owned());
        }));
        let (mut registry, _) = registry_with(options);
        let id = registry
            .create_from_selection(SelectedFile::new("a.bin", "/tmp/a.bin"))
            .id();

        registry.dispatch(message(
            id,
            1,
            TransportEvent::Progress {
                loaded: 250,
                total: Some(500),
                timestamp_ms: 250,
            },
        ));
        registry.dispatch(message(
            id,
            1,
            TransportEvent::Complete {
                status: 200,
                status_text: "OK".into(),
                body: r#"{"file":{"id":"abc"}}"#.into(),
            },
        ));

        assert_eq!(registry.get(id).unwrap().result(), Some("abc"));
        assert_eq!(registry.adapter().rates, vec![(id, Some(1000.0))]);
        assert_eq!(stored.borrow().as_slice(), &["abc".to_owned()]);
        assert!(registry.all_settled());
    }

    #[test]
    fn hides_rate_when_throughput_display_is_off() {
        let mut options = UploadOptions::new("http://localhost:8080/api/store");
        options.show_throughput = false;
        let (mut registry, _) = registry_with(options);
        let id = registry
            .create_from_selection(SelectedFile::new("a.bin", "/tmp/a.bin"))
            .id();
        registry.dispatch(message(
            id,
            1,
            TransportEvent::Progress {
                loaded: 10,
                total: Some(20),
                timestamp_ms: 10,
            },
        ));
        assert_eq!(registry.adapter().rates, vec![(id, None)]);
    }

    #[test]
    fn retry_intent_reissues_failed_upload() {
        let (mut registry, transport) = registry();
        let id = registry
            .create_from_selection(SelectedFile::new("a.bin", "/tmp/a.bin"))
            .id();
        registry.dispatch(message(
            id,
            1,
            TransportEvent::Complete {
                status: 500,
                status_text: "Internal Server Error".into(),
                body: String::new(),
            },
        ));
        let task = registry.get(id).unwrap();
        assert_eq!(task.error_kind(), Some(ErrorKind::ServerError));
        assert!(matches!(
            task.failure_reason(),
            Some(FailureReason::Server { status: 500, .. })
        ));

        registry.handle_intent(UserIntent::Retry(id));
        assert_eq!(registry.get(id).unwrap().status(), &UploadStatus::Uploading);
        assert_eq!(transport.requests.borrow().len(), 2);
        assert_eq!(
            registry.adapter().states.last(),
            Some(&(id, "uploading"))
        );
    }

    #[test]
    fn retry_of_cancelled_task_is_rejected() {
        let (mut registry, transport) = registry();
        let id = registry
            .create_from_selection(SelectedFile::new("a.bin", "/tmp/a.bin"))
            .id();
        registry.handle_intent(UserIntent::Cancel(id));
        assert!(registry.request_retry(id).is_err());
        assert_eq!(transport.requests.borrow().len(), 1);
    }

    #[test]
    fn cancel_intent_ignored_when_disabled() {
        let mut options = UploadOptions::new("http://localhost:8080/api/store");
        options.allow_cancel = false;
        let (mut registry, _) = registry_with(options);
        let id = registry
            .create_from_selection(SelectedFile::new("a.bin", "/tmp/a.bin"))
            .id();
        assert!(!registry.request_cancel(id));
        assert_eq!(registry.get(id).unwrap().status(), &UploadStatus::Uploading);
    }

    #[test]
    fn cancel_all_leaves_settled_tasks_alone() {
        let (mut registry, _) = registry();
        let done = registry
            .create_from_selection(SelectedFile::new("a.bin", "/tmp/a.bin"))
            .id();
        let running = registry
            .create_from_selection(SelectedFile::new("b.bin", "/tmp/b.bin"))
            .id();
        registry.dispatch(message(
            done,
            1,
            TransportEvent::Complete {
                status: 200,
                status_text: "OK".into(),
                body: r#"{"file":{"id":"x"}}"#.into(),
            },
        ));

        registry.cancel_all();
        assert_eq!(registry.get(done).unwrap().result(), Some("x"));
        assert_eq!(registry.get(running).unwrap().status(), &UploadStatus::Cancelled);
        assert!(registry.all_settled());
    }

    #[test]
    fn pump_drains_queued_messages() {
        let (mut registry, _) = registry();
        let id = registry
            .create_from_selection(SelectedFile::new("a.bin", "/tmp/a.bin"))
            .id();
        registry
            .events_tx
            .send(message(id, 1, TransportEvent::NetworkError("refused".into())))
            .unwrap();
        assert_eq!(registry.pump(), 1);
        assert_eq!(
            registry.get(id).unwrap().error_kind(),
            Some(ErrorKind::NetworkError)
        );
        assert_eq!(registry.pump(), 0);
    }
}
