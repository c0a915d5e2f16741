//! Task core
//!
//! A [`Task`] wraps one [`TaskKind`] and runs it at most once. The first
//! call to [`Task::done`] starts execution; every caller, earlier or later,
//! receives a clone of the same shared completion future. Once the outcome
//! is known, `done()` returns an already-completed future.
//!
//! Export and upload tasks write to the server and the local store, so a
//! second execution would repeat side effects. `done()` therefore never
//! re-runs a task, even after every waiter has gone away.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Instant;
use tokio::sync::watch;
use uuid::Uuid;

use super::download::{DataDownload, DownloadReport, FileDownload, SchemaDownload};
use super::export::DataExport;
use super::upload::{DataUpload, UploadReport};
use crate::error::SyncError;

/// Shared outcome of a task
///
/// `Ok` is the task's resolution, `Err` its rejection.
pub type TaskResult = Result<TaskOutput, Arc<SyncError>>;

/// Completion signal handed to every waiter
pub type Completion = Shared<BoxFuture<'static, TaskResult>>;

/// Value a task resolves with
#[derive(Clone)]
pub enum TaskOutput {
    /// An export resolves with the upload task that sends its payload
    Upload(Arc<Task>),
    Uploaded(UploadReport),
    Downloaded(DownloadReport),
    /// Local URI of a downloaded attachment
    File(String),
    /// Downloaded form definition
    Schema(Value),
}

impl fmt::Debug for TaskOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload(task) => f.debug_tuple("Upload").field(&task.id()).finish(),
            Self::Uploaded(report) => f.debug_tuple("Uploaded").field(report).finish(),
            Self::Downloaded(report) => f.debug_tuple("Downloaded").field(report).finish(),
            Self::File(uri) => f.debug_tuple("File").field(uri).finish(),
            Self::Schema(schema) => f.debug_tuple("Schema").field(schema).finish(),
        }
    }
}

/// Interim progress published while a task runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskProgress {
    /// A fixed-point round is loading referenced tables
    Loading { round: usize, tables: Vec<String> },
    /// The reference graph is complete and records are being encoded
    Encoding { tables: usize, records: usize },
    Sending { records: usize, attachments: usize },
    Fetching { endpoint: String },
    Importing { records: usize },
}

/// Observable lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// `done()` has not been called yet
    Pending,
    Running,
    Success,
    Error,
}

/// The closed set of task variants
pub enum TaskKind {
    DataExport(DataExport),
    DataUpload(DataUpload),
    DataDownload(DataDownload),
    FileDownload(FileDownload),
    SchemaDownload(SchemaDownload),
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DataExport(_) => "data_export",
            Self::DataUpload(_) => "data_upload",
            Self::DataDownload(_) => "data_download",
            Self::FileDownload(_) => "file_download",
            Self::SchemaDownload(_) => "schema_download",
        }
    }

    async fn execute(&self, task: &Task) -> Result<TaskOutput, SyncError> {
        match self {
            Self::DataExport(export) => export.execute(task).await,
            Self::DataUpload(upload) => upload.execute(task).await,
            Self::DataDownload(download) => download.execute(task).await,
            Self::FileDownload(download) => download.execute(task).await,
            Self::SchemaDownload(download) => download.execute(task).await,
        }
    }
}

/// Executable unit backing a job
pub struct Task {
    id: Uuid,
    kind: TaskKind,
    completion: Mutex<Option<Completion>>,
    executions: AtomicUsize,
    progress: watch::Sender<Option<TaskProgress>>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kind", &self.kind.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Task {
    pub fn new(kind: TaskKind) -> Arc<Self> {
        let (progress, _) = watch::channel(None);
        Arc::new(Self {
            id: Uuid::new_v4(),
            kind,
            completion: Mutex::new(None),
            executions: AtomicUsize::new(0),
            progress,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    /// Completion signal of this task, starting execution on first call
    ///
    /// Every call returns a clone of the same future. A panic inside the
    /// task body is converted into a rejection.
    pub fn done(self: &Arc<Self>) -> Completion {
        let mut completion = self
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(shared) = completion.as_ref() {
            return shared.clone();
        }

        let task = Arc::downgrade(self);
        let shared = run(task).boxed().shared();
        *completion = Some(shared.clone());
        shared
    }

    /// Lifecycle derived from the completion signal
    pub fn state(&self) -> TaskState {
        let completion = self
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match completion.as_ref().map(Shared::peek) {
            None => TaskState::Pending,
            Some(None) => TaskState::Running,
            Some(Some(Ok(_))) => TaskState::Success,
            Some(Some(Err(_))) => TaskState::Error,
        }
    }

    /// How many times the task body has been entered (0 or 1)
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Report interim progress to every subscriber without completing the task
    pub fn notify(&self, progress: TaskProgress) {
        tracing::trace!(task_id = %self.id, ?progress, "Task progress");
        self.progress.send_replace(Some(progress));
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<TaskProgress>> {
        self.progress.subscribe()
    }
}

async fn run(task: Weak<Task>) -> TaskResult {
    let Some(task) = task.upgrade() else {
        return Err(Arc::new(SyncError::Internal(anyhow::anyhow!(
            "task dropped before it was started"
        ))));
    };

    task.executions.fetch_add(1, Ordering::SeqCst);
    let name = task.kind.name();
    let started = Instant::now();
    tracing::debug!(task_id = %task.id, task = name, "Task started");

    let outcome = AssertUnwindSafe(task.kind.execute(&task))
        .catch_unwind()
        .await;

    let result = match outcome {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(error)) => Err(Arc::new(error)),
        Err(panic) => Err(Arc::new(SyncError::Internal(anyhow::anyhow!(
            "{} task panicked: {}",
            name,
            panic_message(panic.as_ref())
        )))),
    };

    let status = match &result {
        Ok(_) => "success",
        Err(error) => error.kind(),
    };
    crate::metrics::observe_task(name, status, started.elapsed());
    match &result {
        Ok(_) => tracing::debug!(task_id = %task.id, task = name, "Task resolved"),
        Err(error) => tracing::debug!(task_id = %task.id, task = name, %error, "Task rejected"),
    }

    result
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
