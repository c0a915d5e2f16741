//! Sync jobs
//!
//! A [`SyncJob`] is one direction and type of work for one resource. It
//! holds status only: `pending -> running -> success | error | cancelled`.
//! Terminal statuses are final; setting a second result is a programming
//! error and fails loudly instead of flipping the status.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use super::download::{DataDownload, SchemaDownload};
use super::export::DataExport;
use super::reference::ReferenceRegistry;
use super::task::{Task, TaskKind};
use crate::SyncContext;
use crate::config::ResourceConfig;
use crate::error::SyncError;
use crate::metrics;
use crate::store::{SyncLog, SyncLogEntry, SyncResult};
use crate::transport::ServerRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Form definition
    Schema,
    /// Records
    Data,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Data => "data",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Pull,
    Push,
    #[default]
    Both,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
            Self::Both => "both",
        }
    }

    pub fn pulls(&self) -> bool {
        matches!(self, Self::Pull | Self::Both)
    }

    pub fn pushes(&self) -> bool {
        matches!(self, Self::Push | Self::Both)
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct JobState {
    status: JobStatus,
    message: Option<String>,
}

#[derive(Debug)]
pub struct SyncJob {
    id: Uuid,
    run_id: String,
    resource: String,
    table: String,
    job_type: JobType,
    mode: SyncMode,
    server_ref: ServerRef,
    state: Mutex<JobState>,
}

impl SyncJob {
    pub fn new(run_id: &str, resource: &ResourceConfig, job_type: JobType, mode: SyncMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id: run_id.to_string(),
            resource: resource.name.clone(),
            table: resource.table().to_string(),
            job_type,
            mode,
            server_ref: ServerRef::new(resource.endpoint(job_type)),
            state: Mutex::new(JobState::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn server_ref(&self) -> &ServerRef {
        &self.server_ref
    }

    pub fn status(&self) -> JobStatus {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    pub fn message(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .message
            .clone()
    }

    /// Human-readable job name, e.g. "push data person"
    pub fn label(&self) -> String {
        format!("{} {} {}", self.mode, self.job_type, self.resource)
    }

    /// Move to `running`
    ///
    /// # Errors
    /// `Cancelled` if the job was cancelled before it started,
    /// `InvalidTransition` for any other non-pending status
    pub fn start(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.status {
            JobStatus::Pending => {
                state.status = JobStatus::Running;
                drop(state);
                tracing::debug!(job_id = %self.id, job = %self.label(), "Job started");
                Ok(())
            }
            JobStatus::Cancelled => Err(SyncError::Cancelled),
            from => Err(SyncError::InvalidTransition {
                job: self.label(),
                from,
                to: JobStatus::Running,
            }),
        }
    }

    /// Set the terminal status and record it in the sync log
    ///
    /// # Errors
    /// `Validation` for a non-terminal `status`, `InvalidTransition` if the
    /// job already has a terminal status
    pub async fn result(
        &self,
        log: &dyn SyncLog,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<(), SyncError> {
        if let Err(error) = self.finish(status, message.clone()) {
            tracing::error!(job_id = %self.id, %error, "Rejected job result");
            return Err(error);
        }
        self.record(log, status, message).await;
        Ok(())
    }

    /// Cancel the job unless it already finished
    ///
    /// # Returns
    /// Whether the job was cancelled by this call
    pub async fn cancel(
        &self,
        log: &dyn SyncLog,
        reason: impl Into<String>,
    ) -> Result<bool, SyncError> {
        let message = Some(reason.into());
        match self.finish(JobStatus::Cancelled, message.clone()) {
            Ok(()) => {
                self.record(log, JobStatus::Cancelled, message).await;
                Ok(true)
            }
            Err(SyncError::InvalidTransition { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    fn finish(&self, status: JobStatus, message: Option<String>) -> Result<(), SyncError> {
        if !status.is_terminal() {
            return Err(SyncError::Validation(format!(
                "{} is not a terminal job status",
                status
            )));
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.status.is_terminal() {
            return Err(SyncError::InvalidTransition {
                job: self.label(),
                from: state.status,
                to: status,
            });
        }
        state.status = status;
        state.message = message;
        Ok(())
    }

    async fn record(&self, log: &dyn SyncLog, status: JobStatus, message: Option<String>) {
        let Some(result) = SyncResult::from_status(status) else {
            return;
        };

        match result {
            SyncResult::Success => tracing::info!(
                job_id = %self.id,
                resource = %self.resource,
                table = %self.table,
                job = %self.label(),
                message = ?message,
                "Job succeeded"
            ),
            SyncResult::Error => tracing::warn!(
                job_id = %self.id,
                resource = %self.resource,
                table = %self.table,
                job = %self.label(),
                error = ?message,
                "Job failed"
            ),
            SyncResult::Cancelled => tracing::info!(
                job_id = %self.id,
                resource = %self.resource,
                job = %self.label(),
                reason = ?message,
                "Job cancelled"
            ),
        }

        metrics::SYNC_JOBS_TOTAL
            .with_label_values(&[self.job_type.as_str(), self.mode.as_str(), status.as_str()])
            .inc();

        let entry = SyncLogEntry {
            run_id: self.run_id.clone(),
            job_id: self.id.to_string(),
            resource: self.resource.clone(),
            table: self.table.clone(),
            job_type: self.job_type,
            mode: self.mode,
            result,
            message,
            created_at: Utc::now(),
        };
        if let Err(error) = log.record(&entry).await {
            tracing::warn!(job_id = %self.id, %error, "Failed to write sync log entry");
        }
    }

    /// Task backing this job
    ///
    /// Push data jobs export (and then upload), pull schema jobs download
    /// the form definition, pull data jobs download records.
    pub fn task(
        &self,
        context: &SyncContext,
        references: &Arc<ReferenceRegistry>,
    ) -> Result<Arc<Task>, SyncError> {
        let kind = match (self.job_type, self.mode) {
            (JobType::Data, SyncMode::Push) => TaskKind::DataExport(DataExport::new(
                context.clone(),
                references.clone(),
                self.resource.clone(),
                self.table.clone(),
                self.server_ref.clone(),
            )),
            (JobType::Data, SyncMode::Pull) => TaskKind::DataDownload(DataDownload::new(
                context.clone(),
                self.resource.clone(),
                self.table.clone(),
                self.server_ref.clone(),
            )),
            (JobType::Schema, SyncMode::Pull) => TaskKind::SchemaDownload(SchemaDownload::new(
                context.clone(),
                self.resource.clone(),
                self.server_ref.clone(),
            )),
            (job_type, mode) => {
                return Err(SyncError::Validation(format!(
                    "no task for {} {} jobs",
                    mode, job_type
                )));
            }
        };
        Ok(Task::new(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::MockFileStore;
    use crate::store::MockSyncLog;
    use crate::sync::testing;
    use crate::transport::MockTransport;

    fn person() -> ResourceConfig {
        crate::config::tests::valid_config().sync.resources[0].clone()
    }

    fn job(job_type: JobType, mode: SyncMode) -> SyncJob {
        SyncJob::new("01RUN", &person(), job_type, mode)
    }

    fn recording_log(times: usize) -> MockSyncLog {
        let mut log = MockSyncLog::new();
        log.expect_record().times(times).returning(|_| Ok(()));
        log
    }

    #[test]
    fn endpoints_follow_job_type() {
        assert_eq!(job(JobType::Data, SyncMode::Push).server_ref().endpoint, "people");
        assert_eq!(
            job(JobType::Schema, SyncMode::Pull).server_ref().endpoint,
            "people/schema"
        );
        assert_eq!(job(JobType::Data, SyncMode::Push).label(), "push data person");
    }

    #[tokio::test]
    async fn terminal_result_is_logged_once() {
        let mut log = MockSyncLog::new();
        log.expect_record()
            .withf(|entry| {
                entry.resource == "person"
                    && entry.job_type == JobType::Data
                    && entry.mode == SyncMode::Push
                    && entry.result == SyncResult::Error
                    && entry.message.as_deref() == Some("HTTP 503")
            })
            .times(1)
            .returning(|_| Ok(()));

        let job = job(JobType::Data, SyncMode::Push);
        job.start().unwrap();
        assert_eq!(job.status(), JobStatus::Running);

        job.result(&log, JobStatus::Error, Some("HTTP 503".to_string()))
            .await
            .unwrap();
        assert_eq!(job.status(), JobStatus::Error);
        assert_eq!(job.message().as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn second_result_fails_without_flipping_status() {
        let log = recording_log(1);
        let job = job(JobType::Data, SyncMode::Push);
        job.start().unwrap();
        job.result(&log, JobStatus::Success, None).await.unwrap();

        let error = job
            .result(&log, JobStatus::Error, Some("late failure".to_string()))
            .await
            .expect_err("terminal status is final");

        assert!(matches!(
            error,
            SyncError::InvalidTransition {
                from: JobStatus::Success,
                to: JobStatus::Error,
                ..
            }
        ));
        assert_eq!(job.status(), JobStatus::Success);
        assert_eq!(job.message(), None);
    }

    #[tokio::test]
    async fn non_terminal_result_is_rejected() {
        let job = job(JobType::Data, SyncMode::Pull);
        let error = job
            .result(&recording_log(0), JobStatus::Running, None)
            .await
            .expect_err("running is not a result");
        assert!(matches!(error, SyncError::Validation(_)));
        assert_eq!(job.status(), JobStatus::Pending);
    }

    #[tokio::test]
    async fn cancelled_job_cannot_start() {
        let job = job(JobType::Data, SyncMode::Pull);
        assert!(job.cancel(&recording_log(1), "user request").await.unwrap());
        assert!(matches!(job.start(), Err(SyncError::Cancelled)));

        // Cancelling a finished job is a no-op
        assert!(!job.cancel(&recording_log(0), "again").await.unwrap());
        assert_eq!(job.message().as_deref(), Some("user request"));
    }

    #[tokio::test]
    async fn log_failure_does_not_fail_result() {
        let mut log = MockSyncLog::new();
        log.expect_record()
            .returning(|_| Err(SyncError::Storage("disk full".to_string())));

        let job = job(JobType::Schema, SyncMode::Pull);
        job.start().unwrap();
        assert!(job.result(&log, JobStatus::Success, None).await.is_ok());
    }

    #[test]
    fn task_follows_type_and_mode() {
        let context = testing::mock_context(MockTransport::new(), MockFileStore::new());
        let references = Arc::new(ReferenceRegistry::new("uuid"));
        let name = |job_type, mode| {
            job(job_type, mode)
                .task(&context, &references)
                .map(|task| task.kind().name())
        };

        assert_eq!(name(JobType::Data, SyncMode::Push).unwrap(), "data_export");
        assert_eq!(name(JobType::Data, SyncMode::Pull).unwrap(), "data_download");
        assert_eq!(name(JobType::Schema, SyncMode::Pull).unwrap(), "schema_download");
        assert!(matches!(
            name(JobType::Schema, SyncMode::Push),
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            name(JobType::Data, SyncMode::Both),
            Err(SyncError::Validation(_))
        ));
    }
}
