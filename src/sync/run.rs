//! Sync runs
//!
//! A [`SyncRun`] plans the jobs of every resource and drives them. Jobs of
//! one resource form a chain (schema pull, data pull, data push) and run in
//! order; a job whose predecessor did not succeed is cancelled. Chains of
//! different resources are independent and interleave on the current task.

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use ulid::Ulid;
use uuid::Uuid;

use super::job::{JobStatus, JobType, SyncJob, SyncMode};
use super::reference::ReferenceRegistry;
use super::task::{Task, TaskOutput};
use crate::SyncContext;
use crate::config::ResourceConfig;
use crate::error::SyncError;

/// Final state of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub resource: String,
    pub table: String,
    pub job_type: JobType,
    pub mode: SyncMode,
    pub status: JobStatus,
    pub message: Option<String>,
}

/// Outcome of a run, for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub jobs: Vec<JobSummary>,
}

impl RunSummary {
    fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|job| job.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(JobStatus::Success)
    }

    pub fn failed(&self) -> usize {
        self.count(JobStatus::Error)
    }

    pub fn cancelled(&self) -> usize {
        self.count(JobStatus::Cancelled)
    }

    /// Every job succeeded
    pub fn is_success(&self) -> bool {
        self.succeeded() == self.jobs.len()
    }
}

pub struct SyncRun {
    id: String,
    context: SyncContext,
    references: Arc<ReferenceRegistry>,
    /// One job chain per resource, in configuration order
    chains: Vec<Vec<Arc<SyncJob>>>,
}

impl SyncRun {
    /// Plan a run over every configured resource
    pub fn new(context: SyncContext) -> Self {
        let resources = context.config.sync.resources.clone();
        Self::with_resources(context, &resources)
    }

    pub fn with_resources(context: SyncContext, resources: &[ResourceConfig]) -> Self {
        let id = Ulid::new().to_string();
        let chains = resources
            .iter()
            .map(|resource| plan(&id, resource))
            .collect();
        let references = Arc::new(ReferenceRegistry::new(
            context.config.sync.uid_field.clone(),
        ));

        Self {
            id,
            context,
            references,
            chains,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Arc<SyncJob>> {
        self.chains.iter().flatten()
    }

    pub fn job(&self, id: Uuid) -> Option<Arc<SyncJob>> {
        self.jobs().find(|job| job.id() == id).cloned()
    }

    /// Cancel a job; a running job's result is discarded when it arrives
    ///
    /// # Returns
    /// Whether the job was cancelled (false if it had already finished)
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool, SyncError> {
        let job = self
            .job(job_id)
            .ok_or_else(|| SyncError::NotFound(format!("job {}", job_id)))?;
        job.cancel(self.context.sync_log.as_ref(), "cancelled by user")
            .await
    }

    /// Run every job chain to completion
    pub async fn run(&self) -> RunSummary {
        tracing::info!(
            run_id = %self.id,
            resources = self.chains.len(),
            jobs = self.jobs().count(),
            "Sync run started"
        );

        join_all(self.chains.iter().map(|chain| self.run_chain(chain))).await;

        let summary = self.summary();
        tracing::info!(
            run_id = %self.id,
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            cancelled = summary.cancelled(),
            "Sync run finished"
        );
        summary
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.id.clone(),
            jobs: self
                .jobs()
                .map(|job| JobSummary {
                    id: job.id(),
                    resource: job.resource().to_string(),
                    table: job.table().to_string(),
                    job_type: job.job_type(),
                    mode: job.mode(),
                    status: job.status(),
                    message: job.message(),
                })
                .collect(),
        }
    }

    async fn run_chain(&self, chain: &[Arc<SyncJob>]) {
        let log = self.context.sync_log.as_ref();
        let mut blocked_by: Option<String> = None;

        for job in chain {
            if let Some(prerequisite) = &blocked_by {
                let reason = format!("{} did not succeed", prerequisite);
                if let Err(error) = job.cancel(log, reason).await {
                    tracing::error!(job_id = %job.id(), %error, "Failed to cancel job");
                }
                continue;
            }

            self.run_job(job).await;
            if job.status() != JobStatus::Success {
                blocked_by = Some(job.label());
            }
        }
    }

    async fn run_job(&self, job: &SyncJob) {
        match job.start() {
            Ok(()) => {}
            Err(SyncError::Cancelled) => {
                tracing::debug!(job_id = %job.id(), "Job cancelled before start");
                return;
            }
            Err(error) => {
                tracing::error!(job_id = %job.id(), %error, "Job cannot start");
                return;
            }
        }

        let outcome = match job.task(&self.context, &self.references) {
            Ok(task) => drive(job, task).await,
            Err(error) => Err(Arc::new(error)),
        };

        if job.status().is_terminal() {
            tracing::info!(
                job_id = %job.id(),
                job = %job.label(),
                "Discarding result of cancelled job"
            );
            return;
        }

        let (status, message) = match outcome {
            Ok(message) => (JobStatus::Success, message),
            Err(error) => (JobStatus::Error, Some(error.to_string())),
        };
        if let Err(error) = job
            .result(self.context.sync_log.as_ref(), status, message)
            .await
        {
            // Cancelled while the result was being recorded
            tracing::debug!(job_id = %job.id(), %error, "Job result not recorded");
        }
    }
}

/// Jobs of one resource, in execution order
fn plan(run_id: &str, resource: &ResourceConfig) -> Vec<Arc<SyncJob>> {
    let mut jobs = Vec::new();
    if resource.schema {
        jobs.push(SyncJob::new(run_id, resource, JobType::Schema, SyncMode::Pull));
    }
    if resource.mode.pulls() {
        jobs.push(SyncJob::new(run_id, resource, JobType::Data, SyncMode::Pull));
    }
    if resource.mode.pushes() {
        jobs.push(SyncJob::new(run_id, resource, JobType::Data, SyncMode::Push));
    }
    jobs.into_iter().map(Arc::new).collect()
}

/// Await a job's task and any task it hands over to
async fn drive(job: &SyncJob, task: Arc<Task>) -> Result<Option<String>, Arc<SyncError>> {
    let mut output = task.done().await?;
    loop {
        match output {
            TaskOutput::Upload(upload) => {
                // The export is done; nothing has been sent yet
                if job.status().is_terminal() {
                    return Err(Arc::new(SyncError::Cancelled));
                }
                output = upload.done().await?;
            }
            other => return Ok(describe(&other)),
        }
    }
}

fn describe(output: &TaskOutput) -> Option<String> {
    match output {
        TaskOutput::Uploaded(report) if report.rejected_count() > 0 => Some(format!(
            "{} records accepted, {} rejected",
            report.accepted_count(),
            report.rejected_count()
        )),
        TaskOutput::Uploaded(report) => {
            Some(format!("{} records accepted", report.accepted_count()))
        }
        TaskOutput::Downloaded(report) if report.attachments > 0 => Some(format!(
            "{} records queued in {} imports, {} attachments stored",
            report.records,
            report.imports.len(),
            report.attachments
        )),
        TaskOutput::Downloaded(report) => Some(format!(
            "{} records queued in {} imports",
            report.records,
            report.imports.len()
        )),
        TaskOutput::Schema(_) => Some("form definition saved".to_string()),
        TaskOutput::File(uri) => Some(uri.clone()),
        TaskOutput::Upload(_) => None,
    }
}
