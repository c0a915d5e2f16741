//! Prometheus metrics registry and instruments.
//!
//! Instruments are process-wide; the engine updates them whether or not
//! [`init_metrics`] registered them for export.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::time::Duration;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Job Metrics
    pub static ref SYNC_JOBS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fieldsync_jobs_total", "Total number of sync jobs by terminal status"),
        &["job_type", "mode", "status"]
    ).expect("metric can be created");

    // Task Metrics
    pub static ref TASKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fieldsync_tasks_total", "Total number of executed tasks"),
        &["task", "status"]
    ).expect("metric can be created");
    pub static ref TASK_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "fieldsync_task_duration_seconds",
            "Task execution time in seconds"
        ).buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["task"]
    ).expect("metric can be created");

    // Record Metrics
    pub static ref RECORDS_UPLOADED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fieldsync_records_uploaded_total", "Total number of records accepted by the server"),
        &["table"]
    ).expect("metric can be created");
    pub static ref RECORDS_REJECTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fieldsync_records_rejected_total", "Total number of records rejected by the server"),
        &["table"]
    ).expect("metric can be created");
    pub static ref RECORDS_DOWNLOADED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fieldsync_records_downloaded_total", "Total number of records queued for import"),
        &["resource"]
    ).expect("metric can be created");

    // Transport Metrics
    pub static ref TRANSPORT_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fieldsync_transport_requests_total", "Total number of requests to the server"),
        &["method", "status"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(SYNC_JOBS_TOTAL.clone()))
        .expect("SYNC_JOBS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(TASKS_TOTAL.clone()))
        .expect("TASKS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(TASK_DURATION_SECONDS.clone()))
        .expect("TASK_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(RECORDS_UPLOADED_TOTAL.clone()))
        .expect("RECORDS_UPLOADED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(RECORDS_REJECTED_TOTAL.clone()))
        .expect("RECORDS_REJECTED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(RECORDS_DOWNLOADED_TOTAL.clone()))
        .expect("RECORDS_DOWNLOADED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(TRANSPORT_REQUESTS_TOTAL.clone()))
        .expect("TRANSPORT_REQUESTS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}

/// Record one finished task execution
///
/// `status` is `success` or the failure's [`crate::error::SyncError::kind`].
pub fn observe_task(task: &str, status: &str, elapsed: Duration) {
    TASKS_TOTAL.with_label_values(&[task, status]).inc();
    TASK_DURATION_SECONDS
        .with_label_values(&[task])
        .observe(elapsed.as_secs_f64());
}

/// Render every registered metric in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;

    let mut buffer = Vec::new();
    prometheus::TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
