//! FieldSync binary entry point

use fieldsync::{SyncContext, config, sync::SyncRun};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Initialize metrics
/// 3. Load configuration from file and environment
/// 4. Initialize SyncContext
/// 5. Run every configured resource once
/// 6. Write metrics and exit non-zero if any job did not succeed
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("FIELDSYNC__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "fieldsync=info".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "fieldsync=info".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting FieldSync...");

    // 2. Initialize metrics
    fieldsync::metrics::init_metrics();

    // 3. Load configuration
    let config = config::SyncConfig::load()?;
    tracing::info!(
        base_url = %config.server.base_url,
        resources = config.sync.resources.len(),
        "Configuration loaded"
    );
    let metrics_textfile = config.metrics.textfile.clone();

    // 4. Initialize sync context
    let context = SyncContext::new(config).await?;

    // 5. Run
    let run = SyncRun::new(context);
    let summary = run.run().await;
    for job in &summary.jobs {
        tracing::info!(
            resource = %job.resource,
            job_type = %job.job_type,
            mode = %job.mode,
            status = %job.status,
            message = ?job.message,
            "Job summary"
        );
    }

    // 6. Export metrics
    if let Some(path) = metrics_textfile {
        match fieldsync::metrics::render() {
            Ok(text) => {
                if let Err(error) = tokio::fs::write(&path, text).await {
                    tracing::error!(%error, path = %path.display(), "Failed to write metrics");
                }
            }
            Err(error) => tracing::error!(%error, "Failed to encode metrics"),
        }
    }

    if !summary.is_success() {
        tracing::error!(
            run_id = %summary.run_id,
            failed = summary.failed(),
            cancelled = summary.cancelled(),
            "Sync run did not complete successfully"
        );
        std::process::exit(1);
    }

    Ok(())
}
