//! FieldSync - offline-first synchronization engine for data-collection clients
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Sync Layer                              │
//! │  - SyncRun / SyncJob sequencing and sync log                │
//! │  - Tasks: export, upload, download, file, schema            │
//! │  - Reference maps (local id -> global identifier)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Collaborator Layer                         │
//! │  - Encoder (JSON wire documents)                            │
//! │  - Transport (HTTP, reqwest)                                │
//! │  - FileStore (local attachments)                            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Store Layer                             │
//! │  - SQLite (sqlx)                                            │
//! │  - sync state, import queue, form definitions, sync log     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `sync`: Jobs, runs and tasks
//! - `store`: Local store traits and SQLite implementation
//! - `transport`: Remote authority client
//! - `encoder`: Wire document codec
//! - `files`: Local attachment storage
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod config;
pub mod encoder;
pub mod error;
pub mod files;
pub mod metrics;
pub mod store;
pub mod sync;
pub mod transport;

use std::sync::Arc;

/// Environment handed to every job and task
///
/// Built once at startup and never mutated; cloning only bumps
/// reference counts.
#[derive(Clone)]
pub struct SyncContext {
    /// Engine configuration
    pub config: Arc<config::SyncConfig>,

    /// Local record store
    pub store: Arc<dyn store::Store>,

    /// Sink for terminal job transitions
    pub sync_log: Arc<dyn store::SyncLog>,

    /// Remote authority
    pub transport: Arc<dyn transport::Transport>,

    /// Local attachment storage
    pub files: Arc<dyn files::FileStore>,

    /// Wire document codec
    pub encoder: Arc<dyn encoder::Encoder>,
}

impl SyncContext {
    /// Initialize the engine environment
    ///
    /// # Steps
    /// 1. Connect to the SQLite store and run migrations
    /// 2. Build the HTTP transport
    /// 3. Prepare local file directories
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::SyncConfig) -> Result<Self, error::SyncError> {
        tracing::info!("Initializing sync context...");

        // 1. Connect to SQLite database
        let store = Arc::new(store::SqliteStore::connect(&config.database.path, &config.sync).await?);
        tracing::info!("Local store connected");

        // 2. Initialize HTTP transport
        let transport = Arc::new(transport::HttpTransport::new(&config.server)?);
        tracing::info!(base_url = %config.server.normalized_base_url(), "Transport initialized");

        // 3. Initialize file storage
        let files = Arc::new(files::LocalFileStore::new(&config.storage)?);
        tracing::info!("File storage initialized");

        let encoder = Arc::new(encoder::JsonEncoder::new(config.sync.uid_field.clone()));

        tracing::info!(
            resources = config.sync.resources.len(),
            "Sync context initialized successfully"
        );

        Ok(Self {
            config: Arc::new(config),
            store: store.clone(),
            sync_log: store,
            transport,
            files,
            encoder,
        })
    }
}
