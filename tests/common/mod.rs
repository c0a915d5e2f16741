//! Common test utilities for E2E tests
//!
//! [`MockServer`] plays the remote authority on a random local port;
//! [`TestClient`] is a device with its own temporary store and directories.

use axum::{
    Json, Router,
    extract::{Multipart, Query, State},
    http::StatusCode,
    routing::get,
};
use fieldsync::{
    SyncContext,
    config::{
        DatabaseConfig, LoggingConfig, MetricsConfig, ResourceConfig, ServerConfig, StorageConfig,
        SyncConfig, SyncSettings,
    },
    store::SqliteStore,
    sync::SyncMode,
};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Multipart upload as received by the server
#[derive(Debug, Clone)]
pub struct ReceivedUpload {
    pub document: Value,
    /// (part name, bytes) of every attachment part
    pub files: Vec<(String, Vec<u8>)>,
}

#[derive(Default)]
pub struct ServerState {
    /// `msince` of every pull, `None` when omitted
    pub pulls: Mutex<Vec<Option<String>>>,
    pub uploads: Mutex<Vec<ReceivedUpload>>,
    /// Answer uploads with a bare 503
    pub fail_uploads: AtomicBool,
}

/// Remote authority
pub struct MockServer {
    /// Scheme, host and port
    pub origin: String,
    pub base_url: String,
    pub state: Arc<ServerState>,
}

impl MockServer {
    /// Start a server instance
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route("/api/people", get(pull_people).post(push_people))
            .route("/api/people/schema", get(person_schema))
            .route("/api/media/door.jpg", get(door_photo))
            .route("/media/door.jpg", get(door_photo))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            origin: format!("http://{}", addr),
            base_url: format!("http://{}/api", addr),
            state,
        }
    }

    pub fn pulls(&self) -> Vec<Option<String>> {
        self.state.pulls.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<ReceivedUpload> {
        self.state.uploads.lock().unwrap().clone()
    }

    pub fn fail_uploads(&self) {
        self.state.fail_uploads.store(true, Ordering::SeqCst);
    }
}

async fn pull_people(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    state
        .pulls
        .lock()
        .unwrap()
        .push(params.get("msince").cloned());
    Json(json!({
        "$_person": [{"@uuid": "srv-1", "name": "Remote", "household": "srv-h1"}],
        "$_household": [{"@uuid": "srv-h1", "village": "Remote", "photo": "media/door.jpg"}]
    }))
}

async fn door_photo() -> Vec<u8> {
    b"jpeg-bytes".to_vec()
}

async fn person_schema() -> Json<Value> {
    Json(json!({
        "name": "person",
        "fields": [
            {"name": "name", "type": "string"},
            {"name": "household", "type": "household"}
        ]
    }))
}

/// Accept uploads, rejecting every person named "Invalid" inside a status envelope
async fn push_people(
    State(state): State<Arc<ServerState>>,
    mut multipart: Multipart,
) -> (StatusCode, Json<Value>) {
    if state.fail_uploads.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(Value::Null));
    }

    let mut document = Value::Null;
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.unwrap();
        if name == "data" {
            document = serde_json::from_slice(&bytes).unwrap();
        } else {
            files.push((name, bytes.to_vec()));
        }
    }

    let rejected: Vec<Value> = document["$_person"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|item| item["name"] == "Invalid")
        .map(|item| json!({"@uuid": item["@uuid"], "@error": "name rejected"}))
        .collect();

    state
        .uploads
        .lock()
        .unwrap()
        .push(ReceivedUpload { document, files });

    if rejected.is_empty() {
        (StatusCode::OK, Json(json!({})))
    } else {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "status": "failed",
                "statuscode": "422",
                "tree": {"$_person": rejected}
            })),
        )
    }
}

/// Device under test
pub struct TestClient {
    pub config: SyncConfig,
    /// Direct store access for seeding and assertions
    pub store: SqliteStore,
    pub _temp_dir: TempDir,
}

impl TestClient {
    /// Create a device syncing the `person` resource against `server`
    pub async fn new(server: &MockServer) -> Self {
        let temp_dir = TempDir::new().unwrap();

        let config = SyncConfig {
            server: ServerConfig {
                base_url: server.base_url.clone(),
                auth_token: Some("device-token".to_string()),
                timeout_seconds: 5,
                user_agent: "FieldSync/e2e".to_string(),
            },
            database: DatabaseConfig {
                path: temp_dir.path().join("fieldsync.db"),
            },
            storage: StorageConfig {
                files_dir: temp_dir.path().join("files"),
                upload_dir: temp_dir.path().join("outbox"),
            },
            sync: SyncSettings {
                resources: vec![ResourceConfig {
                    name: "person".to_string(),
                    table: None,
                    url: Some("people".to_string()),
                    mode: SyncMode::Both,
                    schema: true,
                    schema_url: None,
                }],
                ..SyncSettings::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                format: "pretty".to_string(),
            },
            metrics: MetricsConfig::default(),
        };

        let store = SqliteStore::connect(&config.database.path, &config.sync)
            .await
            .unwrap();
        for ddl in [
            "CREATE TABLE household (
                id INTEGER PRIMARY KEY,
                uuid TEXT,
                village TEXT,
                photo FILE,
                updated TEXT,
                sync_date TEXT
            )",
            "CREATE TABLE person (
                id INTEGER PRIMARY KEY,
                uuid TEXT,
                name TEXT,
                household INTEGER REFERENCES household(id),
                updated TEXT,
                sync_date TEXT
            )",
        ] {
            sqlx::query(ddl).execute(store.pool()).await.unwrap();
        }

        Self {
            config,
            store,
            _temp_dir: temp_dir,
        }
    }

    pub async fn context(&self) -> SyncContext {
        SyncContext::new(self.config.clone()).await.unwrap()
    }

    /// Write a captured file into the device's scratch area
    pub fn capture(&self, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = self._temp_dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }
}

pub fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}
