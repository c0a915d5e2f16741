//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)
//!
//! The resulting [`SyncConfig`] is built once at startup and shared
//! read-only through [`crate::SyncContext`].

use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;

use crate::sync::{JobType, SyncMode};

/// Main configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub sync: SyncSettings,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Remote authority configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base URL every resource endpoint is resolved against
    /// (e.g., "https://survey.example.org/api/")
    pub base_url: String,
    /// Bearer token sent with every request
    pub auth_token: Option<String>,
    /// Request timeout in seconds (default: 30)
    pub timeout_seconds: u64,
    /// User-Agent header
    pub user_agent: String,
}

impl ServerConfig {
    /// Base URL with a guaranteed trailing slash, so relative
    /// endpoints are joined below it rather than replacing its last segment.
    pub fn normalized_base_url(&self) -> String {
        let trimmed = self.base_url.trim();
        if trimmed.ends_with('/') {
            trimmed.to_string()
        } else {
            format!("{}/", trimmed)
        }
    }
}

/// Local store configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Local file storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory receiving downloaded attachments
    pub files_dir: PathBuf,
    /// Directory holding attachments captured for upload
    pub upload_dir: PathBuf,
}

/// Synchronization settings
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    /// Column holding a record's global identifier
    pub uid_field: String,
    /// Column holding a record's last confirmed sync timestamp
    pub sync_date_field: String,
    /// Column holding a record's last local modification timestamp
    pub updated_field: String,
    /// Resources to synchronize, in configuration order
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            uid_field: "uuid".to_string(),
            sync_date_field: "sync_date".to_string(),
            updated_field: "updated".to_string(),
            resources: Vec::new(),
        }
    }
}

/// One server-side collection mapped to one local table
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    /// Resource name (e.g., "person")
    pub name: String,
    /// Local table (defaults to the resource name)
    pub table: Option<String>,
    /// Endpoint relative to the server base URL (defaults to the resource name)
    pub url: Option<String>,
    /// Sync direction
    #[serde(default)]
    pub mode: SyncMode,
    /// Also pull the resource's form definition before its data
    #[serde(default)]
    pub schema: bool,
    /// Endpoint of the form definition (defaults to "<url>/schema")
    pub schema_url: Option<String>,
}

impl ResourceConfig {
    pub fn table(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.name)
    }

    pub fn url(&self) -> &str {
        self.url.as_deref().unwrap_or(&self.name)
    }

    pub fn schema_url(&self) -> String {
        match &self.schema_url {
            Some(url) => url.clone(),
            None => format!("{}/schema", self.url().trim_end_matches('/')),
        }
    }

    /// Endpoint used by a job of the given type
    pub fn endpoint(&self, job_type: JobType) -> String {
        match job_type {
            JobType::Schema => self.schema_url(),
            JobType::Data => self.url().to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

/// Metrics export configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus text file written after each run (node-exporter textfile collector)
    pub textfile: Option<PathBuf>,
}

impl SyncConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FIELDSYNC__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::SyncError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.timeout_seconds", 30)?
            .set_default("server.user_agent", "FieldSync/0.1.0")?
            .set_default("database.path", "data/fieldsync.db")?
            .set_default("storage.files_dir", "data/files")?
            .set_default("storage.upload_dir", "data/outbox")?
            .set_default("sync.uid_field", "uuid")?
            .set_default("sync.sync_date_field", "sync_date")?
            .set_default("sync.updated_field", "updated")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FIELDSYNC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::SyncError::Config(e.to_string()))?;

        let sync_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::SyncError::Config(e.to_string()))?;
        sync_config.validate()?;
        Ok(sync_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::SyncError> {
        use crate::error::SyncError;

        let base = url::Url::parse(&self.server.normalized_base_url()).map_err(|e| {
            SyncError::Config(format!(
                "server.base_url must be an absolute URL ({}): {}",
                self.server.base_url, e
            ))
        })?;
        if base.cannot_be_a_base() {
            return Err(SyncError::Config(format!(
                "server.base_url cannot be used as a base: {}",
                self.server.base_url
            )));
        }

        if self.server.timeout_seconds == 0 {
            return Err(SyncError::Config(
                "server.timeout_seconds must be greater than 0".to_string(),
            ));
        }

        for (key, value) in [
            ("sync.uid_field", &self.sync.uid_field),
            ("sync.sync_date_field", &self.sync.sync_date_field),
            ("sync.updated_field", &self.sync.updated_field),
        ] {
            if !crate::store::is_valid_identifier(value) {
                return Err(SyncError::Config(format!(
                    "{} must be a plain column name, got {:?}",
                    key, value
                )));
            }
        }

        let mut seen = HashSet::new();
        for resource in &self.sync.resources {
            if !seen.insert(resource.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "sync.resources contains duplicate resource {:?}",
                    resource.name
                )));
            }
            if !crate::store::is_valid_identifier(resource.table()) {
                return Err(SyncError::Config(format!(
                    "resource {:?} maps to invalid table {:?}",
                    resource.name,
                    resource.table()
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn valid_config() -> SyncConfig {
        SyncConfig {
            server: ServerConfig {
                base_url: "https://survey.example.org/api".to_string(),
                auth_token: None,
                timeout_seconds: 30,
                user_agent: "FieldSync/test".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/fieldsync-test.db"),
            },
            storage: StorageConfig {
                files_dir: PathBuf::from("/tmp/fieldsync-files"),
                upload_dir: PathBuf::from("/tmp/fieldsync-outbox"),
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
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
            metrics: MetricsConfig::default(),
        }
    }

    #[test]
    fn validate_accepts_default_layout() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn resource_defaults_follow_name() {
        let resource = ResourceConfig {
            name: "household".to_string(),
            table: None,
            url: None,
            mode: SyncMode::default(),
            schema: false,
            schema_url: None,
        };
        assert_eq!(resource.table(), "household");
        assert_eq!(resource.endpoint(JobType::Data), "household");
        assert_eq!(resource.endpoint(JobType::Schema), "household/schema");
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let config = valid_config();
        assert_eq!(
            config.server.normalized_base_url(),
            "https://survey.example.org/api/"
        );
    }

    #[test]
    fn validate_rejects_duplicate_resources() {
        let mut config = valid_config();
        let duplicate = config.sync.resources[0].clone();
        config.sync.resources.push(duplicate);

        let error = config
            .validate()
            .expect_err("duplicate resource names must fail");
        assert!(matches!(
            error,
            crate::error::SyncError::Config(message) if message.contains("duplicate")
        ));
    }

    #[test]
    fn validate_rejects_injected_table_name() {
        let mut config = valid_config();
        config.sync.resources[0].table = Some("person; DROP TABLE person".to_string());

        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_relative_base_url() {
        let mut config = valid_config();
        config.server.base_url = "survey.example.org/api".to_string();

        let error = config.validate().expect_err("relative base URL must fail");
        assert!(matches!(
            error,
            crate::error::SyncError::Config(message) if message.contains("server.base_url")
        ));
    }
}
