//! Transport to the remote authority
//!
//! Tasks talk to the server only through [`Transport`]. Timeouts and
//! connection handling belong to the implementation, never to the engine.

mod http;

pub use http::HttpTransport;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::SyncError;

/// Endpoint descriptor: path relative to the server base URL plus query variables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerRef {
    pub endpoint: String,
    pub query: BTreeMap<String, String>,
}

impl ServerRef {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            query: BTreeMap::new(),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }
}

/// File bytes sent alongside an upload document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Name the document refers to the file by
    pub name: String,
    pub bytes: Vec<u8>,
}

/// One upload: an encoded document plus its attachments
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub document: Value,
    pub attachments: Vec<Attachment>,
}

/// Remote authority
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET a JSON payload
    async fn fetch(&self, server_ref: &ServerRef) -> Result<Value, SyncError>;

    /// Send an upload and return the server's response body
    ///
    /// A response whose body carries an error tree is returned as `Ok`
    /// even when the server answered with a client-error status.
    async fn send(
        &self,
        server_ref: &ServerRef,
        request: &UploadRequest,
    ) -> Result<Value, SyncError>;

    /// GET raw attachment bytes; `url` may be absolute or relative to the base URL
    async fn fetch_file(&self, url: &str) -> Result<Vec<u8>, SyncError>;
}
