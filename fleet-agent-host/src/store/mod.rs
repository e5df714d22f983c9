//! Control store client
//!
//! The control store is a remote document store. The agent only needs three
//! things from it:
//! - `watch`: an endless stream of snapshots for a document or a collection
//! - `get`: a one-shot read
//! - `update`: a partial write expressed as field operations
//!
//! `DocumentStore` is the seam between the agent components and the transport.

pub mod backoff;
pub mod mqtt;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Document paths used by the agent
pub mod paths {
    pub const NODES: &str = "nodes";
    pub const STORAGE_POOLS: &str = "storagepools";
    pub const NODE_CANDIDATES: &str = "nodecandidates/list";
    pub const RTC_SETTINGS: &str = "settings/rtc";

    pub fn node(node_id: &str) -> String {
        format!("{}/{}", NODES, node_id)
    }

    pub fn storage_pool(pool_id: &str) -> String {
        format!("{}/{}", STORAGE_POOLS, pool_id)
    }
}

/// Point-in-time view of one document
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub path: String,
    pub exists: bool,
    pub version: u64,
    pub data: Value,
}

impl Snapshot {
    /// Last path segment, i.e. the document id inside its collection
    pub fn id(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Single field operation, `field` is a dotted path inside the document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum FieldOp {
    Set { field: String, value: Value },
    Delete { field: String },
    ArrayUnion { field: String, values: Vec<Value> },
    ArrayRemove { field: String, values: Vec<Value> },
}

/// Partial document update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub ops: Vec<FieldOp>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(FieldOp::Set {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(mut self, field: impl Into<String>) -> Self {
        self.ops.push(FieldOp::Delete { field: field.into() });
        self
    }

    pub fn array_union(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.ops.push(FieldOp::ArrayUnion {
            field: field.into(),
            values,
        });
        self
    }

    pub fn array_remove(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.ops.push(FieldOp::ArrayRemove {
            field: field.into(),
            values,
        });
        self
    }
}

/// Join path segments into a dotted field path
pub fn field_path(segments: &[&str]) -> String {
    segments.join(".")
}

/// Endless stream of snapshots. Ends only when the store itself goes away.
pub struct DocStream {
    rx: mpsc::UnboundedReceiver<Snapshot>,
}

impl DocStream {
    pub fn new(rx: mpsc::UnboundedReceiver<Snapshot>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("control channel request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("cannot encode document payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("control channel closed")]
    Closed,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Watch one document. The first item reflects its current state,
    /// including `exists: false` when it is absent.
    async fn watch(&self, path: &str) -> Result<DocStream, StoreError>;

    /// Watch every document of a collection, one snapshot per changed document
    async fn watch_collection(&self, collection: &str) -> Result<DocStream, StoreError>;

    async fn get(&self, path: &str) -> Result<Snapshot, StoreError>;

    async fn update(&self, path: &str, patch: Patch) -> Result<(), StoreError>;

    fn is_connected(&self) -> bool {
        true
    }
}
