//! JSON bodies exchanged between the sync client and server.

use serde::{Deserialize, Serialize};

use crate::projection::{CrossRef, IndexDocument, Projection};

/// A mutation as submitted by a client. `op_id` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SyncOp {
    pub(crate) op_id: String,
    pub(crate) op_type: String,
    pub(crate) entity_type: String,
    pub(crate) entity_id: String,
    #[serde(default)]
    pub(crate) payload: serde_json::Value,
}

/// A mutation as stored in the server log, with its assigned version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct LoggedOp {
    pub(crate) project_id: String,
    pub(crate) version: i64,
    pub(crate) op_id: String,
    pub(crate) actor: String,
    pub(crate) op_type: String,
    pub(crate) entity_type: String,
    pub(crate) entity_id: String,
    #[serde(default)]
    pub(crate) payload: serde_json::Value,
    pub(crate) created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PushRequest {
    pub(crate) client_version: i64,
    #[serde(default)]
    pub(crate) ops: Vec<SyncOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PushResponse {
    pub(crate) project_id: String,
    pub(crate) server_version: i64,
    pub(crate) accepted: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PullResponse {
    pub(crate) project_id: String,
    pub(crate) server_version: i64,
    pub(crate) ops: Vec<LoggedOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ProjectInfo {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PublishIndexRequest {
    pub(crate) document_hash: String,
    pub(crate) documents: Vec<IndexDocument>,
    #[serde(default)]
    pub(crate) crossrefs: Vec<CrossRef>,
}

impl PublishIndexRequest {
    pub(crate) fn from_projection(document_hash: String, projection: Projection) -> Self {
        Self {
            document_hash,
            documents: projection.docs,
            crossrefs: projection.refs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct IndexSnapshot {
    pub(crate) project_id: String,
    pub(crate) snapshot_id: i64,
    pub(crate) document_hash: String,
    pub(crate) published_by: String,
    pub(crate) created_at: i64,
    pub(crate) documents: Vec<IndexDocument>,
    #[serde(default)]
    pub(crate) crossrefs: Vec<CrossRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CreateProjectRequest {
    #[serde(default)]
    pub(crate) id: Option<String>,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct IssueTokenRequest {
    pub(crate) actor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct IssueTokenResponse {
    pub(crate) actor: String,
    pub(crate) token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ErrorBody {
    pub(crate) error: String,
}
