//! Wire schemas shared by the HTTP boundary and the peer-facing client
//! paths (remote handles and snapshot transfer).

use noodle_primitives::{AccessLevel, LockKind, NodeKey};
use noodle_store::{LockRecord, NodeRecord};
use serde::{Deserialize, Serialize};

/// Lock info as it crosses the wire.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LockInfo {
    pub lock_id: String,
    pub node_key: NodeKey,
    pub lock_type: LockKind,
    pub access_level: AccessLevel,
}

impl From<LockRecord> for LockInfo {
    fn from(record: LockRecord) -> Self {
        Self {
            lock_id: record.lock_id,
            node_key: record.node_key,
            lock_type: record.kind,
            access_level: record.level,
        }
    }
}

/// Projection of a node record plus a paged view of its direct children.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ResourceNodeInfo {
    pub node_key: NodeKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ResourceNodeInfo>>,
}

impl ResourceNodeInfo {
    /// A childless projection of one record.
    #[must_use]
    pub fn leaf(record: &NodeRecord) -> Self {
        Self {
            node_key: record.node_key.clone(),
            template_name: record.template_name.clone(),
            access_info: record.access_info.clone(),
            children: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PackingResponse {
    pub compress_file_size: u64,
}

/// One chunk of a pull transfer, served by the source peer.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChunkResponse {
    pub chunk_index: u64,
    /// Base64-encoded chunk bytes.
    pub chunk_data: String,
    pub is_last_chunk: bool,
}

/// One chunk of a push transfer, posted to the target peer.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PullFromRequest {
    pub template_name: String,
    pub target_node_key: NodeKey,
    pub source_node_key: NodeKey,
    /// Base64-encoded chunk bytes.
    pub chunk_data: String,
    pub chunk_index: u64,
    pub chunk_size: u64,
    pub is_last_chunk: bool,
}
