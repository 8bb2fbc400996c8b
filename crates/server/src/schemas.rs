//! Request and response bodies of the `/noodle/node` routes. The shared
//! peer-to-peer schemas (lock info, transfer chunks) live in
//! `noodle_node::schemas`.

use noodle_primitives::NodeKey;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MountRequest {
    pub node_key: NodeKey,
    #[serde(default)]
    pub template_name: Option<String>,
    /// JSON-encoded mount params, or empty for none.
    #[serde(default)]
    pub mount_params_string: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MountResponse {
    pub success: bool,
    pub message: String,
    pub node_key: NodeKey,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UnlinkInfo {
    pub success: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PushRequest {
    pub template_name: String,
    pub source_node_key: NodeKey,
    /// `<url>::<key>` form addressing the target peer.
    pub target_node_key: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PushResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PullRequest {
    pub template_name: String,
    pub target_node_key: NodeKey,
    /// `<url>::<key>` form addressing the source peer.
    pub source_node_key: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PullResponse {
    pub success: bool,
    pub message: String,
    pub target_node_key: NodeKey,
}
