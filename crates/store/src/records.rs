//! Row types for the node and lock tables.

use noodle_primitives::{AccessLevel, LockKind, NodeKey, RemoteRef};

/// A persistent resource-tree entry.
///
/// `template_name == None` marks a resource set (an organizational
/// container with no CRM); `access_info == Some(..)` marks a proxy record
/// pointing at an identically-typed node on a remote peer.
#[derive(Clone, Debug)]
pub struct NodeRecord {
    pub node_key: NodeKey,
    pub parent_key: Option<NodeKey>,
    pub template_name: Option<String>,
    pub launch_params: Option<String>,
    pub access_info: Option<String>,
    pub created_at: String,
    /// Direct children, populated only by cascade loads; sorted
    /// case-insensitively by their own name.
    pub children: Vec<NodeRecord>,
}

impl NodeRecord {
    /// A resource set has no CRM; operations that need one reject it.
    #[must_use]
    pub const fn is_resource_set(&self) -> bool {
        self.template_name.is_none()
    }

    /// A proxy record forwards all operations to a remote peer.
    #[must_use]
    pub const fn is_proxy(&self) -> bool {
        self.access_info.is_some()
    }

    /// The parsed remote reference for proxy records.
    pub fn remote_ref(&self) -> Option<RemoteRef> {
        self.access_info
            .as_deref()
            .and_then(|info| RemoteRef::parse(info).ok())
    }
}

/// A row of the durable lock table.
#[derive(Clone, Debug)]
pub struct LockRecord {
    pub lock_id: String,
    pub node_key: NodeKey,
    pub kind: LockKind,
    pub level: AccessLevel,
    pub created_at: String,
}
