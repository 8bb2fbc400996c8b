//! Node keys and remote references.
//!
//! A node key is a dot-separated hierarchical path (`root.names`). The
//! parent of `a.b.c` is `a.b`; a single-segment key is a tree root. A key
//! that begins with `http` and carries a `::` separator addresses a node on
//! a remote peer (`<base-url>::<remote-key>`).

use core::fmt::{self, Display, Formatter};
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::NoodleError;

/// A dot-separated hierarchical node key, unique per peer.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeKey(String);

impl NodeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The parent key, or `None` for a tree root.
    pub fn parent(&self) -> Option<Self> {
        let (parent, _) = self.0.rsplit_once('.')?;
        if parent.is_empty() {
            return None;
        }
        Some(Self(parent.to_owned()))
    }

    /// The last path segment (the node's own name).
    pub fn last_segment(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    /// The key with dots flattened to underscores, used in server addresses
    /// and archive file names.
    pub fn flat(&self) -> String {
        self.0.replace('.', "_")
    }

    /// The synthetic key that reference-counts in-flight snapshot transfers
    /// sharing this node's archive.
    pub fn tar_key(&self) -> Self {
        Self(format!("{}_tar", self.0))
    }

    /// Whether the key addresses a node on a remote peer.
    pub fn is_remote(&self) -> bool {
        self.0.starts_with("http") && self.0.contains("::")
    }
}

impl Display for NodeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeKey {
    type Err = NoodleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(NoodleError::Validation("node key cannot be empty".into()));
        }
        Ok(Self(s.to_owned()))
    }
}

impl From<&str> for NodeKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A reference to a node hosted on a remote peer, written
/// `<base-url>::<remote-node-key>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteRef {
    pub base_url: String,
    pub remote_key: NodeKey,
}

impl RemoteRef {
    /// Parses `<base-url>::<key>`. The url part must carry an `http` prefix
    /// and both parts must be non-empty.
    pub fn parse(raw: &str) -> Result<Self, NoodleError> {
        if !raw.starts_with("http") {
            return Err(NoodleError::Validation(format!(
                "remote reference '{raw}' does not start with 'http'"
            )));
        }
        let Some((base_url, remote_key)) = raw.split_once("::") else {
            return Err(NoodleError::Validation(format!(
                "remote reference '{raw}' is missing the '::' separator"
            )));
        };
        if base_url.is_empty() || remote_key.is_empty() {
            return Err(NoodleError::Validation(format!(
                "remote reference '{raw}' has an empty url or node key"
            )));
        }
        Ok(Self {
            base_url: base_url.to_owned(),
            remote_key: NodeKey::new(remote_key),
        })
    }
}

impl Display for RemoteRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.base_url, self.remote_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_walks_up_one_level() {
        let key = NodeKey::new("a.b.c");
        assert_eq!(key.parent(), Some(NodeKey::new("a.b")));
        assert_eq!(key.parent().unwrap().parent(), Some(NodeKey::new("a")));
        assert_eq!(NodeKey::new("a").parent(), None);
    }

    #[test]
    fn last_segment_and_flat() {
        let key = NodeKey::new("root.names");
        assert_eq!(key.last_segment(), "names");
        assert_eq!(key.flat(), "root_names");
        assert_eq!(NodeKey::new("root").last_segment(), "root");
    }

    #[test]
    fn tar_key_suffix() {
        assert_eq!(NodeKey::new("root.names").tar_key().as_str(), "root.names_tar");
    }

    #[test]
    fn remote_detection() {
        assert!(NodeKey::new("http://peer:8000::root.names").is_remote());
        assert!(!NodeKey::new("root.names").is_remote());
        assert!(!NodeKey::new("httpish").is_remote());
    }

    #[test]
    fn remote_ref_round_trip() {
        let remote = RemoteRef::parse("http://peer:8000::root.names").unwrap();
        assert_eq!(remote.base_url, "http://peer:8000");
        assert_eq!(remote.remote_key, NodeKey::new("root.names"));
        assert_eq!(remote.to_string(), "http://peer:8000::root.names");
    }

    #[test]
    fn remote_ref_rejects_malformed() {
        assert!(RemoteRef::parse("ftp://peer::x").is_err());
        assert!(RemoteRef::parse("http://peer:8000").is_err());
        assert!(RemoteRef::parse("http://peer:8000::").is_err());
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!("".parse::<NodeKey>().is_err());
    }
}
