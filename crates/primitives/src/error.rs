//! The error taxonomy shared across the noodle crates.
//!
//! Each variant maps to one of the boundary kinds (not-found, invalid
//! state, timeout, transport, validation, internal); the HTTP layer turns
//! kinds into status codes.

use thiserror::Error;

use crate::access::LockKind;
use crate::key::NodeKey;

pub type Result<T> = core::result::Result<T, NoodleError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NoodleError {
    #[error("node '{0}' not found in noodle resource tree")]
    NodeNotFound(NodeKey),

    #[error("resource node template '{0}' not found in noodle module cache")]
    TemplateNotFound(String),

    #[error("ICRM tag '{0}' not found in noodle module cache")]
    IcrmNotFound(String),

    #[error("lock '{lock_id}' not found for node '{node_key}'")]
    LockNotFound { lock_id: String, node_key: NodeKey },

    #[error("{0}")]
    InvalidState(String),

    #[error("failed to acquire {kind} lock for node '{node_key}' within {timeout_secs} seconds")]
    LockTimeout {
        node_key: NodeKey,
        kind: LockKind,
        timeout_secs: f64,
    },

    #[error("CRM server for node '{0}' did not start in time")]
    ServerNotReady(NodeKey),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("{0}")]
    Validation(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Other(#[from] eyre::Error),
}

/// The boundary classification of an error, used to pick HTTP statuses and
/// to let callers match without inspecting messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    Timeout,
    Transport,
    Validation,
    Internal,
}

impl NoodleError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NodeNotFound(_)
            | Self::TemplateNotFound(_)
            | Self::IcrmNotFound(_)
            | Self::LockNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::LockTimeout { .. } | Self::ServerNotReady(_) => ErrorKind::Timeout,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Store(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }
}
