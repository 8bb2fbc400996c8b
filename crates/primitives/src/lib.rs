//! Shared primitive types for the noodle resource tree.
//!
//! Everything in here is plain data: node keys, remote references, access
//! modes, ICRM tags and the error taxonomy shared by every other crate.

pub mod access;
pub mod error;
pub mod icrm;
pub mod key;

pub use access::{AccessLevel, AccessMode, LockKind};
pub use error::{ErrorKind, NoodleError, Result};
pub use icrm::IcrmTag;
pub use key::{NodeKey, RemoteRef};
