//! Durable SQLite persistence for the noodle resource tree.
//!
//! Two tables live in one database file: the `node` table (the resource
//! tree) and the `locks` table (the process-shared reader–writer locks).
//! Every operation opens a transient connection; lock acquisition decisions
//! run inside a reserved-writer (`BEGIN IMMEDIATE`) transaction so that the
//! compatibility check and the new lock become visible atomically.

pub mod lock;
pub mod records;
pub mod tree;

use noodle_primitives::NoodleError;

pub use lock::{LockTable, RwLock};
pub use records::{LockRecord, NodeRecord};
pub use tree::TreeStore;

pub(crate) fn store_err(err: rusqlite::Error) -> NoodleError {
    NoodleError::Store(err.to_string())
}
