//! The noodle orchestration engine.
//!
//! Ties together the persistent resource tree, the durable reader–writer
//! lock table, CRM activation (in-process, child-process, remote) and the
//! snapshot transfer protocol, behind one explicit [`Noodle`] context
//! object.
//!
//! Peer HTTP stays in the blocking domain (as do lock retries); callers in
//! cooperative contexts run these operations on blocking threads. The two
//! genuinely cooperative paths — lock acquisition and activation readiness
//! polling — have native async drivers sharing their blocking
//! counterparts' state machines.

pub mod handle;
pub mod launcher;
pub mod noodle;
pub mod schemas;
pub mod transfer;

pub use handle::{server_address, NodeHandle, HttpRelayTransport};
pub use launcher::{run_crm_server, CrmLauncherArgs};
pub use noodle::{Connection, Noodle, DEFAULT_RETRY_INTERVAL};
pub use schemas::{ChunkResponse, LockInfo, PackingResponse, PullFromRequest, ResourceNodeInfo};
pub use transfer::CHUNK_SIZE;
