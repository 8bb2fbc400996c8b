//! The opaque message-routing primitive between an ICRM stub and its CRM
//! server.
//!
//! Three operations exist on the wire: `ping`, `routing` (opaque request
//! bytes in, reply bytes out) and `shutdown`. Two address schemes are
//! served:
//!
//! - `local://…` — the CRM lives in the caller's process; the stub drives
//!   it through a [`DirectTransport`], no server exists.
//! - `memory://…` — the CRM lives in another process; the address resolves
//!   to a Unix-domain socket beneath the memory-temp root, carrying
//!   length-delimited borsh frames.
//!
//! HTTP relay addresses are a third transport implemented by the node
//! layer on top of [`Transport`]; this crate stays HTTP-free.

pub mod client;
pub mod message;
pub mod server;
pub mod stub;
pub mod transport;

pub use client::Client;
pub use message::{Reply, Request};
pub use server::{serve, CrmServer};
pub use stub::IcrmStub;
pub use transport::{DirectTransport, RpcTransport, Transport};

use noodle_primitives::Result;

/// The server side of a resource node: the domain object a CRM server
/// routes opaque method calls into.
pub trait Crm: Send {
    /// Dispatches one method call. The payload encoding is a contract
    /// between the CRM and its ICRM façade; the core never interprets it.
    fn route(&mut self, method: &str, payload: &[u8]) -> Result<Vec<u8>>;

    /// Lifecycle hook invoked once when the server shuts down.
    fn terminate(&mut self) -> Result<()> {
        Ok(())
    }
}
