//! Transports carrying opaque request/reply bytes between an ICRM stub and
//! its CRM.

use std::time::Duration;

use noodle_primitives::{NoodleError, Result};
use tracing::error;

use crate::client::Client;
use crate::message::{Reply, Request};
use crate::Crm;

/// The stub-facing byte channel. Implementations exist for the in-process
/// case, the `memory://` socket case, and (in the node layer) the HTTP
/// relay case.
pub trait Transport: Send {
    fn send(&mut self, request: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>>;

    /// Releases transport resources. Called once when the stub closes.
    fn close(&mut self) {}
}

/// Drives a CRM owned by the caller's own process; the transport *is* the
/// server. Used for local-level access where no socket exists.
pub struct DirectTransport {
    crm: Option<Box<dyn Crm>>,
}

impl std::fmt::Debug for DirectTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectTransport")
            .field("terminated", &self.crm.is_none())
            .finish()
    }
}

impl DirectTransport {
    #[must_use]
    pub fn new(crm: Box<dyn Crm>) -> Self {
        Self { crm: Some(crm) }
    }
}

impl Transport for DirectTransport {
    fn send(&mut self, request: &[u8], _timeout: Option<Duration>) -> Result<Vec<u8>> {
        let Some(crm) = self.crm.as_mut() else {
            return Err(NoodleError::InvalidState(
                "CRM has already been terminated".into(),
            ));
        };
        let reply = match Request::decode(request)? {
            Request::Ping => Reply::Pong,
            Request::Call { method, payload } => match crm.route(&method, &payload) {
                Ok(bytes) => Reply::Ok(bytes),
                Err(err) => Reply::Err(err.to_string()),
            },
            Request::Shutdown => {
                self.close();
                Reply::ShuttingDown
            }
        };
        reply.encode()
    }

    fn close(&mut self) {
        if let Some(mut crm) = self.crm.take() {
            if let Err(err) = crm.terminate() {
                error!(%err, "CRM terminate hook failed");
            }
        }
    }
}

/// A transport over a `memory://` CRM server.
#[derive(Debug)]
pub struct RpcTransport {
    client: Client,
    address: String,
}

impl RpcTransport {
    #[must_use]
    pub fn new(client: Client, address: impl Into<String>) -> Self {
        Self {
            client,
            address: address.into(),
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Transport for RpcTransport {
    fn send(&mut self, request: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.client.routing(&self.address, request, timeout)
    }
}
