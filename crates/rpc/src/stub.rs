//! The generic ICRM stub: a tagged byte-call interface over a transport.
//!
//! Typed façades (user code) wrap an [`IcrmStub`] and encode their own
//! method payloads; the stub only frames calls and classifies replies.

use std::time::Duration;

use noodle_primitives::{IcrmTag, NoodleError, Result};

use crate::message::{Reply, Request};
use crate::transport::Transport;

pub struct IcrmStub {
    tag: IcrmTag,
    transport: Box<dyn Transport>,
}

impl std::fmt::Debug for IcrmStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IcrmStub").field("tag", &self.tag).finish()
    }
}

impl IcrmStub {
    #[must_use]
    pub fn new(tag: IcrmTag, transport: Box<dyn Transport>) -> Self {
        Self { tag, transport }
    }

    #[must_use]
    pub const fn tag(&self) -> &IcrmTag {
        &self.tag
    }

    /// Invokes one CRM method and returns its reply payload.
    pub fn call(
        &mut self,
        method: &str,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let request = Request::Call {
            method: method.to_owned(),
            payload,
        }
        .encode()?;
        let raw = self.transport.send(&request, timeout)?;
        match Reply::decode(&raw)? {
            Reply::Ok(bytes) => Ok(bytes),
            Reply::Err(message) => Err(NoodleError::Other(eyre::eyre!(
                "CRM method '{method}' failed: {message}"
            ))),
            other => Err(NoodleError::Transport(format!(
                "unexpected reply to '{method}': {other:?}"
            ))),
        }
    }

    /// Closes the underlying transport.
    pub fn close(&mut self) {
        self.transport.close();
    }
}
