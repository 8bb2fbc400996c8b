//! Blocking client for `memory://` CRM servers, with async wrappers.
//!
//! The socket path of `memory://<name>` is `<memory-temp-root>/<name>.sock`.
//! Frames are u32 big-endian length-prefixed, matching the codec the server
//! side speaks.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use noodle_primitives::{NoodleError, Result};
use tracing::debug;

use crate::message::{Reply, Request};

pub const MEMORY_SCHEME: &str = "memory://";
pub const LOCAL_SCHEME: &str = "local://";

#[derive(Clone, Debug)]
pub struct Client {
    memory_root: Utf8PathBuf,
}

impl Client {
    #[must_use]
    pub fn new(memory_root: impl AsRef<Utf8Path>) -> Self {
        Self {
            memory_root: memory_root.as_ref().to_owned(),
        }
    }

    /// Resolves a `memory://` address to its socket path.
    pub fn socket_path(&self, address: &str) -> Result<PathBuf> {
        let Some(name) = address.strip_prefix(MEMORY_SCHEME) else {
            return Err(NoodleError::Validation(format!(
                "address '{address}' is not a memory:// CRM server address"
            )));
        };
        Ok(self
            .memory_root
            .join(format!("{name}.sock"))
            .into_std_path_buf())
    }

    fn connected(&self, address: &str, timeout: Option<Duration>) -> Result<UnixStream> {
        let path = self.socket_path(address)?;
        let stream = UnixStream::connect(&path)
            .map_err(|err| NoodleError::Transport(format!("connect to {address}: {err}")))?;
        stream
            .set_read_timeout(timeout)
            .and_then(|()| stream.set_write_timeout(timeout))
            .map_err(|err| NoodleError::Transport(err.to_string()))?;
        Ok(stream)
    }

    fn exchange(
        &self,
        address: &str,
        bytes: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let mut stream = self.connected(address, timeout)?;
        write_frame(&mut stream, bytes)
            .map_err(|err| NoodleError::Transport(format!("send to {address}: {err}")))?;
        read_frame(&mut stream)
            .map_err(|err| NoodleError::Transport(format!("receive from {address}: {err}")))
    }

    /// Whether a CRM server answers at the address within the timeout.
    pub fn ping(&self, address: &str, timeout: Duration) -> bool {
        let Ok(request) = Request::Ping.encode() else {
            return false;
        };
        match self.exchange(address, &request, Some(timeout)) {
            Ok(raw) => matches!(Reply::decode(&raw), Ok(Reply::Pong)),
            Err(err) => {
                debug!(%address, %err, "ping failed");
                false
            }
        }
    }

    /// Forwards opaque request bytes to the server and returns the raw
    /// reply bytes. Used by the HTTP relay endpoint, which never inspects
    /// either side.
    pub fn routing(
        &self,
        address: &str,
        bytes: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.exchange(address, bytes, timeout)
    }

    /// Asks the server to shut down and waits for the acknowledgement.
    pub fn shutdown(&self, address: &str, timeout: Option<Duration>) -> Result<()> {
        let raw = self.exchange(address, &Request::Shutdown.encode()?, timeout)?;
        match Reply::decode(&raw)? {
            Reply::ShuttingDown => Ok(()),
            other => Err(NoodleError::Transport(format!(
                "unexpected shutdown reply from {address}: {other:?}"
            ))),
        }
    }

    pub async fn ping_async(&self, address: &str, timeout: Duration) -> bool {
        let client = self.clone();
        let address = address.to_owned();
        tokio::task::spawn_blocking(move || client.ping(&address, timeout))
            .await
            .unwrap_or(false)
    }

    pub async fn routing_async(
        &self,
        address: &str,
        bytes: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let client = self.clone();
        let address = address.to_owned();
        tokio::task::spawn_blocking(move || client.routing(&address, &bytes, timeout))
            .await
            .map_err(|err| NoodleError::Transport(err.to_string()))?
    }

    pub async fn shutdown_async(&self, address: &str, timeout: Option<Duration>) -> Result<()> {
        let client = self.clone();
        let address = address.to_owned();
        tokio::task::spawn_blocking(move || client.shutdown(&address, timeout))
            .await
            .map_err(|err| NoodleError::Transport(err.to_string()))?
    }
}

fn write_frame(stream: &mut UnixStream, bytes: &[u8]) -> std::io::Result<()> {
    let len =
        u32::try_from(bytes.len()).map_err(|_| std::io::Error::other("frame too large"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(bytes)?;
    stream.flush()
}

fn read_frame(stream: &mut UnixStream) -> std::io::Result<Vec<u8>> {
    let mut len = [0_u8; 4];
    stream.read_exact(&mut len)?;
    let mut buf = vec![0_u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}
