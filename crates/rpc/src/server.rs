//! The `memory://` CRM server: a Unix-domain socket accepting
//! length-delimited borsh frames and routing them into one CRM instance.

use std::path::PathBuf;
use std::sync::Arc;

use camino::Utf8Path;
use futures_util::{SinkExt, StreamExt};
use noodle_primitives::{NoodleError, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::MEMORY_SCHEME;
use crate::message::{Reply, Request};
use crate::Crm;

/// A running CRM server. Dropping the handle does not stop the server;
/// shutdown happens through the wire protocol or [`CrmServer::stop`].
#[derive(Debug)]
pub struct CrmServer {
    address: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CrmServer {
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Requests shutdown without going through the wire protocol.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Waits until the server has terminated its CRM and removed its
    /// socket.
    pub async fn wait(self) {
        let _ = self.task.await;
    }
}

/// Hosts a CRM at a `memory://` address beneath the memory-temp root.
pub async fn serve(
    memory_root: &Utf8Path,
    address: &str,
    crm: Box<dyn Crm>,
) -> Result<CrmServer> {
    let Some(name) = address.strip_prefix(MEMORY_SCHEME) else {
        return Err(NoodleError::Validation(format!(
            "cannot serve a CRM at non-memory address '{address}'"
        )));
    };
    let socket_path: PathBuf = memory_root.join(format!("{name}.sock")).into_std_path_buf();

    std::fs::create_dir_all(memory_root)
        .map_err(|err| NoodleError::Transport(err.to_string()))?;
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }

    let listener = UnixListener::bind(&socket_path)
        .map_err(|err| NoodleError::Transport(format!("bind {socket_path:?}: {err}")))?;

    let crm = Arc::new(Mutex::new(crm));
    let cancel = CancellationToken::new();
    let accept_cancel = cancel.clone();
    let accept_address = address.to_owned();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = accept_cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let crm = Arc::clone(&crm);
                            let cancel = accept_cancel.clone();
                            drop(tokio::spawn(handle_connection(stream, crm, cancel)));
                        }
                        Err(err) => {
                            error!(address = %accept_address, %err, "CRM server accept failed");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(err) = crm.lock().await.terminate() {
            error!(address = %accept_address, %err, "CRM terminate hook failed");
        }
        let _ = std::fs::remove_file(&socket_path);
        info!(address = %accept_address, "CRM server stopped");
    });

    Ok(CrmServer {
        address: address.to_owned(),
        cancel,
        task,
    })
}

async fn handle_connection(
    stream: UnixStream,
    crm: Arc<Mutex<Box<dyn Crm>>>,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%err, "CRM connection read failed");
                return;
            }
        };

        let reply = match Request::decode(&frame) {
            Ok(Request::Ping) => Reply::Pong,
            Ok(Request::Call { method, payload }) => {
                let mut crm = crm.lock().await;
                match crm.route(&method, &payload) {
                    Ok(bytes) => Reply::Ok(bytes),
                    Err(err) => Reply::Err(err.to_string()),
                }
            }
            Ok(Request::Shutdown) => {
                let _ = send_reply(&mut framed, &Reply::ShuttingDown).await;
                cancel.cancel();
                return;
            }
            Err(err) => Reply::Err(err.to_string()),
        };

        if send_reply(&mut framed, &reply).await.is_err() {
            return;
        }
    }
}

async fn send_reply(
    framed: &mut Framed<UnixStream, LengthDelimitedCodec>,
    reply: &Reply,
) -> Result<()> {
    let bytes = reply.encode()?;
    framed
        .send(bytes.into())
        .await
        .map_err(|err| NoodleError::Transport(err.to_string()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::Client;
    use crate::message::Request;

    struct Echo {
        terminated: bool,
    }

    impl Crm for Echo {
        fn route(&mut self, method: &str, payload: &[u8]) -> Result<Vec<u8>> {
            if method == "fail" {
                return Err(NoodleError::InvalidState("echo refuses".into()));
            }
            Ok(payload.to_vec())
        }

        fn terminate(&mut self) -> Result<()> {
            self.terminated = true;
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ping_call_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let address = "memory://root_names_lock1";

        let server = serve(root, address, Box::new(Echo { terminated: false }))
            .await
            .unwrap();
        let client = Client::new(root);

        assert!(client.ping_async(address, Duration::from_secs(1)).await);

        let call = Request::Call {
            method: "echo".to_owned(),
            payload: b"hello".to_vec(),
        }
        .encode()
        .unwrap();
        let raw = client
            .routing_async(address, call, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(Reply::decode(&raw).unwrap(), Reply::Ok(b"hello".to_vec()));

        let fail = Request::Call {
            method: "fail".to_owned(),
            payload: Vec::new(),
        }
        .encode()
        .unwrap();
        let raw = client
            .routing_async(address, fail, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(matches!(Reply::decode(&raw).unwrap(), Reply::Err(_)));

        client
            .shutdown_async(address, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        server.wait().await;

        assert!(!client.ping_async(address, Duration::from_millis(100)).await);
    }
}
