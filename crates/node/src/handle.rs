//! Node handles: one polymorphic handle over local, remote and proxy
//! nodes.
//!
//! A handle moves through `NEW → LOCK_HELD → ACTIVE → CLOSED`. Lock
//! acquisition always precedes activation; termination reverses the steps
//! and releases the lock last. Local handles run the CRM in-process
//! (`local://`) or in a spawned child process (`memory://`); remote and
//! proxy handles drive a peer's CRM through its HTTP relay endpoint, the
//! proxy flavor additionally holding a local lock so the local tree's
//! invariants cover proxied nodes.

use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use noodle_modules::ModuleCache;
use noodle_primitives::{
    AccessLevel, AccessMode, IcrmTag, LockKind, NodeKey, NoodleError, Result,
};
use noodle_rpc::{Client as RpcClient, DirectTransport, IcrmStub, RpcTransport, Transport};
use noodle_store::{LockTable, NodeRecord, RwLock};
use tracing::{debug, error, info, warn};

use crate::schemas::LockInfo;

/// Cadence of readiness polling against a freshly spawned CRM server.
pub const PING_INTERVAL: Duration = Duration::from_millis(100);
/// Hard ceiling for blocking activation of a child-process CRM server.
pub const BLOCKING_PING_CEILING: Duration = Duration::from_secs(60);
/// Bound on CRM server shutdown round trips.
pub const SHUTDOWN_TIMEOUT: Option<Duration> = Some(Duration::from_secs(30));

/// The deterministic CRM server address for a locked node.
#[must_use]
pub fn server_address(node_key: &NodeKey, lock_id: &str, level: AccessLevel) -> String {
    let scheme = match level {
        AccessLevel::Local => "local",
        AccessLevel::Process => "memory",
    };
    format!("{scheme}://{}_{lock_id}", node_key.flat())
}

/// Transport relaying opaque RPC bytes through a peer's proxy endpoint.
pub struct HttpRelayTransport {
    http: reqwest::blocking::Client,
    url: String,
}

impl std::fmt::Debug for HttpRelayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRelayTransport")
            .field("url", &self.url)
            .finish()
    }
}

impl HttpRelayTransport {
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            http: reqwest::blocking::Client::new(),
            url,
        }
    }
}

impl Transport for HttpRelayTransport {
    fn send(&mut self, request: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut builder = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(request.to_vec());
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let response = builder
            .send()
            .map_err(|err| NoodleError::Transport(format!("relay to {}: {err}", self.url)))?;
        if !response.status().is_success() {
            return Err(NoodleError::Transport(format!(
                "relay to {} returned {}",
                self.url,
                response.status()
            )));
        }
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| NoodleError::Transport(err.to_string()))
    }
}

/// A handle over one node, tagged by where its CRM actually runs.
#[derive(Debug)]
pub struct NodeHandle {
    kind: HandleKind,
}

#[derive(Debug)]
enum HandleKind {
    Local(LocalNode),
    Remote(RemoteNode),
    Proxy(ProxyNode),
}

impl NodeHandle {
    pub(crate) fn local(
        record: &NodeRecord,
        tag: IcrmTag,
        mode: AccessMode,
        timeout: Option<Duration>,
        retry_interval: Duration,
        locks: LockTable,
        modules: Arc<ModuleCache>,
        rpc: RpcClient,
    ) -> Result<Self> {
        let template_name = record.template_name.clone().ok_or_else(|| {
            NoodleError::InvalidState(format!(
                "node '{}' is a resource set node, cannot get its service",
                record.node_key
            ))
        })?;
        let lock = RwLock::new(locks, record.node_key.clone(), mode, timeout, retry_interval);
        Ok(Self {
            kind: HandleKind::Local(LocalNode {
                tag,
                node_key: record.node_key.clone(),
                template_name,
                launch_params: record.launch_params.clone(),
                level: mode.level,
                lock,
                modules,
                rpc,
                child: None,
                stub: None,
            }),
        })
    }

    pub(crate) fn remote(
        remote: noodle_primitives::RemoteRef,
        tag: IcrmTag,
        kind: LockKind,
        timeout: Option<Duration>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            kind: HandleKind::Remote(RemoteNode {
                tag,
                remote,
                kind,
                timeout,
                retry_interval,
                remote_lock_id: None,
                stub: None,
            }),
        }
    }

    pub(crate) fn proxy(
        record: &NodeRecord,
        remote: noodle_primitives::RemoteRef,
        tag: IcrmTag,
        mode: AccessMode,
        timeout: Option<Duration>,
        retry_interval: Duration,
        locks: LockTable,
    ) -> Self {
        let lock = RwLock::new(locks, record.node_key.clone(), mode, timeout, retry_interval);
        Self {
            kind: HandleKind::Proxy(ProxyNode {
                lock,
                remote: RemoteNode {
                    tag,
                    remote,
                    kind: mode.kind,
                    timeout,
                    retry_interval,
                    remote_lock_id: None,
                    stub: None,
                },
            }),
        }
    }

    /// Acquires the lock and brings the CRM up, blocking the thread while
    /// waiting.
    pub fn activate(&mut self) -> Result<()> {
        match &mut self.kind {
            HandleKind::Local(node) => node.activate(),
            HandleKind::Remote(node) => node.activate(),
            HandleKind::Proxy(node) => node.activate(),
        }
    }

    /// The cooperative activation driver used by the activation endpoint:
    /// suspends on lock retries and on `ping` polls. Only local handles
    /// activate this way; remote handshakes stay in the blocking domain.
    pub async fn activate_cooperative(&mut self) -> Result<()> {
        match &mut self.kind {
            HandleKind::Local(node) => node.activate_cooperative().await,
            _ => Err(NoodleError::InvalidState(
                "cooperative activation only applies to local handles".into(),
            )),
        }
    }

    /// Tears the CRM down and releases the lock.
    pub fn terminate(self) -> Result<()> {
        match self.kind {
            HandleKind::Local(node) => node.terminate(),
            HandleKind::Remote(mut node) => node.terminate(),
            HandleKind::Proxy(node) => node.terminate(),
        }
    }

    /// Detaches the handle, leaving the lock held and any CRM server
    /// running, and returns the lock id addressing them. Used by `link`.
    ///
    /// For proxy handles the local lock row adopts the remote lock id, so
    /// one identifier addresses both sides afterwards.
    pub fn into_lock_id(self, locks: &LockTable) -> Result<String> {
        match self.kind {
            HandleKind::Local(node) => Ok(node.lock.id().to_owned()),
            HandleKind::Remote(node) => node.remote_lock_id.ok_or_else(|| {
                NoodleError::InvalidState("remote handle was never activated".into())
            }),
            HandleKind::Proxy(node) => {
                let remote_id = node.remote.remote_lock_id.ok_or_else(|| {
                    NoodleError::InvalidState("proxy handle was never activated".into())
                })?;
                locks.update_lock_id(node.lock.id(), &remote_id)?;
                Ok(remote_id)
            }
        }
    }

    /// The lock id the handle currently holds, if activated.
    #[must_use]
    pub fn lock_id(&self) -> Option<String> {
        match &self.kind {
            HandleKind::Local(node) => Some(node.lock.id().to_owned()),
            HandleKind::Remote(node) => node.remote_lock_id.clone(),
            HandleKind::Proxy(node) => node.remote.remote_lock_id.clone(),
        }
    }

    #[must_use]
    pub fn server_address(&self) -> String {
        match &self.kind {
            HandleKind::Local(node) => {
                server_address(&node.node_key, node.lock.id(), node.level)
            }
            HandleKind::Remote(node) => node.relay_url(),
            HandleKind::Proxy(node) => node.remote.relay_url(),
        }
    }

    pub fn stub_mut(&mut self) -> Option<&mut IcrmStub> {
        match &mut self.kind {
            HandleKind::Local(node) => node.stub.as_mut(),
            HandleKind::Remote(node) => node.stub.as_mut(),
            HandleKind::Proxy(node) => node.remote.stub.as_mut(),
        }
    }
}

struct LocalNode {
    tag: IcrmTag,
    node_key: NodeKey,
    template_name: String,
    launch_params: Option<String>,
    level: AccessLevel,
    lock: RwLock,
    modules: Arc<ModuleCache>,
    rpc: RpcClient,
    child: Option<Child>,
    stub: Option<IcrmStub>,
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("node_key", &self.node_key)
            .field("template_name", &self.template_name)
            .field("level", &self.level)
            .finish()
    }
}

impl LocalNode {
    fn address(&self) -> String {
        server_address(&self.node_key, self.lock.id(), self.level)
    }

    fn activate(&mut self) -> Result<()> {
        self.lock.acquire()?;
        if let Err(err) = self.bring_up() {
            self.rollback();
            return Err(err);
        }
        Ok(())
    }

    async fn activate_cooperative(&mut self) -> Result<()> {
        self.lock.acquire_async().await?;
        let result = match self.level {
            AccessLevel::Local => self.instantiate(),
            AccessLevel::Process => {
                match self.spawn_server() {
                    Ok(()) => self.wait_ready_cooperative().await,
                    Err(err) => Err(err),
                }
            }
        };
        if let Err(err) = result {
            self.rollback();
            return Err(err);
        }
        Ok(())
    }

    fn bring_up(&mut self) -> Result<()> {
        match self.level {
            AccessLevel::Local => self.instantiate(),
            AccessLevel::Process => {
                self.spawn_server()?;
                self.wait_ready_blocking()
            }
        }
    }

    /// Local level: the CRM is a plain in-process instance behind a direct
    /// transport; no server exists.
    fn instantiate(&mut self) -> Result<()> {
        let template = self.modules.template(&self.template_name)?;
        let crm = template.construct(self.launch_params.as_deref())?;
        self.stub = Some(IcrmStub::new(
            self.tag.clone(),
            Box::new(DirectTransport::new(crm)),
        ));
        debug!(node_key = %self.node_key, "activated in-process CRM");
        Ok(())
    }

    fn spawn_server(&mut self) -> Result<()> {
        let template = self.modules.template(&self.template_name)?;
        let launcher = template.launcher().ok_or_else(|| {
            NoodleError::InvalidState(format!(
                "template '{}' has no launcher command for process-level access",
                self.template_name
            ))
        })?;
        let (program, base_args) = launcher.split_first().ok_or_else(|| {
            NoodleError::InvalidState(format!(
                "template '{}' has an empty launcher command",
                self.template_name
            ))
        })?;

        let address = self.address();
        let child = Command::new(program)
            .args(base_args)
            .arg("--icrm-tag")
            .arg(self.tag.to_string())
            .arg("--server-address")
            .arg(&address)
            .arg("--node-key")
            .arg(self.node_key.as_str())
            .arg("--params")
            .arg(self.launch_params.as_deref().unwrap_or(""))
            .stdin(Stdio::null())
            .spawn()
            .map_err(|err| {
                NoodleError::Other(eyre::eyre!(
                    "failed to launch CRM server for node '{}': {err}",
                    self.node_key
                ))
            })?;
        info!(node_key = %self.node_key, %address, pid = child.id(), "launched CRM server");
        self.child = Some(child);
        Ok(())
    }

    fn wait_ready_blocking(&mut self) -> Result<()> {
        let address = self.address();
        let start = Instant::now();
        while !self.rpc.ping(&address, PING_INTERVAL) {
            if start.elapsed() >= BLOCKING_PING_CEILING {
                return Err(NoodleError::ServerNotReady(self.node_key.clone()));
            }
            std::thread::sleep(PING_INTERVAL);
        }
        self.attach_client();
        Ok(())
    }

    async fn wait_ready_cooperative(&mut self) -> Result<()> {
        let address = self.address();
        let ceiling = self.lock.timeout();
        let start = Instant::now();
        while !self.rpc.ping_async(&address, PING_INTERVAL).await {
            if let Some(ceiling) = ceiling {
                if start.elapsed() >= ceiling {
                    return Err(NoodleError::ServerNotReady(self.node_key.clone()));
                }
            }
            tokio::time::sleep(PING_INTERVAL).await;
        }
        self.attach_client();
        Ok(())
    }

    fn attach_client(&mut self) {
        let address = self.address();
        self.stub = Some(IcrmStub::new(
            self.tag.clone(),
            Box::new(RpcTransport::new(self.rpc.clone(), address)),
        ));
    }

    /// Undoes a failed activation: no orphan child, no orphan lock.
    fn rollback(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill() {
                warn!(node_key = %self.node_key, %err, "failed to kill unready CRM server");
            }
            let _ = child.wait();
        }
        self.lock.release();
    }

    fn terminate(mut self) -> Result<()> {
        let mut result = Ok(());
        if let Some(mut stub) = self.stub.take() {
            stub.close();
        }
        if self.level == AccessLevel::Process {
            let address = self.address();
            match self.rpc.shutdown(&address, SHUTDOWN_TIMEOUT) {
                Ok(()) => {
                    if let Some(mut child) = self.child.take() {
                        let _ = child.wait();
                    }
                }
                Err(err) => {
                    error!(node_key = %self.node_key, %address, %err, "CRM server shutdown failed");
                    if let Some(mut child) = self.child.take() {
                        let _ = child.kill();
                        let _ = child.wait();
                    }
                    result = Err(err);
                }
            }
        }
        self.lock.release();
        result
    }
}

struct RemoteNode {
    tag: IcrmTag,
    remote: noodle_primitives::RemoteRef,
    kind: LockKind,
    timeout: Option<Duration>,
    retry_interval: Duration,
    remote_lock_id: Option<String>,
    stub: Option<IcrmStub>,
}

impl std::fmt::Debug for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteNode")
            .field("remote", &self.remote)
            .field("kind", &self.kind)
            .field("remote_lock_id", &self.remote_lock_id)
            .finish()
    }
}

impl RemoteNode {
    fn relay_url(&self) -> String {
        format!(
            "{}/noodle/proxy/?node_key={}",
            self.remote.base_url, self.remote.remote_key
        )
    }

    /// Handshakes against the peer's activation endpoint to obtain a
    /// remote lock, then attaches a relay transport bound to it.
    fn activate(&mut self) -> Result<()> {
        let mut url = format!(
            "{}&icrm_tag={}&lock_type={}&retry_interval={}",
            self.relay_url(),
            self.tag,
            self.kind,
            self.retry_interval.as_secs_f64()
        );
        if let Some(timeout) = self.timeout {
            url.push_str(&format!("&timeout={}", timeout.as_secs_f64()));
        }

        let http = reqwest::blocking::Client::new();
        let response = http
            .get(&url)
            .send()
            .map_err(|err| NoodleError::Transport(format!("activate {url}: {err}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(NoodleError::Transport(format!(
                "failed to acquire lock for remote CRM server: {status}: {body}"
            )));
        }
        let info: LockInfo = response
            .json()
            .map_err(|err| NoodleError::Transport(err.to_string()))?;

        let proxy_url = format!("{}&lock_id={}", self.relay_url(), info.lock_id);
        self.stub = Some(IcrmStub::new(
            self.tag.clone(),
            Box::new(HttpRelayTransport::new(proxy_url)),
        ));
        self.remote_lock_id = Some(info.lock_id);
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        if let Some(mut stub) = self.stub.take() {
            stub.close();
        }
        let Some(lock_id) = self.remote_lock_id.take() else {
            return Ok(());
        };
        let url = format!("{}&lock_id={lock_id}", self.relay_url());
        let http = reqwest::blocking::Client::new();
        let response = http
            .delete(&url)
            .send()
            .map_err(|err| NoodleError::Transport(format!("deactivate {url}: {err}")))?;
        if !response.status().is_success() {
            return Err(NoodleError::Transport(format!(
                "failed to deactivate remote CRM server: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// A local proxy record: behaves like a remote handle, plus a local lock
/// enforcing this tree's invariants over the proxied node.
#[derive(Debug)]
struct ProxyNode {
    lock: RwLock,
    remote: RemoteNode,
}

impl ProxyNode {
    fn activate(&mut self) -> Result<()> {
        self.lock.acquire()?;
        if let Err(err) = self.remote.activate() {
            self.lock.release();
            return Err(err);
        }
        Ok(())
    }

    fn terminate(mut self) -> Result<()> {
        let result = self.remote.terminate();
        self.lock.release();
        result
    }
}
