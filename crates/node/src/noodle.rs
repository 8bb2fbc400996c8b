//! The noodle context object: the per-peer engine tying the resource tree,
//! the lock table, the module cache and the RPC client together.
//!
//! One `Noodle` is constructed at boot and passed through explicitly;
//! tests inject private instances with scratch settings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use noodle_config::Settings;
use noodle_modules::ModuleCache;
use noodle_primitives::{
    AccessLevel, AccessMode, IcrmTag, LockKind, NodeKey, NoodleError, RemoteRef, Result,
};
use noodle_rpc::{Client as RpcClient, IcrmStub, RpcTransport};
use noodle_store::{LockTable, NodeRecord, RwLock, TreeStore};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::handle::{server_address, HttpRelayTransport, NodeHandle, SHUTDOWN_TIMEOUT};
use crate::schemas::{LockInfo, ResourceNodeInfo};
use crate::transfer::TransferSession;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub struct Noodle {
    settings: Settings,
    tree: TreeStore,
    locks: LockTable,
    modules: Arc<ModuleCache>,
    rpc: RpcClient,
    /// In-flight pull sessions on this peer, keyed by source node key.
    pub(crate) transfers: Mutex<HashMap<String, Vec<TransferSession>>>,
    /// Serializes snapshot archive creation per peer.
    pub(crate) pack_mutex: Mutex<()>,
}

impl std::fmt::Debug for Noodle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Noodle")
            .field("settings", &self.settings)
            .finish()
    }
}

impl Noodle {
    /// Boots a peer: creates the durable schema, applies the startup
    /// pre-removal policies, and prepares the memory-temp root.
    pub fn open(settings: Settings, modules: ModuleCache) -> eyre::Result<Self> {
        let tree = TreeStore::new(&settings.store_path);
        let locks = LockTable::new(&settings.store_path);
        tree.init()?;
        locks.init()?;

        if settings.pre_remove_locks {
            locks.clear_all()?;
        }

        if settings.pre_remove_temp && settings.memory_temp_path.exists() {
            std::fs::remove_dir_all(settings.memory_temp_path.as_std_path())?;
        }
        std::fs::create_dir_all(settings.memory_temp_path.as_std_path())?;

        if let Some(manifest_path) = &settings.modules_manifest {
            let manifest = noodle_config::ModulesManifest::load(manifest_path)?;
            modules.verify_manifest(&manifest)?;
        }

        let rpc = RpcClient::new(&settings.memory_temp_path);
        info!(store = %settings.store_path, temp = %settings.memory_temp_path, "noodle opened");

        Ok(Self {
            settings,
            tree,
            locks,
            modules: Arc::new(modules),
            rpc,
            transfers: Mutex::new(HashMap::new()),
            pack_mutex: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    #[must_use]
    pub fn tree(&self) -> &TreeStore {
        &self.tree
    }

    #[must_use]
    pub fn modules(&self) -> &ModuleCache {
        &self.modules
    }

    #[must_use]
    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// Graceful teardown: drains process-level CRM servers, removes the
    /// memory-temp root and clears all locks.
    pub fn terminate(&self) {
        self.release_all_process_servers();
        if self.settings.memory_temp_path.exists() {
            if let Err(err) =
                std::fs::remove_dir_all(self.settings.memory_temp_path.as_std_path())
            {
                warn!(%err, "failed to remove memory temp directory");
            }
        }
        if let Err(err) = self.locks.clear_all() {
            error!(%err, "failed to clear locks during teardown");
        }
    }

    /// Sends an RPC shutdown to the CRM server of every process-level
    /// lock. Errors are logged, not propagated; parent crashes leave
    /// children running until this sweep runs.
    pub fn release_all_process_servers(&self) {
        let locks = match self.locks.all_locks() {
            Ok(locks) => locks,
            Err(err) => {
                error!(%err, "failed to enumerate locks for shutdown sweep");
                return;
            }
        };
        for lock in locks {
            if lock.level != AccessLevel::Process {
                continue;
            }
            let address = server_address(&lock.node_key, &lock.lock_id, AccessLevel::Process);
            if let Err(err) = self.rpc.shutdown(&address, SHUTDOWN_TIMEOUT) {
                error!(node_key = %lock.node_key, %address, %err, "failed to shutdown CRM server");
            }
        }
    }

    pub(crate) fn checked_parent(&self, node_key: &NodeKey) -> Result<Option<NodeKey>> {
        let Some(parent) = node_key.parent() else {
            return Ok(None);
        };
        if !self.tree.has(&parent)? {
            return Err(NoodleError::InvalidState(format!(
                "parent node '{parent}' not found in resource tree for node '{node_key}'"
            )));
        }
        Ok(Some(parent))
    }

    /// Mounts a node. Mounting an existing key is idempotent success. A
    /// named template resolves through the module cache and its mount hook
    /// derives the private launch params; mount params without a template
    /// are warned about and discarded (resource set nodes carry none).
    pub fn mount(
        &self,
        node_key: &NodeKey,
        template_name: Option<&str>,
        mount_params: Option<&Value>,
    ) -> Result<()> {
        if self.tree.has(node_key)? {
            debug!(%node_key, "node already mounted, skipping");
            return Ok(());
        }

        if template_name.is_none() && mount_params.is_some() {
            warn!(%node_key, "mount parameters provided for resource set node, ignoring them");
        }

        let parent = self.checked_parent(node_key)?;

        let launch_params = match template_name {
            Some(name) => {
                let template = self.modules.template(name)?;
                let derived = template.hooks().mount(node_key, mount_params)?;
                derived
                    .map(|value| serde_json::to_string(&value))
                    .transpose()
                    .map_err(|err| NoodleError::Other(err.into()))?
            }
            None => None,
        };

        self.tree.insert(
            node_key,
            parent.as_ref(),
            template_name,
            launch_params.as_deref(),
            None,
        )?;
        info!(%node_key, template = template_name.unwrap_or("<set>"), "mounted node");
        Ok(())
    }

    /// Mounts a proxy record forwarding to `<base_url>::<remote_key>`. The
    /// template name is recorded for type matching only.
    pub fn proxy(
        &self,
        node_key: &NodeKey,
        template_name: &str,
        base_url: &str,
        remote_key: &NodeKey,
    ) -> Result<()> {
        if self.tree.has(node_key)? {
            debug!(%node_key, "node already exists, skipping proxy");
            return Ok(());
        }

        let parent = self.checked_parent(node_key)?;
        let access_info = format!("{base_url}::{remote_key}");
        RemoteRef::parse(&access_info)?;

        self.tree.insert(
            node_key,
            parent.as_ref(),
            Some(template_name),
            None,
            Some(&access_info),
        )?;
        info!(%node_key, %access_info, "proxied node");
        Ok(())
    }

    /// Unmounts a subtree depth-first.
    ///
    /// Every record in the subtree is pre-locked with a local write lock to
    /// block new connections during teardown; any record already locked
    /// fails the whole unmount and releases the pre-locks accumulated so
    /// far, leaving the tree unchanged. Proxy records are deleted without
    /// invoking hooks.
    pub fn unmount(&self, node_key: &NodeKey) -> Result<()> {
        if !self.tree.has(node_key)? {
            return Ok(());
        }

        let mut marked: Vec<NodeRecord> = Vec::new();
        let mut marked_keys: Vec<NodeKey> = Vec::new();

        let walk = (|| -> Result<()> {
            let mut stack = vec![node_key.clone()];
            while let Some(current) = stack.pop() {
                let Some(record) = self.tree.load(&current, false)? else {
                    continue;
                };

                match self.locks.lock_node(
                    &current,
                    LockKind::Write,
                    AccessLevel::Local,
                    Some(Duration::ZERO),
                    Duration::from_millis(10),
                ) {
                    Ok(_pre_lock) => {}
                    Err(NoodleError::LockTimeout { .. }) => {
                        return Err(NoodleError::InvalidState(format!(
                            "node '{current}' is locked, cannot unmount node '{node_key}' \
                             recursively; unlock node '{current}' first, then retry unmounting"
                        )));
                    }
                    Err(err) => return Err(err),
                }
                marked_keys.push(current.clone());

                stack.extend(self.tree.child_keys(&current)?);
                marked.push(record);
            }
            Ok(())
        })();

        if let Err(err) = walk {
            error!(%node_key, %err, "failed to unmount node");
            if let Err(release_err) = self.locks.unlock_nodes(&marked_keys) {
                error!(%release_err, "failed to release unmount pre-locks");
            }
            return Err(err);
        }

        let result = (|| -> Result<()> {
            for record in &marked {
                self.tree.delete(&record.node_key)?;
                if record.is_proxy() {
                    continue;
                }
                if let Some(template_name) = &record.template_name {
                    match self.modules.template(template_name) {
                        Ok(template) => template.hooks().unmount(&record.node_key)?,
                        Err(err) => {
                            warn!(node_key = %record.node_key, %err, "skipping unmount hook");
                        }
                    }
                }
            }
            Ok(())
        })();

        if let Err(release_err) = self.locks.unlock_nodes(&marked_keys) {
            error!(%release_err, "failed to release unmount pre-locks");
        }

        match result {
            Ok(()) => {
                debug!(%node_key, "unmounted node");
                Ok(())
            }
            Err(err) => {
                error!(%node_key, %err, "failed to unmount node");
                Err(err)
            }
        }
    }

    pub fn has(&self, node_key: &NodeKey) -> Result<bool> {
        self.tree.has(node_key)
    }

    pub fn load_record(&self, node_key: &NodeKey, cascade: bool) -> Result<Option<NodeRecord>> {
        self.tree.load(node_key, cascade)
    }

    /// Node info with a paged one-level view of direct children.
    pub fn get_node_info(
        &self,
        node_key: &NodeKey,
        child_start_index: usize,
        child_end_index: Option<usize>,
    ) -> Result<Option<ResourceNodeInfo>> {
        let Some(record) = self.tree.load(node_key, true)? else {
            return Ok(None);
        };

        let total = record.children.len();
        let start = child_start_index.min(total);
        let end = child_end_index.unwrap_or(total).min(total).max(start);

        let children: Vec<ResourceNodeInfo> = record.children[start..end]
            .iter()
            .map(ResourceNodeInfo::leaf)
            .collect();

        Ok(Some(ResourceNodeInfo {
            node_key: record.node_key.clone(),
            template_name: record.template_name.clone(),
            access_info: record.access_info.clone(),
            children: (!children.is_empty()).then_some(children),
        }))
    }

    /// Re-runs a template's privatization hook over every record mounted
    /// with it, persisting the regenerated launch params. Used after the
    /// template's privatization logic changes.
    pub fn re_privatize(&self, template_name: &str) -> Result<usize> {
        let template = self.modules.template(template_name)?;
        let keys = self.tree.keys_by_template(template_name)?;
        let mut updated = 0;

        for key in keys {
            let Some(record) = self.tree.load(&key, false)? else {
                continue;
            };
            let current: Option<Value> = record
                .launch_params
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|err| NoodleError::Other(err.into()))?;
            let fresh = template.hooks().privatization(&key, current.as_ref())?;
            let serialized = fresh
                .map(|value| serde_json::to_string(&value))
                .transpose()
                .map_err(|err| NoodleError::Other(err.into()))?;
            self.tree.update_launch_params(&key, serialized.as_deref())?;
            updated += 1;
        }

        info!(template = template_name, updated, "re-privatized launch params");
        Ok(updated)
    }

    /// Builds the handle variant a key and record shape call for: remote
    /// for `<url>::<key>` forms, proxy for records carrying access info,
    /// local otherwise.
    pub(crate) fn handle_for(
        &self,
        icrm_tag: &str,
        node_key: &str,
        mode: AccessMode,
        timeout: Option<Duration>,
        retry_interval: Duration,
    ) -> Result<NodeHandle> {
        let tag: IcrmTag = icrm_tag.parse()?;

        if NodeKey::new(node_key).is_remote() {
            let remote = RemoteRef::parse(node_key)?;
            return Ok(NodeHandle::remote(remote, tag, mode.kind, timeout, retry_interval));
        }

        let key: NodeKey = node_key.parse()?;
        let record = self
            .tree
            .load(&key, false)?
            .ok_or_else(|| NoodleError::NodeNotFound(key.clone()))?;
        if record.is_resource_set() {
            return Err(NoodleError::InvalidState(format!(
                "node '{key}' is a resource set node, cannot get its service"
            )));
        }

        if let Some(remote) = record.remote_ref() {
            return Ok(NodeHandle::proxy(
                &record,
                remote,
                tag,
                mode,
                timeout,
                retry_interval,
                self.locks.clone(),
            ));
        }

        NodeHandle::local(
            &record,
            tag,
            mode,
            timeout,
            retry_interval,
            self.locks.clone(),
            Arc::clone(&self.modules),
            self.rpc.clone(),
        )
    }

    /// Scoped connection to a node: activation paired with a guaranteed
    /// termination on every exit path.
    pub fn connect(
        &self,
        icrm_tag: &str,
        node_key: &str,
        mode: AccessMode,
        timeout: Option<Duration>,
        retry_interval: Duration,
    ) -> Result<Connection> {
        let mut handle = self.handle_for(icrm_tag, node_key, mode, timeout, retry_interval)?;
        handle.activate()?;
        Ok(Connection {
            handle: Some(handle),
        })
    }

    /// Long-lived link to a node. Links always use process-level access so
    /// the CRM server outlives the caller's stack frame; the returned lock
    /// id addresses it until `unlink`.
    pub fn link(
        &self,
        icrm_tag: &str,
        node_key: &str,
        kind: LockKind,
        timeout: Option<Duration>,
        retry_interval: Duration,
    ) -> Result<String> {
        let mut handle = self.handle_for(
            icrm_tag,
            node_key,
            AccessMode::new(AccessLevel::Process, kind),
            timeout,
            retry_interval,
        )?;
        handle.activate()?;
        handle.into_lock_id(&self.locks)
    }

    /// Attaches a fresh stub to an existing link's CRM server.
    pub fn access(&self, icrm_tag: &str, node_key: &str, lock_id: &str) -> Result<IcrmStub> {
        let tag: IcrmTag = icrm_tag.parse()?;

        if NodeKey::new(node_key).is_remote() {
            let remote = RemoteRef::parse(node_key)?;
            let info = fetch_remote_lock(&remote, lock_id)?;
            if info.node_key != remote.remote_key {
                return Err(NoodleError::LockNotFound {
                    lock_id: lock_id.to_owned(),
                    node_key: NodeKey::new(node_key),
                });
            }
            let url = relay_url(&remote, lock_id);
            return Ok(IcrmStub::new(tag, Box::new(HttpRelayTransport::new(url))));
        }

        let key: NodeKey = node_key.parse()?;
        if !self.locks.has_lock(lock_id)? {
            return Err(NoodleError::LockNotFound {
                lock_id: lock_id.to_owned(),
                node_key: key,
            });
        }

        if let Some(record) = self.tree.load(&key, false)? {
            if let Some(remote) = record.remote_ref() {
                let url = relay_url(&remote, lock_id);
                return Ok(IcrmStub::new(tag, Box::new(HttpRelayTransport::new(url))));
            }
        }

        let address = server_address(&key, lock_id, AccessLevel::Process);
        Ok(IcrmStub::new(
            tag,
            Box::new(RpcTransport::new(self.rpc.clone(), address)),
        ))
    }

    /// Severs a link: shuts the CRM server down and removes the lock. For
    /// remote and proxied nodes the peer's deactivation endpoint does the
    /// remote half.
    pub fn unlink(&self, node_key: &str, lock_id: &str) -> Result<()> {
        if NodeKey::new(node_key).is_remote() {
            let remote = RemoteRef::parse(node_key)?;
            let info = fetch_remote_lock(&remote, lock_id)?;
            if info.node_key != remote.remote_key {
                return Err(NoodleError::LockNotFound {
                    lock_id: lock_id.to_owned(),
                    node_key: NodeKey::new(node_key),
                });
            }
            return deactivate_remote(&remote, lock_id);
        }

        let key: NodeKey = node_key.parse()?;
        if !self.locks.has_lock(lock_id)? {
            return Err(NoodleError::LockNotFound {
                lock_id: lock_id.to_owned(),
                node_key: key,
            });
        }

        if let Some(record) = self.tree.load(&key, false)? {
            if let Some(remote) = record.remote_ref() {
                let result = deactivate_remote(&remote, lock_id);
                self.locks.remove_lock(lock_id)?;
                return result;
            }
        }

        let address = server_address(&key, lock_id, AccessLevel::Process);
        if let Err(err) = self.rpc.shutdown(&address, SHUTDOWN_TIMEOUT) {
            warn!(node_key = %key, %address, %err, "CRM server shutdown failed during unlink");
        }
        self.locks.remove_lock(lock_id)?;
        Ok(())
    }

    /// The activation operation behind `GET /noodle/proxy/`: builds a
    /// process-level local handle, cooperatively acquires its lock, spawns
    /// the CRM server and polls it ready, then detaches leaving server and
    /// lock alive for the peer.
    pub async fn activate_node_for_peer(
        &self,
        icrm_tag: &str,
        node_key: &str,
        kind: LockKind,
        timeout: Option<Duration>,
        retry_interval: Duration,
    ) -> Result<LockInfo> {
        let key: NodeKey = node_key.parse()?;
        let record = self
            .tree
            .load(&key, false)?
            .ok_or_else(|| NoodleError::NodeNotFound(key.clone()))?;
        let template_name = record.template_name.as_deref().ok_or_else(|| {
            NoodleError::InvalidState(format!(
                "node '{key}' is a resource set node, cannot get its service"
            ))
        })?;
        self.modules.match_modules(icrm_tag, template_name)?;

        let mut handle = self.handle_for(
            icrm_tag,
            node_key,
            AccessMode::new(AccessLevel::Process, kind),
            timeout,
            retry_interval,
        )?;
        handle.activate_cooperative().await?;
        let lock_id = handle.into_lock_id(&self.locks)?;

        let info = self
            .locks
            .get_info(&lock_id)?
            .ok_or_else(|| NoodleError::LockNotFound {
                lock_id,
                node_key: key,
            })?;
        Ok(info.into())
    }

    /// The relay operation behind `POST /noodle/proxy/`: forwards opaque
    /// RPC bytes to the CRM server a peer's lock addresses.
    pub async fn relay(
        &self,
        node_key: &str,
        lock_id: &str,
        body: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let key: NodeKey = node_key.parse()?;
        if !self.locks.has_lock(lock_id)? {
            return Err(NoodleError::LockNotFound {
                lock_id: lock_id.to_owned(),
                node_key: key,
            });
        }
        let address = server_address(&key, lock_id, AccessLevel::Process);
        self.rpc.routing_async(&address, body, timeout).await
    }

    /// The deactivation operation behind `DELETE /noodle/proxy/`: shuts
    /// the peer-held CRM server down and removes its lock.
    pub async fn deactivate_node_for_peer(&self, node_key: &str, lock_id: &str) -> Result<()> {
        let key: NodeKey = node_key.parse()?;
        if !self.locks.has_lock(lock_id)? {
            return Err(NoodleError::LockNotFound {
                lock_id: lock_id.to_owned(),
                node_key: key,
            });
        }
        let address = server_address(&key, lock_id, AccessLevel::Process);
        if let Err(err) = self.rpc.shutdown_async(&address, SHUTDOWN_TIMEOUT).await {
            warn!(node_key = %key, %address, %err, "CRM server shutdown failed during deactivation");
        }
        self.locks.remove_lock(lock_id)?;
        Ok(())
    }

    /// Acquires a standalone lock on a node. Exposed for the activation
    /// endpoint and the transfer layer.
    pub(crate) fn lock_node(
        &self,
        node_key: &NodeKey,
        kind: LockKind,
        level: AccessLevel,
        timeout: Option<Duration>,
        retry_interval: Duration,
    ) -> Result<RwLock> {
        self.locks
            .lock_node(node_key, kind, level, timeout, retry_interval)
    }
}

fn relay_url(remote: &RemoteRef, lock_id: &str) -> String {
    format!(
        "{}/noodle/proxy/?node_key={}&lock_id={lock_id}",
        remote.base_url, remote.remote_key
    )
}

fn fetch_remote_lock(remote: &RemoteRef, lock_id: &str) -> Result<LockInfo> {
    let url = format!("{}/noodle/lock/?lock_id={lock_id}", remote.base_url);
    let http = reqwest::blocking::Client::new();
    let response = http
        .get(&url)
        .send()
        .map_err(|err| NoodleError::Transport(format!("lock lookup {url}: {err}")))?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(NoodleError::LockNotFound {
            lock_id: lock_id.to_owned(),
            node_key: remote.remote_key.clone(),
        });
    }
    if !response.status().is_success() {
        return Err(NoodleError::Transport(format!(
            "failed to validate lock for remote CRM server: {}",
            response.status()
        )));
    }
    response
        .json()
        .map_err(|err| NoodleError::Transport(err.to_string()))
}

fn deactivate_remote(remote: &RemoteRef, lock_id: &str) -> Result<()> {
    let url = relay_url(remote, lock_id);
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

/// A scoped node connection. Terminates the handle (and releases its
/// lock) when dropped; prefer [`Connection::terminate`] to observe
/// teardown failures.
#[derive(Debug)]
pub struct Connection {
    handle: Option<NodeHandle>,
}

impl Connection {
    pub fn stub(&mut self) -> Result<&mut IcrmStub> {
        self.handle
            .as_mut()
            .and_then(NodeHandle::stub_mut)
            .ok_or_else(|| NoodleError::InvalidState("connection is not active".into()))
    }

    #[must_use]
    pub fn lock_id(&self) -> Option<String> {
        self.handle.as_ref().and_then(NodeHandle::lock_id)
    }

    #[must_use]
    pub fn server_address(&self) -> Option<String> {
        self.handle.as_ref().map(NodeHandle::server_address)
    }

    pub fn terminate(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle.terminate(),
            None => Ok(()),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.terminate() {
                error!(%err, "failed to terminate node connection");
            }
        }
    }
}
