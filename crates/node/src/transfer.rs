//! Snapshot transfer: packing a node's backing resource into a compressed
//! archive and streaming it between peers in base64 chunks.
//!
//! Every transfer holds two read locks on the source peer: one on the
//! source node and one on the synthetic `<key>_tar` key, which
//! reference-counts transfers sharing the same archive; the archive file
//! is deleted when the last holder releases. Archive creation is
//! serialized by an in-process mutex. One canonical chunk size (1 MiB)
//! applies to both directions.
//!
//! Outbound archives live in the pull/push caches; inbound chunks are
//! assembled under the separate `inbound/` directory, so a transfer
//! arriving for a key never touches an archive this peer is serving
//! under the same key.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use camino::Utf8PathBuf;
use noodle_primitives::{
    AccessLevel, LockKind, NodeKey, NoodleError, RemoteRef, Result,
};
use noodle_store::RwLock;
use tracing::{debug, info, warn};

use crate::noodle::{Noodle, DEFAULT_RETRY_INTERVAL};
use crate::schemas::{ChunkResponse, PackingResponse, PullFromRequest};

pub const CHUNK_SIZE: u64 = 1024 * 1024;

/// The lock pair a source peer holds for one in-flight pull.
#[derive(Debug)]
pub(crate) struct TransferSession {
    node_lock: RwLock,
    tar_lock: RwLock,
}

impl Noodle {
    fn archive_path(&self, dir: Utf8PathBuf, node_key: &NodeKey) -> Result<Utf8PathBuf> {
        std::fs::create_dir_all(dir.as_std_path())
            .map_err(|err| NoodleError::Store(err.to_string()))?;
        Ok(dir.join(format!("{}.tar.gz", node_key.flat())))
    }

    /// Packs an archive through the template's pack hook unless one is
    /// already cached. Serialized per peer; a failed pack leaves no
    /// partial archive behind.
    fn ensure_archive(&self, node_key: &NodeKey, tar_path: &Utf8PathBuf) -> Result<()> {
        let record = self
            .load_record(node_key, false)?
            .ok_or_else(|| NoodleError::NodeNotFound(node_key.clone()))?;
        if record.is_proxy() {
            return Err(NoodleError::InvalidState(format!(
                "node '{node_key}' is a proxy record, its resource lives on the remote peer"
            )));
        }
        let template_name = record.template_name.as_deref().ok_or_else(|| {
            NoodleError::InvalidState(format!(
                "node '{node_key}' is a resource set node and has no resource to pack"
            ))
        })?;
        let template = self.modules().template(template_name)?;

        let _guard = self.pack_mutex.lock();
        if tar_path.exists() {
            return Ok(());
        }
        if let Err(err) =
            template
                .hooks()
                .pack(node_key, record.launch_params.as_deref(), tar_path)
        {
            let _ = std::fs::remove_file(tar_path.as_std_path());
            return Err(NoodleError::Other(err));
        }
        Ok(())
    }

    /// The packing operation of the pull protocol: materializes the
    /// archive, takes the source-node and tar read locks, and returns the
    /// archive's actual byte size.
    pub fn pack_for_pull(&self, node_key: &NodeKey) -> Result<PackingResponse> {
        let tar_path = self.archive_path(self.settings().pull_cache_dir(), node_key)?;
        self.ensure_archive(node_key, &tar_path)?;

        let node_lock = self.lock_node(
            node_key,
            LockKind::Read,
            AccessLevel::Local,
            None,
            DEFAULT_RETRY_INTERVAL,
        )?;
        let tar_lock = match self.lock_node(
            &node_key.tar_key(),
            LockKind::Read,
            AccessLevel::Local,
            None,
            DEFAULT_RETRY_INTERVAL,
        ) {
            Ok(lock) => lock,
            Err(err) => {
                node_lock.release();
                return Err(err);
            }
        };

        self.transfers
            .lock()
            .entry(node_key.to_string())
            .or_default()
            .push(TransferSession {
                node_lock,
                tar_lock,
            });

        let compress_file_size = std::fs::metadata(tar_path.as_std_path())
            .map_err(|err| NoodleError::Store(err.to_string()))?
            .len();
        info!(%node_key, compress_file_size, "packed archive for pull transfer");
        Ok(PackingResponse { compress_file_size })
    }

    /// Serves one chunk of a previously packed archive. The final chunk
    /// releases this transfer's locks; the archive is deleted once no
    /// tar-lock holder remains.
    pub fn read_pull_chunk(
        &self,
        node_key: &NodeKey,
        chunk_index: u64,
        chunk_size: Option<u64>,
    ) -> Result<ChunkResponse> {
        let chunk_size = chunk_size.unwrap_or(CHUNK_SIZE);
        if chunk_size == 0 || chunk_size > 8 * CHUNK_SIZE {
            return Err(NoodleError::Validation(format!(
                "chunk_size must be between 1 and {} bytes",
                8 * CHUNK_SIZE
            )));
        }

        let tar_path = self
            .settings()
            .pull_cache_dir()
            .join(format!("{}.tar.gz", node_key.flat()));
        if !tar_path.exists() {
            return Err(NoodleError::InvalidState(format!(
                "no packed archive for node '{node_key}'; run packing first"
            )));
        }

        let file_size = std::fs::metadata(tar_path.as_std_path())
            .map_err(|err| NoodleError::Store(err.to_string()))?
            .len();
        let offset = chunk_index.saturating_mul(chunk_size);

        let mut buffer = vec![0_u8; chunk_size as usize];
        let read = if offset < file_size {
            let mut file = File::open(tar_path.as_std_path())
                .map_err(|err| NoodleError::Store(err.to_string()))?;
            file.seek(SeekFrom::Start(offset))
                .map_err(|err| NoodleError::Store(err.to_string()))?;
            read_up_to(&mut file, &mut buffer).map_err(|err| NoodleError::Store(err.to_string()))?
        } else {
            0
        };
        buffer.truncate(read);

        let is_last_chunk = offset + read as u64 >= file_size;
        if is_last_chunk {
            self.finish_pull_session(node_key, &tar_path);
        }

        Ok(ChunkResponse {
            chunk_index,
            chunk_data: BASE64.encode(&buffer),
            is_last_chunk,
        })
    }

    fn finish_pull_session(&self, node_key: &NodeKey, tar_path: &Utf8PathBuf) {
        let session = {
            let mut transfers = self.transfers.lock();
            let session = transfers
                .get_mut(node_key.as_str())
                .and_then(Vec::pop);
            if matches!(transfers.get(node_key.as_str()), Some(list) if list.is_empty()) {
                drop(transfers.remove(node_key.as_str()));
            }
            session
        };

        if let Some(session) = session {
            session.node_lock.release();
            session.tar_lock.release();
        }

        match self.locks().is_node_locked(&node_key.tar_key()) {
            Ok(false) => {
                if let Err(err) = std::fs::remove_file(tar_path.as_std_path()) {
                    warn!(%node_key, %err, "failed to remove transferred archive");
                } else {
                    debug!(%node_key, "removed archive after last transfer");
                }
            }
            Ok(true) => {}
            Err(err) => warn!(%node_key, %err, "failed to check tar lock refcount"),
        }
    }

    /// Pull: fetch a remote node's resource and install it locally under
    /// `target_node_key`. An existing target record is displaced to
    /// `<target>_copy` first.
    pub fn pull(
        &self,
        template_name: &str,
        target_node_key: &NodeKey,
        source_node_key: &str,
    ) -> Result<()> {
        let source = RemoteRef::parse(source_node_key)?;
        let template = self.modules().template(template_name)?;
        self.checked_parent(target_node_key)?;
        self.displace_existing(target_node_key)?;

        let http = reqwest::blocking::Client::new();
        let packing_url = format!(
            "{}/noodle/node/packing?node_key={}",
            source.base_url, source.remote_key
        );
        let response = http
            .post(&packing_url)
            .send()
            .map_err(|err| NoodleError::Transport(format!("packing request: {err}")))?;
        if !response.status().is_success() {
            return Err(NoodleError::Transport(format!(
                "source peer failed to pack '{}': {}",
                source.remote_key,
                response.status()
            )));
        }
        let packing: PackingResponse = response
            .json()
            .map_err(|err| NoodleError::Transport(err.to_string()))?;

        let temp_path = self.archive_path(self.settings().inbound_dir(), target_node_key)?;

        let streamed = (|| -> Result<()> {
            let mut file = File::create(temp_path.as_std_path())
                .map_err(|err| NoodleError::Store(err.to_string()))?;
            let mut written: u64 = 0;
            for chunk_index in 0_u64.. {
                let chunk_url = format!(
                    "{}/noodle/node/push_to?node_key={}&chunk_index={chunk_index}&chunk_size={CHUNK_SIZE}",
                    source.base_url, source.remote_key
                );
                let response = http
                    .get(&chunk_url)
                    .send()
                    .map_err(|err| NoodleError::Transport(format!("chunk request: {err}")))?;
                if !response.status().is_success() {
                    return Err(NoodleError::Transport(format!(
                        "chunk {chunk_index} of '{}' failed: {}",
                        source.remote_key,
                        response.status()
                    )));
                }
                let chunk: ChunkResponse = response
                    .json()
                    .map_err(|err| NoodleError::Transport(err.to_string()))?;
                let data = BASE64
                    .decode(chunk.chunk_data.as_bytes())
                    .map_err(|err| NoodleError::Validation(format!("malformed chunk: {err}")))?;
                file.write_all(&data)
                    .map_err(|err| NoodleError::Store(err.to_string()))?;
                written += data.len() as u64;
                if chunk.is_last_chunk {
                    break;
                }
            }
            file.flush().map_err(|err| NoodleError::Store(err.to_string()))?;

            if written != packing.compress_file_size {
                return Err(NoodleError::Transport(format!(
                    "archive of '{}' truncated: expected {} bytes, received {written}",
                    source.remote_key, packing.compress_file_size
                )));
            }

            self.mount(target_node_key, Some(template_name), None)?;
            let record = self
                .load_record(target_node_key, false)?
                .ok_or_else(|| NoodleError::NodeNotFound(target_node_key.clone()))?;
            template
                .hooks()
                .unpack(target_node_key, record.launch_params.as_deref(), &temp_path)
                .map_err(NoodleError::Other)?;
            Ok(())
        })();

        let _ = std::fs::remove_file(temp_path.as_std_path());
        if streamed.is_ok() {
            info!(target = %target_node_key, source = %source_node_key, "pulled snapshot");
        }
        streamed
    }

    /// Push: stream a local node's resource to a remote peer, installing
    /// it there under the target key.
    pub fn push(
        &self,
        template_name: &str,
        source_node_key: &NodeKey,
        target_node_key: &str,
    ) -> Result<()> {
        let target = RemoteRef::parse(target_node_key)?;
        let _ = self.modules().template(template_name)?;

        let tar_path = self.archive_path(self.settings().push_cache_dir(), source_node_key)?;
        self.ensure_archive(source_node_key, &tar_path)?;

        let node_lock = self.lock_node(
            source_node_key,
            LockKind::Read,
            AccessLevel::Local,
            None,
            DEFAULT_RETRY_INTERVAL,
        )?;
        let tar_lock = match self.lock_node(
            &source_node_key.tar_key(),
            LockKind::Read,
            AccessLevel::Local,
            None,
            DEFAULT_RETRY_INTERVAL,
        ) {
            Ok(lock) => lock,
            Err(err) => {
                node_lock.release();
                return Err(err);
            }
        };

        let streamed = (|| -> Result<()> {
            let file_size = std::fs::metadata(tar_path.as_std_path())
                .map_err(|err| NoodleError::Store(err.to_string()))?
                .len();
            let mut file = File::open(tar_path.as_std_path())
                .map_err(|err| NoodleError::Store(err.to_string()))?;
            let http = reqwest::blocking::Client::new();
            let url = format!("{}/noodle/node/pull_from", target.base_url);

            let mut chunk_index: u64 = 0;
            loop {
                let mut buffer = vec![0_u8; CHUNK_SIZE as usize];
                let read = read_up_to(&mut file, &mut buffer)
                    .map_err(|err| NoodleError::Store(err.to_string()))?;
                buffer.truncate(read);
                let is_last_chunk =
                    chunk_index.saturating_mul(CHUNK_SIZE) + read as u64 >= file_size;

                let request = PullFromRequest {
                    template_name: template_name.to_owned(),
                    target_node_key: target.remote_key.clone(),
                    source_node_key: source_node_key.clone(),
                    chunk_data: BASE64.encode(&buffer),
                    chunk_index,
                    chunk_size: CHUNK_SIZE,
                    is_last_chunk,
                };
                let response = http
                    .post(&url)
                    .json(&request)
                    .send()
                    .map_err(|err| NoodleError::Transport(format!("push chunk: {err}")))?;
                if !response.status().is_success() {
                    return Err(NoodleError::Transport(format!(
                        "target peer rejected chunk {chunk_index}: {}",
                        response.status()
                    )));
                }

                if is_last_chunk {
                    return Ok(());
                }
                chunk_index += 1;
            }
        })();

        node_lock.release();
        tar_lock.release();
        match self.locks().is_node_locked(&source_node_key.tar_key()) {
            Ok(false) => {
                let _ = std::fs::remove_file(tar_path.as_std_path());
            }
            Ok(true) => {}
            Err(err) => warn!(node_key = %source_node_key, %err, "failed to check tar lock refcount"),
        }

        if streamed.is_ok() {
            info!(source = %source_node_key, target = %target_node_key, "pushed snapshot");
        }
        streamed
    }

    /// The target side of a push: append one chunk; on the final chunk
    /// mount the target and unpack the assembled archive.
    pub fn write_push_chunk(&self, request: &PullFromRequest) -> Result<()> {
        let temp_path =
            self.archive_path(self.settings().inbound_dir(), &request.target_node_key)?;
        let data = BASE64
            .decode(request.chunk_data.as_bytes())
            .map_err(|err| NoodleError::Validation(format!("malformed chunk: {err}")))?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(temp_path.as_std_path())
            .map_err(|err| NoodleError::Store(err.to_string()))?;
        file.seek(SeekFrom::Start(
            request.chunk_index.saturating_mul(request.chunk_size),
        ))
        .map_err(|err| NoodleError::Store(err.to_string()))?;
        file.write_all(&data)
            .map_err(|err| NoodleError::Store(err.to_string()))?;
        drop(file);

        if !request.is_last_chunk {
            return Ok(());
        }

        let installed = (|| -> Result<()> {
            let template = self.modules().template(&request.template_name)?;
            self.displace_existing(&request.target_node_key)?;
            self.mount(&request.target_node_key, Some(&request.template_name), None)?;
            let record = self
                .load_record(&request.target_node_key, false)?
                .ok_or_else(|| NoodleError::NodeNotFound(request.target_node_key.clone()))?;
            template
                .hooks()
                .unpack(
                    &request.target_node_key,
                    record.launch_params.as_deref(),
                    &temp_path,
                )
                .map_err(NoodleError::Other)?;
            Ok(())
        })();

        let _ = std::fs::remove_file(temp_path.as_std_path());
        if installed.is_ok() {
            info!(target = %request.target_node_key, source = %request.source_node_key, "installed pushed snapshot");
        }
        installed
    }

    /// Renames an existing target record to `<target>_copy`, replacing any
    /// previous copy.
    fn displace_existing(&self, target: &NodeKey) -> Result<()> {
        if !self.tree().has(target)? {
            return Ok(());
        }
        let copy = NodeKey::new(format!("{target}_copy"));
        if self.tree().has(&copy)? {
            self.tree().delete(&copy)?;
        }
        self.tree().rename(target, &copy)?;
        debug!(%target, %copy, "displaced existing target record");
        Ok(())
    }
}

fn read_up_to(file: &mut File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = file.read(&mut buffer[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
