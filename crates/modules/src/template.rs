//! Resource-node templates: the CRM constructor plus lifecycle hooks.
//!
//! Hooks default to no-ops, except pack/unpack which default to a tar.gz of
//! the resource space named by the node's launch params. The pack default
//! normalizes timestamp metadata so re-packing an unchanged resource yields
//! a byte-identical archive.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use eyre::{bail, eyre, Result as EyreResult, WrapErr};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use noodle_primitives::NodeKey;
use noodle_rpc::Crm;
use serde_json::Value;
use tracing::info;

/// Lifecycle hooks of a resource-node template.
///
/// `mount` derives the private launch params from the caller's mount
/// params; `privatization` re-derives them for existing records (used by
/// re-privatization after a template change) and defaults to the mount
/// hook.
pub trait NodeHooks: Send + Sync {
    fn mount(
        &self,
        node_key: &NodeKey,
        mount_params: Option<&Value>,
    ) -> EyreResult<Option<Value>> {
        let _ = node_key;
        Ok(mount_params.cloned())
    }

    fn unmount(&self, node_key: &NodeKey) -> EyreResult<()> {
        let _ = node_key;
        Ok(())
    }

    fn privatization(
        &self,
        node_key: &NodeKey,
        mount_params: Option<&Value>,
    ) -> EyreResult<Option<Value>> {
        self.mount(node_key, mount_params)
    }

    fn pack(
        &self,
        node_key: &NodeKey,
        launch_params: Option<&str>,
        tar_path: &Utf8Path,
    ) -> EyreResult<u64> {
        default_pack(node_key, launch_params, tar_path)
    }

    fn unpack(
        &self,
        node_key: &NodeKey,
        launch_params: Option<&str>,
        tar_path: &Utf8Path,
    ) -> EyreResult<()> {
        default_unpack(node_key, launch_params, tar_path)
    }
}

/// The all-defaults hook set.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultHooks;

impl NodeHooks for DefaultHooks {}

pub type CrmConstructor =
    Arc<dyn Fn(Option<&str>) -> EyreResult<Box<dyn Crm>> + Send + Sync>;

/// A registered resource-node template: constructor, declared public CRM
/// method set (diffed against ICRMs by `match`), hooks, and the optional
/// launcher command used to spawn process-level CRM servers.
pub struct NodeTemplate {
    name: String,
    methods: Vec<String>,
    constructor: CrmConstructor,
    hooks: Arc<dyn NodeHooks>,
    launcher: Option<Vec<String>>,
}

impl std::fmt::Debug for NodeTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTemplate")
            .field("name", &self.name)
            .field("methods", &self.methods)
            .field("launcher", &self.launcher)
            .finish()
    }
}

impl NodeTemplate {
    pub fn new(
        name: impl Into<String>,
        methods: impl IntoIterator<Item = impl Into<String>>,
        constructor: CrmConstructor,
    ) -> Self {
        Self {
            name: name.into(),
            methods: methods.into_iter().map(Into::into).collect(),
            constructor,
            hooks: Arc::new(DefaultHooks),
            launcher: None,
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn NodeHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// The command template spawned for process-level access; the handle
    /// appends `--icrm-tag`, `--server-address`, `--node-key` and
    /// `--params`.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Vec<String>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    #[must_use]
    pub fn launcher(&self) -> Option<&[String]> {
        self.launcher.as_deref()
    }

    #[must_use]
    pub fn hooks(&self) -> &dyn NodeHooks {
        &*self.hooks
    }

    /// Instantiates the CRM from a record's launch params.
    pub fn construct(&self, launch_params: Option<&str>) -> EyreResult<Box<dyn Crm>> {
        (self.constructor)(launch_params)
    }
}

fn resource_space(node_key: &NodeKey, launch_params: Option<&str>) -> EyreResult<Utf8PathBuf> {
    let raw = launch_params
        .ok_or_else(|| eyre!("node '{node_key}' has no launch params naming a resource space"))?;
    let value: Value = serde_json::from_str(raw)
        .wrap_err_with(|| format!("launch params of node '{node_key}' are not valid JSON"))?;
    let path = value
        .get("resource_space")
        .and_then(Value::as_str)
        .ok_or_else(|| eyre!("launch params of node '{node_key}' carry no 'resource_space'"))?;
    Ok(Utf8PathBuf::from(path))
}

/// Packs a node's resource space into `tar_path` and returns the archive's
/// byte size. Entries are appended in sorted order with zeroed timestamps
/// and fixed modes.
pub fn default_pack(
    node_key: &NodeKey,
    launch_params: Option<&str>,
    tar_path: &Utf8Path,
) -> EyreResult<u64> {
    let resource = resource_space(node_key, launch_params)?;

    let file = File::create(tar_path)
        .wrap_err_with(|| format!("failed to create archive at {tar_path}"))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    if resource.is_file() {
        let name = resource
            .file_name()
            .ok_or_else(|| eyre!("resource space '{resource}' has no file name"))?;
        append_normalized(&mut builder, resource.as_std_path(), Path::new(name))?;
    } else if resource.is_dir() {
        let base = resource
            .parent()
            .ok_or_else(|| eyre!("resource space '{resource}' has no parent directory"))?;
        for path in collect_files(resource.as_std_path())? {
            let arcname = path
                .strip_prefix(base.as_std_path())
                .wrap_err("resource file escaped its resource space")?
                .to_owned();
            append_normalized(&mut builder, &path, &arcname)?;
        }
    } else {
        bail!("resource space '{resource}' of node '{node_key}' does not exist");
    }

    let encoder = builder.into_inner()?;
    drop(encoder.finish()?);

    let size = std::fs::metadata(tar_path.as_std_path())?.len();
    info!(%node_key, %tar_path, size, "packed resource node");
    Ok(size)
}

/// Unpacks an archive produced by [`default_pack`] into the resource
/// space's parent directory, replacing any stale resource first.
pub fn default_unpack(
    node_key: &NodeKey,
    launch_params: Option<&str>,
    tar_path: &Utf8Path,
) -> EyreResult<()> {
    let resource = resource_space(node_key, launch_params)?;
    let parent = resource
        .parent()
        .ok_or_else(|| eyre!("resource space '{resource}' has no parent directory"))?;
    std::fs::create_dir_all(parent.as_std_path())?;

    if resource.is_dir() {
        std::fs::remove_dir_all(resource.as_std_path())?;
    } else if resource.is_file() {
        std::fs::remove_file(resource.as_std_path())?;
    }

    let file = File::open(tar_path.as_std_path())
        .wrap_err_with(|| format!("failed to open archive at {tar_path}"))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive
        .unpack(parent.as_std_path())
        .wrap_err_with(|| format!("failed to unpack archive into {parent}"))?;

    info!(%node_key, %tar_path, "unpacked resource node");
    Ok(())
}

fn append_normalized(
    builder: &mut tar::Builder<GzEncoder<File>>,
    path: &Path,
    arcname: &Path,
) -> EyreResult<()> {
    let data = std::fs::read(path)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, arcname, data.as_slice())?;
    Ok(())
}

fn collect_files(dir: &Path) -> EyreResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_owned()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_for(path: &Utf8Path) -> String {
        serde_json::json!({ "resource_space": path.as_str() }).to_string()
    }

    #[test]
    fn pack_then_unpack_restores_a_file_resource() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let resource = base.join("names/names.json");
        std::fs::create_dir_all(resource.parent().unwrap()).unwrap();
        std::fs::write(&resource, br#"{"names": ["Alice"]}"#).unwrap();

        let key = NodeKey::new("root.names");
        let params = params_for(&resource);
        let tar_path = base.join("names.tar.gz");

        let size = default_pack(&key, Some(&params), &tar_path).unwrap();
        assert!(size > 0);

        std::fs::write(&resource, b"stale").unwrap();
        default_unpack(&key, Some(&params), &tar_path).unwrap();
        assert_eq!(
            std::fs::read(&resource).unwrap(),
            br#"{"names": ["Alice"]}"#
        );
    }

    #[test]
    fn repacking_an_unchanged_resource_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let resource = base.join("grid/data");
        std::fs::create_dir_all(&resource).unwrap();
        std::fs::write(resource.join("a.bin"), b"aaaa").unwrap();
        std::fs::write(resource.join("b.bin"), b"bbbb").unwrap();

        let key = NodeKey::new("root.grid");
        let params = params_for(&resource);
        let first = base.join("first.tar.gz");
        let second = base.join("second.tar.gz");

        drop(default_pack(&key, Some(&params), &first).unwrap());
        drop(default_pack(&key, Some(&params), &second).unwrap());
        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&second).unwrap()
        );
    }

    #[test]
    fn pack_without_resource_space_fails() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let key = NodeKey::new("root.names");

        assert!(default_pack(&key, None, &base.join("x.tar.gz")).is_err());
        assert!(default_pack(&key, Some("{}"), &base.join("x.tar.gz")).is_err());
    }
}
