//! Shared fixtures for integration tests: the `names` resource node (a
//! JSON-file-backed list of names), its ICRM façade, and scratch peers.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use eyre::{eyre, Result as EyreResult, WrapErr};
use noodle_config::Settings;
use noodle_modules::{IcrmModule, ModuleCache, NodeHooks, NodeTemplate};
use noodle_node::Noodle;
use noodle_primitives::{NodeKey, NoodleError, Result};
use noodle_rpc::{Crm, IcrmStub};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;

pub const INAMES_TAG: &str = "test/INames/0.0.1";
pub const NAMES_TEMPLATE: &str = "names";
pub const NAMES_METHODS: &[&str] = &["get_names", "add_name", "remove_name"];

/// The `names` CRM: a list of names persisted to a JSON file on
/// terminate.
#[derive(Debug)]
pub struct Names {
    path: Utf8PathBuf,
    names: Vec<String>,
}

impl Names {
    pub fn load(launch_params: Option<&str>) -> EyreResult<Self> {
        let raw = launch_params.ok_or_else(|| eyre!("names CRM needs launch params"))?;
        let params: Value = serde_json::from_str(raw)?;
        let path = params
            .get("resource_space")
            .and_then(Value::as_str)
            .ok_or_else(|| eyre!("names launch params carry no 'resource_space'"))?;
        let path = Utf8PathBuf::from(path);

        let names = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let value: Value = serde_json::from_str(&raw)?;
            value
                .get("names")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        Ok(Self { path, names })
    }
}

impl Crm for Names {
    fn route(&mut self, method: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let reply = match method {
            "get_names" => serde_json::to_vec(&self.names),
            "add_name" => {
                let name: String = serde_json::from_slice(payload)
                    .map_err(|err| NoodleError::Validation(err.to_string()))?;
                if !self.names.contains(&name) {
                    self.names.push(name);
                }
                serde_json::to_vec(&Value::Null)
            }
            "remove_name" => {
                let name: String = serde_json::from_slice(payload)
                    .map_err(|err| NoodleError::Validation(err.to_string()))?;
                self.names.retain(|existing| existing != &name);
                serde_json::to_vec(&Value::Null)
            }
            other => {
                return Err(NoodleError::InvalidState(format!(
                    "names CRM has no method '{other}'"
                )))
            }
        };
        reply.map_err(|err| NoodleError::Other(err.into()))
    }

    fn terminate(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| NoodleError::Store(err.to_string()))?;
        }
        std::fs::write(
            &self.path,
            serde_json::to_vec_pretty(&json!({ "names": self.names }))
                .map_err(|err| NoodleError::Store(err.to_string()))?,
        )
        .map_err(|err| NoodleError::Store(err.to_string()))
    }
}

/// Hooks of the `names` template; unmount invocations are recorded for
/// assertions.
#[derive(Debug)]
pub struct NamesHooks {
    base: Utf8PathBuf,
    unmounted: Arc<Mutex<Vec<String>>>,
}

impl NamesHooks {
    fn resource_space(&self, node_key: &NodeKey) -> Utf8PathBuf {
        self.base
            .join(node_key.last_segment())
            .join("names.json")
    }
}

impl NodeHooks for NamesHooks {
    fn mount(
        &self,
        node_key: &NodeKey,
        mount_params: Option<&Value>,
    ) -> EyreResult<Option<Value>> {
        let resource = self.resource_space(node_key);
        if !resource.exists() {
            std::fs::create_dir_all(resource.parent().expect("resource has a parent"))?;
            std::fs::write(&resource, br#"{"names": []}"#)?;
        }

        let mut params = json!({ "resource_space": resource.as_str() });
        if let Some(Value::Object(extra)) = mount_params {
            for (key, value) in extra {
                params[key.as_str()] = value.clone();
            }
        }
        Ok(Some(params))
    }

    fn unmount(&self, node_key: &NodeKey) -> EyreResult<()> {
        self.unmounted.lock().push(node_key.to_string());
        let resource = self.resource_space(node_key);
        if resource.exists() {
            std::fs::remove_file(&resource)
                .wrap_err_with(|| format!("failed to remove {resource}"))?;
        }
        let parent = resource.parent().expect("resource has a parent");
        if parent.exists() && parent.read_dir_utf8()?.next().is_none() {
            std::fs::remove_dir(parent)?;
        }
        Ok(())
    }
}

/// Builds a module cache carrying the `names` ICRM and template.
pub fn names_module_cache(
    base: &Utf8Path,
    unmounted: Arc<Mutex<Vec<String>>>,
) -> ModuleCache {
    let base = base.to_owned();
    ModuleCache::builder()
        .icrm(INAMES_TAG, || {
            Ok(IcrmModule::new(INAMES_TAG.parse()?, NAMES_METHODS.iter().copied()))
        })
        .expect("tag registers")
        .template(NAMES_TEMPLATE, move || {
            let hooks = NamesHooks {
                base: base.clone(),
                unmounted: Arc::clone(&unmounted),
            };
            Ok(NodeTemplate::new(
                NAMES_TEMPLATE,
                NAMES_METHODS.iter().copied(),
                Arc::new(|params| {
                    let crm: Box<dyn Crm> = Box::new(Names::load(params)?);
                    Ok(crm)
                }),
            )
            .with_hooks(Arc::new(hooks)))
        })
        .expect("template registers")
        .build()
}

/// The typed `INames` façade over a generic stub.
#[derive(Debug)]
pub struct INames<'a> {
    stub: &'a mut IcrmStub,
}

impl<'a> INames<'a> {
    pub fn new(stub: &'a mut IcrmStub) -> Self {
        Self { stub }
    }

    pub fn get_names(&mut self) -> Result<Vec<String>> {
        let bytes = self.stub.call("get_names", b"null".to_vec(), None)?;
        serde_json::from_slice(&bytes).map_err(|err| NoodleError::Transport(err.to_string()))
    }

    pub fn add_name(&mut self, name: &str) -> Result<()> {
        let payload =
            serde_json::to_vec(name).map_err(|err| NoodleError::Validation(err.to_string()))?;
        drop(self.stub.call("add_name", payload, None)?);
        Ok(())
    }

    pub fn remove_name(&mut self, name: &str) -> Result<()> {
        let payload =
            serde_json::to_vec(name).map_err(|err| NoodleError::Validation(err.to_string()))?;
        drop(self.stub.call("remove_name", payload, None)?);
        Ok(())
    }
}

/// Builds a module cache whose `names` template spawns the given launcher
/// command for process-level access.
pub fn names_module_cache_with_launcher(
    base: &Utf8Path,
    unmounted: Arc<Mutex<Vec<String>>>,
    launcher: Vec<String>,
) -> ModuleCache {
    let base = base.to_owned();
    ModuleCache::builder()
        .icrm(INAMES_TAG, || {
            Ok(IcrmModule::new(INAMES_TAG.parse()?, NAMES_METHODS.iter().copied()))
        })
        .expect("tag registers")
        .template(NAMES_TEMPLATE, move || {
            let hooks = NamesHooks {
                base: base.clone(),
                unmounted: Arc::clone(&unmounted),
            };
            Ok(NodeTemplate::new(
                NAMES_TEMPLATE,
                NAMES_METHODS.iter().copied(),
                Arc::new(|params| {
                    let crm: Box<dyn Crm> = Box::new(Names::load(params)?);
                    Ok(crm)
                }),
            )
            .with_hooks(Arc::new(hooks))
            .with_launcher(launcher.clone()))
        })
        .expect("template registers")
        .build()
}

/// A scratch peer: private store, temp root and resource base under one
/// temp directory.
#[derive(Debug)]
pub struct TestPeer {
    pub dir: TempDir,
    pub noodle: Arc<Noodle>,
    pub unmounted: Arc<Mutex<Vec<String>>>,
}

impl TestPeer {
    pub fn resource_base(&self) -> Utf8PathBuf {
        Utf8Path::from_path(self.dir.path())
            .expect("temp dir is utf-8")
            .join("resource")
    }
}

fn scratch_settings(base: &Utf8Path) -> Settings {
    Settings {
        store_path: base.join("noodle.db"),
        memory_temp_path: base.join("memory_temp"),
        server_port: 0,
        pre_remove_locks: true,
        pre_remove_temp: true,
        modules_manifest: None,
    }
}

pub fn test_peer() -> TestPeer {
    let dir = tempfile::tempdir().expect("temp dir");
    let base = Utf8Path::from_path(dir.path()).expect("temp dir is utf-8");

    let settings = scratch_settings(base);
    let unmounted = Arc::new(Mutex::new(Vec::new()));
    let modules = names_module_cache(&base.join("resource"), Arc::clone(&unmounted));
    let noodle = Noodle::open(settings, modules).expect("noodle opens");

    TestPeer {
        dir,
        noodle: Arc::new(noodle),
        unmounted,
    }
}

/// A scratch peer whose `names` template can spawn process-level CRM
/// servers through the given launcher binary. The binary receives this
/// peer's store path and memory root ahead of the standard flags.
pub fn test_peer_with_launcher(launcher_bin: &str) -> TestPeer {
    let dir = tempfile::tempdir().expect("temp dir");
    let base = Utf8Path::from_path(dir.path()).expect("temp dir is utf-8");

    let settings = scratch_settings(base);
    let launcher = vec![
        launcher_bin.to_owned(),
        "--store-path".to_owned(),
        settings.store_path.to_string(),
        "--memory-root".to_owned(),
        settings.memory_temp_path.to_string(),
    ];

    let unmounted = Arc::new(Mutex::new(Vec::new()));
    let modules = names_module_cache_with_launcher(
        &base.join("resource"),
        Arc::clone(&unmounted),
        launcher,
    );
    let noodle = Noodle::open(settings, modules).expect("noodle opens");

    TestPeer {
        dir,
        noodle: Arc::new(noodle),
        unmounted,
    }
}
