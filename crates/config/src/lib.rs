//! Configuration for a noodle peer.
//!
//! A peer is configured through a TOML file (`noodle.config.toml`) plus
//! `NOODLE_`-prefixed environment overrides for every recognized setting.

use std::env;
use std::fs::{read_to_string, write};

use camino::{Utf8Path, Utf8PathBuf};
use eyre::{Result as EyreResult, WrapErr};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "noodle.config.toml";

/// The on-disk configuration file.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct ConfigFile {
    pub store: StoreConfig,

    pub temp: TempConfig,

    pub server: ServerConfig,

    #[serde(default)]
    pub locks: LockConfig,

    #[serde(default)]
    pub modules: ModulesConfig,
}

/// Where the durable node and lock tables live.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StoreConfig {
    pub path: Utf8PathBuf,
}

/// The memory-temp root holding RPC sockets and snapshot archive caches.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TempConfig {
    pub path: Utf8PathBuf,
    /// Wipe and recreate the temp root at startup.
    #[serde(default = "default_true")]
    pub pre_remove: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    /// The port peers use to reach this noodle's HTTP surface.
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LockConfig {
    /// Clear stale locks from the durable store at startup.
    #[serde(default = "default_true")]
    pub pre_remove: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { pre_remove: true }
    }
}

/// Pointer to the manifest enumerating the ICRM and template descriptors
/// the module cache is expected to carry.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ModulesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Utf8PathBuf>,
}

const fn default_true() -> bool {
    true
}

impl ConfigFile {
    #[must_use]
    pub fn exists(dir: &Utf8Path) -> bool {
        dir.join(CONFIG_FILE).is_file()
    }

    pub fn load(dir: &Utf8Path) -> EyreResult<Self> {
        let path = dir.join(CONFIG_FILE);
        let content = read_to_string(&path)
            .wrap_err_with(|| format!("failed to read configuration from {path:?}"))?;

        toml::from_str(&content).map_err(Into::into)
    }

    pub fn save(&self, dir: &Utf8Path) -> EyreResult<()> {
        let path = dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self)?;

        write(&path, content)
            .wrap_err_with(|| format!("failed to write configuration to {path:?}"))?;

        Ok(())
    }

    /// Resolves the runtime settings, applying environment overrides on top
    /// of the file values.
    #[must_use]
    pub fn into_settings(self) -> Settings {
        Settings {
            store_path: self.store.path,
            memory_temp_path: self.temp.path,
            server_port: self.server.port,
            pre_remove_locks: self.locks.pre_remove,
            pre_remove_temp: self.temp.pre_remove,
            modules_manifest: self.modules.manifest,
        }
        .with_env_overrides()
    }
}

/// Resolved runtime settings for one peer.
#[derive(Clone, Debug)]
pub struct Settings {
    pub store_path: Utf8PathBuf,
    pub memory_temp_path: Utf8PathBuf,
    pub server_port: u16,
    pub pre_remove_locks: bool,
    pub pre_remove_temp: bool,
    pub modules_manifest: Option<Utf8PathBuf>,
}

impl Settings {
    /// Applies `NOODLE_*` environment overrides to the recognized settings.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = env::var("NOODLE_STORE_PATH") {
            self.store_path = Utf8PathBuf::from(path);
        }
        if let Ok(path) = env::var("NOODLE_MEMORY_TEMP_PATH") {
            self.memory_temp_path = Utf8PathBuf::from(path);
        }
        if let Ok(port) = env::var("NOODLE_SERVER_PORT") {
            match port.parse() {
                Ok(port) => self.server_port = port,
                Err(err) => {
                    tracing::warn!(%port, %err, "ignoring malformed NOODLE_SERVER_PORT override");
                }
            }
        }
        if let Ok(flag) = env::var("NOODLE_PRE_REMOVE_LOCKS") {
            self.pre_remove_locks = flag != "0" && !flag.eq_ignore_ascii_case("false");
        }
        if let Ok(flag) = env::var("NOODLE_PRE_REMOVE_TEMP") {
            self.pre_remove_temp = flag != "0" && !flag.eq_ignore_ascii_case("false");
        }
        if let Ok(path) = env::var("NOODLE_MODULES_MANIFEST") {
            self.modules_manifest = Some(Utf8PathBuf::from(path));
        }
        self
    }

    /// The directory snapshot archives are packed into for pull transfers.
    #[must_use]
    pub fn pull_cache_dir(&self) -> Utf8PathBuf {
        self.memory_temp_path.join("pull_cache")
    }

    /// The directory snapshot archives are packed into for push transfers.
    #[must_use]
    pub fn push_cache_dir(&self) -> Utf8PathBuf {
        self.memory_temp_path.join("push_cache")
    }

    /// The directory inbound transfer chunks are assembled in. Kept apart
    /// from the outbound caches so an incoming transfer can never touch an
    /// archive this peer is serving under the same key.
    #[must_use]
    pub fn inbound_dir(&self) -> Utf8PathBuf {
        self.memory_temp_path.join("inbound")
    }
}

/// The manifest enumerating expected module registrations: ICRM tags and
/// resource-node template names.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ModulesManifest {
    #[serde(default)]
    pub icrms: Vec<String>,
    #[serde(default)]
    pub node_templates: Vec<String>,
}

impl ModulesManifest {
    pub fn load(path: &Utf8Path) -> EyreResult<Self> {
        let content = read_to_string(path)
            .wrap_err_with(|| format!("failed to read modules manifest from {path:?}"))?;

        toml::from_str(&content).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();

        let config = ConfigFile {
            store: StoreConfig {
                path: dir_path.join("noodle.db"),
            },
            temp: TempConfig {
                path: dir_path.join("memory_temp"),
                pre_remove: true,
            },
            server: ServerConfig { port: 8000 },
            locks: LockConfig { pre_remove: false },
            modules: ModulesConfig { manifest: None },
        };

        config.save(dir_path).unwrap();
        assert!(ConfigFile::exists(dir_path));

        let loaded = ConfigFile::load(dir_path).unwrap();
        assert_eq!(loaded.server.port, 8000);
        assert!(!loaded.locks.pre_remove);

        let settings = loaded.into_settings();
        assert_eq!(settings.pull_cache_dir(), dir_path.join("memory_temp/pull_cache"));
        assert_eq!(settings.inbound_dir(), dir_path.join("memory_temp/inbound"));
    }

    #[test]
    fn modules_manifest_parses() {
        let manifest: ModulesManifest = toml::from_str(
            r#"
            icrms = ["test/INames/0.0.1"]
            node_templates = ["names"]
            "#,
        )
        .unwrap();
        assert_eq!(manifest.icrms.len(), 1);
        assert_eq!(manifest.node_templates, ["names"]);
    }
}
