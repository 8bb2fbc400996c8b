//! The module cache: the process-wide registry of ICRM modules and
//! resource-node templates.
//!
//! Entries are registered at boot and resolved lazily: the first access
//! runs the entry's resolver, validates the result, and memoizes it. The
//! cache is immutable once built; resolution is serialized per entry.

pub mod icrm;
pub mod template;

use std::collections::HashMap;

use eyre::{bail, Result as EyreResult};
use noodle_config::ModulesManifest;
use noodle_primitives::{IcrmTag, NoodleError, Result};
use once_cell::sync::OnceCell;
use tracing::debug;

pub use icrm::IcrmModule;
pub use template::{
    default_pack, default_unpack, CrmConstructor, DefaultHooks, NodeHooks, NodeTemplate,
};

type Resolver<T> = Box<dyn Fn() -> EyreResult<T> + Send + Sync>;

struct IcrmEntry {
    tag: IcrmTag,
    cell: OnceCell<IcrmModule>,
    resolve: Resolver<IcrmModule>,
}

struct TemplateEntry {
    name: String,
    cell: OnceCell<NodeTemplate>,
    resolve: Resolver<NodeTemplate>,
}

/// Registry of ICRMs (by tag) and node templates (by name).
pub struct ModuleCache {
    icrms: HashMap<String, IcrmEntry>,
    templates: HashMap<String, TemplateEntry>,
}

impl std::fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache")
            .field("icrms", &self.icrms.keys().collect::<Vec<_>>())
            .field("templates", &self.templates.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModuleCache {
    #[must_use]
    pub fn builder() -> ModuleCacheBuilder {
        ModuleCacheBuilder::default()
    }

    /// Resolves an ICRM module, memoizing on first access and validating
    /// that the resolved tag matches the registered one.
    pub fn icrm(&self, tag: &str) -> Result<&IcrmModule> {
        let entry = self
            .icrms
            .get(tag)
            .ok_or_else(|| NoodleError::IcrmNotFound(tag.to_owned()))?;
        let module = entry
            .cell
            .get_or_try_init(|| {
                debug!(%tag, "resolving ICRM module");
                (entry.resolve)()
            })
            .map_err(NoodleError::Other)?;
        if module.tag != entry.tag {
            return Err(NoodleError::InvalidState(format!(
                "ICRM module tag '{}' does not match registered tag '{}'",
                module.tag, entry.tag
            )));
        }
        Ok(module)
    }

    /// Resolves a node template, memoizing on first access.
    pub fn template(&self, name: &str) -> Result<&NodeTemplate> {
        let entry = self
            .templates
            .get(name)
            .ok_or_else(|| NoodleError::TemplateNotFound(name.to_owned()))?;
        let template = entry
            .cell
            .get_or_try_init(|| {
                debug!(%name, "resolving resource node template");
                (entry.resolve)()
            })
            .map_err(NoodleError::Other)?;
        if template.name() != entry.name {
            return Err(NoodleError::InvalidState(format!(
                "template resolved as '{}' but was registered as '{}'",
                template.name(),
                entry.name
            )));
        }
        Ok(template)
    }

    #[must_use]
    pub fn has_template(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Validates that a template's CRM covers every method the ICRM
    /// declares. Run before spinning a server to catch shape mismatches
    /// early.
    pub fn match_modules(&self, icrm_tag: &str, template_name: &str) -> Result<()> {
        let icrm = self.icrm(icrm_tag)?;
        let template = self.template(template_name)?;

        let missing: Vec<&str> = icrm
            .methods
            .iter()
            .filter(|method| !template.methods().contains(method))
            .map(String::as_str)
            .collect();

        if !missing.is_empty() {
            return Err(NoodleError::InvalidState(format!(
                "CRM '{template_name}' is missing methods required by ICRM '{icrm_tag}': {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Cross-checks the configured manifest against the registrations.
    pub fn verify_manifest(&self, manifest: &ModulesManifest) -> EyreResult<()> {
        for tag in &manifest.icrms {
            if !self.icrms.contains_key(tag) {
                bail!("manifest names ICRM tag '{tag}' but no module is registered for it");
            }
        }
        for name in &manifest.node_templates {
            if !self.templates.contains_key(name) {
                bail!("manifest names template '{name}' but no module is registered for it");
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct ModuleCacheBuilder {
    icrms: HashMap<String, IcrmEntry>,
    templates: HashMap<String, TemplateEntry>,
}

impl std::fmt::Debug for ModuleCacheBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCacheBuilder")
            .field("icrms", &self.icrms.keys().collect::<Vec<_>>())
            .field("templates", &self.templates.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModuleCacheBuilder {
    /// Registers an ICRM resolver under its tag.
    pub fn icrm(
        mut self,
        tag: &str,
        resolve: impl Fn() -> EyreResult<IcrmModule> + Send + Sync + 'static,
    ) -> EyreResult<Self> {
        let parsed: IcrmTag = tag.parse()?;
        if self.icrms.contains_key(tag) {
            bail!("duplicate ICRM tag '{tag}' registered in module cache");
        }
        drop(self.icrms.insert(
            tag.to_owned(),
            IcrmEntry {
                tag: parsed,
                cell: OnceCell::new(),
                resolve: Box::new(resolve),
            },
        ));
        Ok(self)
    }

    /// Registers a template resolver under its name.
    pub fn template(
        mut self,
        name: &str,
        resolve: impl Fn() -> EyreResult<NodeTemplate> + Send + Sync + 'static,
    ) -> EyreResult<Self> {
        if self.templates.contains_key(name) {
            bail!("duplicate resource node template '{name}' registered in module cache");
        }
        drop(self.templates.insert(
            name.to_owned(),
            TemplateEntry {
                name: name.to_owned(),
                cell: OnceCell::new(),
                resolve: Box::new(resolve),
            },
        ));
        Ok(self)
    }

    #[must_use]
    pub fn build(self) -> ModuleCache {
        ModuleCache {
            icrms: self.icrms,
            templates: self.templates,
        }
    }
}
