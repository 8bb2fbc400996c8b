//! Entry point for CRM launcher binaries.
//!
//! A process-level activation spawns the template's launcher command with
//! four standard flags appended. The launcher binary (embedder code)
//! parses them with [`CrmLauncherArgs`], registers the same module cache
//! as its parent deployment, and hands control to [`run_crm_server`].

use clap::Args;
use noodle_config::Settings;
use noodle_modules::ModuleCache;
use noodle_primitives::{NodeKey, NoodleError, Result};
use noodle_store::TreeStore;
use tracing::info;

/// The flags a spawned CRM server receives from its parent. Launcher
/// binaries flatten this into their own parser.
#[derive(Args, Debug)]
pub struct CrmLauncherArgs {
    /// The ICRM tag the caller will drive the CRM through.
    #[arg(long)]
    pub icrm_tag: String,

    /// The `memory://` address to serve at.
    #[arg(long)]
    pub server_address: String,

    /// The node whose CRM this process hosts.
    #[arg(long)]
    pub node_key: String,

    /// Launch params JSON; empty means "use the record's stored params".
    #[arg(long, default_value = "")]
    pub params: String,
}

/// Hosts the node's CRM at the requested address until a shutdown message
/// arrives.
pub async fn run_crm_server(
    settings: &Settings,
    modules: &ModuleCache,
    args: &CrmLauncherArgs,
) -> Result<()> {
    let node_key = NodeKey::new(&args.node_key);
    let tree = TreeStore::new(&settings.store_path);
    let record = tree
        .load(&node_key, false)?
        .ok_or_else(|| NoodleError::NodeNotFound(node_key.clone()))?;
    let template_name = record.template_name.as_deref().ok_or_else(|| {
        NoodleError::InvalidState(format!(
            "node '{node_key}' is a resource set node and has no CRM to serve"
        ))
    })?;

    let launch_params = if args.params.is_empty() {
        record.launch_params.as_deref()
    } else {
        Some(args.params.as_str())
    };

    let template = modules.template(template_name)?;
    let crm = template.construct(launch_params).map_err(NoodleError::Other)?;

    let server =
        noodle_rpc::serve(&settings.memory_temp_path, &args.server_address, crm).await?;
    info!(%node_key, address = %args.server_address, icrm_tag = %args.icrm_tag, "CRM server serving");
    server.wait().await;
    Ok(())
}
