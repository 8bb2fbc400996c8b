//! CRM launcher binary for the `names` template: spawned by process-level
//! activations in tests, serves the node's CRM at a `memory://` address
//! until shutdown.

use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use noodle_config::Settings;
use noodle_node::{run_crm_server, CrmLauncherArgs};
use noodle_test_utils::names_module_cache;
use parking_lot::Mutex;

#[derive(Debug, Parser)]
struct Cli {
    #[arg(long)]
    store_path: Utf8PathBuf,

    #[arg(long)]
    memory_root: Utf8PathBuf,

    #[command(flatten)]
    crm: CrmLauncherArgs,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let resource_base = cli
        .store_path
        .parent()
        .expect("store path has a parent")
        .join("resource");

    let settings = Settings {
        store_path: cli.store_path.clone(),
        memory_temp_path: cli.memory_root.clone(),
        server_port: 0,
        pre_remove_locks: false,
        pre_remove_temp: false,
        modules_manifest: None,
    };
    let modules = names_module_cache(&resource_base, Arc::new(Mutex::new(Vec::new())));

    run_crm_server(&settings, &modules, &cli.crm)
        .await
        .map_err(|err| eyre::eyre!(err))
}
