//! The HTTP boundary of a noodle peer: every operation exposed to remote
//! peers, routed under the `/noodle` prefix.
//!
//! Handlers are thin wrappers over the engine's operations; blocking
//! operations (peer HTTP, lock retries) run on blocking threads, while the
//! activation and relay paths use their cooperative drivers natively.

pub mod error;
pub mod handlers;
pub mod schemas;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Extension, Router};
use noodle_node::Noodle;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers::{lock, node, proxy};

/// Shared state of every handler.
#[derive(Debug)]
pub struct AppState {
    pub noodle: Arc<Noodle>,
}

/// Builds the `/noodle` router.
pub fn create_router(noodle: Arc<Noodle>) -> Router {
    let state = Arc::new(AppState { noodle });

    let node_routes = Router::new()
        .route("/", get(node::get_node_info))
        .route("/link", get(node::link_node))
        .route("/unlink", get(node::unlink_node))
        .route("/mount", post(node::mount_node))
        .route("/unmount", post(node::unmount_node))
        .route("/push", post(node::push_node))
        .route("/pull", post(node::pull_node))
        .route("/packing", post(node::packing_node))
        .route("/pull_from", post(node::pull_chunk_from_peer))
        .route("/push_to", get(node::push_chunk_to_peer));

    let lock_routes = Router::new().route("/", get(lock::get_lock_info));

    let proxy_routes = Router::new().route(
        "/",
        get(proxy::activate_node)
            .post(proxy::relay_node)
            .delete(proxy::deactivate_node),
    );

    Router::new()
        .nest("/noodle/node", node_routes)
        .nest("/noodle/lock", lock_routes)
        .nest("/noodle/proxy", proxy_routes)
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}

/// Serves the peer's HTTP surface on the configured port until a shutdown
/// signal arrives, then runs graceful teardown.
pub async fn start_server(noodle: Arc<Noodle>) -> eyre::Result<()> {
    let port = noodle.settings().server_port;
    let router = create_router(Arc::clone(&noodle));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("noodle listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    noodle.terminate();
    Ok(())
}

/// Waits for ctrl-c or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, shutting down");
}
