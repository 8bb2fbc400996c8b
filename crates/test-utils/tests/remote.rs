//! Cross-peer scenarios: remote references, proxy records, and the HTTP
//! link surface.

use std::sync::Arc;
use std::time::Duration;

use noodle_node::Noodle;
use noodle_primitives::{AccessLevel, AccessMode, LockKind, NodeKey};
use noodle_server::create_router;
use noodle_test_utils::{
    test_peer, test_peer_with_launcher, INames, INAMES_TAG, NAMES_TEMPLATE,
};

const LAUNCHER: &str = env!("CARGO_BIN_EXE_names_crm_launcher");
const RETRY: Duration = Duration::from_millis(100);
const LW: AccessMode = AccessMode::new(AccessLevel::Local, LockKind::Write);
const PR: AccessMode = AccessMode::new(AccessLevel::Process, LockKind::Read);

async fn spawn_server(noodle: Arc<Noodle>) -> String {
    let router = create_router(noodle);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("ephemeral port binds");
    let addr = listener.local_addr().expect("listener has an address");
    drop(tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server runs");
    }));
    format!("http://{addr}")
}

async fn seed_names(noodle: Arc<Noodle>, name: &'static str) {
    tokio::task::spawn_blocking(move || {
        noodle
            .mount(&NodeKey::new("names"), Some(NAMES_TEMPLATE), None)
            .unwrap();
        let mut conn = noodle.connect(INAMES_TAG, "names", LW, None, RETRY).unwrap();
        INames::new(conn.stub().unwrap()).add_name(name).unwrap();
        conn.terminate().unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_proxy_round_trip() {
    let peer_a = test_peer_with_launcher(LAUNCHER);
    let url_a = spawn_server(Arc::clone(&peer_a.noodle)).await;
    seed_names(Arc::clone(&peer_a.noodle), "X").await;

    let peer_b = test_peer();
    let noodle_b = Arc::clone(&peer_b.noodle);
    let url = url_a.clone();
    tokio::task::spawn_blocking(move || {
        noodle_b.mount(&NodeKey::new("B"), None, None).unwrap();
        noodle_b
            .proxy(
                &NodeKey::new("B.names"),
                NAMES_TEMPLATE,
                &url,
                &NodeKey::new("names"),
            )
            .unwrap();

        let mut conn = noodle_b
            .connect(
                INAMES_TAG,
                "B.names",
                PR,
                Some(Duration::from_secs(60)),
                RETRY,
            )
            .unwrap();

        // The local tree's invariants cover the proxied node.
        assert!(noodle_b
            .locks()
            .is_node_locked(&NodeKey::new("B.names"))
            .unwrap());

        let names = INames::new(conn.stub().unwrap()).get_names().unwrap();
        assert_eq!(names, ["X"]);

        conn.terminate().unwrap();
        assert!(!noodle_b
            .locks()
            .is_node_locked(&NodeKey::new("B.names"))
            .unwrap());
    })
    .await
    .unwrap();

    // Deactivation on B propagated: A's lock is gone.
    assert!(!peer_a
        .noodle
        .locks()
        .is_node_locked(&NodeKey::new("names"))
        .unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_reference_connect_without_local_record() {
    let peer_a = test_peer_with_launcher(LAUNCHER);
    let url_a = spawn_server(Arc::clone(&peer_a.noodle)).await;
    seed_names(Arc::clone(&peer_a.noodle), "Y").await;

    let peer_b = test_peer();
    let noodle_b = Arc::clone(&peer_b.noodle);
    let remote_key = format!("{url_a}::names");
    tokio::task::spawn_blocking(move || {
        let mut conn = noodle_b
            .connect(
                INAMES_TAG,
                &remote_key,
                PR,
                Some(Duration::from_secs(60)),
                RETRY,
            )
            .unwrap();
        assert_eq!(INames::new(conn.stub().unwrap()).get_names().unwrap(), ["Y"]);
        conn.terminate().unwrap();
    })
    .await
    .unwrap();

    assert!(!peer_a
        .noodle
        .locks()
        .is_node_locked(&NodeKey::new("names"))
        .unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn link_surface_over_http() {
    let peer_a = test_peer_with_launcher(LAUNCHER);
    let url_a = spawn_server(Arc::clone(&peer_a.noodle)).await;
    seed_names(Arc::clone(&peer_a.noodle), "Z").await;

    let url = url_a.clone();
    tokio::task::spawn_blocking(move || {
        let http = reqwest::blocking::Client::new();

        let link: serde_json::Value = http
            .get(format!(
                "{url}/noodle/node/link?icrm_tag={}&node_key=names&access_mode=w",
                INAMES_TAG.replace('/', "%2F")
            ))
            .send()
            .unwrap()
            .error_for_status()
            .unwrap()
            .json()
            .unwrap();
        assert_eq!(link["node_key"], "names");
        assert_eq!(link["lock_type"], "w");
        assert_eq!(link["access_level"], "p");
        let lock_id = link["lock_id"].as_str().unwrap().to_owned();

        let info = http
            .get(format!("{url}/noodle/lock/?lock_id={lock_id}"))
            .send()
            .unwrap();
        assert!(info.status().is_success());

        let unlink: serde_json::Value = http
            .get(format!(
                "{url}/noodle/node/unlink?node_key=names&lock_id={lock_id}"
            ))
            .send()
            .unwrap()
            .error_for_status()
            .unwrap()
            .json()
            .unwrap();
        assert_eq!(unlink["success"], true);

        let gone = http
            .get(format!("{url}/noodle/lock/?lock_id={lock_id}"))
            .send()
            .unwrap();
        assert_eq!(gone.status(), reqwest::StatusCode::NOT_FOUND);
    })
    .await
    .unwrap();
}
