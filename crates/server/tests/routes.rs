//! Route-level behavior of the HTTP boundary, including a full two-peer
//! snapshot transfer in each direction.

use std::sync::Arc;
use std::time::Duration;

use noodle_node::Noodle;
use noodle_primitives::{AccessLevel, AccessMode, LockKind, NodeKey};
use noodle_server::create_router;
use noodle_test_utils::{test_peer, INames, INAMES_TAG, NAMES_TEMPLATE};
use serde_json::json;

const RETRY: Duration = Duration::from_millis(100);
const LW: AccessMode = AccessMode::new(AccessLevel::Local, LockKind::Write);
const LR: AccessMode = AccessMode::new(AccessLevel::Local, LockKind::Read);

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

async fn seed_names(noodle: Arc<Noodle>, key: &'static str, names: &'static [&'static str]) {
    tokio::task::spawn_blocking(move || {
        noodle
            .mount(&NodeKey::new(key), Some(NAMES_TEMPLATE), None)
            .unwrap();
        let mut conn = noodle.connect(INAMES_TAG, key, LW, None, RETRY).unwrap();
        let mut facade = INames::new(conn.stub().unwrap());
        for name in names {
            facade.add_name(name).unwrap();
        }
        conn.terminate().unwrap();
    })
    .await
    .unwrap();
}

async fn read_names(noodle: Arc<Noodle>, key: &'static str) -> Vec<String> {
    tokio::task::spawn_blocking(move || {
        let mut conn = noodle.connect(INAMES_TAG, key, LR, None, RETRY).unwrap();
        let names = INames::new(conn.stub().unwrap()).get_names().unwrap();
        conn.terminate().unwrap();
        names
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn mount_info_unmount_over_http() {
    let peer = test_peer();
    let url = spawn_server(Arc::clone(&peer.noodle)).await;
    let http = reqwest::Client::new();

    let mount: serde_json::Value = http
        .post(format!("{url}/noodle/node/mount"))
        .json(&json!({ "node_key": "root" }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(mount["success"], true);

    let mount: serde_json::Value = http
        .post(format!("{url}/noodle/node/mount"))
        .json(&json!({ "node_key": "root.names", "template_name": NAMES_TEMPLATE }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(mount["node_key"], "root.names");

    let info: serde_json::Value = http
        .get(format!("{url}/noodle/node/?node_key=root"))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["node_key"], "root");
    assert_eq!(info["children"][0]["node_key"], "root.names");
    assert_eq!(info["children"][0]["template_name"], NAMES_TEMPLATE);

    let missing = http
        .get(format!("{url}/noodle/node/?node_key=absent"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let unmounted = http
        .post(format!("{url}/noodle/node/unmount?node_key=root"))
        .send()
        .await
        .unwrap();
    assert!(unmounted.status().is_success());

    let gone = http
        .get(format!("{url}/noodle/node/?node_key=root"))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn mount_with_malformed_params_is_400() {
    let peer = test_peer();
    let url = spawn_server(Arc::clone(&peer.noodle)).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{url}/noodle/node/mount"))
        .json(&json!({
            "node_key": "root",
            "template_name": NAMES_TEMPLATE,
            "mount_params_string": "{not json",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_lock_is_404_and_bad_mode_is_400() {
    let peer = test_peer();
    let url = spawn_server(Arc::clone(&peer.noodle)).await;
    let http = reqwest::Client::new();

    let missing = http
        .get(format!("{url}/noodle/lock/?lock_id=absent"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let bad_mode = http
        .get(format!(
            "{url}/noodle/node/link?icrm_tag={INAMES_TAG}&node_key=root&access_mode=x"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_mode.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn lock_info_round_trips_over_http() {
    let peer = test_peer();
    let url = spawn_server(Arc::clone(&peer.noodle)).await;
    let http = reqwest::Client::new();

    let noodle = Arc::clone(&peer.noodle);
    let lock = tokio::task::spawn_blocking(move || {
        noodle
            .locks()
            .lock_node(
                &NodeKey::new("root.names"),
                LockKind::Read,
                AccessLevel::Process,
                None,
                RETRY,
            )
            .unwrap()
    })
    .await
    .unwrap();

    let info: serde_json::Value = http
        .get(format!("{url}/noodle/lock/?lock_id={}", lock.id()))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["node_key"], "root.names");
    assert_eq!(info["lock_type"], "r");
    assert_eq!(info["access_level"], "p");

    lock.release();
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_pull_between_peers() {
    let peer_a = test_peer();
    let url_a = spawn_server(Arc::clone(&peer_a.noodle)).await;
    seed_names(Arc::clone(&peer_a.noodle), "names", &["X", "Y"]).await;

    let peer_b = test_peer();
    let url_b = spawn_server(Arc::clone(&peer_b.noodle)).await;
    let http = reqwest::Client::new();

    // B pulls A's node through its own HTTP surface.
    let pull: serde_json::Value = http
        .post(format!("{url_b}/noodle/node/pull"))
        .json(&json!({
            "template_name": NAMES_TEMPLATE,
            "target_node_key": "names",
            "source_node_key": format!("{url_a}::names"),
        }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(pull["success"], true);
    assert_eq!(pull["target_node_key"], "names");

    assert_eq!(read_names(Arc::clone(&peer_b.noodle), "names").await, ["X", "Y"]);

    // The source side released its transfer locks and dropped the cached
    // archive once the last chunk went out.
    assert!(!peer_a
        .noodle
        .locks()
        .is_node_locked(&NodeKey::new("names"))
        .unwrap());
    assert!(!peer_a
        .noodle
        .locks()
        .is_node_locked(&NodeKey::new("names").tar_key())
        .unwrap());
    assert!(!peer_a
        .noodle
        .settings()
        .pull_cache_dir()
        .join("names.tar.gz")
        .exists());

    // The destination assembled the chunks in its inbound buffer, not in
    // the cache it serves outbound archives from, and cleaned it up.
    assert!(!peer_b
        .noodle
        .settings()
        .inbound_dir()
        .join("names.tar.gz")
        .exists());
    assert!(!peer_b
        .noodle
        .settings()
        .pull_cache_dir()
        .join("names.tar.gz")
        .exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_push_between_peers() {
    let peer_a = test_peer();
    let _url_a = spawn_server(Arc::clone(&peer_a.noodle)).await;
    seed_names(Arc::clone(&peer_a.noodle), "names", &["Alice"]).await;

    let peer_b = test_peer();
    let url_b = spawn_server(Arc::clone(&peer_b.noodle)).await;

    let noodle_a = Arc::clone(&peer_a.noodle);
    let target = format!("{url_b}::pushed");
    tokio::task::spawn_blocking(move || {
        noodle_a
            .push(NAMES_TEMPLATE, &NodeKey::new("names"), &target)
            .unwrap();
    })
    .await
    .unwrap();

    assert!(peer_b.noodle.has(&NodeKey::new("pushed")).unwrap());
    assert_eq!(read_names(Arc::clone(&peer_b.noodle), "pushed").await, ["Alice"]);

    // Source-side transfer locks are gone and the push cache is empty.
    assert!(!peer_a
        .noodle
        .locks()
        .is_node_locked(&NodeKey::new("names"))
        .unwrap());
    assert!(!peer_a
        .noodle
        .settings()
        .push_cache_dir()
        .join("names.tar.gz")
        .exists());
    assert!(!peer_b
        .noodle
        .settings()
        .inbound_dir()
        .join("pushed.tar.gz")
        .exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn pull_displaces_an_existing_target() {
    let peer_a = test_peer();
    let url_a = spawn_server(Arc::clone(&peer_a.noodle)).await;
    seed_names(Arc::clone(&peer_a.noodle), "names", &["fresh"]).await;

    let peer_b = test_peer();
    let url_b = spawn_server(Arc::clone(&peer_b.noodle)).await;
    seed_names(Arc::clone(&peer_b.noodle), "names", &["stale"]).await;

    let http = reqwest::Client::new();
    let pull = http
        .post(format!("{url_b}/noodle/node/pull"))
        .json(&json!({
            "template_name": NAMES_TEMPLATE,
            "target_node_key": "names",
            "source_node_key": format!("{url_a}::names"),
        }))
        .send()
        .await
        .unwrap();
    assert!(pull.status().is_success());

    assert!(peer_b.noodle.has(&NodeKey::new("names_copy")).unwrap());
    assert_eq!(read_names(Arc::clone(&peer_b.noodle), "names").await, ["fresh"]);
}
