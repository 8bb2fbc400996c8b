//! Tree orchestration scenarios: mount/connect/unmount against the
//! `names` resource node.

use std::time::Duration;

use noodle_node::server_address;
use noodle_primitives::{
    AccessLevel, AccessMode, ErrorKind, LockKind, NodeKey, NoodleError,
};
use noodle_test_utils::{test_peer, INames, INAMES_TAG, NAMES_TEMPLATE};

const LW: AccessMode = AccessMode::new(AccessLevel::Local, LockKind::Write);
const LR: AccessMode = AccessMode::new(AccessLevel::Local, LockKind::Read);
const RETRY: Duration = Duration::from_millis(100);

#[test]
fn mount_write_then_read() {
    let peer = test_peer();
    let noodle = &peer.noodle;

    noodle.mount(&NodeKey::new("root"), None, None).unwrap();
    noodle
        .mount(&NodeKey::new("root.names"), Some(NAMES_TEMPLATE), None)
        .unwrap();

    let mut conn = noodle
        .connect(INAMES_TAG, "root.names", LW, None, RETRY)
        .unwrap();
    {
        let mut names = INames::new(conn.stub().unwrap());
        names.add_name("Alice").unwrap();
        names.add_name("Bob").unwrap();
    }
    conn.terminate().unwrap();

    let mut conn = noodle
        .connect(INAMES_TAG, "root.names", LR, None, RETRY)
        .unwrap();
    let names = INames::new(conn.stub().unwrap()).get_names().unwrap();
    assert_eq!(names, ["Alice", "Bob"]);
    conn.terminate().unwrap();
}

#[test]
fn mount_is_idempotent() {
    let peer = test_peer();
    let noodle = &peer.noodle;
    let key = NodeKey::new("root");

    noodle.mount(&key, None, None).unwrap();
    noodle.mount(&key, None, None).unwrap();
    assert!(noodle.has(&key).unwrap());
}

#[test]
fn mount_rejects_missing_parent_and_template() {
    let peer = test_peer();
    let noodle = &peer.noodle;

    let err = noodle
        .mount(&NodeKey::new("ghost.names"), Some(NAMES_TEMPLATE), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(!noodle.has(&NodeKey::new("ghost.names")).unwrap());

    noodle.mount(&NodeKey::new("root"), None, None).unwrap();
    let err = noodle
        .mount(&NodeKey::new("root.x"), Some("unknown"), None)
        .unwrap_err();
    assert!(matches!(err, NoodleError::TemplateNotFound(_)));
    assert!(!noodle.has(&NodeKey::new("root.x")).unwrap());
}

#[test]
fn activating_a_resource_set_fails() {
    let peer = test_peer();
    let noodle = &peer.noodle;

    noodle.mount(&NodeKey::new("root"), None, None).unwrap();
    let err = noodle
        .connect(INAMES_TAG, "root", LW, None, RETRY)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(err.to_string().contains("resource set"));
}

#[test]
fn connecting_a_missing_node_is_not_found() {
    let peer = test_peer();
    let err = peer
        .noodle
        .connect(INAMES_TAG, "root.absent", LW, None, RETRY)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn unmount_blocked_by_lock_then_retry_succeeds() {
    let peer = test_peer();
    let noodle = &peer.noodle;
    let key = NodeKey::new("root.names");

    noodle.mount(&NodeKey::new("root"), None, None).unwrap();
    noodle.mount(&key, Some(NAMES_TEMPLATE), None).unwrap();

    let conn = noodle
        .connect(INAMES_TAG, "root.names", LW, None, RETRY)
        .unwrap();

    let err = noodle.unmount(&key).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(err.to_string().contains("is locked"));
    assert!(noodle.has(&key).unwrap());

    conn.terminate().unwrap();

    noodle.unmount(&key).unwrap();
    assert!(!noodle.has(&key).unwrap());
    assert!(!noodle.locks().is_node_locked(&key).unwrap());
}

#[test]
fn cascade_unmount_runs_each_hook_once() {
    let peer = test_peer();
    let noodle = &peer.noodle;

    noodle.mount(&NodeKey::new("a"), None, None).unwrap();
    noodle
        .mount(&NodeKey::new("a.b"), Some(NAMES_TEMPLATE), None)
        .unwrap();
    noodle
        .mount(&NodeKey::new("a.c"), Some(NAMES_TEMPLATE), None)
        .unwrap();

    noodle.unmount(&NodeKey::new("a")).unwrap();

    for key in ["a", "a.b", "a.c"] {
        assert!(!noodle.has(&NodeKey::new(key)).unwrap());
    }

    let mut unmounted = peer.unmounted.lock().clone();
    unmounted.sort();
    assert_eq!(unmounted, ["a.b", "a.c"]);
}

#[test]
fn unmount_of_absent_node_is_idempotent() {
    let peer = test_peer();
    peer.noodle.unmount(&NodeKey::new("nothing.here")).unwrap();
}

#[test]
fn unmount_failure_releases_all_pre_locks() {
    let peer = test_peer();
    let noodle = &peer.noodle;

    noodle.mount(&NodeKey::new("a"), None, None).unwrap();
    noodle
        .mount(&NodeKey::new("a.b"), Some(NAMES_TEMPLATE), None)
        .unwrap();
    noodle
        .mount(&NodeKey::new("a.c"), Some(NAMES_TEMPLATE), None)
        .unwrap();

    // Hold a lock on one leaf so the walk aborts partway through.
    let conn = noodle
        .connect(INAMES_TAG, "a.c", LR, None, RETRY)
        .unwrap();
    let _ = noodle.unmount(&NodeKey::new("a")).unwrap_err();
    conn.terminate().unwrap();

    // Every record survived and no pre-lock leaked.
    for key in ["a", "a.b", "a.c"] {
        let key = NodeKey::new(key);
        assert!(noodle.has(&key).unwrap());
        assert!(!noodle.locks().is_node_locked(&key).unwrap());
    }
}

#[test]
fn proxy_records_unmount_without_hooks() {
    let peer = test_peer();
    let noodle = &peer.noodle;

    noodle.mount(&NodeKey::new("b"), None, None).unwrap();
    noodle
        .proxy(
            &NodeKey::new("b.names"),
            NAMES_TEMPLATE,
            "http://127.0.0.1:9",
            &NodeKey::new("names"),
        )
        .unwrap();

    let record = noodle
        .load_record(&NodeKey::new("b.names"), false)
        .unwrap()
        .unwrap();
    assert!(record.is_proxy());
    assert_eq!(
        record.access_info.as_deref(),
        Some("http://127.0.0.1:9::names")
    );

    noodle.unmount(&NodeKey::new("b")).unwrap();
    assert!(!noodle.has(&NodeKey::new("b.names")).unwrap());
    assert!(peer.unmounted.lock().is_empty());
}

#[test]
fn node_info_pages_sorted_children() {
    let peer = test_peer();
    let noodle = &peer.noodle;

    noodle.mount(&NodeKey::new("root"), None, None).unwrap();
    for name in ["root.delta", "root.Alpha", "root.charlie", "root.bravo"] {
        noodle
            .mount(&NodeKey::new(name), Some(NAMES_TEMPLATE), None)
            .unwrap();
    }

    let info = noodle
        .get_node_info(&NodeKey::new("root"), 0, None)
        .unwrap()
        .unwrap();
    let children: Vec<String> = info
        .children
        .unwrap()
        .into_iter()
        .map(|child| child.node_key.to_string())
        .collect();
    assert_eq!(
        children,
        ["root.Alpha", "root.bravo", "root.charlie", "root.delta"]
    );

    let page = noodle
        .get_node_info(&NodeKey::new("root"), 1, Some(3))
        .unwrap()
        .unwrap();
    let children: Vec<String> = page
        .children
        .unwrap()
        .into_iter()
        .map(|child| child.node_key.to_string())
        .collect();
    assert_eq!(children, ["root.bravo", "root.charlie"]);

    assert!(noodle
        .get_node_info(&NodeKey::new("root.absent"), 0, None)
        .unwrap()
        .is_none());
}

#[test]
fn connection_drop_releases_the_lock() {
    let peer = test_peer();
    let noodle = &peer.noodle;
    let key = NodeKey::new("root.names");

    noodle.mount(&NodeKey::new("root"), None, None).unwrap();
    noodle.mount(&key, Some(NAMES_TEMPLATE), None).unwrap();

    {
        let _conn = noodle
            .connect(INAMES_TAG, "root.names", LW, None, RETRY)
            .unwrap();
        assert!(noodle.locks().is_node_locked(&key).unwrap());
    }
    assert!(!noodle.locks().is_node_locked(&key).unwrap());
}

#[test]
fn writer_blocks_second_writer_with_timeout() {
    let peer = test_peer();
    let noodle = &peer.noodle;
    let key = NodeKey::new("root.names");

    noodle.mount(&NodeKey::new("root"), None, None).unwrap();
    noodle.mount(&key, Some(NAMES_TEMPLATE), None).unwrap();

    let first = noodle
        .connect(INAMES_TAG, "root.names", LW, None, RETRY)
        .unwrap();
    let err = noodle
        .connect(
            INAMES_TAG,
            "root.names",
            LW,
            Some(Duration::from_millis(300)),
            RETRY,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.to_string().contains("root.names"));

    first.terminate().unwrap();
    let second = noodle
        .connect(INAMES_TAG, "root.names", LW, Some(Duration::from_secs(1)), RETRY)
        .unwrap();
    second.terminate().unwrap();
}

#[test]
fn crm_state_persists_across_connections() {
    let peer = test_peer();
    let noodle = &peer.noodle;

    noodle.mount(&NodeKey::new("root"), None, None).unwrap();
    noodle
        .mount(&NodeKey::new("root.names"), Some(NAMES_TEMPLATE), None)
        .unwrap();

    let mut conn = noodle
        .connect(INAMES_TAG, "root.names", LW, None, RETRY)
        .unwrap();
    INames::new(conn.stub().unwrap()).add_name("Alice").unwrap();
    conn.terminate().unwrap();

    let mut conn = noodle
        .connect(INAMES_TAG, "root.names", LW, None, RETRY)
        .unwrap();
    {
        let mut names = INames::new(conn.stub().unwrap());
        assert_eq!(names.get_names().unwrap(), ["Alice"]);
        names.remove_name("Alice").unwrap();
    }
    conn.terminate().unwrap();

    let mut conn = noodle
        .connect(INAMES_TAG, "root.names", LR, None, RETRY)
        .unwrap();
    assert!(INames::new(conn.stub().unwrap())
        .get_names()
        .unwrap()
        .is_empty());
    conn.terminate().unwrap();
}

#[test]
fn local_connection_addresses_use_the_local_scheme() {
    let peer = test_peer();
    let noodle = &peer.noodle;

    noodle.mount(&NodeKey::new("root"), None, None).unwrap();
    noodle
        .mount(&NodeKey::new("root.names"), Some(NAMES_TEMPLATE), None)
        .unwrap();

    let conn = noodle
        .connect(INAMES_TAG, "root.names", LW, None, RETRY)
        .unwrap();
    let lock_id = conn.lock_id().unwrap();
    assert_eq!(
        conn.server_address().unwrap(),
        server_address(&NodeKey::new("root.names"), &lock_id, AccessLevel::Local)
    );
    assert!(conn
        .server_address()
        .unwrap()
        .starts_with("local://root_names_"));
    conn.terminate().unwrap();
}

#[test]
fn re_privatize_rewrites_launch_params() {
    let peer = test_peer();
    let noodle = &peer.noodle;

    noodle.mount(&NodeKey::new("root"), None, None).unwrap();
    noodle
        .mount(&NodeKey::new("root.names"), Some(NAMES_TEMPLATE), None)
        .unwrap();

    let before = noodle
        .load_record(&NodeKey::new("root.names"), false)
        .unwrap()
        .unwrap()
        .launch_params
        .unwrap();
    assert!(before.contains("resource_space"));

    let updated = noodle.re_privatize(NAMES_TEMPLATE).unwrap();
    assert_eq!(updated, 1);

    let after = noodle
        .load_record(&NodeKey::new("root.names"), false)
        .unwrap()
        .unwrap()
        .launch_params
        .unwrap();
    assert!(after.contains("resource_space"));
}
