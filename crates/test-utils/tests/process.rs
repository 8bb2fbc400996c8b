//! Process-level activation: CRM servers spawned as child processes and
//! reached over `memory://` RPC.

use std::time::Duration;

use noodle_node::server_address;
use noodle_primitives::{AccessLevel, AccessMode, LockKind, NodeKey};
use noodle_test_utils::{test_peer_with_launcher, INames, INAMES_TAG, NAMES_TEMPLATE};

const LAUNCHER: &str = env!("CARGO_BIN_EXE_names_crm_launcher");
const RETRY: Duration = Duration::from_millis(100);
const PW: AccessMode = AccessMode::new(AccessLevel::Process, LockKind::Write);
const LR: AccessMode = AccessMode::new(AccessLevel::Local, LockKind::Read);

#[test]
fn process_level_activation_over_memory_rpc() {
    let peer = test_peer_with_launcher(LAUNCHER);
    let noodle = &peer.noodle;
    let key = NodeKey::new("root.names");

    noodle.mount(&NodeKey::new("root"), None, None).unwrap();
    noodle.mount(&key, Some(NAMES_TEMPLATE), None).unwrap();

    let mut conn = noodle
        .connect(INAMES_TAG, "root.names", PW, None, RETRY)
        .unwrap();

    let lock_id = conn.lock_id().unwrap();
    assert_eq!(
        conn.server_address().unwrap(),
        format!("memory://root_names_{lock_id}")
    );

    {
        let mut names = INames::new(conn.stub().unwrap());
        names.add_name("Alice").unwrap();
        names.add_name("Bob").unwrap();
        assert_eq!(names.get_names().unwrap(), ["Alice", "Bob"]);
    }
    conn.terminate().unwrap();

    assert!(!noodle.locks().is_node_locked(&key).unwrap());

    // The CRM's terminate hook persisted the state; a fresh in-process
    // reader observes it.
    let mut conn = noodle
        .connect(INAMES_TAG, "root.names", LR, None, RETRY)
        .unwrap();
    assert_eq!(
        INames::new(conn.stub().unwrap()).get_names().unwrap(),
        ["Alice", "Bob"]
    );
    conn.terminate().unwrap();
}

#[test]
fn link_access_unlink_via_process_server() {
    let peer = test_peer_with_launcher(LAUNCHER);
    let noodle = &peer.noodle;
    let key = NodeKey::new("root.names");

    noodle.mount(&NodeKey::new("root"), None, None).unwrap();
    noodle.mount(&key, Some(NAMES_TEMPLATE), None).unwrap();

    let lock_id = noodle
        .link(INAMES_TAG, "root.names", LockKind::Write, None, RETRY)
        .unwrap();

    let info = noodle.locks().get_info(&lock_id).unwrap().unwrap();
    assert_eq!(info.level, AccessLevel::Process);
    assert_eq!(info.kind, LockKind::Write);
    assert_eq!(info.node_key, key);

    // Two stubs can attach to the same linked server in turn.
    let mut stub = noodle.access(INAMES_TAG, "root.names", &lock_id).unwrap();
    INames::new(&mut stub).add_name("Noodle1").unwrap();
    stub.close();

    let mut stub = noodle.access(INAMES_TAG, "root.names", &lock_id).unwrap();
    assert_eq!(INames::new(&mut stub).get_names().unwrap(), ["Noodle1"]);
    stub.close();

    noodle.unlink("root.names", &lock_id).unwrap();
    assert!(!noodle.locks().has_lock(&lock_id).unwrap());

    let address = server_address(&key, &lock_id, AccessLevel::Process);
    assert!(!noodle.rpc().ping(&address, Duration::from_millis(200)));
}

#[test]
fn access_with_unknown_lock_fails() {
    let peer = test_peer_with_launcher(LAUNCHER);
    let noodle = &peer.noodle;

    noodle.mount(&NodeKey::new("root"), None, None).unwrap();
    noodle
        .mount(&NodeKey::new("root.names"), Some(NAMES_TEMPLATE), None)
        .unwrap();

    assert!(noodle
        .access(INAMES_TAG, "root.names", "no_such_lock")
        .is_err());
    assert!(noodle.unlink("root.names", "no_such_lock").is_err());
}

#[test]
fn shutdown_sweep_drains_process_servers() {
    let peer = test_peer_with_launcher(LAUNCHER);
    let noodle = &peer.noodle;
    let key = NodeKey::new("root.names");

    noodle.mount(&NodeKey::new("root"), None, None).unwrap();
    noodle.mount(&key, Some(NAMES_TEMPLATE), None).unwrap();

    let lock_id = noodle
        .link(INAMES_TAG, "root.names", LockKind::Write, None, RETRY)
        .unwrap();
    let address = server_address(&key, &lock_id, AccessLevel::Process);
    assert!(noodle.rpc().ping(&address, Duration::from_secs(1)));

    noodle.release_all_process_servers();
    assert!(!noodle.rpc().ping(&address, Duration::from_millis(200)));

    noodle.terminate();
    assert!(!noodle.locks().has_lock(&lock_id).unwrap());
}
