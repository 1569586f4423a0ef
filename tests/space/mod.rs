/// Space lifecycle against the real kernel
///
/// These need root with namespace privileges: run them with
/// `cargo test -- --ignored` as root.
use super::{is_root, setup_test_env, test_space_config};
use lxce::cspace::ContainedSpace;
use lxce::mailbox::ControlPacket;
use lxce::network::NoNetwork;
use lxce::protocol::{Command, Reply, CMD_CREATE};
use lxce::space_thread::{MailboxDirectory, SpaceRegistry, ThreadOptions, ThreadState};
use lxce::userns::IdMap;
use serial_test::serial;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn options() -> ThreadOptions {
    ThreadOptions {
        poll_interval: Duration::from_millis(100),
        user_ns: IdMap::new(100000, 65536),
    }
}

#[test]
#[serial]
#[ignore = "requires root"]
fn test_space_create_and_serve() {
    if !is_root() {
        eprintln!("Skipping: not running as root");
        return;
    }

    let rootfs = setup_test_env();
    let space = ContainedSpace::from_config(&test_space_config("it-space", rootfs.path())).unwrap();

    let mut registry = SpaceRegistry::new();
    let id = registry
        .start(space, options(), Arc::new(NoNetwork))
        .unwrap();
    registry
        .wait_until_started(Duration::from_secs(10))
        .unwrap();

    let handle = registry.get(id).unwrap();
    assert_eq!(handle.status.state(), ThreadState::Active);
    assert!(handle.status.pid().is_some());

    let mailbox = registry.mailbox_for("it-space").unwrap();
    mailbox.post(ControlPacket::new(
        7,
        Command::Create {
            name: "app".to_string(),
            tag: "v1".to_string(),
            path: PathBuf::from("/capps/pkgs/app_v1"),
        },
    ));

    let deadline = Instant::now() + Duration::from_secs(10);
    let completion = loop {
        if let Some(completion) = mailbox.take_completions().pop() {
            break completion;
        }
        assert!(Instant::now() < deadline, "no completion from space");
        std::thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(completion.token, 7);
    assert_eq!(completion.command, CMD_CREATE);
    assert!(matches!(completion.reply, Reply::Uuid(_)));

    registry.shutdown();
    assert_eq!(
        registry.get(id).unwrap().status.state(),
        ThreadState::Deleted
    );
}

#[test]
#[serial]
#[ignore = "requires root"]
fn test_space_with_missing_rootfs_fails_to_start() {
    if !is_root() {
        eprintln!("Skipping: not running as root");
        return;
    }

    let dir = setup_test_env();
    let missing = dir.path().join("no-such-rootfs");
    let space = ContainedSpace::from_config(&test_space_config("it-broken", &missing)).unwrap();

    let mut registry = SpaceRegistry::new();
    let id = registry
        .start(space, options(), Arc::new(NoNetwork))
        .unwrap();

    assert!(registry
        .wait_until_started(Duration::from_secs(10))
        .is_err());
    assert_eq!(
        registry.get(id).unwrap().status.state(),
        ThreadState::Deleted
    );
    assert!(registry.mailbox_for("it-broken").is_none());
}
