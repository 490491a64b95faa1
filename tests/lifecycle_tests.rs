//! Lifecycle tests for the setup/teardown orchestrators
//!
//! These run against the in-memory mounter and disk manager and cover:
//! - Idempotent setup and teardown
//! - Reference counting across consumers of one device
//! - Per-consumer access modes
//! - Failure isolation when attach fails
//! - Teardown by volume name and crash leftovers
//! - Concurrent setup/teardown of one device

use iscsi_volume::fake::{FakeDiskManager, FakeMounter, MountAction};
use iscsi_volume::{
    set_up, tear_down, Collaborators, DeviceIdentity, DeviceLocks, DiskManager, MountOption,
    VolumeError, VolumeSession,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

// ============================================================================
// Test Fixture
// ============================================================================

struct Node {
    dir: TempDir,
    manager: FakeDiskManager,
    mounter: FakeMounter,
    locks: DeviceLocks,
}

impl Node {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = TempDir::new().expect("create temp dir");
        let manager = FakeDiskManager::new(dir.path().join("plugins/iscsi"));
        Node {
            dir,
            manager,
            mounter: FakeMounter::new(),
            locks: DeviceLocks::new(),
        }
    }

    fn env(&self) -> Collaborators<'_> {
        Collaborators {
            manager: &self.manager,
            mounter: &self.mounter,
            locks: &self.locks,
        }
    }

    fn consumer_path(&self, consumer: &str) -> PathBuf {
        self.dir.path().join(consumer).join("vol")
    }

    fn shared_path(&self, device: &DeviceIdentity) -> PathBuf {
        self.manager.canonical_shared_path(device)
    }

    fn set_up(&self, session: &VolumeSession) -> Result<(), VolumeError> {
        set_up(session, &self.consumer_path(session.consumer_id()), self.env())
    }

    fn tear_down(&self, session: &VolumeSession) -> Result<(), VolumeError> {
        tear_down(session, &self.consumer_path(session.consumer_id()), self.env())
    }

    fn mount_actions(&self) -> usize {
        self.mounter
            .log()
            .iter()
            .filter(|a| matches!(a, MountAction::Mount { .. }))
            .count()
    }
}

fn disk1() -> DeviceIdentity {
    DeviceIdentity::new("10.0.0.1:3260", "iqn.2015-01.com.example:disk1", 0).unwrap()
}

fn session(consumer: &str, read_only: bool) -> VolumeSession {
    VolumeSession::for_setup(consumer, "vol", disk1(), read_only, "ext4").unwrap()
}

// ============================================================================
// Idempotency
// ============================================================================

#[test]
fn test_setup_mounts_shared_then_binds() {
    let node = Node::new();
    let a = session("consumerA", false);

    node.set_up(&a).unwrap();

    let shared = node.shared_path(&disk1());
    let consumer = node.consumer_path("consumerA");
    let log = node.mounter.log();
    assert_eq!(log.len(), 3, "shared mount, bind, remount: {:?}", log);
    assert_eq!(
        log[0],
        MountAction::Mount {
            source: FakeDiskManager::node_for(&disk1()),
            target: shared.clone(),
            fs_type: Some("ext4".to_string()),
            options: vec![MountOption::ReadWrite],
        }
    );
    assert_eq!(
        log[1],
        MountAction::Mount {
            source: shared.clone(),
            target: consumer.clone(),
            fs_type: None,
            options: vec![MountOption::Bind],
        }
    );
    assert_eq!(
        log[2],
        MountAction::Mount {
            source: shared.clone(),
            target: consumer.clone(),
            fs_type: None,
            options: vec![MountOption::Remount, MountOption::ReadWrite],
        }
    );
    assert!(consumer.is_dir());
    assert!(shared.is_dir());
}

#[test]
fn test_setup_twice_mounts_once() {
    let node = Node::new();
    let a = session("consumerA", false);

    node.set_up(&a).unwrap();
    let mounts_after_first = node.mount_actions();
    let attaches_after_first = node.manager.attach_calls().len();

    node.set_up(&a).unwrap();

    assert_eq!(node.mount_actions(), mounts_after_first);
    assert_eq!(node.manager.attach_calls().len(), attaches_after_first);
    assert_eq!(node.mounter.mount_count(&node.consumer_path("consumerA")), 1);
}

#[test]
fn test_teardown_of_unmounted_path_is_noop() {
    let node = Node::new();
    let a = session("consumerA", false);

    node.tear_down(&a).unwrap();

    assert!(node.mounter.log().is_empty());
    assert!(node.manager.detach_calls().is_empty());
}

#[test]
fn test_teardown_twice_detaches_once() {
    let node = Node::new();
    let a = session("consumerA", false);

    node.set_up(&a).unwrap();
    node.tear_down(&a).unwrap();
    node.tear_down(&a).unwrap();

    assert_eq!(node.manager.detach_calls().len(), 1);
    assert!(!node.consumer_path("consumerA").exists());
}

// ============================================================================
// Reference Counting
// ============================================================================

#[test]
fn test_shared_device_released_after_last_consumer() {
    let node = Node::new();
    let a = session("consumerA", false);
    let b = session("consumerB", true);
    let shared = node.shared_path(&disk1());

    node.set_up(&a).unwrap();
    node.set_up(&b).unwrap();
    assert_eq!(node.mounter.mount_count(&shared), 1, "one real mount at the shared path");
    assert_eq!(node.manager.attach_calls().len(), 2, "attach is called per setup and is idempotent");

    node.tear_down(&a).unwrap();
    assert_eq!(node.mounter.mount_count(&shared), 1);
    assert_eq!(node.mounter.mount_count(&node.consumer_path("consumerB")), 1);
    assert!(node.manager.is_attached(&disk1()));
    assert!(node.manager.detach_calls().is_empty());

    node.tear_down(&b).unwrap();
    assert_eq!(node.mounter.mount_count(&shared), 0);
    assert!(!node.manager.is_attached(&disk1()));

    let detaches = node.manager.detach_calls();
    assert_eq!(detaches.len(), 1);
    assert_eq!(detaches[0].0, disk1());
    assert_eq!(detaches[0].1, Some(FakeDiskManager::node_for(&disk1())));
    assert!(node.mounter.mounts().is_empty());
}

#[test]
fn test_access_modes_are_per_consumer() {
    for order in [["consumerA", "consumerB"], ["consumerB", "consumerA"]] {
        let node = Node::new();
        for consumer in order {
            node.set_up(&session(consumer, consumer == "consumerB")).unwrap();
        }

        assert_eq!(node.mounter.is_read_only(&node.consumer_path("consumerA")), Some(false));
        assert_eq!(node.mounter.is_read_only(&node.consumer_path("consumerB")), Some(true));
        assert_eq!(node.mounter.is_read_only(&node.shared_path(&disk1())), Some(false));
    }
}

#[test]
fn test_different_devices_are_independent() {
    let node = Node::new();
    let disk2 = DeviceIdentity::new("10.0.0.1:3260", "iqn.2015-01.com.example:disk1", 1).unwrap();
    let a = session("consumerA", false);
    let c = VolumeSession::for_setup("consumerC", "vol", disk2.clone(), false, "xfs").unwrap();

    node.set_up(&a).unwrap();
    node.set_up(&c).unwrap();
    assert_ne!(node.shared_path(&disk1()), node.shared_path(&disk2));

    node.tear_down(&a).unwrap();
    assert!(node.manager.is_attached(&disk2));
    assert!(!node.manager.is_attached(&disk1()));
    assert_eq!(node.mounter.mount_count(&node.shared_path(&disk2)), 1);
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_attach_failure_leaves_consumer_untouched() {
    let node = Node::new();
    node.manager.fail_attach(Some("connection refused"));
    let a = session("consumerA", false);

    let err = node.set_up(&a).unwrap_err();

    assert!(matches!(err, VolumeError::Attach { .. }));
    assert!(err.is_retryable());
    assert!(!node.consumer_path("consumerA").exists());
    assert!(node.mounter.log().is_empty());
    assert!(node.manager.detach_calls().is_empty());
}

#[test]
fn test_bind_failure_is_not_rolled_back_and_retry_converges() {
    let node = Node::new();
    let a = session("consumerA", true);
    let shared = node.shared_path(&disk1());
    let consumer = node.consumer_path("consumerA");
    node.mounter.fail_mount_at(Some(&consumer));

    let err = node.set_up(&a).unwrap_err();
    assert!(matches!(err, VolumeError::Mount { .. }));
    assert_eq!(node.mounter.mount_count(&shared), 1);
    assert!(node.manager.detach_calls().is_empty());

    node.mounter.fail_mount_at(None);
    node.mounter.clear_log();
    node.set_up(&a).unwrap();

    assert_eq!(node.mounter.mount_count(&shared), 1);
    let log = node.mounter.log();
    assert!(
        log.iter().all(|action| !matches!(action, MountAction::Mount { target, .. } if *target == shared)),
        "retry must reuse the shared mount: {:?}",
        log
    );
    assert_eq!(node.mount_actions(), 2, "bind and remount only");
    assert_eq!(node.mounter.mount_count(&consumer), 1);
    assert_eq!(node.mounter.is_read_only(&consumer), Some(true));
}

#[test]
fn test_teardown_after_bind_failure_releases_leftover_shared_mount() {
    let node = Node::new();
    let a = session("consumerA", false);
    let shared = node.shared_path(&disk1());
    node.mounter.fail_mount_at(Some(&node.consumer_path("consumerA")));
    node.set_up(&a).unwrap_err();

    node.tear_down(&a).unwrap();

    assert_eq!(node.mounter.mount_count(&shared), 0);
    assert!(!node.manager.is_attached(&disk1()));
    assert_eq!(node.manager.detach_calls().len(), 1);
    assert!(!shared.exists());
}

#[test]
fn test_probe_failure_is_surfaced() {
    let node = Node::new();
    node.mounter.fail_probe(true);

    let err = node.set_up(&session("consumerA", false)).unwrap_err();
    assert!(matches!(err, VolumeError::Probe { .. }));
    assert!(node.manager.attach_calls().is_empty());
}

#[test]
fn test_detach_failure_after_consumer_unmount() {
    let node = Node::new();
    let a = session("consumerA", false);
    node.set_up(&a).unwrap();
    node.manager.fail_detach(Some("iscsid not running"));

    let err = node.tear_down(&a).unwrap_err();
    assert!(matches!(err, VolumeError::Detach { .. }));
    assert!(err.is_retryable());
    assert_eq!(node.mounter.mount_count(&node.consumer_path("consumerA")), 0);
    assert_eq!(node.mounter.mount_count(&node.shared_path(&disk1())), 0);
    assert!(node.shared_path(&disk1()).is_dir(), "kept for the retry");
}

#[test]
fn test_teardown_retry_after_detach_failure_detaches() {
    let node = Node::new();
    let a = session("consumerA", false);
    node.set_up(&a).unwrap();
    node.manager.fail_detach(Some("iscsid not running"));
    node.tear_down(&a).unwrap_err();

    node.manager.fail_detach(None);
    node.tear_down(&a).unwrap();

    assert!(!node.manager.is_attached(&disk1()));
    let detaches = node.manager.detach_calls();
    assert_eq!(detaches.len(), 2);
    assert_eq!(detaches[1], (disk1(), None));
    assert!(!node.shared_path(&disk1()).exists());

    // Converged: nothing left to release
    node.tear_down(&a).unwrap();
    assert_eq!(node.manager.detach_calls().len(), 2);
}

#[test]
fn test_unmounted_teardown_keeps_device_of_other_consumer() {
    let node = Node::new();
    let a = session("consumerA", false);
    let b = session("consumerB", true);
    node.set_up(&a).unwrap();

    // consumerB never got mounted; its teardown must not release A's device
    node.tear_down(&b).unwrap();

    assert!(node.manager.is_attached(&disk1()));
    assert!(node.manager.detach_calls().is_empty());
    assert_eq!(node.mounter.mount_count(&node.shared_path(&disk1())), 1);
}

// ============================================================================
// Teardown by Name and Leftovers
// ============================================================================

#[test]
fn test_teardown_by_name_recovers_device() {
    let node = Node::new();
    node.set_up(&session("consumerA", false)).unwrap();

    let by_name = VolumeSession::for_teardown("consumerA", "vol").unwrap();
    node.tear_down(&by_name).unwrap();

    let detaches = node.manager.detach_calls();
    assert_eq!(detaches.len(), 1);
    assert_eq!(detaches[0].0, disk1());
    assert!(node.mounter.mounts().is_empty());
}

#[test]
fn test_teardown_by_name_of_foreign_mount_only_unmounts() {
    let node = Node::new();
    let consumer = node.consumer_path("consumerA");
    node.mounter.add_mount(Path::new("tmpfs"), &consumer);

    let by_name = VolumeSession::for_teardown("consumerA", "vol").unwrap();
    node.tear_down(&by_name).unwrap();

    assert_eq!(node.mounter.mount_count(&consumer), 0);
    assert!(node.manager.detach_calls().is_empty());
}

#[test]
fn test_setup_reuses_stale_shared_mount() {
    let node = Node::new();
    let shared = node.shared_path(&disk1());
    node.mounter
        .add_mount(&FakeDiskManager::node_for(&disk1()), &shared);

    node.set_up(&session("consumerA", true)).unwrap();

    assert_eq!(node.mounter.mount_count(&shared), 1);
    assert_eq!(node.mount_actions(), 2, "bind and remount only");
    assert_eq!(node.mounter.is_read_only(&node.consumer_path("consumerA")), Some(true));
}

#[test]
fn test_teardown_by_name_through_symlinked_root() {
    let dir = TempDir::new().unwrap();
    let real = dir.path().join("data");
    std::fs::create_dir_all(&real).unwrap();
    let root = dir.path().join("kubelet");
    std::os::unix::fs::symlink(&real, &root).unwrap();

    let manager = FakeDiskManager::new(root.join("plugins/iscsi"));
    let mounter = FakeMounter::new();
    let locks = DeviceLocks::new();
    let env = Collaborators {
        manager: &manager,
        mounter: &mounter,
        locks: &locks,
    };

    // Recorded the way the kernel reports them, with the link resolved
    let shared = manager.canonical_shared_path(&disk1());
    std::fs::create_dir_all(&shared).unwrap();
    let resolved_shared = std::fs::canonicalize(&shared).unwrap();
    let consumer = root.join("pods/consumerA/vol");
    std::fs::create_dir_all(&consumer).unwrap();
    let node = FakeDiskManager::node_for(&disk1());
    mounter.add_mount(&node, &resolved_shared);
    mounter.add_mount(&node, &consumer);

    let by_name = VolumeSession::for_teardown("consumerA", "vol").unwrap();
    tear_down(&by_name, &consumer, env).unwrap();

    assert_eq!(manager.detach_calls().len(), 1);
    assert_eq!(manager.detach_calls()[0].0, disk1());
}

// ============================================================================
// Concurrency
// ============================================================================

struct SharedNode {
    root: PathBuf,
    manager: Arc<FakeDiskManager>,
    mounter: Arc<FakeMounter>,
    locks: Arc<DeviceLocks>,
}

impl SharedNode {
    fn env(&self) -> Collaborators<'_> {
        Collaborators {
            manager: self.manager.as_ref(),
            mounter: self.mounter.as_ref(),
            locks: self.locks.as_ref(),
        }
    }
}

#[test]
fn test_concurrent_setup_and_teardown_share_one_mount() {
    let dir = TempDir::new().unwrap();
    let node = Arc::new(SharedNode {
        root: dir.path().to_path_buf(),
        manager: Arc::new(FakeDiskManager::new(dir.path().join("plugins/iscsi"))),
        mounter: Arc::new(FakeMounter::new()),
        locks: Arc::new(DeviceLocks::new()),
    });

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let node = node.clone();
            thread::spawn(move || {
                let consumer = format!("consumer{}", i);
                let session = VolumeSession::for_setup(&consumer, "vol", disk1(), i % 2 == 0, "ext4").unwrap();
                let path = node.root.join(&consumer).join("vol");
                set_up(&session, &path, node.env()).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let shared = node.manager.canonical_shared_path(&disk1());
    assert_eq!(node.mounter.mount_count(&shared), 1);
    assert_eq!(node.mounter.mounts().len(), 9);
    for i in 0..8 {
        let path = node.root.join(format!("consumer{}", i)).join("vol");
        assert_eq!(node.mounter.is_read_only(&path), Some(i % 2 == 0));
    }

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let node = node.clone();
            thread::spawn(move || {
                let consumer = format!("consumer{}", i);
                let session = VolumeSession::for_teardown(&consumer, "vol").unwrap();
                let path = node.root.join(&consumer).join("vol");
                tear_down(&session, &path, node.env()).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(node.mounter.mounts().is_empty());
    assert_eq!(node.manager.detach_calls().len(), 1);
    assert_eq!(node.locks.active(), 0);
}
