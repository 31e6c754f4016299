//! Integration tests for the mount service facade
//!
//! Every test runs against the in-memory cloud and the detached platform, so
//! nothing is attached to the OS.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use cloudfs_daemon::database::models::{MountFlags, MountInfo};
use cloudfs_daemon::database::types::LogLevel;
use cloudfs_daemon::fuse::{DetachedPlatform, InodeError, InodeStore};
use cloudfs_daemon::service::mount_context::store_file_name;
use cloudfs_daemon::service::{MountEvent, MountEventType, MountResult, Service, ServiceFlags};
use cloudfs_daemon::ServiceConfig;
use common::prelude::{Client, NodeHandle, NormalizedPath, TaskState};
use common::testkit::MemoryClient;

struct Harness {
    service: Service,
    client: Arc<MemoryClient>,
    events: flume::Receiver<MountEvent>,
    docs: NodeHandle,
    file: NodeHandle,
    dir: TempDir,
}

impl Harness {
    fn config(&self) -> ServiceConfig {
        ServiceConfig {
            sqlite_path: Some(self.dir.path().join("mounts.sqlite")),
            cache_dir: Some(self.dir.path().join("cache")),
            flags: ServiceFlags {
                drain_timeout: Duration::from_millis(200),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn initialize(&self) {
        let result = self
            .service
            .initialize_with(&self.config(), Arc::new(DetachedPlatform::new()))
            .await;
        assert_eq!(result, MountResult::Success);
    }

    fn events(&self) -> Vec<MountEvent> {
        self.events.try_iter().collect()
    }

    async fn disable(&self, name: &str, remember: bool) -> MountResult {
        disable(&self.service, name, remember).await
    }
}

/// Tree: /docs/file.txt
async fn setup() -> Harness {
    let client = Arc::new(MemoryClient::new());
    let docs = client.add_directory(client.root(), "docs").unwrap();
    let file = client.add_file(docs, "file.txt", b"hello").unwrap();
    client.take_events();

    let (tx, rx) = flume::unbounded();
    let harness = Harness {
        service: Service::new(client.clone(), Arc::new(tx)),
        client,
        events: rx,
        docs,
        file,
        dir: TempDir::new().unwrap(),
    };
    harness.initialize().await;
    harness
}

fn mount_info(name: &str, path: &str, handle: NodeHandle) -> MountInfo {
    let flags = MountFlags {
        persistent: true,
        ..MountFlags::new(name)
    };
    MountInfo::new(flags, handle, NormalizedPath::new(path).unwrap())
}

async fn disable(service: &Service, name: &str, remember: bool) -> MountResult {
    let (tx, rx) = flume::bounded(1);
    service.disable(
        move |result| {
            let _ = tx.send(result);
        },
        name,
        remember,
    );
    rx.recv_async().await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_add_then_get() {
    let h = setup().await;
    let info = mount_info("m1", "/mnt/m1", h.client.root());

    assert_eq!(h.service.add(info.clone()).await, MountResult::Success);
    assert_eq!(h.service.get("m1").await, Some(info.clone()));
    assert_eq!(h.service.path("m1").await, Some(info.path.clone()));
    assert_eq!(h.service.flags_of("m1").await, Some(info.flags.clone()));
    assert!(!h.service.enabled("m1"));

    let events = h.events();
    assert_eq!(
        events,
        vec![MountEvent::new("m1", MountEventType::Added, MountResult::Success)]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_add_validation() {
    let h = setup().await;
    let root = h.client.root();
    assert_eq!(
        h.service.add(mount_info("m1", "/mnt/m1", root)).await,
        MountResult::Success
    );

    let cases = [
        (mount_info("m1", "/mnt/other", root), MountResult::NameTaken),
        (mount_info("m2", "/mnt/m1", root), MountResult::LocalTaken),
        (mount_info("", "/mnt/m3", root), MountResult::NoName),
        (
            mount_info(&"x".repeat(256), "/mnt/m4", root),
            MountResult::NameTooLong,
        ),
        (mount_info("m5", "/mnt/m5", h.file), MountResult::RemoteFile),
        (
            mount_info("m6", "/mnt/m6", NodeHandle::new(0xdead_beef)),
            MountResult::RemoteUnknown,
        ),
    ];

    for (info, expected) in cases {
        assert_eq!(h.service.add(info).await, expected);
    }

    // one event per call, failures included
    let events = h.events();
    assert_eq!(events.len(), 7);
    assert!(events.iter().all(|e| e.kind == MountEventType::Added));
    assert_eq!(h.service.list(false).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_name_checked_before_path() {
    let h = setup().await;
    let root = h.client.root();
    h.service.add(mount_info("m1", "/mnt/m1", root)).await;

    // both the name and the path are taken; the name wins
    assert_eq!(
        h.service.add(mount_info("m1", "/mnt/m1", root)).await,
        MountResult::NameTaken
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_local_target_checked_on_add() {
    let client = Arc::new(MemoryClient::new());
    let service = Service::new(client.clone(), Arc::new(cloudfs_daemon::service::LogSink));
    let dir = TempDir::new().unwrap();
    let result = service
        .initialize_with(&ServiceConfig::default(), Arc::new(DetachedPlatform::checking()))
        .await;
    assert_eq!(result, MountResult::Success);

    let missing = dir.path().join("missing");
    let file = dir.path().join("file");
    std::fs::write(&file, b"").unwrap();

    let info = mount_info("missing", missing.to_str().unwrap(), client.root());
    assert_eq!(service.add(info).await, MountResult::LocalUnknown);

    let info = mount_info("file", file.to_str().unwrap(), client.root());
    assert_eq!(service.add(info).await, MountResult::LocalFile);

    let info = mount_info("ok", dir.path().to_str().unwrap(), client.root());
    assert_eq!(service.add(info).await, MountResult::Success);

    service.deinitialize().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_enable_disable_remove() {
    let h = setup().await;
    h.service
        .add(mount_info("m1", "/mnt/m1", h.client.root()))
        .await;

    assert_eq!(h.service.enable("m1", false).await, MountResult::Success);
    // enabling an enabled mount is a no-op
    assert_eq!(h.service.enable("m1", false).await, MountResult::Success);
    assert!(h.service.enabled("m1"));
    assert_eq!(h.service.list(true).await.len(), 1);

    assert_eq!(h.service.remove("m1").await, MountResult::Busy);

    assert_eq!(h.disable("m1", false).await, MountResult::Success);
    assert!(!h.service.enabled("m1"));
    // so is disabling a disabled one
    assert_eq!(h.disable("m1", false).await, MountResult::Success);

    assert_eq!(h.service.remove("m1").await, MountResult::Success);
    assert_eq!(h.service.get("m1").await, None);
    assert_eq!(h.service.remove("m1").await, MountResult::Unknown);
    assert_eq!(h.service.enable("m1", false).await, MountResult::Unknown);

    let kinds: Vec<_> = h.events().into_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            MountEventType::Added,
            MountEventType::Enabled,
            MountEventType::Enabled,
            MountEventType::Removed,
            MountEventType::Disabled,
            MountEventType::Disabled,
            MountEventType::Removed,
            MountEventType::Removed,
            MountEventType::Enabled,
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_enable_rechecks_remote() {
    let h = setup().await;
    h.service.add(mount_info("m1", "/mnt/m1", h.docs)).await;

    // the folder disappears between add and enable
    h.client.remove(h.file).await.unwrap();
    h.client.remove(h.docs).await.unwrap();

    assert_eq!(h.service.enable("m1", false).await, MountResult::RemoteUnknown);
    assert!(!h.service.enabled("m1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_context_defaults() {
    let client = Arc::new(MemoryClient::new());
    let (tx, rx) = flume::unbounded();
    let service = Service::new(client.clone(), Arc::new(tx));

    assert_eq!(disable(&service, "m1", false).await, MountResult::Unknown);
    let events: Vec<_> = rx.try_iter().collect();
    assert_eq!(
        events,
        vec![MountEvent::new("m1", MountEventType::Disabled, MountResult::Unknown)]
    );

    let info = mount_info("m1", "/mnt/m1", client.root());
    assert_eq!(service.add(info).await, MountResult::Unexpected);
    assert_eq!(service.enable("m1", true).await, MountResult::Unknown);
    assert_eq!(service.remove("m1").await, MountResult::Unknown);
    assert_eq!(
        service.flags("m1", MountFlags::new("m1")).await,
        MountResult::Unknown
    );
    assert_eq!(service.upgrade("/mnt/m1", 2).await, MountResult::Unsupported);
    assert_eq!(service.downgrade("/mnt/m1", 1).await, MountResult::Unsupported);
    assert_eq!(rx.try_iter().count(), 4);

    assert_eq!(service.get("m1").await, None);
    assert!(service.list(false).await.is_empty());
    assert!(!service.enabled("m1"));
    assert!(!service.cached("/mnt/m1"));
    assert!(service.syncable("/mnt/m1"));
    assert_eq!(
        service.describe("/mnt/m1").await.unwrap_err(),
        InodeError::NotFound
    );

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let task = service.execute(move |_| flag.store(true, Ordering::SeqCst));
    assert!(task.is_cancelled());
    assert_eq!(task.wait().await, TaskState::Cancelled);
    assert!(!ran.load(Ordering::SeqCst));

    // deinitialize without a context is harmless
    service.deinitialize().await;
    service.deinitialize().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_initialize_twice_fails() {
    let h = setup().await;
    let result = h
        .service
        .initialize_with(&h.config(), Arc::new(DetachedPlatform::new()))
        .await;
    assert_eq!(result, MountResult::Unexpected);
    assert!(h.service.is_initialized());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_describe_resolves_through_mount() {
    let h = setup().await;
    h.service
        .add(mount_info("m1", "/mnt/m1", h.client.root()))
        .await;
    h.service.enable("m1", false).await;

    let info = h.service.describe("/mnt/m1/docs/file.txt").await.unwrap();
    assert_eq!(info.handle, h.file);
    assert_eq!(info.parent, Some(h.docs));
    assert_eq!(info.name, "file.txt");
    assert_eq!(info.size, 5);
    assert!(!info.is_directory);

    let root = h.service.describe("/mnt/m1").await.unwrap();
    assert_eq!(root.handle, h.client.root());
    assert!(root.is_directory);

    assert_eq!(
        h.service.describe("/mnt/m1/docs/missing").await.unwrap_err(),
        InodeError::NotFound
    );
    assert_eq!(
        h.service.describe("/elsewhere/file.txt").await.unwrap_err(),
        InodeError::NotFound
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_syncable_excludes_enabled_mounts() {
    let h = setup().await;
    h.service
        .add(mount_info("m1", "/mnt/m1", h.client.root()))
        .await;

    // a disabled mount does not block syncing
    assert!(h.service.syncable("/mnt/m1"));

    h.service.enable("m1", false).await;
    assert!(!h.service.syncable("/mnt/m1"));
    assert!(!h.service.syncable("/mnt/m1/docs"));
    assert!(!h.service.syncable("/mnt"));
    assert!(h.service.syncable("/mnt/m10"));
    assert!(h.service.syncable("/home/user"));

    h.disable("m1", false).await;
    assert!(h.service.syncable("/mnt/m1/docs"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_updated_invalidates_cache() {
    let h = setup().await;
    h.service
        .add(mount_info("m1", "/mnt/m1", h.client.root()))
        .await;
    h.service.enable("m1", false).await;

    h.service.describe("/mnt/m1/docs/file.txt").await.unwrap();
    assert!(h.service.cached("/mnt/m1/docs/file.txt"));

    // discarded batches leave the cache alone
    h.client.modify_file(h.file, b"changed").unwrap();
    h.service.discard(true);
    h.service.updated(h.client.take_events());
    assert!(h.service.cached("/mnt/m1/docs/file.txt"));

    h.service.discard(false);
    h.client.remove(h.file).await.unwrap();
    h.service.updated(h.client.take_events());
    assert!(!h.service.cached("/mnt/m1/docs/file.txt"));
    assert!(h.service.cached("/mnt/m1/docs"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transient_mounts_vanish() {
    let h = setup().await;
    let root = h.client.root();

    h.service.add(mount_info("kept", "/mnt/kept", root)).await;
    let mut transient = mount_info("gone", "/mnt/gone", root);
    transient.flags.persistent = false;
    transient.flags.enable_at_startup = true;
    assert_eq!(h.service.add(transient).await, MountResult::Success);

    // a transient mount can never be enabled at startup
    let stored = h.service.get("gone").await.unwrap();
    assert!(!stored.flags.enable_at_startup);
    assert_eq!(h.service.list(false).await.len(), 2);

    h.service.deinitialize().await;
    h.initialize().await;

    assert!(h.service.get("kept").await.is_some());
    assert_eq!(h.service.get("gone").await, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_startup_mounts_enabled_on_initialize() {
    let h = setup().await;
    let root = h.client.root();
    h.service.add(mount_info("auto", "/mnt/auto", root)).await;
    h.service.add(mount_info("manual", "/mnt/manual", root)).await;

    h.service.enable("auto", true).await;
    h.service.enable("manual", false).await;
    assert!(h.service.get("auto").await.unwrap().flags.enable_at_startup);

    h.service.deinitialize().await;
    assert!(!h.service.is_initialized());
    h.events();

    h.initialize().await;
    assert!(h.service.enabled("auto"));
    assert!(!h.service.enabled("manual"));
    assert_eq!(
        h.events(),
        vec![MountEvent::new("auto", MountEventType::Enabled, MountResult::Success)]
    );

    // forgetting clears the startup flag
    assert_eq!(h.disable("auto", true).await, MountResult::Success);
    assert!(!h.service.get("auto").await.unwrap().flags.enable_at_startup);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_flags_rename_live_mount() {
    let h = setup().await;
    h.service
        .add(mount_info("m1", "/mnt/m1", h.client.root()))
        .await;
    h.service.add(mount_info("other", "/mnt/other", h.docs)).await;
    h.service.enable("m1", false).await;

    let mut flags = h.service.flags_of("m1").await.unwrap();
    flags.name = "other".to_string();
    assert_eq!(h.service.flags("m1", flags.clone()).await, MountResult::NameTaken);

    flags.name = "renamed".to_string();
    flags.read_only = true;
    assert_eq!(h.service.flags("m1", flags).await, MountResult::Success);

    assert_eq!(h.service.get("m1").await, None);
    assert!(!h.service.enabled("m1"));
    assert!(h.service.enabled("renamed"));
    let info = h.service.describe("/mnt/m1/docs").await.unwrap();
    assert!(info.read_only);

    let mut flags = h.service.flags_of("renamed").await.unwrap();
    flags.name = String::new();
    assert_eq!(h.service.flags("renamed", flags).await, MountResult::NoName);
    assert_eq!(
        h.service.flags("missing", MountFlags::new("x")).await,
        MountResult::Unknown
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_flags_flip_persistence() {
    let h = setup().await;
    h.service
        .add(mount_info("m1", "/mnt/m1", h.client.root()))
        .await;

    let mut flags = h.service.flags_of("m1").await.unwrap();
    flags.persistent = false;
    assert_eq!(h.service.flags("m1", flags).await, MountResult::Success);
    assert!(!h.service.get("m1").await.unwrap().flags.persistent);

    let mut flags = h.service.flags_of("m1").await.unwrap();
    flags.persistent = true;
    assert_eq!(h.service.flags("m1", flags).await, MountResult::Success);

    // persistent again, so it survives a restart
    h.service.deinitialize().await;
    h.initialize().await;
    assert!(h.service.get("m1").await.unwrap().flags.persistent);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upgrade_and_downgrade_inode_store() {
    let h = setup().await;
    let info = mount_info("m1", "/mnt/m1", h.client.root());
    h.service.add(info.clone()).await;

    // enabling creates the store at the baseline version
    h.service.enable("m1", false).await;
    assert_eq!(h.disable("m1", false).await, MountResult::Success);

    let file = h.dir.path().join("cache").join(store_file_name(&info));
    assert!(file.exists());

    assert_eq!(h.service.upgrade("/mnt/m1", 2).await, MountResult::Success);
    // already there
    assert_eq!(h.service.upgrade("/mnt/m1", 2).await, MountResult::Success);
    let store = InodeStore::open_for_migration(&file).await.unwrap();
    assert_eq!(store.version().await.unwrap(), 2);
    store.close().await;

    assert_eq!(h.service.downgrade("/mnt/m1", 1).await, MountResult::Success);
    let store = InodeStore::open_for_migration(&file).await.unwrap();
    assert_eq!(store.version().await.unwrap(), 1);
    store.close().await;

    assert_eq!(h.service.upgrade("/mnt/none", 2).await, MountResult::Unknown);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upgrade_live_mount() {
    let h = setup().await;
    h.service
        .add(mount_info("m1", "/mnt/m1", h.client.root()))
        .await;
    h.service.enable("m1", false).await;

    assert_eq!(h.service.upgrade("/mnt/m1", 99).await, MountResult::Success);
    // the bindings table cannot go away under a live mount
    assert_eq!(h.service.downgrade("/mnt/m1", 0).await, MountResult::Busy);
    assert_eq!(h.service.downgrade("/mnt/m1", 1).await, MountResult::Success);

    h.service.describe("/mnt/m1/docs/file.txt").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abort_tears_down_matching_mounts() {
    let h = setup().await;
    let root = h.client.root();
    h.service
        .add(mount_info("abort-target", "/mnt/abort-target", root))
        .await;
    h.service
        .add(mount_info("abort-bystander", "/mnt/abort-bystander", root))
        .await;
    h.service.enable("abort-target", false).await;
    h.service.enable("abort-bystander", false).await;
    h.events();

    let aborted = Service::abort(|info| info.name() == "abort-target");
    assert_eq!(aborted, 1);
    assert!(!h.service.enabled("abort-target"));
    assert!(h.service.enabled("abort-bystander"));
    assert_eq!(
        h.events(),
        vec![MountEvent::new(
            "abort-target",
            MountEventType::Aborted,
            MountResult::Aborted
        )]
    );

    // the record survives and can be enabled again
    assert_eq!(
        h.service.enable("abort-target", false).await,
        MountResult::Success
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_execute_runs_on_executor() {
    let h = setup().await;
    let ran = Arc::new(AtomicBool::new(false));

    let flag = ran.clone();
    let task = h.service.execute(move |task| {
        assert!(!task.is_cancelled());
        flag.store(true, Ordering::SeqCst);
    });

    assert_eq!(task.wait().await, TaskState::Completed);
    assert!(ran.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_service_flags() {
    let h = setup().await;
    assert_eq!(h.service.log_level(), LogLevel::Info);

    h.service.set_log_level(LogLevel::Debug);
    assert_eq!(h.service.log_level(), LogLevel::Debug);

    let flags = ServiceFlags {
        log_level: LogLevel::Warn,
        drain_timeout: Duration::from_secs(1),
    };
    h.service.set_service_flags(flags.clone());
    assert_eq!(h.service.service_flags(), flags);
    assert_eq!(h.service.log_level(), LogLevel::Warn);
}

fn store_files(h: &Harness) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(h.dir.path().join("cache")) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".db"))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_renamed_mount_keeps_its_inode_store() {
    let h = setup().await;
    let info = mount_info("m1", "/mnt/m1", h.client.root());
    h.service.add(info.clone()).await;

    assert_eq!(h.service.enable("m1", false).await, MountResult::Success);
    let inode = h.service.describe("/mnt/m1/docs/file.txt").await.unwrap().inode;
    assert_eq!(h.disable("m1", false).await, MountResult::Success);

    let renamed = MountFlags {
        persistent: true,
        ..MountFlags::new("m2")
    };
    assert_eq!(h.service.flags("m1", renamed).await, MountResult::Success);

    assert_eq!(h.service.enable("m2", false).await, MountResult::Success);
    let again = h.service.describe("/mnt/m1/docs/file.txt").await.unwrap();
    assert_eq!(again.inode, inode);
    assert_eq!(h.disable("m2", false).await, MountResult::Success);

    assert_eq!(store_files(&h), vec![store_file_name(&info)]);
    assert_eq!(h.service.remove("m2").await, MountResult::Success);
    assert!(store_files(&h).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remove_succeeds_when_a_store_file_cannot_be_deleted() {
    let h = setup().await;
    let info = mount_info("m1", "/mnt/m1", h.client.root());
    h.service.add(info.clone()).await;
    h.service.enable("m1", false).await;
    assert_eq!(h.disable("m1", false).await, MountResult::Success);

    // a directory where the write-ahead log would be cannot be unlinked
    let store = h.dir.path().join("cache").join(store_file_name(&info));
    let wal = h
        .dir
        .path()
        .join("cache")
        .join(format!("{}-wal", store_file_name(&info)));
    let _ = std::fs::remove_file(&wal);
    std::fs::create_dir(&wal).unwrap();

    assert_eq!(h.service.remove("m1").await, MountResult::Success);
    assert!(!store.exists());
    assert!(wal.is_dir());
    assert_eq!(h.service.get("m1").await, None);
}

#[derive(Default)]
struct RecordingLogControl {
    applied: parking_lot::Mutex<Vec<LogLevel>>,
}

impl cloudfs_daemon::service::LogLevelControl for RecordingLogControl {
    fn set_level(&self, level: LogLevel) {
        self.applied.lock().push(level);
    }
}

#[test]
fn test_concurrent_log_level_changes_agree_with_logger() {
    let control = Arc::new(RecordingLogControl::default());
    let (tx, _rx) = flume::unbounded::<MountEvent>();
    let service = Arc::new(
        Service::new(Arc::new(MemoryClient::new()), Arc::new(tx)).with_log_control(control.clone()),
    );

    let levels = [LogLevel::Error, LogLevel::Warn, LogLevel::Debug, LogLevel::Trace];
    let writers: Vec<_> = levels
        .into_iter()
        .map(|level| {
            let service = service.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    service.set_log_level(level);
                    service.set_service_flags(ServiceFlags {
                        log_level: level,
                        ..Default::default()
                    });
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let last_applied = *control.applied.lock().last().unwrap();
    assert_eq!(service.log_level(), last_applied);
    assert_eq!(service.service_flags().log_level, last_applied);
}
