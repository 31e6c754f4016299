//! Integration tests for live mounts
//!
//! These drive the mount context and its per-mount request path directly,
//! without requiring actual FUSE mounting (which requires privileges).

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use cloudfs_daemon::database::models::{MountFlags, MountInfo};
use cloudfs_daemon::fuse::{
    DetachedPlatform, InodeError, InodeTable, LiveMount, MountSession, Platform, PlatformError,
};
use cloudfs_daemon::service::{
    LogSink, MountContext, MountResult, ServiceContext, ServiceFlags,
};
use cloudfs_daemon::ServiceConfig;
use common::prelude::{Client, NormalizedPath, Task};
use common::testkit::MemoryClient;

const ROOT: u64 = InodeTable::ROOT_INODE;

struct Setup {
    context: MountContext,
    client: Arc<MemoryClient>,
    _dir: TempDir,
}

/// Tree: /docs/a.txt, mounted as `m1` at /mnt/m1
async fn setup() -> Setup {
    setup_on(Arc::new(DetachedPlatform::new())).await
}

async fn setup_on(platform: Arc<dyn Platform>) -> Setup {
    let dir = TempDir::new().unwrap();
    let client = Arc::new(MemoryClient::new());
    let docs = client.add_directory(client.root(), "docs").unwrap();
    client.add_file(docs, "a.txt", b"alpha").unwrap();
    client.take_events();

    let config = ServiceConfig {
        sqlite_path: Some(dir.path().join("mounts.sqlite")),
        cache_dir: Some(dir.path().join("cache")),
        flags: ServiceFlags {
            drain_timeout: Duration::from_millis(100),
            ..Default::default()
        },
        ..Default::default()
    };

    let context = MountContext::new(
        &config,
        client.clone(),
        platform,
        Arc::new(LogSink),
    )
    .await
    .unwrap();

    let flags = MountFlags {
        persistent: true,
        ..MountFlags::new("m1")
    };
    let info = MountInfo::new(
        flags,
        client.root(),
        NormalizedPath::new("/mnt/m1").unwrap(),
    );
    assert_eq!(context.add(info).await, MountResult::Success);
    assert_eq!(context.enable("m1", false).await, MountResult::Success);

    Setup {
        context,
        client,
        _dir: dir,
    }
}

/// Mounts that the OS refuses to detach
struct StuckPlatform;

struct StuckSession;

impl MountSession for StuckSession {
    fn unmount(self: Box<Self>) -> Result<(), PlatformError> {
        Err(PlatformError::Unmount("target is busy".to_string()))
    }
}

impl Platform for StuckPlatform {
    fn name(&self) -> &'static str {
        "stuck"
    }

    fn check_target(&self, _path: &Path) -> Result<(), PlatformError> {
        Ok(())
    }

    fn mount(
        &self,
        _mount: &Arc<LiveMount>,
        _runtime: tokio::runtime::Handle,
    ) -> Result<Box<dyn MountSession>, PlatformError> {
        Ok(Box::new(StuckSession))
    }
}

async fn disable(context: &MountContext, name: &str) -> MountResult {
    let (tx, rx) = flume::bounded(1);
    context.disable(
        name,
        false,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    rx.recv_async().await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disable_is_busy_while_requests_run() {
    let s = setup().await;
    let live = s.context.mount("m1").unwrap();

    let request = live.request().unwrap();
    assert_eq!(disable(&s.context, "m1").await, MountResult::Busy);
    assert!(s.context.enabled("m1"));

    // the mount keeps serving after the failed drain
    request.lookup(ROOT, "docs").await.unwrap();
    drop(request);
    live.request().unwrap();

    assert_eq!(disable(&s.context, "m1").await, MountResult::Success);
    assert!(!s.context.enabled("m1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retired_generation_rejects_requests() {
    let s = setup().await;
    let live = s.context.mount("m1").unwrap();
    let generation = live.generation();

    assert_eq!(disable(&s.context, "m1").await, MountResult::Success);
    assert!(live.is_retired());
    assert_eq!(live.enter(generation).err(), Some(InodeError::Unmounted));

    // a new generation is a new mount object
    assert_eq!(s.context.enable("m1", false).await, MountResult::Success);
    let remounted = s.context.mount("m1").unwrap();
    assert!(remounted.generation() > generation);
    assert_eq!(remounted.enter(generation).err(), Some(InodeError::Unmounted));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_only_applies_to_new_requests() {
    let s = setup().await;
    let live = s.context.mount("m1").unwrap();

    let before = live.request().unwrap();

    let mut flags = live.flags();
    flags.read_only = true;
    assert_eq!(s.context.set_flags("m1", flags).await, MountResult::Success);

    // the earlier request keeps the flags it started with
    assert!(!before.read_only());
    before.mkdir(ROOT, "made-before").await.unwrap();
    drop(before);

    let after = live.request().unwrap();
    assert!(after.read_only());
    assert_eq!(
        after.mkdir(ROOT, "made-after").await.unwrap_err(),
        InodeError::ReadOnly
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_writes_reach_the_cloud() {
    let s = setup().await;
    let live = s.context.mount("m1").unwrap();
    let request = live.request().unwrap();

    let (docs, _) = request.lookup(ROOT, "docs").await.unwrap();
    let (_, info, fh) = request.create(docs, "b.txt").await.unwrap();
    assert_eq!(request.write(fh, 0, b"bravo").await.unwrap(), 5);
    request.release(fh).await.unwrap();

    assert_eq!(s.client.read(info.handle).await.unwrap(), b"bravo");

    let names: Vec<_> = request
        .readdir(docs)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert!(names.contains(&"a.txt".to_string()));
    assert!(names.contains(&"b.txt".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_complete_listing_answers_misses_after_current() {
    let s = setup().await;
    let live = s.context.mount("m1").unwrap();
    let request = live.request().unwrap();

    let (docs, _) = request.lookup(ROOT, "docs").await.unwrap();
    request.readdir(docs).await.unwrap();

    // before current() a miss must still ask the cloud
    let fetches = s.client.fetch_count();
    assert_eq!(
        request.lookup(docs, "missing").await.unwrap_err(),
        InodeError::NotFound
    );
    assert!(s.client.fetch_count() > fetches);

    s.context.current();
    let fetches = s.client.fetch_count();
    assert_eq!(
        request.lookup(docs, "missing-too").await.unwrap_err(),
        InodeError::NotFound
    );
    assert_eq!(s.client.fetch_count(), fetches);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inode_numbers_survive_remount() {
    let s = setup().await;

    let inode = {
        let live = s.context.mount("m1").unwrap();
        let request = live.request().unwrap();
        let (docs, _) = request.lookup(ROOT, "docs").await.unwrap();
        let (inode, _) = request.lookup(docs, "a.txt").await.unwrap();
        inode
    };

    assert_eq!(disable(&s.context, "m1").await, MountResult::Success);
    assert_eq!(s.context.enable("m1", false).await, MountResult::Success);

    let live = s.context.mount("m1").unwrap();
    let request = live.request().unwrap();
    let (docs, _) = request.lookup(ROOT, "docs").await.unwrap();
    let (again, _) = request.lookup(docs, "a.txt").await.unwrap();
    assert_eq!(again, inode);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cloud_changes_reach_live_mount() {
    let s = setup().await;
    let live = s.context.mount("m1").unwrap();

    let info = s
        .context
        .describe(&NormalizedPath::new("/mnt/m1/docs/a.txt").unwrap())
        .await
        .unwrap();
    assert_eq!(info.size, 5);

    let handle = info.handle;
    s.client.modify_file(handle, b"alpha, longer").unwrap();
    s.context.updated(s.client.take_events().into_iter().collect());

    let request = live.request().unwrap();
    let (docs, _) = request.lookup(ROOT, "docs").await.unwrap();
    let (inode, attrs) = request.lookup(docs, "a.txt").await.unwrap();
    assert_eq!(attrs.size, 13);

    let fh = request.open(inode, false, false).await.unwrap();
    let data = request.read(inode, fh, 0, 64).await.unwrap();
    assert_eq!(data, b"alpha, longer");
    request.release(fh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_tears_everything_down() {
    let s = setup().await;
    let live = s.context.mount("m1").unwrap();

    s.context.shutdown().await;
    assert!(live.is_retired());
    assert!(!s.context.enabled("m1"));
    assert!(s.context.execute(Box::new(|_: &Task| {})).is_cancelled());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_unmount_is_reported() {
    let s = setup_on(Arc::new(StuckPlatform)).await;
    let live = s.context.mount("m1").unwrap();

    assert_eq!(disable(&s.context, "m1").await, MountResult::Unexpected);
    // the mount no longer serves requests either way
    assert!(live.is_retired());
    assert!(!s.context.enabled("m1"));

    assert_eq!(s.context.enable("m1", false).await, MountResult::Success);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_slow_cloud_does_not_hold_up_other_admin_calls() {
    let s = setup().await;
    s.client.set_latency(Some(Duration::from_millis(500)));

    let slow = MountInfo::new(
        MountFlags::new("m2"),
        s.client.root(),
        NormalizedPath::new("/mnt/m2").unwrap(),
    );
    let mut flags = s.context.mount("m1").unwrap().flags();
    flags.read_only = true;

    let (added, elapsed) = tokio::join!(s.context.add(slow), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = Instant::now();
        assert_eq!(s.context.set_flags("m1", flags).await, MountResult::Success);
        started.elapsed()
    });

    assert_eq!(added, MountResult::Success);
    assert!(elapsed < Duration::from_millis(300), "flags waited {elapsed:?}");
    assert!(s.context.get("m2").await.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_adds_of_one_name_admit_one() {
    let s = setup().await;
    s.client.set_latency(Some(Duration::from_millis(50)));

    let first = MountInfo::new(
        MountFlags::new("m2"),
        s.client.root(),
        NormalizedPath::new("/mnt/m2").unwrap(),
    );
    let second = MountInfo::new(
        MountFlags::new("m2"),
        s.client.root(),
        NormalizedPath::new("/mnt/m2-again").unwrap(),
    );

    let (a, b) = tokio::join!(s.context.add(first), s.context.add(second));
    let mut results = vec![a, b];
    results.sort_by_key(|r| *r == MountResult::Success);
    assert_eq!(results, vec![MountResult::NameTaken, MountResult::Success]);
}
