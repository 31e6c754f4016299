//! OS mount primitives
//!
//! A [`Platform`] checks mount targets and attaches a [`LiveMount`] to the
//! operating system. The FUSE platform is used by the binary; the detached
//! platform never touches the OS and serves requests only through direct
//! calls, which is what the tests use.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::Handle;

use super::mount::LiveMount;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("mount target does not exist: {0}")]
    TargetMissing(PathBuf),

    #[error("mount target is not a directory: {0}")]
    TargetNotDirectory(PathBuf),

    #[error("filesystem mounts are not supported by this build")]
    Unsupported,

    #[error("failed to mount at {path}: {reason}")]
    Mount { path: PathBuf, reason: String },

    #[error("failed to unmount: {0}")]
    Unmount(String),
}

/// An OS-level attachment of a mount; dropping it detaches too
pub trait MountSession: Send {
    fn unmount(self: Box<Self>) -> Result<(), PlatformError>;
}

pub trait Platform: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Reject targets that cannot host a mount
    fn check_target(&self, path: &Path) -> Result<(), PlatformError>;

    /// Attach `mount` at its path
    ///
    /// The session serves requests for the generation `mount` carries now.
    fn mount(
        &self,
        mount: &Arc<LiveMount>,
        runtime: Handle,
    ) -> Result<Box<dyn MountSession>, PlatformError>;
}

fn check_directory(path: &Path) -> Result<(), PlatformError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(PlatformError::TargetNotDirectory(path.to_path_buf())),
        Err(_) => Err(PlatformError::TargetMissing(path.to_path_buf())),
    }
}

/// Platform that never attaches to the OS
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedPlatform {
    check_targets: bool,
}

impl DetachedPlatform {
    /// Accept any target path
    pub fn new() -> Self {
        Self {
            check_targets: false,
        }
    }

    /// Require targets to be existing directories
    pub fn checking() -> Self {
        Self {
            check_targets: true,
        }
    }
}

struct DetachedSession;

impl MountSession for DetachedSession {
    fn unmount(self: Box<Self>) -> Result<(), PlatformError> {
        Ok(())
    }
}

impl Platform for DetachedPlatform {
    fn name(&self) -> &'static str {
        "detached"
    }

    fn check_target(&self, path: &Path) -> Result<(), PlatformError> {
        if self.check_targets {
            check_directory(path)
        } else {
            Ok(())
        }
    }

    fn mount(
        &self,
        _mount: &Arc<LiveMount>,
        _runtime: Handle,
    ) -> Result<Box<dyn MountSession>, PlatformError> {
        Ok(Box::new(DetachedSession))
    }
}

#[cfg(feature = "fuse")]
pub use fuse_platform::FusePlatform;

#[cfg(feature = "fuse")]
mod fuse_platform {
    use super::*;

    use fuser::BackgroundSession;

    use crate::fuse::filesystem::MountFs;

    #[derive(Debug, Default, Clone, Copy)]
    pub struct FusePlatform;

    struct FuseSession {
        session: BackgroundSession,
        path: PathBuf,
    }

    impl MountSession for FuseSession {
        fn unmount(self: Box<Self>) -> Result<(), PlatformError> {
            let FuseSession { session, path } = *self;
            // dropping the session unmounts; the fallback covers a stuck kernel side
            drop(session);
            unmount_path(&path)
        }
    }

    impl Platform for FusePlatform {
        fn name(&self) -> &'static str {
            "fuse"
        }

        fn check_target(&self, path: &Path) -> Result<(), PlatformError> {
            check_directory(path)
        }

        fn mount(
            &self,
            mount: &Arc<LiveMount>,
            runtime: Handle,
        ) -> Result<Box<dyn MountSession>, PlatformError> {
            let info = mount.info();
            let fs = MountFs::new(Arc::downgrade(mount), mount.generation(), runtime);

            #[cfg(target_os = "linux")]
            let options = vec![
                fuser::MountOption::FSName("cloudfs".to_string()),
                fuser::MountOption::AutoUnmount,
                fuser::MountOption::AllowOther,
            ];

            #[cfg(target_os = "macos")]
            let options = vec![
                fuser::MountOption::FSName("cloudfs".to_string()),
                fuser::MountOption::AutoUnmount,
                fuser::MountOption::CUSTOM(format!("volname={}", info.name())),
                fuser::MountOption::CUSTOM("local".to_string()),
                fuser::MountOption::CUSTOM("noappledouble".to_string()),
            ];

            #[cfg(not(any(target_os = "linux", target_os = "macos")))]
            let options = vec![
                fuser::MountOption::FSName("cloudfs".to_string()),
                fuser::MountOption::AutoUnmount,
            ];

            let path = info.path.as_path().to_path_buf();
            tracing::info!("mounting {} at {}", info.name(), path.display());

            let session = fuser::spawn_mount2(fs, &path, &options).map_err(|e| {
                PlatformError::Mount {
                    path: path.clone(),
                    reason: e.to_string(),
                }
            })?;

            Ok(Box::new(FuseSession { session, path }))
        }
    }

    /// True while `path` sits on a different device than its parent
    fn is_mount_point(path: &Path) -> bool {
        use std::os::unix::fs::MetadataExt;

        let Some(parent) = path.parent() else {
            return false;
        };
        match (std::fs::metadata(path), std::fs::metadata(parent)) {
            (Ok(target), Ok(parent)) => target.dev() != parent.dev(),
            _ => false,
        }
    }

    fn unmount_path(path: &Path) -> Result<(), PlatformError> {
        use std::process::{Command, Stdio};

        if !is_mount_point(path) {
            return Ok(());
        }

        #[cfg(target_os = "macos")]
        let attempts: [&[&str]; 2] = [&["umount"], &["diskutil", "unmount", "force"]];

        // lazy unmount as a last resort
        #[cfg(not(target_os = "macos"))]
        let attempts: [&[&str]; 2] = [&["fusermount", "-u"], &["fusermount", "-uz"]];

        for command in attempts {
            let status = Command::new(command[0])
                .args(&command[1..])
                .arg(path)
                .stderr(Stdio::null())
                .status();
            match status {
                Ok(status) if status.success() => return Ok(()),
                Ok(status) => {
                    tracing::debug!("{} exited with {} for {}", command[0], status, path.display())
                }
                Err(e) => tracing::debug!("failed to run {}: {}", command[0], e),
            }
        }

        if is_mount_point(path) {
            return Err(PlatformError::Unmount(format!(
                "{} is still mounted",
                path.display()
            )));
        }
        Ok(())
    }
}

/// The platform the binary mounts through
pub fn default_platform() -> Result<Arc<dyn Platform>, PlatformError> {
    #[cfg(feature = "fuse")]
    {
        Ok(Arc::new(FusePlatform))
    }

    #[cfg(not(feature = "fuse"))]
    {
        Err(PlatformError::Unsupported)
    }
}
