use std::path::PathBuf;

use clap::Args;

use cloudfs_daemon::fuse::{BASELINE_VERSION, INODE_MIGRATOR};

use super::{check, MountOpError, Session};

/// Migrate a mount's inode store to a newer schema
#[derive(Args, Debug, Clone)]
pub struct Upgrade {
    /// Local path of the mount
    pub path: PathBuf,

    /// Target version (defaults to the latest)
    #[arg(long)]
    pub version: Option<u32>,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Upgrade {
    type Error = MountOpError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let target = self.version.unwrap_or_else(|| INODE_MIGRATOR.latest());

        let session = Session::open(ctx).await?;
        let result = session.service.upgrade(&self.path, target).await;
        session.close().await;
        check(result)?;

        Ok(format!(
            "Inode store of {} is at version {}",
            self.path.display(),
            target.min(INODE_MIGRATOR.latest())
        ))
    }
}

/// Revert a mount's inode store to an older schema
#[derive(Args, Debug, Clone)]
pub struct Downgrade {
    /// Local path of the mount
    pub path: PathBuf,

    /// Target version (defaults to the baseline)
    #[arg(long)]
    pub version: Option<u32>,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Downgrade {
    type Error = MountOpError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let target = self.version.unwrap_or(BASELINE_VERSION);

        let session = Session::open(ctx).await?;
        let result = session.service.downgrade(&self.path, target).await;
        session.close().await;
        check(result)?;

        Ok(format!(
            "Inode store of {} is at version {} or below",
            self.path.display(),
            target
        ))
    }
}
