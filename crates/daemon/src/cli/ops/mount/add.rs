use std::path::PathBuf;

use clap::Args;

use cloudfs_daemon::database::models::{MountFlags, MountInfo};
use cloudfs_daemon::database::types::LogLevel;
use common::prelude::{NodeHandle, NormalizedPath};

use super::{check, format_info, MountOpError, Session};

#[derive(Args, Debug, Clone)]
pub struct Add {
    /// Mount name
    pub name: String,

    /// Local directory the mount is exposed at
    #[arg(long)]
    pub path: PathBuf,

    /// Cloud folder, relative to the cloud tree root (or use --handle)
    #[arg(long, group = "source")]
    pub remote: Option<PathBuf>,

    /// Cloud folder handle in hex (or use --remote)
    #[arg(long, group = "source")]
    pub handle: Option<NodeHandle>,

    /// Enable the mount whenever the service starts
    #[arg(long)]
    pub startup: bool,

    #[arg(long)]
    pub read_only: bool,

    /// Per-mount log level
    #[arg(long, default_value = "info")]
    pub log_level: LogLevel,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Add {
    type Error = MountOpError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let path = std::path::absolute(&self.path).unwrap_or_else(|_| self.path.clone());
        let path = NormalizedPath::new(path)?;

        let session = Session::open(ctx).await?;
        let handle = match (self.handle, &self.remote) {
            (Some(handle), _) => Ok(handle),
            (None, Some(remote)) => session.client.resolve(remote).await,
            (None, None) => Ok(session.client.root()),
        };
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                session.close().await;
                return Err(e.into());
            }
        };

        let info = MountInfo::new(
            MountFlags {
                name: self.name.clone(),
                enable_at_startup: self.startup,
                persistent: true,
                read_only: self.read_only,
                log_level: self.log_level,
            },
            handle,
            path,
        );

        let result = session.service.add(info.clone()).await;
        session.close().await;
        check(result)?;

        Ok(format!("Added {}", format_info(&info)))
    }
}
