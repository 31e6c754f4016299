use std::sync::Arc;

use clap::{Args, Subcommand};

pub mod add;
pub mod list;
pub mod migrate;
pub mod remove;
pub mod set;
pub mod toggle;

use cloudfs_daemon::database::models::MountInfo;
use cloudfs_daemon::fuse::DetachedPlatform;
use cloudfs_daemon::local_client::LocalClient;
use cloudfs_daemon::service::{LogSink, MountResult, Service};
use cloudfs_daemon::state::{AppState, StateError};
use common::prelude::{ClientError, PathError};

use crate::cli::op::{Op, OpContext};

crate::command_enum! {
    (Add, add::Add),
    (Enable, toggle::Enable),
    (Disable, toggle::Disable),
    (Remove, remove::Remove),
    (List, list::List),
    (Get, list::Get),
    (Flags, list::Flags),
    (Set, set::Set),
    (Upgrade, migrate::Upgrade),
    (Downgrade, migrate::Downgrade),
}

pub type MountCommand = Command;

/// Administer the mount database
#[derive(Args, Debug, Clone)]
pub struct Mount {
    #[command(subcommand)]
    pub command: MountCommand,
}

#[async_trait::async_trait]
impl Op for Mount {
    type Error = OpError;
    type Output = OpOutput;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        self.command.execute(ctx).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MountOpError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("cloud tree error: {0}")]
    Client(#[from] ClientError),

    #[error("invalid path: {0}")]
    Path(#[from] PathError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no mount named {0}")]
    NotFound(String),

    #[error("{0}: {}", .0.description())]
    Failed(MountResult),
}

/// An administrative session over the state directory's mount database
///
/// Targets are checked against the filesystem but nothing is attached; a
/// running `cloudfs run` picks changes to startup mounts up on restart.
pub struct Session {
    pub state: AppState,
    pub client: Arc<LocalClient>,
    pub service: Service,
}

impl Session {
    pub async fn open(ctx: &OpContext) -> Result<Self, MountOpError> {
        let state = AppState::load(ctx.config_path.clone())?;
        let client = Arc::new(LocalClient::new(state.remote_root()).await?);
        let service = Service::new(client.clone(), Arc::new(LogSink));

        let mut config = state.service_config();
        config.enable_startup_mounts = false;
        config.log_dir = None;

        let result = service
            .initialize_with(&config, Arc::new(DetachedPlatform::checking()))
            .await;
        check(result)?;

        Ok(Self {
            state,
            client,
            service,
        })
    }

    pub async fn close(self) {
        self.service.deinitialize().await;
    }
}

pub fn check(result: MountResult) -> Result<(), MountOpError> {
    if result.is_success() {
        return Ok(());
    }
    Err(MountOpError::Failed(result))
}

pub fn format_info(info: &MountInfo) -> String {
    let flags = &info.flags;
    let mut tags = Vec::new();
    if flags.persistent {
        tags.push("persistent");
    } else {
        tags.push("transient");
    }
    if flags.enable_at_startup {
        tags.push("startup");
    }
    if flags.read_only {
        tags.push("read-only");
    }

    format!(
        "{} -> {} [{}] ({}, log {})",
        info.name(),
        info.path,
        info.handle,
        tags.join(", "),
        flags.log_level
    )
}
