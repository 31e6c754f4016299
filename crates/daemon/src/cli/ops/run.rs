use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use cloudfs_daemon::database::types::LogLevel;
use cloudfs_daemon::local_client::LocalClient;
use cloudfs_daemon::process::ProcessError;
use cloudfs_daemon::spawn_service;
use cloudfs_daemon::state::{AppState, StateError};
use common::prelude::ClientError;

#[derive(Args, Debug, Clone)]
pub struct Run {
    /// Override the configured log level
    #[arg(long)]
    pub log_level: Option<LogLevel>,

    /// Directory for log files (defaults to <state dir>/logs)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Log to stdout only
    #[arg(long, conflicts_with = "log_dir")]
    pub no_log_file: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("state error: {0}")]
    StateError(#[from] StateError),

    #[error("cloud tree unavailable: {0}")]
    Client(#[from] ClientError),

    #[error("service failed: {0}")]
    Failed(#[from] ProcessError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Run {
    type Error = RunError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;
        let client = LocalClient::new(state.remote_root()).await?;

        let mut config = state.service_config();
        if let Some(level) = self.log_level {
            config.flags.log_level = level;
        }
        if self.no_log_file {
            config.log_dir = None;
        } else if let Some(log_dir) = &self.log_dir {
            config.log_dir = Some(log_dir.clone());
        }

        spawn_service(&config, Arc::new(client)).await?;
        Ok("mount service stopped".to_string())
    }
}
