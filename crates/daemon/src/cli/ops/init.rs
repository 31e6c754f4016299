use std::path::PathBuf;

use clap::Args;

use cloudfs_daemon::database::types::LogLevel;
use cloudfs_daemon::state::{AppConfig, AppState, StateError};

#[derive(Args, Debug, Clone)]
pub struct Init {
    /// Directory served as the cloud tree (defaults to <state dir>/remote)
    #[arg(long)]
    pub remote_root: Option<PathBuf>,

    /// Service log level
    #[arg(long, default_value = "info")]
    pub log_level: LogLevel,

    /// Seconds to wait for in-flight requests when disabling a mount
    #[arg(long, default_value_t = 10)]
    pub drain_timeout: u64,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = StateError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let config = AppConfig {
            remote_root: self.remote_root.clone(),
            log_level: self.log_level,
            drain_timeout_secs: self.drain_timeout,
            ..Default::default()
        };

        let state = AppState::init(ctx.config_path.clone(), Some(config))?;

        Ok(format!(
            "Initialized cloudfs state at {}\n  cloud tree: {}\n  config: {}",
            state.state_dir.display(),
            state.remote_root().display(),
            state.config_path.display()
        ))
    }
}
