use clap::Args;

use cloudfs_daemon::database::types::LogLevel;
use cloudfs_daemon::state::{AppState, StateError};

/// Show or change the service log level (applies on the next `run`)
#[derive(Args, Debug, Clone)]
pub struct LogLevelOp {
    pub level: Option<LogLevel>,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for LogLevelOp {
    type Error = StateError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let mut state = AppState::load(ctx.config_path.clone())?;

        match self.level {
            Some(level) => {
                let previous = state.config.log_level;
                state.config.log_level = level;
                state.save()?;
                Ok(format!("log level: {} -> {}", previous, level))
            }
            None => Ok(format!("log level: {}", state.config.log_level)),
        }
    }
}
