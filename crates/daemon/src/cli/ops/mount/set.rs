use clap::Args;

use cloudfs_daemon::database::types::LogLevel;

use super::{check, format_info, MountOpError, Session};

/// Change a mount's flags
#[derive(Args, Debug, Clone)]
pub struct Set {
    pub name: String,

    /// Rename the mount
    #[arg(long)]
    pub rename: Option<String>,

    #[arg(long)]
    pub read_only: Option<bool>,

    #[arg(long)]
    pub startup: Option<bool>,

    #[arg(long)]
    pub log_level: Option<LogLevel>,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Set {
    type Error = MountOpError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let session = Session::open(ctx).await?;

        let Some(mut flags) = session.service.flags_of(&self.name).await else {
            session.close().await;
            return Err(MountOpError::NotFound(self.name.clone()));
        };

        if let Some(name) = &self.rename {
            flags.name = name.clone();
        }
        if let Some(read_only) = self.read_only {
            flags.read_only = read_only;
        }
        if let Some(startup) = self.startup {
            flags.enable_at_startup = startup;
        }
        if let Some(level) = self.log_level {
            flags.log_level = level;
        }

        let name = flags.name.clone();
        let result = session.service.flags(&self.name, flags).await;
        let info = session.service.get(&name).await;
        session.close().await;
        check(result)?;

        let info = info.ok_or(MountOpError::NotFound(name))?;
        Ok(format!("Updated {}", format_info(&info)))
    }
}
