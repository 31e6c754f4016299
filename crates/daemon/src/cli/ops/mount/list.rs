use clap::Args;

use super::{format_info, MountOpError, Session};

#[derive(Args, Debug, Clone)]
pub struct List {
    /// Only mounts enabled at startup
    #[arg(long)]
    pub enabled: bool,

    #[arg(long)]
    pub json: bool,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for List {
    type Error = MountOpError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let session = Session::open(ctx).await?;
        let mounts: Vec<_> = session
            .service
            .list(false)
            .await
            .into_iter()
            .filter(|info| !self.enabled || info.flags.enable_at_startup)
            .collect();
        session.close().await;

        if self.json {
            return Ok(serde_json::to_string_pretty(&mounts)?);
        }

        if mounts.is_empty() {
            Ok("No mounts found".to_string())
        } else {
            Ok(mounts
                .iter()
                .map(format_info)
                .collect::<Vec<_>>()
                .join("\n"))
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct Get {
    pub name: String,

    #[arg(long)]
    pub json: bool,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Get {
    type Error = MountOpError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let session = Session::open(ctx).await?;
        let info = session.service.get(&self.name).await;
        session.close().await;

        let info = info.ok_or_else(|| MountOpError::NotFound(self.name.clone()))?;
        match self.json {
            true => Ok(serde_json::to_string_pretty(&info)?),
            false => Ok(format_info(&info)),
        }
    }
}

/// Print a mount's flags
#[derive(Args, Debug, Clone)]
pub struct Flags {
    pub name: String,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Flags {
    type Error = MountOpError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let session = Session::open(ctx).await?;
        let flags = session.service.flags_of(&self.name).await;
        session.close().await;

        let flags = flags.ok_or_else(|| MountOpError::NotFound(self.name.clone()))?;
        Ok(format!(
            "name: {}\nenable_at_startup: {}\npersistent: {}\nread_only: {}\nlog_level: {}",
            flags.name, flags.enable_at_startup, flags.persistent, flags.read_only, flags.log_level
        ))
    }
}
