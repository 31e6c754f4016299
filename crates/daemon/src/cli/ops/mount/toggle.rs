use clap::Args;

use super::{check, MountOpError, Session};

/// Enable a mount whenever the service starts
#[derive(Args, Debug, Clone)]
pub struct Enable {
    pub name: String,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Enable {
    type Error = MountOpError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let session = Session::open(ctx).await?;
        let result = session.service.enable(&self.name, true).await;
        session.close().await;
        check(result)?;

        Ok(format!("{} will be enabled at startup", self.name))
    }
}

/// Stop enabling a mount at startup
#[derive(Args, Debug, Clone)]
pub struct Disable {
    pub name: String,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Disable {
    type Error = MountOpError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let session = Session::open(ctx).await?;

        let (tx, rx) = flume::bounded(1);
        session.service.disable(
            move |result| {
                let _ = tx.send(result);
            },
            &self.name,
            true,
        );
        let result = rx
            .recv_async()
            .await
            .unwrap_or(cloudfs_daemon::service::MountResult::Aborted);

        session.close().await;
        check(result)?;

        Ok(format!("{} will no longer be enabled at startup", self.name))
    }
}
