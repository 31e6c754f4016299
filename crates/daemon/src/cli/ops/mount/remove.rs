use clap::Args;

use super::{check, MountOpError, Session};

#[derive(Args, Debug, Clone)]
pub struct Remove {
    pub name: String,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Remove {
    type Error = MountOpError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let session = Session::open(ctx).await?;
        let result = session.service.remove(&self.name).await;
        session.close().await;
        check(result)?;

        Ok(format!("Removed {}", self.name))
    }
}
