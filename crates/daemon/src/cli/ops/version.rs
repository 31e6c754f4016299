use std::convert::Infallible;

use clap::Args;

use cloudfs_daemon::database::MOUNT_MIGRATOR;
use cloudfs_daemon::fuse::INODE_MIGRATOR;
use common::build_info;

#[derive(Args, Debug, Clone)]
pub struct Version {
    /// Also print the schema versions this build understands
    #[arg(long)]
    pub schemas: bool,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Version {
    type Error = Infallible;
    type Output = String;

    async fn execute(&self, _ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let mut output = build_info!().to_string();
        if self.schemas {
            output.push_str(&format!(
                "\nmount database: v{}\ninode store: v{}",
                MOUNT_MIGRATOR.latest(),
                INODE_MIGRATOR.latest()
            ));
        }
        Ok(output)
    }
}
