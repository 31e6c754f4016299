pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cloudfs")]
#[command(about = "Expose a cloud file tree as local mount points")]
pub struct Args {
    /// Path to the cloudfs state directory (defaults to ~/.cloudfs)
    #[arg(long, global = true)]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: crate::Command,
}
