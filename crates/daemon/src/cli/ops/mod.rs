pub mod init;
pub mod log_level;
pub mod mount;
pub mod run;
pub mod version;

pub use init::Init;
pub use log_level::LogLevelOp;
pub use mount::Mount;
pub use run::Run;
pub use version::Version;
