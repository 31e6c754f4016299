mod dhandle;
mod log_level;

pub use dhandle::DHandle;
pub use log_level::LogLevel;
