// Mount service
pub mod database;
pub mod fuse;
pub mod service;

// Daemon plumbing (logging, signals, configuration)
pub mod local_client;
pub mod process;
pub mod service_config;
pub mod state;

// Re-exports for consumers
pub use process::{spawn_service, start_service, ShutdownHandle};
pub use service::{MountEvent, MountEventType, MountResult, Service};
pub use service_config::Config as ServiceConfig;
pub use state::{AppConfig, AppState, StateError};
