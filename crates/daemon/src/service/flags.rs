use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::database::types::LogLevel;

/// Service-wide settings that can change while the service runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFlags {
    pub log_level: LogLevel,
    /// How long `disable` waits for in-flight requests before giving up
    #[serde(with = "duration_secs")]
    pub drain_timeout: Duration,
}

impl Default for ServiceFlags {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Changes the verbosity of the process logger
pub trait LogLevelControl: Send + Sync + 'static {
    fn set_level(&self, level: LogLevel);
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
