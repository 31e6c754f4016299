use std::fmt;

/// Version information about the running binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: &'static str,
    pub build_profile: &'static str,
    pub build_features: &'static [&'static str],
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cloudfs {} ({})", self.version, self.build_profile)?;
        if !self.build_features.is_empty() {
            write!(f, " [{}]", self.build_features.join(", "))?;
        }
        Ok(())
    }
}

/// Build information for the crate this is expanded in.
#[macro_export]
macro_rules! build_info {
    () => {
        $crate::version::BuildInfo {
            version: env!("CARGO_PKG_VERSION"),
            build_profile: if cfg!(debug_assertions) {
                "debug"
            } else {
                "release"
            },
            build_features: if cfg!(feature = "fuse") {
                &["fuse"]
            } else {
                &[]
            },
        }
    };
}

/// Build information for the common crate itself.
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        build_profile: if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
        build_features: &[],
    }
}
