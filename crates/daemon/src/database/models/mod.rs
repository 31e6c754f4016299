mod mount_info;

pub use mount_info::{is_unique_violation, MountFlags, MountInfo, MAX_NAME_LENGTH};
