//! Upload limit value type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes per configured unit; limits are configured in KB/s.
pub const BYTES_PER_KB: u64 = 1024;

/// An upload limit in KB/s where `0` means unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadLimit(u64);

impl UploadLimit {
    pub const UNLIMITED: UploadLimit = UploadLimit(0);

    /// Largest limit whose byte rate fits in a `u64`
    pub const MAX: UploadLimit = UploadLimit(u64::MAX / BYTES_PER_KB);

    pub const fn from_kbps(kbps: u64) -> Self {
        Self(kbps)
    }

    pub const fn kbps(self) -> u64 {
        self.0
    }

    pub const fn is_unlimited(self) -> bool {
        self.0 == 0
    }

    /// Value handed to the actuator
    pub const fn bytes_per_second(self) -> u64 {
        self.0.saturating_mul(BYTES_PER_KB)
    }
}

impl fmt::Display for UploadLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlimited() {
            write!(f, "unlimited")
        } else {
            write!(f, "{} KB/s", self.0)
        }
    }
}
