//! macOS version parsing and representation.

use std::fmt;

/// macOS version requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacOSVersion {
    pub major: u16,
    pub minor: u16,
}

impl MacOSVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Parse a macOS version string like "10.9" or "11.0" or "14.0".
    ///
    /// Underscores are accepted as separators, as used in platform tags (`10_9`). Any patch
    /// component is ignored.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split(['.', '_']);
        let major: u16 = parts.next()?.parse().ok()?;
        let minor: u16 = match parts.next() {
            Some(part) => part.parse().ok()?,
            None => 0,
        };
        Some(Self::new(major, minor))
    }

    /// Parse from a packed version (used in Mach-O `LC_BUILD_VERSION` and `LC_VERSION_MIN_MACOSX`).
    ///
    /// Format: `xxxx.yy.zz` where `x` is major, `y` is minor, `z` is patch (ignored).
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_packed(packed: u32) -> Self {
        Self {
            major: ((packed >> 16) & 0xFFFF) as u16,
            minor: ((packed >> 8) & 0xFF) as u16,
        }
    }

    /// The version as it appears in a platform tag.
    ///
    /// From macOS 11 onwards, only the major version is meaningful, so the minor version is
    /// dropped (`14.2` is tagged as `macosx_14_0`).
    #[must_use]
    pub const fn tag_version(self) -> Self {
        if self.major >= 11 {
            Self::new(self.major, 0)
        } else {
            self
        }
    }
}

impl fmt::Display for MacOSVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
