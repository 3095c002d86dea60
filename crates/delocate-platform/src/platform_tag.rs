use std::fmt::{self, Formatter};
use std::str::FromStr;

use crate::{Arch, Error, MacOSVersion};

/// The binary format suffix of a macOS platform tag, e.g., `x86_64` in `macosx_10_9_x86_64`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum BinaryFormat {
    Arm64,
    Fat,
    Fat3,
    Fat32,
    Fat64,
    I386,
    Intel,
    Ppc,
    Ppc64,
    Universal,
    Universal2,
    X86_64,
}

impl fmt::Display for BinaryFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for BinaryFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arm64" => Ok(Self::Arm64),
            "fat" => Ok(Self::Fat),
            "fat3" => Ok(Self::Fat3),
            "fat32" => Ok(Self::Fat32),
            "fat64" => Ok(Self::Fat64),
            "i386" => Ok(Self::I386),
            "intel" => Ok(Self::Intel),
            "ppc" => Ok(Self::Ppc),
            "ppc64" => Ok(Self::Ppc64),
            "universal" => Ok(Self::Universal),
            "universal2" => Ok(Self::Universal2),
            "x86_64" => Ok(Self::X86_64),
            _ => Err(Error::InvalidBinaryFormat(s.to_string())),
        }
    }
}

impl BinaryFormat {
    /// Return the architectures a binary with this format contains.
    pub fn archs(&self) -> &'static [Arch] {
        match self {
            Self::Arm64 => &[Arch::Arm64],
            Self::Fat | Self::Fat32 => &[Arch::I386, Arch::PowerPC],
            Self::Fat3 => &[Arch::X86_64, Arch::I386, Arch::PowerPC],
            Self::Fat64 => &[Arch::X86_64, Arch::PowerPC64],
            Self::I386 => &[Arch::I386],
            Self::Intel => &[Arch::X86_64, Arch::I386],
            Self::Ppc => &[Arch::PowerPC],
            Self::Ppc64 => &[Arch::PowerPC64],
            Self::Universal => &[Arch::X86_64, Arch::I386, Arch::PowerPC64, Arch::PowerPC],
            Self::Universal2 => &[Arch::X86_64, Arch::Arm64],
            Self::X86_64 => &[Arch::X86_64],
        }
    }

    /// Return the canonical name of the binary format.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Arm64 => "arm64",
            Self::Fat => "fat",
            Self::Fat3 => "fat3",
            Self::Fat32 => "fat32",
            Self::Fat64 => "fat64",
            Self::I386 => "i386",
            Self::Intel => "intel",
            Self::Ppc => "ppc",
            Self::Ppc64 => "ppc64",
            Self::Universal => "universal",
            Self::Universal2 => "universal2",
            Self::X86_64 => "x86_64",
        }
    }
}

/// A wheel platform tag.
///
/// Only macOS tags are interpreted; every other tag is carried through verbatim.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PlatformTag {
    /// Ex) `any`
    Any,
    /// Ex) `macosx_11_0_arm64`
    Macos {
        major: u16,
        minor: u16,
        binary_format: BinaryFormat,
    },
    /// Ex) `manylinux_2_17_x86_64`
    Other(String),
}

impl PlatformTag {
    /// Return the macOS version of a macOS platform tag.
    pub fn macos_version(&self) -> Option<MacOSVersion> {
        match self {
            Self::Macos { major, minor, .. } => Some(MacOSVersion::new(*major, *minor)),
            _ => None,
        }
    }

    /// Return a copy of this tag targeting the given macOS version.
    ///
    /// Non-macOS tags are returned unchanged.
    #[must_use]
    pub fn with_macos_version(&self, version: MacOSVersion) -> Self {
        match self {
            Self::Macos { binary_format, .. } => {
                let version = version.tag_version();
                Self::Macos {
                    major: version.major,
                    minor: version.minor,
                    binary_format: *binary_format,
                }
            }
            other => other.clone(),
        }
    }
}

impl FromStr for PlatformTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.contains(['-', '.']) {
            return Err(Error::InvalidPlatformTag(s.to_string()));
        }
        if s == "any" {
            return Ok(Self::Any);
        }
        if let Some(rest) = s.strip_prefix("macosx_") {
            let mut parts = rest.splitn(3, '_');
            let major = parts.next().and_then(|part| part.parse::<u16>().ok());
            let minor = parts.next().and_then(|part| part.parse::<u16>().ok());
            let binary_format = parts
                .next()
                .and_then(|part| BinaryFormat::from_str(part).ok());
            if let (Some(major), Some(minor), Some(binary_format)) = (major, minor, binary_format) {
                return Ok(Self::Macos {
                    major,
                    minor,
                    binary_format,
                });
            }
        }
        Ok(Self::Other(s.to_string()))
    }
}

impl fmt::Display for PlatformTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Macos {
                major,
                minor,
                binary_format,
            } => write!(f, "macosx_{major}_{minor}_{binary_format}"),
            Self::Other(tag) => write!(f, "{tag}"),
        }
    }
}
