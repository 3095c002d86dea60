use std::fmt;
use std::str::FromStr;

use crate::{BinaryFormat, Error};

/// CPU architecture of a Mach-O slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arch {
    X86_64,
    Arm64,
    I386,
    Arm64_32,
    PowerPC,
    PowerPC64,
    Unknown(u32),
}

impl Arch {
    /// Map a Mach-O `cputype` to an [`Arch`].
    pub fn from_cputype(cputype: u32) -> Self {
        use goblin::mach::cputype::{
            CPU_TYPE_ARM64, CPU_TYPE_ARM64_32, CPU_TYPE_I386, CPU_TYPE_POWERPC, CPU_TYPE_POWERPC64,
            CPU_TYPE_X86_64,
        };
        match cputype {
            CPU_TYPE_X86_64 => Self::X86_64,
            CPU_TYPE_ARM64 => Self::Arm64,
            CPU_TYPE_I386 => Self::I386,
            CPU_TYPE_ARM64_32 => Self::Arm64_32,
            CPU_TYPE_POWERPC => Self::PowerPC,
            CPU_TYPE_POWERPC64 => Self::PowerPC64,
            other => Self::Unknown(other),
        }
    }

    /// Returns the architecture name as used in wheel platform tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Arm64 => "arm64",
            Self::I386 => "i386",
            Self::Arm64_32 => "arm64_32",
            Self::PowerPC => "ppc",
            Self::PowerPC64 => "ppc64",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Parse a set of required architectures.
    ///
    /// Accepts a multi-architecture binary format name (e.g., `universal2` or `intel`) or a
    /// comma-separated list of architecture names (e.g., `x86_64,arm64`).
    pub fn parse_list(s: &str) -> Result<Vec<Self>, Error> {
        if let Ok(format) = BinaryFormat::from_str(s) {
            return Ok(format.archs().to_vec());
        }
        let mut archs = Vec::new();
        for name in s.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            let arch = Self::from_str(name)?;
            if !archs.contains(&arch) {
                archs.push(arch);
            }
        }
        if archs.is_empty() {
            return Err(Error::UnknownArch(s.to_string()));
        }
        Ok(archs)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "x86_64" => Ok(Self::X86_64),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            "i386" | "i686" | "x86" => Ok(Self::I386),
            "arm64_32" => Ok(Self::Arm64_32),
            "ppc" | "powerpc" => Ok(Self::PowerPC),
            "ppc64" | "powerpc64" => Ok(Self::PowerPC64),
            _ => Err(Error::UnknownArch(s.to_string())),
        }
    }
}
