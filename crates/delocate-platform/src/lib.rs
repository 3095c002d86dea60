//! Architectures, macOS versions, and macOS platform tags.

use thiserror::Error;

pub use crate::arch::Arch;
pub use crate::macos::MacOSVersion;
pub use crate::platform_tag::{BinaryFormat, PlatformTag};

mod arch;
mod macos;
mod platform_tag;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Unknown architecture: {0}")]
    UnknownArch(String),
    #[error("Invalid binary format: {0}")]
    InvalidBinaryFormat(String),
    #[error("Invalid platform tag: {0}")]
    InvalidPlatformTag(String),
}
